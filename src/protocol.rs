//! The wire protocol spoken between the process server and its clients.
//!
//! Every exchange starts with a single ASCII command byte. Commands and
//! replies that carry data follow up with one frame: a big-endian `u32`
//! byte count, then that many bytes of JSON. Death notifications
//! ([`NOTIFY_DEATH`]) are pushed by the server at any time once a
//! connection has completed its handshake, so client-side readers must be
//! prepared to absorb them wherever a reply byte is expected.

use anyhow::{Context, Result};
use futures::io::{AsyncRead, AsyncReadExt};
use nix::sys::wait::WaitStatus;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::io::{self, Read, Write};
use std::path::PathBuf;
use thiserror::Error;

use crate::process::SpawnOptions;

// Command bytes, client to server.
pub const CMD_GET_INFO: u8 = b'I';
pub const CMD_LOAD_PROJECT: u8 = b'L';
pub const CMD_PRELOAD_TYPEKIT: u8 = b'T';
pub const CMD_CREATE_LOG_DIR: u8 = b'C';
pub const CMD_MOVE_LOG_DIR: u8 = b'M';
pub const CMD_START: u8 = b'S';
pub const CMD_END: u8 = b'E';

// Reply bytes, server to client.
pub const REPLY_OK: u8 = b'Y';
pub const REPLY_FAIL: u8 = b'N';
pub const REPLY_PID: u8 = b'P';

/// Unsolicited server-to-client notification, followed by a
/// [`DeathAnnouncement`] frame.
pub const NOTIFY_DEATH: u8 = b'D';

/// Upper bound on a single frame. Typekit registries are the largest
/// payloads that travel over the wire and stay well under this.
pub const MAX_FRAME_LEN: u32 = 16 * 1024 * 1024;

/// A violation of the wire protocol.
///
/// These are logic errors, not transient conditions: the offending
/// connection gets torn down and nothing is retried.
#[derive(Error, Debug)]
pub enum ProtocolViolation {
    #[error("unrecognized command byte {byte:#04x}")]
    UnknownCommand { byte: u8 },

    #[error("unexpected reply byte {byte:#04x}")]
    UnexpectedReply { byte: u8 },

    #[error("frame length {len} exceeds the {max} byte limit")]
    OversizedFrame { len: u64, max: u32 },

    #[error("malformed message payload")]
    MalformedPayload {
        #[source]
        source: serde_json::Error,
    },
}

/// Everything a client learns about the server during the handshake, sent
/// as the reply to [`CMD_GET_INFO`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InfoBundle {
    /// Project name to opaque description text.
    pub projects: HashMap<String, String>,
    /// Deployment name to the name of the project defining it.
    pub deployments: HashMap<String, String>,
    /// Typekit name to its registry data.
    pub typekits: HashMap<String, TypekitRegistry>,
    /// The server's own pid. Clients fold this into their host ID so that
    /// a restarted server is recognizably a different peer.
    pub server_pid: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TypekitRegistry {
    pub registry: String,
    pub typelist: String,
}

/// Payload of [`CMD_START`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StartRequest {
    /// Name the running process will be registered under.
    pub name: String,
    /// Catalog deployment to launch.
    pub deployment: String,
    /// Task name substitutions, applied before any task gets registered.
    #[serde(default)]
    pub name_mappings: HashMap<String, String>,
    #[serde(default)]
    pub options: SpawnOptions,
}

/// Payload of [`CMD_CREATE_LOG_DIR`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreateLogDirRequest {
    pub log_dir: PathBuf,
    pub time_tag: String,
}

/// Payload of [`CMD_MOVE_LOG_DIR`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MoveLogDirRequest {
    pub log_dir: PathBuf,
    pub results_dir: PathBuf,
}

/// Payload following a [`NOTIFY_DEATH`] byte.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeathAnnouncement {
    pub name: String,
    pub status: ExitStatus,
}

/// How a supervised process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ExitStatus {
    /// Exited on its own, with a status code.
    Exited { code: i32 },
    /// Terminated by a signal.
    Signaled { signal: i32 },
}

impl ExitStatus {
    /// Translates a `waitpid` result. Returns `None` for state changes
    /// that are not terminations (stops, continues, traps).
    pub fn from_wait(status: &WaitStatus) -> Option<ExitStatus> {
        match status {
            WaitStatus::Exited(_, code) => Some(ExitStatus::Exited { code: *code }),
            WaitStatus::Signaled(_, signal, _) => Some(ExitStatus::Signaled {
                signal: *signal as i32,
            }),
            _ => None,
        }
    }
}

impl fmt::Display for ExitStatus {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ExitStatus::Exited { code } => write!(f, "exit status {}", code),
            ExitStatus::Signaled { signal } => write!(f, "signal {}", signal),
        }
    }
}

/// A fully parsed client command, as consumed by the server loop.
#[derive(Debug, Clone, PartialEq)]
pub enum Request {
    GetInfo,
    LoadProject { name: String },
    PreloadTypekit { name: String },
    CreateLogDir(CreateLogDirRequest),
    MoveLogDir(MoveLogDirRequest),
    Start(StartRequest),
    End { name: String },
}

fn checked_len(payload: &[u8]) -> Result<u32> {
    if payload.len() > MAX_FRAME_LEN as usize {
        return Err(ProtocolViolation::OversizedFrame {
            len: payload.len() as u64,
            max: MAX_FRAME_LEN,
        }
        .into());
    }
    Ok(payload.len() as u32)
}

fn decode<T: DeserializeOwned>(payload: &[u8]) -> Result<T> {
    Ok(serde_json::from_slice(payload)
        .map_err(|source| ProtocolViolation::MalformedPayload { source })?)
}

/// Writes `payload` as one length-prefixed frame.
pub fn write_frame<W: Write>(w: &mut W, payload: &[u8]) -> Result<()> {
    let len = checked_len(payload)?;
    w.write_all(&len.to_be_bytes())
        .context("writing frame length")?;
    w.write_all(payload).context("writing frame payload")?;
    Ok(())
}

/// Reads one length-prefixed frame off `r`, rejecting oversized ones
/// before allocating for them.
pub fn read_frame<R: Read>(r: &mut R) -> Result<Vec<u8>> {
    let mut len_buf = [0u8; 4];
    r.read_exact(&mut len_buf).context("reading frame length")?;
    let len = u32::from_be_bytes(len_buf);
    if len > MAX_FRAME_LEN {
        return Err(ProtocolViolation::OversizedFrame {
            len: len as u64,
            max: MAX_FRAME_LEN,
        }
        .into());
    }
    let mut payload = vec![0u8; len as usize];
    r.read_exact(&mut payload).context("reading frame payload")?;
    Ok(payload)
}

/// Serializes `message` into one frame on `w`.
pub fn write_message<W: Write, T: Serialize>(w: &mut W, message: &T) -> Result<()> {
    let payload = serde_json::to_vec(message).context("encoding message")?;
    write_frame(w, &payload)
}

/// Reads one frame off `r` and deserializes it.
pub fn read_message<R: Read, T: DeserializeOwned>(r: &mut R) -> Result<T> {
    let payload = read_frame(r)?;
    decode(&payload)
}

/// Encodes a command byte plus one message frame into a buffer that can be
/// written out in a single call.
pub fn encode_command<T: Serialize>(command: u8, message: &T) -> Result<Vec<u8>> {
    let mut buf = vec![command];
    write_message(&mut buf, message)?;
    Ok(buf)
}

async fn read_frame_async<R: AsyncRead + Unpin>(r: &mut R) -> Result<Vec<u8>> {
    let mut len_buf = [0u8; 4];
    r.read_exact(&mut len_buf)
        .await
        .context("reading frame length")?;
    let len = u32::from_be_bytes(len_buf);
    if len > MAX_FRAME_LEN {
        return Err(ProtocolViolation::OversizedFrame {
            len: len as u64,
            max: MAX_FRAME_LEN,
        }
        .into());
    }
    let mut payload = vec![0u8; len as usize];
    r.read_exact(&mut payload)
        .await
        .context("reading frame payload")?;
    Ok(payload)
}

/// Reads the next client command off `r`.
///
/// Returns `Ok(None)` on a clean end-of-stream, i.e. the client closed the
/// connection between commands. Everything else that cuts a command short,
/// including EOF in the middle of a frame, is an error.
pub async fn read_request<R: AsyncRead + Unpin>(r: &mut R) -> Result<Option<Request>> {
    let mut command = [0u8; 1];
    match r.read_exact(&mut command).await {
        Ok(()) => {}
        Err(ref e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e).context("reading command byte"),
    }
    let request = match command[0] {
        CMD_GET_INFO => Request::GetInfo,
        CMD_LOAD_PROJECT => {
            let name = decode(&read_frame_async(r).await?)?;
            Request::LoadProject { name }
        }
        CMD_PRELOAD_TYPEKIT => {
            let name = decode(&read_frame_async(r).await?)?;
            Request::PreloadTypekit { name }
        }
        CMD_CREATE_LOG_DIR => Request::CreateLogDir(decode(&read_frame_async(r).await?)?),
        CMD_MOVE_LOG_DIR => Request::MoveLogDir(decode(&read_frame_async(r).await?)?),
        CMD_START => Request::Start(decode(&read_frame_async(r).await?)?),
        CMD_END => {
            let name = decode(&read_frame_async(r).await?)?;
            Request::End { name }
        }
        byte => return Err(ProtocolViolation::UnknownCommand { byte }.into()),
    };
    Ok(Some(request))
}
