//! The synchronous client side of the process server protocol.
//!
//! A [`ProcessClient`] holds one TCP connection. Connecting doubles as
//! the catalog download: the client sends `I` and waits (bounded) for the
//! server's info bundle. From then on, every reply read off the socket
//! may find death notifications interleaved; those get absorbed into a
//! queue that [`ProcessClient::wait_termination`] drains.

use anyhow::{Context, Result};
use nix::errno::Errno;
use nix::fcntl::{fcntl, FcntlArg, FdFlag};
use nix::poll::{poll, PollFd, PollFlags};
use slog_scope::{debug, info, warn};
use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::io::{Read, Write};
use std::net::{Shutdown, TcpStream};
use std::os::unix::io::AsRawFd;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use crate::catalog::{DeploymentModel, ProjectDescription};
use crate::name_service::{NameService, NotFound};
use crate::process::SpawnOptions;
use crate::protocol::{
    self, DeathAnnouncement, ExitStatus, InfoBundle, ProtocolViolation, TypekitRegistry,
};
use crate::remote_process::RemoteProcess;

/// How long the connection handshake may take before the server is
/// declared unresponsive.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(PartialEq, Error, Debug)]
#[error("failed to start a process server session on {host}:{port}")]
pub struct StartupFailed {
    pub host: String,
    pub port: u16,
}

#[derive(PartialEq, Error, Debug)]
#[error("{name} is already started on {host_id}")]
pub struct AlreadyStarted {
    pub name: String,
    pub host_id: String,
}

#[derive(PartialEq, Error, Debug)]
#[error("the server failed to start deployment {deployment} as {name}")]
pub struct StartFailed {
    pub name: String,
    pub deployment: String,
}

#[derive(PartialEq, Error, Debug)]
#[error("the server failed to stop {name}")]
pub struct StopFailed {
    pub name: String,
}

#[derive(PartialEq, Error, Debug)]
#[error("the server could not load {what} {name}")]
pub struct LoadFailed {
    pub what: &'static str,
    pub name: String,
}

/// One session with a process server.
pub struct ProcessClient {
    socket: TcpStream,
    host: String,
    port: u16,
    server_pid: u32,
    host_id: String,
    available_projects: HashMap<String, String>,
    available_deployments: HashMap<String, String>,
    available_typekits: HashMap<String, TypekitRegistry>,
    loaded_projects: HashSet<String>,
    processes: HashMap<String, RemoteProcess>,
    death_queue: VecDeque<DeathAnnouncement>,
    names: Arc<dyn NameService>,
}

impl ProcessClient {
    /// Connects to the process server at `host:port` and performs the
    /// handshake, downloading the server's catalog.
    ///
    /// The server gets [`CONNECT_TIMEOUT`] to answer; a silent peer
    /// produces a [`StartupFailed`] error instead of a hang.
    pub fn connect(host: &str, port: u16, names: Arc<dyn NameService>) -> Result<ProcessClient> {
        let mut socket = TcpStream::connect((host, port))
            .with_context(|| format!("cannot contact process server at {}:{}", host, port))?;
        socket.set_nodelay(true).context("configuring the socket")?;
        set_cloexec(&socket)?;
        socket
            .write_all(&[protocol::CMD_GET_INFO])
            .context("requesting system information")?;
        if !poll_readable(&socket, Some(CONNECT_TIMEOUT))? {
            return Err(StartupFailed {
                host: host.to_string(),
                port,
            }
            .into());
        }
        let info: InfoBundle = protocol::read_message(&mut socket).map_err(|e| {
            e.context(StartupFailed {
                host: host.to_string(),
                port,
            })
        })?;
        let host_id = format!("{}:{}:{}", host, port, info.server_pid);
        info!("connected to process server"; "host_id" => &host_id);
        Ok(ProcessClient {
            socket,
            host: host.to_string(),
            port,
            server_pid: info.server_pid,
            host_id,
            available_projects: info.projects,
            available_deployments: info.deployments,
            available_typekits: info.typekits,
            loaded_projects: HashSet::new(),
            processes: HashMap::new(),
            death_queue: VecDeque::new(),
            names,
        })
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn server_pid(&self) -> u32 {
        self.server_pid
    }

    /// Identity of this server session: `host:port:pid`. Two connections
    /// get the same ID only while the same server process is listening.
    pub fn host_id(&self) -> &str {
        &self.host_id
    }

    /// Project name to opaque description text, as reported at connect
    /// time.
    pub fn available_projects(&self) -> &HashMap<String, String> {
        &self.available_projects
    }

    /// Deployment name to defining project, as reported at connect time.
    pub fn available_deployments(&self) -> &HashMap<String, String> {
        &self.available_deployments
    }

    pub fn available_typekits(&self) -> &HashMap<String, TypekitRegistry> {
        &self.available_typekits
    }

    /// The processes started through this client and not yet known dead.
    pub fn processes(&self) -> &HashMap<String, RemoteProcess> {
        &self.processes
    }

    pub fn process(&self, name: &str) -> Option<&RemoteProcess> {
        self.processes.get(name)
    }

    /// Loads project `name` on the server. Only projects the server
    /// reported at connect time are loadable; loading one twice is a
    /// no-op.
    pub fn load_project(&mut self, name: &str) -> Result<()> {
        if !self.available_projects.contains_key(name) {
            return Err(NotFound::Project(name.to_string()).into());
        }
        if self.loaded_projects.contains(name) {
            return Ok(());
        }
        self.socket
            .write_all(&[protocol::CMD_LOAD_PROJECT])
            .context("requesting a project load")?;
        protocol::write_message(&mut self.socket, &name)?;
        if !self.wait_for_ack()? {
            return Err(LoadFailed {
                what: "project",
                name: name.to_string(),
            }
            .into());
        }
        self.loaded_projects.insert(name.to_string());
        Ok(())
    }

    /// Preloads typekit `name` on the server.
    pub fn preload_typekit(&mut self, name: &str) -> Result<()> {
        if !self.available_typekits.contains_key(name) {
            return Err(NotFound::Typekit(name.to_string()).into());
        }
        self.socket
            .write_all(&[protocol::CMD_PRELOAD_TYPEKIT])
            .context("requesting a typekit preload")?;
        protocol::write_message(&mut self.socket, &name)?;
        if !self.wait_for_ack()? {
            return Err(LoadFailed {
                what: "typekit",
                name: name.to_string(),
            }
            .into());
        }
        Ok(())
    }

    /// Resolves a deployment to its model, loading the project that
    /// defines it first if need be.
    pub fn load_deployment(&mut self, name: &str) -> Result<DeploymentModel> {
        let project = self
            .available_deployments
            .get(name)
            .cloned()
            .ok_or_else(|| NotFound::Deployment(name.to_string()))?;
        self.load_project(&project)?;
        let description = self
            .available_projects
            .get(&project)
            .cloned()
            .ok_or_else(|| NotFound::Project(project.clone()))?;
        let parsed = ProjectDescription::parse(&description)
            .with_context(|| format!("parsing the description of project {:?}", project))?;
        parsed.deployment(name).cloned().with_context(|| {
            format!(
                "project {:?} does not describe deployment {:?}",
                project, name
            )
        })
    }

    /// Starts deployment `deployment_name` on the server, registered as
    /// `name`.
    ///
    /// `name_mappings` renames tasks; a `prefix` option generates one
    /// mapping per task first, with explicit mappings winning. A name
    /// already started through this client is rejected before anything
    /// goes over the wire.
    pub fn start(
        &mut self,
        name: &str,
        deployment_name: &str,
        name_mappings: HashMap<String, String>,
        options: SpawnOptions,
    ) -> Result<RemoteProcess> {
        if self.processes.contains_key(name) {
            return Err(AlreadyStarted {
                name: name.to_string(),
                host_id: self.host_id.clone(),
            }
            .into());
        }
        let model = self.load_deployment(deployment_name)?;
        let (mut mappings, options) = options.resolve_prefix(&model);
        mappings.extend(name_mappings);
        debug!("starting deployment"; "name" => name, "deployment" => deployment_name);
        let request = protocol::StartRequest {
            name: name.to_string(),
            deployment: deployment_name.to_string(),
            name_mappings: mappings.clone(),
            options,
        };
        self.socket
            .write_all(&[protocol::CMD_START])
            .context("requesting a start")?;
        protocol::write_message(&mut self.socket, &request)?;
        match self.read_reply_byte()? {
            protocol::REPLY_PID => {
                let pid: u32 = protocol::read_message(&mut self.socket)
                    .context("reading the new process's pid")?;
                let process = RemoteProcess::new(
                    name,
                    deployment_name,
                    model,
                    mappings,
                    pid,
                    &self.host_id,
                    self.names.clone(),
                );
                self.processes.insert(name.to_string(), process.clone());
                info!("started remote process"; "name" => name, "pid" => pid);
                Ok(process)
            }
            protocol::REPLY_FAIL => Err(StartFailed {
                name: name.to_string(),
                deployment: deployment_name.to_string(),
            }
            .into()),
            byte => Err(ProtocolViolation::UnexpectedReply { byte }.into()),
        }
    }

    /// Asks the server to stop process `name`.
    ///
    /// The server acks having initiated the stop; the death itself still
    /// arrives asynchronously through [`ProcessClient::wait_termination`].
    pub fn stop(&mut self, name: &str) -> Result<()> {
        self.socket
            .write_all(&[protocol::CMD_END])
            .context("requesting a stop")?;
        protocol::write_message(&mut self.socket, &name)?;
        if !self.wait_for_ack()? {
            return Err(StopFailed {
                name: name.to_string(),
            }
            .into());
        }
        Ok(())
    }

    /// Collects death announcements.
    ///
    /// With an empty queue, waits up to `timeout` for news (`None` blocks
    /// indefinitely, zero just polls), then drains everything that
    /// arrived in one go. Returns the processes started through this
    /// client that are now dead, paired with how they ended; each death
    /// is returned exactly once. A closed connection reads as "no news".
    pub fn wait_termination(
        &mut self,
        timeout: Option<Duration>,
    ) -> Result<Vec<(RemoteProcess, ExitStatus)>> {
        if self.death_queue.is_empty() && poll_readable(&self.socket, timeout)? {
            loop {
                let mut buf = [0u8; 1];
                match self.socket.read(&mut buf) {
                    Ok(0) => break,
                    Ok(_) => {
                        if buf[0] != protocol::NOTIFY_DEATH {
                            return Err(ProtocolViolation::UnexpectedReply { byte: buf[0] }.into());
                        }
                        self.queue_death_announcement()?;
                    }
                    Err(e) => return Err(e).context("reading from the process server"),
                }
                if !poll_readable(&self.socket, Some(Duration::from_millis(0)))? {
                    break;
                }
            }
        }
        let mut dead = Vec::new();
        while let Some(announcement) = self.death_queue.pop_front() {
            match self.processes.remove(&announcement.name) {
                Some(process) => {
                    process.mark_dead();
                    dead.push((process, announcement.status));
                }
                None => {
                    warn!("server announced the death of a process this client does not own";
                          "name" => &announcement.name);
                }
            }
        }
        Ok(dead)
    }

    /// Makes the server create `log_dir`, tagged with `time_tag`.
    /// Fire-and-forget: the server does not ack.
    pub fn create_log_dir<P: AsRef<Path>>(&mut self, log_dir: P, time_tag: &str) -> Result<()> {
        let request = protocol::CreateLogDirRequest {
            log_dir: log_dir.as_ref().to_owned(),
            time_tag: time_tag.to_string(),
        };
        self.socket
            .write_all(&[protocol::CMD_CREATE_LOG_DIR])
            .context("requesting a log directory")?;
        protocol::write_message(&mut self.socket, &request)
    }

    /// Makes the server move `log_dir` into `results_dir`.
    /// Fire-and-forget.
    pub fn save_log_dir<P: AsRef<Path>, Q: AsRef<Path>>(
        &mut self,
        log_dir: P,
        results_dir: Q,
    ) -> Result<()> {
        let request = protocol::MoveLogDirRequest {
            log_dir: log_dir.as_ref().to_owned(),
            results_dir: results_dir.as_ref().to_owned(),
        };
        self.socket
            .write_all(&[protocol::CMD_MOVE_LOG_DIR])
            .context("requesting a log directory move")?;
        protocol::write_message(&mut self.socket, &request)
    }

    /// Closes the connection. Processes started through this client keep
    /// running; the server owns them.
    pub fn disconnect(self) {
        let _ = self.socket.shutdown(Shutdown::Both);
    }

    /// Reads the next reply byte, absorbing death notifications that
    /// arrive interleaved with the reply.
    fn read_reply_byte(&mut self) -> Result<u8> {
        loop {
            let mut buf = [0u8; 1];
            self.socket
                .read_exact(&mut buf)
                .context("reading a reply from the process server")?;
            if buf[0] == protocol::NOTIFY_DEATH {
                self.queue_death_announcement()?;
            } else {
                return Ok(buf[0]);
            }
        }
    }

    fn queue_death_announcement(&mut self) -> Result<()> {
        let announcement: DeathAnnouncement =
            protocol::read_message(&mut self.socket).context("reading a death announcement")?;
        debug!("queued death announcement"; "name" => &announcement.name);
        self.death_queue.push_back(announcement);
        Ok(())
    }

    fn wait_for_ack(&mut self) -> Result<bool> {
        match self.read_reply_byte()? {
            protocol::REPLY_OK => Ok(true),
            protocol::REPLY_FAIL => Ok(false),
            byte => Err(ProtocolViolation::UnexpectedReply { byte }.into()),
        }
    }
}

impl fmt::Debug for ProcessClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessClient")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("server_pid", &self.server_pid)
            .finish()
    }
}

fn set_cloexec(socket: &TcpStream) -> Result<()> {
    fcntl(socket.as_raw_fd(), FcntlArg::F_SETFD(FdFlag::FD_CLOEXEC))
        .context("setting close-on-exec on the socket")?;
    Ok(())
}

/// Waits until `socket` has data (or EOF) to read. `None` blocks
/// indefinitely, a zero timeout is a pure poll.
fn poll_readable(socket: &TcpStream, timeout: Option<Duration>) -> Result<bool> {
    let timeout_ms = match timeout {
        None => -1,
        Some(t) => t.as_millis().min(i32::max_value() as u128) as i32,
    };
    let mut fds = [PollFd::new(socket.as_raw_fd(), PollFlags::POLLIN)];
    loop {
        match poll(&mut fds, timeout_ms) {
            Ok(n) => return Ok(n > 0),
            Err(nix::Error::Sys(Errno::EINTR)) => {}
            Err(e) => return Err(e).context("polling the process server socket"),
        }
    }
}
