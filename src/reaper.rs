use anyhow::{Context, Result};
use nix::errno::Errno;
use nix::sys::wait::{waitpid, WaitPidFlag};
use nix::unistd::Pid;
use slog_scope::debug;
use smol::Async;
use std::{io::Read, os::unix::net::UnixStream};

use crate::protocol::ExitStatus;

/// Registers a SIGCHLD handler that wakes up [`Zombies::reap`] through a
/// socket pair. The handler itself does nothing but write a byte; all
/// `waitpid` calls happen on the thread that awaits `reap`.
pub fn setup_child_exit_handler() -> Result<Zombies> {
    let (read, write) =
        UnixStream::pair().context("Could not initialize signal handler socket pair")?;
    signal_hook::pipe::register(signal_hook::SIGCHLD, write)
        .context("registering sigchld handler")?;
    Ok(Zombies {
        socket: Async::new(read)?,
    })
}

pub struct Zombies {
    socket: Async<UnixStream>,
}

impl Zombies {
    /// Waits for the next child to terminate and reaps it, returning its
    /// pid along with how it ended.
    pub async fn reap(&mut self) -> Result<(Pid, ExitStatus)> {
        use nix::sys::wait::WaitStatus::*;
        loop {
            match waitpid(None, Some(WaitPidFlag::WNOHANG)) {
                Ok(Exited(pid, code)) => return Ok((pid, ExitStatus::Exited { code })),
                Ok(Signaled(pid, signal, _)) => {
                    return Ok((
                        pid,
                        ExitStatus::Signaled {
                            signal: signal as i32,
                        },
                    ))
                }

                // No child has terminated yet, or there are no children
                // at all.
                Ok(StillAlive) | Err(nix::Error::Sys(Errno::ECHILD)) => {}

                Err(e) => return Err(e).context("waiting for terminated children"),

                // Stops and continues are none of our business.
                other => {
                    debug!("ignoring unrelated process state change"; "change" => ?other);
                }
            }

            // Sleep until the next SIGCHLD pokes the pipe. One byte can
            // stand for any number of pending zombies, which is why the
            // loop drains with WNOHANG before coming back here.
            let mut buf = vec![0u8; 256];
            self.socket
                .read_with_mut(|io| io.read(&mut buf))
                .await
                .context("reading from the zombie notification pipe")?;
        }
    }
}
