//! The process server: accepts client connections, starts and stops
//! deployment processes on request, and broadcasts their deaths.
//!
//! Everything runs on one executor thread. Per-connection reader tasks do
//! nothing but parse commands and forward them over a channel; a single
//! `select!` loop owns all state, writes every reply, and sends every
//! broadcast. No two frames can interleave on a socket because only that
//! loop ever writes to one.

use anyhow::{Context, Result};
use async_channel::{Receiver, Sender};
use futures::io::AsyncWriteExt;
use futures::select;
use futures::FutureExt;
use nix::fcntl::{fcntl, FcntlArg, FdFlag};
use nix::unistd::Pid;
use slog_scope::{crit, debug, info, warn};
use smol::{Async, Task};
use std::collections::HashMap;
use std::io::Read;
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream};
use std::os::unix::io::AsRawFd;
use std::os::unix::net::UnixStream;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use crate::catalog::Catalog;
use crate::log_dir;
use crate::name_service::NameService;
use crate::process::{Process, SpawnOptions};
use crate::protocol::{self, DeathAnnouncement, ExitStatus, Request, StartRequest};
use crate::reaper::{self, Zombies};
use crate::registry::ProcessRegistry;

/// What a connection's reader task reports back to the server loop.
enum Event {
    Request(Uuid, Request),
    /// Clean EOF between commands.
    Closed(Uuid),
    /// Unparseable input, or a disconnect in the middle of a command.
    Failed(Uuid, anyhow::Error),
}

struct Connection {
    peer: SocketAddr,
    writer: async_dup::Arc<Async<TcpStream>>,
    /// Duplicate handle used to shut the socket down. The reader task
    /// keeps its own clone of `writer` alive, so merely dropping ours
    /// would not close anything.
    control: TcpStream,
    /// Whether the `I` handshake completed. Death announcements only go
    /// to connections that have their info bundle, so a broadcast can
    /// never land in the middle of the handshake reply.
    ready: bool,
}

pub struct ProcessServer {
    listener: Async<TcpListener>,
    state: State,
}

impl ProcessServer {
    /// Binds the listening socket. Serving starts with
    /// [`ProcessServer::exec`].
    pub fn bind(
        addr: &SocketAddr,
        catalog: Catalog,
        names: Arc<dyn NameService>,
        spawn_defaults: SpawnOptions,
        shutdown_grace: Duration,
    ) -> Result<ProcessServer> {
        let listener =
            Async::<TcpListener>::bind(addr).with_context(|| format!("binding to {}", addr))?;
        fcntl(
            listener.get_ref().as_raw_fd(),
            FcntlArg::F_SETFD(FdFlag::FD_CLOEXEC),
        )
        .context("setting close-on-exec on the listening socket")?;
        Ok(ProcessServer {
            listener,
            state: State {
                catalog,
                registry: ProcessRegistry::new(),
                names,
                spawn_defaults,
                shutdown_grace,
                connections: HashMap::new(),
            },
        })
    }

    /// The bound address, with the OS-assigned port filled in.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.get_ref().local_addr()?)
    }

    /// Serves until interrupted (SIGINT/SIGTERM) or failing. On the way
    /// out, supervised processes get stopped and every connection closed.
    pub async fn exec(self) -> Result<()> {
        // Deployments may double-fork. Adopting their orphans keeps the
        // death announcements complete.
        #[cfg(target_os = "linux")]
        {
            if let Err(e) = prctl::set_child_subreaper(true) {
                warn!("cannot become child subreaper"; "errno" => e);
            }
        }
        let mut zombies =
            reaper::setup_child_exit_handler().context("Could not set up child exit handler")?;
        let mut interrupts =
            setup_interrupt_handler().context("Could not set up interrupt handler")?;
        let (events_tx, events_rx) = async_channel::unbounded();

        let ProcessServer { listener, mut state } = self;
        let addr = listener
            .get_ref()
            .local_addr()
            .context("reading the bound address")?;
        info!("process server listening"; "addr" => %addr);
        let result = serve(
            &listener,
            &mut state,
            &mut zombies,
            &mut interrupts,
            &events_tx,
            &events_rx,
        )
        .await;
        if let Err(e) = &result {
            crit!("process server failed"; "error" => ?e);
        }
        state.shut_down();
        result
    }
}

// every fallible path in this loop either bubbles up (taking the server
// down for a clean shutdown) or gets logged and skipped; none may panic:
#[forbid(
    clippy::option_unwrap_used,
    clippy::result_unwrap_used,
    clippy::option_expect_used,
    clippy::result_expect_used
)]
async fn serve(
    listener: &Async<TcpListener>,
    state: &mut State,
    zombies: &mut Zombies,
    interrupts: &mut Interrupts,
    events_tx: &Sender<Event>,
    events_rx: &Receiver<Event>,
) -> Result<()> {
    loop {
        select! {
            accepted = listener.accept().fuse() => {
                let (stream, peer) = accepted.context("accepting a connection")?;
                state.accept_connection(stream, peer, events_tx.clone());
            }
            reaped = zombies.reap().fuse() => {
                match reaped {
                    Ok((pid, status)) => state.announce_death(pid, status).await,
                    Err(e) => info!("failed to reap"; "error" => ?e),
                }
            }
            _ = interrupts.next().fuse() => {
                info!("interrupt received, shutting down");
                return Ok(());
            }
            event = events_rx.recv().fuse() => {
                match event.context("connection event channel closed")? {
                    Event::Request(id, request) => state.handle_request(id, request).await,
                    Event::Closed(id) => state.drop_connection(&id, "client disconnected"),
                    Event::Failed(id, error) => {
                        warn!("dropping misbehaving client"; "client" => %id, "error" => ?error);
                        state.drop_connection(&id, "protocol error");
                    }
                }
            }
        }
    }
}

/// Reads commands off one connection and forwards them to the server
/// loop. Runs as its own task; the first failure or EOF ends it, and the
/// loop drops the connection in response.
async fn read_requests(
    id: Uuid,
    mut stream: async_dup::Arc<Async<TcpStream>>,
    events: Sender<Event>,
) {
    loop {
        let event = match protocol::read_request(&mut stream).await {
            Ok(Some(request)) => Event::Request(id, request),
            Ok(None) => Event::Closed(id),
            Err(error) => Event::Failed(id, error),
        };
        let ended = match &event {
            Event::Request(..) => false,
            _ => true,
        };
        if events.send(event).await.is_err() || ended {
            return;
        }
    }
}

struct State {
    catalog: Catalog,
    registry: ProcessRegistry,
    names: Arc<dyn NameService>,
    spawn_defaults: SpawnOptions,
    shutdown_grace: Duration,
    connections: HashMap<Uuid, Connection>,
}

impl State {
    fn accept_connection(
        &mut self,
        stream: Async<TcpStream>,
        peer: SocketAddr,
        events: Sender<Event>,
    ) {
        if let Err(e) = configure_stream(&stream) {
            warn!("cannot configure accepted connection"; "peer" => %peer, "error" => ?e);
            return;
        }
        let control = match stream.get_ref().try_clone() {
            Ok(control) => control,
            Err(e) => {
                warn!("cannot duplicate accepted connection"; "peer" => %peer, "error" => ?e);
                return;
            }
        };
        let id = Uuid::new_v4();
        let writer = async_dup::Arc::new(stream);
        Task::spawn(read_requests(id, writer.clone(), events)).detach();
        debug!("new connection"; "client" => %id, "peer" => %peer);
        self.connections.insert(
            id,
            Connection {
                peer,
                writer,
                control,
                ready: false,
            },
        );
    }

    async fn handle_request(&mut self, id: Uuid, request: Request) {
        // The client may be gone by the time its request gets handled.
        if !self.connections.contains_key(&id) {
            return;
        }
        match request {
            Request::GetInfo => {
                let info = self.catalog.info(std::process::id());
                let mut frame = Vec::new();
                match protocol::write_message(&mut frame, &info) {
                    Ok(()) => {
                        self.send_bytes(&id, &frame).await;
                        if let Some(connection) = self.connections.get_mut(&id) {
                            connection.ready = true;
                        }
                        debug!("served system information"; "client" => %id);
                    }
                    Err(e) => warn!("cannot encode the info bundle"; "error" => ?e),
                }
            }
            Request::LoadProject { name } => {
                let loaded = self.catalog.load_project(&name);
                if let Err(e) = &loaded {
                    debug!("cannot load project"; "client" => %id, "error" => %e);
                }
                self.send_ack(&id, loaded.is_ok()).await;
            }
            Request::PreloadTypekit { name } => {
                let loaded = self.catalog.preload_typekit(&name);
                if let Err(e) = &loaded {
                    debug!("cannot preload typekit"; "client" => %id, "error" => %e);
                }
                self.send_ack(&id, loaded.is_ok()).await;
            }
            Request::CreateLogDir(request) => {
                // Fire-and-forget by protocol; failures only make the log.
                if let Err(e) = log_dir::create_log_dir(&request.log_dir, &request.time_tag) {
                    warn!("cannot create log directory"; "dir" => ?&request.log_dir, "error" => ?e);
                }
            }
            Request::MoveLogDir(request) => {
                if let Err(e) = log_dir::move_log_dir(&request.log_dir, &request.results_dir) {
                    warn!("cannot move log directory"; "dir" => ?&request.log_dir, "error" => ?e);
                }
            }
            Request::Start(request) => self.start_process(&id, request).await,
            Request::End { name } => self.stop_process(&id, &name).await,
        }
    }

    async fn start_process(&mut self, id: &Uuid, request: StartRequest) {
        if self.registry.contains(&request.name) {
            debug!("refusing to start a second process under one name"; "name" => &request.name);
            return self.send_ack(id, false).await;
        }
        let deployment = match self.catalog.deployment(&request.deployment) {
            Ok(deployment) => deployment.clone(),
            Err(e) => {
                debug!("cannot start deployment"; "client" => %id, "error" => %e);
                return self.send_ack(id, false).await;
            }
        };
        let options = request.options.or_defaults(&self.spawn_defaults);
        let name = &request.name;
        let mut process = Process::new(
            name,
            deployment,
            request.name_mappings,
            self.names.clone(),
        );
        let pid = match process.spawn(&options) {
            Ok(pid) => pid,
            Err(e) => {
                debug!("failed to start deployment"; "name" => name, "error" => ?e);
                return self.send_ack(id, false).await;
            }
        };
        self.registry.insert(process);
        match protocol::encode_command(protocol::REPLY_PID, &(pid.as_raw() as u32)) {
            Ok(frame) => self.send_bytes(id, &frame).await,
            Err(e) => warn!("cannot encode start reply"; "error" => ?e),
        }
    }

    async fn stop_process(&mut self, id: &Uuid, name: &str) {
        match self.registry.get_mut(name) {
            Some(process) => {
                process.kill(false, None);
                self.send_ack(id, true).await;
            }
            None => {
                warn!("asked to stop an unknown process"; "client" => %id, "name" => name);
                self.send_ack(id, false).await;
            }
        }
    }

    /// Marks the process dead, frees up its name, and tells every
    /// handshake-completed client. The registry update strictly precedes
    /// the announcements: a client that reacts to one by starting a
    /// process under the same name cannot get refused by a stale entry.
    async fn announce_death(&mut self, pid: Pid, status: ExitStatus) {
        let name = match self.registry.name_of_pid(pid) {
            Some(name) => name,
            None => {
                debug!("reaped a process nobody asked about"; "pid" => pid.as_raw(), "status" => %status);
                return;
            }
        };
        if let Some(mut process) = self.registry.remove(&name) {
            process.mark_dead(Some(status));
        }
        debug!("announcing death"; "name" => &name, "status" => %status);
        let announcement = DeathAnnouncement {
            name: name.clone(),
            status,
        };
        let frame = match protocol::encode_command(protocol::NOTIFY_DEATH, &announcement) {
            Ok(frame) => frame,
            Err(e) => {
                warn!("cannot encode death announcement"; "error" => ?e);
                return;
            }
        };
        let ready: Vec<Uuid> = self
            .connections
            .iter()
            .filter(|(_, c)| c.ready)
            .map(|(id, _)| *id)
            .collect();
        for id in ready {
            self.send_bytes(&id, &frame).await;
        }
    }

    async fn send_ack(&mut self, id: &Uuid, ok: bool) {
        let byte = if ok {
            protocol::REPLY_OK
        } else {
            protocol::REPLY_FAIL
        };
        self.send_bytes(id, &[byte]).await;
    }

    /// Writes to one client, dropping the connection when the write
    /// fails.
    async fn send_bytes(&mut self, id: &Uuid, bytes: &[u8]) {
        let result = match self.connections.get_mut(id) {
            Some(connection) => connection.writer.write_all(bytes).await,
            None => return,
        };
        if let Err(e) = result {
            debug!("write failed"; "client" => %id, "error" => ?e);
            self.drop_connection(id, "write failure");
        }
    }

    fn drop_connection(&mut self, id: &Uuid, reason: &str) {
        if let Some(connection) = self.connections.remove(id) {
            debug!("closing connection"; "client" => %id, "peer" => %connection.peer, "reason" => reason);
            let _ = connection.control.shutdown(Shutdown::Both);
        }
    }

    fn shut_down(&mut self) {
        warn!("stopping process server");
        let ids: Vec<Uuid> = self.connections.keys().copied().collect();
        for id in ids {
            self.drop_connection(&id, "server shutdown");
        }
        self.registry.kill_all(self.shutdown_grace);
    }
}

fn configure_stream(stream: &Async<TcpStream>) -> Result<()> {
    stream
        .get_ref()
        .set_nodelay(true)
        .context("setting TCP_NODELAY")?;
    fcntl(
        stream.get_ref().as_raw_fd(),
        FcntlArg::F_SETFD(FdFlag::FD_CLOEXEC),
    )
    .context("setting close-on-exec")?;
    Ok(())
}

/// SIGINT and SIGTERM, delivered over a socket pair the same way the
/// reaper gets its SIGCHLDs.
struct Interrupts {
    socket: Async<UnixStream>,
}

fn setup_interrupt_handler() -> Result<Interrupts> {
    let (read, write) =
        UnixStream::pair().context("Could not initialize signal handler socket pair")?;
    signal_hook::pipe::register(
        signal_hook::SIGINT,
        write.try_clone().context("duplicating the signal pipe")?,
    )
    .context("registering sigint handler")?;
    signal_hook::pipe::register(signal_hook::SIGTERM, write)
        .context("registering sigterm handler")?;
    Ok(Interrupts {
        socket: Async::new(read)?,
    })
}

impl Interrupts {
    async fn next(&mut self) -> Result<()> {
        let mut buf = [0u8; 16];
        self.socket
            .read_with_mut(|io| io.read(&mut buf))
            .await
            .context("reading from the interrupt pipe")?;
        Ok(())
    }
}
