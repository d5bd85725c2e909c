//! A single deployment process under local supervision.
//!
//! [`Process`] covers the whole lifecycle: spawning the deployment's
//! binary with output redirection, waiting for its tasks to answer on the
//! name service, orderly or forced shutdown, and the bookkeeping around
//! its death. It never reaps behind the supervisor's back; terminations
//! observed elsewhere get fed in through [`Process::mark_dead`].

use anyhow::{Context, Result};
use nix::errno::Errno;
use nix::sys::signal::{self, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{setpgid, Pid};
use serde::{Deserialize, Serialize};
use slog_scope::{debug, error, info, warn};
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::fs::{self, File};
use std::io;
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use thiserror::Error;
use uuid::Uuid;

use crate::catalog::{Deployment, DeploymentModel};
use crate::name_service::{NameService, NotFound, TaskControl};
use crate::protocol::ExitStatus;

/// How often readiness waits re-probe the name service.
const POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(PartialEq, Error, Debug)]
#[error("{name} is already running")]
pub struct AlreadyRunning {
    pub name: String,
}

#[derive(PartialEq, Error, Debug)]
#[error("a task called {task} is already reachable, refusing to start {name}")]
pub struct TaskNameClash {
    pub name: String,
    pub task: String,
}

#[derive(Error, Debug)]
#[error("deployment {name} failed to start")]
pub struct StartupFailure {
    pub name: String,
    #[source]
    pub source: io::Error,
}

/// Options controlling how a deployment process gets launched.
///
/// All fields are optional: the server overlays a start request's options
/// over its configured defaults, field by field.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct SpawnOptions {
    /// Log file template for the process's stdout and stderr. `%m`
    /// expands to the process name, `%p` to its pid; relative paths live
    /// under the working directory. An empty string turns output capture
    /// off even when the server has a default template.
    pub output: Option<String>,

    /// Directory to start the process in.
    pub working_directory: Option<PathBuf>,

    /// Runs the process under valgrind with the given extra arguments.
    pub valgrind: Option<ValgrindOptions>,

    /// Prefixes every task name of the deployment, by way of generated
    /// name mappings. Resolved by the client before the request goes out;
    /// the server never sees it.
    pub prefix: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ValgrindOptions {
    #[serde(default)]
    pub args: Vec<String>,
}

impl SpawnOptions {
    /// Overlays `self` over `defaults`, field by field.
    pub fn or_defaults(mut self, defaults: &SpawnOptions) -> SpawnOptions {
        self.output = self.output.or_else(|| defaults.output.clone());
        self.working_directory = self
            .working_directory
            .or_else(|| defaults.working_directory.clone());
        self.valgrind = self.valgrind.or_else(|| defaults.valgrind.clone());
        self.prefix = self.prefix.or_else(|| defaults.prefix.clone());
        self
    }

    /// Splits off the `prefix` option, turning it into explicit name
    /// mappings for every task name in `model`.
    pub fn resolve_prefix(mut self, model: &DeploymentModel) -> (HashMap<String, String>, Self) {
        let mut mappings = HashMap::new();
        if let Some(prefix) = self.prefix.take() {
            for task in &model.task_names {
                mappings.insert(task.clone(), format!("{}{}", prefix, task));
            }
        }
        (mappings, self)
    }
}

/// A deployment process and the supervision state that goes with it.
pub struct Process {
    name: String,
    deployment: Deployment,
    name_mappings: HashMap<String, String>,
    names: Arc<dyn NameService>,
    pid: Option<Pid>,
    exit_status: Option<ExitStatus>,
    expected_exit: Option<Signal>,
    dead: bool,
    tasks: HashMap<String, Box<dyn TaskControl>>,
}

impl Process {
    pub fn new(
        name: &str,
        deployment: Deployment,
        name_mappings: HashMap<String, String>,
        names: Arc<dyn NameService>,
    ) -> Process {
        Process {
            name: name.to_string(),
            deployment,
            name_mappings,
            names,
            pid: None,
            exit_status: None,
            expected_exit: None,
            dead: false,
            tasks: HashMap::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn deployment_name(&self) -> &str {
        &self.deployment.model.name
    }

    pub fn pid(&self) -> Option<Pid> {
        self.pid
    }

    pub fn exit_status(&self) -> Option<ExitStatus> {
        self.exit_status
    }

    pub fn expected_exit(&self) -> Option<Signal> {
        self.expected_exit
    }

    /// Whether the process is, as far as supervision knows, running.
    pub fn alive(&self) -> bool {
        self.pid.is_some() && self.exit_status.is_none()
    }

    /// The deployment's task names with this process's name mappings
    /// applied.
    pub fn task_names(&self) -> Vec<String> {
        self.deployment
            .model
            .task_names
            .iter()
            .map(|t| self.mapped_name(t))
            .collect()
    }

    fn mapped_name(&self, task: &str) -> String {
        self.name_mappings
            .get(task)
            .cloned()
            .unwrap_or_else(|| task.to_string())
    }

    /// Starts the deployment's binary and returns the child's pid.
    ///
    /// Refuses to run twice, and refuses to start while something else
    /// already answers for one of its task names. The child gets its own
    /// process group, so signals aimed at it never hit the supervisor.
    /// Startup failures come back as [`StartupFailure`] with the OS error
    /// attached.
    pub fn spawn(&mut self, options: &SpawnOptions) -> Result<Pid> {
        if self.alive() {
            return Err(AlreadyRunning {
                name: self.name.clone(),
            }
            .into());
        }
        for task in self.task_names() {
            if self.names.reachable(&task) {
                return Err(TaskNameClash {
                    name: self.name.clone(),
                    task,
                }
                .into());
            }
        }
        debug!("spawning deployment"; "name" => &self.name, "binary" => ?&self.deployment.binary);

        let workdir = options.working_directory.clone();
        let redirect = match options.output.as_deref().filter(|o| !o.is_empty()) {
            Some(template) => Some(OutputRedirect::create(
                template,
                &self.name,
                workdir.as_deref(),
            )?),
            None => None,
        };

        let mut command = match &options.valgrind {
            Some(valgrind) => {
                let mut command = Command::new("valgrind");
                if let Some(redirect) = &redirect {
                    // valgrind expands %p in --log-file by itself; %m got
                    // substituted above.
                    command.arg(format!("--log-file={}.valgrind", redirect.log_name()));
                }
                command.args(&valgrind.args);
                command.arg(&self.deployment.binary);
                command
            }
            None => Command::new(&self.deployment.binary),
        };
        command.args(&self.deployment.args);
        if let Some(dir) = &workdir {
            command.current_dir(dir);
        }
        if let Some(redirect) = &redirect {
            let (stdout, stderr) = redirect.stdio()?;
            command.stdout(stdout);
            command.stderr(stderr);
        }
        unsafe {
            command.pre_exec(|| {
                setpgid(Pid::from_raw(0), Pid::from_raw(0))
                    .map_err(|e| io::Error::new(io::ErrorKind::Other, e))
            });
        }
        let child = command.spawn().map_err(|source| StartupFailure {
            name: self.name.clone(),
            source,
        })?;
        let pid = Pid::from_raw(child.id() as i32);
        self.pid = Some(pid);
        self.exit_status = None;
        self.expected_exit = None;
        self.dead = false;
        if let Some(redirect) = redirect {
            redirect.finalize(pid);
        }
        info!("started deployment"; "name" => &self.name, "pid" => pid.as_raw());
        Ok(pid)
    }

    /// Blocks until every task of this process answers on the name
    /// service, or `timeout` runs out. A timeout of zero is a single
    /// probe, `None` waits indefinitely.
    pub fn wait_running(&self, timeout: Option<Duration>) -> Result<(), NotFound> {
        wait_reachable(
            &*self.names,
            &self.name,
            &self.task_names(),
            || self.alive(),
            timeout,
        )
    }

    /// Resolves one of this process's tasks, caching the handle until the
    /// process dies.
    pub fn task(&mut self, task_name: &str) -> Result<&mut dyn TaskControl, NotFound> {
        if !self.task_names().iter().any(|t| t == task_name) {
            return Err(NotFound::Task(task_name.to_string()));
        }
        match self.tasks.entry(task_name.to_string()) {
            Entry::Occupied(e) => Ok(&mut **e.into_mut()),
            Entry::Vacant(v) => {
                let task = self.names.resolve(task_name)?;
                Ok(&mut **v.insert(task))
            }
        }
    }

    /// Shuts the process down. A no-op when it is not alive.
    ///
    /// With no explicit `signal`, tries an orderly shutdown first: every
    /// task that answers gets stopped, cleaned up when it holds state,
    /// and its ports disconnected, with failures logged and swallowed.
    /// The process then receives SIGINT regardless. An explicit signal
    /// skips the orderly part. Either way the delivered signal is
    /// recorded as the expected way to die.
    ///
    /// With `wait`, blocks until the process got reaped and warns when it
    /// ended differently than requested.
    pub fn kill(&mut self, wait: bool, signal: Option<Signal>) {
        if !self.alive() {
            return;
        }
        debug!("stopping process"; "name" => &self.name, "wait" => wait);
        let expected = match signal {
            Some(signal) => {
                warn!("sending explicit signal"; "name" => &self.name, "signal" => ?signal);
                signal
            }
            None => {
                self.clean_shutdown();
                Signal::SIGINT
            }
        };
        self.expected_exit = Some(expected);
        if let Some(pid) = self.pid {
            match signal::kill(pid, expected) {
                Ok(()) => {}
                Err(nix::Error::Sys(Errno::ESRCH)) => {
                    // Already gone; the reaper will get to it.
                    debug!("signalled an already-exited process"; "name" => &self.name, "pid" => pid.as_raw());
                }
                Err(e) => {
                    warn!("failed to signal process"; "name" => &self.name, "pid" => pid.as_raw(), "error" => %e);
                }
            }
        }
        if wait {
            self.join();
            if let (Some(expected), Some(ExitStatus::Signaled { signal })) =
                (self.expected_exit, self.exit_status)
            {
                if signal != expected as i32 {
                    warn!("process quit with a different signal than requested";
                          "name" => &self.name, "expected" => ?expected, "got" => signal);
                }
            }
        }
    }

    /// Best-effort orderly wind-down of the process's tasks. Failures are
    /// logged and swallowed so that the signal that follows goes out no
    /// matter what state the tasks are in.
    fn clean_shutdown(&mut self) {
        for task_name in self.task_names() {
            let task = match self.task(&task_name) {
                Ok(task) => task,
                Err(e) => {
                    debug!("skipping unreachable task during shutdown"; "task" => &task_name, "error" => %e);
                    continue;
                }
            };
            if let Err(e) = task.stop() {
                info!("failed to stop task"; "task" => &task_name, "error" => %e);
            }
            if task.needs_cleanup() {
                if let Err(e) = task.cleanup() {
                    info!("failed to clean up task"; "task" => &task_name, "error" => %e);
                }
            }
            if let Err(e) = task.disconnect_ports() {
                info!("failed to disconnect task ports"; "task" => &task_name, "error" => %e);
            }
        }
    }

    /// Records the process's death. The first call wins: repeat calls,
    /// even with a different status, change nothing.
    ///
    /// Clears the pid, drops the cached task handles and scrubs the
    /// process's task names from the name service.
    pub fn mark_dead(&mut self, status: Option<ExitStatus>) {
        if self.dead {
            return;
        }
        self.dead = true;
        self.pid = None;
        self.exit_status = status;
        match (status, self.expected_exit) {
            (None, _) => {
                info!("process died, exit status unknown"; "name" => &self.name);
            }
            (Some(ExitStatus::Exited { code: 0 }), _) => {
                info!("process exited normally"; "name" => &self.name);
            }
            (Some(ExitStatus::Exited { code }), _) => {
                warn!("process exited with a nonzero status"; "name" => &self.name, "code" => code);
            }
            (Some(ExitStatus::Signaled { signal }), Some(expected))
                if signal == expected as i32 =>
            {
                info!("process terminated as requested"; "name" => &self.name, "signal" => signal);
            }
            (Some(ExitStatus::Signaled { signal }), Some(expected)) => {
                warn!("process terminated with a different signal than expected";
                      "name" => &self.name, "signal" => signal, "expected" => ?expected);
            }
            (Some(ExitStatus::Signaled { signal }), None) => {
                error!("process unexpectedly terminated by signal"; "name" => &self.name, "signal" => signal);
            }
        }
        self.tasks.clear();
        for task_name in self.task_names() {
            self.names.unregister(&task_name);
        }
    }

    /// Blocks until the child got reaped, feeding the result into
    /// [`Process::mark_dead`]. A child that something else already reaped
    /// counts as dead with an unknown status.
    pub fn join(&mut self) {
        let pid = match self.pid {
            Some(pid) => pid,
            None => return,
        };
        loop {
            match waitpid(pid, None) {
                Ok(status) => {
                    if let Some(status) = ExitStatus::from_wait(&status) {
                        return self.mark_dead(Some(status));
                    }
                    debug!("ignoring non-termination state change"; "name" => &self.name, "change" => ?status);
                }
                Err(nix::Error::Sys(Errno::ECHILD)) => return self.mark_dead(None),
                Err(nix::Error::Sys(Errno::EINTR)) => {}
                Err(e) => {
                    warn!("failed to wait for process"; "name" => &self.name, "error" => %e);
                    return;
                }
            }
        }
    }

    /// A non-blocking [`Process::join`]: reaps the child if it already
    /// ended. Returns whether the process is dead.
    pub fn try_reap(&mut self) -> bool {
        let pid = match self.pid {
            Some(pid) => pid,
            None => return true,
        };
        match waitpid(pid, Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::StillAlive) => false,
            Ok(status) => match ExitStatus::from_wait(&status) {
                Some(status) => {
                    self.mark_dead(Some(status));
                    true
                }
                None => false,
            },
            Err(nix::Error::Sys(Errno::ECHILD)) => {
                self.mark_dead(None);
                true
            }
            Err(_) => false,
        }
    }
}

/// Polls `names` until every name in `task_names` answers.
///
/// `alive` is consulted along the way: a process that is gone fails the
/// wait immediately instead of running out the clock.
pub(crate) fn wait_reachable(
    names: &dyn NameService,
    what: &str,
    task_names: &[String],
    alive: impl Fn() -> bool,
    timeout: Option<Duration>,
) -> Result<(), NotFound> {
    let deadline = timeout.map(|t| Instant::now() + t);
    loop {
        if task_names.iter().all(|t| names.reachable(t)) {
            debug!("deployment is reachable"; "name" => what);
            return Ok(());
        }
        if !alive() {
            return Err(NotFound::Crashed(what.to_string()));
        }
        if let Some(deadline) = deadline {
            if Instant::now() >= deadline {
                return Err(NotFound::NotReady(what.to_string()));
            }
        }
        thread::sleep(POLL_INTERVAL);
    }
}

/// Log file handling for one spawn.
///
/// The file gets created up front so that exec failures still leave a
/// trace, under an interim name when the template wants the pid (which
/// does not exist yet); once the child is running, the file moves to its
/// final name. The child's descriptors stay valid across the rename.
struct OutputRedirect {
    file: File,
    path: PathBuf,
    pid_template: Option<PathBuf>,
}

impl OutputRedirect {
    fn create(template: &str, name: &str, workdir: Option<&Path>) -> Result<OutputRedirect> {
        let rendered = template.replace("%m", name);
        let rendered = match workdir {
            Some(dir) => dir.join(&rendered),
            None => PathBuf::from(&rendered),
        };
        let (path, pid_template) = if rendered.to_string_lossy().contains("%p") {
            let parent = rendered.parent().map(|p| p.to_owned()).unwrap_or_default();
            let interim = parent.join(format!(".{}-{}.spawning", name, Uuid::new_v4()));
            (interim, Some(rendered))
        } else {
            (rendered, None)
        };
        let file =
            File::create(&path).with_context(|| format!("creating log file {:?}", path))?;
        Ok(OutputRedirect {
            file,
            path,
            pid_template,
        })
    }

    /// The final log file name, possibly still containing `%p`.
    fn log_name(&self) -> String {
        self.pid_template
            .as_ref()
            .unwrap_or(&self.path)
            .to_string_lossy()
            .into_owned()
    }

    fn stdio(&self) -> Result<(Stdio, Stdio)> {
        let stdout = self
            .file
            .try_clone()
            .context("duplicating the log file descriptor")?;
        let stderr = self
            .file
            .try_clone()
            .context("duplicating the log file descriptor")?;
        Ok((Stdio::from(stdout), Stdio::from(stderr)))
    }

    /// Moves the interim file into place once the pid is known.
    fn finalize(self, pid: Pid) {
        if let Some(ref template) = self.pid_template {
            let final_path = PathBuf::from(
                template
                    .to_string_lossy()
                    .replace("%p", &pid.as_raw().to_string()),
            );
            if let Err(e) = fs::rename(&self.path, &final_path) {
                warn!("failed to move log file into place";
                      "from" => ?&self.path, "to" => ?&final_path, "error" => %e);
            }
        }
    }
}
