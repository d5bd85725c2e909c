//! The client-side handle to a process running under a remote server.

use anyhow::Result;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use crate::catalog::DeploymentModel;
use crate::client::ProcessClient;
use crate::name_service::{NameService, NotFound};
use crate::process;

/// An operation that cannot work on a remote process.
#[derive(PartialEq, Eq, Error, Debug)]
#[error("{0}")]
pub struct Unsupported(pub &'static str);

/// A process running under a remote server's supervision.
///
/// Handles are cheap clones of one shared state: the client keeps one per
/// started process and flips it dead when the server announces the death,
/// which every other clone observes.
#[derive(Clone)]
pub struct RemoteProcess {
    inner: Arc<Mutex<Inner>>,
}

struct Inner {
    name: String,
    deployment_name: String,
    model: DeploymentModel,
    name_mappings: HashMap<String, String>,
    pid: u32,
    host_id: String,
    alive: bool,
    names: Arc<dyn NameService>,
}

impl fmt::Debug for RemoteProcess {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.inner.try_lock() {
            Some(inner) => f
                .debug_struct("RemoteProcess")
                .field("name", &inner.name)
                .field("deployment_name", &inner.deployment_name)
                .field("pid", &inner.pid)
                .field("host_id", &inner.host_id)
                .field("alive", &inner.alive)
                .finish(),
            None => f.pad("RemoteProcess { <locked> }"),
        }
    }
}

impl RemoteProcess {
    pub(crate) fn new(
        name: &str,
        deployment_name: &str,
        model: DeploymentModel,
        name_mappings: HashMap<String, String>,
        pid: u32,
        host_id: &str,
        names: Arc<dyn NameService>,
    ) -> RemoteProcess {
        RemoteProcess {
            inner: Arc::new(Mutex::new(Inner {
                name: name.to_string(),
                deployment_name: deployment_name.to_string(),
                model,
                name_mappings,
                pid,
                host_id: host_id.to_string(),
                alive: true,
                names,
            })),
        }
    }

    pub fn name(&self) -> String {
        self.inner.lock().name.clone()
    }

    pub fn deployment_name(&self) -> String {
        self.inner.lock().deployment_name.clone()
    }

    /// Pid of the process on the remote host.
    pub fn pid(&self) -> u32 {
        self.inner.lock().pid
    }

    /// Identity of the server session supervising this process.
    pub fn host_id(&self) -> String {
        self.inner.lock().host_id.clone()
    }

    /// Whether the last word from the server was that the process runs.
    pub fn alive(&self) -> bool {
        self.inner.lock().alive
    }

    /// The remote tasks' names, with this process's name mappings
    /// applied.
    pub fn task_names(&self) -> Vec<String> {
        let inner = self.inner.lock();
        inner
            .model
            .task_names
            .iter()
            .map(|t| {
                inner
                    .name_mappings
                    .get(t)
                    .cloned()
                    .unwrap_or_else(|| t.clone())
            })
            .collect()
    }

    pub(crate) fn mark_dead(&self) {
        self.inner.lock().alive = false;
    }

    /// Asks the server to stop the process.
    ///
    /// Death is still confirmed asynchronously: the handle only flips to
    /// dead once [`ProcessClient::wait_termination`] has seen the
    /// server's announcement. Blocking right here until that happens is
    /// nothing this handle can offer, so `wait` must be `false`.
    pub fn kill(&self, client: &mut ProcessClient, wait: bool) -> Result<()> {
        if wait {
            return Err(Unsupported(
                "cannot wait for a remote process to die; use wait_termination",
            )
            .into());
        }
        client.stop(&self.name())
    }

    /// There is no local child to reap here.
    pub fn join(&self) -> Result<()> {
        Err(Unsupported("cannot join a remote process; use wait_termination").into())
    }

    /// Blocks until every task of the remote process answers on the name
    /// service, or `timeout` runs out.
    pub fn wait_running(&self, timeout: Option<Duration>) -> Result<(), NotFound> {
        let (names, name) = {
            let inner = self.inner.lock();
            (inner.names.clone(), inner.name.clone())
        };
        process::wait_reachable(&*names, &name, &self.task_names(), || self.alive(), timeout)
    }
}
