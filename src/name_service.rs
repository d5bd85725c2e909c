//! Boundary traits for the outside systems a running deployment talks to.
//!
//! Deployed components register their tasks with a name service and get
//! manipulated through a task control interface; both live outside this
//! crate. The supervisor needs only the narrow slices modeled here:
//! checking whether a task name answers, resolving it into a control
//! handle for shutdown, and scrubbing it from the registry once its
//! process died.

use parking_lot::RwLock;
use std::collections::HashSet;
use thiserror::Error;

/// A name the system was asked about and could not produce.
#[derive(PartialEq, Eq, Error, Debug)]
pub enum NotFound {
    #[error("cannot find a project called {0}")]
    Project(String),

    #[error("cannot find a typekit called {0}")]
    Typekit(String),

    #[error("cannot find a deployment called {0}")]
    Deployment(String),

    #[error("cannot resolve a task called {0}")]
    Task(String),

    #[error("cannot get a running {0} deployment")]
    NotReady(String),

    #[error("{0} was started but crashed")]
    Crashed(String),
}

/// A lifecycle transition that a remote task refused or botched.
#[derive(PartialEq, Eq, Error, Debug)]
#[error("task {task} failed to {transition}")]
pub struct TransitionFailed {
    pub task: String,
    pub transition: &'static str,
}

/// Control interface of a single task on a running deployment.
pub trait TaskControl: Send {
    /// Stops the task's activity, if it was running.
    fn stop(&mut self) -> Result<(), TransitionFailed>;

    /// Whether the task holds configured state that should be cleaned up
    /// before its process gets shut down.
    fn needs_cleanup(&self) -> bool;

    /// Returns the task to its unconfigured state.
    fn cleanup(&mut self) -> Result<(), TransitionFailed>;

    /// Disconnects the task's ports from the rest of the system.
    fn disconnect_ports(&mut self) -> Result<(), TransitionFailed>;
}

/// Name resolution for deployed tasks.
pub trait NameService: Send + Sync {
    /// Whether `name` currently answers on the name service.
    fn reachable(&self, name: &str) -> bool;

    /// Resolves `name` into a control handle for the task behind it.
    fn resolve(&self, name: &str) -> Result<Box<dyn TaskControl>, NotFound>;

    /// Drops `name` from the name service. Used to scrub leftovers of dead
    /// processes, so it tolerates names that are already gone.
    fn unregister(&self, name: &str);
}

/// An in-memory name service.
///
/// It answers for names explicitly announced to it and controls nothing;
/// resolved tasks accept every transition. The bundled daemon runs against
/// this implementation, and tests use it to script reachability.
#[derive(Debug, Default)]
pub struct MemoryNameService {
    names: RwLock<HashSet<String>>,
}

impl MemoryNameService {
    pub fn new() -> MemoryNameService {
        Default::default()
    }

    /// Makes `name` reachable.
    pub fn announce(&self, name: &str) {
        self.names.write().insert(name.to_string());
    }
}

impl NameService for MemoryNameService {
    fn reachable(&self, name: &str) -> bool {
        self.names.read().contains(name)
    }

    fn resolve(&self, name: &str) -> Result<Box<dyn TaskControl>, NotFound> {
        if self.reachable(name) {
            Ok(Box::new(UncontrolledTask))
        } else {
            Err(NotFound::Task(name.to_string()))
        }
    }

    fn unregister(&self, name: &str) {
        self.names.write().remove(name);
    }
}

/// What [`MemoryNameService`] resolves to: a task with no control channel,
/// where every transition trivially succeeds.
struct UncontrolledTask;

impl TaskControl for UncontrolledTask {
    fn stop(&mut self) -> Result<(), TransitionFailed> {
        Ok(())
    }

    fn needs_cleanup(&self) -> bool {
        false
    }

    fn cleanup(&mut self) -> Result<(), TransitionFailed> {
        Ok(())
    }

    fn disconnect_ports(&mut self) -> Result<(), TransitionFailed> {
        Ok(())
    }
}
