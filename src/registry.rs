//! Bookkeeping for the set of processes one server supervises.

use nix::sys::signal::Signal;
use nix::unistd::Pid;
use slog_scope::{info, warn};
use std::collections::HashMap;
use std::thread;
use std::time::{Duration, Instant};

use crate::process::Process;

/// How often the shutdown sweep re-checks for exited processes.
const SWEEP_INTERVAL: Duration = Duration::from_millis(50);

/// The processes this server started and has not yet seen die.
///
/// All bookkeeping is by process name. A name frees up as soon as the
/// process's death got recorded, so it can be reused right away.
#[derive(Default)]
pub struct ProcessRegistry {
    by_name: HashMap<String, Process>,
}

impl ProcessRegistry {
    pub fn new() -> ProcessRegistry {
        Default::default()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.by_name.contains_key(name)
    }

    pub fn insert(&mut self, process: Process) {
        self.by_name.insert(process.name().to_string(), process);
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut Process> {
        self.by_name.get_mut(name)
    }

    pub fn remove(&mut self, name: &str) -> Option<Process> {
        self.by_name.remove(name)
    }

    pub fn len(&self) -> usize {
        self.by_name.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_name.is_empty()
    }

    pub fn processes(&self) -> impl Iterator<Item = &Process> {
        self.by_name.values()
    }

    /// The name a pid runs under, if this registry started it.
    pub fn name_of_pid(&self, pid: Pid) -> Option<String> {
        self.by_name
            .values()
            .find(|p| p.pid() == Some(pid))
            .map(|p| p.name().to_string())
    }

    /// Stops everything: an orderly shutdown round first, then a bounded
    /// wait for the processes to exit, then SIGKILL for whatever remains.
    /// Returns once every process got reaped.
    pub fn kill_all(&mut self, grace: Duration) {
        if self.by_name.is_empty() {
            return;
        }
        info!("stopping all supervised processes"; "count" => self.by_name.len());
        for process in self.by_name.values_mut() {
            process.kill(false, None);
        }
        let deadline = Instant::now() + grace;
        loop {
            self.by_name.retain(|_, p| !p.try_reap());
            if self.by_name.is_empty() {
                return;
            }
            if Instant::now() >= deadline {
                break;
            }
            thread::sleep(SWEEP_INTERVAL);
        }
        warn!("processes survived the grace period, sending SIGKILL"; "count" => self.by_name.len());
        for (_, mut process) in self.by_name.drain() {
            process.kill(false, Some(Signal::SIGKILL));
            process.join();
        }
    }
}
