use anyhow::Result;
use nix::unistd::Pid;
use rueckenmark::protocol::ExitStatus;
use rueckenmark::reaper::*;
use rusty_fork::*;
use slog_scope::info;
use smol::Timer;
use std::time::Duration;

fn fork_child(code: i32) -> Result<Pid> {
    use nix::unistd::{fork, ForkResult};
    match fork() {
        Ok(ForkResult::Parent { child, .. }) => {
            info!("I'm the parent and that's ok"; "pid" => child.as_raw());
            Ok(child)
        }
        Ok(ForkResult::Child) => {
            std::process::exit(code);
        }
        Err(e) => Err(e.into()),
    }
}

rusty_fork_test! {
    #[test]
    fn returns_all_children() {
        smol::run(async {
            let mut zombies = setup_child_exit_handler().expect("Should be able to setup");

            let pid = fork_child(0).expect("0th fork");
            let (child, status) = zombies.reap().await.expect("waiting for child");
            assert_eq!(child, pid);
            assert_eq!(status, ExitStatus::Exited { code: 0 });

            let pid = fork_child(3).expect("first fork");
            Timer::after(Duration::from_millis(100)).await; // XXX: not ideal that we're testing by sleep, but ugh.
            let (child, status) = zombies.reap().await.expect("waiting for child");
            assert_eq!(child, pid);
            assert_eq!(status, ExitStatus::Exited { code: 3 });

            let pid = fork_child(0).expect("2nd fork");
            Timer::after(Duration::from_millis(100)).await;
            let (child, status) = zombies.reap().await.expect("waiting for child");
            assert_eq!(child, pid);
            assert_eq!(status, ExitStatus::Exited { code: 0 });
        });
    }

    #[test]
    fn reports_signal_terminations() {
        use nix::sys::signal::{kill, Signal};
        use nix::unistd::{fork, ForkResult};

        smol::run(async {
            let mut zombies = setup_child_exit_handler().expect("Should be able to setup");

            let pid = match fork() {
                Ok(ForkResult::Parent { child, .. }) => child,
                Ok(ForkResult::Child) => loop {
                    std::thread::sleep(Duration::from_secs(30));
                },
                Err(e) => panic!("fork failed: {}", e),
            };
            kill(pid, Signal::SIGKILL).expect("killing the child");
            let (child, status) = zombies.reap().await.expect("waiting for child");
            assert_eq!(child, pid);
            assert_eq!(
                status,
                ExitStatus::Signaled {
                    signal: Signal::SIGKILL as i32
                }
            );
        });
    }
}
