//! Supervision of detached external workers
//!
//! A worker is launched without waiting for it to exit. Completion is
//! observed through the filesystem: the worker writes its output file and
//! then a signal file. Workers that exit without writing the signal are
//! accepted once their output has stopped growing after a grace period.
//! A signal reading `failed`, or a signal with no output beside it, ends
//! the run at once as a failure. A worker that finishes neither way within the timeout is terminated by
//! matching its script path on the process list.

use crate::error::Result;
use crate::process::ProcessRegistry;
use meshpipe_core::Clock;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, info, warn};

/// One run of an external worker script
#[derive(Debug, Clone)]
pub struct ExternalInvocation {
    pub program: PathBuf,
    pub args: Vec<String>,
    /// Where the worker script is written before launch
    pub script_path: PathBuf,
    pub script: String,
    pub output_path: PathBuf,
    pub signal_path: PathBuf,
    pub timeout: Duration,
}

impl ExternalInvocation {
    pub fn command_line(&self) -> String {
        let mut line = self.program.display().to_string();
        for arg in &self.args {
            line.push(' ');
            line.push_str(arg);
        }
        line
    }
}

/// How a completed invocation was recognised
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Completion {
    /// Signal file present and output non-empty
    Signal,
    /// No signal, but the output size held still after the grace period
    StableOutput,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum InvocationState {
    Started,
    Polling { elapsed: Duration },
    Completed { via: Completion, elapsed: Duration },
    /// The worker gave up: it signalled failure, or signalled without output
    Failed { elapsed: Duration, reason: String },
    TimedOut { elapsed: Duration, terminated: Vec<u32> },
}

impl InvocationState {
    pub fn is_completed(&self) -> bool {
        matches!(self, InvocationState::Completed { .. })
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, InvocationState::Failed { .. })
    }

    pub fn is_timed_out(&self) -> bool {
        matches!(self, InvocationState::TimedOut { .. })
    }
}

/// Starts a worker without waiting for it
pub trait Launcher: Send + Sync {
    fn launch(&self, invocation: &ExternalInvocation) -> std::io::Result<()>;
}

/// Spawns the worker in its own process group with null stdio
#[derive(Debug, Default, Clone, Copy)]
pub struct DetachedLauncher;

impl Launcher for DetachedLauncher {
    fn launch(&self, invocation: &ExternalInvocation) -> std::io::Result<()> {
        let mut command = Command::new(&invocation.program);
        command
            .args(&invocation.args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            command.process_group(0);
        }
        let child = command.spawn()?;
        debug!(pid = child.id(), "Launched detached worker");
        reap_in_background(child)?;
        Ok(())
    }
}

/// Wait for `child` on its own thread so its exit status is collected
/// whether or not the supervisor is still watching
pub fn reap_in_background(mut child: Child) -> std::io::Result<JoinHandle<Option<ExitStatus>>> {
    let pid = child.id();
    std::thread::Builder::new()
        .name(format!("reap-{pid}"))
        .spawn(move || match child.wait() {
            Ok(status) => {
                debug!(pid, %status, "Worker exited");
                Some(status)
            }
            Err(e) => {
                warn!(pid, error = %e, "Failed to wait for worker");
                None
            }
        })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SupervisorSettings {
    pub poll_interval: Duration,
    /// Elapsed time before a stable output is accepted without a signal
    pub stability_grace: Duration,
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            stability_grace: Duration::from_secs(30),
        }
    }
}

pub struct Supervisor<'a> {
    clock: &'a dyn Clock,
    registry: &'a dyn ProcessRegistry,
    launcher: &'a dyn Launcher,
    settings: SupervisorSettings,
}

impl<'a> Supervisor<'a> {
    pub fn new(
        clock: &'a dyn Clock,
        registry: &'a dyn ProcessRegistry,
        launcher: &'a dyn Launcher,
        settings: SupervisorSettings,
    ) -> Self {
        Self {
            clock,
            registry,
            launcher,
            settings,
        }
    }

    pub fn clock(&self) -> &'a dyn Clock {
        self.clock
    }

    /// Run `invocation` to completion or timeout.
    ///
    /// Errors only when the script cannot be written or the worker cannot
    /// be launched. A timeout is reported through the returned state. The
    /// script and signal files are removed in every case.
    pub fn run(&self, invocation: &ExternalInvocation) -> Result<InvocationState> {
        remove_quietly(&invocation.signal_path);
        std::fs::write(&invocation.script_path, &invocation.script)?;

        let start = self.clock.now();
        let mut state = InvocationState::Started;
        debug!(command = %invocation.command_line(), ?state, "Launching worker");

        if let Err(e) = self.launcher.launch(invocation) {
            self.cleanup(invocation);
            return Err(e.into());
        }

        let mut last_size: Option<u64> = None;
        let finished = loop {
            let elapsed = self.clock.now().duration_since(start);
            state = InvocationState::Polling { elapsed };

            let size = file_size(&invocation.output_path);
            if let Some(status) = read_signal(&invocation.signal_path) {
                if status.starts_with("failed") {
                    break InvocationState::Failed {
                        elapsed,
                        reason: format!("worker signalled '{status}'"),
                    };
                }
                if size == 0 {
                    break InvocationState::Failed {
                        elapsed,
                        reason: "signal written without output".to_string(),
                    };
                }
                break InvocationState::Completed {
                    via: Completion::Signal,
                    elapsed,
                };
            }
            if size > 0 && elapsed >= self.settings.stability_grace {
                if last_size == Some(size) {
                    break InvocationState::Completed {
                        via: Completion::StableOutput,
                        elapsed,
                    };
                }
                last_size = Some(size);
            } else {
                last_size = None;
            }

            if elapsed >= invocation.timeout {
                let needle = invocation.script_path.display().to_string();
                let terminated = self.registry.terminate_matching(&needle);
                warn!(
                    timeout_secs = invocation.timeout.as_secs(),
                    terminated = terminated.len(),
                    "Worker timed out"
                );
                break InvocationState::TimedOut {
                    elapsed,
                    terminated,
                };
            }
            self.clock.sleep(self.settings.poll_interval);
        };
        debug!(?state, "Polling finished");

        self.cleanup(invocation);
        match &finished {
            InvocationState::Completed { via, elapsed } => {
                info!(?via, elapsed_secs = elapsed.as_secs(), "Worker completed");
            }
            InvocationState::Failed { reason, .. } => {
                warn!(%reason, "Worker failed");
            }
            _ => {}
        }
        Ok(finished)
    }

    fn cleanup(&self, invocation: &ExternalInvocation) {
        remove_quietly(&invocation.script_path);
        remove_quietly(&invocation.signal_path);
    }
}

/// Trimmed signal contents, or `None` while no signal exists
fn read_signal(path: &Path) -> Option<String> {
    match std::fs::read_to_string(path) {
        Ok(text) => Some(text.trim().to_ascii_lowercase()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
        Err(e) => {
            debug!(path = %path.display(), error = %e, "Signal present but unreadable");
            Some(String::new())
        }
    }
}

fn file_size(path: &Path) -> u64 {
    std::fs::metadata(path).map(|m| m.len()).unwrap_or(0)
}

fn remove_quietly(path: &Path) {
    match std::fs::remove_file(path) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!(path = %path.display(), error = %e, "Failed to remove file"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::RecordingRegistry;
    use meshpipe_core::ManualClock;
    use std::sync::Mutex;

    // ---- fakes ----

    /// Launcher that runs a closure in place of the worker
    struct FakeLauncher<F: Fn(&ExternalInvocation) + Send + Sync> {
        on_launch: F,
    }

    impl<F: Fn(&ExternalInvocation) + Send + Sync> Launcher for FakeLauncher<F> {
        fn launch(&self, invocation: &ExternalInvocation) -> std::io::Result<()> {
            assert!(invocation.script_path.exists(), "script written before launch");
            (self.on_launch)(invocation);
            Ok(())
        }
    }

    struct FailingLauncher;

    impl Launcher for FailingLauncher {
        fn launch(&self, _: &ExternalInvocation) -> std::io::Result<()> {
            Err(std::io::Error::new(std::io::ErrorKind::NotFound, "no such program"))
        }
    }

    /// Manual clock that runs a hook with the new elapsed time after each sleep
    struct HookClock {
        inner: ManualClock,
        hook: Mutex<Box<dyn FnMut(Duration) + Send>>,
    }

    impl Clock for HookClock {
        fn now(&self) -> std::time::Instant {
            self.inner.now()
        }

        fn sleep(&self, duration: Duration) {
            self.inner.sleep(duration);
            let elapsed = self.inner.elapsed();
            (self.hook.lock().unwrap())(elapsed);
        }
    }

    fn invocation(dir: &Path, timeout: Duration) -> ExternalInvocation {
        let script_path = dir.join("worker.py");
        ExternalInvocation {
            program: PathBuf::from("blender"),
            args: vec![
                "--background".into(),
                "--python".into(),
                script_path.display().to_string(),
            ],
            script_path,
            script: "print('hi')".into(),
            output_path: dir.join("out.obj"),
            signal_path: dir.join("out.done"),
            timeout,
        }
    }

    // ---- completion ----

    #[test]
    fn test_signal_and_output_complete_immediately() {
        let dir = tempfile::tempdir().unwrap();
        let inv = invocation(dir.path(), Duration::from_secs(180));
        let clock = ManualClock::new();
        let registry = RecordingRegistry::new();
        let launcher = FakeLauncher {
            on_launch: |inv: &ExternalInvocation| {
                std::fs::write(&inv.output_path, "v 0 0 0").unwrap();
                std::fs::write(&inv.signal_path, "completed").unwrap();
            },
        };
        let supervisor = Supervisor::new(&clock, &registry, &launcher, SupervisorSettings::default());

        let state = supervisor.run(&inv).unwrap();
        assert_eq!(
            state,
            InvocationState::Completed {
                via: Completion::Signal,
                elapsed: Duration::ZERO
            }
        );
        assert!(!inv.script_path.exists());
        assert!(!inv.signal_path.exists());
        assert!(inv.output_path.exists());
    }

    #[test]
    fn test_signal_without_output_fails_at_once() {
        let dir = tempfile::tempdir().unwrap();
        let inv = invocation(dir.path(), Duration::from_secs(180));
        let clock = ManualClock::new();
        let registry = RecordingRegistry::new();
        let launcher = FakeLauncher {
            on_launch: |inv: &ExternalInvocation| {
                std::fs::write(&inv.signal_path, "completed").unwrap();
            },
        };
        let supervisor = Supervisor::new(&clock, &registry, &launcher, SupervisorSettings::default());
        match supervisor.run(&inv).unwrap() {
            InvocationState::Failed { elapsed, reason } => {
                assert_eq!(elapsed, Duration::ZERO);
                assert!(reason.contains("without output"));
            }
            other => panic!("unexpected state {other:?}"),
        }
        assert_eq!(clock.elapsed(), Duration::ZERO);
        assert!(registry.stopped().is_empty());
        assert!(!inv.script_path.exists());
        assert!(!inv.signal_path.exists());
    }

    #[test]
    fn test_failed_signal_overrides_partial_output() {
        let dir = tempfile::tempdir().unwrap();
        let inv = invocation(dir.path(), Duration::from_secs(180));
        let clock = ManualClock::new();
        let registry = RecordingRegistry::new();
        let launcher = FakeLauncher {
            on_launch: |inv: &ExternalInvocation| {
                std::fs::write(&inv.output_path, "v 0 0 0").unwrap();
                std::fs::write(&inv.signal_path, "failed\n").unwrap();
            },
        };
        let supervisor = Supervisor::new(&clock, &registry, &launcher, SupervisorSettings::default());
        let state = supervisor.run(&inv).unwrap();
        assert!(state.is_failed());
        assert!(!state.is_completed());
        assert_eq!(clock.elapsed(), Duration::ZERO);
    }

    #[test]
    fn test_failure_signal_after_some_polling() {
        let dir = tempfile::tempdir().unwrap();
        let inv = invocation(dir.path(), Duration::from_secs(180));
        let signal = inv.signal_path.clone();
        let clock = HookClock {
            inner: ManualClock::new(),
            hook: Mutex::new(Box::new(move |elapsed: Duration| {
                if elapsed == Duration::from_secs(4) {
                    std::fs::write(&signal, "failed").unwrap();
                }
            })),
        };
        let registry = RecordingRegistry::new();
        let launcher = FakeLauncher { on_launch: |_: &ExternalInvocation| {} };
        let supervisor = Supervisor::new(&clock, &registry, &launcher, SupervisorSettings::default());
        match supervisor.run(&inv).unwrap() {
            InvocationState::Failed { elapsed, .. } => assert_eq!(elapsed, Duration::from_secs(4)),
            other => panic!("unexpected state {other:?}"),
        }
    }

    #[test]
    fn test_stable_output_accepted_after_grace() {
        let dir = tempfile::tempdir().unwrap();
        let inv = invocation(dir.path(), Duration::from_secs(180));
        let output = inv.output_path.clone();
        // output grows by one byte per second until t=40
        let clock = HookClock {
            inner: ManualClock::new(),
            hook: Mutex::new(Box::new(move |elapsed: Duration| {
                let size = elapsed.as_secs().min(40) as usize;
                std::fs::write(&output, vec![b'x'; size]).unwrap();
            })),
        };
        let registry = RecordingRegistry::new();
        let launcher = FakeLauncher { on_launch: |_: &ExternalInvocation| {} };
        let supervisor = Supervisor::new(&clock, &registry, &launcher, SupervisorSettings::default());

        let state = supervisor.run(&inv).unwrap();
        assert_eq!(
            state,
            InvocationState::Completed {
                via: Completion::StableOutput,
                elapsed: Duration::from_secs(41)
            }
        );
        assert!(registry.stopped().is_empty());
    }

    #[test]
    fn test_stable_output_before_grace_keeps_waiting() {
        let dir = tempfile::tempdir().unwrap();
        let inv = invocation(dir.path(), Duration::from_secs(180));
        let clock = ManualClock::new();
        let registry = RecordingRegistry::new();
        let launcher = FakeLauncher {
            on_launch: |inv: &ExternalInvocation| {
                std::fs::write(&inv.output_path, "v 0 0 0").unwrap();
            },
        };
        let supervisor = Supervisor::new(&clock, &registry, &launcher, SupervisorSettings::default());
        match supervisor.run(&inv).unwrap() {
            InvocationState::Completed { via, elapsed } => {
                assert_eq!(via, Completion::StableOutput);
                assert_eq!(elapsed, Duration::from_secs(31));
            }
            other => panic!("unexpected state {other:?}"),
        }
    }

    // ---- timeout ----

    #[test]
    fn test_silent_worker_times_out_and_is_terminated() {
        let dir = tempfile::tempdir().unwrap();
        let inv = invocation(dir.path(), Duration::from_secs(120));
        let clock = ManualClock::new();
        let registry = RecordingRegistry::new();
        registry.spawn(4242, "blender", &inv.command_line());
        registry.spawn(7, "blender", "blender --background --python /elsewhere.py");
        let launcher = FakeLauncher { on_launch: |_: &ExternalInvocation| {} };
        let supervisor = Supervisor::new(&clock, &registry, &launcher, SupervisorSettings::default());

        let state = supervisor.run(&inv).unwrap();
        assert_eq!(
            state,
            InvocationState::TimedOut {
                elapsed: Duration::from_secs(120),
                terminated: vec![4242]
            }
        );
        assert_eq!(clock.elapsed(), Duration::from_secs(120));
        let script = inv.script_path.display().to_string();
        assert!(registry.list().iter().all(|p| !p.cmdline.contains(&script)));
        assert_eq!(registry.list().len(), 1);
        assert!(!inv.script_path.exists());
        assert!(!inv.signal_path.exists());
    }

    #[test]
    fn test_launch_failure_cleans_up() {
        let dir = tempfile::tempdir().unwrap();
        let inv = invocation(dir.path(), Duration::from_secs(10));
        std::fs::write(&inv.signal_path, "stale").unwrap();
        let clock = ManualClock::new();
        let registry = RecordingRegistry::new();
        let supervisor = Supervisor::new(&clock, &registry, &FailingLauncher, SupervisorSettings::default());

        assert!(supervisor.run(&inv).is_err());
        assert!(!inv.script_path.exists());
        assert!(!inv.signal_path.exists());
    }

    // ---- launching ----

    #[cfg(unix)]
    #[test]
    fn test_reaper_collects_exit_status() {
        let child = Command::new("sh").args(["-c", "exit 3"]).spawn().unwrap();
        let status = reap_in_background(child).unwrap().join().unwrap().unwrap();
        assert_eq!(status.code(), Some(3));
    }

    #[test]
    fn test_state_serialization() {
        let state = InvocationState::Completed {
            via: Completion::StableOutput,
            elapsed: Duration::from_secs(3),
        };
        let value = serde_json::to_value(&state).unwrap();
        assert_eq!(value["state"], "completed");
        assert_eq!(value["via"], "stable_output");
    }
}
