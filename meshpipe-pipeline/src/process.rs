//! Process listing and termination

use meshpipe_core::Clock;
use std::process::{Child, ExitStatus};
use std::sync::Mutex;
use std::time::Duration;
use tracing::{debug, warn};

/// A running process as seen by a [`ProcessRegistry`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessInfo {
    pub pid: u32,
    /// Executable file name, or the kernel's truncated task name when the
    /// command line is unavailable
    pub name: String,
    /// Arguments joined with single spaces
    pub cmdline: String,
}

/// Find and stop processes.
///
/// Termination is best-effort: implementations report what they signalled,
/// not whether the process actually exited.
pub trait ProcessRegistry: Send + Sync {
    fn list(&self) -> Vec<ProcessInfo>;

    /// Ask a process to exit
    fn terminate(&self, pid: u32) -> bool;

    /// Stop a process without giving it a chance to clean up
    fn kill(&self, pid: u32) -> bool {
        self.terminate(pid)
    }

    /// Terminate every process whose command line contains `needle`
    fn terminate_matching(&self, needle: &str) -> Vec<u32> {
        let own = std::process::id();
        self.list()
            .into_iter()
            .filter(|p| p.pid != own && p.cmdline.contains(needle))
            .filter(|p| self.terminate(p.pid))
            .map(|p| p.pid)
            .collect()
    }

    /// Kill every process running the executable `name`
    fn kill_by_name(&self, name: &str) -> Vec<u32> {
        let own = std::process::id();
        self.list()
            .into_iter()
            .filter(|p| p.pid != own && runs_executable(&p.name, name))
            .filter(|p| self.kill(p.pid))
            .map(|p| p.pid)
            .collect()
    }
}

/// Longest task name the Linux kernel keeps in `/proc/<pid>/comm`
const TASK_NAME_LEN: usize = 15;

fn executable_stem(name: &str) -> &str {
    let base = name.rsplit(['/', '\\']).next().unwrap_or(name);
    match base.len().checked_sub(4) {
        Some(cut) if base.is_char_boundary(cut) && base[cut..].eq_ignore_ascii_case(".exe") => {
            &base[..cut]
        }
        _ => base,
    }
}

/// Whether a process named `process_name` runs the executable `wanted`.
///
/// Names compare whole. A process name of exactly [`TASK_NAME_LEN`] bytes
/// may be a truncated task name and matches as a prefix.
pub fn runs_executable(process_name: &str, wanted: &str) -> bool {
    let found = executable_stem(process_name);
    let wanted = executable_stem(wanted);
    if found.is_empty() || wanted.is_empty() {
        return false;
    }
    found == wanted
        || (found.len() == TASK_NAME_LEN && wanted.as_bytes().starts_with(found.as_bytes()))
}

/// Registry backed by the operating system
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemProcessRegistry;

impl ProcessRegistry for SystemProcessRegistry {
    #[cfg(target_os = "linux")]
    fn list(&self) -> Vec<ProcessInfo> {
        let Ok(entries) = std::fs::read_dir("/proc") else {
            return Vec::new();
        };
        entries
            .flatten()
            .filter_map(|entry| {
                let pid: u32 = entry.file_name().to_str()?.parse().ok()?;
                let raw = std::fs::read(entry.path().join("cmdline")).ok()?;
                let argv0 = raw
                    .split(|&b| b == 0)
                    .next()
                    .map(|part| String::from_utf8_lossy(part).into_owned())
                    .unwrap_or_default();
                let cmdline = raw
                    .split(|&b| b == 0)
                    .filter(|part| !part.is_empty())
                    .map(|part| String::from_utf8_lossy(part).into_owned())
                    .collect::<Vec<_>>()
                    .join(" ");
                let name = if argv0.is_empty() {
                    std::fs::read_to_string(entry.path().join("comm"))
                        .map(|s| s.trim().to_string())
                        .unwrap_or_default()
                } else {
                    executable_stem(&argv0).to_string()
                };
                Some(ProcessInfo { pid, name, cmdline })
            })
            .collect()
    }

    #[cfg(not(target_os = "linux"))]
    fn list(&self) -> Vec<ProcessInfo> {
        debug!("Process listing is not supported on this platform");
        Vec::new()
    }

    #[cfg(unix)]
    fn terminate(&self, pid: u32) -> bool {
        send_signal(pid, nix::sys::signal::Signal::SIGTERM)
    }

    #[cfg(unix)]
    fn kill(&self, pid: u32) -> bool {
        send_signal(pid, nix::sys::signal::Signal::SIGKILL)
    }

    #[cfg(not(unix))]
    fn terminate(&self, pid: u32) -> bool {
        std::process::Command::new("taskkill")
            .args(["/PID", &pid.to_string(), "/F"])
            .status()
            .map(|s| s.success())
            .unwrap_or(false)
    }
}

#[cfg(unix)]
fn send_signal(pid: u32, signal: nix::sys::signal::Signal) -> bool {
    let Ok(raw) = i32::try_from(pid) else {
        return false;
    };
    match nix::sys::signal::kill(nix::unistd::Pid::from_raw(raw), signal) {
        Ok(()) => {
            debug!(pid, ?signal, "Signalled process");
            true
        }
        Err(e) => {
            warn!(pid, ?signal, error = %e, "Failed to signal process");
            false
        }
    }
}

/// In-memory registry that records what it was asked to stop.
///
/// Useful for dry runs and for exercising supervision without real
/// processes.
#[derive(Debug, Default)]
pub struct RecordingRegistry {
    processes: Mutex<Vec<ProcessInfo>>,
    stopped: Mutex<Vec<u32>>,
}

impl RecordingRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_processes(processes: Vec<ProcessInfo>) -> Self {
        Self {
            processes: Mutex::new(processes),
            stopped: Mutex::new(Vec::new()),
        }
    }

    pub fn spawn(&self, pid: u32, name: &str, cmdline: &str) {
        lock(&self.processes).push(ProcessInfo {
            pid,
            name: name.to_string(),
            cmdline: cmdline.to_string(),
        });
    }

    /// Pids stopped so far, in order
    pub fn stopped(&self) -> Vec<u32> {
        lock(&self.stopped).clone()
    }
}

impl ProcessRegistry for RecordingRegistry {
    fn list(&self) -> Vec<ProcessInfo> {
        lock(&self.processes).clone()
    }

    fn terminate(&self, pid: u32) -> bool {
        let mut processes = lock(&self.processes);
        let before = processes.len();
        processes.retain(|p| p.pid != pid);
        let found = processes.len() != before;
        if found {
            lock(&self.stopped).push(pid);
        }
        found
    }
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|p| p.into_inner())
}

/// Wait for a child up to `timeout`, killing it when the time runs out.
///
/// Returns `None` on timeout.
pub fn wait_with_timeout(
    child: &mut Child,
    timeout: Duration,
    poll: Duration,
    clock: &dyn Clock,
) -> std::io::Result<Option<ExitStatus>> {
    let start = clock.now();
    loop {
        if let Some(status) = child.try_wait()? {
            return Ok(Some(status));
        }
        if clock.now().duration_since(start) >= timeout {
            if let Err(e) = child.kill() {
                warn!(pid = child.id(), error = %e, "Failed to kill child after timeout");
            }
            // reap
            let _ = child.wait();
            return Ok(None);
        }
        clock.sleep(poll);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> RecordingRegistry {
        let r = RecordingRegistry::new();
        r.spawn(10, "blender", "blender --background --python /tmp/ws/tmp_1_0001.py");
        r.spawn(11, "blender", "blender --background --python /tmp/ws/tmp_1_0007.py");
        r.spawn(12, "Instant Meshes", "Instant Meshes -i in.obj -o out.obj");
        r
    }

    #[test]
    fn test_terminate_matching_script() {
        let r = registry();
        let stopped = r.terminate_matching("/tmp/ws/tmp_1_0001.py");
        assert_eq!(stopped, vec![10]);
        assert!(r.list().iter().all(|p| !p.cmdline.contains("tmp_1_0001")));
        assert_eq!(r.list().len(), 2);
    }

    #[test]
    fn test_kill_by_name() {
        let r = registry();
        assert_eq!(r.kill_by_name("Instant Meshes"), vec![12]);
        assert_eq!(r.kill_by_name("Instant Meshes"), Vec::<u32>::new());
        assert_eq!(r.stopped(), vec![12]);
    }

    #[test]
    fn test_kill_by_name_needs_whole_name() {
        let r = RecordingRegistry::new();
        r.spawn(20, "Instant Meshes", "/opt/im/Instant Meshes -i a.obj");
        r.spawn(21, "Instant Meshes Viewer", "Instant Meshes Viewer");
        r.spawn(22, "Instant", "Instant --help");
        assert_eq!(r.kill_by_name("Instant Meshes"), vec![20]);
        assert_eq!(r.list().len(), 2);
    }

    #[test]
    fn test_kill_by_name_matches_truncated_task_name() {
        let r = RecordingRegistry::new();
        // the kernel keeps the first 15 bytes of a long executable name
        r.spawn(30, "remesh-worker-b", "");
        r.spawn(31, "remesh-worker", "remesh-worker");
        assert_eq!(r.kill_by_name("/opt/tools/remesh-worker-batch"), vec![30]);
        assert_eq!(r.stopped(), vec![30]);
    }

    #[test]
    fn test_runs_executable() {
        assert!(runs_executable("Instant Meshes.exe", "Instant Meshes"));
        assert!(runs_executable("blender", "/usr/bin/blender"));
        assert!(!runs_executable("blender-3.6", "blender"));
        assert!(!runs_executable("", "blender"));
        // shorter than a task name, so not a truncation
        assert!(!runs_executable("remesh", "remesh-worker"));
    }

    #[test]
    fn test_no_match_stops_nothing() {
        let r = registry();
        assert!(r.terminate_matching("/other/script.py").is_empty());
        assert_eq!(r.list().len(), 3);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_system_registry_sees_self() {
        let own = std::process::id();
        let own_info = SystemProcessRegistry.list().into_iter().find(|p| p.pid == own).unwrap();
        let exe = std::env::current_exe().unwrap();
        let exe_name = exe.file_name().unwrap().to_string_lossy().into_owned();
        assert!(runs_executable(&own_info.name, &exe_name));
    }
}
