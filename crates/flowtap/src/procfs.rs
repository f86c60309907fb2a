//! Process metadata from /proc
//!
//! Linux only. On other platforms the source knows no processes and the
//! helper is expected to send fully resolved descriptors.

use std::path::{Path, PathBuf};

use flowtap_core::{ProcessDescriptor, ProcessSource};
use tracing::trace;

/// [`ProcessSource`] backed by the proc filesystem
#[derive(Debug, Clone)]
pub struct ProcfsProcessSource {
    root: PathBuf,
}

impl Default for ProcfsProcessSource {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcfsProcessSource {
    pub fn new() -> Self {
        Self::with_root("/proc")
    }

    /// Read from a different mount point
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn read_process(&self, pid: u32) -> Option<ProcessDescriptor> {
        let dir = self.root.join(pid.to_string());
        if !dir.is_dir() {
            return None;
        }

        let comm = std::fs::read_to_string(dir.join("comm"))
            .ok()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty());

        // Kernel threads have no executable
        let exe = std::fs::read_link(dir.join("exe"))
            .ok()
            .map(|p| p.to_string_lossy().into_owned())
            .filter(|p| !p.ends_with(" (deleted)"));

        let uid = read_uid(&dir);

        let mut process = match &exe {
            Some(path) => ProcessDescriptor::new(pid, path.clone()),
            None => ProcessDescriptor::unknown(pid),
        };
        if let Some(name) = comm {
            if process.display_name.is_empty() {
                process.display_name = name;
            }
        }
        process.is_system = exe.is_none() || uid == Some(0);
        process.is_visible = exe.is_some();

        trace!(pid, name = %process.display_name, "Read process from procfs");
        Some(process)
    }
}

impl ProcessSource for ProcfsProcessSource {
    fn list_active(&self) -> Vec<ProcessDescriptor> {
        let entries = match std::fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(_) => return Vec::new(),
        };

        let mut processes: Vec<_> = entries
            .filter_map(|entry| entry.ok())
            .filter_map(|entry| entry.file_name().to_str()?.parse::<u32>().ok())
            .filter_map(|pid| self.read_process(pid))
            .collect();
        processes.sort_by_key(|p| p.pid);
        processes
    }

    fn find(&self, pid: u32) -> Option<ProcessDescriptor> {
        self.read_process(pid)
    }
}

/// Real uid from /proc/<pid>/status
fn read_uid(dir: &Path) -> Option<u32> {
    let status = std::fs::read_to_string(dir.join("status")).ok()?;
    status
        .lines()
        .find(|line| line.starts_with("Uid:"))
        .and_then(|line| line.split_whitespace().nth(1))
        .and_then(|uid| uid.parse().ok())
}
