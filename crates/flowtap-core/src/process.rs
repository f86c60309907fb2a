//! Process descriptors and the process metadata collaborator
//!
//! The redirector never enumerates processes itself. Whatever owns that
//! job (the privileged helper, a platform crate, a test) hands descriptors
//! in through [`ProcessSource`].

use serde::{Deserialize, Serialize};
use std::path::Path;

/// Identity of a process that owns a flow
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessDescriptor {
    /// Process ID
    pub pid: u32,

    /// Executable path
    #[serde(default)]
    pub path: String,

    /// Name shown to users
    #[serde(default)]
    pub display_name: String,

    /// Bundle identifier (macOS)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bundle_id: Option<String>,

    /// Whether the process has a visible UI
    #[serde(default = "default_true")]
    pub is_visible: bool,

    /// Whether the process belongs to the operating system
    #[serde(default)]
    pub is_system: bool,
}

fn default_true() -> bool {
    true
}

impl ProcessDescriptor {
    /// Create a descriptor, deriving the display name from the executable file name
    pub fn new(pid: u32, path: impl Into<String>) -> Self {
        let path = path.into();
        let display_name = Path::new(&path)
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();

        Self {
            pid,
            path,
            display_name,
            bundle_id: None,
            is_visible: true,
            is_system: false,
        }
    }

    /// Descriptor for a pid nothing else is known about
    pub fn unknown(pid: u32) -> Self {
        Self::new(pid, "")
    }

    pub fn with_display_name(mut self, name: impl Into<String>) -> Self {
        self.display_name = name.into();
        self
    }

    pub fn with_bundle_id(mut self, bundle_id: impl Into<String>) -> Self {
        self.bundle_id = Some(bundle_id.into());
        self
    }

    pub fn with_visibility(mut self, is_visible: bool) -> Self {
        self.is_visible = is_visible;
        self
    }

    pub fn with_system(mut self, is_system: bool) -> Self {
        self.is_system = is_system;
        self
    }

    /// True when only the pid is known
    pub fn is_unresolved(&self) -> bool {
        self.path.is_empty() && self.display_name.is_empty()
    }

    /// Fill missing fields from `other` (same pid, richer metadata)
    pub fn merge_from(&mut self, other: &ProcessDescriptor) {
        if self.path.is_empty() {
            self.path = other.path.clone();
        }
        if self.display_name.is_empty() {
            self.display_name = other.display_name.clone();
        }
        if self.bundle_id.is_none() {
            self.bundle_id = other.bundle_id.clone();
        }
        self.is_visible = other.is_visible;
        self.is_system = other.is_system;
    }
}

/// Source of process metadata
pub trait ProcessSource: Send + Sync {
    /// All currently running processes
    fn list_active(&self) -> Vec<ProcessDescriptor>;

    /// Look up one process by pid
    fn find(&self, pid: u32) -> Option<ProcessDescriptor> {
        self.list_active().into_iter().find(|p| p.pid == pid)
    }
}

/// A fixed list of processes
#[derive(Debug, Clone, Default)]
pub struct StaticProcessSource {
    processes: Vec<ProcessDescriptor>,
}

impl StaticProcessSource {
    pub fn new(processes: Vec<ProcessDescriptor>) -> Self {
        Self { processes }
    }

    /// A source that knows about no processes
    pub fn empty() -> Self {
        Self::default()
    }
}

impl ProcessSource for StaticProcessSource {
    fn list_active(&self) -> Vec<ProcessDescriptor> {
        self.processes.clone()
    }

    fn find(&self, pid: u32) -> Option<ProcessDescriptor> {
        self.processes.iter().find(|p| p.pid == pid).cloned()
    }
}
