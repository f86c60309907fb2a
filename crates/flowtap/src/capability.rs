//! Capability probing
//!
//! Answers whether local redirect mode can work on this host before any
//! helper is launched.

use std::path::{Path, PathBuf};

use flowtap_core::UnavailableReason;

/// Platform capability query
pub trait CapabilityProbe: Send + Sync {
    /// `None` when local redirect mode is available, otherwise why not
    fn query(&self) -> Option<UnavailableReason>;
}

/// Probe for the running host: Unix sockets plus an executable helper
#[derive(Debug, Clone, Default)]
pub struct PlatformProbe {
    helper: Option<PathBuf>,
    needs_program: bool,
}

impl PlatformProbe {
    /// Probe requiring `helper` to name an executable program
    pub fn new(helper: Option<PathBuf>) -> Self {
        Self {
            helper,
            needs_program: true,
        }
    }

    /// Probe for a helper that runs in-process or is started externally
    pub fn in_process() -> Self {
        Self {
            helper: None,
            needs_program: false,
        }
    }

    fn check_helper(program: &Path) -> Option<UnavailableReason> {
        let resolved = match resolve_program(program) {
            Some(path) => path,
            None => {
                return Some(UnavailableReason::new(format!(
                    "helper program not found: {}",
                    program.display()
                )))
            }
        };

        if !is_executable(&resolved) {
            return Some(UnavailableReason::new(format!(
                "helper program is not executable: {}",
                resolved.display()
            )));
        }
        None
    }
}

impl CapabilityProbe for PlatformProbe {
    fn query(&self) -> Option<UnavailableReason> {
        if !cfg!(unix) {
            return Some(UnavailableReason::new(
                "local redirect mode requires Unix domain sockets",
            ));
        }
        match (&self.helper, self.needs_program) {
            (Some(program), _) => Self::check_helper(program),
            (None, true) => Some(UnavailableReason::new(
                "no helper program configured (set helper.program or FLOWTAP_HELPER)",
            )),
            (None, false) => None,
        }
    }
}

/// Fixed answer, for embedders that know better and for tests
#[derive(Debug, Clone, Default)]
pub struct StaticProbe(Option<UnavailableReason>);

impl StaticProbe {
    pub fn available() -> Self {
        Self(None)
    }

    pub fn unavailable(reason: impl Into<String>) -> Self {
        Self(Some(UnavailableReason::new(reason)))
    }
}

impl CapabilityProbe for StaticProbe {
    fn query(&self) -> Option<UnavailableReason> {
        self.0.clone()
    }
}

/// Resolve a bare program name through `PATH`
fn resolve_program(program: &Path) -> Option<PathBuf> {
    if program.components().count() > 1 || program.is_absolute() {
        return program.exists().then(|| program.to_path_buf());
    }
    let paths = std::env::var_os("PATH")?;
    std::env::split_paths(&paths)
        .map(|dir| dir.join(program))
        .find(|candidate| candidate.is_file())
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;

    std::fs::metadata(path)
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_static_probe() {
        assert_eq!(StaticProbe::available().query(), None);
        let reason = StaticProbe::unavailable("extension not activated")
            .query()
            .unwrap();
        assert_eq!(reason.as_str(), "extension not activated");
    }

    #[cfg(unix)]
    #[test]
    fn test_missing_helper_is_unavailable() {
        let probe = PlatformProbe::new(Some(PathBuf::from("/nonexistent/flowtap-helper")));
        let reason = probe.query().unwrap();
        assert!(reason.as_str().contains("not found"));
    }

    #[cfg(unix)]
    #[test]
    fn test_helper_must_be_executable() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let helper = dir.path().join("helper");
        std::fs::write(&helper, "#!/bin/sh\n").unwrap();
        std::fs::set_permissions(&helper, std::fs::Permissions::from_mode(0o644)).unwrap();

        let probe = PlatformProbe::new(Some(helper.clone()));
        assert!(probe.query().unwrap().as_str().contains("not executable"));

        std::fs::set_permissions(&helper, std::fs::Permissions::from_mode(0o755)).unwrap();
        assert_eq!(probe.query(), None);
    }

    #[cfg(unix)]
    #[test]
    fn test_in_process_probe_is_available() {
        assert_eq!(PlatformProbe::in_process().query(), None);
    }

    #[cfg(unix)]
    #[test]
    fn test_unconfigured_helper_is_unavailable() {
        let reason = PlatformProbe::new(None).query().unwrap();
        assert!(reason.as_str().contains("no helper program configured"));
    }
}
