//! Intercept specifications
//!
//! An intercept specification decides which processes have their traffic
//! redirected. The text form is a comma-separated list of terms:
//!
//! ```text
//! all                     every process
//! none                    no process
//! process:curl            display name or executable path contains "curl" (case-insensitive)
//! pid:1234                process id 1234
//! bundle:com.apple        bundle id contains "com.apple" (case-insensitive)
//! !term                   exclude processes matching term
//! ```
//!
//! A process is intercepted when at least one inclusion term matches (or
//! there are only exclusions) and no exclusion term matches.

use crate::error::InvalidSpecSyntax;
use crate::process::ProcessDescriptor;
use arc_swap::ArcSwap;
use std::fmt;
use std::sync::Arc;
use tracing::debug;

/// Parsed intercept specification
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InterceptSpec {
    /// Match every process
    All,

    /// Match no process
    None,

    /// Case-insensitive substring of display name or executable path
    ProcessName(String),

    /// Exact process id
    ProcessId(u32),

    /// Case-insensitive substring of the bundle identifier
    BundleId(String),

    /// Negation
    Not(Box<InterceptSpec>),

    /// Union: any member matches
    AnyOf(Vec<InterceptSpec>),

    /// Intersection: every member matches
    AllOf(Vec<InterceptSpec>),
}

impl InterceptSpec {
    /// Parse specification text.
    pub fn parse(text: &str) -> Result<Self, InvalidSpecSyntax> {
        let trimmed = text.trim();
        if trimmed.is_empty() {
            return Err(InvalidSpecSyntax::new(text, "empty specification"));
        }

        let mut include = Vec::new();
        let mut exclude = Vec::new();

        for raw in trimmed.split(',') {
            let term = raw.trim();
            if term.is_empty() {
                return Err(InvalidSpecSyntax::new(text, "empty term"));
            }

            match term.strip_prefix('!') {
                Some(rest) => exclude.push(parse_atom(text, rest.trim())?),
                None => include.push(parse_atom(text, term)?),
            }
        }

        let spec = match (collapse(include), collapse(exclude)) {
            (Some(inc), None) => inc,
            (None, Some(exc)) => InterceptSpec::Not(Box::new(exc)),
            (Some(inc), Some(exc)) => {
                InterceptSpec::AllOf(vec![inc, InterceptSpec::Not(Box::new(exc))])
            }
            (None, None) => unreachable!("at least one term was parsed"),
        };

        debug!(spec = %spec, "Parsed intercept spec");
        Ok(spec)
    }

    /// Whether traffic from `process` should be redirected.
    pub fn matches(&self, process: &ProcessDescriptor) -> bool {
        match self {
            InterceptSpec::All => true,
            InterceptSpec::None => false,
            InterceptSpec::ProcessName(fragment) => {
                contains_ci(&process.display_name, fragment) || contains_ci(&process.path, fragment)
            }
            InterceptSpec::ProcessId(pid) => process.pid == *pid,
            InterceptSpec::BundleId(fragment) => process
                .bundle_id
                .as_deref()
                .is_some_and(|id| contains_ci(id, fragment)),
            InterceptSpec::Not(inner) => !inner.matches(process),
            InterceptSpec::AnyOf(specs) => specs.iter().any(|s| s.matches(process)),
            InterceptSpec::AllOf(specs) => specs.iter().all(|s| s.matches(process)),
        }
    }

    /// Human-readable description of what this specification intercepts.
    pub fn describe(&self) -> String {
        format!("Intercept {}.", self.phrase())
    }

    fn phrase(&self) -> String {
        match self {
            InterceptSpec::All => "all processes".to_string(),
            InterceptSpec::None => "no processes".to_string(),
            InterceptSpec::ProcessName(fragment) => {
                format!("processes whose name or path contains {:?}", fragment)
            }
            InterceptSpec::ProcessId(pid) => format!("process with pid {}", pid),
            InterceptSpec::BundleId(fragment) => {
                format!("processes whose bundle id contains {:?}", fragment)
            }
            InterceptSpec::Not(inner) => format!("all processes except {}", inner.phrase()),
            InterceptSpec::AnyOf(specs) => specs
                .iter()
                .map(|s| s.phrase())
                .collect::<Vec<_>>()
                .join(" or "),
            InterceptSpec::AllOf(specs) => match specs.as_slice() {
                [include, InterceptSpec::Not(exclude)] => {
                    format!("{}, excluding {}", include.phrase(), exclude.phrase())
                }
                _ => specs
                    .iter()
                    .map(|s| s.phrase())
                    .collect::<Vec<_>>()
                    .join(" and "),
            },
        }
    }
}

impl fmt::Display for InterceptSpec {
    /// Canonical text form; parses back to an equal value.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InterceptSpec::All => f.write_str("all"),
            InterceptSpec::None => f.write_str("none"),
            InterceptSpec::ProcessName(fragment) => write!(f, "process:{}", fragment),
            InterceptSpec::ProcessId(pid) => write!(f, "pid:{}", pid),
            InterceptSpec::BundleId(fragment) => write!(f, "bundle:{}", fragment),
            InterceptSpec::Not(inner) => match inner.as_ref() {
                InterceptSpec::AnyOf(specs) => {
                    let terms: Vec<String> = specs.iter().map(|s| format!("!{}", s)).collect();
                    f.write_str(&terms.join(","))
                }
                other => write!(f, "!{}", other),
            },
            InterceptSpec::AnyOf(specs) | InterceptSpec::AllOf(specs) => {
                let terms: Vec<String> = specs.iter().map(|s| s.to_string()).collect();
                f.write_str(&terms.join(","))
            }
        }
    }
}

impl std::str::FromStr for InterceptSpec {
    type Err = InvalidSpecSyntax;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// Parse `text` and describe it, without touching any redirector state.
pub fn describe_spec(text: &str) -> Result<String, InvalidSpecSyntax> {
    InterceptSpec::parse(text).map(|spec| spec.describe())
}

fn parse_atom(input: &str, term: &str) -> Result<InterceptSpec, InvalidSpecSyntax> {
    if term.eq_ignore_ascii_case("all") {
        return Ok(InterceptSpec::All);
    }
    if term.eq_ignore_ascii_case("none") {
        return Ok(InterceptSpec::None);
    }

    let (prefix, value) = term
        .split_once(':')
        .ok_or_else(|| InvalidSpecSyntax::new(input, format!("unknown term {:?}", term)))?;
    let value = value.trim();

    match prefix.trim().to_ascii_lowercase().as_str() {
        "process" => {
            if value.is_empty() {
                return Err(InvalidSpecSyntax::new(input, "process name is empty"));
            }
            Ok(InterceptSpec::ProcessName(value.to_string()))
        }
        "pid" => value
            .parse::<u32>()
            .map(InterceptSpec::ProcessId)
            .map_err(|_| InvalidSpecSyntax::new(input, format!("invalid pid {:?}", value))),
        "bundle" => {
            if value.is_empty() {
                return Err(InvalidSpecSyntax::new(input, "bundle id is empty"));
            }
            Ok(InterceptSpec::BundleId(value.to_string()))
        }
        other => Err(InvalidSpecSyntax::new(
            input,
            format!("unknown prefix {:?}", other),
        )),
    }
}

fn collapse(mut specs: Vec<InterceptSpec>) -> Option<InterceptSpec> {
    match specs.len() {
        0 => None,
        1 => specs.pop(),
        _ => Some(InterceptSpec::AnyOf(specs)),
    }
}

fn contains_ci(haystack: &str, needle: &str) -> bool {
    haystack.to_lowercase().contains(&needle.to_lowercase())
}

/// The currently active intercept specification.
///
/// Readers load a snapshot without blocking; a store replaces the whole
/// value in one step, so a concurrent reader sees either the old or the
/// new specification.
pub struct ActiveIntercept {
    current: ArcSwap<InterceptSpec>,
}

impl ActiveIntercept {
    pub fn new(spec: InterceptSpec) -> Self {
        Self {
            current: ArcSwap::from_pointee(spec),
        }
    }

    /// Snapshot of the active specification
    pub fn load(&self) -> Arc<InterceptSpec> {
        self.current.load_full()
    }

    /// Replace the active specification, returning the previous one
    pub fn store(&self, spec: InterceptSpec) -> Arc<InterceptSpec> {
        self.current.swap(Arc::new(spec))
    }

    /// Parse `text` and make it active. On error the previous specification stays.
    pub fn replace_from_text(&self, text: &str) -> Result<Arc<InterceptSpec>, InvalidSpecSyntax> {
        let spec = InterceptSpec::parse(text)?;
        self.store(spec);
        Ok(self.load())
    }

    /// Evaluate the active specification against a process
    pub fn matches(&self, process: &ProcessDescriptor) -> bool {
        self.current.load().matches(process)
    }
}

impl Default for ActiveIntercept {
    /// Nothing is intercepted until the caller says otherwise.
    fn default() -> Self {
        Self::new(InterceptSpec::None)
    }
}

impl fmt::Debug for ActiveIntercept {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ActiveIntercept")
            .field(&self.current.load().to_string())
            .finish()
    }
}
