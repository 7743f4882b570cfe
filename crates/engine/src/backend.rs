//! Engineering backend capability interface.
//!
//! The vendor automation layer (project files, hardware configuration,
//! compilation, download) lives behind [`EngineeringBackend`]. The session
//! only talks to this trait, so drivers can be swapped per manufacturer and
//! tests can run against [`crate::simulated::SimulatedBackend`].

use crate::model::{BackendRef, NetworkIdentity, ParameterMap, Placement};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

/// Result type for driver calls.
pub type BackendResult<T> = Result<T, BackendError>;

#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("backend fault {code}: {message}")]
    Fault { code: String, message: String },

    #[error("not found: {0}")]
    NotFound(String),

    #[error("unsupported: {0}")]
    Unsupported(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

impl BackendError {
    pub fn fault(code: impl Into<String>, message: impl Into<String>) -> Self {
        BackendError::Fault {
            code: code.into(),
            message: message.into(),
        }
    }
}

// ---------------------------------------------------------------------------
// Handles and payloads
// ---------------------------------------------------------------------------

/// Open project inside the backend.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ProjectHandle(pub String);

/// Live engineering session against an open project.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionHandle(pub String);

impl fmt::Display for ProjectHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Display for SessionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SafetyMode {
    #[default]
    Standard,
    Safety,
}

impl SafetyMode {
    pub fn from_flag(safety: bool) -> Self {
        if safety {
            SafetyMode::Safety
        } else {
            SafetyMode::Standard
        }
    }

    pub fn is_safety(self) -> bool {
        self == SafetyMode::Safety
    }
}

/// Which parameter API a read/write goes through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParameterScope {
    Standard,
    Safety,
}

/// Everything the backend needs to place a device in the project.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceSpec {
    pub name: String,
    pub device_type: String,
    pub safety: bool,
    pub placement: Placement,
    /// Initial parameter values by module.
    pub modules: BTreeMap<String, ParameterMap>,
}

/// Artifact classes pushed by a download, selectable independently.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DownloadOptions {
    #[serde(default)]
    pub hardware: bool,
    #[serde(default)]
    pub software: bool,
    #[serde(default)]
    pub safety: bool,
}

impl DownloadOptions {
    pub fn hardware_and_software() -> Self {
        Self {
            hardware: true,
            software: true,
            safety: false,
        }
    }

    pub fn is_empty(&self) -> bool {
        !(self.hardware || self.software || self.safety)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Error,
    Warning,
    Info,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Diagnostic {
    pub severity: Severity,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    pub description: String,
}

/// Messages produced by a compile run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompileDiagnostics {
    #[serde(default)]
    pub messages: Vec<Diagnostic>,
}

impl CompileDiagnostics {
    pub fn error_count(&self) -> usize {
        self.count(Severity::Error)
    }

    pub fn warning_count(&self) -> usize {
        self.count(Severity::Warning)
    }

    fn count(&self, severity: Severity) -> usize {
        self.messages
            .iter()
            .filter(|m| m.severity == severity)
            .count()
    }
}

// ---------------------------------------------------------------------------
// Driver interface
// ---------------------------------------------------------------------------

/// Calls are synchronous and may take seconds (compile, download).
pub trait EngineeringBackend: Send {
    fn open_project(&mut self, path: &Path, environment: &str) -> BackendResult<ProjectHandle>;

    fn create_session(&mut self, project: &ProjectHandle, safety: SafetyMode) -> BackendResult<SessionHandle>;

    fn attach_device(&mut self, session: &SessionHandle, spec: &DeviceSpec) -> BackendResult<BackendRef>;

    fn detach_device(&mut self, session: &SessionHandle, device: &BackendRef) -> BackendResult<()>;

    fn assign_network_identity(&mut self, device: &BackendRef, identity: &NetworkIdentity) -> BackendResult<()>;

    /// Empty `names` reads the whole module.
    fn read_parameters(
        &mut self,
        device: &BackendRef,
        module: &str,
        names: &[String],
        scope: ParameterScope,
    ) -> BackendResult<ParameterMap>;

    fn write_parameters(
        &mut self,
        device: &BackendRef,
        module: &str,
        values: &ParameterMap,
        scope: ParameterScope,
    ) -> BackendResult<()>;

    fn compile(&mut self, project: &ProjectHandle) -> BackendResult<CompileDiagnostics>;

    fn download(&mut self, project: &ProjectHandle, options: &DownloadOptions) -> BackendResult<()>;

    /// Returns the location of the saved snapshot.
    fn save_as(&mut self, project: &ProjectHandle, tag: &str) -> BackendResult<PathBuf>;

    fn set_run_state(&mut self, project: &ProjectHandle, running: bool) -> BackendResult<()>;

    fn close(&mut self, project: &ProjectHandle) -> BackendResult<()>;
}
