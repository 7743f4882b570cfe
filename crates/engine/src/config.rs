//! Project configuration – which project to open and on which adapter.

use crate::document::{read_document, DocumentFormat};
use crate::error::{ErrorKind, ErrorRecord, Outcome};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Key-value document consumed by `configure`.
///
/// ```json
/// { "projectPath": "Blank_project.zap17", "networkCard": "Realtek USB GbE Family Controller" }
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectConfig {
    #[serde(alias = "project_path")]
    pub project_path: PathBuf,
    /// Environment selector handed to the backend (network interface name).
    #[serde(alias = "network_card")]
    pub network_card: String,
}

impl ProjectConfig {
    pub fn new(project_path: impl Into<PathBuf>, network_card: impl Into<String>) -> Self {
        Self {
            project_path: project_path.into(),
            network_card: network_card.into(),
        }
    }

    /// Load from a JSON (or YAML) file. A relative `projectPath` is resolved
    /// against the file's directory.
    pub fn load(path: &Path) -> Outcome<Self> {
        let mut cfg: ProjectConfig = read_document(path, "project configuration")?;
        if cfg.project_path.is_relative() {
            if let Some(dir) = path.parent() {
                cfg.project_path = dir.join(&cfg.project_path);
            }
        }
        Ok(cfg)
    }

    pub fn save(&self, path: &Path) -> Outcome<()> {
        let text = match DocumentFormat::from_path(path) {
            DocumentFormat::Json => serde_json::to_string_pretty(self).map_err(|e| e.to_string()),
            DocumentFormat::Yaml => serde_yaml::to_string(self).map_err(|e| e.to_string()),
        }
        .map_err(|cause| {
            ErrorRecord::new(ErrorKind::InvalidArgument, "cannot serialise project configuration")
                .with_cause(cause)
        })?;
        std::fs::write(path, text).map_err(|e| {
            ErrorRecord::new(
                ErrorKind::ResourceUnavailable,
                format!("cannot write project configuration {}", path.display()),
            )
            .with_cause(e)
            .into()
        })
    }

    /// Both fields must be non-empty.
    pub fn validate(&self) -> Outcome<()> {
        if self.project_path.as_os_str().is_empty() {
            return Err(ErrorRecord::new(ErrorKind::InvalidArgument, "'projectPath' is required")
                .with_details(serde_json::json!({ "field": "projectPath" }))
                .into());
        }
        if self.network_card.trim().is_empty() {
            return Err(ErrorRecord::new(ErrorKind::InvalidArgument, "'networkCard' is required")
                .with_details(serde_json::json!({ "field": "networkCard" }))
                .into());
        }
        Ok(())
    }
}
