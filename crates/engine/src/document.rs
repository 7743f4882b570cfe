//! Reading YAML / JSON input documents into typed structures.

use crate::error::{ErrorKind, ErrorRecord, Outcome};
use serde::de::DeserializeOwned;
use std::path::Path;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocumentFormat {
    Yaml,
    Json,
}

impl DocumentFormat {
    /// `.json` files are JSON, everything else is treated as YAML.
    pub fn from_path(path: &Path) -> Self {
        match path.extension().and_then(|e| e.to_str()) {
            Some(ext) if ext.eq_ignore_ascii_case("json") => DocumentFormat::Json,
            _ => DocumentFormat::Yaml,
        }
    }
}

/// Read a document from disk. A missing file is `ResourceUnavailable`, a
/// malformed one `ParseError`.
pub fn read_document<T: DeserializeOwned>(path: &Path, what: &str) -> Outcome<T> {
    let text = std::fs::read_to_string(path).map_err(|e| {
        ErrorRecord::new(
            ErrorKind::ResourceUnavailable,
            format!("cannot read {} {}", what, path.display()),
        )
        .with_cause(e)
        .with_details(serde_json::json!({ "path": path.display().to_string() }))
    })?;
    parse_document(&text, DocumentFormat::from_path(path), &path.display().to_string(), what)
}

/// Parse document text; `source` names the input in error messages.
pub fn parse_document<T: DeserializeOwned>(
    text: &str,
    format: DocumentFormat,
    source: &str,
    what: &str,
) -> Outcome<T> {
    let parsed = match format {
        DocumentFormat::Yaml => serde_yaml::from_str(text).map_err(|e| e.to_string()),
        DocumentFormat::Json => serde_json::from_str(text).map_err(|e| e.to_string()),
    };
    parsed.map_err(|cause| {
        ErrorRecord::new(ErrorKind::ParseError, format!("malformed {} {}", what, source))
            .with_cause(cause)
            .with_details(serde_json::json!({ "path": source }))
            .into()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[test]
    fn test_format_from_extension() {
        assert_eq!(DocumentFormat::from_path(Path::new("a.JSON")), DocumentFormat::Json);
        assert_eq!(DocumentFormat::from_path(Path::new("a.yaml")), DocumentFormat::Yaml);
        assert_eq!(DocumentFormat::from_path(Path::new("a")), DocumentFormat::Yaml);
    }

    #[test]
    fn test_missing_file_is_resource_unavailable() {
        let r: Outcome<BTreeMap<String, String>> =
            read_document(Path::new("/definitely/not/here.yaml"), "topology");
        assert_eq!(r.unwrap_err().kind(), ErrorKind::ResourceUnavailable);
    }

    #[test]
    fn test_malformed_text_is_parse_error() {
        let r: Outcome<BTreeMap<String, u32>> =
            parse_document("{not json", DocumentFormat::Json, "inline", "config");
        let err = r.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ParseError);
        assert!(err.first().cause.is_some());
    }
}
