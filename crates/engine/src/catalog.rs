//! Device-description registry.
//!
//! Loads one or more device-description documents and merges their device
//! types into a single read-only [`Catalog`]. Loading collects every problem
//! across every document before failing, so one run shows the complete list.

use crate::document::{parse_document, read_document, DocumentFormat};
use crate::error::{ErrorKind, ErrorRecord, Failure, Outcome};
use crate::logging::LogSink;
use crate::model::{DataType, DeviceTemplate, ModuleTemplate};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};

/// On-disk shape of a device-description document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DescriptionDocument {
    #[serde(default)]
    pub device_types: Vec<DeviceTemplate>,
}

#[derive(Debug, Clone)]
struct CatalogEntry {
    template: DeviceTemplate,
    source: String,
}

/// Read-only catalog of device types, keyed by device-type identifier.
#[derive(Debug, Clone, Default)]
pub struct Catalog {
    entries: BTreeMap<String, CatalogEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceSummary {
    pub id: String,
    pub vendor: Option<String>,
    pub family: Option<String>,
    pub safety: bool,
    pub source: String,
    pub modules: Vec<ModuleSummary>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModuleSummary {
    pub name: String,
    pub safety: bool,
    pub parameter_count: usize,
}

impl Catalog {
    /// Load and merge device-description documents.
    pub fn load<P: AsRef<Path>>(paths: &[P], log: &dyn LogSink) -> Outcome<Catalog> {
        if paths.is_empty() {
            return Err(ErrorRecord::new(
                ErrorKind::InvalidArgument,
                "no device-description documents given",
            )
            .into());
        }

        let mut documents = Vec::new();
        let mut errors = Vec::new();
        for path in paths {
            let path = path.as_ref();
            log.debug(&format!("reading device description {}", path.display()));
            match read_document::<DescriptionDocument>(path, "device description") {
                Ok(doc) => documents.push((path.display().to_string(), doc)),
                Err(failure) => errors.extend(failure.into_errors()),
            }
        }

        let merged = Self::merge(documents);
        match merged {
            Ok(catalog) if errors.is_empty() => {
                log.info(&format!(
                    "loaded {} device type(s) from {} document(s)",
                    catalog.len(),
                    paths.len()
                ));
                Ok(catalog)
            }
            Ok(_) => Err(Self::report(errors, log)),
            Err(failure) => {
                errors.extend(failure.into_errors());
                Err(Self::report(errors, log))
            }
        }
    }

    /// Parse a single document held in memory (used for embedded descriptions).
    pub fn parse(text: &str, format: DocumentFormat, source: &str) -> Outcome<DescriptionDocument> {
        parse_document(text, format, source, "device description")
    }

    /// Merge already parsed documents, in order.
    pub fn merge(documents: Vec<(String, DescriptionDocument)>) -> Outcome<Catalog> {
        let mut catalog = Catalog::default();
        let mut errors = Vec::new();

        for (source, doc) in documents {
            for template in doc.device_types {
                if let Err(e) = validate_template(&template, &source) {
                    errors.extend(e);
                    continue;
                }
                match catalog.entries.get(&template.id) {
                    Some(existing) if existing.template == template => {
                        // Identical re-declaration, first source wins.
                    }
                    Some(existing) => {
                        errors.push(
                            ErrorRecord::new(
                                ErrorKind::DuplicateTypeError,
                                format!(
                                    "device type '{}' is declared in both {} and {} with different templates",
                                    template.id, existing.source, source
                                ),
                            )
                            .with_details(serde_json::json!({
                                "device_type": template.id,
                                "sources": [existing.source, source],
                            })),
                        );
                    }
                    None => {
                        catalog.entries.insert(
                            template.id.clone(),
                            CatalogEntry {
                                template,
                                source: source.clone(),
                            },
                        );
                    }
                }
            }
        }

        match Failure::from_records(errors) {
            Some(failure) => Err(failure),
            None => Ok(catalog),
        }
    }

    fn report(errors: Vec<ErrorRecord>, log: &dyn LogSink) -> Failure {
        for e in &errors {
            log.error(&e.to_string());
        }
        Failure::from_records(errors)
            .unwrap_or_else(|| ErrorRecord::new(ErrorKind::ParseError, "catalog load failed").into())
    }

    /// Module templates for a device type.
    pub fn describe(&self, device_type: &str) -> Outcome<&[ModuleTemplate]> {
        self.resolve(device_type).map(|t| t.modules.as_slice())
    }

    pub fn resolve(&self, device_type: &str) -> Outcome<&DeviceTemplate> {
        self.entries
            .get(device_type)
            .map(|e| &e.template)
            .ok_or_else(|| unknown_type(device_type).into())
    }

    pub fn contains(&self, device_type: &str) -> bool {
        self.entries.contains_key(device_type)
    }

    pub fn device_types(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(|k| k.as_str())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Human-oriented overview of every loaded device type.
    pub fn summary(&self) -> Vec<DeviceSummary> {
        self.entries
            .values()
            .map(|e| DeviceSummary {
                id: e.template.id.clone(),
                vendor: e.template.vendor.clone(),
                family: e.template.family.clone(),
                safety: e.template.safety,
                source: e.source.clone(),
                modules: e
                    .template
                    .modules
                    .iter()
                    .map(|m| ModuleSummary {
                        name: m.name.clone(),
                        safety: m.safety,
                        parameter_count: m.parameters.len(),
                    })
                    .collect(),
            })
            .collect()
    }

    /// Source documents, for diagnostics.
    pub fn sources(&self) -> Vec<PathBuf> {
        let mut seen = HashSet::new();
        self.entries
            .values()
            .filter(|e| seen.insert(e.source.clone()))
            .map(|e| PathBuf::from(&e.source))
            .collect()
    }
}

pub(crate) fn unknown_type(device_type: &str) -> ErrorRecord {
    ErrorRecord::new(
        ErrorKind::UnknownDeviceType,
        format!("device type '{}' is not in the catalog", device_type),
    )
    .with_details(serde_json::json!({ "device_type": device_type }))
}

fn validate_template(t: &DeviceTemplate, source: &str) -> Result<(), Vec<ErrorRecord>> {
    let mut errors = Vec::new();
    let mut bad = |msg: String| {
        errors.push(
            ErrorRecord::new(ErrorKind::ParseError, format!("{}: {}", source, msg))
                .with_details(serde_json::json!({ "path": source, "device_type": t.id })),
        )
    };

    if t.id.trim().is_empty() {
        bad("device type with empty id".into());
    }

    let mut module_names = HashSet::new();
    for m in &t.modules {
        if !module_names.insert(m.name.as_str()) {
            bad(format!("device type '{}' declares module '{}' twice", t.id, m.name));
        }
        let mut param_names = HashSet::new();
        for p in &m.parameters {
            if !param_names.insert(p.name.as_str()) {
                bad(format!(
                    "module '{}' of '{}' declares parameter '{}' twice",
                    m.name, t.id, p.name
                ));
            }
            match &p.data_type {
                DataType::Integer {
                    min: Some(min),
                    max: Some(max),
                } if min > max => {
                    bad(format!("parameter '{}' has min {} above max {}", p.name, min, max));
                    continue;
                }
                DataType::Enumeration { allowed } if allowed.is_empty() => {
                    bad(format!("parameter '{}' allows no values", p.name));
                    continue;
                }
                _ => {}
            }
            if let Err(reason) = p.data_type.check(&p.default) {
                bad(format!(
                    "default of parameter '{}' in module '{}' is invalid: {}",
                    p.name, m.name, reason
                ));
            }
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logging::{LogLevel, MemorySink, NullSink};

    const BCL: &str = r#"
device_types:
  - id: BCL248i
    vendor: Leuze electronic
    family: Barcode reader
    modules:
      - name: "[M11] Reading gate control"
        parameters:
          - name: Restart delay
            type: integer
            min: 0
            max: 9999
            default: 0
"#;

    const BCL_OTHER: &str = r#"
device_types:
  - id: BCL248i
    modules:
      - name: "[M10] Activation"
        parameters: []
"#;

    fn doc(text: &str, source: &str) -> (String, DescriptionDocument) {
        (
            source.to_string(),
            Catalog::parse(text, DocumentFormat::Yaml, source).unwrap(),
        )
    }

    #[test]
    fn test_describe_known_type() {
        let catalog = Catalog::merge(vec![doc(BCL, "a.yaml")]).unwrap();
        let modules = catalog.describe("BCL248i").unwrap();
        assert_eq!(modules.len(), 1);
        assert_eq!(modules[0].name, "[M11] Reading gate control");
        assert!(modules[0].parameter("Restart delay").is_some());
    }

    #[test]
    fn test_describe_unknown_type() {
        let catalog = Catalog::merge(vec![doc(BCL, "a.yaml")]).unwrap();
        let err = catalog.describe("BCL348i").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UnknownDeviceType);
    }

    #[test]
    fn test_conflicting_duplicate_is_reported() {
        let err = Catalog::merge(vec![doc(BCL, "a.yaml"), doc(BCL_OTHER, "b.yaml")]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::DuplicateTypeError);
        assert!(err.first().message.contains("BCL248i"));
        assert_eq!(err.first().detail("device_type"), Some("BCL248i"));
    }

    #[test]
    fn test_identical_duplicate_is_accepted() {
        let catalog = Catalog::merge(vec![doc(BCL, "a.yaml"), doc(BCL, "b.yaml")]).unwrap();
        assert_eq!(catalog.len(), 1);
        assert_eq!(catalog.summary()[0].source, "a.yaml");
    }

    #[test]
    fn test_invalid_default_is_parse_error() {
        let text = r#"
device_types:
  - id: X
    modules:
      - name: M
        parameters:
          - name: P
            type: integer
            min: 0
            max: 10
            default: 11
          - name: P
            type: boolean
            default: false
"#;
        let err = Catalog::merge(vec![doc(text, "x.yaml")]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ParseError);
        assert_eq!(err.errors().len(), 2);
    }

    #[test]
    fn test_load_reports_every_missing_file() {
        let sink = MemorySink::new();
        let err = Catalog::load(&["/nope/a.yaml", "/nope/b.yaml"], &sink).unwrap_err();
        assert_eq!(err.errors().len(), 2);
        assert!(err
            .errors()
            .iter()
            .all(|e| e.kind == ErrorKind::ResourceUnavailable));
        assert!(sink.contains(LogLevel::Error, "/nope/a.yaml"));
    }

    #[test]
    fn test_load_requires_paths() {
        let paths: [&str; 0] = [];
        let err = Catalog::load(&paths, &NullSink).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
    }

    #[test]
    fn test_load_fixture() {
        let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("fixtures/bcl248i.yaml");
        let catalog = Catalog::load(&[path], &NullSink).unwrap();
        assert!(catalog.contains("BCL248i"));
        let summary = catalog.summary();
        assert!(summary[0].modules.iter().any(|m| m.name == "[M11] Reading gate control"));
    }
}
