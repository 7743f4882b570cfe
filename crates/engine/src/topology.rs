//! Topology importer – turns a plant topology document into devices.

use crate::catalog::{unknown_type, Catalog};
use crate::document::read_document;
use crate::error::{ErrorKind, ErrorRecord, Failure, Outcome};
use crate::logging::LogSink;
use crate::model::{Device, DeviceSet, Placement};
use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TopologyDocument {
    #[serde(default)]
    pub project: Option<String>,
    #[serde(default)]
    pub devices: Vec<TopologyEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TopologyEntry {
    pub name: String,
    #[serde(rename = "type")]
    pub device_type: String,
    #[serde(flatten)]
    pub placement: Placement,
}

/// An entry whose device type is not in the catalog.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnresolvedEntry {
    pub name: String,
    pub device_type: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TopologyImport {
    pub project: Option<String>,
    /// Resolved devices in document order.
    pub devices: DeviceSet,
    pub unresolved: Vec<UnresolvedEntry>,
}

/// Read a topology file and resolve it against `catalog`.
pub fn import(path: &Path, catalog: &Catalog, log: &dyn LogSink) -> Outcome<TopologyImport> {
    log.debug(&format!("reading topology {}", path.display()));
    let doc: TopologyDocument = read_document(path, "topology")?;
    resolve(doc, catalog, log)
}

/// Resolve every entry of a parsed topology.
///
/// Unresolved entries never abort the import while at least one entry
/// resolves; they are listed in [`TopologyImport::unresolved`]. If nothing
/// resolves, every entry is reported as `UnknownDeviceType`.
pub fn resolve(doc: TopologyDocument, catalog: &Catalog, log: &dyn LogSink) -> Outcome<TopologyImport> {
    if doc.devices.is_empty() {
        return Err(ErrorRecord::new(ErrorKind::ParseError, "topology declares no devices").into());
    }

    let mut devices = DeviceSet::new();
    let mut unresolved = Vec::new();
    let mut errors = Vec::new();

    for entry in doc.devices {
        if entry.name.trim().is_empty() {
            errors.push(ErrorRecord::new(
                ErrorKind::ParseError,
                format!("topology entry of type '{}' has no name", entry.device_type),
            ));
            continue;
        }
        if devices.contains_name(&entry.name) || unresolved.iter().any(|u: &UnresolvedEntry| u.name == entry.name) {
            errors.push(
                ErrorRecord::new(
                    ErrorKind::ParseError,
                    format!("device name '{}' appears more than once", entry.name),
                )
                .with_details(serde_json::json!({ "device": entry.name })),
            );
            continue;
        }

        match catalog.resolve(&entry.device_type) {
            Ok(template) => {
                let device = Device::from_template(&entry.name, template, entry.placement);
                log.trace(&format!("resolved '{}' as {}", device.name, device.device_type));
                // Uniqueness checked above.
                let _ = devices.insert(device);
            }
            Err(_) => {
                log.warn(&format!(
                    "device '{}' has unknown type '{}'",
                    entry.name, entry.device_type
                ));
                unresolved.push(UnresolvedEntry {
                    name: entry.name,
                    device_type: entry.device_type,
                });
            }
        }
    }

    if let Some(failure) = Failure::from_records(errors) {
        return Err(failure);
    }

    if devices.is_empty() {
        let records = unresolved
            .iter()
            .map(unresolved_record)
            .collect::<Vec<_>>();
        return Err(Failure::from_records(records)
            .unwrap_or_else(|| ErrorRecord::new(ErrorKind::ParseError, "topology declares no devices").into()));
    }

    log.info(&format!(
        "topology resolved {} device(s), {} unresolved",
        devices.len(),
        unresolved.len()
    ));

    Ok(TopologyImport {
        project: doc.project,
        devices,
        unresolved,
    })
}

pub(crate) fn unresolved_record(u: &UnresolvedEntry) -> ErrorRecord {
    let mut r = unknown_type(&u.device_type);
    r.message = format!("device '{}': {}", u.name, r.message);
    r.details = serde_json::json!({ "device": u.name, "device_type": u.device_type });
    r
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logging::NullSink;
    use std::path::PathBuf;

    fn fixture(name: &str) -> PathBuf {
        Path::new(env!("CARGO_MANIFEST_DIR")).join("fixtures").join(name)
    }

    fn catalog() -> Catalog {
        Catalog::load(&[fixture("bcl248i.yaml"), fixture("safety_io.yaml")], &NullSink).unwrap()
    }

    #[test]
    fn test_import_sample_topology() {
        let import = import(&fixture("sample_topology.yaml"), &catalog(), &NullSink).unwrap();
        assert_eq!(import.devices.names(), vec!["dut", "safety-in"]);
        assert!(import.unresolved.is_empty());

        let dut = import.devices.first().unwrap();
        assert!(dut.network.is_none());
        assert_eq!(dut.placement.position, Some(1));
        let gate = dut.module("[M11] Reading gate control").unwrap();
        assert_eq!(
            gate.parameter("Restart delay").unwrap().value,
            crate::model::ParameterValue::Integer(0)
        );
        assert!(import.devices.last().unwrap().safety);
    }

    #[test]
    fn test_partial_resolution_lists_unresolved() {
        let import = import(&fixture("mixed_topology.yaml"), &catalog(), &NullSink).unwrap();
        assert_eq!(import.devices.names(), vec!["reader-a", "reader-b"]);
        let names: Vec<_> = import.unresolved.iter().map(|u| u.name.as_str()).collect();
        assert_eq!(names, vec!["ghost-1", "ghost-2"]);
    }

    #[test]
    fn test_nothing_resolves() {
        let doc: TopologyDocument = serde_yaml::from_str(
            "devices:\n  - {name: a, type: NOPE}\n  - {name: b, type: NADA}\n",
        )
        .unwrap();
        let err = resolve(doc, &catalog(), &NullSink).unwrap_err();
        assert_eq!(err.errors().len(), 2);
        assert!(err
            .errors()
            .iter()
            .all(|e| e.kind == ErrorKind::UnknownDeviceType));
        assert_eq!(err.errors()[1].detail("device"), Some("b"));
    }

    #[test]
    fn test_duplicate_names_rejected() {
        let doc: TopologyDocument = serde_yaml::from_str(
            "devices:\n  - {name: a, type: BCL248i}\n  - {name: a, type: BCL248i}\n",
        )
        .unwrap();
        let err = resolve(doc, &catalog(), &NullSink).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ParseError);
    }

    #[test]
    fn test_empty_topology_rejected() {
        let doc: TopologyDocument = serde_yaml::from_str("devices: []\n").unwrap();
        let err = resolve(doc, &catalog(), &NullSink).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ParseError);
    }
}
