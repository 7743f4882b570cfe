//! Device and parameter model.
//!
//! Templates ([`DeviceTemplate`], [`ModuleTemplate`], [`ParameterTemplate`])
//! come from device-description documents and never change after load.
//! Instances ([`Device`], [`Module`], [`Parameter`]) are built from a template
//! by the topology importer and only their values and network identity move
//! afterwards.

use crate::error::{ErrorKind, ErrorRecord, Outcome};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::net::Ipv4Addr;
use std::sync::OnceLock;

// ===========================================================================
// Values
// ===========================================================================

/// Tagged parameter value. Never coerced between variants.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParameterValue {
    Boolean(bool),
    Integer(i64),
    Text(String),
}

impl ParameterValue {
    pub fn type_name(&self) -> &'static str {
        match self {
            ParameterValue::Boolean(_) => "boolean",
            ParameterValue::Integer(_) => "integer",
            ParameterValue::Text(_) => "string",
        }
    }
}

impl fmt::Display for ParameterValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParameterValue::Boolean(b) => write!(f, "{}", b),
            ParameterValue::Integer(i) => write!(f, "{}", i),
            ParameterValue::Text(s) => write!(f, "{:?}", s),
        }
    }
}

impl From<i64> for ParameterValue {
    fn from(v: i64) -> Self {
        ParameterValue::Integer(v)
    }
}

impl From<bool> for ParameterValue {
    fn from(v: bool) -> Self {
        ParameterValue::Boolean(v)
    }
}

impl From<&str> for ParameterValue {
    fn from(v: &str) -> Self {
        ParameterValue::Text(v.to_string())
    }
}

/// Parameter values keyed by parameter name.
pub type ParameterMap = BTreeMap<String, ParameterValue>;

// ===========================================================================
// Templates
// ===========================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DataType {
    Integer {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        min: Option<i64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        max: Option<i64>,
    },
    Boolean,
    Enumeration { allowed: Vec<String> },
}

impl DataType {
    /// Check `value` against this type. Returns the reason on rejection.
    pub fn check(&self, value: &ParameterValue) -> Result<(), String> {
        match (self, value) {
            (DataType::Integer { min, max }, ParameterValue::Integer(v)) => {
                if let Some(min) = min {
                    if v < min {
                        return Err(format!("{} is below the minimum {}", v, min));
                    }
                }
                if let Some(max) = max {
                    if v > max {
                        return Err(format!("{} is above the maximum {}", v, max));
                    }
                }
                Ok(())
            }
            (DataType::Boolean, ParameterValue::Boolean(_)) => Ok(()),
            (DataType::Enumeration { allowed }, ParameterValue::Text(s)) => {
                if allowed.iter().any(|a| a == s) {
                    Ok(())
                } else {
                    Err(format!("{:?} is not one of {:?}", s, allowed))
                }
            }
            (expected, got) => Err(format!(
                "expected {}, got {} {}",
                expected.name(),
                got.type_name(),
                got
            )),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            DataType::Integer { .. } => "integer",
            DataType::Boolean => "boolean",
            DataType::Enumeration { .. } => "enumeration",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParameterTemplate {
    pub name: String,
    #[serde(flatten)]
    pub data_type: DataType,
    pub default: ParameterValue,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl ParameterTemplate {
    /// Validate a value for this parameter, naming the parameter on failure.
    pub fn validate(&self, module: &str, value: &ParameterValue) -> Result<(), ErrorRecord> {
        self.data_type.check(value).map_err(|reason| {
            invalid_value(module, &self.name, format!("invalid value for '{}': {}", self.name, reason))
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleTemplate {
    pub name: String,
    /// Parameters of a safety module are only reachable through the safety API.
    #[serde(default)]
    pub safety: bool,
    #[serde(default)]
    pub parameters: Vec<ParameterTemplate>,
}

impl ModuleTemplate {
    pub fn parameter(&self, name: &str) -> Option<&ParameterTemplate> {
        self.parameters.iter().find(|p| p.name == name)
    }
}

/// Catalog entry for one device type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceTemplate {
    pub id: String,
    #[serde(default)]
    pub vendor: Option<String>,
    #[serde(default)]
    pub family: Option<String>,
    #[serde(default)]
    pub safety: bool,
    #[serde(default)]
    pub modules: Vec<ModuleTemplate>,
}

impl DeviceTemplate {
    pub fn module(&self, name: &str) -> Option<&ModuleTemplate> {
        self.modules.iter().find(|m| m.name == name)
    }
}

// ===========================================================================
// Instances
// ===========================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeviceId(uuid::Uuid);

impl DeviceId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }
}

impl Default for DeviceId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Opaque reference to a device inside the engineering backend.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BackendRef(pub String);

impl fmt::Display for BackendRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Placement {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subnet: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position: Option<u32>,
}

/// Validated network identity of a device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkIdentity {
    pub ip_address: Ipv4Addr,
    pub station_name: String,
}

/// Caller-supplied identity before validation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceAddress {
    #[serde(default, alias = "ipAddress")]
    pub ip_address: Option<String>,
    #[serde(default, alias = "stationName", alias = "profinetName")]
    pub station_name: Option<String>,
}

impl DeviceAddress {
    pub fn new(ip_address: impl Into<String>, station_name: impl Into<String>) -> Self {
        Self {
            ip_address: Some(ip_address.into()),
            station_name: Some(station_name.into()),
        }
    }

    /// Check both fields are present and well-formed.
    pub fn validate(&self) -> Outcome<NetworkIdentity> {
        let mut errors = Vec::new();

        let ip = match self.ip_address.as_deref().map(str::trim) {
            None | Some("") => {
                errors.push(missing_field("ipAddress"));
                None
            }
            Some(raw) => match raw.parse::<Ipv4Addr>() {
                Ok(ip) if ip.is_unspecified() || ip.is_broadcast() || ip.is_multicast() => {
                    errors.push(malformed_field("ipAddress", raw, "not a unicast host address"));
                    None
                }
                Ok(ip) => Some(ip),
                Err(e) => {
                    errors.push(malformed_field("ipAddress", raw, &e.to_string()));
                    None
                }
            },
        };

        let name = match self.station_name.as_deref().map(str::trim) {
            None | Some("") => {
                errors.push(missing_field("stationName"));
                None
            }
            Some(raw) => match check_station_name(raw) {
                Ok(()) => Some(raw.to_string()),
                Err(reason) => {
                    errors.push(malformed_field("stationName", raw, &reason));
                    None
                }
            },
        };

        match (ip, name) {
            (Some(ip_address), Some(station_name)) => Ok(NetworkIdentity {
                ip_address,
                station_name,
            }),
            _ => Err(crate::error::Failure::from_records(errors)
                .unwrap_or_else(|| missing_field("network identity").into())),
        }
    }
}

fn missing_field(field: &str) -> ErrorRecord {
    ErrorRecord::new(ErrorKind::InvalidArgument, format!("'{}' is required", field))
        .with_details(serde_json::json!({ "field": field }))
}

fn malformed_field(field: &str, raw: &str, reason: &str) -> ErrorRecord {
    ErrorRecord::new(
        ErrorKind::InvalidArgument,
        format!("'{}' value {:?} is malformed: {}", field, raw, reason),
    )
    .with_details(serde_json::json!({ "field": field, "value": raw }))
}

fn station_label_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^[a-z0-9](?:[a-z0-9-]{0,61}[a-z0-9])?$").expect("static regex is valid")
    })
}

fn port_name_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^port-\d{3}(?:-\d{5})?$").expect("static regex is valid"))
}

/// PROFINET station-name rules (DNS-style labels).
pub fn check_station_name(name: &str) -> Result<(), String> {
    if name.len() > 240 {
        return Err(format!("{} characters exceeds the limit of 240", name.len()));
    }
    if name.parse::<Ipv4Addr>().is_ok() {
        return Err("must not have the form of an IP address".into());
    }
    for label in name.split('.') {
        if label.is_empty() {
            return Err("empty label".into());
        }
        if !station_label_re().is_match(label) {
            return Err(format!(
                "label {:?} must be 1-63 lowercase letters, digits or '-', not starting or ending with '-'",
                label
            ));
        }
    }
    let first = name.split('.').next().unwrap_or_default();
    if port_name_re().is_match(first) {
        return Err("must not start with a 'port-xyz' label".into());
    }
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Parameter {
    pub template: ParameterTemplate,
    pub value: ParameterValue,
}

impl Parameter {
    pub fn name(&self) -> &str {
        &self.template.name
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Module {
    pub name: String,
    pub safety: bool,
    pub parameters: Vec<Parameter>,
}

impl Module {
    pub fn from_template(t: &ModuleTemplate) -> Self {
        Self {
            name: t.name.clone(),
            safety: t.safety,
            parameters: t
                .parameters
                .iter()
                .map(|p| Parameter {
                    template: p.clone(),
                    value: p.default.clone(),
                })
                .collect(),
        }
    }

    pub fn parameter(&self, name: &str) -> Option<&Parameter> {
        self.parameters.iter().find(|p| p.name() == name)
    }

    /// Validate every entry before anything is applied; the first invalid
    /// entry fails the whole batch.
    pub fn validate_values(&self, values: &ParameterMap) -> Outcome<()> {
        for (name, value) in values {
            let param = self.parameter(name).ok_or_else(|| {
                invalid_value(
                    &self.name,
                    name,
                    format!("module '{}' has no parameter '{}'", self.name, name),
                )
            })?;
            param.template.validate(&self.name, value)?;
        }
        Ok(())
    }

    /// Apply already validated values.
    pub fn apply(&mut self, values: &ParameterMap) {
        for p in &mut self.parameters {
            if let Some(v) = values.get(&p.template.name) {
                p.value = v.clone();
            }
        }
    }

    pub fn values(&self) -> ParameterMap {
        self.parameters
            .iter()
            .map(|p| (p.name().to_string(), p.value.clone()))
            .collect()
    }
}

pub(crate) fn invalid_value(module: &str, parameter: &str, message: String) -> ErrorRecord {
    ErrorRecord::new(ErrorKind::InvalidParameterValue, message)
        .with_details(serde_json::json!({ "module": module, "parameter": parameter }))
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Device {
    pub id: DeviceId,
    pub name: String,
    pub device_type: String,
    pub safety: bool,
    #[serde(default)]
    pub placement: Placement,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network: Option<NetworkIdentity>,
    pub modules: Vec<Module>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backend_ref: Option<BackendRef>,
}

impl Device {
    /// Build a device with default parameter values and no network identity.
    pub fn from_template(name: impl Into<String>, template: &DeviceTemplate, placement: Placement) -> Self {
        Self {
            id: DeviceId::new(),
            name: name.into(),
            device_type: template.id.clone(),
            safety: template.safety,
            placement,
            network: None,
            modules: template.modules.iter().map(Module::from_template).collect(),
            backend_ref: None,
        }
    }

    pub fn module(&self, name: &str) -> Option<&Module> {
        self.modules.iter().find(|m| m.name == name)
    }

    pub fn module_mut(&mut self, name: &str) -> Option<&mut Module> {
        self.modules.iter_mut().find(|m| m.name == name)
    }

    pub fn has_identity(&self) -> bool {
        self.network.is_some()
    }
}

// ===========================================================================
// Ordered device set
// ===========================================================================

/// Devices in topology order. Names are unique.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeviceSet {
    devices: Vec<Device>,
}

impl DeviceSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a device. Returns it back if the name is already taken.
    pub fn insert(&mut self, device: Device) -> Result<(), Device> {
        if self.contains_name(&device.name) {
            return Err(device);
        }
        self.devices.push(device);
        Ok(())
    }

    pub fn contains_name(&self, name: &str) -> bool {
        self.devices.iter().any(|d| d.name == name)
    }

    pub fn get(&self, id: DeviceId) -> Option<&Device> {
        self.devices.iter().find(|d| d.id == id)
    }

    pub fn get_mut(&mut self, id: DeviceId) -> Option<&mut Device> {
        self.devices.iter_mut().find(|d| d.id == id)
    }

    pub fn by_name(&self, name: &str) -> Option<&Device> {
        self.devices.iter().find(|d| d.name == name)
    }

    pub fn first(&self) -> Option<&Device> {
        self.devices.first()
    }

    pub fn last(&self) -> Option<&Device> {
        self.devices.last()
    }

    pub fn remove(&mut self, id: DeviceId) -> Option<Device> {
        let pos = self.devices.iter().position(|d| d.id == id)?;
        Some(self.devices.remove(pos))
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Device> {
        self.devices.iter()
    }

    pub fn names(&self) -> Vec<&str> {
        self.devices.iter().map(|d| d.name.as_str()).collect()
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }
}

impl IntoIterator for DeviceSet {
    type Item = Device;
    type IntoIter = std::vec::IntoIter<Device>;

    fn into_iter(self) -> Self::IntoIter {
        self.devices.into_iter()
    }
}

impl<'a> IntoIterator for &'a DeviceSet {
    type Item = &'a Device;
    type IntoIter = std::slice::Iter<'a, Device>;

    fn into_iter(self) -> Self::IntoIter {
        self.devices.iter()
    }
}
