use crate::error::{ErrorRecord, Outcome};
use crate::model::{DeviceId, ParameterMap};
use crate::session::{CommissioningSession, Operation};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

// ---------------------------------------------------------------------------
// Step report – the stable output contract
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepReport {
    pub run_id: String,
    pub index: usize,
    pub op: String,
    /// Device, file or tag the step acted on; empty when not applicable.
    #[serde(default)]
    pub target: String,
    pub status: Status,
    pub expected: Status,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<ErrorRecord>,
    pub timing_ms: u64,
    /// Step-specific payload returned on success.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

impl StepReport {
    pub fn matched(&self) -> bool {
        self.status == self.expected
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    Pass,
    Fail,
    Skip,
    Error,
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Status::Pass => "PASS",
            Status::Fail => "FAIL",
            Status::Skip => "SKIP",
            Status::Error => "ERROR",
        };
        f.write_str(s)
    }
}

// ---------------------------------------------------------------------------
// Scenario types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Scenario {
    #[serde(default)]
    pub name: Option<String>,
    pub steps: Vec<ScenarioStep>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScenarioStep {
    #[serde(flatten)]
    pub op: WorkflowOp,
    #[serde(default = "default_expect")]
    pub expect: Status,
}

fn default_expect() -> Status {
    Status::Pass
}

fn default_true() -> bool {
    true
}

/// One commissioning action. Relative paths are resolved against the
/// directory of the scenario file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum WorkflowOp {
    /// Load device descriptions and report what they contain.
    Describe { descriptions: Vec<PathBuf> },
    /// Either `config` (a project configuration file) or both inline fields.
    Configure {
        #[serde(default)]
        config: Option<PathBuf>,
        #[serde(default, alias = "projectPath")]
        project_path: Option<PathBuf>,
        #[serde(default, alias = "networkCard")]
        network_card: Option<String>,
    },
    Initialize {
        #[serde(default)]
        safety: bool,
    },
    ImportDevices {
        topology: PathBuf,
        descriptions: Vec<PathBuf>,
    },
    ConfigureDevice {
        device: DeviceSelector,
        #[serde(default, alias = "ipAddress")]
        ip_address: Option<String>,
        #[serde(default, alias = "stationName", alias = "profinetName")]
        station_name: Option<String>,
    },
    GetParameters {
        device: DeviceSelector,
        module: String,
        #[serde(default)]
        names: Option<Vec<String>>,
        #[serde(default)]
        safety: bool,
    },
    SetParameters {
        device: DeviceSelector,
        module: String,
        values: ParameterMap,
        #[serde(default)]
        safety: bool,
    },
    DeleteDevice { device: DeviceSelector },
    Compile,
    Download {
        #[serde(default = "default_true")]
        hardware: bool,
        #[serde(default = "default_true")]
        software: bool,
        #[serde(default)]
        safety: bool,
    },
    SaveProjectAs { tag: String },
    Start,
    Stop,
    /// Wait for the operator; the hook decides whether to continue.
    Pause {
        #[serde(default)]
        message: Option<String>,
    },
}

impl WorkflowOp {
    pub fn name(&self) -> &'static str {
        match self {
            WorkflowOp::Describe { .. } => "describe",
            WorkflowOp::Configure { .. } => "configure",
            WorkflowOp::Initialize { .. } => "initialize",
            WorkflowOp::ImportDevices { .. } => "import_devices",
            WorkflowOp::ConfigureDevice { .. } => "configure_device",
            WorkflowOp::GetParameters { .. } => "get_parameters",
            WorkflowOp::SetParameters { .. } => "set_parameters",
            WorkflowOp::DeleteDevice { .. } => "delete_device",
            WorkflowOp::Compile => "compile",
            WorkflowOp::Download { .. } => "download",
            WorkflowOp::SaveProjectAs { .. } => "save_project_as",
            WorkflowOp::Start => "start",
            WorkflowOp::Stop => "stop",
            WorkflowOp::Pause { .. } => "pause",
        }
    }
}

/// `"@first"`, `"@last"` or a device name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum DeviceSelector {
    First,
    Last,
    Named(String),
}

impl From<String> for DeviceSelector {
    fn from(s: String) -> Self {
        match s.as_str() {
            "@first" => DeviceSelector::First,
            "@last" => DeviceSelector::Last,
            _ => DeviceSelector::Named(s),
        }
    }
}

impl From<DeviceSelector> for String {
    fn from(s: DeviceSelector) -> Self {
        s.to_string()
    }
}

impl std::fmt::Display for DeviceSelector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeviceSelector::First => f.write_str("@first"),
            DeviceSelector::Last => f.write_str("@last"),
            DeviceSelector::Named(n) => f.write_str(n),
        }
    }
}

impl DeviceSelector {
    pub fn resolve(&self, session: &CommissioningSession, op: Operation) -> Outcome<DeviceId> {
        session.ensure_permitted(op)?;
        let device = match self {
            DeviceSelector::First => session.first_device()?,
            DeviceSelector::Last => session.last_device()?,
            DeviceSelector::Named(name) => session.device_by_name(name)?,
        };
        Ok(device.id)
    }
}

// ---------------------------------------------------------------------------
// Scenario result
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScenarioResult {
    pub run_id: String,
    pub name: Option<String>,
    pub overall_status: Status,
    pub step_results: Vec<StepReport>,
    /// Errors raised while disposing the session after the last step.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub teardown_errors: Vec<ErrorRecord>,
    pub timing_ms: u64,
}

impl ScenarioResult {
    /// First step whose status differed from its expectation.
    pub fn halted_at(&self) -> Option<&StepReport> {
        self.step_results
            .iter()
            .find(|r| r.status != Status::Skip && !r.matched())
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Generate a new run ID (UUIDv4).
pub fn new_run_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Build the report for a finished step.
pub fn step_report(
    run_id: &str,
    index: usize,
    op: &str,
    target: &str,
    expected: Status,
    outcome: Outcome<Option<serde_json::Value>>,
    timing_ms: u64,
) -> StepReport {
    let (status, errors, data) = match outcome {
        Ok(data) => (Status::Pass, vec![], data),
        Err(failure) => (Status::Error, failure.into_errors(), None),
    };
    StepReport {
        run_id: run_id.to_string(),
        index,
        op: op.to_string(),
        target: target.to_string(),
        status,
        expected,
        errors,
        timing_ms,
        data,
    }
}

/// Build the report for a step that never ran.
pub fn step_skipped(run_id: &str, index: usize, op: &str, expected: Status) -> StepReport {
    StepReport {
        run_id: run_id.to_string(),
        index,
        op: op.to_string(),
        target: String::new(),
        status: Status::Skip,
        expected,
        errors: vec![],
        timing_ms: 0,
        data: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn test_selector_from_string() {
        assert_eq!(DeviceSelector::from("@first".to_string()), DeviceSelector::First);
        assert_eq!(DeviceSelector::from("@last".to_string()), DeviceSelector::Last);
        assert_eq!(
            DeviceSelector::from("dut".to_string()),
            DeviceSelector::Named("dut".into())
        );
        assert_eq!(DeviceSelector::Last.to_string(), "@last");
    }

    #[test]
    fn test_step_parses_flattened_op() {
        let step: ScenarioStep = serde_yaml::from_str(
            "op: set_parameters\ndevice: \"@first\"\nmodule: M\nvalues: {Restart delay: 5}\nexpect: error\n",
        )
        .unwrap();
        assert_eq!(step.expect, Status::Error);
        match step.op {
            WorkflowOp::SetParameters { device, values, safety, .. } => {
                assert_eq!(device, DeviceSelector::First);
                assert_eq!(values.len(), 1);
                assert!(!safety);
            }
            other => panic!("unexpected op {:?}", other),
        }
    }

    #[test]
    fn test_download_defaults_to_hw_and_sw() {
        let step: ScenarioStep = serde_yaml::from_str("op: download\n").unwrap();
        assert_eq!(step.expect, Status::Pass);
        match step.op {
            WorkflowOp::Download { hardware, software, safety } => {
                assert!(hardware && software && !safety);
            }
            other => panic!("unexpected op {:?}", other),
        }
    }

    #[test]
    fn test_step_report_status() {
        let ok = step_report("r", 0, "compile", "", Status::Pass, Ok(None), 3);
        assert!(ok.matched());

        let err = step_report(
            "r",
            1,
            "compile",
            "",
            Status::Pass,
            Err(ErrorRecord::new(ErrorKind::CompileError, "2 errors").into()),
            3,
        );
        assert_eq!(err.status, Status::Error);
        assert!(!err.matched());
        assert_eq!(err.errors[0].kind, ErrorKind::CompileError);
    }
}
