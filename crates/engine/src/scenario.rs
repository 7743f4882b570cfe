//! Scenario runner – execute scripted commissioning flows from YAML files.

use crate::backend::{DownloadOptions, SafetyMode};
use crate::catalog::Catalog;
use crate::config::ProjectConfig;
use crate::document::{parse_document, read_document, DocumentFormat};
use crate::error::{ErrorKind, ErrorRecord, Outcome};
use crate::model::DeviceAddress;
use crate::session::{CommissioningSession, Operation};
use crate::types::*;
use serde::Serialize;
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::time::Instant;

/// Interaction points a host can provide while a scenario runs.
pub trait WorkflowHooks {
    /// Called for `pause` steps. Returning `false` aborts the run.
    fn pause(&self, message: &str) -> bool;
}

/// Never blocks; every pause continues immediately.
pub struct NonInteractive;

impl WorkflowHooks for NonInteractive {
    fn pause(&self, _message: &str) -> bool {
        true
    }
}

/// Load a scenario from a YAML string.
pub fn load_scenario(yaml: &str) -> Outcome<Scenario> {
    parse_document(yaml, DocumentFormat::Yaml, "<inline>", "scenario")
}

/// Load a scenario file (YAML, or JSON by extension).
pub fn load_scenario_file(path: &Path) -> Outcome<Scenario> {
    read_document(path, "scenario")
}

/// Execute every step against `session`, halting at the first step whose
/// status differs from its `expect`. The session is disposed afterwards
/// whatever happened. Relative paths resolve against `base_dir`.
pub fn run_scenario(
    scenario: &Scenario,
    base_dir: &Path,
    session: &mut CommissioningSession,
    hooks: &dyn WorkflowHooks,
) -> ScenarioResult {
    let run_id = new_run_id();
    let started = Instant::now();
    let mut step_results = Vec::new();
    let mut overall = Status::Pass;

    for (i, step) in scenario.steps.iter().enumerate() {
        let op = step.op.name();
        if overall != Status::Pass {
            step_results.push(step_skipped(&run_id, i, op, step.expect));
            continue;
        }

        let start = Instant::now();
        let report = match &step.op {
            WorkflowOp::Pause { message } => {
                let message = message.as_deref().unwrap_or("press enter to continue");
                session.log_sink().info(&format!("step {}: pause: {}", i, message));
                let status = if hooks.pause(message) {
                    Status::Pass
                } else {
                    Status::Fail
                };
                StepReport {
                    run_id: run_id.clone(),
                    index: i,
                    op: op.to_string(),
                    target: String::new(),
                    status,
                    expected: step.expect,
                    errors: vec![],
                    timing_ms: start.elapsed().as_millis() as u64,
                    data: None,
                }
            }
            other => {
                let (target, outcome) = execute(other, base_dir, session);
                step_report(
                    &run_id,
                    i,
                    op,
                    &target,
                    step.expect,
                    outcome,
                    start.elapsed().as_millis() as u64,
                )
            }
        };

        if !report.matched() {
            let cause = report.errors.first().map(|e| e.to_string()).unwrap_or_default();
            session.log_sink().warn(&format!(
                "step {} ({}): expected {}, got {} {}",
                i, op, report.expected, report.status, cause
            ));
            overall = Status::Fail;
        }
        step_results.push(report);
    }

    let teardown_errors = match session.dispose() {
        Ok(()) => vec![],
        Err(failure) => {
            if overall == Status::Pass {
                overall = Status::Error;
            }
            failure.into_errors()
        }
    };

    ScenarioResult {
        run_id,
        name: scenario.name.clone(),
        overall_status: overall,
        step_results,
        teardown_errors,
        timing_ms: started.elapsed().as_millis() as u64,
    }
}

fn execute(
    op: &WorkflowOp,
    base: &Path,
    session: &mut CommissioningSession,
) -> (String, Outcome<Option<Value>>) {
    match op {
        WorkflowOp::Describe { descriptions } => {
            let paths = resolve_all(base, descriptions);
            let outcome = Catalog::load(&paths, session.log_sink().as_ref())
                .map(|catalog| payload(&catalog.summary()));
            (join_names(descriptions), outcome)
        }
        WorkflowOp::Configure {
            config,
            project_path,
            network_card,
        } => match (config, project_path, network_card) {
            (Some(file), _, _) => {
                let path = resolve(base, file);
                let outcome = session.configure_from_file(&path).map(|()| None);
                (file.display().to_string(), outcome)
            }
            (None, Some(project), Some(card)) => {
                let cfg = ProjectConfig::new(resolve(base, project), card.clone());
                (project.display().to_string(), session.configure(&cfg).map(|()| None))
            }
            _ => (
                String::new(),
                Err(ErrorRecord::new(
                    ErrorKind::InvalidArgument,
                    "configure needs 'config' or both 'project_path' and 'network_card'",
                )
                .into()),
            ),
        },
        WorkflowOp::Initialize { safety } => {
            let mode = SafetyMode::from_flag(*safety);
            (String::new(), session.initialize(mode).map(|()| None))
        }
        WorkflowOp::ImportDevices {
            topology,
            descriptions,
        } => {
            let paths = resolve_all(base, descriptions);
            let outcome = session
                .import_devices(&resolve(base, topology), &paths)
                .map(|report| {
                    Some(serde_json::json!({
                        "devices": report.devices.names(),
                        "unresolved": report.unresolved,
                    }))
                });
            (topology.display().to_string(), outcome)
        }
        WorkflowOp::ConfigureDevice {
            device,
            ip_address,
            station_name,
        } => {
            let address = DeviceAddress {
                ip_address: ip_address.clone(),
                station_name: station_name.clone(),
            };
            let outcome = device
                .resolve(session, Operation::ConfigureDevice)
                .and_then(|id| session.configure_device(id, &address))
                .map(|()| None);
            (device.to_string(), outcome)
        }
        WorkflowOp::GetParameters {
            device,
            module,
            names,
            safety,
        } => {
            let names: Option<Vec<&str>> = names
                .as_ref()
                .map(|n| n.iter().map(String::as_str).collect());
            let outcome = device.resolve(session, Operation::GetDeviceParameters).and_then(|id| {
                if *safety {
                    session.get_safety_parameters(id, module, names.as_deref())
                } else {
                    session.get_device_parameters(id, module, names.as_deref())
                }
            });
            (device.to_string(), outcome.map(|values| payload(&values)))
        }
        WorkflowOp::SetParameters {
            device,
            module,
            values,
            safety,
        } => {
            let outcome = device.resolve(session, Operation::SetDeviceParameters).and_then(|id| {
                if *safety {
                    session.set_safety_parameters(id, module, values)
                } else {
                    session.set_device_parameters(id, module, values)
                }
            });
            (device.to_string(), outcome.map(|()| None))
        }
        WorkflowOp::DeleteDevice { device } => {
            let outcome = device
                .resolve(session, Operation::DeleteDevice)
                .and_then(|id| session.delete_device(id))
                .map(|()| None);
            (device.to_string(), outcome)
        }
        WorkflowOp::Compile => (
            String::new(),
            session.compile().map(|diagnostics| payload(&diagnostics)),
        ),
        WorkflowOp::Download {
            hardware,
            software,
            safety,
        } => {
            let options = DownloadOptions {
                hardware: *hardware,
                software: *software,
                safety: *safety,
            };
            (String::new(), session.download(options).map(|()| None))
        }
        WorkflowOp::SaveProjectAs { tag } => {
            let outcome = session
                .save_project_as(tag)
                .map(|path| Some(serde_json::json!({ "path": path })));
            (tag.clone(), outcome)
        }
        WorkflowOp::Start => (String::new(), session.start().map(|()| None)),
        WorkflowOp::Stop => (String::new(), session.stop().map(|()| None)),
        WorkflowOp::Pause { .. } => (String::new(), Ok(None)),
    }
}

fn payload<T: Serialize>(value: &T) -> Option<Value> {
    serde_json::to_value(value).ok()
}

fn resolve(base: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}

fn resolve_all(base: &Path, paths: &[PathBuf]) -> Vec<PathBuf> {
    paths.iter().map(|p| resolve(base, p)).collect()
}

fn join_names(paths: &[PathBuf]) -> String {
    paths
        .iter()
        .map(|p| p.display().to_string())
        .collect::<Vec<_>>()
        .join(",")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logging::{LogLevel, MemorySink};
    use crate::simulated::{BackendOp, SimulatedBackend};
    use std::cell::Cell;
    use std::sync::Arc;

    fn fixtures() -> PathBuf {
        Path::new(env!("CARGO_MANIFEST_DIR")).join("fixtures")
    }

    fn session(backend: &SimulatedBackend) -> CommissioningSession {
        CommissioningSession::new(Box::new(backend.clone()), Arc::new(MemorySink::default()))
    }

    struct Abort(Cell<usize>);

    impl WorkflowHooks for Abort {
        fn pause(&self, _message: &str) -> bool {
            self.0.set(self.0.get() + 1);
            false
        }
    }

    #[test]
    fn test_parse_scenario() {
        let yaml = r#"
name: basic test
steps:
  - op: configure
    project_path: line4.zap17
    network_card: eth0
  - op: initialize
  - op: compile
    expect: error
"#;
        let s = load_scenario(yaml).expect("should parse");
        assert_eq!(s.name, Some("basic test".into()));
        assert_eq!(s.steps.len(), 3);
        assert_eq!(s.steps[2].expect, Status::Error);
    }

    #[test]
    fn test_unknown_op_is_parse_error() {
        let err = load_scenario("steps:\n  - op: reboot\n").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ParseError);
    }

    #[test]
    fn test_run_commission_fixture() {
        let path = fixtures().join("commission.yaml");
        let scenario = load_scenario_file(&path).unwrap();
        let backend = SimulatedBackend::new();
        let mut s = session(&backend);

        let result = run_scenario(&scenario, &fixtures(), &mut s, &NonInteractive);
        assert_eq!(result.overall_status, Status::Pass, "{:#?}", result.halted_at());
        assert_eq!(result.step_results.len(), scenario.steps.len());

        let rejected = &result.step_results[8];
        assert_eq!(rejected.status, Status::Error);
        assert_eq!(rejected.errors[0].kind, ErrorKind::InvalidParameterValue);

        let read_back = result.step_results[9].data.as_ref().unwrap();
        assert_eq!(read_back["Restart delay"], 333);

        let saved = result.step_results.last().unwrap().data.as_ref().unwrap();
        assert!(saved["path"].as_str().unwrap().contains("V111"));

        assert!(s.is_disposed());
        assert_eq!(backend.open_projects(), 0);
    }

    #[test]
    fn test_halts_at_first_mismatch() {
        let yaml = r#"
steps:
  - op: configure
    project_path: line4.zap17
    network_card: eth0
  - op: compile
  - op: initialize
"#;
        let scenario = load_scenario(yaml).unwrap();
        let backend = SimulatedBackend::new();
        let mut s = session(&backend);
        let result = run_scenario(&scenario, &fixtures(), &mut s, &NonInteractive);

        assert_eq!(result.overall_status, Status::Fail);
        let halted = result.halted_at().unwrap();
        assert_eq!(halted.index, 1);
        assert_eq!(halted.errors[0].kind, ErrorKind::StageViolation);
        assert_eq!(result.step_results[2].status, Status::Skip);
        assert_eq!(backend.count(BackendOp::CreateSession), 0);
        assert_eq!(backend.count(BackendOp::Close), 1);
    }

    #[test]
    fn test_pause_abort_fails_run() {
        let yaml = r#"
steps:
  - op: pause
    message: swap the reader
  - op: configure
    project_path: line4.zap17
    network_card: eth0
"#;
        let scenario = load_scenario(yaml).unwrap();
        let backend = SimulatedBackend::new();
        let mut s = session(&backend);
        let hooks = Abort(Cell::new(0));
        let result = run_scenario(&scenario, &fixtures(), &mut s, &hooks);

        assert_eq!(hooks.0.get(), 1);
        assert_eq!(result.overall_status, Status::Fail);
        assert_eq!(result.step_results[0].status, Status::Fail);
        assert_eq!(result.step_results[1].status, Status::Skip);
        assert_eq!(backend.count(BackendOp::OpenProject), 0);
    }

    #[test]
    fn test_device_step_before_import_is_stage_violation() {
        let yaml = r#"
steps:
  - op: configure
    project_path: line4.zap17
    network_card: eth0
  - op: configure_device
    device: dut
    ip_address: 192.168.60.100
    station_name: dut
  - op: get_parameters
    device: "@first"
    module: "[M11] Reading gate control"
    expect: error
"#;
        let scenario = load_scenario(yaml).unwrap();
        let backend = SimulatedBackend::new();
        let sink = Arc::new(MemorySink::new());
        let mut s = CommissioningSession::new(Box::new(backend.clone()), sink.clone());
        let result = run_scenario(&scenario, &fixtures(), &mut s, &NonInteractive);

        assert_eq!(result.overall_status, Status::Fail);
        let halted = result.halted_at().unwrap();
        assert_eq!(halted.index, 1);
        assert_eq!(halted.errors[0].kind, ErrorKind::StageViolation);
        assert_eq!(result.step_results[2].status, Status::Skip);
        assert_eq!(backend.count(BackendOp::AssignNetworkIdentity), 0);
        assert!(sink.contains(LogLevel::Warning, "step 1 (configure_device)"));
    }

    #[test]
    fn test_configure_without_inputs() {
        let scenario = load_scenario("steps:\n  - op: configure\n    expect: error\n").unwrap();
        let backend = SimulatedBackend::new();
        let mut s = session(&backend);
        let result = run_scenario(&scenario, &fixtures(), &mut s, &NonInteractive);
        assert_eq!(result.overall_status, Status::Pass);
        assert_eq!(
            result.step_results[0].errors[0].kind,
            ErrorKind::InvalidArgument
        );
    }
}
