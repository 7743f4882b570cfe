//! In-memory engineering backend.
//!
//! Behaves like a well-mannered vendor driver without touching any real
//! tooling: projects, sessions and devices live in a shared state that tests
//! (and the CLI's dry runs) can inspect through a cloned handle.
//!
//! - every call is appended to a journal ([`SimulatedBackend::journal`])
//! - faults can be injected per operation, once or permanently
//! - attach can be refused for given device names
//! - compile returns whatever diagnostics were configured
//! - [`SimulatedBackend::panic_on`] makes an operation panic mid-call

use crate::backend::*;
use crate::model::{BackendRef, NetworkIdentity, ParameterMap};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendOp {
    OpenProject,
    CreateSession,
    AttachDevice,
    DetachDevice,
    AssignNetworkIdentity,
    ReadParameters,
    WriteParameters,
    Compile,
    Download,
    SaveAs,
    SetRunState,
    Close,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackendCall {
    pub op: BackendOp,
    pub target: String,
}

#[derive(Debug, Clone)]
struct InjectedFault {
    code: String,
    message: String,
    once: bool,
}

#[derive(Debug)]
struct SimProject {
    path: PathBuf,
    environment: String,
    open: bool,
    compiled: bool,
    running: bool,
    downloads: Vec<DownloadOptions>,
    snapshots: Vec<PathBuf>,
}

#[derive(Debug)]
struct SimDevice {
    session: String,
    spec: DeviceSpec,
    identity: Option<NetworkIdentity>,
    values: BTreeMap<String, ParameterMap>,
}

#[derive(Debug, Default)]
struct SimState {
    journal: Vec<BackendCall>,
    next_id: u64,
    projects: HashMap<String, SimProject>,
    sessions: HashMap<String, (String, SafetyMode)>,
    devices: HashMap<String, SimDevice>,
    faults: HashMap<BackendOp, InjectedFault>,
    rejected: HashSet<String>,
    diagnostics: CompileDiagnostics,
    panic_on: Option<BackendOp>,
}

impl SimState {
    fn next(&mut self, prefix: &str) -> String {
        self.next_id += 1;
        format!("{}-{}", prefix, self.next_id)
    }

    fn take_fault(&mut self, op: BackendOp) -> Option<BackendError> {
        let fault = self.faults.get(&op)?.clone();
        if fault.once {
            self.faults.remove(&op);
        }
        Some(BackendError::fault(fault.code, fault.message))
    }

    fn project_mut(&mut self, handle: &ProjectHandle) -> BackendResult<&mut SimProject> {
        self.projects
            .get_mut(&handle.0)
            .filter(|p| p.open)
            .ok_or_else(|| BackendError::NotFound(format!("project {}", handle)))
    }

    fn device_mut(&mut self, device: &BackendRef) -> BackendResult<&mut SimDevice> {
        self.devices
            .get_mut(&device.0)
            .ok_or_else(|| BackendError::NotFound(format!("device {}", device)))
    }

    fn mark_modified(&mut self, session: &str) {
        if let Some((project, _)) = self.sessions.get(session).cloned() {
            if let Some(p) = self.projects.get_mut(&project) {
                p.compiled = false;
            }
        }
    }
}

/// Cloning shares the underlying state.
#[derive(Debug, Clone, Default)]
pub struct SimulatedBackend {
    state: Arc<Mutex<SimState>>,
}

impl SimulatedBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Record the call and apply injected behaviour.
    fn enter(&self, op: BackendOp, target: impl Into<String>) -> BackendResult<MutexGuard<'_, SimState>> {
        let mut state = self.lock();
        state.journal.push(BackendCall {
            op,
            target: target.into(),
        });
        if state.panic_on == Some(op) {
            drop(state);
            panic!("simulated backend crashed during {:?}", op);
        }
        if let Some(err) = state.take_fault(op) {
            return Err(err);
        }
        Ok(state)
    }

    // -- fault injection ---------------------------------------------------

    /// Fail every call of `op` until cleared.
    pub fn fail_on(&self, op: BackendOp, code: &str, message: &str) {
        self.inject(op, code, message, false);
    }

    /// Fail the next call of `op` only.
    pub fn fail_once(&self, op: BackendOp, code: &str, message: &str) {
        self.inject(op, code, message, true);
    }

    fn inject(&self, op: BackendOp, code: &str, message: &str, once: bool) {
        self.lock().faults.insert(
            op,
            InjectedFault {
                code: code.to_string(),
                message: message.to_string(),
                once,
            },
        );
    }

    pub fn clear_faults(&self) {
        let mut state = self.lock();
        state.faults.clear();
        state.rejected.clear();
        state.panic_on = None;
    }

    /// Refuse to attach devices with this name.
    pub fn reject_device(&self, name: &str) {
        self.lock().rejected.insert(name.to_string());
    }

    pub fn set_compile_diagnostics(&self, diagnostics: CompileDiagnostics) {
        self.lock().diagnostics = diagnostics;
    }

    pub fn panic_on(&self, op: BackendOp) {
        self.lock().panic_on = Some(op);
    }

    // -- inspection --------------------------------------------------------

    pub fn journal(&self) -> Vec<BackendCall> {
        self.lock().journal.clone()
    }

    pub fn call_count(&self) -> usize {
        self.lock().journal.len()
    }

    pub fn count(&self, op: BackendOp) -> usize {
        self.lock().journal.iter().filter(|c| c.op == op).count()
    }

    pub fn open_projects(&self) -> usize {
        self.lock().projects.values().filter(|p| p.open).count()
    }

    pub fn attached_devices(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .lock()
            .devices
            .values()
            .map(|d| d.spec.name.clone())
            .collect();
        names.sort();
        names
    }

    pub fn device_values(&self, name: &str, module: &str) -> Option<ParameterMap> {
        self.lock()
            .devices
            .values()
            .find(|d| d.spec.name == name)
            .and_then(|d| d.values.get(module).cloned())
    }

    pub fn device_identity(&self, name: &str) -> Option<NetworkIdentity> {
        self.lock()
            .devices
            .values()
            .find(|d| d.spec.name == name)
            .and_then(|d| d.identity.clone())
    }

    /// Whether any open project is in run mode.
    pub fn is_running(&self) -> bool {
        self.lock().projects.values().any(|p| p.open && p.running)
    }

    pub fn downloads(&self) -> Vec<DownloadOptions> {
        self.lock()
            .projects
            .values()
            .flat_map(|p| p.downloads.iter().copied())
            .collect()
    }

    pub fn snapshots(&self) -> Vec<PathBuf> {
        self.lock()
            .projects
            .values()
            .flat_map(|p| p.snapshots.iter().cloned())
            .collect()
    }
}

impl EngineeringBackend for SimulatedBackend {
    fn open_project(&mut self, path: &Path, environment: &str) -> BackendResult<ProjectHandle> {
        let mut state = self.enter(BackendOp::OpenProject, path.display().to_string())?;
        let handle = state.next("project");
        state.projects.insert(
            handle.clone(),
            SimProject {
                path: path.to_path_buf(),
                environment: environment.to_string(),
                open: true,
                compiled: false,
                running: false,
                downloads: Vec::new(),
                snapshots: Vec::new(),
            },
        );
        Ok(ProjectHandle(handle))
    }

    fn create_session(&mut self, project: &ProjectHandle, safety: SafetyMode) -> BackendResult<SessionHandle> {
        let mut state = self.enter(BackendOp::CreateSession, project.0.clone())?;
        let environment = state.project_mut(project)?.environment.clone();
        if environment.trim().is_empty() {
            return Err(BackendError::fault("NO_ADAPTER", "no network adapter selected"));
        }
        let handle = state.next("session");
        state
            .sessions
            .insert(handle.clone(), (project.0.clone(), safety));
        Ok(SessionHandle(handle))
    }

    fn attach_device(&mut self, session: &SessionHandle, spec: &DeviceSpec) -> BackendResult<BackendRef> {
        let mut state = self.enter(BackendOp::AttachDevice, spec.name.clone())?;
        if !state.sessions.contains_key(&session.0) {
            return Err(BackendError::NotFound(format!("session {}", session)));
        }
        if state.rejected.contains(&spec.name) {
            return Err(BackendError::fault(
                "ATTACH_REFUSED",
                format!("hardware catalog refused '{}'", spec.name),
            ));
        }
        let handle = state.next("device");
        state.devices.insert(
            handle.clone(),
            SimDevice {
                session: session.0.clone(),
                spec: spec.clone(),
                identity: None,
                values: spec.modules.clone(),
            },
        );
        state.mark_modified(&session.0);
        Ok(BackendRef(handle))
    }

    fn detach_device(&mut self, session: &SessionHandle, device: &BackendRef) -> BackendResult<()> {
        let mut state = self.enter(BackendOp::DetachDevice, device.0.clone())?;
        match state.devices.get(&device.0) {
            Some(d) if d.session == session.0 => {}
            _ => return Err(BackendError::NotFound(format!("device {}", device))),
        }
        state.devices.remove(&device.0);
        state.mark_modified(&session.0);
        Ok(())
    }

    fn assign_network_identity(&mut self, device: &BackendRef, identity: &NetworkIdentity) -> BackendResult<()> {
        let mut state = self.enter(BackendOp::AssignNetworkIdentity, device.0.clone())?;
        let clash = state.devices.iter().any(|(k, d)| {
            k != &device.0
                && d.identity
                    .as_ref()
                    .is_some_and(|i| i.ip_address == identity.ip_address)
        });
        if clash {
            return Err(BackendError::fault(
                "ADDRESS_IN_USE",
                format!("{} is already assigned", identity.ip_address),
            ));
        }
        let dev = state.device_mut(device)?;
        dev.identity = Some(identity.clone());
        let session = dev.session.clone();
        state.mark_modified(&session);
        Ok(())
    }

    fn read_parameters(
        &mut self,
        device: &BackendRef,
        module: &str,
        names: &[String],
        _scope: ParameterScope,
    ) -> BackendResult<ParameterMap> {
        let mut state = self.enter(BackendOp::ReadParameters, format!("{}/{}", device, module))?;
        let dev = state.device_mut(device)?;
        let values = dev
            .values
            .get(module)
            .ok_or_else(|| BackendError::NotFound(format!("module {}", module)))?;
        if names.is_empty() {
            return Ok(values.clone());
        }
        names
            .iter()
            .map(|n| {
                values
                    .get(n)
                    .map(|v| (n.clone(), v.clone()))
                    .ok_or_else(|| BackendError::NotFound(format!("parameter {}", n)))
            })
            .collect()
    }

    fn write_parameters(
        &mut self,
        device: &BackendRef,
        module: &str,
        values: &ParameterMap,
        _scope: ParameterScope,
    ) -> BackendResult<()> {
        let mut state = self.enter(BackendOp::WriteParameters, format!("{}/{}", device, module))?;
        let dev = state.device_mut(device)?;
        let current = dev
            .values
            .get_mut(module)
            .ok_or_else(|| BackendError::NotFound(format!("module {}", module)))?;
        if let Some(unknown) = values.keys().find(|k| !current.contains_key(*k)) {
            return Err(BackendError::NotFound(format!("parameter {}", unknown)));
        }
        for (k, v) in values {
            current.insert(k.clone(), v.clone());
        }
        let session = dev.session.clone();
        state.mark_modified(&session);
        Ok(())
    }

    fn compile(&mut self, project: &ProjectHandle) -> BackendResult<CompileDiagnostics> {
        let mut state = self.enter(BackendOp::Compile, project.0.clone())?;
        let diagnostics = state.diagnostics.clone();
        let p = state.project_mut(project)?;
        p.compiled = diagnostics.error_count() == 0;
        Ok(diagnostics)
    }

    fn download(&mut self, project: &ProjectHandle, options: &DownloadOptions) -> BackendResult<()> {
        let mut state = self.enter(BackendOp::Download, project.0.clone())?;
        let p = state.project_mut(project)?;
        if !p.compiled {
            return Err(BackendError::fault("NOT_COMPILED", "project is not compiled"));
        }
        p.downloads.push(*options);
        Ok(())
    }

    fn save_as(&mut self, project: &ProjectHandle, tag: &str) -> BackendResult<PathBuf> {
        let mut state = self.enter(BackendOp::SaveAs, format!("{}@{}", project, tag))?;
        let p = state.project_mut(project)?;
        let stem = p
            .path
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_else(|| "project".into());
        let file = match p.path.extension() {
            Some(ext) => format!("{}_{}.{}", stem, tag, ext.to_string_lossy()),
            None => format!("{}_{}", stem, tag),
        };
        let saved = p.path.with_file_name(file);
        p.snapshots.push(saved.clone());
        Ok(saved)
    }

    fn set_run_state(&mut self, project: &ProjectHandle, running: bool) -> BackendResult<()> {
        let target = format!("{}:{}", project, if running { "run" } else { "stop" });
        let mut state = self.enter(BackendOp::SetRunState, target)?;
        state.project_mut(project)?.running = running;
        Ok(())
    }

    fn close(&mut self, project: &ProjectHandle) -> BackendResult<()> {
        let mut state = self.enter(BackendOp::Close, project.0.clone())?;
        let p = state.project_mut(project)?;
        p.open = false;
        p.running = false;
        let sessions: Vec<String> = state
            .sessions
            .iter()
            .filter(|(_, (proj, _))| proj == &project.0)
            .map(|(s, _)| s.clone())
            .collect();
        state.devices.retain(|_, d| !sessions.contains(&d.session));
        state.sessions.retain(|s, _| !sessions.contains(s));
        Ok(())
    }
}
