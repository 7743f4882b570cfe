//! Commissioning session – the workflow state machine.
//!
//! A session owns one open project in one engineering backend and walks it
//! through a forward-only sequence of stages:
//!
//! ```text
//! Unopened → Configured → Initialized → DevicesImported → Ready → Compiled → Deployed
//! ```
//!
//! Every operation first checks that it is legal from the current stage and
//! fails with `StageViolation` without contacting the backend if it is not.
//! Backend errors and panics escaping the driver are turned into
//! `BackendFault` records. A failed operation leaves the stage untouched, so
//! the caller can fix the input and retry the same step.
//!
//! Run/stop is tracked separately in [`RunState`]. Teardown
//! ([`CommissioningSession::dispose`], also run on drop) is idempotent.

use crate::backend::{
    BackendError, BackendResult, CompileDiagnostics, DeviceSpec, DownloadOptions, EngineeringBackend,
    ParameterScope, ProjectHandle, SafetyMode, SessionHandle, Severity,
};
use crate::catalog::Catalog;
use crate::config::ProjectConfig;
use crate::error::{ErrorKind, ErrorRecord, Failure, Outcome};
use crate::logging::LogSink;
use crate::model::{
    invalid_value, BackendRef, Device, DeviceAddress, DeviceId, DeviceSet, Module, ParameterMap,
};
use crate::topology::{self, unresolved_record, UnresolvedEntry};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Unopened,
    Configured,
    Initialized,
    DevicesImported,
    /// Every attached device has a network identity.
    Ready,
    Compiled,
    Deployed,
}

impl Stage {
    pub const ALL: [Stage; 7] = [
        Stage::Unopened,
        Stage::Configured,
        Stage::Initialized,
        Stage::DevicesImported,
        Stage::Ready,
        Stage::Compiled,
        Stage::Deployed,
    ];
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = serde_json::to_value(self)
            .ok()
            .and_then(|v| v.as_str().map(String::from))
            .unwrap_or_else(|| format!("{:?}", self));
        f.write_str(&s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Unknown,
    Running,
    Stopped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    Configure,
    Initialize,
    ImportDevices,
    ConfigureDevice,
    GetDeviceParameters,
    SetDeviceParameters,
    DeleteDevice,
    Compile,
    Download,
    SaveProjectAs,
    Start,
    Stop,
    Dispose,
}

impl Operation {
    pub const ALL: [Operation; 13] = [
        Operation::Configure,
        Operation::Initialize,
        Operation::ImportDevices,
        Operation::ConfigureDevice,
        Operation::GetDeviceParameters,
        Operation::SetDeviceParameters,
        Operation::DeleteDevice,
        Operation::Compile,
        Operation::Download,
        Operation::SaveProjectAs,
        Operation::Start,
        Operation::Stop,
        Operation::Dispose,
    ];

    /// Whether the operation may run from `stage`.
    pub fn permitted(self, stage: Stage) -> bool {
        use Operation::*;
        match self {
            Configure => stage == Stage::Unopened,
            Initialize => stage == Stage::Configured,
            ImportDevices => stage == Stage::Initialized,
            ConfigureDevice | GetDeviceParameters | SetDeviceParameters | DeleteDevice | Compile => {
                stage >= Stage::DevicesImported
            }
            Download | Start | Stop => stage >= Stage::Compiled,
            SaveProjectAs => stage >= Stage::Configured,
            Dispose => true,
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = serde_json::to_value(self)
            .ok()
            .and_then(|v| v.as_str().map(String::from))
            .unwrap_or_else(|| format!("{:?}", self));
        f.write_str(&s)
    }
}

/// Result of a successful device import.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImportReport {
    /// Every device attached to the project, in topology order.
    pub devices: DeviceSet,
    /// Topology entries whose type was not in the catalog.
    pub unresolved: Vec<UnresolvedEntry>,
}

pub struct CommissioningSession {
    backend: Box<dyn EngineeringBackend>,
    log: Arc<dyn LogSink>,
    stage: Stage,
    run_state: RunState,
    safety: SafetyMode,
    config: Option<ProjectConfig>,
    project: Option<ProjectHandle>,
    backend_session: Option<SessionHandle>,
    catalog: Option<Arc<Catalog>>,
    devices: DeviceSet,
    modified_since_compile: bool,
    disposed: bool,
}

impl CommissioningSession {
    pub fn new(backend: Box<dyn EngineeringBackend>, log: Arc<dyn LogSink>) -> Self {
        Self {
            backend,
            log,
            stage: Stage::Unopened,
            run_state: RunState::Unknown,
            safety: SafetyMode::Standard,
            config: None,
            project: None,
            backend_session: None,
            catalog: None,
            devices: DeviceSet::new(),
            modified_since_compile: false,
            disposed: false,
        }
    }

    /// Run `f` against a fresh session and tear it down afterwards, whatever
    /// `f` returned. A teardown failure is appended to `f`'s errors.
    pub fn scope<T>(
        backend: Box<dyn EngineeringBackend>,
        log: Arc<dyn LogSink>,
        f: impl FnOnce(&mut CommissioningSession) -> Outcome<T>,
    ) -> Outcome<T> {
        let mut session = CommissioningSession::new(backend, log);
        let outcome = f(&mut session);
        let teardown = session.dispose();
        match (outcome, teardown) {
            (Ok(v), Ok(())) => Ok(v),
            (Ok(_), Err(e)) => Err(e),
            (Err(e), Ok(())) => Err(e),
            (Err(mut e), Err(t)) => {
                e.extend(t);
                Err(e)
            }
        }
    }

    // -----------------------------------------------------------------------
    // State
    // -----------------------------------------------------------------------

    pub fn stage(&self) -> Stage {
        self.stage
    }

    pub fn run_state(&self) -> RunState {
        self.run_state
    }

    pub fn safety_mode(&self) -> SafetyMode {
        self.safety
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed
    }

    /// Parameters or devices changed since the last successful compile.
    pub fn is_modified_since_compile(&self) -> bool {
        self.modified_since_compile
    }

    pub fn project(&self) -> Option<&ProjectHandle> {
        self.project.as_ref()
    }

    pub fn config(&self) -> Option<&ProjectConfig> {
        self.config.as_ref()
    }

    pub fn catalog(&self) -> Option<&Arc<Catalog>> {
        self.catalog.as_ref()
    }

    pub fn devices(&self) -> &DeviceSet {
        &self.devices
    }

    /// The sink this session was created with.
    pub fn log_sink(&self) -> Arc<dyn LogSink> {
        Arc::clone(&self.log)
    }

    pub fn device(&self, id: DeviceId) -> Outcome<&Device> {
        self.devices.get(id).ok_or_else(|| {
            ErrorRecord::new(ErrorKind::DeviceNotFound, format!("no attached device with id {}", id))
                .with_detail("device_id", id.to_string())
                .into()
        })
    }

    pub fn device_by_name(&self, name: &str) -> Outcome<&Device> {
        self.devices.by_name(name).ok_or_else(|| {
            ErrorRecord::new(ErrorKind::DeviceNotFound, format!("no attached device named '{}'", name))
                .with_detail("device", name)
                .into()
        })
    }

    /// First device in import order.
    pub fn first_device(&self) -> Outcome<&Device> {
        self.devices
            .first()
            .ok_or_else(|| no_devices("first").into())
    }

    /// Last device in import order.
    pub fn last_device(&self) -> Outcome<&Device> {
        self.devices.last().ok_or_else(|| no_devices("last").into())
    }

    // -----------------------------------------------------------------------
    // Project lifecycle
    // -----------------------------------------------------------------------

    /// Open (or create) the project named by `config` on its network adapter.
    pub fn configure(&mut self, config: &ProjectConfig) -> Outcome<()> {
        self.run(Operation::Configure, |s| s.open_project(config))
    }

    /// Load the project configuration document, then [`Self::configure`].
    pub fn configure_from_file(&mut self, path: &Path) -> Outcome<()> {
        self.run(Operation::Configure, |s| {
            let config = ProjectConfig::load(path)?;
            s.open_project(&config)
        })
    }

    fn open_project(&mut self, config: &ProjectConfig) -> Outcome<()> {
        config.validate()?;
        self.log.info(&format!(
            "opening project {} on '{}'",
            config.project_path.display(),
            config.network_card
        ));
        let path = config.project_path.clone();
        let environment = config.network_card.clone();
        let handle = self.call(Operation::Configure, |b| b.open_project(&path, &environment))?;
        self.log.debug(&format!("project handle {}", handle));
        self.project = Some(handle);
        self.config = Some(config.clone());
        self.advance(Stage::Configured);
        Ok(())
    }

    /// Establish the live engineering session.
    pub fn initialize(&mut self, safety: SafetyMode) -> Outcome<()> {
        self.run(Operation::Initialize, |s| {
            let project = s.project_handle()?;
            let handle = s.call(Operation::Initialize, |b| b.create_session(&project, safety))?;
            s.log.info(&format!("engineering session {} started ({:?})", handle, safety));
            s.backend_session = Some(handle);
            s.safety = safety;
            s.advance(Stage::Initialized);
            Ok(())
        })
    }

    /// Load the device descriptions, import the topology and attach every
    /// resolved device to the project.
    pub fn import_devices<P: AsRef<Path>>(&mut self, topology: &Path, descriptions: &[P]) -> Outcome<ImportReport> {
        self.run(Operation::ImportDevices, |s| {
            let catalog = Catalog::load(descriptions, s.log.as_ref())?;
            s.attach_topology(topology, Arc::new(catalog))
        })
    }

    /// Same as [`Self::import_devices`] with an already loaded catalog.
    pub fn import_devices_with_catalog(&mut self, topology: &Path, catalog: Arc<Catalog>) -> Outcome<ImportReport> {
        self.run(Operation::ImportDevices, |s| s.attach_topology(topology, catalog))
    }

    /// Attach devices one at a time. Devices attached before a failure stay
    /// attached; a retry skips them.
    fn attach_topology(&mut self, path: &Path, catalog: Arc<Catalog>) -> Outcome<ImportReport> {
        let import = topology::import(path, &catalog, self.log.as_ref())?;
        let session = self.session_handle()?;
        let mut errors = Vec::new();

        for mut device in import.devices {
            if self.devices.contains_name(&device.name) {
                self.log
                    .debug(&format!("'{}' is already attached, skipping", device.name));
                continue;
            }
            if device.safety && !self.safety.is_safety() {
                self.log
                    .debug(&format!("attaching safety device '{}' in a standard session", device.name));
            }
            let spec = device_spec(&device);
            match self.call(Operation::ImportDevices, |b| b.attach_device(&session, &spec)) {
                Ok(backend_ref) => {
                    self.log.info(&format!(
                        "attached '{}' ({}) as {}",
                        device.name, device.device_type, backend_ref
                    ));
                    device.backend_ref = Some(backend_ref);
                    // Name uniqueness checked above.
                    let _ = self.devices.insert(device);
                    self.modified_since_compile = true;
                }
                Err(failure) => {
                    for record in failure.into_errors() {
                        errors.push(
                            record
                                .with_detail("device", device.name.as_str())
                                .with_detail("device_type", device.device_type.as_str()),
                        );
                    }
                }
            }
        }

        self.catalog = Some(catalog);

        if let Some(mut failure) = Failure::from_records(errors) {
            for u in &import.unresolved {
                failure.push(unresolved_record(u));
            }
            return Err(failure);
        }

        for u in &import.unresolved {
            self.log.warn(&format!(
                "topology entry '{}' skipped: unknown device type '{}'",
                u.name, u.device_type
            ));
        }
        self.advance(Stage::DevicesImported);
        Ok(ImportReport {
            devices: self.devices.clone(),
            unresolved: import.unresolved,
        })
    }

    /// Detach a device from the project and forget it.
    pub fn delete_device(&mut self, id: DeviceId) -> Outcome<()> {
        self.run(Operation::DeleteDevice, |s| {
            let backend_ref = s.backend_ref(id)?;
            let session = s.session_handle()?;
            s.call(Operation::DeleteDevice, |b| b.detach_device(&session, &backend_ref))?;
            if let Some(device) = s.devices.remove(id) {
                s.log.info(&format!("deleted '{}'", device.name));
            }
            s.modified_since_compile = true;
            s.advance_if_ready();
            Ok(())
        })
    }

    // -----------------------------------------------------------------------
    // Device configuration
    // -----------------------------------------------------------------------

    /// Assign IP address and station name.
    pub fn configure_device(&mut self, id: DeviceId, address: &DeviceAddress) -> Outcome<()> {
        self.run(Operation::ConfigureDevice, |s| {
            let identity = address.validate()?;
            let backend_ref = s.backend_ref(id)?;
            if let Some(other) = s.devices.iter().find(|d| {
                d.id != id
                    && d.network.as_ref().is_some_and(|n| {
                        n.ip_address == identity.ip_address || n.station_name == identity.station_name
                    })
            }) {
                return Err(ErrorRecord::new(
                    ErrorKind::InvalidArgument,
                    format!(
                        "address {} / '{}' collides with device '{}'",
                        identity.ip_address, identity.station_name, other.name
                    ),
                )
                .with_detail("device", other.name.as_str())
                .into());
            }
            s.call(Operation::ConfigureDevice, |b| {
                b.assign_network_identity(&backend_ref, &identity)
            })?;
            if let Some(device) = s.devices.get_mut(id) {
                s.log.info(&format!(
                    "'{}' is now {} / {}",
                    device.name, identity.station_name, identity.ip_address
                ));
                device.network = Some(identity);
            }
            s.modified_since_compile = true;
            s.advance_if_ready();
            Ok(())
        })
    }

    /// Read parameters of a standard module. `None` reads the whole module;
    /// an empty list reads nothing and returns an empty map.
    pub fn get_device_parameters(&mut self, id: DeviceId, module: &str, names: Option<&[&str]>) -> Outcome<ParameterMap> {
        self.run(Operation::GetDeviceParameters, |s| {
            s.read_parameters(id, module, names, ParameterScope::Standard)
        })
    }

    /// Read parameters of a safety module; requires safety mode.
    pub fn get_safety_parameters(&mut self, id: DeviceId, module: &str, names: Option<&[&str]>) -> Outcome<ParameterMap> {
        self.run(Operation::GetDeviceParameters, |s| {
            s.read_parameters(id, module, names, ParameterScope::Safety)
        })
    }

    /// Write parameters of a standard module. All values are validated
    /// before anything is written.
    pub fn set_device_parameters(&mut self, id: DeviceId, module: &str, values: &ParameterMap) -> Outcome<()> {
        self.run(Operation::SetDeviceParameters, |s| {
            s.write_parameters(id, module, values, ParameterScope::Standard)
        })
    }

    /// Write parameters of a safety module; requires safety mode.
    pub fn set_safety_parameters(&mut self, id: DeviceId, module: &str, values: &ParameterMap) -> Outcome<()> {
        self.run(Operation::SetDeviceParameters, |s| {
            s.write_parameters(id, module, values, ParameterScope::Safety)
        })
    }

    fn read_parameters(
        &mut self,
        id: DeviceId,
        module: &str,
        names: Option<&[&str]>,
        scope: ParameterScope,
    ) -> Outcome<ParameterMap> {
        let (backend_ref, template) = self.module_access(id, module, scope)?;
        if names.is_some_and(|n| n.is_empty()) {
            return Ok(ParameterMap::new());
        }
        let requested: Vec<String> = names.unwrap_or_default().iter().map(|n| n.to_string()).collect();
        for name in &requested {
            if template.parameter(name).is_none() {
                return Err(invalid_value(
                    module,
                    name,
                    format!("module '{}' has no parameter '{}'", module, name),
                )
                .into());
            }
        }

        let values = self.call(Operation::GetDeviceParameters, |b| {
            b.read_parameters(&backend_ref, module, &requested, scope)
        })?;

        for (name, value) in &values {
            let param = template.parameter(name).ok_or_else(|| {
                ErrorRecord::new(
                    ErrorKind::BackendFault,
                    format!("backend reported unknown parameter '{}' in '{}'", name, module),
                )
                .with_detail("parameter", name.as_str())
            })?;
            param
                .template
                .validate(module, value)
                .map_err(|r| r.with_cause("value reported by the backend"))?;
        }
        if let Some(missing) = requested.iter().find(|n| !values.contains_key(*n)) {
            return Err(ErrorRecord::new(
                ErrorKind::BackendFault,
                format!("backend did not report parameter '{}'", missing),
            )
            .with_detail("parameter", missing.as_str())
            .into());
        }

        if let Some(m) = self.devices.get_mut(id).and_then(|d| d.module_mut(module)) {
            m.apply(&values);
        }
        Ok(values)
    }

    fn write_parameters(
        &mut self,
        id: DeviceId,
        module: &str,
        values: &ParameterMap,
        scope: ParameterScope,
    ) -> Outcome<()> {
        let (backend_ref, template) = self.module_access(id, module, scope)?;
        template.validate_values(values)?;
        if values.is_empty() {
            return Ok(());
        }

        self.call(Operation::SetDeviceParameters, |b| {
            b.write_parameters(&backend_ref, module, values, scope)
        })?;

        if let Some(m) = self.devices.get_mut(id).and_then(|d| d.module_mut(module)) {
            m.apply(values);
        }
        self.modified_since_compile = true;
        self.log.debug(&format!("wrote {} value(s) to '{}'", values.len(), module));
        Ok(())
    }

    /// Resolve device and module and check the parameter API matches.
    fn module_access(&self, id: DeviceId, module: &str, scope: ParameterScope) -> Outcome<(BackendRef, Module)> {
        let device = self.device(id)?;
        let m = device.module(module).ok_or_else(|| {
            ErrorRecord::new(
                ErrorKind::ModuleNotFound,
                format!("device '{}' ({}) has no module '{}'", device.name, device.device_type, module),
            )
            .with_detail("device", device.name.as_str())
            .with_detail("module", module)
        })?;

        let mismatch = |msg: String| -> Failure {
            ErrorRecord::new(ErrorKind::SafetyModeMismatch, msg)
                .with_detail("device", device.name.as_str())
                .with_detail("module", module)
                .into()
        };
        match scope {
            ParameterScope::Safety if !self.safety.is_safety() => {
                return Err(mismatch(
                    "safety parameters need a session initialized in safety mode".into(),
                ))
            }
            ParameterScope::Safety if !m.safety => {
                return Err(mismatch(format!("'{}' is not a safety module", module)))
            }
            ParameterScope::Standard if m.safety => {
                return Err(mismatch(format!(
                    "'{}' is a safety module; use the safety parameter API",
                    module
                )))
            }
            _ => {}
        }

        let backend_ref = device.backend_ref.clone().ok_or_else(|| {
            ErrorRecord::new(
                ErrorKind::DeviceNotFound,
                format!("device '{}' is not attached to the project", device.name),
            )
        })?;
        Ok((backend_ref, m.clone()))
    }

    // -----------------------------------------------------------------------
    // Build and deploy
    // -----------------------------------------------------------------------

    pub fn compile(&mut self) -> Outcome<CompileDiagnostics> {
        self.run(Operation::Compile, |s| {
            let project = s.project_handle()?;
            s.log.info("compiling project");
            let diagnostics = s.call(Operation::Compile, |b| b.compile(&project))?;
            for d in diagnostics.messages.iter().filter(|d| d.severity == Severity::Warning) {
                s.log.warn(&format!(
                    "compile warning{}: {}",
                    d.path.as_deref().map(|p| format!(" in {}", p)).unwrap_or_default(),
                    d.description
                ));
            }
            if diagnostics.error_count() > 0 {
                return Err(ErrorRecord::new(
                    ErrorKind::CompileError,
                    format!(
                        "compilation finished with {} error(s) and {} warning(s)",
                        diagnostics.error_count(),
                        diagnostics.warning_count()
                    ),
                )
                .with_details(serde_json::to_value(&diagnostics).unwrap_or_default())
                .into());
            }
            s.modified_since_compile = false;
            s.advance(Stage::Compiled);
            Ok(diagnostics)
        })
    }

    /// Push compiled artifacts to the target. Legal again after a redeploy
    /// compile.
    pub fn download(&mut self, options: DownloadOptions) -> Outcome<()> {
        self.run(Operation::Download, |s| {
            if options.is_empty() {
                return Err(ErrorRecord::new(
                    ErrorKind::InvalidArgument,
                    "select at least one of hardware, software or safety",
                )
                .into());
            }
            if options.safety && !s.safety.is_safety() {
                return Err(ErrorRecord::new(
                    ErrorKind::SafetyModeMismatch,
                    "safety download needs a session initialized in safety mode",
                )
                .into());
            }
            if s.modified_since_compile {
                return Err(stage_violation(
                    Operation::Download,
                    s.stage,
                    "project changed since the last compile; compile again",
                ));
            }
            let missing: Vec<&str> = s
                .devices
                .iter()
                .filter(|d| !d.has_identity())
                .map(|d| d.name.as_str())
                .collect();
            if !missing.is_empty() {
                let failure = stage_violation(
                    Operation::Download,
                    s.stage,
                    &format!("devices without network identity: {}", missing.join(", ")),
                );
                return Err(failure);
            }

            let project = s.project_handle()?;
            s.log.info(&format!(
                "downloading (hardware: {}, software: {}, safety: {})",
                options.hardware, options.software, options.safety
            ));
            s.call(Operation::Download, |b| b.download(&project, &options))?;
            s.advance(Stage::Deployed);
            Ok(())
        })
    }

    /// Save a snapshot of the project under `tag`. Returns its location.
    pub fn save_project_as(&mut self, tag: &str) -> Outcome<PathBuf> {
        self.run(Operation::SaveProjectAs, |s| {
            let tag = tag.trim();
            if tag.is_empty() || tag.contains(['/', '\\']) {
                return Err(ErrorRecord::new(
                    ErrorKind::InvalidArgument,
                    format!("invalid version tag {:?}", tag),
                )
                .into());
            }
            let project = s.project_handle()?;
            let saved = s.call(Operation::SaveProjectAs, |b| b.save_as(&project, tag))?;
            s.log.info(&format!("project saved as {}", saved.display()));
            Ok(saved)
        })
    }

    pub fn start(&mut self) -> Outcome<()> {
        self.run(Operation::Start, |s| s.set_running(Operation::Start, true))
    }

    pub fn stop(&mut self) -> Outcome<()> {
        self.run(Operation::Stop, |s| s.set_running(Operation::Stop, false))
    }

    fn set_running(&mut self, op: Operation, running: bool) -> Outcome<()> {
        let project = self.project_handle()?;
        self.call(op, |b| b.set_run_state(&project, running))?;
        self.run_state = if running {
            RunState::Running
        } else {
            RunState::Stopped
        };
        self.log.info(&format!("target is {:?}", self.run_state));
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Teardown
    // -----------------------------------------------------------------------

    /// Release the backend session and project handle. Safe to call in any
    /// stage and more than once; later calls do nothing.
    pub fn dispose(&mut self) -> Outcome<()> {
        if self.disposed {
            return Ok(());
        }
        self.disposed = true;

        let outcome = match self.project.take() {
            Some(project) => {
                self.log.info(&format!("closing project {}", project));
                self.call(Operation::Dispose, |b| b.close(&project))
            }
            None => Ok(()),
        };
        if let Err(failure) = &outcome {
            for r in failure.errors() {
                self.log.error(&format!("{}: {}", Operation::Dispose, r));
            }
        }

        self.backend_session = None;
        self.devices = DeviceSet::new();
        self.catalog = None;
        self.run_state = RunState::Unknown;
        self.stage = Stage::Unopened;
        outcome
    }

    // -----------------------------------------------------------------------
    // Internals
    // -----------------------------------------------------------------------

    /// Stage check, then `f`; every failure is logged.
    fn run<T>(&mut self, op: Operation, f: impl FnOnce(&mut Self) -> Outcome<T>) -> Outcome<T> {
        let outcome = self.ensure_permitted(op).and_then(|()| f(self));
        if let Err(failure) = &outcome {
            for r in failure.errors() {
                self.log.error(&format!("{}: {}", op, r));
            }
        }
        outcome
    }

    /// Fails with `StageViolation` unless `op` may run now. Devices left
    /// attached by a partly failed import can be deleted from `Initialized`.
    pub fn ensure_permitted(&self, op: Operation) -> Outcome<()> {
        if self.disposed {
            return Err(stage_violation(op, self.stage, "the session has been disposed"));
        }
        let detach_leftover =
            op == Operation::DeleteDevice && self.stage == Stage::Initialized && !self.devices.is_empty();
        if !op.permitted(self.stage) && !detach_leftover {
            return Err(stage_violation(
                op,
                self.stage,
                &format!("{} is not legal in stage {}", op, self.stage),
            ));
        }
        Ok(())
    }

    /// Invoke the backend, converting errors and panics into `BackendFault`.
    fn call<T>(
        &mut self,
        op: Operation,
        f: impl FnOnce(&mut dyn EngineeringBackend) -> BackendResult<T>,
    ) -> Outcome<T> {
        self.log.trace(&format!("backend call for {}", op));
        let backend = self.backend.as_mut();
        match panic::catch_unwind(AssertUnwindSafe(|| f(backend))) {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(backend_failure(op, e).into()),
            Err(payload) => {
                let cause = payload
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| payload.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic payload".into());
                self.log.fatal(&format!("engineering backend panicked during {}: {}", op, cause));
                Err(ErrorRecord::new(
                    ErrorKind::BackendFault,
                    format!("{} aborted inside the engineering backend", op),
                )
                .with_cause(cause)
                .with_detail("operation", op.to_string())
                .into())
            }
        }
    }

    fn advance(&mut self, to: Stage) {
        if to > self.stage {
            self.log.debug(&format!("stage {} -> {}", self.stage, to));
            self.stage = to;
        }
    }

    fn advance_if_ready(&mut self) {
        if self.stage == Stage::DevicesImported
            && !self.devices.is_empty()
            && self.devices.iter().all(Device::has_identity)
        {
            self.advance(Stage::Ready);
        }
    }

    fn project_handle(&self) -> Outcome<ProjectHandle> {
        self.project
            .clone()
            .ok_or_else(|| stage_violation(Operation::Configure, self.stage, "no project is open"))
    }

    fn session_handle(&self) -> Outcome<SessionHandle> {
        self.backend_session.clone().ok_or_else(|| {
            stage_violation(Operation::ImportDevices, self.stage, "no engineering session is open")
        })
    }

    fn backend_ref(&self, id: DeviceId) -> Outcome<BackendRef> {
        let device = self.device(id)?;
        device.backend_ref.clone().ok_or_else(|| {
            ErrorRecord::new(
                ErrorKind::DeviceNotFound,
                format!("device '{}' is not attached to the project", device.name),
            )
            .into()
        })
    }
}

impl fmt::Debug for CommissioningSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommissioningSession")
            .field("stage", &self.stage)
            .field("run_state", &self.run_state)
            .field("safety", &self.safety)
            .field("project", &self.project)
            .field("devices", &self.devices.names())
            .field("disposed", &self.disposed)
            .finish_non_exhaustive()
    }
}

impl Drop for CommissioningSession {
    fn drop(&mut self) {
        if !self.disposed {
            if let Err(e) = self.dispose() {
                self.log.warn(&format!("teardown on drop failed: {}", e));
            }
        }
    }
}

fn device_spec(device: &Device) -> DeviceSpec {
    DeviceSpec {
        name: device.name.clone(),
        device_type: device.device_type.clone(),
        safety: device.safety,
        placement: device.placement.clone(),
        modules: device
            .modules
            .iter()
            .map(|m| (m.name.clone(), m.values()))
            .collect(),
    }
}

fn stage_violation(op: Operation, stage: Stage, message: &str) -> Failure {
    ErrorRecord::new(ErrorKind::StageViolation, message)
        .with_detail("operation", op.to_string())
        .with_detail("stage", stage.to_string())
        .into()
}

fn no_devices(which: &str) -> ErrorRecord {
    ErrorRecord::new(
        ErrorKind::DeviceNotFound,
        format!("no {} device: the session has no attached devices", which),
    )
}

fn backend_failure(op: Operation, e: BackendError) -> ErrorRecord {
    let record = match &e {
        BackendError::Io(io) if io.kind() == std::io::ErrorKind::NotFound => ErrorRecord::new(
            ErrorKind::ResourceUnavailable,
            format!("{}: a required file is missing", op),
        ),
        BackendError::Fault { code, .. } => {
            ErrorRecord::new(ErrorKind::BackendFault, format!("{} failed in the engineering backend", op))
                .with_detail("code", code.as_str())
        }
        _ => ErrorRecord::new(ErrorKind::BackendFault, format!("{} failed in the engineering backend", op)),
    };
    record.with_cause(&e).with_detail("operation", op.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::Diagnostic;
    use crate::logging::{LogLevel, MemorySink};
    use crate::model::ParameterValue;
    use crate::simulated::{BackendOp, SimulatedBackend};

    const GATE: &str = "[M11] Reading gate control";
    const SAFETY_INPUTS: &str = "[F1] Safety inputs";

    fn fixture(name: &str) -> PathBuf {
        Path::new(env!("CARGO_MANIFEST_DIR")).join("fixtures").join(name)
    }

    fn descriptions() -> Vec<PathBuf> {
        vec![fixture("bcl248i.yaml"), fixture("safety_io.yaml")]
    }

    fn new_session() -> (CommissioningSession, SimulatedBackend, Arc<MemorySink>) {
        let sim = SimulatedBackend::new();
        let sink = Arc::new(MemorySink::new());
        let session = CommissioningSession::new(Box::new(sim.clone()), sink.clone());
        (session, sim, sink)
    }

    fn config() -> ProjectConfig {
        ProjectConfig::new("/projects/Blank_project.zap17", "Realtek USB GbE Family Controller")
    }

    fn drive_to(session: &mut CommissioningSession, stage: Stage, safety: SafetyMode) {
        if stage >= Stage::Configured {
            session.configure(&config()).unwrap();
        }
        if stage >= Stage::Initialized {
            session.initialize(safety).unwrap();
        }
        if stage >= Stage::DevicesImported {
            session
                .import_devices(&fixture("sample_topology.yaml"), &descriptions())
                .unwrap();
        }
        if stage >= Stage::Ready {
            let dut = session.device_by_name("dut").unwrap().id;
            let safe = session.device_by_name("safety-in").unwrap().id;
            session
                .configure_device(dut, &DeviceAddress::new("192.168.60.100", "dut"))
                .unwrap();
            session
                .configure_device(safe, &DeviceAddress::new("192.168.60.101", "safety-in"))
                .unwrap();
        }
        if stage >= Stage::Compiled {
            session.compile().unwrap();
        }
        if stage >= Stage::Deployed {
            session
                .download(DownloadOptions::hardware_and_software())
                .unwrap();
        }
        assert_eq!(session.stage(), stage);
    }

    fn values(pairs: &[(&str, ParameterValue)]) -> ParameterMap {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    /// Invoke `op` with plausible arguments.
    fn attempt(session: &mut CommissioningSession, op: Operation) -> Outcome<()> {
        let id = session.first_device().map(|d| d.id).unwrap_or_default();
        match op {
            Operation::Configure => session.configure(&config()),
            Operation::Initialize => session.initialize(SafetyMode::Standard),
            Operation::ImportDevices => session
                .import_devices(&fixture("sample_topology.yaml"), &descriptions())
                .map(|_| ()),
            Operation::ConfigureDevice => {
                session.configure_device(id, &DeviceAddress::new("10.0.0.9", "spare"))
            }
            Operation::GetDeviceParameters => session.get_device_parameters(id, GATE, None).map(|_| ()),
            Operation::SetDeviceParameters => session.set_device_parameters(
                id,
                GATE,
                &values(&[("Restart delay", ParameterValue::Integer(1))]),
            ),
            Operation::DeleteDevice => session.delete_device(id),
            Operation::Compile => session.compile().map(|_| ()),
            Operation::Download => session.download(DownloadOptions::hardware_and_software()),
            Operation::SaveProjectAs => session.save_project_as("V1").map(|_| ()),
            Operation::Start => session.start(),
            Operation::Stop => session.stop(),
            Operation::Dispose => session.dispose(),
        }
    }

    #[test]
    fn test_full_sequence_reaches_deployed() {
        let (mut session, sim, _) = new_session();
        drive_to(&mut session, Stage::Deployed, SafetyMode::Standard);
        assert_eq!(sim.downloads(), vec![DownloadOptions::hardware_and_software()]);
        assert_eq!(
            sim.device_identity("dut").unwrap().station_name,
            "dut".to_string()
        );
    }

    #[test]
    fn test_illegal_operations_never_reach_backend() {
        for stage in Stage::ALL {
            let (mut session, sim, _) = new_session();
            drive_to(&mut session, stage, SafetyMode::Standard);
            for op in Operation::ALL {
                if op.permitted(stage) {
                    continue;
                }
                let before = sim.call_count();
                let err = attempt(&mut session, op).unwrap_err();
                assert_eq!(err.kind(), ErrorKind::StageViolation, "{} from {}", op, stage);
                assert_eq!(sim.call_count(), before, "{} from {} hit the backend", op, stage);
                assert_eq!(session.stage(), stage);
            }
        }
    }

    #[test]
    fn test_import_before_initialize_is_stage_violation() {
        let (mut session, sim, sink) = new_session();
        session.configure(&config()).unwrap();
        let before = sim.call_count();
        let err = session
            .import_devices(&fixture("sample_topology.yaml"), &descriptions())
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::StageViolation);
        assert_eq!(err.first().detail("stage"), Some("configured"));
        assert_eq!(session.stage(), Stage::Configured);
        assert_eq!(sim.call_count(), before);
        assert!(sink.contains(LogLevel::Error, "import_devices"));
    }

    #[test]
    fn test_set_then_get_round_trip() {
        let (mut session, sim, _) = new_session();
        drive_to(&mut session, Stage::DevicesImported, SafetyMode::Standard);
        let dut = session.first_device().unwrap().id;
        let update = values(&[
            ("Automatic reading gate repeat", "yes".into()),
            ("Reading gate end mode / completeness mode", "Ident List dependent".into()),
            ("Restart delay", 333.into()),
            ("Max. reading gate time when scanning", 762.into()),
        ]);
        session.set_device_parameters(dut, GATE, &update).unwrap();

        let read = session
            .get_device_parameters(dut, GATE, Some(&["Restart delay"][..]))
            .unwrap();
        assert_eq!(read, values(&[("Restart delay", 333.into())]));
        let all = session.get_device_parameters(dut, GATE, None).unwrap();
        assert_eq!(all, update);
        assert_eq!(sim.device_values("dut", GATE).unwrap(), update);

        let reads = sim.count(BackendOp::ReadParameters);
        let no_names: &[&str] = &[];
        let empty = session.get_device_parameters(dut, GATE, Some(no_names)).unwrap();
        assert!(empty.is_empty());
        assert_eq!(sim.count(BackendOp::ReadParameters), reads);
    }

    #[test]
    fn test_one_invalid_value_writes_nothing() {
        let (mut session, sim, _) = new_session();
        drive_to(&mut session, Stage::DevicesImported, SafetyMode::Standard);
        let dut = session.first_device().unwrap().id;
        let writes_before = sim.count(BackendOp::WriteParameters);

        let err = session
            .set_device_parameters(
                dut,
                GATE,
                &values(&[
                    ("Automatic reading gate repeat", "yes".into()),
                    ("Max. reading gate time when scanning", 762.into()),
                    ("Restart delay", 99999.into()),
                ]),
            )
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidParameterValue);
        assert_eq!(err.first().detail("parameter"), Some("Restart delay"));
        assert_eq!(sim.count(BackendOp::WriteParameters), writes_before);

        let read = session.get_device_parameters(dut, GATE, None).unwrap();
        assert_eq!(read["Restart delay"], ParameterValue::Integer(0));
        assert_eq!(read["Automatic reading gate repeat"], ParameterValue::Text("no".into()));
    }

    #[test]
    fn test_unknown_module() {
        let (mut session, _, _) = new_session();
        drive_to(&mut session, Stage::DevicesImported, SafetyMode::Standard);
        let dut = session.first_device().unwrap().id;
        let err = session
            .get_device_parameters(dut, "[M99] Nothing", None)
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ModuleNotFound);
    }

    #[test]
    fn test_safety_parameters_need_safety_mode() {
        let (mut session, sim, _) = new_session();
        drive_to(&mut session, Stage::DevicesImported, SafetyMode::Standard);
        let safe = session.last_device().unwrap().id;
        let before = sim.call_count();
        let err = session
            .get_safety_parameters(safe, SAFETY_INPUTS, None)
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::SafetyModeMismatch);
        let err = session
            .get_device_parameters(safe, SAFETY_INPUTS, None)
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::SafetyModeMismatch);
        assert_eq!(sim.call_count(), before);
    }

    #[test]
    fn test_safety_parameters_in_safety_mode() {
        let (mut session, _, _) = new_session();
        drive_to(&mut session, Stage::DevicesImported, SafetyMode::Safety);
        let safe = session.device_by_name("safety-in").unwrap().id;
        session
            .set_safety_parameters(
                safe,
                SAFETY_INPUTS,
                &values(&[("Discrepancy time", 250.into())]),
            )
            .unwrap();
        let read = session
            .get_safety_parameters(safe, SAFETY_INPUTS, Some(&["Discrepancy time"][..]))
            .unwrap();
        assert_eq!(read["Discrepancy time"], ParameterValue::Integer(250));

        let dut = session.device_by_name("dut").unwrap().id;
        let err = session.get_safety_parameters(dut, GATE, None).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::SafetyModeMismatch);
    }

    #[test]
    fn test_ready_after_all_identities() {
        let (mut session, _, _) = new_session();
        drive_to(&mut session, Stage::DevicesImported, SafetyMode::Standard);
        let dut = session.first_device().unwrap().id;
        session
            .configure_device(dut, &DeviceAddress::new("192.168.60.100", "dut"))
            .unwrap();
        assert_eq!(session.stage(), Stage::DevicesImported);
        let safe = session.last_device().unwrap().id;
        let err = session
            .configure_device(safe, &DeviceAddress::new("192.168.60.100", "other"))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
        session
            .configure_device(safe, &DeviceAddress::new("192.168.60.101", "safety-in"))
            .unwrap();
        assert_eq!(session.stage(), Stage::Ready);
    }

    #[test]
    fn test_configure_device_validates_before_backend() {
        let (mut session, sim, _) = new_session();
        drive_to(&mut session, Stage::DevicesImported, SafetyMode::Standard);
        let dut = session.first_device().unwrap().id;
        let before = sim.call_count();
        let err = session
            .configure_device(
                dut,
                &DeviceAddress {
                    ip_address: Some("192.168.60".into()),
                    station_name: Some("DUT_1".into()),
                },
            )
            .unwrap_err();
        assert_eq!(err.errors().len(), 2);
        assert_eq!(sim.call_count(), before);
    }

    #[test]
    fn test_device_lookup() {
        let (mut session, _, _) = new_session();
        assert_eq!(session.first_device().unwrap_err().kind(), ErrorKind::DeviceNotFound);
        drive_to(&mut session, Stage::DevicesImported, SafetyMode::Standard);
        assert_eq!(session.first_device().unwrap().name, "dut");
        assert_eq!(session.last_device().unwrap().name, "safety-in");
        assert_eq!(
            session.device_by_name("nobody").unwrap_err().kind(),
            ErrorKind::DeviceNotFound
        );
        let err = session
            .configure_device(DeviceId::new(), &DeviceAddress::new("10.0.0.1", "x"))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::DeviceNotFound);
    }

    #[test]
    fn test_partial_attach_keeps_attached_devices() {
        let (mut session, sim, _) = new_session();
        drive_to(&mut session, Stage::Initialized, SafetyMode::Standard);
        sim.reject_device("safety-in");
        let err = session
            .import_devices(&fixture("sample_topology.yaml"), &descriptions())
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::BackendFault);
        assert_eq!(err.first().detail("device"), Some("safety-in"));
        assert_eq!(session.stage(), Stage::Initialized);
        assert_eq!(session.devices().names(), vec!["dut"]);
        assert_eq!(sim.attached_devices(), vec!["dut"]);

        sim.clear_faults();
        let report = session
            .import_devices(&fixture("sample_topology.yaml"), &descriptions())
            .unwrap();
        assert_eq!(report.devices.names(), vec!["dut", "safety-in"]);
        assert_eq!(sim.count(BackendOp::AttachDevice), 3);
        assert_eq!(session.stage(), Stage::DevicesImported);
    }

    #[test]
    fn test_devices_left_by_failed_import_can_be_deleted() {
        let (mut session, sim, _) = new_session();
        drive_to(&mut session, Stage::Initialized, SafetyMode::Standard);
        let nothing_attached = session.delete_device(DeviceId::new()).unwrap_err();
        assert_eq!(nothing_attached.kind(), ErrorKind::StageViolation);

        sim.reject_device("safety-in");
        session
            .import_devices(&fixture("sample_topology.yaml"), &descriptions())
            .unwrap_err();
        let dut = session.device_by_name("dut").unwrap().id;
        session.delete_device(dut).unwrap();
        assert_eq!(session.stage(), Stage::Initialized);
        assert!(session.devices().is_empty());
        assert!(sim.attached_devices().is_empty());
        assert_eq!(sim.count(BackendOp::DetachDevice), 1);

        let again = session.delete_device(dut).unwrap_err();
        assert_eq!(again.kind(), ErrorKind::StageViolation);
    }

    #[test]
    fn test_debug_lists_stage_and_devices() {
        let (mut session, _, _) = new_session();
        drive_to(&mut session, Stage::DevicesImported, SafetyMode::Standard);
        let text = format!("{:?}", session);
        assert!(text.contains("DevicesImported"));
        assert!(text.contains("safety-in"));
    }

    #[test]
    fn test_import_reports_unresolved_entries() {
        let (mut session, _, _) = new_session();
        drive_to(&mut session, Stage::Initialized, SafetyMode::Standard);
        let report = session
            .import_devices(&fixture("mixed_topology.yaml"), &descriptions())
            .unwrap();
        assert_eq!(report.devices.len(), 2);
        assert_eq!(report.unresolved.len(), 2);
        assert_eq!(session.last_device().unwrap().name, "reader-b");
    }

    #[test]
    fn test_catalog_failure_keeps_stage() {
        let (mut session, sim, _) = new_session();
        drive_to(&mut session, Stage::Initialized, SafetyMode::Standard);
        let before = sim.call_count();
        let err = session
            .import_devices(&fixture("sample_topology.yaml"), &[fixture("missing.yaml")])
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ResourceUnavailable);
        assert_eq!(session.stage(), Stage::Initialized);
        assert_eq!(sim.call_count(), before);
    }

    #[test]
    fn test_compile_errors_keep_stage() {
        let (mut session, sim, _) = new_session();
        drive_to(&mut session, Stage::Ready, SafetyMode::Standard);
        sim.set_compile_diagnostics(CompileDiagnostics {
            messages: vec![Diagnostic {
                severity: Severity::Error,
                path: Some("PLC_1/Program blocks/Main".into()),
                description: "Invalid operand".into(),
            }],
        });
        let err = session.compile().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::CompileError);
        assert_eq!(err.first().details["messages"][0]["description"], "Invalid operand");
        assert_eq!(session.stage(), Stage::Ready);

        sim.set_compile_diagnostics(CompileDiagnostics::default());
        session.compile().unwrap();
        assert_eq!(session.stage(), Stage::Compiled);
    }

    #[test]
    fn test_download_preconditions() {
        let (mut session, sim, _) = new_session();
        drive_to(&mut session, Stage::DevicesImported, SafetyMode::Standard);
        session.compile().unwrap();
        // Devices still lack identities.
        let err = session
            .download(DownloadOptions::hardware_and_software())
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::StageViolation);
        assert!(err.first().message.contains("dut"));

        let err = session.download(DownloadOptions::default()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);

        let err = session
            .download(DownloadOptions {
                hardware: false,
                software: false,
                safety: true,
            })
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::SafetyModeMismatch);
        assert_eq!(sim.count(BackendOp::Download), 0);
    }

    #[test]
    fn test_download_after_modification_needs_compile() {
        let (mut session, _, _) = new_session();
        drive_to(&mut session, Stage::Deployed, SafetyMode::Standard);
        let dut = session.first_device().unwrap().id;
        session
            .set_device_parameters(dut, GATE, &values(&[("Restart delay", 10.into())]))
            .unwrap();
        assert!(session.is_modified_since_compile());
        let err = session
            .download(DownloadOptions::hardware_and_software())
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::StageViolation);

        session.compile().unwrap();
        assert_eq!(session.stage(), Stage::Deployed);
        session
            .download(DownloadOptions::hardware_and_software())
            .unwrap();
    }

    #[test]
    fn test_start_stop_toggle_run_state() {
        let (mut session, sim, _) = new_session();
        drive_to(&mut session, Stage::Deployed, SafetyMode::Standard);
        session.stop().unwrap();
        assert_eq!(session.run_state(), RunState::Stopped);
        assert!(!sim.is_running());
        session.start().unwrap();
        assert_eq!(session.run_state(), RunState::Running);
        assert!(sim.is_running());
        assert_eq!(session.stage(), Stage::Deployed);
    }

    #[test]
    fn test_save_project_as() {
        let (mut session, sim, _) = new_session();
        drive_to(&mut session, Stage::Configured, SafetyMode::Standard);
        let saved = session.save_project_as("V111").unwrap();
        assert_eq!(saved, PathBuf::from("/projects/Blank_project_V111.zap17"));
        assert_eq!(sim.snapshots(), vec![saved]);
        assert_eq!(
            session.save_project_as(" ").unwrap_err().kind(),
            ErrorKind::InvalidArgument
        );
        assert_eq!(session.stage(), Stage::Configured);
    }

    #[test]
    fn test_delete_device() {
        let (mut session, sim, _) = new_session();
        drive_to(&mut session, Stage::DevicesImported, SafetyMode::Standard);
        let dut = session.first_device().unwrap().id;
        session
            .configure_device(dut, &DeviceAddress::new("192.168.60.100", "dut"))
            .unwrap();
        let safe = session.last_device().unwrap().id;
        session.delete_device(safe).unwrap();
        assert_eq!(sim.attached_devices(), vec!["dut"]);
        assert_eq!(session.stage(), Stage::Ready);
        assert_eq!(
            session.delete_device(safe).unwrap_err().kind(),
            ErrorKind::DeviceNotFound
        );
    }

    #[test]
    fn test_backend_fault_is_translated() {
        let (mut session, sim, _) = new_session();
        sim.fail_once(BackendOp::OpenProject, "0x8004", "TIA Portal is not installed");
        let err = session.configure(&config()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::BackendFault);
        assert_eq!(err.first().detail("code"), Some("0x8004"));
        assert!(err.first().cause.as_deref().unwrap().contains("not installed"));
        assert_eq!(session.stage(), Stage::Unopened);

        session.configure(&config()).unwrap();
        assert_eq!(session.stage(), Stage::Configured);
    }

    #[test]
    fn test_backend_panic_is_caught() {
        let (mut session, sim, sink) = new_session();
        drive_to(&mut session, Stage::Ready, SafetyMode::Standard);
        sim.panic_on(BackendOp::Compile);
        let err = session.compile().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::BackendFault);
        assert!(err.first().cause.as_deref().unwrap().contains("crashed"));
        assert!(sink.contains(LogLevel::Fatal, "panicked"));
        assert_eq!(session.stage(), Stage::Ready);

        sim.clear_faults();
        session.dispose().unwrap();
        assert_eq!(sim.open_projects(), 0);
    }

    #[test]
    fn test_dispose_is_idempotent() {
        let (mut session, sim, _) = new_session();
        drive_to(&mut session, Stage::Compiled, SafetyMode::Standard);
        session.dispose().unwrap();
        let calls = sim.call_count();
        session.dispose().unwrap();
        assert_eq!(sim.call_count(), calls);
        assert_eq!(sim.count(BackendOp::Close), 1);
        assert_eq!(session.stage(), Stage::Unopened);
        assert!(session.is_disposed());
        assert_eq!(
            session.configure(&config()).unwrap_err().kind(),
            ErrorKind::StageViolation
        );
    }

    #[test]
    fn test_dispose_before_any_stage() {
        let (mut session, sim, _) = new_session();
        session.dispose().unwrap();
        session.dispose().unwrap();
        assert_eq!(sim.call_count(), 0);
    }

    #[test]
    fn test_drop_closes_project() {
        let sim = SimulatedBackend::new();
        {
            let mut session =
                CommissioningSession::new(Box::new(sim.clone()), Arc::new(MemorySink::new()));
            session.configure(&config()).unwrap();
            assert_eq!(sim.open_projects(), 1);
        }
        assert_eq!(sim.open_projects(), 0);
    }

    #[test]
    fn test_scope_tears_down_after_failure() {
        let sim = SimulatedBackend::new();
        let outcome: Outcome<()> = CommissioningSession::scope(
            Box::new(sim.clone()),
            Arc::new(MemorySink::new()),
            |s| {
                s.configure(&config())?;
                s.compile().map(|_| ())
            },
        );
        assert_eq!(outcome.unwrap_err().kind(), ErrorKind::StageViolation);
        assert_eq!(sim.open_projects(), 0);
    }
}
