//! Backend registry – maps a manufacturer to the driver that talks to its
//! engineering tool.
//!
//! Only the simulated driver ships with the engine. Hosts that link a vendor
//! driver register its constructor before creating sessions.

use crate::backend::EngineeringBackend;
use crate::error::{ErrorKind, ErrorRecord, Outcome};
use crate::logging::LogSink;
use crate::session::CommissioningSession;
use crate::simulated::SimulatedBackend;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Manufacturer {
    Siemens,
    Beckhoff,
    Rockwell,
    Simulated,
}

impl Manufacturer {
    pub const ALL: [Manufacturer; 4] = [
        Manufacturer::Siemens,
        Manufacturer::Beckhoff,
        Manufacturer::Rockwell,
        Manufacturer::Simulated,
    ];
}

impl std::fmt::Display for Manufacturer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = serde_json::to_value(self)
            .ok()
            .and_then(|v| v.as_str().map(String::from))
            .unwrap_or_else(|| format!("{:?}", self));
        f.write_str(&s)
    }
}

impl std::str::FromStr for Manufacturer {
    type Err = ErrorRecord;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lower = s.trim().to_ascii_lowercase();
        Manufacturer::ALL
            .into_iter()
            .find(|m| m.to_string() == lower)
            .ok_or_else(|| {
                ErrorRecord::new(ErrorKind::InvalidArgument, format!("unknown manufacturer '{}'", s))
                    .with_detail("manufacturer", s)
            })
    }
}

/// Signature for every backend constructor.
pub type BackendConstructor = fn() -> Box<dyn EngineeringBackend>;

pub struct BackendRegistry {
    constructors: HashMap<Manufacturer, BackendConstructor>,
}

impl BackendRegistry {
    /// Registry with the simulated driver only.
    pub fn new() -> Self {
        let mut reg = Self::empty();
        reg.register(Manufacturer::Simulated, simulated);
        reg
    }

    pub fn empty() -> Self {
        Self {
            constructors: HashMap::new(),
        }
    }

    pub fn register(&mut self, manufacturer: Manufacturer, constructor: BackendConstructor) {
        self.constructors.insert(manufacturer, constructor);
    }

    pub fn list(&self) -> Vec<Manufacturer> {
        let mut names: Vec<Manufacturer> = self.constructors.keys().copied().collect();
        names.sort_by_key(|m| m.to_string());
        names
    }

    pub fn is_registered(&self, manufacturer: Manufacturer) -> bool {
        self.constructors.contains_key(&manufacturer)
    }

    /// A fresh, unopened session driving `manufacturer`'s tool.
    pub fn create_session(
        &self,
        manufacturer: Manufacturer,
        log: Arc<dyn LogSink>,
    ) -> Outcome<CommissioningSession> {
        let constructor = self.constructors.get(&manufacturer).ok_or_else(|| {
            ErrorRecord::new(
                ErrorKind::Unsupported,
                format!("no engineering backend registered for {}", manufacturer),
            )
            .with_detail("manufacturer", manufacturer.to_string())
        })?;
        log.debug(&format!("creating {} commissioning session", manufacturer));
        Ok(CommissioningSession::new(constructor(), log))
    }
}

impl Default for BackendRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn simulated() -> Box<dyn EngineeringBackend> {
    Box::new(SimulatedBackend::new())
}
