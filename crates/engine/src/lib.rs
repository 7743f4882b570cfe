//! Engine crate – PLC commissioning workflow shared by the CLI and any
//! automation host.
//!
//! Everything that touches a vendor engineering tool sits behind the
//! [`backend::EngineeringBackend`] trait, and every component that logs
//! receives a [`logging::LogSink`], so the crate carries no process-wide
//! state and runs headless against [`simulated::SimulatedBackend`].

pub mod backend;
pub mod catalog;
pub mod config;
pub mod document;
pub mod error;
pub mod factory;
pub mod logging;
pub mod model;
pub mod scenario;
pub mod session;
pub mod simulated;
pub mod topology;
pub mod types;

// Re-exports for convenience
pub use catalog::Catalog;
pub use config::ProjectConfig;
pub use error::{ErrorKind, ErrorRecord, Failure, Outcome};
pub use factory::{BackendRegistry, Manufacturer};
pub use logging::{LogLevel, LogSink};
pub use session::{CommissioningSession, Stage};
pub use types::{ScenarioResult, Status, StepReport};
