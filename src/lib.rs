// Library surface shared by the CLI binary and the integration tests.
pub mod app;
pub mod config;
pub mod datasource;
pub mod db;
pub mod delta;
pub mod detectors;
pub mod error;
pub mod format;
pub mod issue;
pub mod metrics;
pub mod monitor;
pub mod snapshot;

pub use datasource::{DataSource, Param, Row, Value};
pub use detectors::{Detector, DetectorKind, Findings};
pub use error::EngineError;
pub use issue::{Issue, Severity};
