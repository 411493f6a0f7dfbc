use thiserror::Error;

/// Failures the engine surfaces to callers by name rather than as opaque context chains.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("unknown detector '{0}'; run `pgscout detectors` for the list")]
    UnknownDetector(String),

    #[error("no snapshots recorded in {series}; run `pgscout monitor snapshot` first")]
    InsufficientHistory { series: String },

    #[error("detector {0} cannot be run as a leaf routine")]
    NotSelectable(&'static str),

    #[error("no pgscout tracking tables in schema {schema}; run `pgscout monitor initialize` first")]
    MonitorNotInitialized { schema: String },
}
