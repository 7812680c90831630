// Resumable, observable bulk importer for InfluxDB-compatible time-series
// data. The commands module is the entry point; everything below it is the
// machinery one run is built from.

pub mod checkpoint;
pub mod commands;
pub mod config;
pub mod engine;
pub mod error;
pub mod estimator;
pub mod models;
pub mod schema;
pub mod sink;
pub mod source;
pub mod timestamps;
pub mod transcoder;

pub use commands::{process_request, Orchestrator};
pub use config::{load_config, ImportConfig, SourceCredentials};
pub use error::{ImportError, ImportResult};
