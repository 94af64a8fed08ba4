//! Decision audit and exposure logging.
//!
//! Traces are handed to a [`DecisionRecorder`] on the request path and
//! written to an [`AuditSink`] by a single background task. Exposure
//! events go to a JSON-lines file through [`JsonlExposureLogger`].

#![warn(clippy::unwrap_used)]

pub mod exposure;
pub mod recorder;
pub mod sampling;
pub mod sink;

pub use exposure::{
    hash_subject, ExposedItem, ExposureEvent, ExposureLogger, JsonlExposureLogger,
    MemoryExposureLogger, EXPOSURE_SCHEMA_VERSION,
};
pub use recorder::{DecisionRecorder, RecorderOptions, RecorderStats};
pub use sampling::TraceSampler;
pub use sink::{AuditSink, LogSink, MemorySink, StoreSink};
