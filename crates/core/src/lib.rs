#![warn(clippy::unwrap_used)]

pub mod clock;
pub mod config;
pub mod context;
pub mod error;
pub mod recommendation;
pub mod request;
pub mod store;
pub mod trace;
pub mod types;

pub use clock::{Clock, FixedClock, SystemClock};
pub use config::AppConfig;
pub use context::{CancelToken, RequestCtx};
pub use error::{ErrorKind, RecsysError, RecsysResult};
pub use recommendation::{BlendWeights, ConfigCell, ConfigSnapshot, RecommendationConfig, TuningOverrides};
pub use request::Warning;
pub use store::Store;
