// Core infrastructure shared by the execution tree and the job pipeline

pub mod clock;
pub mod config;
pub mod errors;
pub mod logging;

// Re-export commonly used types
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{EngineConfig, EngineConfigBuilder};
pub use errors::{EngineError, Result};
pub use logging::{init_test_tracing, init_tracing};
