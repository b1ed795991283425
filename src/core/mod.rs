pub mod config;
pub mod errors;
pub mod logging;

pub use config::{LoggingConfig, MasterConfig, MasterConfigBuilder};
pub use errors::{ConvoyError, ErrorKind, Result};
pub use logging::init_logging;
