//! Utility functions and types for the market data engine.

pub mod error;
pub mod logging;
pub mod types;

pub use error::Error;
pub use logging::init_logging;
pub use types::*;

/// Re-export of commonly used types
pub mod prelude {
    pub use super::{
        error::{Error, Result},
        logging::init_logging,
        types::*,
    };
}
