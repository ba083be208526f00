pub mod attempt;
pub mod config;
pub mod error;
pub mod goal;
pub mod types;

pub use attempt::{AttemptHistory, AttemptStatus};
pub use config::OutreachConfig;
pub use error::{OutreachError, Result};
pub use goal::*;
pub use types::*;
