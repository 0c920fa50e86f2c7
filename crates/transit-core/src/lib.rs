pub mod codes;
pub mod config;
pub mod error;
pub mod record;
pub mod types;

pub use codes::{AdmitError, CompletionCode, PauseError, ResumeError, SwapError};
pub use config::OrchestratorConfig;
pub use error::{Error, Result};
pub use types::*;
