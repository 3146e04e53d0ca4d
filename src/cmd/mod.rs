//! CLI command implementations.
//!
//! Each submodule owns one frozen command:
//!
//! | Module     | Command                                         |
//! |------------|--------------------------------------------------|
//! | `init`     | Create the runtime directory tree idempotently  |
//! | `check`    | Validate layout + state + heartbeat             |
//! | `run`      | Start a run                                     |
//! | `status`   | Aggregated view                                 |
//! | `replay`   | Iterate events or snapshots                     |
//! | `takeover` | Accept succession for a run                     |
//! | `handoff`  | Create/apply handoff package                    |

pub mod check;
pub mod handoff;
pub mod init;
pub mod replay;
pub mod run;
pub mod status;
pub mod takeover;

pub use check::cmd_check;
pub use handoff::cmd_handoff;
pub use init::cmd_init;
pub use replay::cmd_replay;
pub use run::cmd_run;
pub use status::cmd_status;
pub use takeover::cmd_takeover;

use std::fmt;

/// A terminal command failure: stable reason code, message, and exit code.
/// Every failure prints as `CODE: message` with a one-line remediation
/// pointer baked into the message.
#[derive(Debug)]
pub struct CliError {
    pub code: &'static str,
    pub message: String,
    pub exit_code: i32,
}

impl CliError {
    pub fn new(code: &'static str, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            exit_code: 1,
        }
    }
}

impl fmt::Display for CliError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl std::error::Error for CliError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_error_renders_code_and_message() {
        let err = CliError::new("E_RUN_FAILED", "ledger write failed");
        assert_eq!(err.to_string(), "E_RUN_FAILED: ledger write failed");
        assert_eq!(err.exit_code, 1);
    }
}
