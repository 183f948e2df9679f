//! Subcommand implementations.
//!
//! Each command returns its exit code instead of an error so that the
//! binary can distinguish a failed check from a usage problem.

pub mod keygen;
pub mod verify;

/// Exit codes shared by every command.
pub mod exit_codes {
    /// Everything verified.
    pub const SUCCESS: u8 = 0;
    /// Verification failed or raised.
    pub const INVALID: u8 = 1;
    /// Missing files or bad arguments.
    pub const USAGE: u8 = 2;
}

/// Why a command did not succeed.
#[derive(Debug)]
pub enum Failure {
    /// Caller error: exit [`exit_codes::USAGE`].
    Usage(anyhow::Error),
    /// Check failed: exit [`exit_codes::INVALID`].
    Invalid(anyhow::Error),
}

impl Failure {
    /// Prints the failure and returns its exit code.
    pub fn report(self) -> u8 {
        match self {
            Self::Usage(e) => {
                eprintln!("error: {e:#}");
                exit_codes::USAGE
            },
            Self::Invalid(e) => {
                eprintln!("invalid: {e:#}");
                exit_codes::INVALID
            },
        }
    }
}
