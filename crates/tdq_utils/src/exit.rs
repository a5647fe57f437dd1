use std::process::ExitCode;

/// Exit code for errors that happen before any work could be done, like a malformed
/// configuration or an unbindable address.
pub const CODE_ERROR: u8 = 101;

/// Exit status of a tdq command.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExitStatus {
    Success,
    /// Work completed, but some tests failed.
    TestsFailed,
    Error,
}

impl ExitStatus {
    pub fn code(self) -> u8 {
        match self {
            ExitStatus::Success => 0,
            ExitStatus::TestsFailed => 1,
            ExitStatus::Error => CODE_ERROR,
        }
    }
}

impl From<ExitStatus> for ExitCode {
    fn from(status: ExitStatus) -> Self {
        ExitCode::from(status.code())
    }
}
