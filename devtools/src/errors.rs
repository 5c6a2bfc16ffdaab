use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// An external command ran but returned a non-zero exit code.
    #[error("`{command}` failed with exit code {code}")]
    CommandFailed { command: String, code: i32 },

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("{0}")]
    Precondition(String),
}

impl Error {
    /// The exit code to report for this error, non-zero in every case.
    pub fn exit_code(&self) -> i32 {
        match self {
            Error::CommandFailed { code, .. } if *code != 0 => *code,
            _ => -1,
        }
    }
}
