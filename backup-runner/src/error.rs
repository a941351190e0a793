use backup_engine::EngineError;
use serde_json::json;

/// Command failure, mapped onto a process exit code.
#[derive(thiserror::Error, Debug)]
pub enum CliError {
    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    BadRequest(String),

    #[error("{0}")]
    Conflict(String),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl CliError {
    pub fn exit_code(&self) -> u8 {
        match self {
            CliError::Internal(_) => 1,
            CliError::BadRequest(_) => 2,
            CliError::NotFound(_) => 3,
            CliError::Conflict(_) => 4,
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            CliError::NotFound(_) => "not_found",
            CliError::BadRequest(_) => "bad_request",
            CliError::Conflict(_) => "conflict",
            CliError::Internal(_) => "internal",
        }
    }

    /// Print the error as one JSON object on stdout, next to the normal
    /// command output.
    pub fn report(&self) {
        let msg = match self {
            CliError::Internal(e) => {
                tracing::error!("Internal error: {e:#}");
                format!("{e:#}")
            }
            other => other.to_string(),
        };
        println!("{}", json!({ "error": msg, "kind": self.kind() }));
    }
}

impl From<EngineError> for CliError {
    fn from(err: EngineError) -> Self {
        match err {
            EngineError::Validation(_) | EngineError::Cron(_) | EngineError::Unsatisfiable(_) => {
                CliError::BadRequest(err.to_string())
            }
            EngineError::NotFound(_) => CliError::NotFound(err.to_string()),
            EngineError::Conflict(_) => CliError::Conflict(err.to_string()),
            other => CliError::Internal(other.into()),
        }
    }
}

pub type CliResult<T> = Result<T, CliError>;
