use thiserror::Error;

/// The analyzer process could not be spawned or collected.
#[derive(Debug, Error)]
pub enum SandboxError {
    #[error("empty command line for {tool}")]
    EmptyCommand { tool: String },

    #[error("failed to spawn `{program}`: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to wait for `{program}`: {source}")]
    Wait {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{0}")]
    Other(String),
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("json: {0}")]
    Json(#[from] serde_json::Error),

    #[error("unknown findings table `{0}`")]
    UnknownTable(String),
}

/// Failures that end an audit run instead of being recorded per tool.
#[derive(Debug, Error)]
pub enum AuditError {
    #[error("unknown tool(s): {}", .0.join(", "))]
    UnknownTools(Vec<String>),

    #[error("{tool} {kind}: {message}")]
    StopOnError {
        tool: String,
        kind: crate::models::FailureKind,
        message: String,
    },

    #[error("project {project} failed with exit code {code}")]
    Project { project: String, code: i32 },

    #[error("storage: {0}")]
    Store(#[from] StoreError),

    #[error("{0}")]
    Io(#[from] std::io::Error),
}

impl AuditError {
    /// Process exit code the CLI reports for this error.
    pub fn exit_code(&self) -> i32 {
        match self {
            AuditError::UnknownTools(_) => 2,
            _ => 1,
        }
    }
}
