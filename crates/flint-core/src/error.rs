use crate::Mode;
use std::path::PathBuf;
use thiserror::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Every way a run can be refused or aborted.
///
/// None of these are recovered locally: the run that hit one is over. The
/// imported no-op of `Task::main` is ordinary control flow and never shows up
/// here.
#[derive(Debug, Error)]
pub enum Error {
    /// Bad mode, missing extension point, unusable storage path. Raised before
    /// any side effect.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// The history repository refused an operation.
    #[error("snapshot error: {message}")]
    Snapshot {
        message: String,
        #[source]
        source: Option<git2::Error>,
    },

    /// The artifact directory could not be created, read or claimed.
    #[error("allocation error at {}: {message}", path.display())]
    Allocation {
        path: PathBuf,
        message: String,
        #[source]
        source: Option<std::io::Error>,
    },

    /// Author code raised from inside a skeleton.
    #[error("extension point `{point}` failed")]
    Execution {
        point: &'static str,
        #[source]
        source: BoxError,
    },

    #[error("state conflict: cannot start {requested} while {active} is in progress")]
    StateConflict { active: Mode, requested: Mode },

    #[error("ledger error: {0}")]
    Ledger(String),
}

impl Error {
    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    pub fn snapshot(msg: impl Into<String>, source: git2::Error) -> Self {
        Self::Snapshot {
            message: msg.into(),
            source: Some(source),
        }
    }

    pub fn allocation(path: impl Into<PathBuf>, msg: impl Into<String>) -> Self {
        Self::Allocation {
            path: path.into(),
            message: msg.into(),
            source: None,
        }
    }

    pub fn allocation_io(path: impl Into<PathBuf>, msg: impl Into<String>, source: std::io::Error) -> Self {
        Self::Allocation {
            path: path.into(),
            message: msg.into(),
            source: Some(source),
        }
    }

    pub fn execution(point: &'static str, source: anyhow::Error) -> Self {
        Self::Execution {
            point,
            source: source.into(),
        }
    }

    pub fn ledger(msg: impl Into<String>) -> Self {
        Self::Ledger(msg.into())
    }

    /// Short machine-readable name, used in ledger records and CLI JSON.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::Configuration(_) => "configuration_error",
            Error::Snapshot { .. } => "snapshot_error",
            Error::Allocation { .. } => "allocation_error",
            Error::Execution { .. } => "execution_error",
            Error::StateConflict { .. } => "state_conflict_error",
            Error::Ledger(_) => "ledger_error",
        }
    }
}

/// Render an error together with its whole `source()` chain on one line.
pub fn error_chain(err: &(dyn std::error::Error + 'static)) -> String {
    let mut out = err.to_string();
    let mut cur = err.source();
    while let Some(source) = cur {
        out.push_str(": ");
        out.push_str(&source.to_string());
        cur = source.source();
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn execution_error_keeps_author_context() {
        let author = anyhow::anyhow!("shape mismatch").context("forward on batch 3");
        let err = Error::execution("forward", author);
        let rendered = error_chain(&err);
        assert!(rendered.starts_with("extension point `forward` failed"));
        assert!(rendered.contains("forward on batch 3"), "{}", rendered);
        assert!(rendered.contains("shape mismatch"), "{}", rendered);
        assert_eq!(err.kind(), "execution_error");
    }

    #[test]
    fn state_conflict_names_both_modes() {
        let err = Error::StateConflict {
            active: Mode::Train,
            requested: Mode::Test,
        };
        assert_eq!(
            err.to_string(),
            "state conflict: cannot start test while train is in progress"
        );
    }
}
