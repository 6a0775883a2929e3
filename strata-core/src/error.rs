//! Strata error abstractions.

use thiserror::Error;

/// The result type of a reconciliation step.
pub type SyncResult<T> = std::result::Result<T, SyncError>;

/// The classification of a sync error, which drives how the controller reacts to it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum ErrorKind {
    /// Expected incompleteness, the key should be synced again later.
    Requeue,
    /// A safety precondition does not hold, the change is blocked until it does.
    Precondition,
    /// An unexpected failure.
    Fatal,
}

impl ErrorKind {
    /// The label value used for this kind in metrics.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Requeue => "requeue",
            Self::Precondition => "precondition",
            Self::Fatal => "error",
        }
    }
}

/// Error variants produced while reconciling a cluster.
#[derive(Debug, Error)]
pub enum SyncError {
    /// Not done yet, retry later.
    #[error("requeue: {0}")]
    Requeue(String),
    /// A safety precondition failed.
    #[error("precondition failed: {0}")]
    Precondition(String),
    /// An unexpected error.
    #[error(transparent)]
    Fatal(#[from] anyhow::Error),
    /// The errors of the ordinals of one scaling batch.
    #[error("{}", join(.0))]
    Aggregate(Vec<SyncError>),
    /// The errors of independent reconciliation steps.
    #[error("{}", join(.0))]
    Combined(Vec<SyncError>),
}

impl SyncError {
    /// Create a new requeue error.
    pub fn requeue(msg: impl Into<String>) -> Self {
        Self::Requeue(msg.into())
    }

    /// Create a new precondition error.
    pub fn precondition(msg: impl Into<String>) -> Self {
        Self::Precondition(msg.into())
    }

    /// Create a new fatal error from a message.
    pub fn fatal(msg: impl Into<String>) -> Self {
        Self::Fatal(anyhow::anyhow!(msg.into()))
    }

    /// The classification of this error.
    ///
    /// An aggregate is a requeue if any of its members is a requeue, as the batch as a whole is
    /// still progressing. Otherwise it is a precondition failure if any member is, else fatal.
    ///
    /// A combination of steps takes the most severe kind of its members.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Requeue(_) => ErrorKind::Requeue,
            Self::Precondition(_) => ErrorKind::Precondition,
            Self::Fatal(_) => ErrorKind::Fatal,
            Self::Aggregate(errs) => {
                let kinds = errs.iter().map(|err| err.kind());
                if kinds.clone().any(|kind| kind == ErrorKind::Requeue) {
                    ErrorKind::Requeue
                } else if kinds.clone().any(|kind| kind == ErrorKind::Precondition) {
                    ErrorKind::Precondition
                } else {
                    ErrorKind::Fatal
                }
            }
            Self::Combined(errs) => errs.iter().map(|err| err.kind()).max().unwrap_or(ErrorKind::Fatal),
        }
    }

    /// All non-aggregate errors contained in this error, depth first.
    pub fn leaves(&self) -> Vec<&SyncError> {
        match self {
            Self::Aggregate(errs) | Self::Combined(errs) => errs.iter().flat_map(|err| err.leaves()).collect(),
            other => vec![other],
        }
    }

    /// Collapse the errors of a scaling batch into a single result.
    ///
    /// No errors is success, a single error is returned as is.
    pub fn aggregate(mut errs: Vec<SyncError>) -> SyncResult<()> {
        match errs.len() {
            0 => Ok(()),
            1 => Err(errs.remove(0)),
            _ => Err(Self::Aggregate(errs)),
        }
    }

    /// Collapse the errors of independent steps into a single result.
    pub fn combine(mut errs: Vec<SyncError>) -> SyncResult<()> {
        match errs.len() {
            0 => Ok(()),
            1 => Err(errs.remove(0)),
            _ => Err(Self::Combined(errs)),
        }
    }
}

fn join(errs: &[SyncError]) -> String {
    let msgs: Vec<_> = errs.iter().map(|err| err.to_string()).collect();
    format!("[{}]", msgs.join(", "))
}
