/// Control-plane error types.
///
/// Every failure surfaced by the hive control plane is a [`CtlError`].
/// Errors from blocking collaborator calls are wrapped with the failing
/// operation's name through [`ResultExt::context`].

use std::fmt;
use std::time::Duration;

use crate::rank::Rank;

/// Unified error type for all control-plane operations.
#[derive(Debug, thiserror::Error)]
pub enum CtlError {
    // Identity
    #[error("nil superblock")]
    NoSuperblock,
    #[error("nil rank in superblock")]
    NoRank,

    // Membership
    #[error("rank {0} excluded")]
    RankExcluded(Rank),
    #[error("rank {0} restarting to enable checker")]
    CheckerRestart(Rank),

    // Transport and protocol
    #[error("{op}: {status}")]
    Status { op: &'static str, status: i32 },
    #[error("dRPC call returned {0}")]
    DrpcFailure(String),
    #[error("unknown member state {0:#x}")]
    UnknownMemberState(i32),
    #[error("unknown dRPC method {module}:{method}")]
    UnknownMethod { module: i32, method: i32 },
    #[error("unmarshal {what}: {reason}")]
    Decode { what: &'static str, reason: String },
    #[error("message of {0} bytes exceeds limit")]
    MessageTooLarge(usize),
    #[error("network error: {0}")]
    Network(String),
    #[error("timed out after {0:?}")]
    Timeout(Duration),
    #[error("operation canceled")]
    Canceled,

    // Persistence
    #[error("superblock: {0}")]
    Superblock(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // Supervision
    #[error("engine runner: {0}")]
    Runner(String),
    #[error("engine instance {0} not found")]
    NoInstance(u32),
    #[error("invalid fault domain {0:?}")]
    InvalidFaultDomain(String),
    #[error("engine instance has a nil fault domain")]
    NoFaultDomain,
    #[error("{}", CallbackErrors(.0))]
    Callbacks(Vec<CtlError>),

    #[error("{context}: {source}")]
    Context {
        context: &'static str,
        #[source]
        source: Box<CtlError>,
    },
}

impl CtlError {
    /// Wrap this error with static context naming the failing operation.
    pub fn context(self, context: &'static str) -> Self {
        Self::Context {
            context,
            source: Box::new(self),
        }
    }

    /// The innermost error, skipping any context wrappers.
    pub fn root_cause(&self) -> &CtlError {
        match self {
            Self::Context { source, .. } => source.root_cause(),
            other => other,
        }
    }

    /// Identity errors: the instance has not been formatted or has not joined.
    pub fn is_identity(&self) -> bool {
        matches!(self.root_cause(), Self::NoSuperblock | Self::NoRank)
    }
}

struct CallbackErrors<'a>(&'a [CtlError]);

impl fmt::Display for CallbackErrors<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} callback(s) failed", self.0.len())?;
        for (i, e) in self.0.iter().enumerate() {
            let sep = if i == 0 { ": " } else { "; " };
            write!(f, "{}{}", sep, e)?;
        }
        Ok(())
    }
}

/// Result type alias for control-plane operations.
pub type CtlResult<T> = Result<T, CtlError>;

/// Attach operation context to a [`CtlResult`].
pub trait ResultExt<T> {
    fn context(self, context: &'static str) -> CtlResult<T>;
}

impl<T> ResultExt<T> for CtlResult<T> {
    fn context(self, context: &'static str) -> CtlResult<T> {
        self.map_err(|e| e.context(context))
    }
}

impl From<prost::DecodeError> for CtlError {
    fn from(e: prost::DecodeError) -> Self {
        CtlError::Decode {
            what: "message",
            reason: e.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_context_display() {
        let err = CtlError::Status {
            op: "SetRank",
            status: -1003,
        }
        .context("SetRank failed");
        assert_eq!(err.to_string(), "SetRank failed: SetRank: -1003");
    }

    #[test]
    fn test_root_cause_skips_wrappers() {
        let err: CtlResult<()> = Err(CtlError::NoRank);
        let err = err.context("inner").context("outer").unwrap_err();
        assert!(matches!(err.root_cause(), CtlError::NoRank));
        assert!(err.is_identity());
    }

    #[test]
    fn test_callbacks_display() {
        let err = CtlError::Callbacks(vec![
            CtlError::NoSuperblock,
            CtlError::Runner("boom".into()),
        ]);
        assert_eq!(
            err.to_string(),
            "2 callback(s) failed: nil superblock; engine runner: boom"
        );
    }
}
