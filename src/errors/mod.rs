use core::fmt;
use std::error::Error;
use std::fmt::Display;

/// Raft library error.
///
/// Ordinary Raft-level rejections (vote denials, AppendEntries mismatches) are
/// expressed via reply booleans and never surface as errors.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum RaftError {
    /// A blocking operation observed its cancellation signal. The member is
    /// left in an undefined volatile state and must be torn down.
    Cancelled,

    /// RPC delivery to the destination member failed. The request may or may
    /// not have been delivered. The caller should wait until the member
    /// reappears in the connectivity view before retrying.
    PeerUnavailable { text: String },

    /// Any other failure, with a description of the immediate cause.
    General { text: String, cause: String },

    /// Several failures collapsed into one (e.g. a fan-out to peers).
    Multiple { text: String, causes: Vec<RaftError> },
}

impl RaftError {
    pub fn is_cancelled(&self) -> bool {
        *self == RaftError::Cancelled
    }
}

pub fn new_err<T>(text: String, cause: String) -> Result<T, RaftError> {
    Err(RaftError::General { text, cause })
}

pub fn new_unavailable_err<T>(text: String) -> Result<T, RaftError> {
    Err(RaftError::PeerUnavailable { text })
}

pub fn new_multiple_err<T>(text: String, causes: Vec<RaftError>) -> Result<T, RaftError> {
    Err(RaftError::Multiple { text, causes })
}

impl Display for RaftError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            RaftError::Cancelled => write!(f, "Operation cancelled"),
            RaftError::PeerUnavailable { text } => write!(f, "Peer unavailable: {}", text),
            RaftError::General { text, cause } => write!(f, "{}. Cause: {}", text, cause),
            RaftError::Multiple { text, causes } => {
                let mut causes_string = String::new();
                for err in causes {
                    causes_string.push_str(&format!("{};", err));
                }
                write!(f, "{}. Causes: {}", text, causes_string)
            }
        }
    }
}

impl Error for RaftError {}
