use crate::{
    threading::{orchestrator::SuspendDiagnostics, state::StateSnapshot, transitions::Operation},
    utils::ManagedThreadId,
};
use std::{fmt, time::Duration};
use thiserror::Error;

/// A raw state word, printed decoded when possible.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawWord(pub u32);

impl RawWord {
    pub fn decode(self) -> Option<StateSnapshot> {
        StateSnapshot::decode(self.0)
    }
}

impl fmt::Display for RawWord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.decode() {
            Some(snapshot) => write!(f, "{}", snapshot),
            None => write!(f, "<invalid state word {:#x}>", self.0),
        }
    }
}

/// A transition was attempted from a state it does not accept.
///
/// This is never a runtime condition: it means a caller broke the suspend
/// protocol (two initiators racing, a self transition run by another thread,
/// an unbalanced no-safepoints region...).
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("cannot {operation} from {word}: {reason}")]
pub struct ProtocolDefect {
    pub operation: Operation,
    pub word: RawWord,
    pub reason: &'static str,
}

impl ProtocolDefect {
    pub fn new(operation: Operation, word: RawWord, reason: &'static str) -> Self {
        Self {
            operation,
            word,
            reason,
        }
    }

    pub fn snapshot(&self) -> Option<StateSnapshot> {
        self.word.decode()
    }
}

#[derive(Debug, Error, Clone)]
pub enum SuspendError {
    #[error("protocol defect on thread {thread}: {defect}")]
    Defect {
        thread: ManagedThreadId,
        defect: ProtocolDefect,
    },

    #[error("suspend barrier timed out after {waited:?} with {pending} pending operations")]
    Timeout {
        waited: Duration,
        pending: usize,
        dump: Box<SuspendDiagnostics>,
    },

    #[error("{0} pending operations were never waited for")]
    UnwaitedOperations(usize),

    #[error("barrier out of balance: {posts} posts for {waits} waits")]
    BarrierImbalance { posts: usize, waits: usize },

    #[error("initiator thread {0} cannot suspend or resume itself")]
    SelfTarget(ManagedThreadId),

    #[error("thread {0} could not be resumed: interrupt mechanism refused")]
    ResumeFailed(ManagedThreadId),

    #[error("thread {thread} did not settle into a suspended state after {attempts} attempts")]
    SuspendRetriesExhausted {
        thread: ManagedThreadId,
        attempts: usize,
    },
}

impl SuspendError {
    /// Every variant except a barrier timeout points at a caller bug.
    pub fn is_defect(&self) -> bool {
        !matches!(self, SuspendError::Timeout { .. })
    }

    pub fn defect(&self) -> Option<&ProtocolDefect> {
        match self {
            SuspendError::Defect { defect, .. } => Some(defect),
            _ => None,
        }
    }
}
