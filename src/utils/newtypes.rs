use serde::Serialize;
use std::fmt::{self, Display, Formatter};

/// Stable identifier of a managed thread, unique for the lifetime of the process.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct ManagedThreadId(pub u64);

impl ManagedThreadId {
    pub const fn new(id: u64) -> Self {
        ManagedThreadId(id)
    }
}

impl Display for ManagedThreadId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
