//! Utility types shared by the threading subsystem.

pub mod newtypes;
pub mod ring_buffer;
pub mod sync;

pub use newtypes::ManagedThreadId;
