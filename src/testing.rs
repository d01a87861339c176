//! Test support: an in-memory session backend and the suite-wide instance.

pub mod fake;
pub mod shared;
