//! State machine module.

pub(crate) mod handlers;
pub mod machine;

pub use machine::ConnectionState;
