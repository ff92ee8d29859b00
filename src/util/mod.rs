//! Utility modules: transport retry, timeouts, text helpers.

pub mod retry;
pub mod text;
pub mod timeout;
