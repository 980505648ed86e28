//! Connection resilience.

pub mod retry;
