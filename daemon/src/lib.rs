//! Library surface for `sentryd`'s own binary, plus anything that needs
//! to exercise configuration loading and metrics export as an external
//! consumer would (`daemon/tests/`).

pub mod config;
pub mod metrics;
