//! Shared types between the kernel-facing core and the daemon binary.
//!
//! These are the wire and domain types that cross crate boundaries: the
//! five-tuple and verdict vocabulary the kernel adapter and dispatch
//! pipeline agree on, the classification record shape the upstream
//! predictor returns, and the warehouse capture file format.

pub mod capture;
pub mod classify;
pub mod dict;
pub mod tuple;

pub use capture::{CaptureOrigin, CapturedFrame, FileHeader, WarehouseError};
pub use classify::ClassifiedTraffic;
pub use tuple::{FiveTuple, Protocol, Verdict};
