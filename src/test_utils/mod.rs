//! Test helpers: in-memory stores with failure injection and recording handlers.

pub mod mocks;

pub use mocks::{MockLedgerStore, RecordingHandler};
