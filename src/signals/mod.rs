//! Signal detection - pure detectors, the rule catalog and the processor.

pub mod basic;
pub mod processor;
pub mod rsi;
pub mod rules;

pub use processor::SignalProcessor;
pub use rules::{default_catalog, SignalRule};
