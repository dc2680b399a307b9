//! Error types shared across the orchestrator.

pub mod classification;

pub use classification::{error_category_label, Classify, ErrorCategory};

/// Type-erased error returned by task work.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;
