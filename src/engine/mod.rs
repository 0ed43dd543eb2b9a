//! Core engine: discovery → reconciliation → decision → execution.

pub mod backoff;
pub mod cycle;
pub mod discovery;
pub mod executor;
pub mod pricing;
pub mod reconciler;
