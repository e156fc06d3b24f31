//! Core types shared across the attention operators.

pub mod config;
pub mod errors;

pub use config::{BackendSelection, Kernel, SdpaConfig, MAX_FUSED_BATCH};
pub use errors::AttentionError;
