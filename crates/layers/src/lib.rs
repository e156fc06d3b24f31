//! Shared layer plumbing for the windowed-attention operators.
//!
//! The crate hosts the projections (dense and pointwise-convolutional), the
//! closed set of normalization strategies, the activation catalogue, and the
//! mixed-precision policy they all share. Projections own their parameters
//! and expose accessors plus copy hooks so an external module initializer can
//! assign weights; no initialization policy is baked in beyond the standard
//! samplers in [`linear::LinearInit`].

pub mod activations;
pub mod checks;
pub mod conv;
pub mod dtypes;
pub mod linear;
pub mod norm;

pub use activations::ActivationKind;
pub use conv::{PointwiseConv2d, PointwiseConv2dConfig};
pub use dtypes::PrecisionPolicy;
pub use linear::{Linear, LinearConfig, LinearInit};
pub use norm::{NormConfig, NormKind, SequenceNorm};
