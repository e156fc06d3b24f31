//! Configuration threaded through the attention call.
//!
//! Backend selection is an explicit, enum-valued parameter rather than an
//! ambient execution-context toggle: resolution is a pure function of the
//! selection and the batch dimension, so the policy can be tested in
//! isolation and a given call always dispatches the same kernel.

use crate::core::errors::AttentionError;

/// Largest batch dimension accepted by the fused kernels.
///
/// Fused/optimized attention kernels on some accelerators reject launch
/// configurations with a batch dimension above this bound, so resolution
/// forces the reference kernel beyond it. This is a compatibility policy,
/// not a correctness branch: both kernels agree within floating-point
/// tolerance.
pub const MAX_FUSED_BATCH: usize = 65_535;

/// Which execution backend the caller wants for the attention kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BackendSelection {
    /// Prefer the fused kernel when compiled in and applicable, fall back to
    /// the reference kernel otherwise.
    #[default]
    Auto,
    /// Require the fused kernel. Construction fails when it is not compiled
    /// in; batches beyond [`MAX_FUSED_BATCH`] still take the reference path.
    Fused,
    /// Always use the reference kernel.
    Reference,
}

/// Kernel actually dispatched after policy resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kernel {
    /// Hardware-accelerated fused kernel (`fused` feature).
    Fused,
    /// Portable matmul + softmax kernel; numerically exact, always present.
    Reference,
}

impl BackendSelection {
    /// Whether this build carries the fused kernels.
    pub fn fused_compiled() -> bool {
        cfg!(feature = "fused")
    }

    /// Construction-time capability check. Fails when the selection requires
    /// a kernel this build cannot provide. Distinct from the batch-size
    /// fallback in [`resolve`](Self::resolve), which is non-fatal.
    pub fn ensure_supported(&self) -> Result<(), AttentionError> {
        match self {
            Self::Fused if !Self::fused_compiled() => Err(AttentionError::UnsupportedBackend {
                reason: "fused kernels are not compiled in (enable the `fused` feature)".into(),
            }),
            _ => Ok(()),
        }
    }

    /// Resolves the selection to a kernel for a given batch dimension.
    pub fn resolve(&self, batch: usize) -> Kernel {
        match self {
            Self::Reference => Kernel::Reference,
            Self::Fused | Self::Auto if batch > MAX_FUSED_BATCH => Kernel::Reference,
            Self::Fused => Kernel::Fused,
            Self::Auto => {
                if Self::fused_compiled() {
                    Kernel::Fused
                } else {
                    Kernel::Reference
                }
            }
        }
    }
}

/// Configuration driving one scaled-dot-product attention call.
#[derive(Debug, Clone, PartialEq)]
pub struct SdpaConfig {
    /// Kernel selection policy.
    pub backend: BackendSelection,
    /// Probability for dropout applied to attention weights during training.
    /// `None` disables dropout and keeps the computation deterministic.
    pub dropout_p: Option<f32>,
    /// When set, each token attends only to itself and prior tokens.
    pub causal: bool,
}

impl Default for SdpaConfig {
    fn default() -> Self {
        Self {
            backend: BackendSelection::Auto,
            dropout_p: None,
            causal: false,
        }
    }
}
