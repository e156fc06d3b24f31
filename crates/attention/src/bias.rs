//! Learned relative-position bias for windowed attention scores.
//!
//! Two positions inside a window interact through their relative offset
//! `(Δrow, Δcol)`, not their absolute coordinates. For a window of
//! `N = h * w` positions there are `N²` ordered pairs but at most
//! `(2h − 1) * (2w − 1)` distinct offsets, so the bias network only ever
//! evaluates the unique offsets and the full `N × N` score matrix is filled
//! in by gather. The offset and index tables are plain fixed arrays computed
//! once at construction (no hashing, no caches) and are immutable
//! afterwards, safe for unlimited concurrent readers.
//!
//! The produced matrix is added by the caller to pre-softmax attention
//! scores. It is not symmetric in general: `delta(i, j) = -delta(j, i)` and
//! the network is not constrained to be odd or even.

use candle_core::{DType, Device, Tensor};
use layers::{ActivationKind, Linear, LinearConfig, LinearInit, PrecisionPolicy};
use layout::Window2d;

use crate::core::AttentionError;

/// Configuration for [`WindowScoreBias`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowScoreBiasConfig {
    /// Window geometry the bias is generated for.
    pub window: Window2d,
    /// Hidden width of the bias network; defaults to `2 * floor(sqrt(N))`.
    pub hidden_dim: Option<usize>,
}

impl WindowScoreBiasConfig {
    /// Creates a configuration with the default hidden width.
    pub fn new(window: Window2d) -> Self {
        Self {
            window,
            hidden_dim: None,
        }
    }
}

/// Host-side offset tables, deduplicated and canonically ordered.
struct OffsetTables {
    /// Flattened `(unique, 2)` offsets, normalized to `[-1, 1]`.
    deltas: Vec<f32>,
    /// Per-pair index into the unique offsets, length `N²`.
    index: Vec<u32>,
    unique: usize,
}

fn build_offset_tables(window: Window2d) -> OffsetTables {
    let positions: Vec<(i64, i64)> = (0..window.height as i64)
        .flat_map(|row| (0..window.width as i64).map(move |col| (row, col)))
        .collect();

    let mut pair_deltas = Vec::with_capacity(positions.len() * positions.len());
    for &(qr, qc) in &positions {
        for &(kr, kc) in &positions {
            pair_deltas.push((qr - kr, qc - kc));
        }
    }

    // Canonical order: lexicographic ascending over (Δrow, Δcol).
    let mut unique = pair_deltas.clone();
    unique.sort_unstable();
    unique.dedup();

    let index = pair_deltas
        .iter()
        .map(|delta| unique.binary_search(delta).expect("delta in unique set") as u32)
        .collect();

    let max_abs = unique
        .iter()
        .flat_map(|&(dr, dc)| [dr.abs(), dc.abs()])
        .max()
        .unwrap_or(0);
    // A (1, 1) window has the zero offset only; leave it unnormalized.
    let scale = if max_abs == 0 { 1.0 } else { max_abs as f32 };

    let deltas = unique
        .iter()
        .flat_map(|&(dr, dc)| [dr as f32 / scale, dc as f32 / scale])
        .collect();

    OffsetTables {
        deltas,
        index,
        unique: unique.len(),
    }
}

/// Learned relative-position bias over one window geometry.
#[derive(Debug, Clone)]
pub struct WindowScoreBias {
    window: Window2d,
    delta: Tensor,
    index: Tensor,
    fc1: Linear,
    fc2: Linear,
    activation: ActivationKind,
    policy: PrecisionPolicy,
}

impl WindowScoreBias {
    /// Precomputes the offset tables and builds the bias network.
    pub fn new(
        config: WindowScoreBiasConfig,
        device: &Device,
        dtype: DType,
    ) -> Result<Self, AttentionError> {
        let window = config.window;
        let tokens = window.tokens();
        let tables = build_offset_tables(window);

        log::debug!(
            "window score bias ({}, {}): {} unique offsets over {} pairs",
            window.height,
            window.width,
            tables.unique,
            tables.index.len(),
        );

        let delta = Tensor::from_vec(tables.deltas, (tables.unique, 2), device)?;
        let index = Tensor::from_vec(tables.index, tokens * tokens, device)?;

        let hidden_dim = config
            .hidden_dim
            .unwrap_or_else(|| ((tokens as f64).sqrt() as usize) * 2)
            .max(1);
        let fc1 = Linear::with_init(
            LinearConfig::new(2, hidden_dim),
            &LinearInit::XavierUniform,
            device,
            dtype,
        )?;
        let fc2 = Linear::with_init(
            LinearConfig::new(hidden_dim, 1),
            &LinearInit::XavierUniform,
            device,
            dtype,
        )?;

        Ok(Self {
            window,
            delta,
            index,
            fc1,
            fc2,
            activation: ActivationKind::Gelu,
            policy: PrecisionPolicy::from_parameter_dtype(dtype),
        })
    }

    /// Window geometry the bias is generated for.
    pub fn window(&self) -> Window2d {
        self.window
    }

    /// Number of distinct relative offsets in the table.
    pub fn unique_offsets(&self) -> usize {
        self.delta.dims()[0]
    }

    /// Immutable `(N², )` index buffer.
    pub fn index(&self) -> &Tensor {
        &self.index
    }

    /// Immutable `(unique, 2)` normalized-offset buffer.
    pub fn delta(&self) -> &Tensor {
        &self.delta
    }

    /// First bias-network projection. Initializer access.
    pub fn fc1_mut(&mut self) -> &mut Linear {
        &mut self.fc1
    }

    /// Second bias-network projection. Initializer access.
    pub fn fc2_mut(&mut self) -> &mut Linear {
        &mut self.fc2
    }

    /// Produces the `(N, N)` additive score-bias matrix.
    ///
    /// The bias network runs once per unique offset, `O(unique)` rather
    /// than `O(N²)`, and the pairwise matrix is assembled by gather.
    pub fn forward(&self) -> Result<Tensor, AttentionError> {
        let tokens = self.window.tokens();

        let hidden = self.fc1.forward(&self.delta, &self.policy)?;
        let hidden = self.activation.forward(&hidden, &self.policy)?;
        let scores = self.fc2.forward(&hidden, &self.policy)?;

        let gathered = scores.index_select(&self.index, 0)?;
        Ok(gathered.reshape((tokens, tokens))?)
    }
}
