use candle_core::{Result, Tensor};
use candle_nn::{Linear, VarBuilder};

use crate::building_blocks::nn::{linear_xavier, Autocast, DenseRegressor, MultiHeadAttention};
use crate::training::hyperparams::Hyperparameters;

/// Projection -> multi-head self-attention -> token mean -> dense regressor.
///
/// Token sequences `(N, T, C)` attend across all T positions; a flattened
/// representation `(N, D)` is treated as a single token, for which the
/// attention weights are `(N, heads, 1, 1)`.
#[derive(Debug, Clone)]
pub struct AttentionRegressionHead {
    projection: Linear,
    attention: MultiHeadAttention,
    dense: DenseRegressor,
}

impl AttentionRegressionHead {
    pub fn new(vb: &VarBuilder, in_dim: usize, hp: &Hyperparameters) -> Result<Self> {
        Ok(Self {
            projection: linear_xavier(vb, in_dim, hp.d_model, "projection")?,
            attention: MultiHeadAttention::new(&vb.pp("attention"), hp.d_model, hp.num_heads)?,
            dense: DenseRegressor::new(
                &vb.pp("dense"),
                hp.d_model,
                hp.dense_hidden_dim,
                hp.dropout_rate as f32,
            )?,
        })
    }

    /// `(N, T, C)` tokens to `(N, 1)` predictions and `(N, heads, T, T)` weights.
    pub fn forward_tokens(&self, tokens: &Tensor, train: bool, autocast: &Autocast) -> Result<(Tensor, Tensor)> {
        let x = autocast.linear(&self.projection, tokens)?;
        let (attended, attn_weights) = self.attention.forward(&x, autocast)?;
        let pooled = attended.mean(1)?;
        let prediction = self.dense.forward(&pooled, train, autocast)?;
        Ok((prediction, attn_weights))
    }

    /// `(N, D)` flat features handled as a length-1 sequence.
    pub fn forward_flat(&self, flat: &Tensor, train: bool, autocast: &Autocast) -> Result<(Tensor, Tensor)> {
        self.forward_tokens(&flat.unsqueeze(1)?, train, autocast)
    }
}
