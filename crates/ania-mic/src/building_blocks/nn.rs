use candle_core::{DType, Module, Result, Tensor};
use candle_nn::{Dropout, Init, Linear, VarBuilder};

/// Xavier/Glorot uniform initialiser for a weight with the given fans.
pub fn xavier_uniform(fan_in: usize, fan_out: usize) -> Init {
    let bound = (6.0 / (fan_in + fan_out) as f64).sqrt();
    Init::Uniform {
        lo: -bound,
        up: bound,
    }
}

/// Linear layer with a Xavier-uniform weight and a zero bias.
pub fn linear_xavier(vb: &VarBuilder, in_dim: usize, out_dim: usize, prefix: &str) -> Result<Linear> {
    let weight = vb.get_with_hints(
        (out_dim, in_dim),
        &format!("{}.weight", prefix),
        xavier_uniform(in_dim, out_dim),
    )?;
    let bias = vb.get_with_hints(out_dim, &format!("{}.bias", prefix), Init::Const(0.))?;
    Ok(Linear::new(weight, Some(bias)))
}

/// Reduced-precision compute policy for convolutions and matmuls.
///
/// When active, inputs and weights are cast to the half dtype for the
/// operation and the result is cast back to f32, so normalisation, softmax
/// and losses always run in full precision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Autocast {
    dtype: Option<DType>,
}

impl Autocast {
    pub fn disabled() -> Self {
        Self { dtype: None }
    }

    pub fn half(dtype: DType) -> Self {
        Self { dtype: Some(dtype) }
    }

    pub fn is_enabled(&self) -> bool {
        self.dtype.is_some()
    }

    pub fn dtype(&self) -> Option<DType> {
        self.dtype
    }

    pub fn linear(&self, layer: &Linear, x: &Tensor) -> Result<Tensor> {
        match self.dtype {
            None => layer.forward(x),
            Some(dt) => {
                let weight = layer.weight().to_dtype(dt)?;
                let bias = layer.bias().map(|b| b.to_dtype(dt)).transpose()?;
                Linear::new(weight, bias)
                    .forward(&x.to_dtype(dt)?)?
                    .to_dtype(DType::F32)
            }
        }
    }

    pub fn conv2d(&self, x: &Tensor, kernel: &Tensor, padding: usize) -> Result<Tensor> {
        match self.dtype {
            None => x.conv2d(kernel, padding, 1, 1, 1),
            Some(dt) => x
                .to_dtype(dt)?
                .conv2d(&kernel.to_dtype(dt)?, padding, 1, 1, 1)?
                .to_dtype(DType::F32),
        }
    }

    pub fn conv1d(&self, x: &Tensor, kernel: &Tensor, padding: usize) -> Result<Tensor> {
        match self.dtype {
            None => x.conv1d(kernel, padding, 1, 1, 1),
            Some(dt) => x
                .to_dtype(dt)?
                .conv1d(&kernel.to_dtype(dt)?, padding, 1, 1, 1)?
                .to_dtype(DType::F32),
        }
    }
}

/// Self-attention over `(batch, tokens, dim)` returning the context and the
/// per-head attention weights `(batch, heads, tokens, tokens)`.
#[derive(Debug, Clone)]
pub struct MultiHeadAttention {
    proj_q: Linear,
    proj_k: Linear,
    proj_v: Linear,
    proj_out: Linear,
    num_heads: usize,
    head_dim: usize,
}

impl MultiHeadAttention {
    pub fn new(varbuilder: &VarBuilder, model_dim: usize, num_heads: usize) -> Result<Self> {
        if num_heads == 0 || model_dim % num_heads != 0 {
            candle_core::bail!(
                "d_model ({}) must be divisible by num_heads ({})",
                model_dim,
                num_heads
            );
        }
        let head_dim = model_dim / num_heads;
        Ok(Self {
            proj_q: linear_xavier(varbuilder, model_dim, model_dim, "proj_q")?,
            proj_k: linear_xavier(varbuilder, model_dim, model_dim, "proj_k")?,
            proj_v: linear_xavier(varbuilder, model_dim, model_dim, "proj_v")?,
            proj_out: linear_xavier(varbuilder, model_dim, model_dim, "proj_out")?,
            num_heads,
            head_dim,
        })
    }

    pub fn num_heads(&self) -> usize {
        self.num_heads
    }

    pub fn forward(&self, x: &Tensor, autocast: &Autocast) -> Result<(Tensor, Tensor)> {
        let (b, t, _) = x.dims3()?;
        log::trace!(
            "[MultiHeadAttention] Input shape: b={}, t={}, head_dim={} (num_heads={})",
            b,
            t,
            self.head_dim,
            self.num_heads
        );

        let split_heads = |proj: &Linear| -> Result<Tensor> {
            autocast
                .linear(proj, x)?
                .reshape((b, t, self.num_heads, self.head_dim))?
                .transpose(1, 2)?
                .contiguous()
        };
        let q = split_heads(&self.proj_q)?;
        let k = split_heads(&self.proj_k)?;
        let v = split_heads(&self.proj_v)?;

        let k_t = k.transpose(2, 3)?.contiguous()?;
        let scores = match q.matmul(&k_t) {
            Ok(s) => (s / (self.head_dim as f64).sqrt())?,
            Err(e) => {
                log::error!("[MultiHeadAttention] Failed during matmul for scores: {}", e);
                return Err(e);
            }
        };

        let attn = candle_nn::ops::softmax(&scores, scores.rank() - 1)?;
        let context = attn
            .matmul(&v)?
            .transpose(1, 2)?
            .reshape((b, t, self.num_heads * self.head_dim))?;

        log::trace!("[MultiHeadAttention] Context shape: {:?}", context.shape());
        Ok((autocast.linear(&self.proj_out, &context)?, attn))
    }
}

/// Linear -> ReLU -> Dropout -> Linear mapping to one scalar per sample.
#[derive(Debug, Clone)]
pub struct DenseRegressor {
    hidden: Linear,
    output: Linear,
    dropout: Dropout,
}

impl DenseRegressor {
    pub fn new(vb: &VarBuilder, in_dim: usize, hidden_dim: usize, dropout_rate: f32) -> Result<Self> {
        Ok(Self {
            hidden: linear_xavier(vb, in_dim, hidden_dim, "0")?,
            output: linear_xavier(vb, hidden_dim, 1, "3")?,
            dropout: Dropout::new(dropout_rate),
        })
    }

    pub fn forward(&self, x: &Tensor, train: bool, autocast: &Autocast) -> Result<Tensor> {
        let x = autocast.linear(&self.hidden, x)?.relu()?;
        let x = self.dropout.forward(&x, train)?;
        autocast.linear(&self.output, &x)
    }
}
