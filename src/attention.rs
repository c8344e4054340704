//! Multi-Head Attention
//!
//! Transformer 的核心组件：允许模型关注输入序列的不同位置。

use log::{log_enabled, trace, Level};
use ndarray::{s, Array2, Array3, Array4, Axis};
use rand::rngs::StdRng;
use std::time::Instant;

use crate::error::{Gpt2Error, Result};
use crate::layers::Dense;
use crate::params::{with_prefix, Parameters};
use crate::tensor::masked_softmax;

/// Multi-Head Attention 参数
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AttentionParams {
    /// 模型维度
    pub d_model: usize,
    /// 注意力头数
    pub n_heads: usize,
    /// 每个头的 Query/Key 维度
    pub d_k: usize,
    /// 每个头的 Value 维度
    pub d_v: usize,
}

impl AttentionParams {
    /// 每头维度取 d_model / n_heads
    pub fn new(d_model: usize, n_heads: usize) -> Result<Self> {
        if n_heads == 0 || d_model % n_heads != 0 {
            return Err(Gpt2Error::config(format!(
                "d_model ({}) must be divisible by n_heads ({})",
                d_model, n_heads
            )));
        }
        let d_head = d_model / n_heads;
        Self::with_head_dims(d_model, n_heads, d_head, d_head)
    }

    /// 显式指定每头维度
    pub fn with_head_dims(d_model: usize, n_heads: usize, d_k: usize, d_v: usize) -> Result<Self> {
        if d_model == 0 || n_heads == 0 || d_k == 0 || d_v == 0 {
            return Err(Gpt2Error::config("attention dimensions must be positive"));
        }
        Ok(Self {
            d_model,
            n_heads,
            d_k,
            d_v,
        })
    }
}

/// Multi-Head Attention 层
///
/// ```text
/// Q, K, V → Dense → Split into Heads →
///     softmax(QKᵀ / √d_k + mask) · V →
///     Concat Heads → Dense → Output
/// ```
///
/// 掩码中为 `false` 的位置在 softmax 前视为 -∞。
#[derive(Debug, Clone)]
pub struct MultiHeadAttention {
    params: AttentionParams,
    /// Query 投影: [d_model, n_heads * d_k]
    query: Dense,
    /// Key 投影: [d_model, n_heads * d_k]
    key: Dense,
    /// Value 投影: [d_model, n_heads * d_v]
    value: Dense,
    /// 输出投影: [n_heads * d_v, d_model]
    out: Dense,
}

impl MultiHeadAttention {
    pub fn new(params: AttentionParams, rng: &mut StdRng) -> Self {
        let AttentionParams {
            d_model,
            n_heads,
            d_k,
            d_v,
        } = params;

        Self {
            params,
            query: Dense::new(d_model, n_heads * d_k, rng),
            key: Dense::new(d_model, n_heads * d_k, rng),
            value: Dense::new(d_model, n_heads * d_v, rng),
            out: Dense::new(n_heads * d_v, d_model, rng),
        }
    }

    /// 前向传播
    ///
    /// # 参数
    /// - `q`: [batch, q_len, d_model]
    /// - `k`: [batch, kv_len, d_model]
    /// - `v`: [batch, kv_len, d_model]
    /// - `mask`: 可选 [batch 或 1, 1, q_len, kv_len]
    ///
    /// # 返回
    /// - 输出 [batch, q_len, d_model]
    /// - 注意力权重 [batch, n_heads, q_len, kv_len]
    pub fn forward(
        &self,
        q: &Array3<f32>,
        k: &Array3<f32>,
        v: &Array3<f32>,
        mask: Option<&Array4<bool>>,
    ) -> Result<(Array3<f32>, Array4<f32>)> {
        let start = if log_enabled!(Level::Trace) { Some(Instant::now()) } else { None };
        let (batch, q_len, kv_len) = self.check_shapes(q, k, v, mask)?;
        let AttentionParams { n_heads, d_k, d_v, .. } = self.params;

        // 1. 投影并拆分多头: [batch, len, n_heads, d]
        let q = self.query.forward(q)?.into_shape((batch, q_len, n_heads, d_k))?;
        let k = self.key.forward(k)?.into_shape((batch, kv_len, n_heads, d_k))?;
        let v = self.value.forward(v)?.into_shape((batch, kv_len, n_heads, d_v))?;

        let scale = (d_k as f32).sqrt();
        let mut weights = Array4::<f32>::zeros((batch, n_heads, q_len, kv_len));
        let mut values = Array4::<f32>::zeros((batch, q_len, n_heads, d_v));

        for b in 0..batch {
            let head_mask = mask.map(|m| {
                let mb = if m.len_of(Axis(0)) == 1 { 0 } else { b };
                m.slice(s![mb, 0, .., ..])
            });

            for h in 0..n_heads {
                let q_h = q.slice(s![b, .., h, ..]);
                let k_h = k.slice(s![b, .., h, ..]);
                let v_h = v.slice(s![b, .., h, ..]);

                // 2. 缩放点积分数: [q_len, kv_len]
                let scores: Array2<f32> = q_h.dot(&k_h.t()) / scale;

                // 3. 掩码 + softmax
                let probs = masked_softmax(&scores, head_mask.clone());

                // 4. 加权求和
                values.slice_mut(s![b, .., h, ..]).assign(&probs.dot(&v_h));
                weights.slice_mut(s![b, h, .., ..]).assign(&probs);
            }
        }

        // 5. 合并多头并输出投影
        let values = values.into_shape((batch, q_len, n_heads * d_v))?;
        let output = self.out.forward(&values)?;

        if let Some(t) = start {
            trace!(
                "attention::forward batch={} q_len={} kv_len={} {:.3}ms",
                batch,
                q_len,
                kv_len,
                t.elapsed().as_secs_f64() * 1000.0
            );
        }

        Ok((output, weights))
    }

    fn check_shapes(
        &self,
        q: &Array3<f32>,
        k: &Array3<f32>,
        v: &Array3<f32>,
        mask: Option<&Array4<bool>>,
    ) -> Result<(usize, usize, usize)> {
        let (batch, q_len, _) = q.dim();
        let (k_batch, kv_len, _) = k.dim();
        let (v_batch, v_len, _) = v.dim();

        if batch != k_batch || batch != v_batch {
            return Err(Gpt2Error::shape(format!(
                "batch sizes differ: q={}, k={}, v={}",
                batch, k_batch, v_batch
            )));
        }
        if kv_len != v_len {
            return Err(Gpt2Error::shape(format!(
                "key length {} != value length {}",
                kv_len, v_len
            )));
        }
        for (name, x) in [("q", q), ("k", k), ("v", v)] {
            if x.dim().2 != self.params.d_model {
                return Err(Gpt2Error::shape(format!(
                    "{} has {} features, expected {}",
                    name,
                    x.dim().2,
                    self.params.d_model
                )));
            }
        }

        if let Some(m) = mask {
            let (mb, one, mq, mk) = m.dim();
            if (mb != batch && mb != 1) || one != 1 || mq != q_len || mk != kv_len {
                return Err(Gpt2Error::shape(format!(
                    "mask shape {:?} incompatible with [{}, 1, {}, {}]",
                    m.shape(),
                    batch,
                    q_len,
                    kv_len
                )));
            }
        }

        Ok((batch, q_len, kv_len))
    }

    /// 获取参数
    pub fn params(&self) -> &AttentionParams {
        &self.params
    }
}

impl Parameters for MultiHeadAttention {
    fn named_params(&self) -> Vec<(String, &Array2<f32>)> {
        let mut params = with_prefix("query", self.query.named_params());
        params.extend(with_prefix("key", self.key.named_params()));
        params.extend(with_prefix("value", self.value.named_params()));
        params.extend(with_prefix("out", self.out.named_params()));
        params
    }

    fn named_params_mut(&mut self) -> Vec<(String, &mut Array2<f32>)> {
        let mut params = with_prefix("query", self.query.named_params_mut());
        params.extend(with_prefix("key", self.key.named_params_mut()));
        params.extend(with_prefix("value", self.value.named_params_mut()));
        params.extend(with_prefix("out", self.out.named_params_mut()));
        params
    }
}
