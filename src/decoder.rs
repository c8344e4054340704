//! Decoder 层
//!
//! GPT-2 的基本堆叠单元：带掩码的自注意力 + Feed-Forward，
//! 每个子层之后做残差连接与层归一化（Post-LN）。

use ndarray::{Array2, Array3, Array4};
use rand::rngs::StdRng;

use crate::attention::{AttentionParams, MultiHeadAttention};
use crate::config::Gpt2Config;
use crate::error::Result;
use crate::layers::{Dropout, FeedForward, LayerNorm};
use crate::params::{with_prefix, Parameters};

/// Decoder Layer
///
/// ```text
/// x → LayerNorm(x + Dropout(SelfAttention(x, mask)))
///   → LayerNorm(x + FFN(x)) → output
/// ```
#[derive(Debug, Clone)]
pub struct DecoderLayer {
    /// Masked self-attention
    self_attn: MultiHeadAttention,
    /// 注意力输出的 Dropout
    attn_dropout: Dropout,
    /// 注意力后的 Add & Norm
    attn_norm: LayerNorm,
    /// Feed-forward network
    ffn: FeedForward,
    /// FFN 后的 Add & Norm
    ffn_norm: LayerNorm,
}

impl DecoderLayer {
    pub fn new(config: &Gpt2Config, rng: &mut StdRng) -> Result<Self> {
        let params = AttentionParams::with_head_dims(
            config.embed_dim,
            config.num_heads,
            config.qk_dim(),
            config.v_dim(),
        )?;

        Ok(Self {
            self_attn: MultiHeadAttention::new(params, rng),
            attn_dropout: Dropout::new(config.dropout_rate),
            attn_norm: LayerNorm::new(config.embed_dim, config.layer_norm_eps),
            ffn: FeedForward::new(
                config.embed_dim,
                config.ff_dim,
                config.activation,
                config.dropout_rate,
                rng,
            ),
            ffn_norm: LayerNorm::new(config.embed_dim, config.layer_norm_eps),
        })
    }

    /// 前向传播
    ///
    /// - `x`: [batch, seq_len, d_model]
    /// - `mask`: [batch, 1, seq_len, seq_len]
    /// - `rng`: 训练时用于 dropout，推理时为 `None`
    ///
    /// 返回输出与自注意力权重 [batch, n_heads, seq_len, seq_len]。
    pub fn forward(
        &self,
        x: &Array3<f32>,
        mask: Option<&Array4<bool>>,
        mut rng: Option<&mut StdRng>,
    ) -> Result<(Array3<f32>, Array4<f32>)> {
        // Masked self-attention + Add & Norm
        let (attn_out, attn_weights) = self.self_attn.forward(x, x, x, mask)?;
        let attn_out = self.attn_dropout.forward(attn_out, rng.as_deref_mut());
        let x = self.attn_norm.forward(&(x + &attn_out))?;

        // FFN + Add & Norm
        let ffn_out = self.ffn.forward(&x, rng)?;
        let output = self.ffn_norm.forward(&(&x + &ffn_out))?;

        Ok((output, attn_weights))
    }
}

impl Parameters for DecoderLayer {
    fn named_params(&self) -> Vec<(String, &Array2<f32>)> {
        let mut params = with_prefix("self_attn", self.self_attn.named_params());
        params.extend(with_prefix("attn_norm", self.attn_norm.named_params()));
        params.extend(with_prefix("ffn", self.ffn.named_params()));
        params.extend(with_prefix("ffn_norm", self.ffn_norm.named_params()));
        params
    }

    fn named_params_mut(&mut self) -> Vec<(String, &mut Array2<f32>)> {
        let mut params = with_prefix("self_attn", self.self_attn.named_params_mut());
        params.extend(with_prefix("attn_norm", self.attn_norm.named_params_mut()));
        params.extend(with_prefix("ffn", self.ffn.named_params_mut()));
        params.extend(with_prefix("ffn_norm", self.ffn_norm.named_params_mut()));
        params
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::configs;
    use crate::mask::make_causal_mask;
    use crate::tensor::Init;
    use ndarray::Axis;
    use rand::SeedableRng;

    fn input(rng: &mut StdRng) -> Array3<f32> {
        Init::Normal(1.0).sample((2 * 5, 16), rng).into_shape((2, 5, 16)).unwrap()
    }

    #[test]
    fn test_decoder_layer_shapes() {
        let config = configs::tiny();
        let mut rng = StdRng::seed_from_u64(0);
        let layer = DecoderLayer::new(&config, &mut rng).unwrap();
        let x = input(&mut rng);
        let mask = make_causal_mask(2, 5);

        let (y, attn) = layer.forward(&x, Some(&mask), None).unwrap();
        assert_eq!(y.shape(), &[2, 5, 16]);
        assert_eq!(attn.shape(), &[2, config.num_heads, 5, 5]);

        // Post-LN：输出每个位置均值约为 0
        for lane in y.lanes(Axis(2)) {
            assert!((lane.sum() / 16.0).abs() < 1e-4);
        }
    }

    #[test]
    fn test_dropout_only_in_training() {
        let config = configs::tiny();
        let mut rng = StdRng::seed_from_u64(1);
        let layer = DecoderLayer::new(&config, &mut rng).unwrap();
        let x = input(&mut rng);

        let (eval_a, _) = layer.forward(&x, None, None).unwrap();
        let (eval_b, _) = layer.forward(&x, None, None).unwrap();
        assert_eq!(eval_a, eval_b);

        let mut dropout_rng = StdRng::seed_from_u64(2);
        let (train, _) = layer.forward(&x, None, Some(&mut dropout_rng)).unwrap();
        assert_ne!(train, eval_a);
    }

    #[test]
    fn test_param_names() {
        let config = configs::tiny();
        let layer = DecoderLayer::new(&config, &mut StdRng::seed_from_u64(0)).unwrap();
        let names: Vec<String> = layer.named_params().into_iter().map(|(n, _)| n).collect();

        assert!(names.contains(&"self_attn.query.kernel".to_string()));
        assert!(names.contains(&"ffn.dense2.bias".to_string()));
        assert!(names.contains(&"ffn_norm.scale".to_string()));
        assert_eq!(names.len(), 4 * 2 + 2 + 2 * 2 + 2);
    }
}
