//! # Mini GPT-2
//!
//! 一个基于 ndarray 从零实现的 GPT-2 风格语言模型（仅前向传播）。
//!
//! ## 架构概览
//!
//! ```text
//! Token IDs → Embedding → Positional Encoding →
//!     [Decoder Layer × N] → LayerNorm → Dense(vocab) → Logits
//!     ├── Masked Multi-Head Self-Attention
//!     ├── Dropout + Add & Norm
//!     ├── Feed Forward Network
//!     └── Add & Norm
//! ```
//!
//! 自注意力掩码 = 因果掩码 ∧ 填充掩码（值为 `pad_id` 的 key 不可见）。

pub mod attention;
pub mod config;
pub mod decoder;
pub mod embedding;
pub mod error;
pub mod gpt2;
pub mod layers;
pub mod mask;
pub mod params;
pub mod sampling;
pub mod tensor;

pub use attention::{AttentionParams, MultiHeadAttention};
pub use config::{Activation, Config, Gpt2Config, TrainingConfig};
pub use decoder::DecoderLayer;
pub use embedding::{Embedding, PositionalEncoding};
pub use error::{Gpt2Error, Result};
pub use gpt2::{Gpt2, Gpt2Output};
pub use layers::{Dense, Dropout, FeedForward, LayerNorm};
pub use mask::{causal_mask, combine_masks, decoder_mask, make_attention_mask, make_causal_mask, pad_sequences};
pub use params::{ParamSnapshot, Parameters};
pub use sampling::{GenerationConfig, Sampler, SamplingConfig, SamplingMethod};
pub use tensor::{Init, TensorExt};

/// 预设配置
pub mod configs {
    use super::Gpt2Config;

    /// 极小模型（用于单元测试）
    pub fn tiny() -> Gpt2Config {
        Gpt2Config {
            vocab_size: 64,
            max_len: 16,
            embed_dim: 16,
            num_heads: 4,
            num_layers: 2,
            ff_dim: 32,
            ..Gpt2Config::default()
        }
    }

    /// 小型模型（用于快速实验）
    pub fn small() -> Gpt2Config {
        Gpt2Config {
            vocab_size: 1000,
            max_len: 64,
            embed_dim: 128,
            num_heads: 4,
            num_layers: 2,
            ff_dim: 512,
            ..Gpt2Config::default()
        }
    }

    /// 基础模型（词表 8000，14 层，32 头）
    pub fn base() -> Gpt2Config {
        Gpt2Config::default()
    }
}
