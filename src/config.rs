//! 模型配置
//!
//! `Gpt2Config` 描述网络结构，`TrainingConfig` 记录训练超参数，
//! 二者组合成可以保存为 JSON 的 `Config`。

use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::Path;

use crate::error::{Gpt2Error, Result};

/// Feed-Forward 网络的激活函数
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Activation {
    /// max(0, x)
    Relu,
    /// tanh 近似的 GELU
    Gelu,
}

impl Default for Activation {
    fn default() -> Self {
        Activation::Relu
    }
}

/// GPT-2 结构配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Gpt2Config {
    /// 词表大小
    pub vocab_size: usize,
    /// 未知 token
    pub unk_id: usize,
    /// 序列起始 token
    pub bos_id: usize,
    /// 序列结束 token
    pub eos_id: usize,
    /// 填充 token（注意力中被屏蔽）
    pub pad_id: usize,
    /// 最大序列长度
    pub max_len: usize,
    /// 模型维度
    pub embed_dim: usize,
    /// 注意力头数
    pub num_heads: usize,
    /// Decoder 层数
    pub num_layers: usize,
    /// 每个头的 Query/Key 维度，缺省为 embed_dim / num_heads
    pub qk_dim: Option<usize>,
    /// 每个头的 Value 维度，缺省为 embed_dim / num_heads
    pub v_dim: Option<usize>,
    /// FFN 隐藏层维度
    pub ff_dim: usize,
    /// Dropout 比率
    pub dropout_rate: f32,
    /// LayerNorm 的 epsilon
    pub layer_norm_eps: f32,
    /// FFN 激活函数
    pub activation: Activation,
    /// 词嵌入初始化的标准差
    pub embedding_init_std: f32,
    /// 参数初始化的随机种子
    pub seed: u64,
}

impl Default for Gpt2Config {
    fn default() -> Self {
        Self {
            vocab_size: 8000,
            unk_id: 0,
            bos_id: 1,
            eos_id: 2,
            pad_id: 3,
            max_len: 256,
            embed_dim: 256,
            num_heads: 32,
            num_layers: 14,
            qk_dim: None,
            v_dim: None,
            ff_dim: 512,
            dropout_rate: 0.10,
            layer_norm_eps: 1e-6,
            activation: Activation::Relu,
            embedding_init_std: 1.0,
            seed: 42,
        }
    }
}

impl Gpt2Config {
    /// 每个头的 Query/Key 维度
    pub fn qk_dim(&self) -> usize {
        self.qk_dim.unwrap_or(self.embed_dim / self.num_heads.max(1))
    }

    /// 每个头的 Value 维度
    pub fn v_dim(&self) -> usize {
        self.v_dim.unwrap_or(self.embed_dim / self.num_heads.max(1))
    }

    /// 特殊 token，顺序为 unk, bos, eos, pad
    pub fn special_ids(&self) -> [usize; 4] {
        [self.unk_id, self.bos_id, self.eos_id, self.pad_id]
    }

    /// 检查配置是否一致
    pub fn validate(&self) -> Result<()> {
        let positive = [
            ("vocab_size", self.vocab_size),
            ("max_len", self.max_len),
            ("embed_dim", self.embed_dim),
            ("num_heads", self.num_heads),
            ("ff_dim", self.ff_dim),
        ];
        for (name, value) in positive {
            if value == 0 {
                return Err(Gpt2Error::config(format!("{} must be positive", name)));
            }
        }

        if self.embed_dim % 2 != 0 {
            return Err(Gpt2Error::config(format!(
                "embed_dim ({}) must be even for sinusoidal positional encoding",
                self.embed_dim
            )));
        }

        if (self.qk_dim.is_none() || self.v_dim.is_none()) && self.embed_dim % self.num_heads != 0 {
            return Err(Gpt2Error::config(format!(
                "embed_dim ({}) must be divisible by num_heads ({})",
                self.embed_dim, self.num_heads
            )));
        }
        if self.qk_dim == Some(0) || self.v_dim == Some(0) {
            return Err(Gpt2Error::config("per-head dimensions must be positive"));
        }

        if !(0.0..1.0).contains(&self.dropout_rate) {
            return Err(Gpt2Error::config(format!(
                "dropout_rate ({}) must be in [0, 1)",
                self.dropout_rate
            )));
        }
        if !(self.layer_norm_eps > 0.0) {
            return Err(Gpt2Error::config("layer_norm_eps must be positive"));
        }
        if !(self.embedding_init_std > 0.0) {
            return Err(Gpt2Error::config("embedding_init_std must be positive"));
        }

        for (name, id) in ["unk_id", "bos_id", "eos_id", "pad_id"]
            .iter()
            .zip(self.special_ids())
        {
            if id >= self.vocab_size {
                return Err(Gpt2Error::config(format!(
                    "{} ({}) must be smaller than vocab_size ({})",
                    name, id, self.vocab_size
                )));
            }
        }

        Ok(())
    }
}

/// 训练超参数
///
/// 随模型一同保存，本 crate 不包含训练循环。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainingConfig {
    /// 与 unk, bos, eos, pad 对应的 token 字符串
    pub special_tokens: Vec<String>,
    pub batch_size: usize,
    pub learning_rate: f32,
    pub warmup_steps: usize,
    pub num_epochs: usize,
    pub save_ckpt_every_epochs: usize,
    pub restore_checkpoints: bool,
    pub ckpt_prefix: String,
    pub ckpt_dir: String,
    /// SentencePiece 模型路径
    pub spm_model: String,
    /// 训练语料路径
    pub train_text: String,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            special_tokens: ["<unk>", "<s>", "</s>", "<pad>"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            batch_size: 256,
            learning_rate: 0.010,
            warmup_steps: 500,
            num_epochs: 20,
            save_ckpt_every_epochs: 1,
            restore_checkpoints: true,
            ckpt_prefix: "completion_ckpt_".to_string(),
            ckpt_dir: "checkpoints/completion/".to_string(),
            spm_model: "wiki40b_ja/wiki40b_ja_test.model".to_string(),
            train_text: "wiki40b_ja/wiki40b_ja_test.txt".to_string(),
        }
    }
}

impl TrainingConfig {
    pub fn validate(&self) -> Result<()> {
        if self.special_tokens.len() != 4 {
            return Err(Gpt2Error::config(format!(
                "expected 4 special tokens (unk, bos, eos, pad), got {}",
                self.special_tokens.len()
            )));
        }
        if self.batch_size == 0 || self.num_epochs == 0 || self.save_ckpt_every_epochs == 0 {
            return Err(Gpt2Error::config(
                "batch_size, num_epochs and save_ckpt_every_epochs must be positive",
            ));
        }
        if !(self.learning_rate > 0.0) {
            return Err(Gpt2Error::config("learning_rate must be positive"));
        }
        Ok(())
    }
}

/// 完整配置：模型结构 + 训练超参数
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub model: Gpt2Config,
    pub training: TrainingConfig,
}

impl Config {
    pub fn validate(&self) -> Result<()> {
        self.model.validate()?;
        self.training.validate()
    }

    /// 特殊 token id 与字符串的对应关系
    pub fn special_tokens(&self) -> Vec<(usize, &str)> {
        self.model
            .special_ids()
            .iter()
            .copied()
            .zip(self.training.special_tokens.iter().map(String::as_str))
            .collect()
    }

    /// 保存为 JSON
    pub fn save_json<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let file = File::create(path)?;
        let writer = BufWriter::new(file);
        serde_json::to_writer_pretty(writer, self)?;
        Ok(())
    }

    /// 从 JSON 加载并校验
    pub fn load_json<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = File::open(path)?;
        let reader = BufReader::new(file);
        let config: Config = serde_json::from_reader(reader)?;
        config.validate()?;
        Ok(config)
    }
}
