//! 嵌入层和位置编码
//!
//! 将离散的 token ID 转换为连续的向量表示，并添加位置信息。

use log::trace;
use ndarray::{s, Array2, Array3, Axis};
use rand::rngs::StdRng;

use crate::error::{Gpt2Error, Result};
use crate::params::Parameters;
use crate::tensor::Init;

/// 词嵌入层
///
/// 将 token ID 映射到 d_model 维向量
#[derive(Debug, Clone)]
pub struct Embedding {
    /// 权重矩阵: [vocab_size, d_model]
    weights: Array2<f32>,
}

impl Embedding {
    /// 创建新的嵌入层，权重服从 N(0, init_std²)
    ///
    /// # 参数
    /// - `vocab_size`: 词表大小
    /// - `d_model`: 嵌入维度
    pub fn new(vocab_size: usize, d_model: usize, init_std: f32, rng: &mut StdRng) -> Self {
        Self {
            weights: Init::Normal(init_std).sample((vocab_size, d_model), rng),
        }
    }

    /// 前向传播
    ///
    /// # 输入
    /// - `ids`: [batch, seq_len] token IDs
    ///
    /// # 输出
    /// - [batch, seq_len, d_model]
    pub fn forward(&self, ids: &Array2<usize>) -> Result<Array3<f32>> {
        let (batch, seq_len) = ids.dim();
        let vocab_size = self.vocab_size();
        let mut embedded = Array3::zeros((batch, seq_len, self.d_model()));

        for ((b, i), &token) in ids.indexed_iter() {
            if token >= vocab_size {
                return Err(Gpt2Error::TokenOutOfRange { token, vocab_size });
            }
            embedded
                .slice_mut(s![b, i, ..])
                .assign(&self.weights.index_axis(Axis(0), token));
        }

        Ok(embedded)
    }

    pub fn vocab_size(&self) -> usize {
        self.weights.nrows()
    }

    /// 获取嵌入维度
    pub fn d_model(&self) -> usize {
        self.weights.ncols()
    }

    /// 获取权重（用于可视化）
    pub fn weights(&self) -> &Array2<f32> {
        &self.weights
    }
}

impl Parameters for Embedding {
    fn named_params(&self) -> Vec<(String, &Array2<f32>)> {
        vec![("embedding".to_string(), &self.weights)]
    }

    fn named_params_mut(&mut self) -> Vec<(String, &mut Array2<f32>)> {
        vec![("embedding".to_string(), &mut self.weights)]
    }
}

/// 正弦位置编码
///
/// ```text
/// PE(pos, 2i)   = sin(pos * exp(-2i * ln(10000) / d_model))
/// PE(pos, 2i+1) = cos(pos * exp(-2i * ln(10000) / d_model))
/// ```
///
/// 不含可学习参数。
#[derive(Debug, Clone)]
pub struct PositionalEncoding {
    /// 预计算的位置编码: [max_seq_len, d_model]
    pe: Array2<f32>,
}

impl PositionalEncoding {
    /// 创建新的位置编码
    ///
    /// `d_model` 必须为偶数。
    pub fn new(max_seq_len: usize, d_model: usize) -> Result<Self> {
        if d_model % 2 != 0 {
            return Err(Gpt2Error::config(format!(
                "positional encoding needs an even d_model, got {}",
                d_model
            )));
        }

        let log_base = -(10000.0f32).ln() / d_model as f32;
        let mut pe = Array2::zeros((max_seq_len, d_model));

        for pos in 0..max_seq_len {
            for i in (0..d_model).step_by(2) {
                let div_term = (i as f32 * log_base).exp();
                let angle = pos as f32 * div_term;
                pe[[pos, i]] = angle.sin();
                pe[[pos, i + 1]] = angle.cos();
            }
        }

        Ok(Self { pe })
    }

    /// 将位置编码添加到输入嵌入
    ///
    /// # 输入
    /// - `x`: [batch, seq_len, d_model]
    ///
    /// # 输出
    /// - 同形状
    pub fn forward(&self, x: &Array3<f32>) -> Result<Array3<f32>> {
        let (_, seq_len, d_model) = x.dim();

        if seq_len > self.max_seq_len() {
            return Err(Gpt2Error::SequenceTooLong {
                len: seq_len,
                max_len: self.max_seq_len(),
            });
        }
        if d_model != self.pe.ncols() {
            return Err(Gpt2Error::shape(format!(
                "positional encoding has {} features, input has {}",
                self.pe.ncols(),
                d_model
            )));
        }

        trace!("positional encoding for seq_len={}", seq_len);
        let pe_slice = self.pe.slice(s![..seq_len, ..]);
        Ok(x + &pe_slice)
    }

    pub fn max_seq_len(&self) -> usize {
        self.pe.nrows()
    }

    /// 获取位置编码（用于可视化）
    pub fn encoding(&self) -> &Array2<f32> {
        &self.pe
    }
}
