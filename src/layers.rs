//! 基础层
//!
//! 包含 Dense、Layer Normalization、Dropout 和 Feed-Forward Network。
//! 所有层只实现前向传播，输入形状为 `[batch, seq_len, features]`。

use ndarray::{Array2, Array3};
use rand::rngs::StdRng;
use rand::Rng;

use crate::config::Activation;
use crate::error::{Gpt2Error, Result};
use crate::params::{with_prefix, Parameters};
use crate::tensor::{Init, TensorExt};

/// 全连接层
///
/// ```text
/// y = x · W + b
/// ```
#[derive(Debug, Clone)]
pub struct Dense {
    /// 权重: [in_features, out_features]
    kernel: Array2<f32>,
    /// 偏置: [1, out_features]
    bias: Array2<f32>,
}

impl Dense {
    /// 创建新的全连接层（LeCun 截断正态初始化，偏置为 0）
    pub fn new(in_features: usize, out_features: usize, rng: &mut StdRng) -> Self {
        Self {
            kernel: Init::LecunNormal.sample((in_features, out_features), rng),
            bias: Array2::zeros((1, out_features)),
        }
    }

    /// 前向传播
    ///
    /// # 输入
    /// - `x`: [batch, seq_len, in_features]
    ///
    /// # 输出
    /// - [batch, seq_len, out_features]
    pub fn forward(&self, x: &Array3<f32>) -> Result<Array3<f32>> {
        x.linear(&self.kernel, &self.bias)
    }

    pub fn in_features(&self) -> usize {
        self.kernel.nrows()
    }

    pub fn out_features(&self) -> usize {
        self.kernel.ncols()
    }
}

impl Parameters for Dense {
    fn named_params(&self) -> Vec<(String, &Array2<f32>)> {
        vec![("kernel".to_string(), &self.kernel), ("bias".to_string(), &self.bias)]
    }

    fn named_params_mut(&mut self) -> Vec<(String, &mut Array2<f32>)> {
        vec![
            ("kernel".to_string(), &mut self.kernel),
            ("bias".to_string(), &mut self.bias),
        ]
    }
}

/// Layer Normalization
///
/// 对每个位置的所有特征进行归一化：
///
/// ```text
/// y = γ * ((x - μ) / √(σ² + ε)) + β
/// ```
#[derive(Debug, Clone)]
pub struct LayerNorm {
    /// 缩放参数 [1, d_model]
    scale: Array2<f32>,
    /// 平移参数 [1, d_model]
    bias: Array2<f32>,
    eps: f32,
}

impl LayerNorm {
    /// γ 初始化为 1，β 初始化为 0
    pub fn new(d_model: usize, eps: f32) -> Self {
        Self {
            scale: Array2::ones((1, d_model)),
            bias: Array2::zeros((1, d_model)),
            eps,
        }
    }

    pub fn forward(&self, x: &Array3<f32>) -> Result<Array3<f32>> {
        if x.dim().2 != self.scale.ncols() {
            return Err(Gpt2Error::shape(format!(
                "layer norm expects {} features, got {}",
                self.scale.ncols(),
                x.dim().2
            )));
        }
        Ok(x.layer_norm(&self.scale, &self.bias, self.eps))
    }
}

impl Parameters for LayerNorm {
    fn named_params(&self) -> Vec<(String, &Array2<f32>)> {
        vec![("scale".to_string(), &self.scale), ("bias".to_string(), &self.bias)]
    }

    fn named_params_mut(&mut self) -> Vec<(String, &mut Array2<f32>)> {
        vec![
            ("scale".to_string(), &mut self.scale),
            ("bias".to_string(), &mut self.bias),
        ]
    }
}

/// Dropout 层
///
/// 训练时以概率 `rate` 置零并按 `1 / (1 - rate)` 缩放其余元素；
/// 推理时（没有随机数生成器）原样返回。
#[derive(Debug, Clone, Copy)]
pub struct Dropout {
    rate: f32,
}

impl Dropout {
    pub fn new(rate: f32) -> Self {
        Self { rate }
    }

    pub fn rate(&self) -> f32 {
        self.rate
    }

    pub fn forward(&self, x: Array3<f32>, rng: Option<&mut StdRng>) -> Array3<f32> {
        let rng = match rng {
            Some(rng) if self.rate > 0.0 => rng,
            _ => return x,
        };

        let keep = 1.0 - self.rate;
        x.mapv(|v| if rng.gen::<f32>() < self.rate { 0.0 } else { v / keep })
    }
}

/// Feed-Forward Network
///
/// ```text
/// FFN(x) = Dropout(Dropout(act(xW1 + b1))W2 + b2)
/// ```
#[derive(Debug, Clone)]
pub struct FeedForward {
    /// 第一层: [d_model, d_ff]
    dense1: Dense,
    /// 第二层: [d_ff, d_model]
    dense2: Dense,
    activation: Activation,
    dropout: Dropout,
}

impl FeedForward {
    /// 创建新的 Feed-Forward Network
    ///
    /// # 参数
    /// - `d_model`: 输入/输出维度
    /// - `d_ff`: 隐藏层维度
    pub fn new(d_model: usize, d_ff: usize, activation: Activation, dropout_rate: f32, rng: &mut StdRng) -> Self {
        Self {
            dense1: Dense::new(d_model, d_ff, rng),
            dense2: Dense::new(d_ff, d_model, rng),
            activation,
            dropout: Dropout::new(dropout_rate),
        }
    }

    /// 前向传播，`rng` 为 `None` 时不做 dropout
    pub fn forward(&self, x: &Array3<f32>, mut rng: Option<&mut StdRng>) -> Result<Array3<f32>> {
        let hidden = self.dense1.forward(x)?;
        let hidden = match self.activation {
            Activation::Relu => hidden.relu(),
            Activation::Gelu => hidden.gelu(),
        };
        let hidden = self.dropout.forward(hidden, rng.as_deref_mut());

        let output = self.dense2.forward(&hidden)?;
        Ok(self.dropout.forward(output, rng))
    }

    /// (d_model, d_ff)
    pub fn dimensions(&self) -> (usize, usize) {
        (self.dense1.in_features(), self.dense1.out_features())
    }
}

impl Parameters for FeedForward {
    fn named_params(&self) -> Vec<(String, &Array2<f32>)> {
        let mut params = with_prefix("dense1", self.dense1.named_params());
        params.extend(with_prefix("dense2", self.dense2.named_params()));
        params
    }

    fn named_params_mut(&mut self) -> Vec<(String, &mut Array2<f32>)> {
        let mut params = with_prefix("dense1", self.dense1.named_params_mut());
        params.extend(with_prefix("dense2", self.dense2.named_params_mut()));
        params
    }
}
