//! 张量操作扩展和工具函数
//!
//! 基于 ndarray 实现 GPT-2 所需的张量操作：参数初始化、带掩码的 softmax、
//! 层归一化、激活函数以及对 `[batch, seq_len, features]` 张量的线性变换。

use ndarray::{Array2, Array3, ArrayView2, ArrayViewMut1, Axis};
use num_traits::Float;
use rand::Rng;
use rand_distr::{Distribution, Normal, StandardNormal};

use crate::error::{Gpt2Error, Result};

/// 参数初始化方式
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Init {
    /// N(0, std²)
    Normal(f32),
    /// LeCun 截断正态：截断到 ±2σ，σ = √(1 / fan_in) / 0.8796 使截断后方差为 1 / fan_in
    LecunNormal,
}

/// 标准正态截断到 [-2, 2] 后的标准差
const TRUNCATED_NORMAL_STD: f32 = 0.879_625_66;

impl Init {
    /// 生成形状为 `(fan_in, fan_out)` 的参数矩阵
    pub fn sample<R: Rng + ?Sized>(self, shape: (usize, usize), rng: &mut R) -> Array2<f32> {
        match self {
            Init::Normal(std) => normal_fill(shape, std, rng),
            Init::LecunNormal => {
                let std = (1.0 / shape.0.max(1) as f32).sqrt() / TRUNCATED_NORMAL_STD;
                truncated_normal_fill(shape, std, rng)
            }
        }
    }
}

fn normal_fill<R: Rng + ?Sized>(shape: (usize, usize), std: f32, rng: &mut R) -> Array2<f32> {
    match Normal::new(0.0f32, std) {
        Ok(dist) => Array2::from_shape_fn(shape, |_| dist.sample(rng)),
        // std 非有限时退化为全零
        Err(_) => Array2::zeros(shape),
    }
}

/// 拒绝采样：超出 ±2σ 的样本重新抽取
fn truncated_normal_fill<R: Rng + ?Sized>(shape: (usize, usize), std: f32, rng: &mut R) -> Array2<f32> {
    Array2::from_shape_fn(shape, |_| loop {
        let z: f32 = StandardNormal.sample(rng);
        if z.abs() <= 2.0 {
            break z * std;
        }
    })
}

/// 张量扩展 trait
pub trait TensorExt {
    /// 对最后一维应用线性变换 `x · W + b`
    ///
    /// `x`: [batch, seq_len, in], `kernel`: [in, out], `bias`: [1, out]
    fn linear(&self, kernel: &Array2<f32>, bias: &Array2<f32>) -> Result<Array3<f32>>;

    /// 沿最后一维做层归一化
    fn layer_norm(&self, gamma: &Array2<f32>, beta: &Array2<f32>, eps: f32) -> Array3<f32>;

    /// ReLU 激活
    fn relu(&self) -> Array3<f32>;

    /// GELU 激活
    fn gelu(&self) -> Array3<f32>;
}

impl TensorExt for Array3<f32> {
    fn linear(&self, kernel: &Array2<f32>, bias: &Array2<f32>) -> Result<Array3<f32>> {
        let (batch, seq_len, features) = self.dim();
        if features != kernel.nrows() {
            return Err(Gpt2Error::shape(format!(
                "linear expects {} input features, got {}",
                kernel.nrows(),
                features
            )));
        }

        let flat = self.to_shape((batch * seq_len, features))?;
        let out = flat.dot(kernel) + bias;
        Ok(out.into_shape((batch, seq_len, kernel.ncols()))?)
    }

    fn layer_norm(&self, gamma: &Array2<f32>, beta: &Array2<f32>, eps: f32) -> Array3<f32> {
        let gamma = gamma.row(0);
        let beta = beta.row(0);
        let mut out = self.clone();

        for mut lane in out.lanes_mut(Axis(2)) {
            let n = lane.len() as f32;
            let mean = lane.sum() / n;
            let var = lane.iter().map(|&v| (v - mean) * (v - mean)).sum::<f32>() / n;
            let inv_std = 1.0 / (var + eps).sqrt();

            for ((v, &g), &b) in lane.iter_mut().zip(gamma.iter()).zip(beta.iter()) {
                *v = (*v - mean) * inv_std * g + b;
            }
        }

        out
    }

    fn relu(&self) -> Array3<f32> {
        self.mapv(|x| x.max(0.0))
    }

    fn gelu(&self) -> Array3<f32> {
        // GELU(x) ≈ 0.5 * x * (1 + tanh(√(2/π) * (x + 0.044715 * x³)))
        let sqrt_2_over_pi = (2.0 / std::f32::consts::PI).sqrt();
        self.mapv(|x| 0.5 * x * (1.0 + (sqrt_2_over_pi * (x + 0.044715 * x * x * x)).tanh()))
    }
}

/// 原地对一行做带掩码的 softmax
///
/// `keep[j] == false` 的位置视为 -∞。整行都被屏蔽时结果全为 0。
pub fn masked_softmax_inplace<F: Float>(mut row: ArrayViewMut1<F>, keep: Option<&[bool]>) {
    let allowed = |j: usize| keep.map_or(true, |k| k[j]);

    let mut max = F::neg_infinity();
    for (j, &v) in row.iter().enumerate() {
        if allowed(j) && v > max {
            max = v;
        }
    }

    if max == F::neg_infinity() {
        row.fill(F::zero());
        return;
    }

    let mut sum = F::zero();
    for (j, v) in row.iter_mut().enumerate() {
        *v = if allowed(j) { (*v - max).exp() } else { F::zero() };
        sum = sum + *v;
    }
    for v in row.iter_mut() {
        *v = *v / sum;
    }
}

/// 对二维分数矩阵按行做 softmax，`mask` 与分数同形
pub fn masked_softmax(scores: &Array2<f32>, mask: Option<ArrayView2<bool>>) -> Array2<f32> {
    let mut out = scores.clone();
    for (i, row) in out.rows_mut().into_iter().enumerate() {
        match &mask {
            Some(m) => {
                let keep: Vec<bool> = m.row(i).to_vec();
                masked_softmax_inplace(row, Some(&keep));
            }
            None => masked_softmax_inplace(row, None),
        }
    }
    out
}
