//! 文本生成采样策略
//!
//! 对最后一个位置的 logits 做惩罚、温度缩放和截断，然后选出下一个 token。

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::error::{Gpt2Error, Result};

/// 采样方法
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SamplingMethod {
    /// 贪婪解码（选择概率最大的）
    Greedy,
    /// Top-k 采样（从概率最大的 k 个词中采样）
    TopK,
    /// Nucleus (Top-p) 采样（从累积概率达到 p 的最小词集合中采样）
    Nucleus,
    /// 多项式采样（从所有词中采样）
    Multinomial,
}

/// 采样配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SamplingConfig {
    pub method: SamplingMethod,
    /// 温度参数：< 1.0 更保守，> 1.0 更随机
    pub temperature: f32,
    /// Top-k 中的 k
    pub top_k: usize,
    /// Nucleus 的累积概率阈值，取值 (0, 1]
    pub top_p: f32,
    /// 重复惩罚（1.0 = 不惩罚）
    pub repeat_penalty: f32,
    /// 按出现次数线性惩罚
    pub frequency_penalty: f32,
    /// 出现过即惩罚
    pub presence_penalty: f32,
}

impl Default for SamplingConfig {
    fn default() -> Self {
        Self {
            method: SamplingMethod::Nucleus,
            temperature: 0.8,
            top_k: 0,
            top_p: 0.9,
            repeat_penalty: 1.0,
            frequency_penalty: 0.0,
            presence_penalty: 0.0,
        }
    }
}

impl SamplingConfig {
    /// 贪婪解码配置
    pub fn greedy() -> Self {
        Self {
            method: SamplingMethod::Greedy,
            temperature: 1.0,
            ..Self::default()
        }
    }

    /// Top-k 采样配置
    pub fn top_k(k: usize) -> Self {
        Self {
            method: SamplingMethod::TopK,
            temperature: 1.0,
            top_k: k,
            ..Self::default()
        }
    }

    /// Nucleus (Top-p) 采样配置
    pub fn nucleus(p: f32) -> Self {
        Self {
            method: SamplingMethod::Nucleus,
            top_p: p,
            ..Self::default()
        }
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn with_repeat_penalty(mut self, repeat_penalty: f32) -> Self {
        self.repeat_penalty = repeat_penalty;
        self
    }

    pub fn with_frequency_penalty(mut self, frequency_penalty: f32) -> Self {
        self.frequency_penalty = frequency_penalty;
        self
    }

    pub fn with_presence_penalty(mut self, presence_penalty: f32) -> Self {
        self.presence_penalty = presence_penalty;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if !(self.temperature > 0.0) {
            return Err(Gpt2Error::config(format!(
                "temperature ({}) must be positive",
                self.temperature
            )));
        }
        if self.method == SamplingMethod::TopK && self.top_k == 0 {
            return Err(Gpt2Error::config("top_k sampling needs k > 0"));
        }
        if self.method == SamplingMethod::Nucleus && !(self.top_p > 0.0 && self.top_p <= 1.0) {
            return Err(Gpt2Error::config(format!(
                "top_p ({}) must be in (0, 1]",
                self.top_p
            )));
        }
        if !(self.repeat_penalty > 0.0) {
            return Err(Gpt2Error::config("repeat_penalty must be positive"));
        }
        Ok(())
    }

    fn has_penalties(&self) -> bool {
        self.repeat_penalty != 1.0 || self.frequency_penalty != 0.0 || self.presence_penalty != 0.0
    }
}

/// 自回归生成配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationConfig {
    /// 最多生成的 token 数
    pub max_new_tokens: usize,
    /// 生成 EOS 后停止
    pub stop_at_eos: bool,
    pub sampling: SamplingConfig,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            max_new_tokens: 32,
            stop_at_eos: true,
            sampling: SamplingConfig::default(),
        }
    }
}

impl GenerationConfig {
    pub fn validate(&self) -> Result<()> {
        self.sampling.validate()
    }
}

/// 采样器
///
/// 记录已生成 token 的次数，用于重复/频率/存在惩罚。
pub struct Sampler {
    config: SamplingConfig,
    counts: HashMap<usize, usize>,
}

impl Sampler {
    pub fn new(config: SamplingConfig) -> Self {
        Self {
            config,
            counts: HashMap::new(),
        }
    }

    /// 重置采样器状态
    pub fn reset(&mut self) {
        self.counts.clear();
    }

    /// 记录一个已生成的 token
    pub fn update(&mut self, token: usize) {
        if self.config.has_penalties() {
            *self.counts.entry(token).or_insert(0) += 1;
        }
    }

    /// 对 logits [vocab_size] 采样出 token ID
    pub fn sample<R: Rng + ?Sized>(&self, logits: &[f32], rng: &mut R) -> usize {
        let mut logits = self.apply_penalties(logits);

        if self.config.method == SamplingMethod::Greedy {
            return argmax(&logits);
        }

        if self.config.temperature != 1.0 {
            for logit in &mut logits {
                *logit /= self.config.temperature;
            }
        }

        match self.config.method {
            SamplingMethod::TopK => apply_top_k(&mut logits, self.config.top_k),
            SamplingMethod::Nucleus => apply_top_p(&mut logits, self.config.top_p),
            _ => {}
        }

        sample_categorical(&softmax(&logits), rng)
    }

    fn apply_penalties(&self, logits: &[f32]) -> Vec<f32> {
        let mut penalized = logits.to_vec();

        for (&token, &count) in &self.counts {
            let Some(logit) = penalized.get_mut(token) else {
                continue;
            };

            if self.config.repeat_penalty != 1.0 {
                // 正值缩小、负值放大，两者都降低该 token 的概率
                if *logit > 0.0 {
                    *logit /= self.config.repeat_penalty;
                } else {
                    *logit *= self.config.repeat_penalty;
                }
            }
            *logit -= count as f32 * self.config.frequency_penalty;
            *logit -= self.config.presence_penalty;
        }

        penalized
    }
}

/// 返回最大值的索引，空输入返回 0
pub fn argmax(values: &[f32]) -> usize {
    values
        .iter()
        .enumerate()
        .fold((0, f32::NEG_INFINITY), |(best, best_val), (i, &v)| {
            if v > best_val {
                (i, v)
            } else {
                (best, best_val)
            }
        })
        .0
}

/// 数值稳定的 softmax
pub fn softmax(logits: &[f32]) -> Vec<f32> {
    let max_logit = logits.iter().cloned().fold(f32::NEG_INFINITY, f32::max);
    if max_logit == f32::NEG_INFINITY {
        return vec![0.0; logits.len()];
    }

    let exps: Vec<f32> = logits.iter().map(|&l| (l - max_logit).exp()).collect();
    let sum: f32 = exps.iter().sum();
    exps.into_iter().map(|e| e / sum).collect()
}

fn descending(logits: &[f32]) -> Vec<usize> {
    let mut order: Vec<usize> = (0..logits.len()).collect();
    order.sort_by(|&a, &b| logits[b].total_cmp(&logits[a]));
    order
}

/// 只保留最大的 k 个 logits，其余置为 -∞
fn apply_top_k(logits: &mut [f32], k: usize) {
    if k == 0 || k >= logits.len() {
        return;
    }
    for &i in &descending(logits)[k..] {
        logits[i] = f32::NEG_INFINITY;
    }
}

/// 保留累积概率首次达到 p 的最小集合
fn apply_top_p(logits: &mut [f32], p: f32) {
    if p >= 1.0 {
        return;
    }
    let probs = softmax(logits);
    let order = descending(logits);

    let mut cumsum = 0.0;
    let mut keep = order.len();
    for (rank, &i) in order.iter().enumerate() {
        cumsum += probs[i];
        if cumsum >= p {
            keep = rank + 1;
            break;
        }
    }

    for &i in &order[keep..] {
        logits[i] = f32::NEG_INFINITY;
    }
}

/// 按概率分布采样
fn sample_categorical<R: Rng + ?Sized>(probs: &[f32], rng: &mut R) -> usize {
    let r = rng.gen::<f32>();

    let mut cumsum = 0.0;
    let mut last_nonzero = 0;
    for (i, &p) in probs.iter().enumerate() {
        if p > 0.0 {
            last_nonzero = i;
        }
        cumsum += p;
        if r < cumsum {
            return i;
        }
    }

    // 舍入误差导致 cumsum 略小于 1 时
    last_nonzero
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_argmax() {
        assert_eq!(argmax(&[0.1, 0.5, 0.3, 0.9, 0.2]), 3);
        assert_eq!(argmax(&[]), 0);
    }

    #[test]
    fn test_softmax() {
        let probs = softmax(&[1.0, 2.0, 3.0]);
        assert!((probs.iter().sum::<f32>() - 1.0).abs() < 1e-6);
        assert!(probs[2] > probs[1]);

        let masked = softmax(&[f32::NEG_INFINITY, 0.0]);
        assert_eq!(masked[0], 0.0);
        assert!((masked[1] - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_descending_with_nan() {
        let logits = [1.0, f32::NAN, 3.0, 2.0];
        let order = descending(&logits);
        assert_eq!(order.len(), 4);
        let finite: Vec<usize> = order.into_iter().filter(|&i| !logits[i].is_nan()).collect();
        assert_eq!(finite, vec![2, 3, 0]);
    }

    #[test]
    fn test_apply_top_k() {
        let mut logits = vec![0.1, 0.5, 0.3, 0.9, 0.2];
        apply_top_k(&mut logits, 3);
        assert_eq!(logits.iter().filter(|v| v.is_finite()).count(), 3);
        assert!(logits[3].is_finite() && logits[1].is_finite() && logits[2].is_finite());
    }

    #[test]
    fn test_apply_top_p() {
        // 概率约为 [0.64, 0.24, 0.09, 0.03]
        let mut logits = vec![3.0, 2.0, 1.0, 0.0];
        apply_top_p(&mut logits, 0.8);
        assert!(logits[0].is_finite() && logits[1].is_finite());
        assert!(logits[2].is_infinite() && logits[3].is_infinite());

        // 最大概率已超过 p 时只保留一个
        let mut logits = vec![3.0, 2.0, 1.0, 0.0];
        apply_top_p(&mut logits, 0.5);
        assert_eq!(logits.iter().filter(|v| v.is_finite()).count(), 1);
    }

    #[test]
    fn test_sampling_stays_in_top_k() {
        let sampler = Sampler::new(SamplingConfig::top_k(2));
        let logits = [0.0, 5.0, 0.1, 4.0, -1.0];
        let mut rng = StdRng::seed_from_u64(11);
        for _ in 0..100 {
            let token = sampler.sample(&logits, &mut rng);
            assert!(token == 1 || token == 3);
        }
    }

    #[test]
    fn test_greedy_ignores_temperature() {
        let sampler = Sampler::new(SamplingConfig::greedy().with_temperature(5.0));
        let mut rng = StdRng::seed_from_u64(0);
        assert_eq!(sampler.sample(&[0.2, 0.1, 0.7], &mut rng), 2);
    }

    #[test]
    fn test_penalties() {
        let config = SamplingConfig::greedy()
            .with_repeat_penalty(2.0)
            .with_presence_penalty(0.5);
        let mut sampler = Sampler::new(config);

        let logits = [2.0, 1.5, -1.0];
        assert_eq!(sampler.sample(&logits, &mut StdRng::seed_from_u64(0)), 0);

        sampler.update(0);
        sampler.update(0);
        // token 0: 2.0 / 2 - 0.5 = 0.5 < 1.5
        assert_eq!(sampler.sample(&logits, &mut StdRng::seed_from_u64(0)), 1);

        sampler.reset();
        assert_eq!(sampler.sample(&logits, &mut StdRng::seed_from_u64(0)), 0);
    }

    #[test]
    fn test_frequency_penalty_scales_with_count() {
        let mut sampler = Sampler::new(SamplingConfig::greedy().with_frequency_penalty(1.0));
        let logits = [3.0, 1.5];
        sampler.update(0);
        assert_eq!(sampler.sample(&logits, &mut StdRng::seed_from_u64(0)), 0);
        sampler.update(0);
        assert_eq!(sampler.sample(&logits, &mut StdRng::seed_from_u64(0)), 1);
    }

    #[test]
    fn test_validate() {
        assert!(SamplingConfig::default().validate().is_ok());
        assert!(SamplingConfig::greedy().with_temperature(0.0).validate().is_err());
        assert!(SamplingConfig::top_k(0).validate().is_err());
        assert!(SamplingConfig::nucleus(1.5).validate().is_err());
        assert!(SamplingConfig::nucleus(0.0).validate().is_err());
        assert!(GenerationConfig::default().validate().is_ok());
    }
}
