//! GPT-2 风格的因果语言模型
//!
//! Decoder-only 架构：
//!
//! ```text
//! Token IDs → Embedding → Positional Encoding →
//!     [Decoder Layer × N] → LayerNorm → Dense(vocab) → Logits
//! ```
//!
//! 自注意力掩码由因果掩码与填充掩码组合而成。

use log::{debug, log_enabled, trace, warn, Level};
use ndarray::{s, Array2, Array3, Array4};
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::path::Path;
use std::time::Instant;

use crate::config::Gpt2Config;
use crate::decoder::DecoderLayer;
use crate::embedding::{Embedding, PositionalEncoding};
use crate::error::{Gpt2Error, Result};
use crate::layers::{Dense, LayerNorm};
use crate::mask::decoder_mask;
use crate::params::{with_prefix, ParamSnapshot, Parameters};
use crate::sampling::{GenerationConfig, Sampler};

/// 前向传播的输出
#[derive(Debug, Clone)]
pub struct Gpt2Output {
    /// [batch, seq_len, vocab_size]
    pub logits: Array3<f32>,
    /// 每层的自注意力权重 [batch, n_heads, seq_len, seq_len]，仅在请求时返回
    pub attentions: Option<Vec<Array4<f32>>>,
}

/// GPT-2 模型
#[derive(Debug, Clone)]
pub struct Gpt2 {
    /// Token 嵌入
    embedding: Embedding,
    /// 正弦位置编码
    pos_encoding: PositionalEncoding,
    /// Decoder 层
    layers: Vec<DecoderLayer>,
    /// 最终的 Layer Norm
    final_norm: LayerNorm,
    /// LM Head（词表投影）
    lm_head: Dense,
    config: Gpt2Config,
}

impl Gpt2 {
    /// 按配置创建模型，参数由 `config.seed` 初始化
    pub fn new(config: Gpt2Config) -> Result<Self> {
        config.validate()?;
        let mut rng = StdRng::seed_from_u64(config.seed);

        let embedding = Embedding::new(
            config.vocab_size,
            config.embed_dim,
            config.embedding_init_std,
            &mut rng,
        );
        let pos_encoding = PositionalEncoding::new(config.max_len, config.embed_dim)?;
        let layers = (0..config.num_layers)
            .map(|_| DecoderLayer::new(&config, &mut rng))
            .collect::<Result<Vec<_>>>()?;
        let final_norm = LayerNorm::new(config.embed_dim, config.layer_norm_eps);
        let lm_head = Dense::new(config.embed_dim, config.vocab_size, &mut rng);

        let model = Self {
            embedding,
            pos_encoding,
            layers,
            final_norm,
            lm_head,
            config,
        };
        debug!(
            "built GPT-2 model: {} layers, {} parameters",
            model.layers.len(),
            model.param_count()
        );
        Ok(model)
    }

    /// 前向传播
    ///
    /// # 参数
    /// - `src`: token IDs [batch, seq_len]
    /// - `train`: 训练模式下传入 dropout 用的随机数生成器，推理时为 `None`
    /// - `return_attn`: 是否返回每层的自注意力权重
    pub fn apply(&self, src: &Array2<usize>, mut train: Option<&mut StdRng>, return_attn: bool) -> Result<Gpt2Output> {
        self.check_input(src)?;
        let start = if log_enabled!(Level::Trace) { Some(Instant::now()) } else { None };

        // 1. 自注意力掩码
        let mask = decoder_mask(src, self.config.pad_id)?;

        // 2. 嵌入 + 位置编码
        let mut x = self.embedding.forward(src)?;
        x = self.pos_encoding.forward(&x)?;

        // 3. Decoder 层
        let mut attentions = Vec::with_capacity(if return_attn { self.layers.len() } else { 0 });
        for (i, layer) in self.layers.iter().enumerate() {
            let layer_start = start.map(|_| Instant::now());
            let (out, attn) = layer.forward(&x, Some(&mask), train.as_deref_mut())?;
            x = out;
            if return_attn {
                attentions.push(attn);
            }
            if let Some(t) = layer_start {
                trace!("decoder layer {} {:.3}ms", i, t.elapsed().as_secs_f64() * 1000.0);
            }
        }

        // 4. 最终 LayerNorm + 词表投影
        let x = self.final_norm.forward(&x)?;
        let logits = self.lm_head.forward(&x)?;

        if let Some(t) = start {
            trace!(
                "gpt2::apply batch={} seq_len={} train={} {:.3}ms",
                src.nrows(),
                src.ncols(),
                train.is_some(),
                t.elapsed().as_secs_f64() * 1000.0
            );
        }

        Ok(Gpt2Output {
            logits,
            attentions: return_attn.then_some(attentions),
        })
    }

    /// 推理模式前向传播，只返回 logits [batch, seq_len, vocab_size]
    pub fn forward(&self, src: &Array2<usize>) -> Result<Array3<f32>> {
        Ok(self.apply(src, None, false)?.logits)
    }

    fn check_input(&self, src: &Array2<usize>) -> Result<()> {
        let (batch, seq_len) = src.dim();
        if batch == 0 || seq_len == 0 {
            return Err(Gpt2Error::EmptyInput(format!(
                "expected non-empty [batch, seq_len] ids, got [{}, {}]",
                batch, seq_len
            )));
        }
        if seq_len > self.config.max_len {
            return Err(Gpt2Error::SequenceTooLong {
                len: seq_len,
                max_len: self.config.max_len,
            });
        }
        if let Some(&token) = src.iter().find(|&&id| id >= self.config.vocab_size) {
            return Err(Gpt2Error::TokenOutOfRange {
                token,
                vocab_size: self.config.vocab_size,
            });
        }
        Ok(())
    }

    /// 自回归生成
    ///
    /// 空 prompt 从 `bos_id` 开始；上下文超过 `max_len` 时只保留最近的
    /// `max_len` 个 token。生成 `eos_id` 或达到 `max_new_tokens` 时停止。
    ///
    /// 返回 prompt 与新生成的 token。
    pub fn generate(&self, prompt: &[usize], generation: &GenerationConfig, rng: &mut StdRng) -> Result<Vec<usize>> {
        generation.validate()?;

        let mut tokens = if prompt.is_empty() {
            vec![self.config.bos_id]
        } else {
            prompt.to_vec()
        };
        let mut sampler = Sampler::new(generation.sampling.clone());
        let mut warned = false;

        for _ in 0..generation.max_new_tokens {
            let start = tokens.len().saturating_sub(self.config.max_len);
            if start > 0 && !warned {
                warn!(
                    "context of {} tokens exceeds max_len {}, keeping the last {}",
                    tokens.len(),
                    self.config.max_len,
                    self.config.max_len
                );
                warned = true;
            }

            let context = &tokens[start..];
            let src = Array2::from_shape_vec((1, context.len()), context.to_vec())?;
            let logits = self.forward(&src)?;
            let last = logits.slice(s![0, context.len() - 1, ..]).to_vec();

            let next = sampler.sample(&last, rng);
            sampler.update(next);
            tokens.push(next);

            if generation.stop_at_eos && next == self.config.eos_id {
                break;
            }
        }

        Ok(tokens)
    }

    /// 获取配置
    pub fn config(&self) -> &Gpt2Config {
        &self.config
    }

    pub fn num_layers(&self) -> usize {
        self.layers.len()
    }

    /// 导出参数快照
    pub fn to_snapshot(&self) -> ParamSnapshot {
        ParamSnapshot::capture(self)
    }

    /// 导入参数快照
    ///
    /// 快照必须与当前结构完全对应；失败时参数不变。
    pub fn load_snapshot(&mut self, snapshot: &ParamSnapshot) -> Result<()> {
        snapshot.restore(self)
    }

    /// 保存参数（`.json` 为 JSON，其余为二进制）
    pub fn save_params<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        self.to_snapshot().save(path.as_ref())?;
        debug!("saved {} parameters to {}", self.param_count(), path.as_ref().display());
        Ok(())
    }

    /// 按配置重建模型并加载参数
    pub fn load_params<P: AsRef<Path>>(config: Gpt2Config, path: P) -> Result<Self> {
        let snapshot = ParamSnapshot::load(path.as_ref())?;
        let mut model = Self::new(config)?;
        model.load_snapshot(&snapshot)?;
        debug!("loaded {} parameters from {}", snapshot.param_count(), path.as_ref().display());
        Ok(model)
    }

    /// 获取模型信息
    pub fn info(&self) -> String {
        format!(
            "Gpt2(
  vocab_size: {},
  embed_dim: {},
  num_heads: {},
  num_layers: {},
  ff_dim: {},
  max_len: {},
  dropout: {:.2},
  total_params: {},
)",
            self.config.vocab_size,
            self.config.embed_dim,
            self.config.num_heads,
            self.config.num_layers,
            self.config.ff_dim,
            self.config.max_len,
            self.config.dropout_rate,
            self.param_count(),
        )
    }
}

impl Parameters for Gpt2 {
    fn named_params(&self) -> Vec<(String, &Array2<f32>)> {
        let mut params = with_prefix("embed", self.embedding.named_params());
        for (i, layer) in self.layers.iter().enumerate() {
            params.extend(with_prefix(&format!("layers.{}", i), layer.named_params()));
        }
        params.extend(with_prefix("final_norm", self.final_norm.named_params()));
        params.extend(with_prefix("lm_head", self.lm_head.named_params()));
        params
    }

    fn named_params_mut(&mut self) -> Vec<(String, &mut Array2<f32>)> {
        let mut params = with_prefix("embed", self.embedding.named_params_mut());
        for (i, layer) in self.layers.iter_mut().enumerate() {
            params.extend(with_prefix(&format!("layers.{}", i), layer.named_params_mut()));
        }
        params.extend(with_prefix("final_norm", self.final_norm.named_params_mut()));
        params.extend(with_prefix("lm_head", self.lm_head.named_params_mut()));
        params
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::configs;
    use crate::mask::pad_sequences;
    use crate::sampling::SamplingConfig;
    use ndarray::{arr2, Axis};

    fn model() -> Gpt2 {
        Gpt2::new(configs::tiny()).unwrap()
    }

    #[test]
    fn test_forward_shape() {
        let model = model();
        let src = arr2(&[[1, 5, 6, 7], [1, 8, 9, 3]]);
        let logits = model.forward(&src).unwrap();
        assert_eq!(logits.shape(), &[2, 4, model.config().vocab_size]);
        assert!(logits.iter().all(|v| v.is_finite()));
    }

    #[test]
    fn test_construction_is_seeded() {
        let a = model();
        let b = model();
        let src = arr2(&[[1, 4, 5]]);
        assert_eq!(a.forward(&src).unwrap(), b.forward(&src).unwrap());

        let other = Gpt2::new(Gpt2Config {
            seed: 7,
            ..configs::tiny()
        })
        .unwrap();
        assert_ne!(a.forward(&src).unwrap(), other.forward(&src).unwrap());
    }

    #[test]
    fn test_attention_list() {
        let model = model();
        let src = arr2(&[[1, 5, 6]]);
        let out = model.apply(&src, None, true).unwrap();
        let attentions = out.attentions.unwrap();
        assert_eq!(attentions.len(), model.num_layers());
        assert_eq!(attentions[0].shape(), &[1, model.config().num_heads, 3, 3]);

        assert!(model.apply(&src, None, false).unwrap().attentions.is_none());
    }

    #[test]
    fn test_causality() {
        // 修改后面的 token 不影响前面位置的 logits
        let model = model();
        let a = model.forward(&arr2(&[[1, 5, 6, 7]])).unwrap();
        let b = model.forward(&arr2(&[[1, 5, 6, 20]])).unwrap();

        for i in 0..3 {
            for (x, y) in a.slice(s![0, i, ..]).iter().zip(b.slice(s![0, i, ..]).iter()) {
                assert!((x - y).abs() < 1e-4);
            }
        }
        let diff: f32 = (&a.slice(s![0, 3, ..]) - &b.slice(s![0, 3, ..])).mapv(f32::abs).sum();
        assert!(diff > 1e-4);
    }

    #[test]
    fn test_padding_keys_are_ignored() {
        let model = model();
        let pad = model.config().pad_id;
        let out = model.apply(&arr2(&[[1, 5, pad, pad]]), None, true).unwrap();

        for attn in out.attentions.unwrap() {
            // 任何 query 都不关注填充位置
            assert!(attn.slice(s![0, .., .., 2..]).iter().all(|&w| w == 0.0));
        }
    }

    #[test]
    fn test_batch_matches_single() {
        let model = model();
        let batch = pad_sequences(&[vec![1, 5, 6], vec![1, 9]], model.config().pad_id, 3).unwrap();
        let batched = model.forward(&batch).unwrap();
        let single = model.forward(&arr2(&[[1, 9]])).unwrap();

        for i in 0..2 {
            for (x, y) in batched.slice(s![1, i, ..]).iter().zip(single.slice(s![0, i, ..]).iter()) {
                assert!((x - y).abs() < 1e-4);
            }
        }
    }

    #[test]
    fn test_training_mode_uses_dropout() {
        let model = model();
        let src = arr2(&[[1, 5, 6, 7]]);
        let eval = model.forward(&src).unwrap();

        let mut rng = StdRng::seed_from_u64(9);
        let train = model.apply(&src, Some(&mut rng), false).unwrap().logits;
        assert_ne!(train, eval);

        let mut rng = StdRng::seed_from_u64(9);
        let again = model.apply(&src, Some(&mut rng), false).unwrap().logits;
        assert_eq!(train, again);
    }

    #[test]
    fn test_input_validation() {
        let model = model();
        let max_len = model.config().max_len;
        let vocab = model.config().vocab_size;

        assert!(matches!(
            model.forward(&Array2::zeros((1, 0))),
            Err(Gpt2Error::EmptyInput(_))
        ));
        assert!(matches!(
            model.forward(&Array2::from_elem((1, max_len + 1), 1)),
            Err(Gpt2Error::SequenceTooLong { .. })
        ));
        assert!(matches!(
            model.forward(&arr2(&[[1, vocab]])),
            Err(Gpt2Error::TokenOutOfRange { .. })
        ));
        assert!(model.forward(&Array2::from_elem((1, max_len), 1)).is_ok());
    }

    #[test]
    fn test_zero_layers() {
        let model = Gpt2::new(Gpt2Config {
            num_layers: 0,
            ..configs::tiny()
        })
        .unwrap();
        let out = model.apply(&arr2(&[[1, 2]]), None, true).unwrap();
        assert_eq!(out.logits.len_of(Axis(2)), model.config().vocab_size);
        assert!(out.attentions.unwrap().is_empty());
    }

    #[test]
    fn test_param_count() {
        let config = configs::tiny();
        let model = Gpt2::new(config.clone()).unwrap();
        let (v, d, f) = (config.vocab_size, config.embed_dim, config.ff_dim);

        let attn = 4 * (d * d + d);
        let ffn = (d * f + f) + (f * d + d);
        let norms = 2 * 2 * d;
        let expected = v * d + config.num_layers * (attn + ffn + norms) + 2 * d + (d * v + v);
        assert_eq!(model.param_count(), expected);
        assert!(model.info().contains(&format!("total_params: {}", expected)));
    }

    #[test]
    fn test_snapshot_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gpt2.bin");
        let model = model();
        model.save_params(&path).unwrap();

        let restored = Gpt2::load_params(
            Gpt2Config {
                seed: 123,
                ..configs::tiny()
            },
            &path,
        )
        .unwrap();
        let src = arr2(&[[1, 4, 9]]);
        assert_eq!(model.forward(&src).unwrap(), restored.forward(&src).unwrap());

        let mismatched = Gpt2Config {
            num_layers: 3,
            ..configs::tiny()
        };
        assert!(matches!(
            Gpt2::load_params(mismatched, &path),
            Err(Gpt2Error::MissingParam(_))
        ));
    }

    #[test]
    fn test_snapshot_from_deeper_model_is_rejected() {
        let snapshot = model().to_snapshot();
        let mut shallow = Gpt2::new(Gpt2Config {
            num_layers: 1,
            ..configs::tiny()
        })
        .unwrap();

        match shallow.load_snapshot(&snapshot) {
            Err(Gpt2Error::UnexpectedParam(name)) => assert!(name.starts_with("layers.1.")),
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[test]
    fn test_failed_load_keeps_weights() {
        let mut snapshot = model().to_snapshot();
        snapshot.params.remove("lm_head.bias");

        let mut target = Gpt2::new(Gpt2Config {
            seed: 99,
            ..configs::tiny()
        })
        .unwrap();
        let src = arr2(&[[1, 4, 9, 2]]);
        let before = target.forward(&src).unwrap();

        assert!(matches!(
            target.load_snapshot(&snapshot),
            Err(Gpt2Error::MissingParam(name)) if name == "lm_head.bias"
        ));
        assert_eq!(target.forward(&src).unwrap(), before);
    }

    #[test]
    fn test_generate() {
        let model = model();
        let mut rng = StdRng::seed_from_u64(0);
        let generation = GenerationConfig {
            max_new_tokens: 5,
            stop_at_eos: false,
            sampling: SamplingConfig::greedy(),
        };

        let tokens = model.generate(&[1, 5], &generation, &mut rng).unwrap();
        assert_eq!(tokens.len(), 7);
        assert_eq!(&tokens[..2], &[1, 5]);
        assert!(tokens.iter().all(|&t| t < model.config().vocab_size));

        // 贪婪解码是确定的
        let again = model.generate(&[1, 5], &generation, &mut rng).unwrap();
        assert_eq!(tokens, again);

        // 空 prompt 从 BOS 开始
        let from_bos = model.generate(&[], &generation, &mut rng).unwrap();
        assert_eq!(from_bos[0], model.config().bos_id);
    }

    #[test]
    fn test_generate_beyond_max_len() {
        let model = model();
        let max_len = model.config().max_len;
        let mut rng = StdRng::seed_from_u64(0);
        let generation = GenerationConfig {
            max_new_tokens: 4,
            stop_at_eos: false,
            sampling: SamplingConfig::top_k(5),
        };

        let prompt = vec![4; max_len];
        let tokens = model.generate(&prompt, &generation, &mut rng).unwrap();
        assert_eq!(tokens.len(), max_len + 4);
    }

    #[test]
    fn test_generate_stops_at_eos() {
        let mut model = model();
        let eos = model.config().eos_id;

        // 让 LM Head 总是偏向 EOS
        for (name, p) in model.named_params_mut() {
            if name == "lm_head.bias" {
                p[[0, eos]] = 1e4;
            }
        }

        let generation = GenerationConfig {
            max_new_tokens: 10,
            stop_at_eos: true,
            sampling: SamplingConfig::greedy(),
        };
        let tokens = model.generate(&[1], &generation, &mut StdRng::seed_from_u64(0)).unwrap();
        assert_eq!(tokens, vec![1, eos]);
    }
}
