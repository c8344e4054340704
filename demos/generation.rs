//! 文本生成示例
//!
//! 在随机初始化的模型上比较不同采样策略生成的 token 序列，
//! 并演示参数快照的保存与加载。

use mini_gpt2::{configs, GenerationConfig, Gpt2, SamplingConfig};
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::time::Instant;

fn main() -> mini_gpt2::Result<()> {
    env_logger::init();

    println!("╔════════════════════════════════════════════════╗");
    println!("║     GPT-2 自回归生成示例                       ║");
    println!("╚════════════════════════════════════════════════╝\n");

    let config = configs::small();
    let model = Gpt2::new(config.clone())?;
    let prompt = vec![config.bos_id, 42, 43];
    println!("prompt: {:?}\n", prompt);

    let strategies = vec![
        ("贪婪解码", SamplingConfig::greedy()),
        ("Top-k (k=10)", SamplingConfig::top_k(10)),
        ("Nucleus (p=0.9)", SamplingConfig::nucleus(0.9)),
        (
            "Nucleus + 重复惩罚",
            SamplingConfig::nucleus(0.9).with_repeat_penalty(1.3),
        ),
    ];

    for (name, sampling) in strategies {
        let generation = GenerationConfig {
            max_new_tokens: 12,
            stop_at_eos: true,
            sampling,
        };
        let mut rng = StdRng::seed_from_u64(7);

        let start = Instant::now();
        let tokens = model.generate(&prompt, &generation, &mut rng)?;
        println!("{:<20} {:?}  ({:?})", name, &tokens[prompt.len()..], start.elapsed());
    }

    // 保存并重新加载参数
    let path = std::env::temp_dir().join("mini_gpt2_small.bin");
    model.save_params(&path)?;
    let restored = Gpt2::load_params(config, &path)?;
    let generation = GenerationConfig {
        max_new_tokens: 12,
        stop_at_eos: true,
        sampling: SamplingConfig::greedy(),
    };
    let a = model.generate(&prompt, &generation, &mut StdRng::seed_from_u64(0))?;
    let b = restored.generate(&prompt, &generation, &mut StdRng::seed_from_u64(0))?;
    println!("\n加载后的模型输出一致: {}", a == b);

    Ok(())
}
