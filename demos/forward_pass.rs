//! 前向传播示例
//!
//! 构建一个小型 GPT-2，对一批填充过的序列计算 logits 和注意力权重。
//!
//! 运行：`RUST_LOG=trace cargo run --example forward_pass`

use mini_gpt2::{configs, pad_sequences, Gpt2};
use ndarray::s;
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::time::Instant;

fn main() -> mini_gpt2::Result<()> {
    env_logger::init();

    println!("╔════════════════════════════════════════════════╗");
    println!("║     GPT-2 前向传播示例                         ║");
    println!("╚════════════════════════════════════════════════╝\n");

    let config = configs::small();
    let model = Gpt2::new(config.clone())?;
    println!("{}\n", model.info());

    let sequences = vec![
        vec![config.bos_id, 10, 11, 12, 13],
        vec![config.bos_id, 20, 21],
    ];
    let src = pad_sequences(&sequences, config.pad_id, 5)?;
    println!("输入（pad_id = {}）:\n{}\n", config.pad_id, src);

    // 推理模式
    let start = Instant::now();
    let out = model.apply(&src, None, true)?;
    println!("logits 形状: {:?}  耗时: {:?}", out.logits.shape(), start.elapsed());

    if let Some(attentions) = &out.attentions {
        println!("第 1 层、第 1 个头对第 2 个序列的注意力:");
        println!("{:.3}\n", attentions[0].slice(s![1, 0, .., ..]));
    }

    // 训练模式（开启 dropout）
    let mut rng = StdRng::seed_from_u64(config.seed);
    let train = model.apply(&src, Some(&mut rng), false)?;
    let diff: f32 = (&train.logits - &out.logits).mapv(f32::abs).sum();
    println!("训练模式与推理模式 logits 的 L1 差异: {:.4}", diff);

    Ok(())
}
