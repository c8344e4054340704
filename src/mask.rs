//! 注意力掩码
//!
//! 掩码统一使用布尔张量 `[batch, 1, q_len, k_len]`，`true` 表示允许关注。
//! 第二维为 1，对所有注意力头广播。

use ndarray::{Array2, Array4, Zip};

use crate::error::{Gpt2Error, Result};

/// 因果掩码（下三角矩阵）
///
/// ```text
/// [[1, 0, 0],
///  [1, 1, 0],
///  [1, 1, 1]]
/// ```
pub fn causal_mask(seq_len: usize) -> Array2<bool> {
    Array2::from_shape_fn((seq_len, seq_len), |(i, j)| j <= i)
}

/// 由 query/key 的有效位置构造成对掩码
///
/// `mask[b, 0, i, j] = query_valid[b, i] && key_valid[b, j]`
pub fn make_attention_mask(query_valid: &Array2<bool>, key_valid: &Array2<bool>) -> Result<Array4<bool>> {
    let (batch, q_len) = query_valid.dim();
    let (key_batch, k_len) = key_valid.dim();
    if batch != key_batch {
        return Err(Gpt2Error::shape(format!(
            "query batch {} != key batch {}",
            batch, key_batch
        )));
    }

    Ok(Array4::from_shape_fn((batch, 1, q_len, k_len), |(b, _, i, j)| {
        query_valid[[b, i]] && key_valid[[b, j]]
    }))
}

/// 批量因果掩码 `[batch, 1, seq_len, seq_len]`
pub fn make_causal_mask(batch: usize, seq_len: usize) -> Array4<bool> {
    Array4::from_shape_fn((batch, 1, seq_len, seq_len), |(_, _, i, j)| j <= i)
}

/// 逐元素取与，合并多个掩码
///
/// 全部为 `None` 时返回 `None`。
pub fn combine_masks(masks: &[Option<&Array4<bool>>]) -> Result<Option<Array4<bool>>> {
    let mut combined: Option<Array4<bool>> = None;

    for mask in masks.iter().flatten() {
        combined = Some(match combined {
            None => (*mask).clone(),
            Some(mut acc) => {
                if acc.shape() != mask.shape() {
                    return Err(Gpt2Error::shape(format!(
                        "cannot combine masks of shape {:?} and {:?}",
                        acc.shape(),
                        mask.shape()
                    )));
                }
                Zip::from(&mut acc).and(*mask).for_each(|a, &m| *a = *a && m);
                acc
            }
        });
    }

    Ok(combined)
}

/// Decoder 自注意力掩码：因果掩码 ∧ 填充掩码
///
/// query 位置不因填充而被屏蔽，值为 `pad_id` 的 key 位置被屏蔽。
pub fn decoder_mask(src: &Array2<usize>, pad_id: usize) -> Result<Array4<bool>> {
    let (batch, seq_len) = src.dim();
    let query_valid = Array2::from_elem((batch, seq_len), true);
    let key_valid = src.mapv(|id| id != pad_id);

    let padding = make_attention_mask(&query_valid, &key_valid)?;
    let causal = make_causal_mask(batch, seq_len);

    combine_masks(&[Some(&padding), Some(&causal)])?
        .ok_or_else(|| Gpt2Error::EmptyInput("no mask to combine".to_string()))
}

/// 将长度不一的序列右填充成 `[batch, seq_len]`
pub fn pad_sequences(sequences: &[Vec<usize>], pad_id: usize, seq_len: usize) -> Result<Array2<usize>> {
    if sequences.is_empty() {
        return Err(Gpt2Error::EmptyInput("no sequences to pad".to_string()));
    }

    let mut batch = Array2::from_elem((sequences.len(), seq_len), pad_id);
    for (row, seq) in sequences.iter().enumerate() {
        if seq.len() > seq_len {
            return Err(Gpt2Error::SequenceTooLong {
                len: seq.len(),
                max_len: seq_len,
            });
        }
        for (col, &id) in seq.iter().enumerate() {
            batch[[row, col]] = id;
        }
    }

    Ok(batch)
}
