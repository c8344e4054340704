//! 错误类型

use thiserror::Error;

/// 模型操作的结果类型
pub type Result<T> = std::result::Result<T, Gpt2Error>;

/// 模型构建、前向传播和参数读写中可能出现的错误
#[derive(Error, Debug)]
pub enum Gpt2Error {
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Shape mismatch: {0}")]
    ShapeMismatch(String),

    #[error("Sequence length {len} exceeds maximum length {max_len}")]
    SequenceTooLong { len: usize, max_len: usize },

    #[error("Token id {token} out of range for vocabulary of size {vocab_size}")]
    TokenOutOfRange { token: usize, vocab_size: usize },

    #[error("Empty input: {0}")]
    EmptyInput(String),

    #[error("Missing parameter: {0}")]
    MissingParam(String),

    #[error("Unexpected parameter in snapshot: {0}")]
    UnexpectedParam(String),

    #[error("Array shape error: {0}")]
    Shape(#[from] ndarray::ShapeError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Binary serialization error: {0}")]
    Bincode(#[from] bincode::Error),
}

impl Gpt2Error {
    pub(crate) fn shape(msg: impl Into<String>) -> Self {
        Gpt2Error::ShapeMismatch(msg.into())
    }

    pub(crate) fn config(msg: impl Into<String>) -> Self {
        Gpt2Error::InvalidConfig(msg.into())
    }
}
