use rust_tokenizers::error::TokenizerError;
use tch::TchError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum FastBertError {
    #[error("IO error: {0}")]
    IOError(String),

    #[error("Tch tensor error: {0}")]
    TchError(String),

    #[error("Tokenizer error: {0}")]
    TokenizerError(String),

    #[error("Invalid configuration error: {0}")]
    InvalidConfigurationError(String),

    #[error("Missing configuration error: {0}")]
    MissingConfigurationError(String),

    #[error("Internal consistency error: {0}")]
    InternalConsistencyError(String),
}

impl From<std::io::Error> for FastBertError {
    fn from(error: std::io::Error) -> Self {
        FastBertError::IOError(error.to_string())
    }
}

impl From<TokenizerError> for FastBertError {
    fn from(error: TokenizerError) -> Self {
        FastBertError::TokenizerError(error.to_string())
    }
}

impl From<TchError> for FastBertError {
    fn from(error: TchError) -> Self {
        FastBertError::TchError(error.to_string())
    }
}

impl From<serde_json::Error> for FastBertError {
    fn from(error: serde_json::Error) -> Self {
        FastBertError::IOError(error.to_string())
    }
}
