use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CoreError {
    #[error("duplicate rule for metric {0}")]
    DuplicateMetric(String),

    #[error("invalid match type: {0:?}")]
    InvalidMatchType(String),

    #[error("config error: {0}")]
    Config(String),
}
