use thiserror::Error;

/// The error taxonomy of the engine. Every public fallible call returns
/// `Result<T, Error>` rather than a C++-style exception hierarchy; each
/// variant below corresponds 1:1 to one of the exception kinds the original
/// engine raises.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum Error {
    #[error("could not match any regex at {line}:{column}")]
    LexicalAnalysis { line: usize, column: usize },

    #[error("{message} at {line}:{column}")]
    SqlParser {
        message: String,
        line: usize,
        column: usize,
    },

    #[error("{0}")]
    Sql(String),

    #[error("{0}")]
    Mapping(String),

    #[error("{0}")]
    Filesystem(String),

    #[error("{0}")]
    Json(String),

    #[error("{0}")]
    Index(String),

    #[error("{0}")]
    InvalidOperation(String),

    #[error("{0}")]
    Exception(String),
}

impl Error {
    pub fn sql(message: impl Into<String>) -> Self {
        Error::Sql(message.into())
    }

    pub fn mapping(message: impl Into<String>) -> Self {
        Error::Mapping(message.into())
    }

    pub fn filesystem(message: impl Into<String>) -> Self {
        Error::Filesystem(message.into())
    }

    pub fn json(inner: impl std::fmt::Display) -> Self {
        Error::Json(format!("could not parse json: {inner}"))
    }

    pub fn index(message: impl Into<String>) -> Self {
        Error::Index(message.into())
    }

    pub fn invalid_operation(message: impl Into<String>) -> Self {
        Error::InvalidOperation(message.into())
    }

    pub fn exception(message: impl Into<String>) -> Self {
        Error::Exception(message.into())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
