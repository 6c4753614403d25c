use std::path::PathBuf;

use thiserror::Error;

/// Fatal errors that abort a run. Extraction misses are never represented
/// here: normalization records them as data instead.
#[derive(Error, Debug)]
pub enum EvalError {
    /// A format string references a key the dataset record does not have
    #[error("Missing key in dataset for {template} template: {key}")]
    MissingField { key: String, template: &'static str },

    /// Malformed format-string syntax
    #[error("Malformed {template} template: {message}")]
    Format {
        template: &'static str,
        message: String,
    },

    #[error("Unsupported output format: {0}")]
    UnsupportedFormat(String),

    #[error("Unsupported output language: {0}")]
    UnsupportedLanguage(String),

    /// A required option was not provided by argument, environment or config file
    #[error("Option {0} is required")]
    MissingOption(&'static str),

    #[error("Corrupt result store {path} at line {line}: {source}")]
    CorruptStore {
        path: PathBuf,
        line: usize,
        #[source]
        source: serde_json::Error,
    },

    /// A resumed store holds more records than the dataset provides
    #[error("Result store has {records} records but the dataset only has {dataset}")]
    StoreMismatch { records: usize, dataset: usize },

    #[error("Unknown model provider: {0}")]
    UnknownModelProvider(String),

    #[error("Model returned {actual} completions, expected {expected}")]
    SampleCount { expected: usize, actual: usize },
}
