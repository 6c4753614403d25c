pub mod openai;

use anyhow::Result;
use async_trait::async_trait;

use crate::config::Config;
use crate::error::EvalError;

pub use openai::{OpenAiModel, SamplingParams};

const OPENAI_PREFIX: &str = "openai:";

/// Text-generation capability injected into the driver.
#[async_trait]
pub trait Model: Send + Sync {
    /// Identifier used in result file names and logs.
    fn name(&self) -> &str;

    /// `n` completions for `prompt`, in a stable order.
    async fn generate(&self, prompt: &str, n: usize) -> Result<Vec<String>>;
}

/// Deterministic stand-in that echoes the prompt followed by the sample index.
pub struct EchoModel;

#[async_trait]
impl Model for EchoModel {
    fn name(&self) -> &str {
        "dummy/model"
    }

    async fn generate(&self, prompt: &str, n: usize) -> Result<Vec<String>> {
        Ok((0..n)
            .map(|i| format!("{}\n###Output\n{}\n", prompt, i))
            .collect())
    }
}

/// Build the model named by `--model`: unset or `dummy` is the echo model,
/// `openai:<name>` an OpenAI-compatible chat endpoint.
pub fn load_model(config: &Config) -> Result<Box<dyn Model>> {
    match config.model.as_deref() {
        None | Some("dummy") => Ok(Box::new(EchoModel)),
        Some(spec) => match spec.strip_prefix(OPENAI_PREFIX) {
            Some(name) => {
                let api_key = config
                    .api_key
                    .clone()
                    .ok_or(EvalError::MissingOption("api_key"))?;
                let params = SamplingParams {
                    temperature: config.temperature,
                    top_p: config.top_p,
                    max_tokens: config.max_tokens,
                };
                Ok(Box::new(OpenAiModel::new(
                    name,
                    &config.api_base,
                    api_key,
                    params,
                )?))
            }
            None => Err(EvalError::UnknownModelProvider(spec.to_string()).into()),
        },
    }
}
