use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Normalized form of one raw completion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Extracted {
    /// Result of a format that can detect its own absence (`xml_<tag>`).
    Checked {
        formatted_correctly: u8,
        output: Option<String>,
    },
    Text(String),
}

impl Extracted {
    pub fn text(&self) -> Option<&str> {
        match self {
            Extracted::Text(s) => Some(s),
            Extracted::Checked { output, .. } => output.as_deref(),
        }
    }

    pub fn formatted_correctly(&self) -> Option<u8> {
        match self {
            Extracted::Checked {
                formatted_correctly,
                ..
            } => Some(*formatted_correctly),
            Extracted::Text(_) => None,
        }
    }
}

/// One evaluation unit. An absent field has not been computed yet; a present
/// one is never recomputed, which is what turns a re-run into a resume.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub unique_id: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_input: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reference: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_outputs: Option<Vec<String>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_output: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extracted_results: Option<Vec<Extracted>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extracted_result: Option<Extracted>,

    /// Per-sample begin/end marker hits, only when markers are configured.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub format_checked: Option<Vec<u8>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub generated_code: Option<Vec<String>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code_eval_results: Option<Vec<bool>>,

    /// One value per scorer, keyed by metric id.
    #[serde(flatten)]
    pub metrics: BTreeMap<String, f64>,
}

impl Record {
    pub fn new(unique_id: impl Into<String>) -> Self {
        Self {
            unique_id: unique_id.into(),
            model_input: None,
            reference: None,
            model_outputs: None,
            model_output: None,
            extracted_results: None,
            extracted_result: None,
            format_checked: None,
            generated_code: None,
            code_eval_results: None,
            metrics: BTreeMap::new(),
        }
    }

    pub fn set_model_outputs(&mut self, outputs: Vec<String>) {
        self.model_output = outputs.first().cloned();
        self.model_outputs = Some(outputs);
    }

    pub fn set_extracted_results(&mut self, results: Vec<Extracted>) {
        self.extracted_result = results.first().cloned();
        self.extracted_results = Some(results);
    }

    /// True once every generation-stage field is present.
    pub fn is_generated(&self) -> bool {
        self.model_input.is_some()
            && self.reference.is_some()
            && self.model_outputs.is_some()
            && self.extracted_results.is_some()
    }

    pub fn metric(&self, metric_id: &str) -> Option<f64> {
        self.metrics.get(metric_id).copied()
    }
}
