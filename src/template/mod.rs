pub mod normalize;
pub mod render;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::path::Path;
use tracing::{info, warn};

use crate::dataset::DatasetRecord;
use crate::error::EvalError;
use crate::record::Extracted;

const DEFAULT_WRAPPER_TAG: &str = "PYTHON";
const MULTIPLE_CHOICE_DELIM: &str = "###Output";

/// Declarative template contract as read from a template file, a config
/// file or guessed from the dataset. Every field is optional so partial
/// contracts can be layered.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TemplateContract {
    #[serde(default, alias = "prompt_template", skip_serializing_if = "Option::is_none")]
    pub template: Option<String>,
    #[serde(default, alias = "reference_template", skip_serializing_if = "Option::is_none")]
    pub reference: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_lang: Option<String>,
    #[serde(default, alias = "output_format", skip_serializing_if = "Option::is_none")]
    pub format: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub begin_marker: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_marker: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extract_begin: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extract_end: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wrapper_tag: Option<String>,
}

impl TemplateContract {
    /// Read a `.json` or `.yaml`/`.yml` template file.
    pub async fn from_file(path: &Path) -> Result<Self> {
        let content = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read template {}", path.display()))?;
        match path.extension().and_then(|e| e.to_str()) {
            Some("json") => serde_json::from_str(&content)
                .with_context(|| format!("Invalid template {}", path.display())),
            Some("yaml") | Some("yml") => serde_yaml::from_str(&content)
                .with_context(|| format!("Invalid template {}", path.display())),
            _ => anyhow::bail!(
                "Unsupported template format {}, use .json or .yaml",
                path.display()
            ),
        }
    }

    /// Fill every field `self` leaves unset from `lower`.
    pub fn or(self, lower: TemplateContract) -> Self {
        Self {
            template: self.template.or(lower.template),
            reference: self.reference.or(lower.reference),
            output_lang: self.output_lang.or(lower.output_lang),
            format: self.format.or(lower.format),
            begin_marker: self.begin_marker.or(lower.begin_marker),
            end_marker: self.end_marker.or(lower.end_marker),
            extract_begin: self.extract_begin.or(lower.extract_begin),
            extract_end: self.extract_end.or(lower.extract_end),
            wrapper_tag: self.wrapper_tag.or(lower.wrapper_tag),
        }
    }
}

fn has_all_keys(data: &DatasetRecord, keys: &[&str]) -> bool {
    keys.iter().all(|k| data.contains_key(*k))
}

/// Best-effort contract for well-known dataset shapes. Empty when nothing
/// matches.
pub fn guess_template(sample: &DatasetRecord) -> TemplateContract {
    if has_all_keys(sample, &["prompt", "test", "entry_point"]) {
        return TemplateContract {
            template: Some("{prompt}".to_string()),
            reference: Some("\n{test}\ncheck({entry_point})\n".to_string()),
            output_lang: Some("PL".to_string()),
            format: Some("humaneval".to_string()),
            ..Default::default()
        };
    }
    if has_all_keys(
        sample,
        &["question", "choice0", "choice1", "choice2", "choice3", "choice4", "label"],
    ) {
        return TemplateContract {
            template: Some(format!(
                "{{question}}\n選択肢: (0) {{choice0}} (1) {{choice1}} (2) {{choice2}} (3) {{choice3}} (4) {{choice4}}\n{}\n",
                MULTIPLE_CHOICE_DELIM
            )),
            reference: Some("{label}".to_string()),
            format: Some("line".to_string()),
            extract_begin: Some(MULTIPLE_CHOICE_DELIM.to_string()),
            ..Default::default()
        };
    }
    TemplateContract::default()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputLang {
    Natural,
    Code,
}

impl OutputLang {
    pub fn parse(tag: Option<&str>) -> Result<Self, EvalError> {
        match tag {
            None | Some("NL") | Some("en") | Some("ja") | Some("ko") => Ok(OutputLang::Natural),
            Some("PL") | Some("py") | Some("python") | Some("cpp") | Some("js") | Some("rs")
            | Some("ru") => Ok(OutputLang::Code),
            Some(other) => Err(EvalError::UnsupportedLanguage(other.to_string())),
        }
    }
}

/// Closed set of normalization strategies, resolved once per run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutputKind {
    DefaultNl,
    DefaultCode,
    Xml { tag: String, lang: OutputLang },
    HumanEval,
    MultipleChoice,
    Tag { open: String, close: String },
    Line,
}

impl OutputKind {
    pub fn resolve(
        format: Option<&str>,
        lang: OutputLang,
        wrapper_tag: Option<&str>,
    ) -> Result<Self, EvalError> {
        match format.unwrap_or("default") {
            "default" => Ok(match lang {
                OutputLang::Natural => OutputKind::DefaultNl,
                OutputLang::Code => OutputKind::DefaultCode,
            }),
            "humaneval" => Ok(OutputKind::HumanEval),
            "multiplechoice" => Ok(OutputKind::MultipleChoice),
            "line" => Ok(OutputKind::Line),
            "tag" => {
                let name = wrapper_tag.unwrap_or(DEFAULT_WRAPPER_TAG);
                Ok(OutputKind::Tag {
                    open: format!("[{}]", name),
                    close: format!("[/{}]", name),
                })
            }
            xml if xml.starts_with("xml_") && xml.len() > "xml_".len() => Ok(OutputKind::Xml {
                tag: xml["xml_".len()..].to_string(),
                lang,
            }),
            other => Err(EvalError::UnsupportedFormat(other.to_string())),
        }
    }

    /// Normalized text is a complete program, prompt included, rather than
    /// a continuation of the prompt.
    pub fn yields_program(&self) -> bool {
        matches!(self, OutputKind::DefaultCode | OutputKind::HumanEval)
    }
}

/// Normalization of one raw completion plus the marker pre-filter outcome.
#[derive(Debug, Clone, PartialEq)]
pub struct Normalized {
    pub result: Extracted,
    pub marker_hit: Option<u8>,
}

/// Resolved, immutable template contract.
#[derive(Debug, Clone)]
pub struct TemplateEngine {
    contract: TemplateContract,
    prompt: String,
    reference: String,
    kind: OutputKind,
}

impl TemplateEngine {
    pub fn new(contract: TemplateContract) -> Result<Self, EvalError> {
        let prompt = contract
            .template
            .clone()
            .ok_or(EvalError::MissingOption("prompt_template"))?;
        let reference = contract.reference.clone().unwrap_or_default();
        render::referenced_fields(&prompt, "prompt")?;
        render::referenced_fields(&reference, "reference")?;

        let lang = OutputLang::parse(contract.output_lang.as_deref())?;
        let kind = OutputKind::resolve(
            contract.format.as_deref(),
            lang,
            contract.wrapper_tag.as_deref(),
        )?;

        Ok(Self {
            contract,
            prompt,
            reference,
            kind,
        })
    }

    pub fn contract(&self) -> &TemplateContract {
        &self.contract
    }

    pub fn kind(&self) -> &OutputKind {
        &self.kind
    }

    pub fn render_prompt(&self, data: &DatasetRecord) -> Result<String, EvalError> {
        render::render(&self.prompt, data, "prompt")
    }

    pub fn render_reference(&self, data: &DatasetRecord) -> Result<String, EvalError> {
        render::render(&self.reference, data, "reference")
    }

    /// Check that every dataset record carries every key both templates use.
    pub fn validate(&self, dataset: &[DatasetRecord]) -> Result<(), EvalError> {
        for (fmt, template) in [(&self.prompt, "prompt"), (&self.reference, "reference")] {
            let fields = render::referenced_fields(fmt, template)?;
            for data in dataset {
                if let Some(key) = fields.iter().find(|k| !data.contains_key(k.as_str())) {
                    return Err(EvalError::MissingField {
                        key: key.clone(),
                        template,
                    });
                }
            }
        }
        Ok(())
    }

    fn has_markers(&self) -> bool {
        self.contract.begin_marker.is_some() || self.contract.end_marker.is_some()
    }

    pub fn normalize(&self, prompt: &str, raw: &str) -> Normalized {
        let (text, marker_hit) = if self.has_markers() {
            let (sliced, hit) = normalize::apply_markers(
                raw,
                self.contract.begin_marker.as_deref(),
                self.contract.end_marker.as_deref(),
            );
            (sliced, Some(u8::from(hit)))
        } else {
            (raw, None)
        };

        let text: Cow<'_, str> = normalize::line_window(
            text,
            self.contract.extract_begin.as_deref(),
            self.contract.extract_end.as_deref(),
        );

        Normalized {
            result: normalize::normalize(&self.kind, prompt, &text),
            marker_hit,
        }
    }

    /// Normalize every sample; marker flags are returned only when markers
    /// are configured.
    pub fn normalize_all(&self, prompt: &str, raws: &[String]) -> (Vec<Extracted>, Option<Vec<u8>>) {
        let mut results = Vec::with_capacity(raws.len());
        let mut hits = Vec::with_capacity(raws.len());
        for raw in raws {
            let normalized = self.normalize(prompt, raw);
            results.push(normalized.result);
            hits.extend(normalized.marker_hit);
        }
        let hits = if self.has_markers() { Some(hits) } else { None };
        (results, hits)
    }

    /// Log the first record's rendering so the operator can confirm it.
    pub fn log_preview(&self, sample: &DatasetRecord) {
        match (self.render_prompt(sample), self.render_reference(sample)) {
            (Ok(prompt), Ok(reference)) => {
                info!("Confirm the prompt format\n{}", prompt);
                info!("Confirm the reference data\n{}", reference);
            }
            (Err(e), _) | (_, Err(e)) => warn!("Template preview failed: {}", e),
        }
    }
}
