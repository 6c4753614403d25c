pub mod code_eval;
pub mod exact_match;
pub mod format_check;
pub mod pipeline;
pub mod progress;

use anyhow::Result;
use async_trait::async_trait;
use std::collections::BTreeMap;
use tracing::warn;

use crate::config::Config;
use crate::record::Record;
use crate::template::OutputKind;

pub use code_eval::CodeEvalScorer;
pub use exact_match::ExactMatchScorer;
pub use format_check::FormatCheckScorer;
pub use pipeline::ScorerPipeline;

/// A metric computed per record and reduced over the run.
#[async_trait]
pub trait Scorer: Send + Sync {
    fn metric_id(&self) -> &str;

    /// Called once before `score`.
    async fn prepare(&self) -> Result<()> {
        Ok(())
    }

    /// Value for one record, or `None` when the record does not declare
    /// this metric. May also fill auxiliary record fields.
    async fn score_record(&self, record: &mut Record) -> Result<Option<f64>>;

    /// Score records lacking the metric, then take the mean over every
    /// record that declares it.
    async fn score(&self, records: &mut [Record]) -> Result<BTreeMap<String, f64>> {
        let id = self.metric_id().to_string();
        for record in records.iter_mut() {
            if record.metric(&id).is_some() {
                continue;
            }
            if let Some(value) = self.score_record(record).await? {
                record.metrics.insert(id.clone(), value);
            }
        }
        let values: Vec<f64> = records.iter().filter_map(|r| r.metric(&id)).collect();
        Ok(BTreeMap::from([(id, pipeline::mean(&values))]))
    }
}

fn load_scorer(metric_id: &str, config: &Config, kind: &OutputKind) -> Option<Box<dyn Scorer>> {
    let code_eval = |k: usize| -> Option<Box<dyn Scorer>> {
        Some(Box::new(
            CodeEvalScorer::new(k, config).with_complete_programs(kind.yields_program()),
        ))
    };
    match metric_id {
        "exact_match" => Some(Box::new(ExactMatchScorer)),
        "format_check" => Some(Box::new(FormatCheckScorer)),
        "pass@k" => code_eval(config.pass_at_k),
        id => match id.strip_prefix("pass@").and_then(|k| k.parse::<usize>().ok()) {
            Some(k) if (1..=config.n).contains(&k) => code_eval(k),
            Some(_) => {
                warn!(metric = %id, n = config.n, "pass@k needs k between 1 and n, skipping");
                None
            }
            None => {
                warn!(metric = %id, "Unknown metric, skipping");
                None
            }
        },
    }
}

/// Scorers for `metric_ids` in order. Unknown ids are reported and left out.
pub fn compose_scorers(
    metric_ids: &[String],
    config: &Config,
    kind: &OutputKind,
) -> Vec<Box<dyn Scorer>> {
    metric_ids
        .iter()
        .filter_map(|id| load_scorer(id.trim(), config, kind))
        .collect()
}
