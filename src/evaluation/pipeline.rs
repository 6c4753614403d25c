use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info};

use super::progress::{RunPhase, RunProgress};
use super::Scorer;
use crate::metrics::RunMetrics;
use crate::record::Record;
use crate::store;

/// Arithmetic mean, 0.0 for an empty slice.
pub fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StageResult {
    pub metric_id: String,
    pub scores: BTreeMap<String, f64>,
    pub execution_time_ms: u64,
}

/// Runs scorers in declared order, saving the store after each one.
pub struct ScorerPipeline {
    scorers: Vec<Box<dyn Scorer>>,
    result_path: PathBuf,
    metrics: Arc<RunMetrics>,
    stages: Vec<StageResult>,
}

impl ScorerPipeline {
    pub fn new(
        scorers: Vec<Box<dyn Scorer>>,
        result_path: impl Into<PathBuf>,
        metrics: Arc<RunMetrics>,
    ) -> Self {
        Self {
            scorers,
            result_path: result_path.into(),
            metrics,
            stages: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.scorers.is_empty()
    }

    pub fn metric_ids(&self) -> Vec<&str> {
        self.scorers.iter().map(|s| s.metric_id()).collect()
    }

    pub fn stage_results(&self) -> &[StageResult] {
        &self.stages
    }

    /// Merged aggregate of every scorer; later scorers overwrite earlier
    /// entries with the same id.
    pub async fn run(
        &mut self,
        records: &mut [Record],
        progress: &mut RunProgress,
    ) -> Result<BTreeMap<String, f64>> {
        info!("Metrics: {:?}", self.metric_ids());
        progress.begin(RunPhase::Scoring, self.scorers.len());

        let mut results = BTreeMap::new();
        for scorer in &self.scorers {
            let started = Instant::now();
            scorer.prepare().await?;
            let scores = scorer.score(records).await?;
            let execution_time_ms = started.elapsed().as_millis() as u64;

            debug!(
                metric = %scorer.metric_id(),
                scores = ?scores,
                execution_time_ms = %execution_time_ms,
                "Scorer finished"
            );
            results.extend(scores.clone());
            store::save(&self.result_path, records).await?;
            self.metrics.store_saved();
            self.metrics.scorer_finished(execution_time_ms);

            self.stages.push(StageResult {
                metric_id: scorer.metric_id().to_string(),
                scores,
                execution_time_ms,
            });
            progress.step(scorer.metric_id());
        }
        Ok(results)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::evaluation::ExactMatchScorer;
    use crate::record::Extracted;
    use async_trait::async_trait;

    fn answered(id: &str, reference: &str, answer: &str) -> Record {
        let mut r = Record::new(id);
        r.reference = Some(reference.to_string());
        r.set_extracted_results(vec![Extracted::Text(answer.to_string())]);
        r
    }

    /// Scores every record with the same value.
    struct FixedScorer {
        id: &'static str,
        value: f64,
    }

    #[async_trait]
    impl Scorer for FixedScorer {
        fn metric_id(&self) -> &str {
            self.id
        }

        async fn score_record(&self, _record: &mut Record) -> Result<Option<f64>> {
            Ok(Some(self.value))
        }
    }

    /// Ignores records and returns a fixed aggregate.
    struct AggregateScorer {
        id: &'static str,
        value: f64,
    }

    #[async_trait]
    impl Scorer for AggregateScorer {
        fn metric_id(&self) -> &str {
            self.id
        }

        async fn score_record(&self, _record: &mut Record) -> Result<Option<f64>> {
            Ok(None)
        }

        async fn score(&self, _records: &mut [Record]) -> Result<BTreeMap<String, f64>> {
            Ok(BTreeMap::from([(self.id.to_string(), self.value)]))
        }
    }

    fn progress() -> RunProgress {
        RunProgress::new(uuid::Uuid::new_v4())
    }

    #[test]
    fn test_mean() {
        assert_eq!(mean(&[]), 0.0);
        assert!((mean(&[1.0, 0.0, 0.5]) - 0.5).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn test_three_of_five_exact_matches() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("run.jsonl");
        let mut records = vec![
            answered("a", "1", "1"),
            answered("b", "2", "2"),
            answered("c", "3", " 3 "),
            answered("d", "4", "5"),
            answered("e", "6", "7"),
        ];

        let mut pipeline = ScorerPipeline::new(vec![Box::new(ExactMatchScorer)], &path, RunMetrics::new());
        let scores = pipeline.run(&mut records, &mut progress()).await.unwrap();

        assert!((scores["exact_match"] - 0.6).abs() < 1e-9);
        assert_eq!(records[2].metric("exact_match"), Some(1.0));
        assert_eq!(records[4].metric("exact_match"), Some(0.0));

        let saved = std::fs::read_to_string(&path).unwrap();
        assert_eq!(saved.lines().count(), 5);
        assert!(saved.lines().next().unwrap().contains("\"exact_match\":1.0"));
    }

    #[tokio::test]
    async fn test_later_scorer_overwrites() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("run.jsonl");
        let mut records = vec![Record::new("a")];
        let scorers: Vec<Box<dyn Scorer>> = vec![
            Box::new(AggregateScorer { id: "shared", value: 0.25 }),
            Box::new(AggregateScorer { id: "other", value: 1.0 }),
            Box::new(AggregateScorer { id: "shared", value: 0.75 }),
        ];
        let mut pipeline = ScorerPipeline::new(scorers, &path, RunMetrics::new());
        let scores = pipeline.run(&mut records, &mut progress()).await.unwrap();

        assert_eq!(scores.len(), 2);
        assert_eq!(scores["shared"], 0.75);
        assert_eq!(scores["other"], 1.0);
        assert_eq!(pipeline.stage_results().len(), 3);
        assert_eq!(pipeline.stage_results()[0].scores["shared"], 0.25);
    }

    #[tokio::test]
    async fn test_existing_metric_not_recomputed() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("run.jsonl");
        let mut record = Record::new("a");
        record.metrics.insert("fixed".to_string(), 0.5);
        let mut records = vec![record];

        let mut pipeline = ScorerPipeline::new(
            vec![Box::new(FixedScorer { id: "fixed", value: 1.0 })],
            &path,
            RunMetrics::new(),
        );
        let scores = pipeline.run(&mut records, &mut progress()).await.unwrap();
        assert_eq!(scores["fixed"], 0.5);
    }
}
