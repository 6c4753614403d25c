use anyhow::Result;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info};

use crate::dataset::DatasetRecord;
use crate::error::EvalError;
use crate::evaluation::progress::{RunPhase, RunProgress};
use crate::metrics::RunMetrics;
use crate::model::Model;
use crate::record::Record;
use crate::store;
use crate::template::TemplateEngine;

/// Records kept by a test run.
pub const TEST_RUN_RECORDS: usize = 5;

/// Fills in the generation fields of every record, each at most once, and
/// saves the store after every record.
pub struct GenerationDriver<'a> {
    template: &'a TemplateEngine,
    model: &'a dyn Model,
    n: usize,
    result_path: PathBuf,
    test_run: bool,
    metrics: Arc<RunMetrics>,
}

impl<'a> GenerationDriver<'a> {
    pub fn new(
        template: &'a TemplateEngine,
        model: &'a dyn Model,
        n: usize,
        result_path: impl Into<PathBuf>,
        metrics: Arc<RunMetrics>,
    ) -> Self {
        Self {
            template,
            model,
            n,
            result_path: result_path.into(),
            test_run: false,
            metrics,
        }
    }

    pub fn with_test_run(mut self, test_run: bool) -> Self {
        self.test_run = test_run;
        self
    }

    /// Process `records` in order against the dataset entries at the same
    /// positions.
    pub async fn run(
        &self,
        records: &mut Vec<Record>,
        dataset: &[DatasetRecord],
        progress: &mut RunProgress,
    ) -> Result<()> {
        if self.test_run && records.len() > TEST_RUN_RECORDS {
            info!("Test run: only the first {} records are processed", TEST_RUN_RECORDS);
            records.truncate(TEST_RUN_RECORDS);
        }
        if records.len() > dataset.len() {
            return Err(EvalError::StoreMismatch {
                records: records.len(),
                dataset: dataset.len(),
            }
            .into());
        }

        info!(
            "Text-generation: {} n={} -> {}",
            self.model.name(),
            self.n,
            self.result_path.display()
        );
        self.metrics.start_generation(records.len());
        progress.begin(RunPhase::Generating, records.len());

        for i in 0..records.len() {
            if records[i].is_generated() {
                self.metrics.record_resumed();
            } else {
                self.fill(&mut records[i], &dataset[i]).await?;
                self.metrics.record_completed();
            }
            store::save(&self.result_path, records).await?;
            self.metrics.store_saved();
            progress.step(&records[i].unique_id);
        }
        Ok(())
    }

    async fn fill(&self, record: &mut Record, source: &DatasetRecord) -> Result<()> {
        if record.model_input.is_none() {
            record.model_input = Some(self.template.render_prompt(source)?);
        }
        if record.reference.is_none() {
            record.reference = Some(self.template.render_reference(source)?);
        }
        let prompt = record.model_input.clone().unwrap_or_default();

        if record.model_outputs.is_none() {
            debug!(unique_id = %record.unique_id, "Generating");
            let started = Instant::now();
            let outputs = self.model.generate(&prompt, self.n).await?;
            if outputs.len() != self.n {
                return Err(EvalError::SampleCount {
                    expected: self.n,
                    actual: outputs.len(),
                }
                .into());
            }
            self.metrics
                .generation_call(outputs.len(), started.elapsed().as_millis() as u64);
            record.set_model_outputs(outputs);
        }

        if record.extracted_results.is_none() {
            let raws = record.model_outputs.as_deref().unwrap_or_default();
            let (results, marker_hits) = self.template.normalize_all(&prompt, raws);
            record.set_extracted_results(results);
            if record.format_checked.is_none() {
                record.format_checked = marker_hits;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::EchoModel;
    use crate::record::Extracted;
    use crate::template::TemplateContract;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Echo model that counts its calls.
    struct CountingModel {
        calls: AtomicUsize,
    }

    impl CountingModel {
        fn new() -> Self {
            Self {
                calls: AtomicUsize::new(0),
            }
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Model for CountingModel {
        fn name(&self) -> &str {
            "counting"
        }

        async fn generate(&self, prompt: &str, n: usize) -> Result<Vec<String>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            EchoModel.generate(prompt, n).await
        }
    }

    struct ShortModel;

    #[async_trait]
    impl Model for ShortModel {
        fn name(&self) -> &str {
            "short"
        }

        async fn generate(&self, _prompt: &str, _n: usize) -> Result<Vec<String>> {
            Ok(vec!["only one".to_string()])
        }
    }

    fn dataset(size: usize) -> Vec<DatasetRecord> {
        (0..size)
            .map(|i| {
                json!({"id": format!("q{}", i), "question": format!("What is {}?", i), "answer": i})
                    .as_object()
                    .unwrap()
                    .clone()
            })
            .collect()
    }

    fn engine() -> TemplateEngine {
        TemplateEngine::new(TemplateContract {
            template: Some("{question}".to_string()),
            reference: Some("{answer}".to_string()),
            format: Some("line".to_string()),
            extract_begin: Some("###Output".to_string()),
            ..Default::default()
        })
        .unwrap()
    }

    fn progress() -> RunProgress {
        RunProgress::new(uuid::Uuid::new_v4())
    }

    #[tokio::test]
    async fn test_generates_every_field() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("out/run.jsonl");
        let data = dataset(3);
        let template = engine();
        let model = CountingModel::new();
        let driver = GenerationDriver::new(&template, &model, 2, &path, RunMetrics::new());

        let mut records = store::load_or_init(&path, &data).await.unwrap();
        driver.run(&mut records, &data, &mut progress()).await.unwrap();

        assert_eq!(model.calls(), 3);
        let r = &records[1];
        assert_eq!(r.unique_id, "q1");
        assert_eq!(r.model_input.as_deref(), Some("What is 1?"));
        assert_eq!(r.reference.as_deref(), Some("1"));
        assert_eq!(r.model_outputs.as_ref().unwrap().len(), 2);
        assert_eq!(r.model_output.as_deref(), Some("What is 1?\n###Output\n0\n"));
        assert_eq!(r.extracted_result, Some(Extracted::Text("0".to_string())));
        assert!(r.format_checked.is_none());

        let saved = store::load_or_init(&path, &data).await.unwrap();
        assert_eq!(saved, records);
    }

    #[tokio::test]
    async fn test_second_run_is_idempotent() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("run.jsonl");
        let data = dataset(4);
        let template = engine();

        let first = CountingModel::new();
        let mut records = store::load_or_init(&path, &data).await.unwrap();
        GenerationDriver::new(&template, &first, 1, &path, RunMetrics::new())
            .run(&mut records, &data, &mut progress())
            .await
            .unwrap();
        let before = std::fs::read(&path).unwrap();

        let second = CountingModel::new();
        let metrics = RunMetrics::new();
        let mut records = store::load_or_init(&path, &data).await.unwrap();
        GenerationDriver::new(&template, &second, 1, &path, metrics.clone())
            .run(&mut records, &data, &mut progress())
            .await
            .unwrap();

        assert_eq!(second.calls(), 0);
        assert_eq!(std::fs::read(&path).unwrap(), before);
        assert_eq!(metrics.snapshot().records_resumed, 4);
    }

    #[tokio::test]
    async fn test_resume_fills_only_missing_extraction() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("run.jsonl");
        let data = dataset(3);
        let template = engine();

        let mut records = store::new_records(&data);
        for (record, source) in records.iter_mut().zip(&data) {
            record.model_input = Some(format!("kept {}", source["id"]));
            record.reference = Some("ref".to_string());
            record.set_model_outputs(vec!["pre\n###Output\n7\n".to_string()]);
        }
        store::save(&path, &records).await.unwrap();

        let model = CountingModel::new();
        let mut records = store::load_or_init(&path, &data).await.unwrap();
        GenerationDriver::new(&template, &model, 1, &path, RunMetrics::new())
            .run(&mut records, &data, &mut progress())
            .await
            .unwrap();

        assert_eq!(model.calls(), 0);
        for record in &records {
            assert!(record.model_input.as_deref().unwrap().starts_with("kept "));
            assert_eq!(record.reference.as_deref(), Some("ref"));
            assert_eq!(record.model_output.as_deref(), Some("pre\n###Output\n7\n"));
            assert_eq!(record.extracted_result, Some(Extracted::Text("7".to_string())));
        }
    }

    #[tokio::test]
    async fn test_test_run_truncates() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("run_test_run.jsonl");
        let data = dataset(8);
        let template = engine();
        let model = CountingModel::new();

        let mut records = store::load_or_init(&path, &data).await.unwrap();
        GenerationDriver::new(&template, &model, 1, &path, RunMetrics::new())
            .with_test_run(true)
            .run(&mut records, &data, &mut progress())
            .await
            .unwrap();

        assert_eq!(records.len(), TEST_RUN_RECORDS);
        assert_eq!(model.calls(), TEST_RUN_RECORDS);
        let content = std::fs::read_to_string(&path).unwrap();
        assert_eq!(content.lines().count(), TEST_RUN_RECORDS);
    }

    #[tokio::test]
    async fn test_sample_count_mismatch_halts() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("run.jsonl");
        let data = dataset(2);
        let template = engine();

        let mut records = store::load_or_init(&path, &data).await.unwrap();
        let err = GenerationDriver::new(&template, &ShortModel, 3, &path, RunMetrics::new())
            .run(&mut records, &data, &mut progress())
            .await
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<EvalError>(),
            Some(EvalError::SampleCount { expected: 3, actual: 1 })
        ));
        assert!(records[0].model_outputs.is_none());
    }

    #[tokio::test]
    async fn test_marker_hits_persisted() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("run.jsonl");
        let data = dataset(1);
        let template = TemplateEngine::new(TemplateContract {
            template: Some("{question}".to_string()),
            begin_marker: Some("###Output\n".to_string()),
            ..Default::default()
        })
        .unwrap();

        let mut records = store::load_or_init(&path, &data).await.unwrap();
        GenerationDriver::new(&template, &EchoModel, 2, &path, RunMetrics::new())
            .run(&mut records, &data, &mut progress())
            .await
            .unwrap();

        assert_eq!(records[0].format_checked, Some(vec![1, 1]));
        let texts: Vec<_> = records[0]
            .extracted_results
            .as_ref()
            .unwrap()
            .iter()
            .map(|e| e.text().unwrap_or_default().to_string())
            .collect();
        assert_eq!(texts, vec!["0", "1"]);
    }
}
