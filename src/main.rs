mod cleanup;
mod config;
mod dataset;
mod driver;
mod error;
mod evaluation;
mod metrics;
mod model;
mod record;
mod sandbox;
mod store;
mod template;

use anyhow::Result;
use clap::Parser;
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::Path;
use tracing::info;

use config::{Cli, Config};
use dataset::{Dataset, DatasetConfig, DatasetSource};
use driver::GenerationDriver;
use evaluation::pipeline::StageResult;
use evaluation::progress::{PhaseTransition, RunProgress};
use evaluation::{compose_scorers, ScorerPipeline};
use metrics::{MetricsSnapshot, RunMetrics};
use template::{guess_template, TemplateContract, TemplateEngine};

/// Provenance written next to the result store.
#[derive(Serialize)]
struct RunSummary<'a> {
    run_id: uuid::Uuid,
    finished_at: chrono::DateTime<chrono::Utc>,
    dataset_id: &'a str,
    dataset_sha256: String,
    model: &'a str,
    result_path: &'a Path,
    config: &'a Config,
    template: &'a TemplateContract,
    scores: &'a BTreeMap<String, f64>,
    stages: &'a [StageResult],
    metrics: MetricsSnapshot,
    phases: &'a [PhaseTransition],
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::resolve(Cli::parse())?;

    let directive = if config.verbose {
        "gen_eval=debug"
    } else {
        "gen_eval=info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive(directive.parse()?),
        )
        .init();

    config.print_banner();

    let run_id = uuid::Uuid::new_v4();
    let mut progress = RunProgress::new(run_id);
    let result = run(&config, run_id, &mut progress).await;
    if result.is_err() {
        progress.fail();
    }
    result
}

/// Inline template fields override the template file, which overrides a
/// contract guessed from the first record.
async fn resolve_template(config: &Config, dataset: &Dataset) -> Result<TemplateEngine> {
    let file = match &config.template_file {
        Some(path) => TemplateContract::from_file(path).await?,
        None => TemplateContract::default(),
    };
    let guessed = dataset
        .records
        .first()
        .map(guess_template)
        .unwrap_or_default();
    let contract = config.template.clone().or(file).or(guessed);

    let engine = TemplateEngine::new(contract)?;
    engine.validate(&dataset.records)?;
    info!("Output normalization: {:?}", engine.kind());
    if let Some(first) = dataset.records.first() {
        engine.log_preview(first);
    }
    Ok(engine)
}

async fn run(config: &Config, run_id: uuid::Uuid, progress: &mut RunProgress) -> Result<()> {
    let source = DatasetSource::resolve(config.dataset.as_deref(), |id| {
        let mut hf = DatasetConfig::new(id);
        hf.config_name = config.dataset_name.clone();
        hf.split = config.split.clone();
        hf.limit = config.dataset_limit;
        hf
    });
    let dataset = source.load(config.dataset_limit).await?;
    let template = resolve_template(config, &dataset).await?;

    let model = model::load_model(config)?;
    let result_path = config.result_path_for(&dataset.id, model.name());
    info!("Saving to {}", result_path.display());

    let mut records = if config.resume {
        store::load_or_init(&result_path, &dataset.records).await?
    } else {
        store::new_records(&dataset.records)
    };

    let metrics = RunMetrics::new();
    GenerationDriver::new(&template, model.as_ref(), config.n, &result_path, metrics.clone())
        .with_test_run(config.test_run)
        .run(&mut records, &dataset.records, progress)
        .await?;

    let mut pipeline = ScorerPipeline::new(
        compose_scorers(&config.metrics, config, template.kind()),
        &result_path,
        metrics.clone(),
    );
    let scores = if pipeline.is_empty() {
        BTreeMap::new()
    } else {
        let scores = pipeline.run(&mut records, progress).await?;
        info!("Scores: {:?}", scores);
        scores
    };

    store::save(&result_path, &records).await?;
    progress.complete();

    let summary = RunSummary {
        run_id,
        finished_at: chrono::Utc::now(),
        dataset_id: &dataset.id,
        dataset_sha256: dataset.sha256(),
        model: model.name(),
        result_path: &result_path,
        config,
        template: template.contract(),
        scores: &scores,
        stages: pipeline.stage_results(),
        metrics: metrics.snapshot(),
        phases: progress.transitions(),
    };
    store::save_sidecar(&result_path, &summary).await?;
    info!("Results saved to {}", result_path.display());
    Ok(())
}
