use anyhow::{Context, Result};
use async_trait::async_trait;
use std::path::PathBuf;
use std::time::Duration;
use tracing::debug;

use super::Scorer;
use crate::cleanup;
use crate::config::Config;
use crate::record::{Extracted, Record};
use crate::sandbox::{self, SandboxConfig};

/// A completion is cut at the first of these.
const STOP_SEQUENCES: [&str; 7] = ["\nclass", "\ndef", "\n#", "\n@", "\nprint", "\nif", "\n```"];
const WORK_DIR_PREFIX: &str = "code-eval-";
const STALE_WORK_DIR_SECS: u64 = 3600;
const CANDIDATE_FILE: &str = "candidate.py";

/// Unbiased pass@k estimate for `c` passing samples out of `n`:
/// `1 - C(n-c, k) / C(n, k)`.
pub fn pass_at_k(n: usize, c: usize, k: usize) -> f64 {
    if c == 0 {
        return 0.0;
    }
    if n.saturating_sub(c) < k {
        return 1.0;
    }
    let miss: f64 = ((n - c + 1)..=n)
        .map(|i| 1.0 - k as f64 / i as f64)
        .product();
    1.0 - miss
}

/// Prompt followed by the completion truncated at the first stop sequence.
pub fn candidate_program(prompt: &str, completion: &str) -> String {
    let cut = STOP_SEQUENCES
        .iter()
        .filter_map(|seq| completion.find(seq))
        .min()
        .unwrap_or(completion.len());
    format!("{}\n{}", prompt, &completion[..cut])
}

/// Executes every sample against the reference test code and reports pass@k.
pub struct CodeEvalScorer {
    metric_id: String,
    k: usize,
    complete_programs: bool,
    python: String,
    timeout: Duration,
    workspace_base: PathBuf,
}

impl CodeEvalScorer {
    pub fn new(k: usize, config: &Config) -> Self {
        Self {
            metric_id: format!("pass@{}", k),
            k,
            complete_programs: false,
            python: config.python.clone(),
            timeout: Duration::from_secs(config.exec_timeout_secs),
            workspace_base: config.workspace_base.clone(),
        }
    }

    /// Samples are already whole programs and are run as they are.
    pub fn with_complete_programs(mut self, complete_programs: bool) -> Self {
        self.complete_programs = complete_programs;
        self
    }

    fn programs(&self, prompt: &str, samples: &[Extracted]) -> Vec<String> {
        samples
            .iter()
            .map(|e| e.text().unwrap_or_default())
            .map(|text| {
                if self.complete_programs {
                    text.to_string()
                } else {
                    candidate_program(prompt, text)
                }
            })
            .collect()
    }

    async fn run_candidate(&self, program: &str, tests: &str) -> Result<bool> {
        let dir = self
            .workspace_base
            .join(format!("{}{}", WORK_DIR_PREFIX, uuid::Uuid::new_v4()));
        tokio::fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("Failed to create work dir {}", dir.display()))?;

        let result = async {
            tokio::fs::write(dir.join(CANDIDATE_FILE), format!("{}\n{}", program, tests))
                .await
                .context("Failed to write candidate program")?;
            let cfg = SandboxConfig {
                timeout: self.timeout,
                ..Default::default()
            };
            sandbox::run(
                &self.python,
                &[CANDIDATE_FILE],
                &dir,
                &cfg,
                Some(&[("PYTHONDONTWRITEBYTECODE", "1")]),
            )
            .await
        }
        .await;

        cleanup::remove_work_dir(&dir).await;
        let output = result?;
        if !output.success() {
            debug!(
                exit_code = output.exit_code,
                timed_out = output.timed_out,
                stdout_bytes = output.stdout.len(),
                "Candidate failed: {}",
                output.stderr.lines().last().unwrap_or_default()
            );
        }
        Ok(output.success())
    }
}

#[async_trait]
impl Scorer for CodeEvalScorer {
    fn metric_id(&self) -> &str {
        &self.metric_id
    }

    async fn prepare(&self) -> Result<()> {
        tokio::fs::create_dir_all(&self.workspace_base)
            .await
            .with_context(|| {
                format!("Failed to create workspace {}", self.workspace_base.display())
            })?;
        cleanup::reap_stale_work_dirs(&self.workspace_base, WORK_DIR_PREFIX, STALE_WORK_DIR_SECS)
            .await;
        Ok(())
    }

    async fn score_record(&self, record: &mut Record) -> Result<Option<f64>> {
        let (Some(prompt), Some(tests), Some(samples)) = (
            record.model_input.as_deref(),
            record.reference.as_deref(),
            record.extracted_results.as_deref(),
        ) else {
            return Ok(None);
        };

        let programs = self.programs(prompt, samples);

        // Pass flags from another pass@k scorer over the same programs are reused.
        let reusable = record.generated_code.as_ref() == Some(&programs)
            && record
                .code_eval_results
                .as_ref()
                .is_some_and(|r| r.len() == programs.len());

        if !reusable {
            let mut passed = Vec::with_capacity(programs.len());
            for program in &programs {
                passed.push(self.run_candidate(program, tests).await?);
            }
            record.generated_code = Some(programs);
            record.code_eval_results = Some(passed);
        }

        let results = record.code_eval_results.as_deref().unwrap_or_default();
        let c = results.iter().filter(|p| **p).count();
        debug!(unique_id = %record.unique_id, passed = c, total = results.len(), "Code eval");
        Ok(Some(pass_at_k(results.len(), c, self.k)))
    }
}
