pub mod client;
pub mod types;

use anyhow::{Context, Result};
use serde_json::{json, Map, Value};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use tracing::info;

pub use client::HuggingFaceClient;
pub use types::DatasetConfig;

/// One source record: field name to value, in source order.
pub type DatasetRecord = Map<String, Value>;

const DUMMY_DATASET_ID: &str = "dummy_testdata";
const DUMMY_DATASET_SIZE: usize = 10;

#[derive(Debug, Clone)]
pub struct Dataset {
    pub id: String,
    pub records: Vec<DatasetRecord>,
}

impl Dataset {
    /// SHA-256 over the records serialized one JSON object per line.
    pub fn sha256(&self) -> String {
        let mut hasher = Sha256::new();
        for record in &self.records {
            hasher.update(serde_json::to_vec(record).unwrap_or_default());
            hasher.update(b"\n");
        }
        hex::encode(hasher.finalize())
    }
}

#[derive(Debug, Clone)]
pub enum DatasetSource {
    Dummy,
    Jsonl { path: PathBuf },
    HuggingFace { config: DatasetConfig },
}

impl DatasetSource {
    /// Pick a source from the `--dataset` value.
    pub fn resolve(dataset: Option<&str>, config: impl FnOnce(&str) -> DatasetConfig) -> Self {
        match dataset {
            None => DatasetSource::Dummy,
            Some(path) if path.ends_with(".jsonl") => DatasetSource::Jsonl {
                path: PathBuf::from(path),
            },
            Some(id) => DatasetSource::HuggingFace { config: config(id) },
        }
    }

    /// Load the records, keeping at most `limit` of them.
    pub async fn load(&self, limit: Option<usize>) -> Result<Dataset> {
        let mut dataset = match self {
            DatasetSource::Dummy => dummy_dataset(),
            DatasetSource::Jsonl { path } => load_jsonl(path).await?,
            DatasetSource::HuggingFace { config } => {
                Dataset {
                    id: config.short_id(),
                    records: HuggingFaceClient::new()?.fetch_rows(config).await?,
                }
            }
        };
        if let Some(limit) = limit {
            dataset.records.truncate(limit);
        }

        let first = dataset
            .records
            .first()
            .with_context(|| format!("Dataset {} is empty", dataset.id))?;
        info!(
            "Loaded dataset {} ({} entries)\n{}",
            dataset.id,
            dataset.records.len(),
            serde_json::to_string_pretty(first).unwrap_or_default()
        );
        Ok(dataset)
    }
}

fn dummy_dataset() -> Dataset {
    let records = (1..=DUMMY_DATASET_SIZE)
        .map(|i| {
            let value = json!({
                "task_id": format!("test_{}", i),
                "prompt": format!("test_prompt_{}", i),
                "canonical_solution": format!("test_solution_{}", i),
                "test": format!("test_test_{}", i),
                "entry_point": format!("test_entry_{}", i),
            });
            match value {
                Value::Object(map) => map,
                _ => Map::new(),
            }
        })
        .collect();
    Dataset {
        id: DUMMY_DATASET_ID.to_string(),
        records,
    }
}

pub async fn load_jsonl(path: &Path) -> Result<Dataset> {
    let content = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("The file {} does not exist", path.display()))?;

    let mut records = Vec::new();
    for (i, line) in content.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let record: DatasetRecord = serde_json::from_str(line)
            .with_context(|| format!("Invalid JSON object at {}:{}", path.display(), i + 1))?;
        records.push(record);
    }

    let id = path
        .file_name()
        .map(|n| n.to_string_lossy().trim_end_matches(".jsonl").to_string())
        .unwrap_or_else(|| path.display().to_string());

    Ok(Dataset { id, records })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hf(id: &str) -> DatasetConfig {
        DatasetConfig::new(id)
    }

    #[test]
    fn test_resolve_sources() {
        assert!(matches!(
            DatasetSource::resolve(None, hf),
            DatasetSource::Dummy
        ));
        assert!(matches!(
            DatasetSource::resolve(Some("data/jhumaneval.jsonl"), hf),
            DatasetSource::Jsonl { .. }
        ));
        match DatasetSource::resolve(Some("openai/openai_humaneval"), hf) {
            DatasetSource::HuggingFace { config } => {
                assert_eq!(config.dataset_id, "openai/openai_humaneval")
            }
            other => panic!("expected HuggingFace, got {:?}", other),
        }
    }

    #[test]
    fn test_dummy_dataset_shape() {
        let dataset = dummy_dataset();
        assert_eq!(dataset.id, "dummy_testdata");
        assert_eq!(dataset.records.len(), 10);
        assert_eq!(dataset.records[0]["task_id"], "test_1");
        assert!(dataset.records[9].contains_key("entry_point"));
    }

    #[tokio::test]
    async fn test_load_jsonl() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("mini_qa.jsonl");
        std::fs::write(
            &path,
            "{\"id\": 1, \"question\": \"q1\"}\n\n{\"id\": 2, \"question\": \"q2\"}\n",
        )
        .unwrap();

        let dataset = load_jsonl(&path).await.unwrap();
        assert_eq!(dataset.id, "mini_qa");
        assert_eq!(dataset.records.len(), 2);
        assert_eq!(dataset.records[1]["question"], "q2");
    }

    #[tokio::test]
    async fn test_load_jsonl_missing_file() {
        let err = load_jsonl(Path::new("/nonexistent/data.jsonl")).await.unwrap_err();
        assert!(err.to_string().contains("does not exist"));
    }

    #[tokio::test]
    async fn test_load_jsonl_invalid_line() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("bad.jsonl");
        std::fs::write(&path, "{\"id\": 1}\nnot json\n").unwrap();
        let err = load_jsonl(&path).await.unwrap_err();
        assert!(err.to_string().contains(":2"));
    }

    #[tokio::test]
    async fn test_load_dummy_source() {
        let dataset = DatasetSource::Dummy.load(None).await.unwrap();
        assert_eq!(dataset.records.len(), 10);
    }

    #[tokio::test]
    async fn test_load_empty_jsonl_fails() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("empty.jsonl");
        std::fs::write(&path, "").unwrap();
        let err = DatasetSource::Jsonl { path }.load(None).await.unwrap_err();
        assert!(err.to_string().contains("empty"));
    }

    #[tokio::test]
    async fn test_load_applies_limit() {
        let dataset = DatasetSource::Dummy.load(Some(3)).await.unwrap();
        assert_eq!(dataset.records.len(), 3);
        assert!(DatasetSource::Dummy.load(Some(0)).await.is_err());
    }

    #[test]
    fn test_sha256_tracks_content() {
        let a = dummy_dataset();
        let mut b = dummy_dataset();
        assert_eq!(a.sha256(), b.sha256());
        assert_eq!(a.sha256().len(), 64);
        b.records.pop();
        assert_ne!(a.sha256(), b.sha256());
    }
}
