use anyhow::{Context, Result};
use serde::Serialize;
use serde_json::Value;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::dataset::DatasetRecord;
use crate::error::EvalError;
use crate::record::Record;

/// First field whose name contains "id", case-insensitively.
fn guess_unique_key(dataset: &[DatasetRecord]) -> Option<&str> {
    dataset
        .first()?
        .keys()
        .find(|key| key.to_lowercase().contains("id"))
        .map(|key| key.as_str())
}

fn id_value(value: Option<&Value>) -> Option<String> {
    match value? {
        Value::String(s) => Some(s.clone()),
        Value::Null => None,
        other => Some(other.to_string()),
    }
}

pub fn new_records(dataset: &[DatasetRecord]) -> Vec<Record> {
    let key = guess_unique_key(dataset);
    debug!(unique_key = ?key, "Synthesizing records from dataset");
    dataset
        .iter()
        .enumerate()
        .map(|(n, data)| {
            let id = key
                .and_then(|k| id_value(data.get(k)))
                .unwrap_or_else(|| format!("index/{}", n));
            Record::new(id)
        })
        .collect()
}

/// Parse an existing store, or synthesize one record per dataset entry when
/// no store exists yet.
pub async fn load_or_init(path: &Path, dataset: &[DatasetRecord]) -> Result<Vec<Record>> {
    let content = match tokio::fs::read_to_string(path).await {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            info!("No result store at {}, starting fresh", path.display());
            return Ok(new_records(dataset));
        }
        Err(e) => {
            return Err(e).with_context(|| format!("Failed to read result store {}", path.display()))
        }
    };

    let mut records = Vec::new();
    for (i, line) in content.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let record: Record = serde_json::from_str(line).map_err(|source| EvalError::CorruptStore {
            path: path.to_path_buf(),
            line: i + 1,
            source,
        })?;
        records.push(record);
    }

    if records.len() > dataset.len() {
        return Err(EvalError::StoreMismatch {
            records: records.len(),
            dataset: dataset.len(),
        }
        .into());
    }

    info!(
        "Resuming from {} ({} records, {} fully generated)",
        path.display(),
        records.len(),
        records.iter().filter(|r| r.is_generated()).count()
    );
    Ok(records)
}

fn parent_dir(path: &Path) -> &Path {
    match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    }
}

fn persist(path: &Path, content: &[u8]) -> Result<()> {
    let dir = parent_dir(path);
    let mut tmp = tempfile::NamedTempFile::new_in(dir)
        .with_context(|| format!("Failed to create temp file in {}", dir.display()))?;
    tmp.write_all(content)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path)
        .map_err(|e| e.error)
        .with_context(|| format!("Failed to replace {}", path.display()))?;
    Ok(())
}

/// Write `content` to a temp file beside `path`, then rename it into place.
async fn write_atomic(path: &Path, content: Vec<u8>) -> Result<()> {
    let dir = parent_dir(path);
    tokio::fs::create_dir_all(dir)
        .await
        .with_context(|| format!("Failed to create directory {}", dir.display()))?;

    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || persist(&path, &content))
        .await
        .context("Store writer task panicked")?
}

/// Overwrite the store with one JSON line per record.
pub async fn save(path: &Path, records: &[Record]) -> Result<()> {
    let mut content = Vec::new();
    for record in records {
        serde_json::to_writer(&mut content, record)?;
        content.push(b'\n');
    }
    write_atomic(path, content).await?;
    debug!("Saved {} records to {}", records.len(), path.display());
    Ok(())
}

/// `results/run.jsonl` -> `results/run_config.json`.
pub fn sidecar_path(result_path: &Path) -> PathBuf {
    let s = result_path.to_string_lossy();
    match s.strip_suffix(".jsonl") {
        Some(stem) => PathBuf::from(format!("{}_config.json", stem)),
        None => PathBuf::from(format!("{}_config.json", s)),
    }
}

pub async fn save_sidecar<T: Serialize>(result_path: &Path, value: &T) -> Result<PathBuf> {
    let path = sidecar_path(result_path);
    let mut content = serde_json::to_vec_pretty(value)?;
    content.push(b'\n');
    write_atomic(&path, content).await?;
    info!("Saved run configuration to {}", path.display());
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::Extracted;
    use serde_json::json;

    fn dataset_from(values: Vec<Value>) -> Vec<DatasetRecord> {
        values
            .into_iter()
            .map(|v| v.as_object().unwrap().clone())
            .collect()
    }

    #[test]
    fn test_new_records_uses_id_like_field() {
        let dataset = dataset_from(vec![
            json!({"prompt": "a", "Task_ID": "t/1"}),
            json!({"prompt": "b", "Task_ID": "t/2"}),
        ]);
        let records = new_records(&dataset);
        assert_eq!(records[0].unique_id, "t/1");
        assert_eq!(records[1].unique_id, "t/2");
    }

    #[test]
    fn test_new_records_numeric_id() {
        let dataset = dataset_from(vec![json!({"id": 7, "q": "x"})]);
        assert_eq!(new_records(&dataset)[0].unique_id, "7");
    }

    #[test]
    fn test_new_records_positional_fallback() {
        let dataset = dataset_from(vec![json!({"question": "a"}), json!({"question": "b"})]);
        let records = new_records(&dataset);
        assert_eq!(records[0].unique_id, "index/0");
        assert_eq!(records[1].unique_id, "index/1");
    }

    #[tokio::test]
    async fn test_load_or_init_missing_file() {
        let tmp = tempfile::tempdir().unwrap();
        let dataset = dataset_from(vec![json!({"question": "a"})]);
        let records = load_or_init(&tmp.path().join("none.jsonl"), &dataset).await.unwrap();
        assert_eq!(records.len(), 1);
        assert!(records[0].model_input.is_none());
    }

    #[tokio::test]
    async fn test_save_creates_directories_and_reloads() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("nested/dir/out.jsonl");
        let mut record = Record::new("x");
        record.model_input = Some("prompt".into());
        record.set_extracted_results(vec![Extracted::Checked {
            formatted_correctly: 0,
            output: None,
        }]);

        save(&path, &[record.clone()]).await.unwrap();

        let dataset = dataset_from(vec![json!({"question": "a"})]);
        let loaded = load_or_init(&path, &dataset).await.unwrap();
        assert_eq!(loaded, vec![record]);
    }

    #[tokio::test]
    async fn test_save_overwrites_instead_of_appending() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("out.jsonl");
        save(&path, &[Record::new("a"), Record::new("b")]).await.unwrap();
        save(&path, &[Record::new("a")]).await.unwrap();
        let content = std::fs::read_to_string(&path).unwrap();
        assert_eq!(content.lines().count(), 1);
    }

    #[tokio::test]
    async fn test_corrupt_line_is_fatal() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("out.jsonl");
        std::fs::write(&path, "{\"unique_id\":\"a\"}\n{\"unique_id\": \n").unwrap();

        let dataset = dataset_from(vec![json!({"q": 1}), json!({"q": 2})]);
        let err = load_or_init(&path, &dataset).await.unwrap_err();
        match err.downcast_ref::<EvalError>() {
            Some(EvalError::CorruptStore { line, .. }) => assert_eq!(*line, 2),
            other => panic!("expected CorruptStore, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_store_larger_than_dataset_is_fatal() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("out.jsonl");
        save(&path, &[Record::new("a"), Record::new("b")]).await.unwrap();

        let dataset = dataset_from(vec![json!({"q": 1})]);
        let err = load_or_init(&path, &dataset).await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<EvalError>(),
            Some(EvalError::StoreMismatch { .. })
        ));
    }

    #[test]
    fn test_sidecar_path() {
        assert_eq!(
            sidecar_path(Path::new("out/run.jsonl")),
            PathBuf::from("out/run_config.json")
        );
        assert_eq!(
            sidecar_path(Path::new("run.txt")),
            PathBuf::from("run.txt_config.json")
        );
    }

    #[tokio::test]
    async fn test_save_sidecar() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("run.jsonl");
        let written = save_sidecar(&path, &json!({"score": {"exact_match": 0.5}})).await.unwrap();
        let back: Value = serde_json::from_str(&std::fs::read_to_string(written).unwrap()).unwrap();
        assert_eq!(back["score"]["exact_match"], 0.5);
    }
}
