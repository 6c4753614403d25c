use serde::{Deserialize, Serialize};

use super::DatasetRecord;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatasetConfig {
    pub dataset_id: String,
    /// Dataset config name (`name=` in the HuggingFace loader).
    #[serde(default)]
    pub config_name: Option<String>,
    #[serde(default = "default_split")]
    pub split: String,
    /// `None` fetches every row.
    #[serde(default)]
    pub limit: Option<usize>,
    #[serde(default)]
    pub offset: usize,
}

pub(crate) fn default_split() -> String {
    "test".to_string()
}

impl DatasetConfig {
    pub fn new(dataset_id: impl Into<String>) -> Self {
        Self {
            dataset_id: dataset_id.into(),
            config_name: None,
            split: default_split(),
            limit: None,
            offset: 0,
        }
    }

    /// Short id used to name result files: last path segment plus `_<config>`.
    pub fn short_id(&self) -> String {
        let base = self
            .dataset_id
            .rsplit('/')
            .next()
            .unwrap_or(&self.dataset_id);
        match self.config_name {
            Some(ref name) => format!("{}_{}", base, name),
            None => base.to_string(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub(crate) struct HfRowsResponse {
    pub rows: Vec<HfRowWrapper>,
    #[serde(default)]
    pub num_rows_total: Option<usize>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct HfRowWrapper {
    pub row: DatasetRecord,
}
