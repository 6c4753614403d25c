use anyhow::{Context, Result};
use tracing::{debug, info};

use super::types::{DatasetConfig, HfRowsResponse};
use super::DatasetRecord;

const HF_DATASET_VIEWER_BASE: &str = "https://datasets-server.huggingface.co/rows";
const DEFAULT_TIMEOUT_SECS: u64 = 30;
const MAX_PAGE_SIZE: usize = 100;

pub struct HuggingFaceClient {
    client: reqwest::Client,
}

impl HuggingFaceClient {
    pub fn new() -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(DEFAULT_TIMEOUT_SECS))
            .build()
            .context("Failed to build HTTP client for HuggingFace")?;
        Ok(Self { client })
    }

    /// Every row of the configured split, paging through the rows API.
    pub async fn fetch_rows(&self, config: &DatasetConfig) -> Result<Vec<DatasetRecord>> {
        info!(
            "Fetching HuggingFace dataset: {} (config={}, split={}, offset={}, limit={:?})",
            config.dataset_id,
            config_name(config),
            config.split,
            config.offset,
            config.limit
        );

        let remaining = config.limit.unwrap_or(usize::MAX);
        let mut all_entries = Vec::new();
        let mut offset = config.offset;
        let mut total_count = 0;

        while all_entries.len() < remaining {
            let page_size = MAX_PAGE_SIZE.min(remaining - all_entries.len());

            let response = self.fetch_page(config, offset, page_size).await?;

            if let Some(total) = response.num_rows_total {
                total_count = total;
            }

            let row_count = response.rows.len();
            if row_count == 0 {
                break;
            }

            all_entries.extend(response.rows.into_iter().map(|wrapper| wrapper.row));
            offset += row_count;

            if row_count < page_size {
                break;
            }
        }

        info!(
            "Fetched {} entries from {} (total available: {})",
            all_entries.len(),
            config.dataset_id,
            total_count
        );

        Ok(all_entries)
    }

    async fn fetch_page(
        &self,
        config: &DatasetConfig,
        offset: usize,
        length: usize,
    ) -> Result<HfRowsResponse> {
        let url = page_url(config, offset, length);
        debug!("Requesting HuggingFace API: {}", url);

        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .context("Failed to send request to HuggingFace dataset viewer")?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            anyhow::bail!(
                "HuggingFace API returned HTTP {}: {}",
                status.as_u16(),
                body.chars().take(500).collect::<String>()
            );
        }

        resp.json()
            .await
            .context("Failed to parse HuggingFace API response")
    }
}

fn config_name(config: &DatasetConfig) -> &str {
    config.config_name.as_deref().unwrap_or("default")
}

fn page_url(config: &DatasetConfig, offset: usize, length: usize) -> String {
    format!(
        "{}?dataset={}&config={}&split={}&offset={}&length={}",
        HF_DATASET_VIEWER_BASE,
        config.dataset_id,
        config_name(config),
        config.split,
        offset,
        length
    )
}
