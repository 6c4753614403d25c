use anyhow::Result;
use async_trait::async_trait;

use super::Scorer;
use crate::record::Record;

/// 1.0 when the extracted answer equals the reference after trimming.
pub struct ExactMatchScorer;

#[async_trait]
impl Scorer for ExactMatchScorer {
    fn metric_id(&self) -> &str {
        "exact_match"
    }

    async fn score_record(&self, record: &mut Record) -> Result<Option<f64>> {
        let (Some(reference), Some(extracted)) = (&record.reference, &record.extracted_result) else {
            return Ok(None);
        };
        let matched = extracted
            .text()
            .is_some_and(|answer| answer.trim() == reference.trim());
        Ok(Some(if matched { 1.0 } else { 0.0 }))
    }
}
