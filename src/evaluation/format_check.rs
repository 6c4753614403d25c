use anyhow::Result;
use async_trait::async_trait;

use super::pipeline::mean;
use super::Scorer;
use crate::record::Record;

/// Share of samples whose answer was found in the expected shape: the
/// `formatted_correctly` flags of structured results, else the begin/end
/// marker hits.
pub struct FormatCheckScorer;

#[async_trait]
impl Scorer for FormatCheckScorer {
    fn metric_id(&self) -> &str {
        "format_check"
    }

    async fn score_record(&self, record: &mut Record) -> Result<Option<f64>> {
        let flags: Vec<f64> = record
            .extracted_results
            .iter()
            .flatten()
            .filter_map(|e| e.formatted_correctly())
            .map(f64::from)
            .collect();
        if !flags.is_empty() {
            return Ok(Some(mean(&flags)));
        }
        Ok(record
            .format_checked
            .as_deref()
            .filter(|hits| !hits.is_empty())
            .map(|hits| mean(&hits.iter().copied().map(f64::from).collect::<Vec<_>>())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::Extracted;

    #[tokio::test]
    async fn test_structured_results() {
        let mut r = Record::new("x");
        r.set_extracted_results(vec![
            Extracted::Checked {
                formatted_correctly: 1,
                output: Some("a".into()),
            },
            Extracted::Checked {
                formatted_correctly: 0,
                output: None,
            },
        ]);
        assert_eq!(FormatCheckScorer.score_record(&mut r).await.unwrap(), Some(0.5));
    }

    #[tokio::test]
    async fn test_marker_hits() {
        let mut r = Record::new("x");
        r.set_extracted_results(vec![Extracted::Text("a".into())]);
        r.format_checked = Some(vec![1, 1, 0, 1]);
        assert_eq!(FormatCheckScorer.score_record(&mut r).await.unwrap(), Some(0.75));
    }

    #[tokio::test]
    async fn test_plain_text_not_declared() {
        let mut r = Record::new("x");
        r.set_extracted_results(vec![Extracted::Text("a".into())]);
        assert_eq!(FormatCheckScorer.score_record(&mut r).await.unwrap(), None);
    }
}
