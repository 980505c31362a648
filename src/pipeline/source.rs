//! JSONL content source
//!
//! One JSON object per line:
//! `{"topic": "prices", "timestamp": "2024-01-01T00:00:00Z", "payload": "<hex>"}`

use super::ingestion::RawContent;
use crate::error::{AuditError, AuditResult};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tokio::sync::mpsc;

#[derive(Debug, Deserialize)]
struct ContentLine {
    topic: String,
    timestamp: DateTime<Utc>,
    payload: String,
}

/// Parse one line; blank lines yield `None`
pub fn parse_content_line(line: &str) -> AuditResult<Option<RawContent>> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(None);
    }

    let parsed: ContentLine = serde_json::from_str(line)?;
    if parsed.topic.is_empty() {
        return Err(AuditError::Construction("content line without topic".to_string()));
    }
    let payload = hex::decode(&parsed.payload)
        .map_err(|e| AuditError::Construction(format!("payload is not hex: {}", e)))?;

    Ok(Some(RawContent {
        topic: parsed.topic,
        payload,
        timestamp: parsed.timestamp,
    }))
}

/// Forward every valid line of `reader` into `tx`
///
/// Malformed lines are logged and skipped. Returns the number of items
/// forwarded once the reader is exhausted or the receiver is gone.
pub async fn forward_jsonl<R>(reader: R, tx: mpsc::Sender<RawContent>) -> AuditResult<u64>
where
    R: AsyncBufRead + Unpin,
{
    let mut lines = reader.lines();
    let mut forwarded = 0u64;
    let mut line_no = 0u64;

    while let Some(line) = lines.next_line().await? {
        line_no += 1;
        match parse_content_line(&line) {
            Ok(Some(content)) => {
                if tx.send(content).await.is_err() {
                    log::warn!("⚠️  Ingestion channel closed, stopping JSONL source");
                    break;
                }
                forwarded += 1;
            }
            Ok(None) => {}
            Err(e) => log::warn!("⚠️  Skipping line {}: {}", line_no, e),
        }
    }

    log::info!("✅ JSONL source finished ({} items forwarded)", forwarded);
    Ok(forwarded)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_parse_valid_line() {
        let content = parse_content_line(
            r#"{"topic":"prices","timestamp":"2024-01-01T00:00:00Z","payload":"cafe"}"#,
        )
        .unwrap()
        .unwrap();

        assert_eq!(content.topic, "prices");
        assert_eq!(content.payload, vec![0xca, 0xfe]);
        assert_eq!(content.timestamp, Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap());
    }

    #[test]
    fn test_parse_rejects_bad_lines() {
        assert!(parse_content_line("   ").unwrap().is_none());
        assert!(matches!(
            parse_content_line("not json").unwrap_err(),
            AuditError::Serialization(_)
        ));
        assert!(matches!(
            parse_content_line(r#"{"topic":"p","timestamp":"2024-01-01T00:00:00Z","payload":"zz"}"#)
                .unwrap_err(),
            AuditError::Construction(_)
        ));
        assert!(parse_content_line(r#"{"topic":"","timestamp":"2024-01-01T00:00:00Z","payload":""}"#)
            .is_err());
    }

    #[tokio::test]
    async fn test_forward_skips_malformed_lines() {
        let input = concat!(
            r#"{"topic":"prices","timestamp":"2024-01-01T00:00:00Z","payload":"01"}"#,
            "\n",
            "garbage\n",
            "\n",
            r#"{"topic":"volumes","timestamp":"2024-01-01T00:00:01Z","payload":"02"}"#,
            "\n",
        );
        let (tx, mut rx) = mpsc::channel(8);

        let forwarded = forward_jsonl(input.as_bytes(), tx).await.unwrap();
        assert_eq!(forwarded, 2);

        assert_eq!(rx.recv().await.unwrap().topic, "prices");
        assert_eq!(rx.recv().await.unwrap().topic, "volumes");
        assert!(rx.recv().await.is_none());
    }
}
