//! Nightly archival batch.
//!
//! Walks UTC day partitions from `now − t_minus` up to but excluding today
//! and turns each day's crawled records into JSONL archive files of at most
//! `batch_size` lines. Already-uploaded files are skipped, so re-running a
//! window is a no-op. Snapshot fetches are bounded to `max_inflight` at a
//! time while the file writes stay ordered and serialized.

use std::io::Write as _;
use std::sync::Arc;

use chrono::{DateTime, Duration as ChronoDuration, NaiveDate, Utc};
use futures_util::StreamExt;
use serde::Serialize;
use serde_json::json;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::config::CrunchConfig;
use crate::error::{ReaderError, Result};
use crate::formatter::{FormatPolicy, Formatter, RespondWith};
use crate::snapshot::{PageResult, Snapshot};
use crate::storage::{CrawledRecord, ObjectStore, RecordStore};

/// Progress frames streamed to an invoking caller
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum CrunchEvent {
    Started,
    /// One uploaded archive file
    File { name: String },
    Finished { files: usize },
}

/// Outcome of one crunch run
#[derive(Debug, Clone, Default)]
pub struct CrunchReport {
    pub files_uploaded: usize,
    pub records_archived: usize,
}

/// The day-partitioned batch job
pub struct Cruncher {
    records: Arc<dyn RecordStore>,
    objects: Arc<dyn ObjectStore>,
    formatter: Arc<Formatter>,
    config: CrunchConfig,
}

impl Cruncher {
    pub fn new(
        records: Arc<dyn RecordStore>,
        objects: Arc<dyn ObjectStore>,
        formatter: Arc<Formatter>,
        config: CrunchConfig,
    ) -> Self {
        Self {
            records,
            objects,
            formatter,
            config,
        }
    }

    /// Run the batch over the configured window ending yesterday.
    pub async fn crunch(
        &self,
        now: DateTime<Utc>,
        progress: Option<mpsc::Sender<CrunchEvent>>,
    ) -> Result<CrunchReport> {
        let today = now.date_naive();
        let mut report = CrunchReport::default();

        if let Some(tx) = &progress {
            let _ = tx.send(CrunchEvent::Started).await;
        }
        info!(
            t_minus = self.config.t_minus_days,
            rev = self.config.rev,
            "crunch window starting"
        );

        let mut day = today - ChronoDuration::days(self.config.t_minus_days);
        while day < today {
            self.crunch_day(day, &mut report, progress.as_ref()).await?;
            day += ChronoDuration::days(1);
        }

        if let Some(tx) = &progress {
            let _ = tx
                .send(CrunchEvent::Finished {
                    files: report.files_uploaded,
                })
                .await;
        }
        info!(
            files = report.files_uploaded,
            records = report.records_archived,
            "crunch window complete"
        );
        Ok(report)
    }

    async fn crunch_day(
        &self,
        day: NaiveDate,
        report: &mut CrunchReport,
        progress: Option<&mpsc::Sender<CrunchEvent>>,
    ) -> Result<()> {
        let day_start = day
            .and_hms_opt(0, 0, 0)
            .ok_or_else(|| ReaderError::Internal(format!("bad day boundary for {day}")))?
            .and_utc();
        let day_end = day_start + ChronoDuration::days(1);

        let mut offset = 0usize;
        loop {
            let name =
                archive_object_name(&self.config.prefix, self.config.rev, day, offset);
            if self.objects.exists(&name).await? {
                debug!(object = %name, "archive exists, skipping batch");
                offset += self.config.batch_size;
                continue;
            }

            let records = self
                .records
                .list_range(day_start, day_end, offset, self.config.batch_size)
                .await?;
            if records.is_empty() {
                break;
            }

            let written = self.write_batch(&name, &records).await?;
            report.files_uploaded += 1;
            report.records_archived += written;
            if let Some(tx) = progress {
                let _ = tx.send(CrunchEvent::File { name: name.clone() }).await;
            }
            offset += self.config.batch_size;
        }
        Ok(())
    }

    /// Build one archive file in a temp location and upload it.
    async fn write_batch(&self, name: &str, records: &[CrawledRecord]) -> Result<usize> {
        let mut file = tempfile::NamedTempFile::new()
            .map_err(|e| ReaderError::StorageFailure(format!("temp file: {e}")))?;

        // Fetch and format up to `max_inflight` records at a time; `buffered`
        // keeps completion order so the writes below stay serialized.
        let mut lines = futures::stream::iter(records.iter().cloned())
            .map(|record| {
                let objects = Arc::clone(&self.objects);
                let formatter = Arc::clone(&self.formatter);
                async move { render_record(objects, formatter, record).await }
            })
            .buffered(self.config.max_inflight);

        let mut written = 0usize;
        while let Some(line) = lines.next().await {
            let Some(line) = line else { continue };
            file.write_all(line.as_bytes())
                .and_then(|()| file.write_all(b"\n"))
                .map_err(|e| ReaderError::StorageFailure(format!("write line: {e}")))?;
            written += 1;
        }
        drop(lines);
        file.flush()
            .map_err(|e| ReaderError::StorageFailure(format!("flush: {e}")))?;

        self.objects
            .put_file(name, file.path(), "application/jsonl")
            .await?;
        debug!(object = %name, lines = written, "uploaded archive file");
        Ok(written)
    }
}

/// Archive file name for one `(day, offset)` partition.
///
/// The first batch is labelled with the literal `00000`; later offsets use
/// their plain decimal value. Asymmetric, but the existing archive uses
/// exactly this shape.
pub fn archive_object_name(prefix: &str, rev: u32, day: NaiveDate, offset: usize) -> String {
    let label = if offset == 0 {
        "00000".to_string()
    } else {
        offset.to_string()
    };
    format!("{}/r{}/{}-{}.jsonl", prefix, rev, day.format("%Y-%m-%d"), label)
}

/// Fetch one record's snapshot and render its archive line.
///
/// Parse failures skip the record; the batch continues without it.
async fn render_record(
    objects: Arc<dyn ObjectStore>,
    formatter: Arc<Formatter>,
    record: CrawledRecord,
) -> Option<String> {
    let bytes = match objects.get(&record.snapshot_path).await {
        Ok(b) => b,
        Err(e) => {
            warn!(record = %record.id, "snapshot fetch failed: {e}");
            return None;
        }
    };
    let snapshot: Snapshot = match serde_json::from_slice(&bytes) {
        Ok(s) => s,
        Err(e) => {
            warn!(record = %record.id, "snapshot parse failed: {e}");
            return None;
        }
    };
    let page = PageResult {
        url: snapshot.href.clone(),
        snapshot,
        screenshot: None,
    };
    let formatted = match formatter
        .format_with_fallback(RespondWith::Default, &page, &FormatPolicy::default())
        .await
    {
        Ok(f) => f,
        Err(e) => {
            warn!(record = %record.id, "format failed: {e}");
            return None;
        }
    };
    Some(
        json!({
            "url": page.url,
            "html": page.snapshot.html,
            "content": formatted.content.unwrap_or_default(),
        })
        .to_string(),
    )
}

// =============================================================================
// Schedule
// =============================================================================

/// Seconds until the next 02:00 UTC
fn until_next_run(now: DateTime<Utc>) -> std::time::Duration {
    let today_run = now
        .date_naive()
        .and_hms_opt(2, 0, 0)
        .expect("02:00:00 is always valid")
        .and_utc();
    let next = if now < today_run {
        today_run
    } else {
        today_run + ChronoDuration::days(1)
    };
    (next - now).to_std().unwrap_or_default()
}

/// Run the cruncher nightly at 02:00 UTC with three retries per run and a
/// 60 s minimum backoff between attempts.
pub fn spawn_nightly(cruncher: Arc<Cruncher>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let wait = until_next_run(Utc::now());
            debug!(seconds = wait.as_secs(), "next crunch scheduled");
            tokio::time::sleep(wait).await;

            let mut backoff = std::time::Duration::from_secs(60);
            for attempt in 1..=3u32 {
                let run = tokio::time::timeout(
                    std::time::Duration::from_secs(30 * 60),
                    cruncher.crunch(Utc::now(), None),
                )
                .await
                .unwrap_or_else(|_| {
                    Err(crate::error::ReaderError::Internal(
                        "scheduled crunch timed out after 30 minutes".into(),
                    ))
                });
                match run {
                    Ok(report) => {
                        info!(files = report.files_uploaded, "nightly crunch done");
                        break;
                    }
                    Err(e) if attempt < 3 => {
                        warn!(attempt, "nightly crunch failed, retrying: {e}");
                        tokio::time::sleep(backoff).await;
                        backoff *= 2;
                    }
                    Err(e) => {
                        warn!("nightly crunch failed after {attempt} attempts: {e}");
                    }
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn first_offset_label_is_literal_zeros() {
        let day = NaiveDate::from_ymd_opt(2024, 3, 1).unwrap();
        assert_eq!(
            archive_object_name("crunched", 2, day, 0),
            "crunched/r2/2024-03-01-00000.jsonl"
        );
        assert_eq!(
            archive_object_name("crunched", 2, day, 10_000),
            "crunched/r2/2024-03-01-10000.jsonl"
        );
        assert_eq!(
            archive_object_name("crunched", 2, day, 20_000),
            "crunched/r2/2024-03-01-20000.jsonl"
        );
    }

    #[test]
    fn schedule_targets_0200_utc() {
        let before = Utc.with_ymd_and_hms(2024, 3, 1, 1, 0, 0).unwrap();
        assert_eq!(until_next_run(before).as_secs(), 3600);
        let after = Utc.with_ymd_and_hms(2024, 3, 1, 3, 0, 0).unwrap();
        assert_eq!(until_next_run(after).as_secs(), 23 * 3600);
    }
}
