//! Overflow Manager
//!
//! Owns the overflow log for its whole lifecycle:
//!
//! - **divert**: a batch that failed to commit is appended as a new chunk
//! - **retry**: chunks are replayed in order through the batch processor;
//!   the first chunk that still fails stops the pass, and it plus
//!   everything after it ends up in the canonical log (replacing it when
//!   the pass read the canonical log, appended otherwise)
//! - **alert**: the first unresolved failure of an outage notifies the
//!   configured recipient; nothing more is sent until a pass drains the log
//!
//! Every operation holds one async mutex over the canonical log, so diverts
//! and retry passes never interleave.

use std::fs;
use std::path::{Path, PathBuf};
use std::slice;
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use super::codec::{encode_chunks, parse_chunks, OverflowChunk};
use super::log::{OverflowLog, OverflowResult, WriteMode};
use crate::config::QueueConfig;
use crate::notify::{AlertGate, Notifier};
use crate::processor::BatchProcessor;
use crate::store::StoreError;
use crate::types::AccessEvent;

/// Where a recovery pass reads chunks from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecoverySource {
    /// The configured overflow log
    Canonical,
    /// Any overflow log file. An unresolved remainder is moved into the
    /// canonical log, and the file is removed once its chunks are either
    /// committed or moved.
    File(PathBuf),
    /// Chunk text handed in by an operator. An unresolved remainder is
    /// appended to the canonical log.
    Text(String),
}

/// What a recovery pass did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    pub chunks_found: usize,
    pub chunks_processed: usize,
    pub events_processed: usize,
    /// This pass sent the outage alert
    pub alert_sent: bool,
    /// The unresolved remainder could not be written back and was dumped
    /// to the operational log instead
    pub remainder_dumped: bool,
}

impl RecoveryReport {
    /// Every chunk was committed (vacuously true for an empty source)
    pub fn is_success(&self) -> bool {
        self.chunks_processed == self.chunks_found && !self.remainder_dumped
    }

    pub fn chunks_remaining(&self) -> usize {
        self.chunks_found - self.chunks_processed
    }
}

/// Where the unresolved remainder of a pass goes
enum Remainder {
    ReplaceCanonical,
    MoveToCanonical(OverflowLog),
    AppendCanonical,
}

/// The overflow manager
pub struct RecoveryManager {
    processor: BatchProcessor,
    notifier: Arc<dyn Notifier>,
    gate: AlertGate,
    log: Mutex<OverflowLog>,
    alert_recipient: String,
    alert_subject: String,
}

impl RecoveryManager {
    pub fn new(
        processor: BatchProcessor,
        notifier: Arc<dyn Notifier>,
        config: &QueueConfig,
    ) -> Self {
        let log = OverflowLog::canonical(&config.overflow_path);
        Self::with_log(processor, notifier, log, config)
    }

    /// Use `log` as the canonical overflow log instead of the configured path
    pub fn with_log(
        processor: BatchProcessor,
        notifier: Arc<dyn Notifier>,
        log: OverflowLog,
        config: &QueueConfig,
    ) -> Self {
        Self {
            processor,
            notifier,
            gate: AlertGate::new(),
            log: Mutex::new(log),
            alert_recipient: config.alert_recipient.clone(),
            alert_subject: config.alert_subject.clone(),
        }
    }

    /// The alert-sent flag
    pub fn gate(&self) -> &AlertGate {
        &self.gate
    }

    /// Canonical log location, resolving it if needed
    pub async fn overflow_path(&self) -> OverflowResult<PathBuf> {
        self.log.lock().await.resolve()
    }

    /// Persist a batch that failed with `cause` as a new chunk.
    ///
    /// If the log cannot be written, the chunk goes to the operational log
    /// stream, an alert is raised (once per outage) and the error returned.
    pub async fn divert(&self, cause: &StoreError, batch: Vec<AccessEvent>) -> OverflowResult<()> {
        let chunk = OverflowChunk::from_failure(cause, batch);
        let mut log = self.log.lock().await;

        match log.write_chunks(slice::from_ref(&chunk), WriteMode::Append) {
            Ok(()) => {
                warn!(
                    path = ?log.path(),
                    events = chunk.len(),
                    cause = %cause,
                    "Batch diverted to overflow log"
                );
                Ok(())
            }
            Err(e) => {
                error!(
                    error = %e,
                    chunk = %chunk,
                    "Unable to write overflow log; batch content follows"
                );
                self.alert_once(
                    "overflow log not writable",
                    &format!(
                        "A failed batch could not be written to the overflow log at {}.\n\
                         The error message is: {}\n\
                         The batch was written to the operational log.",
                        log.configured_path().display(),
                        e
                    ),
                );
                Err(e)
            }
        }
    }

    /// Retry the canonical overflow log
    pub async fn retry_canonical(&self) -> OverflowResult<RecoveryReport> {
        self.retry(RecoverySource::Canonical).await
    }

    /// Run one recovery pass over `source`.
    ///
    /// A missing or empty source counts as a full success. A source that
    /// cannot be read or parsed is left untouched and the error returned.
    pub async fn retry(&self, source: RecoverySource) -> OverflowResult<RecoveryReport> {
        let mut canonical = self.log.lock().await;

        let (content, remainder) = match source {
            RecoverySource::Canonical => (canonical.read(), Remainder::ReplaceCanonical),
            RecoverySource::File(path) if is_canonical_path(&mut canonical, &path) => {
                (canonical.read(), Remainder::ReplaceCanonical)
            }
            RecoverySource::File(path) => {
                let mut file = OverflowLog::at(path);
                (file.read(), Remainder::MoveToCanonical(file))
            }
            RecoverySource::Text(text) => (Ok(Some(text)), Remainder::AppendCanonical),
        };

        let content = match content {
            Ok(Some(content)) => content,
            Ok(None) => {
                self.gate.clear();
                return Ok(RecoveryReport::default());
            }
            Err(e) => {
                error!(error = %e, "Unable to read overflow log");
                self.alert_once(
                    "overflow log problem",
                    &format!("There was a problem reading the overflow log.\n{}", e),
                );
                return Err(e);
            }
        };

        let chunks = match parse_chunks(&content) {
            Ok(chunks) => chunks,
            Err(e) => {
                error!(error = %e, "Overflow log is malformed; leaving it untouched");
                self.alert_once(
                    "overflow log problem",
                    &format!("There was a problem parsing the overflow log.\n{}", e),
                );
                return Err(e.into());
            }
        };

        let mut report = RecoveryReport {
            chunks_found: chunks.len(),
            ..Default::default()
        };

        for (index, chunk) in chunks.iter().enumerate() {
            debug!(chunk = index, events = chunk.len(), "Retrying overflow chunk");
            match self.processor.process(&chunk.events).await {
                Ok(batch) => {
                    report.chunks_processed += 1;
                    report.events_processed += batch.events;
                }
                Err(e) => {
                    warn!(
                        chunk = index,
                        remaining = chunks.len() - index,
                        error = %e,
                        "Overflow chunk still failing"
                    );
                    report.alert_sent = self.alert_once(
                        "overflow retry failed",
                        &format!(
                            "There was an error processing the overflow log.\n\
                             The error message is: {}\n\
                             The failing chunk is as follows:\n{}",
                            e, chunk
                        ),
                    );
                    let unresolved = &chunks[index..];
                    if let Err(e) = Self::write_back(&mut canonical, remainder, unresolved) {
                        error!(
                            error = %e,
                            chunks = %encode_chunks(unresolved),
                            "Unable to write back unresolved overflow chunks; content follows"
                        );
                        report.remainder_dumped = true;
                    }
                    return Ok(report);
                }
            }
        }

        match remainder {
            Remainder::ReplaceCanonical => canonical.clear()?,
            Remainder::MoveToCanonical(mut file) => file.clear()?,
            Remainder::AppendCanonical => {}
        }
        self.gate.clear();
        if report.chunks_found > 0 {
            info!(
                chunks = report.chunks_found,
                events = report.events_processed,
                "Overflow log drained"
            );
        }
        Ok(report)
    }

    fn write_back(
        canonical: &mut OverflowLog,
        remainder: Remainder,
        unresolved: &[OverflowChunk],
    ) -> OverflowResult<()> {
        match remainder {
            Remainder::ReplaceCanonical => canonical.write_chunks(unresolved, WriteMode::Replace),
            Remainder::MoveToCanonical(mut file) => {
                canonical.write_chunks(unresolved, WriteMode::Append)?;
                if let Err(e) = file.clear() {
                    warn!(
                        path = %file.configured_path().display(),
                        error = %e,
                        "Moved unresolved chunks but could not remove the source file"
                    );
                }
                Ok(())
            }
            Remainder::AppendCanonical => canonical.write_chunks(unresolved, WriteMode::Append),
        }
    }

    /// Send an alert unless one already went out this outage
    fn alert_once(&self, what: &str, body: &str) -> bool {
        if !self.gate.try_claim() {
            debug!(what, "Alert already sent for this outage");
            return false;
        }
        let subject = format!("{} {}", self.alert_subject, what);
        self.notifier.send_alert(&self.alert_recipient, &subject, body);
        true
    }
}

/// Whether `path` names the canonical log, so a file pass over it does not
/// append the log to itself
fn is_canonical_path(canonical: &mut OverflowLog, path: &Path) -> bool {
    let Ok(resolved) = canonical.resolve() else {
        return false;
    };
    match (fs::canonicalize(&resolved), fs::canonicalize(path)) {
        (Ok(a), Ok(b)) => a == b,
        _ => resolved == path,
    }
}
