use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use tabwriter::TabWriter;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{error, info, warn};

use crate::connections::{Connection, ConnectionStatus};
use crate::core::{Candidate, TransactionEntry};
use crate::dedup;
use crate::error::SyncError;
use crate::extract::Extractor;
use crate::normalize::Normalizer;
use crate::settings::SyncOpts;
use crate::store::SqliteStore;
use crate::upstream::{MailSource, TransactionSource};

/// Source identifier under which mailbox receipts are persisted.
pub const MAILBOX_SOURCE_ID: &str = "mailbox";

#[derive(Debug, Default, Clone)]
pub struct RunOpts {
    /// Restrict the run to one connection by local id.
    pub connection: Option<String>,
    pub include_mailbox: bool,
    /// Resume point from an earlier interrupted run.
    pub cursor: Option<String>,
}

/// Per-source result of one sync run. An interrupted fetch carries a
/// `Partial` error with the cursor to resume from; everything fetched before
/// the interruption is still committed.
#[derive(Debug)]
pub struct SourceOutcome {
    pub source_id: String,
    pub fetched: usize,
    pub new: usize,
    pub duplicates: usize,
    pub skipped: usize,
    pub failed: usize,
    pub error: Option<SyncError>,
}

impl SourceOutcome {
    fn empty(source_id: String) -> Self {
        SourceOutcome {
            source_id,
            fetched: 0,
            new: 0,
            duplicates: 0,
            skipped: 0,
            failed: 0,
            error: None,
        }
    }

    pub fn resume_cursor(&self) -> Option<&str> {
        self.error.as_ref().and_then(|e| e.resume_cursor())
    }
}

#[derive(Debug)]
pub struct SyncReport {
    pub sources: Vec<SourceOutcome>,
}

/// Drives a full sync: pages transactions out of every active connection
/// through a bounded worker pool, runs mailbox extraction when configured,
/// normalizes and deduplicates the candidates, and commits each source's
/// survivors as one batch. Cancellation and the session deadline are checked
/// between pages, never mid-request.
pub struct SyncOrchestrator {
    store: Arc<SqliteStore>,
    bank: Arc<dyn TransactionSource + Send + Sync>,
    mailbox: Option<Arc<dyn MailSource + Send + Sync>>,
    extractor: Extractor,
    normalizer: Normalizer,
    opts: SyncOpts,
}

impl SyncOrchestrator {
    pub fn new(
        store: Arc<SqliteStore>,
        bank: Arc<dyn TransactionSource + Send + Sync>,
        extractor: Extractor,
        normalizer: Normalizer,
        opts: SyncOpts,
    ) -> Self {
        SyncOrchestrator {
            store,
            bank,
            mailbox: None,
            extractor,
            normalizer,
            opts,
        }
    }

    pub fn with_mailbox(mut self, mailbox: Arc<dyn MailSource + Send + Sync>) -> Self {
        self.mailbox = Some(mailbox);
        self
    }

    pub async fn run(
        self: &Arc<Self>,
        run: RunOpts,
        cancel: watch::Receiver<bool>,
    ) -> Result<SyncReport, SyncError> {
        let deadline = Instant::now() + Duration::from_secs(self.opts.session_timeout_secs);
        let mut sources = Vec::new();

        let targets: Vec<Connection> = self
            .store
            .connections()
            .list()
            .await?
            .into_iter()
            .filter(|c| matches!(c.status, ConnectionStatus::Active))
            .filter(|c| run.connection.as_deref().map_or(true, |id| id == c.id))
            .collect();
        // A resume cursor only makes sense when the run targets one source.
        let connection_cursor = run.connection.as_ref().and(run.cursor.clone());

        let workers = Arc::new(Semaphore::new(self.opts.workers));
        let mut pool = JoinSet::new();
        for connection in targets {
            let this = Arc::clone(self);
            let workers = Arc::clone(&workers);
            let cancel = cancel.clone();
            let cursor = connection_cursor.clone();
            pool.spawn(async move {
                let _slot = workers.acquire_owned().await.expect("worker pool open");
                this.sync_connection(&connection, cursor, &cancel, deadline)
                    .await
            });
        }
        while let Some(joined) = pool.join_next().await {
            match joined {
                Ok(outcome) => sources.push(outcome),
                Err(e) => error!(error = %e, "sync worker panicked"),
            }
        }

        if run.include_mailbox {
            match &self.mailbox {
                Some(mailbox) => {
                    let cursor = if run.connection.is_none() {
                        run.cursor.clone()
                    } else {
                        None
                    };
                    sources.push(
                        self.sync_mailbox(Arc::clone(mailbox), cursor, &cancel, deadline)
                            .await,
                    );
                }
                None => warn!("mailbox sync requested but no mailbox is configured"),
            }
        }

        Ok(SyncReport { sources })
    }

    #[tracing::instrument(skip_all, fields(connection = %connection.id))]
    async fn sync_connection(
        &self,
        connection: &Connection,
        start_cursor: Option<String>,
        cancel: &watch::Receiver<bool>,
        deadline: Instant,
    ) -> SourceOutcome {
        let mut outcome = SourceOutcome::empty(connection.id.clone());
        let mut cursor = start_cursor;
        let mut raw = Vec::new();

        loop {
            if let Some(reason) = halt_reason(cancel, deadline) {
                warn!(connection = %connection.id, %reason, "sync halted between pages");
                outcome.error = Some(SyncError::Partial {
                    cursor: cursor.clone(),
                    fetched: raw.len(),
                    reason,
                });
                break;
            }

            match self
                .bank
                .page(&connection.external_id, cursor.as_deref(), self.opts.page_limit)
                .await
            {
                Ok(page) => {
                    raw.extend(page.transactions);
                    match page.next_cursor {
                        Some(next) => cursor = Some(next),
                        None => break,
                    }
                }
                Err(e) => {
                    warn!(connection = %connection.id, error = %e, "page fetch failed, keeping fetched records");
                    outcome.error = Some(SyncError::Partial {
                        cursor: cursor.clone(),
                        fetched: raw.len(),
                        reason: e.to_string(),
                    });
                    break;
                }
            }
        }
        outcome.fetched = raw.len();

        let mut entries = Vec::with_capacity(raw.len());
        for tx in raw {
            let candidate = Candidate::Bank(tx);
            match self.normalizer.build(&candidate) {
                Ok(entry) => entries.push(entry),
                Err(e) => {
                    warn!(connection = %connection.id, error = %e, "candidate dropped");
                    outcome.failed += 1;
                }
            }
        }

        self.commit(&connection.id, entries, &mut outcome).await;
        info!(
            connection = %connection.id,
            fetched = outcome.fetched,
            new = outcome.new,
            duplicates = outcome.duplicates,
            "connection sync finished"
        );

        outcome
    }

    #[tracing::instrument(skip_all)]
    async fn sync_mailbox(
        &self,
        mailbox: Arc<dyn MailSource + Send + Sync>,
        start_cursor: Option<String>,
        cancel: &watch::Receiver<bool>,
        deadline: Instant,
    ) -> SourceOutcome {
        let mut outcome = SourceOutcome::empty(MAILBOX_SOURCE_ID.to_string());
        let mut cursor = start_cursor;
        let mut emails = Vec::new();

        loop {
            if let Some(reason) = halt_reason(cancel, deadline) {
                warn!(%reason, "mailbox sync halted between pages");
                outcome.error = Some(SyncError::Partial {
                    cursor: cursor.clone(),
                    fetched: emails.len(),
                    reason,
                });
                break;
            }

            match mailbox.page(cursor.as_deref(), self.opts.page_limit).await {
                Ok(page) => {
                    emails.extend(page.emails);
                    match page.next_cursor {
                        Some(next) => cursor = Some(next),
                        None => break,
                    }
                }
                Err(e) => {
                    warn!(error = %e, "mailbox page fetch failed, keeping fetched records");
                    outcome.error = Some(SyncError::Partial {
                        cursor: cursor.clone(),
                        fetched: emails.len(),
                        reason: e.to_string(),
                    });
                    break;
                }
            }
        }
        outcome.fetched = emails.len();

        let mut entries = Vec::new();
        for email in &emails {
            let Some(extracted) = self.extractor.extract(email) else {
                // Not a receipt. Newsletters and the like land here.
                outcome.skipped += 1;
                continue;
            };

            let candidate = Candidate::Email(extracted);
            match self.normalizer.build(&candidate) {
                Ok(entry) => entries.push(entry),
                Err(e) => {
                    warn!(email = %email.id, error = %e, "candidate dropped");
                    outcome.failed += 1;
                }
            }
        }

        self.commit(MAILBOX_SOURCE_ID, entries, &mut outcome).await;
        info!(
            fetched = outcome.fetched,
            new = outcome.new,
            skipped = outcome.skipped,
            "mailbox sync finished"
        );

        outcome
    }

    /// Deduplicates against the store and commits the survivors as a single
    /// batch. A rejected batch leaves the store untouched and carries the
    /// store's explanation back on the outcome.
    async fn commit(
        &self,
        source_id: &str,
        entries: Vec<TransactionEntry>,
        outcome: &mut SourceOutcome,
    ) {
        let filtered = match dedup::filter_new(&self.store, source_id, entries).await {
            Ok(filtered) => filtered,
            Err(e) => {
                error!(source = source_id, error = %e, "duplicate filter failed");
                outcome.error = Some(e.into());
                return;
            }
        };
        outcome.duplicates = filtered.duplicates;

        if filtered.new.is_empty() {
            return;
        }
        match self.store.save_batch(source_id, &filtered.new).await {
            Ok(()) => outcome.new = filtered.new.len(),
            Err(e) => {
                error!(source = source_id, error = %e, "batch rejected, nothing committed");
                outcome.error = Some(e.into());
            }
        }
    }
}

fn halt_reason(cancel: &watch::Receiver<bool>, deadline: Instant) -> Option<String> {
    if *cancel.borrow() {
        return Some("cancelled".to_string());
    }
    if Instant::now() >= deadline {
        return Some("session timeout elapsed".to_string());
    }

    None
}

pub fn display_report_table(report: &SyncReport) -> anyhow::Result<String> {
    let mut tw = TabWriter::new(vec![]);
    writeln!(tw, "Source\tFetched\tNew\tDuplicates\tSkipped\tFailed\tNote")?;

    for outcome in &report.sources {
        let note = match &outcome.error {
            Some(error) => error.to_string(),
            None => "ok".to_string(),
        };
        writeln!(
            tw,
            "{}\t{}\t{}\t{}\t{}\t{}\t{}",
            outcome.source_id,
            outcome.fetched,
            outcome.new,
            outcome.duplicates,
            outcome.skipped,
            outcome.failed,
            note
        )?;
    }

    Ok(String::from_utf8(tw.into_inner()?)?)
}
