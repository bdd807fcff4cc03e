use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use backloggr_core::{ApiError, BackloggrClient, GameStatus, NewLibraryEntry};
use futures_util::future::join_all;
use reqwest::StatusCode;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::{Mutex, mpsc};

use super::backoff::Backoff;
use super::queue::EntityLanes;
use crate::connectivity::Connectivity;
use crate::store::{
    LibraryEntry, LocalStore, OperationKind, PendingOperation, RemapOutcome, StoreError, now_unix,
};

pub const DEFAULT_MAX_ATTEMPTS: u32 = 8;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

/// Outcome of one sync pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub dispatched: usize,
    pub succeeded: usize,
    /// Transient failures rescheduled with backoff.
    pub failed: usize,
    pub dead_lettered: usize,
    /// Operations left in place behind a failed or unsynced predecessor.
    pub deferred: usize,
    pub skipped_offline: bool,
    pub auth_required: bool,
}

impl SyncReport {
    fn offline() -> Self {
        Self {
            skipped_offline: true,
            ..Self::default()
        }
    }

    fn merge(&mut self, other: &SyncReport) {
        self.dispatched += other.dispatched;
        self.succeeded += other.succeeded;
        self.failed += other.failed;
        self.dead_lettered += other.dead_lettered;
        self.deferred += other.deferred;
        self.auth_required |= other.auth_required;
    }

    pub fn is_clean(&self) -> bool {
        self.failed == 0 && self.dead_lettered == 0 && !self.auth_required
    }
}

#[derive(Debug, Error)]
enum OpFailure {
    #[error(transparent)]
    Api(#[from] ApiError),
    #[error("malformed payload: {0}")]
    Payload(String),
}

enum Applied {
    Done,
    Remapped(i64),
    /// The entry was dropped locally together with the rest of its queue.
    Discarded,
    /// Waiting on an ADD that has not reached the server.
    Blocked,
}

pub struct SyncEngine<C> {
    client: BackloggrClient,
    store: Arc<LocalStore>,
    connectivity: Arc<C>,
    backoff: Backoff,
    max_attempts: u32,
    reports: Option<mpsc::UnboundedSender<SyncReport>>,
    pass_lock: Mutex<()>,
}

impl<C: Connectivity> SyncEngine<C> {
    pub fn new(client: BackloggrClient, store: Arc<LocalStore>, connectivity: Arc<C>) -> Self {
        Self {
            client,
            store,
            connectivity,
            backoff: Backoff::default(),
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            reports: None,
            pass_lock: Mutex::new(()),
        }
    }

    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    /// Every finished pass, offline no-ops included, is also sent here.
    pub fn with_reports(mut self, reports: mpsc::UnboundedSender<SyncReport>) -> Self {
        self.reports = Some(reports);
        self
    }

    pub fn client(&self) -> &BackloggrClient {
        &self.client
    }

    pub fn store(&self) -> &Arc<LocalStore> {
        &self.store
    }

    pub async fn is_online(&self) -> bool {
        self.connectivity.is_online().await
    }

    /// Drains every pending operation whose retry window has elapsed.
    pub async fn sync_pending(&self) -> Result<SyncReport, EngineError> {
        let _pass = self.pass_lock.lock().await;
        let report = if self.connectivity.is_online().await {
            let operations = self.store.list_ready_operations(now_unix()).await?;
            self.run_pass(operations).await?
        } else {
            tracing::debug!("offline, sync pass skipped");
            SyncReport::offline()
        };
        self.publish(&report);
        Ok(report)
    }

    /// Drains the queue of a single library entry.
    pub async fn flush_entry(&self, library_id: i64) -> Result<SyncReport, EngineError> {
        let _pass = self.pass_lock.lock().await;
        let report = if self.connectivity.is_online().await {
            let now = now_unix();
            let operations = self
                .store
                .list_pending_for_entry(library_id)
                .await?
                .into_iter()
                .filter(|op| op.retry_at.is_none_or(|at| at <= now))
                .collect();
            self.run_pass(operations).await?
        } else {
            SyncReport::offline()
        };
        self.publish(&report);
        Ok(report)
    }

    fn publish(&self, report: &SyncReport) {
        if let Some(reports) = &self.reports {
            let _ = reports.send(report.clone());
        }
    }

    async fn run_pass(&self, operations: Vec<PendingOperation>) -> Result<SyncReport, EngineError> {
        let lanes = EntityLanes::from_operations(operations);
        if lanes.is_empty() {
            return Ok(SyncReport::default());
        }
        tracing::info!(lanes = lanes.len(), "sync pass started");

        let halted = AtomicBool::new(false);
        let results = join_all(
            lanes
                .into_lanes()
                .into_iter()
                .map(|lane| self.run_lane(lane, &halted)),
        )
        .await;

        let mut report = SyncReport::default();
        let mut first_error = None;
        for result in results {
            match result {
                Ok(lane_report) => report.merge(&lane_report),
                Err(err) => {
                    tracing::error!("sync lane aborted: {err}");
                    first_error.get_or_insert(err);
                }
            }
        }
        if let Some(err) = first_error {
            return Err(err);
        }
        tracing::info!(
            dispatched = report.dispatched,
            succeeded = report.succeeded,
            failed = report.failed,
            dead_lettered = report.dead_lettered,
            deferred = report.deferred,
            auth_required = report.auth_required,
            "sync pass finished"
        );
        Ok(report)
    }

    /// Runs one entry's operations in order, stopping at the first one that
    /// does not complete.
    async fn run_lane(
        &self,
        mut lane: VecDeque<PendingOperation>,
        halted: &AtomicBool,
    ) -> Result<SyncReport, EngineError> {
        let mut report = SyncReport::default();
        let mut remapped: Option<i64> = None;

        while let Some(op) = lane.pop_front() {
            if halted.load(Ordering::SeqCst) {
                report.deferred += 1 + lane.len();
                break;
            }
            let mut target = remapped.unwrap_or(op.library_id);
            if target < 0
                && op.kind != OperationKind::Add
                && let Some(server_id) = self.store.remapped_id(target).await?
            {
                let moved = self.store.retarget_operations(target, server_id).await?;
                tracing::debug!(
                    temp_id = target,
                    library_id = server_id,
                    moved,
                    "followed remapped id"
                );
                remapped = Some(server_id);
                target = server_id;
            }
            report.dispatched += 1;
            tracing::debug!(
                op_id = op.id,
                library_id = target,
                kind = op.kind.as_str(),
                attempt = op.attempt,
                "dispatching operation"
            );

            match self.apply(&op, target).await? {
                Ok(Applied::Done) => report.succeeded += 1,
                Ok(Applied::Remapped(server_id)) => {
                    report.succeeded += 1;
                    remapped = Some(server_id);
                }
                Ok(Applied::Discarded) => {
                    report.succeeded += 1;
                    break;
                }
                Ok(Applied::Blocked) => {
                    report.dispatched -= 1;
                    if self.settle_blocked(&op, target).await? {
                        report.dead_lettered += 1;
                        continue;
                    }
                    report.deferred += 1 + lane.len();
                    break;
                }
                Err(failure) => {
                    let dead = self
                        .handle_failure(&op, target, failure, halted, &mut report)
                        .await?;
                    // Work behind a dead ADD is settled against it right away.
                    if dead && op.kind == OperationKind::Add {
                        continue;
                    }
                    report.deferred += lane.len();
                    break;
                }
            }
        }
        Ok(report)
    }

    async fn apply(
        &self,
        op: &PendingOperation,
        target: i64,
    ) -> Result<Result<Applied, OpFailure>, EngineError> {
        match op.kind {
            OperationKind::Add => self.apply_add(op, target).await,
            OperationKind::Update => {
                if target < 0 {
                    return Ok(Ok(Applied::Blocked));
                }
                if let Err(err) = self.client.patch_library_entry(target, &op.payload).await {
                    return Ok(Err(err.into()));
                }
                self.store.delete_operation(op.id).await?;
                Ok(Ok(Applied::Done))
            }
            OperationKind::Delete => {
                if target < 0 {
                    // The server never saw this entry.
                    self.store.delete_entry(target).await?;
                    self.store.delete_operations_for_entry(target).await?;
                    return Ok(Ok(Applied::Discarded));
                }
                match self.client.delete_library_entry(target).await {
                    Ok(()) => {}
                    Err(err) if err.status() == Some(StatusCode::NOT_FOUND) => {
                        tracing::debug!(op_id = op.id, library_id = target, "entry already gone");
                    }
                    Err(err) => return Ok(Err(err.into())),
                }
                self.store.delete_operation(op.id).await?;
                Ok(Ok(Applied::Done))
            }
        }
    }

    async fn apply_add(
        &self,
        op: &PendingOperation,
        target: i64,
    ) -> Result<Result<Applied, OpFailure>, EngineError> {
        let new_entry = match parse_add_payload(&op.payload) {
            Ok(new_entry) => new_entry,
            Err(failure) => return Ok(Err(failure)),
        };
        let local_id = op
            .payload
            .get("local_library_id")
            .and_then(Value::as_i64)
            .unwrap_or(target);

        let remote = match self.client.add_library_entry(&new_entry).await {
            Ok(remote) => remote,
            Err(err) => return Ok(Err(err.into())),
        };
        let server_id = remote.id;

        let outcome = self
            .store
            .complete_add(op.id, local_id, LibraryEntry::from_remote(remote))
            .await?;
        tracing::info!(
            op_id = op.id,
            library_id = server_id,
            temp_id = local_id,
            "entry created on server"
        );

        if outcome == RemapOutcome::Missing {
            // Removed locally while the ADD was in flight.
            let empty = Value::Object(Default::default());
            self.store
                .enqueue_operation(server_id, OperationKind::Delete, &empty)
                .await?;
        }
        Ok(Ok(Applied::Remapped(server_id)))
    }

    /// Decides the fate of an operation stuck on a temporary id. Returns
    /// true when it was dead-lettered because its ADD can no longer land.
    async fn settle_blocked(
        &self,
        op: &PendingOperation,
        target: i64,
    ) -> Result<bool, EngineError> {
        let reason = match self.store.find_add_operation(target).await? {
            Some(add) if !add.dead => return Ok(false),
            Some(add) => format!("waiting on dead-lettered ADD {}", add.id),
            None => "no ADD queued for unsynced entry".to_string(),
        };
        self.store.dead_letter_operation(op.id, &reason).await?;
        tracing::error!(
            op_id = op.id,
            library_id = target,
            kind = op.kind.as_str(),
            "operation dead-lettered: {reason}"
        );
        Ok(true)
    }

    async fn handle_failure(
        &self,
        op: &PendingOperation,
        target: i64,
        failure: OpFailure,
        halted: &AtomicBool,
        report: &mut SyncReport,
    ) -> Result<bool, EngineError> {
        let message = failure.to_string();
        match &failure {
            OpFailure::Api(err) if err.is_auth() => {
                halted.store(true, Ordering::SeqCst);
                report.auth_required = true;
                tracing::warn!(
                    op_id = op.id,
                    library_id = target,
                    kind = op.kind.as_str(),
                    "server rejected credentials, sync halted: {message}"
                );
            }
            OpFailure::Api(err) if err.is_retryable() => {
                let attempt = op.attempt.saturating_add(1);
                if attempt >= self.max_attempts {
                    self.store.dead_letter_operation(op.id, &message).await?;
                    report.dead_lettered += 1;
                    tracing::error!(
                        op_id = op.id,
                        library_id = target,
                        kind = op.kind.as_str(),
                        attempt,
                        "operation dead-lettered after retries: {message}"
                    );
                    return Ok(true);
                }
                let now = now_unix();
                let retry_at = err
                    .retry_after_secs()
                    .map(|secs| now.saturating_add(secs.min(i64::MAX as u64) as i64))
                    .unwrap_or_else(|| self.backoff.retry_at(op.attempt, now));
                self.store
                    .record_operation_failure(op.id, retry_at, &message)
                    .await?;
                report.failed += 1;
                tracing::warn!(
                    op_id = op.id,
                    library_id = target,
                    kind = op.kind.as_str(),
                    attempt,
                    retry_at,
                    "operation rescheduled: {message}"
                );
            }
            _ => {
                self.store.dead_letter_operation(op.id, &message).await?;
                report.dead_lettered += 1;
                tracing::error!(
                    op_id = op.id,
                    library_id = target,
                    kind = op.kind.as_str(),
                    "operation rejected, dead-lettered: {message}"
                );
                return Ok(true);
            }
        }
        Ok(false)
    }
}

fn parse_add_payload(payload: &Value) -> Result<NewLibraryEntry, OpFailure> {
    let igdb_game_id = payload
        .get("igdb_game_id")
        .and_then(Value::as_i64)
        .ok_or_else(|| OpFailure::Payload("missing igdb_game_id".into()))?;
    let status = payload
        .get("status")
        .and_then(Value::as_str)
        .and_then(GameStatus::parse)
        .ok_or_else(|| OpFailure::Payload("missing or unknown status".into()))?;
    Ok(NewLibraryEntry {
        igdb_game_id,
        status,
    })
}

#[cfg(test)]
#[path = "engine_tests.rs"]
mod tests;
