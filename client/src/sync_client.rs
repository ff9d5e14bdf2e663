//! Sync Client - ships the offline queue and folds results back in.
//!
//! A flush runs in rounds. Each round takes the earliest queued operation of
//! every record, saves the batch's sent marks and releases the state lock
//! while the request is outstanding, so mutations made during the round trip
//! queue up behind the batch. Edits waiting behind an accepted operation are
//! rebased onto the version it produced and go out in the next round.
//!
//! The queue is only trimmed after a well-formed [`SyncResult`] arrives; a
//! timeout, an abort or any transport error leaves every entry in place with
//! `retry_count` bumped. A result that cannot be saved is still reported, but
//! the in-memory state goes back to what is on disk and the batch is resent.

use crate::{
    backoff::Backoff,
    context::SyncContext,
    error::{ClientError, Result, TransportError},
    events::SyncEvent,
    storage::DeviceStorage,
    transport::SyncTransport,
};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tally_engine::{
    now_millis, ConflictOutcome, DeviceSnapshot, LocalProjection, OfflineOperation,
    OperationQueue, RecordKey, RejectedOperation, SyncRequest, SyncResult, Timestamp,
};
use tokio::sync::{broadcast, watch, Mutex, MutexGuard};
use tokio::time::Instant;

/// Mutable device state, guarded by one lock.
#[derive(Debug)]
pub(crate) struct DeviceState {
    pub queue: OperationQueue,
    pub projection: LocalProjection,
    pub last_sync_timestamp: Timestamp,
    pub backoff: Backoff,
    /// When the next automatic retry is due after a failed flush
    pub retry_at: Option<Instant>,
}

impl DeviceState {
    pub fn snapshot(&self, device_id: &str) -> DeviceSnapshot {
        DeviceSnapshot::capture(
            device_id,
            self.last_sync_timestamp,
            &self.queue,
            &self.projection,
        )
    }
}

/// Outcome of a flush that reached the server.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FlushReport {
    pub accepted: usize,
    pub conflicts: Vec<ConflictOutcome>,
    pub rejected: Vec<RejectedOperation>,
    pub checkpoint: Timestamp,
}

impl FlushReport {
    fn absorb(&mut self, round: FlushReport) {
        self.accepted += round.accepted;
        self.conflicts.extend(round.conflicts);
        self.rejected.extend(round.rejected);
        self.checkpoint = self.checkpoint.max(round.checkpoint);
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FlushOutcome {
    Completed(FlushReport),
    /// Another flush holds the slot; nothing was sent
    AlreadyRunning,
}

#[derive(Clone)]
pub struct SyncClient {
    ctx: Arc<SyncContext>,
    transport: Arc<dyn SyncTransport>,
    storage: Arc<dyn DeviceStorage>,
    state: Arc<Mutex<DeviceState>>,
    events: broadcast::Sender<SyncEvent>,
    request_timeout: Duration,
}

impl SyncClient {
    pub(crate) fn new(
        ctx: Arc<SyncContext>,
        transport: Arc<dyn SyncTransport>,
        storage: Arc<dyn DeviceStorage>,
        state: Arc<Mutex<DeviceState>>,
        events: broadcast::Sender<SyncEvent>,
        request_timeout: Duration,
    ) -> Self {
        Self {
            ctx,
            transport,
            storage,
            state,
            events,
            request_timeout,
        }
    }

    pub(crate) async fn lock(&self) -> MutexGuard<'_, DeviceState> {
        self.state.lock().await
    }

    pub(crate) async fn persist(&self, state: &DeviceState) -> Result<()> {
        self.storage
            .save(&state.snapshot(self.ctx.device_id()))
            .await
            .map_err(ClientError::from)
    }

    pub(crate) fn emit(&self, event: SyncEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    /// When the next automatic retry is due, if one is scheduled.
    pub async fn retry_at(&self) -> Option<Instant> {
        self.lock().await.retry_at
    }

    /// Send every queued operation and apply the results.
    pub async fn flush(&self) -> Result<FlushOutcome> {
        let Some(_slot) = self.ctx.try_begin_flush() else {
            tracing::debug!(device_id = %self.ctx.device_id(), "flush already running");
            return Ok(FlushOutcome::AlreadyRunning);
        };

        let mut report = FlushReport::default();
        loop {
            let (round, more) = self.flush_round().await?;
            report.absorb(round);
            if !more {
                break;
            }
        }
        Ok(FlushOutcome::Completed(report))
    }

    /// One request. Returns the round's report and whether operations held
    /// back behind this round are ready to go.
    async fn flush_round(&self) -> Result<(FlushReport, bool)> {
        let (request, batch) = {
            let mut state = self.lock().await;
            let batch = state.queue.next_batch();
            let newly_sent = state
                .queue
                .mark_sent(batch.iter().map(|op| op.operation_id.as_str()));
            // The server may apply the batch even if no response comes back
            if newly_sent > 0 {
                if let Err(e) = self.persist(&state).await {
                    tracing::error!(
                        device_id = %self.ctx.device_id(),
                        error = %e,
                        "failed to persist sent marks, batch not sent"
                    );
                    return Err(e);
                }
            }
            let request = SyncRequest::new(
                self.ctx.device_id(),
                state.last_sync_timestamp,
                batch.iter().cloned(),
            );
            (request, batch)
        };

        tracing::debug!(
            device_id = %self.ctx.device_id(),
            operations = batch.len(),
            "flushing offline queue"
        );
        let response = self.send(&request).await;

        let mut guard = self.lock().await;
        let state = &mut *guard;
        let result = match response {
            Ok(result) => result,
            Err(error) => return Err(self.flush_failed(state, &batch, error).await),
        };

        let saved = (
            state.queue.clone(),
            state.projection.clone(),
            state.last_sync_timestamp,
        );
        let report = self.apply_result(state, result, &batch);
        let removed = saved.0.len() - state.queue.len();

        let persisted = self.persist(state).await;
        match &persisted {
            Ok(()) => {
                state.backoff.reset();
                state.retry_at = None;
            }
            Err(e) => {
                (state.queue, state.projection, state.last_sync_timestamp) = saved;
                let retry_in = state.backoff.fail();
                state.retry_at = Some(Instant::now() + retry_in);
                tracing::error!(
                    device_id = %self.ctx.device_id(),
                    error = %e,
                    retry_in_ms = retry_in.as_millis() as u64,
                    "failed to persist sync result, batch will be resent"
                );
            }
        }
        self.ctx.set_queue_count(state.queue.len());
        let more = removed > 0 && !state.queue.is_empty();
        drop(guard);

        self.emit_report(&report);
        persisted?;
        Ok((report, more))
    }

    fn emit_report(&self, report: &FlushReport) {
        for conflict in &report.conflicts {
            self.emit(SyncEvent::Conflict(conflict.clone()));
        }
        for rejected in &report.rejected {
            self.emit(SyncEvent::Rejected(rejected.clone()));
        }
        self.emit(SyncEvent::Synced {
            accepted: report.accepted,
            conflicts: report.conflicts.len(),
            rejected: report.rejected.len(),
            checkpoint: report.checkpoint,
        });
    }

    async fn flush_failed(
        &self,
        state: &mut DeviceState,
        batch: &[OfflineOperation],
        error: TransportError,
    ) -> ClientError {
        for op in batch {
            state.queue.increment_retry(&op.operation_id);
        }
        let retry_in = state.backoff.fail();
        state.retry_at = Some(Instant::now() + retry_in);

        tracing::warn!(
            device_id = %self.ctx.device_id(),
            operations = batch.len(),
            error = %error,
            retry_in_ms = retry_in.as_millis() as u64,
            "flush failed, batch stays queued"
        );
        if let Err(e) = self.persist(state).await {
            tracing::error!(error = %e, "failed to persist retry counts");
        }
        self.emit(SyncEvent::TransportFailed {
            error: error.to_string(),
            retry_in,
            queued: state.queue.len(),
        });
        error.into()
    }

    /// Refresh the projection with changes accepted since the checkpoint.
    ///
    /// Returns how many records were received.
    pub async fn pull(&self) -> Result<usize> {
        let since = self.lock().await.last_sync_timestamp;
        let response = self
            .bounded(self.transport.changes(since))
            .await?;

        let mut guard = self.lock().await;
        let state = &mut *guard;
        let saved = (state.projection.clone(), state.last_sync_timestamp);
        let received = response.changes.len();
        let touched = state.projection.apply_server(response.changes.into_records());
        state
            .projection
            .reapply(state.queue.peek_batch(), &touched, now_millis());
        state.last_sync_timestamp = state.last_sync_timestamp.max(response.current_timestamp);
        if let Err(e) = self.persist(state).await {
            (state.projection, state.last_sync_timestamp) = saved;
            return Err(e);
        }
        let checkpoint = state.last_sync_timestamp;
        drop(guard);

        tracing::debug!(device_id = %self.ctx.device_id(), received, checkpoint, "pulled changes");
        self.emit(SyncEvent::Pulled {
            records: received,
            checkpoint,
        });
        Ok(received)
    }

    /// Send a request, giving up on timeout or when connectivity drops.
    pub(crate) async fn send(&self, request: &SyncRequest) -> std::result::Result<SyncResult, TransportError> {
        self.bounded(self.transport.sync(request)).await
    }

    async fn bounded<T>(
        &self,
        call: impl std::future::Future<Output = std::result::Result<T, TransportError>>,
    ) -> std::result::Result<T, TransportError> {
        let connectivity = self.ctx.subscribe();
        tokio::select! {
            result = tokio::time::timeout(self.request_timeout, call) => {
                result.map_err(|_| TransportError::Timeout(self.request_timeout))?
            }
            _ = connection_lost(connectivity) => Err(TransportError::Aborted),
        }
    }

    /// Fold a well-formed result into queue and projection.
    ///
    /// `sent` holds the operations of the request, used to locate records of
    /// rejected operations and the base version of accepted ones.
    pub(crate) fn apply_result(
        &self,
        state: &mut DeviceState,
        result: SyncResult,
        sent: &[OfflineOperation],
    ) -> FlushReport {
        let now = now_millis();
        let removed = state.queue.ack(result.settled_ids());

        let SyncResult {
            accepted,
            conflicts,
            rejected,
            server_data,
            current_timestamp,
            ..
        } = result;

        let sent: HashMap<&str, &OfflineOperation> = sent
            .iter()
            .map(|op| (op.operation_id.as_str(), op))
            .collect();

        let mut touched = state.projection.apply_server(server_data.into_records());

        for a in &accepted {
            // Edits queued behind this one were built on the version it started from
            if let Some(op) = sent.get(a.operation_id.as_str()) {
                let base = op.expected_sync_version().unwrap_or(1);
                if base != a.sync_version {
                    state
                        .queue
                        .rebase(a.resource, &a.record_id, base, a.sync_version);
                }
            }
            // A record with edits still queued stays pending until the last one settles
            let key: RecordKey = (a.resource, a.record_id.clone());
            let queued_behind = state.queue.last_for(a.resource, &a.record_id).is_some();
            if !touched.contains(&key) && !queued_behind {
                state
                    .projection
                    .confirm(a.resource, &a.record_id, a.sync_version, self.ctx.device_id());
            }
        }

        for conflict in &conflicts {
            state.projection.overwrite(
                conflict.resource,
                &conflict.record_id,
                conflict.server_record.clone(),
            );
            touched.insert((conflict.resource, conflict.record_id.clone()));
        }

        for r in &rejected {
            if let Some(op) = sent.get(r.operation_id.as_str()) {
                state.projection.revert(op.resource(), &op.record_id);
                touched.insert(op.key());
            }
        }

        reapply_pending(state, &touched, now);
        state.last_sync_timestamp = state.last_sync_timestamp.max(current_timestamp);

        tracing::info!(
            device_id = %self.ctx.device_id(),
            removed,
            accepted = accepted.len(),
            conflicts = conflicts.len(),
            rejected = rejected.len(),
            checkpoint = state.last_sync_timestamp,
            "sync result applied"
        );

        FlushReport {
            accepted: accepted.len(),
            conflicts,
            rejected,
            checkpoint: state.last_sync_timestamp,
        }
    }
}

fn reapply_pending(state: &mut DeviceState, touched: &HashSet<RecordKey>, now: Timestamp) {
    let DeviceState {
        queue, projection, ..
    } = state;
    projection.reapply(queue.peek_batch(), touched, now);
}

/// Resolves once the device goes offline.
async fn connection_lost(mut rx: watch::Receiver<tally_engine::ConnectivityState>) {
    let lost = rx.wait_for(|state| !state.is_online()).await.is_ok();
    if !lost {
        std::future::pending::<()>().await;
    }
}
