//! Device - the entry point a host application talks to.
//!
//! Routes every mutation by connectivity: while offline it is queued and
//! applied optimistically; while online (including during the reconnection
//! flush) it goes straight to the server as a one-operation sync and is never
//! queued.

use crate::{
    backoff::Backoff,
    config::ClientConfig,
    context::SyncContext,
    error::{ClientError, Result},
    events::SyncEvent,
    storage::{DeviceStorage, FileStorage},
    sync_client::{DeviceState, FlushOutcome, SyncClient},
    transport::{HttpTransport, SyncTransport},
};
use std::sync::Arc;
use std::time::Duration;
use tally_engine::{
    now_millis, AcceptedOperation, CachedRecord, ConflictOutcome, ConnectivityEvent, DeviceSnapshot,
    Error, Mutation, OfflineOperation, OperationId, OperationQueue, Record, RecordBody, RecordId,
    RecordPatch, RejectedOperation, Resource, SyncRequest, Timestamp, Transition,
};
use tokio::sync::{broadcast, mpsc, Mutex};

const EVENT_CAPACITY: usize = 256;

/// Tuning knobs for a device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceOptions {
    pub request_timeout: Duration,
    pub pull_interval: Duration,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
}

impl Default for DeviceOptions {
    fn default() -> Self {
        ClientConfig::default().into()
    }
}

impl From<ClientConfig> for DeviceOptions {
    fn from(config: ClientConfig) -> Self {
        Self {
            request_timeout: config.request_timeout,
            pull_interval: config.pull_interval,
            backoff_base: config.backoff_base,
            backoff_max: config.backoff_max,
        }
    }
}

/// What happened to a mutation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MutationOutcome {
    /// Offline: queued (or folded into a queued entry) and applied locally
    Queued(OperationId),
    /// Offline: a queued, never-sent create was deleted; both are gone
    Cancelled,
    /// Online: the server accepted it
    Accepted(AcceptedOperation),
    /// Online: another device got there first; local state shows server truth
    Conflict(ConflictOutcome),
    /// Online: the server refused the operation as malformed
    Rejected(RejectedOperation),
}

pub struct Device {
    ctx: Arc<SyncContext>,
    client: SyncClient,
    events: broadcast::Sender<SyncEvent>,
    pull_interval: Duration,
}

impl Device {
    /// Open a device from its saved state, creating a new identity on first launch.
    pub async fn open(
        storage: Arc<dyn DeviceStorage>,
        transport: Arc<dyn SyncTransport>,
        options: DeviceOptions,
    ) -> Result<Self> {
        let snapshot = match storage.load().await? {
            Some(snapshot) => snapshot,
            None => {
                let snapshot = DeviceSnapshot::new(uuid::Uuid::new_v4().to_string());
                storage.save(&snapshot).await?;
                tracing::info!(device_id = %snapshot.device_id, "new device identity created");
                snapshot
            }
        };

        let ctx = Arc::new(SyncContext::new(snapshot.device_id.clone()));
        let last_sync_timestamp = snapshot.last_sync_timestamp;
        let (queue, projection) = snapshot.into_parts();
        ctx.set_queue_count(queue.len());
        tracing::info!(
            device_id = %ctx.device_id(),
            queued = queue.len(),
            records = projection.len(),
            "device opened"
        );

        let state = Arc::new(Mutex::new(DeviceState {
            queue,
            projection,
            last_sync_timestamp,
            backoff: Backoff::new(options.backoff_base, options.backoff_max),
            retry_at: None,
        }));
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let client = SyncClient::new(
            Arc::clone(&ctx),
            transport,
            storage,
            state,
            events.clone(),
            options.request_timeout,
        );

        Ok(Self {
            ctx,
            client,
            events,
            pull_interval: options.pull_interval,
        })
    }

    /// Open a device backed by a state file and the HTTP transport.
    pub async fn from_config(config: ClientConfig) -> Result<Self> {
        let storage = Arc::new(FileStorage::new(&config.data_dir));
        let transport = Arc::new(HttpTransport::new(
            config.server_url.clone(),
            config.auth_token.clone(),
            config.request_timeout,
        )?);
        Self::open(storage, transport, config.into()).await
    }

    pub fn context(&self) -> &Arc<SyncContext> {
        &self.ctx
    }

    pub fn device_id(&self) -> &str {
        self.ctx.device_id()
    }

    /// Operations waiting in the offline queue.
    pub fn queue_count(&self) -> usize {
        self.ctx.queue_count()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.events.subscribe()
    }

    pub fn sync_client(&self) -> &SyncClient {
        &self.client
    }

    // Reads

    pub async fn record(&self, resource: Resource, id: &str) -> Option<CachedRecord> {
        self.client.lock().await.projection.get(resource, id).cloned()
    }

    /// Active records of a resource, ordered by ID.
    pub async fn records(&self, resource: Resource) -> Vec<Record> {
        self.client
            .lock()
            .await
            .projection
            .active(resource)
            .cloned()
            .collect()
    }

    pub async fn queued(&self) -> Vec<OfflineOperation> {
        self.client.lock().await.queue.peek_batch().to_vec()
    }

    pub async fn last_sync_timestamp(&self) -> Timestamp {
        self.client.lock().await.last_sync_timestamp
    }

    // Mutations

    pub async fn create(&self, id: impl Into<RecordId>, body: RecordBody) -> Result<MutationOutcome> {
        self.mutate(id.into(), Mutation::Create(body)).await
    }

    /// Patch a record against the version currently held locally.
    pub async fn update(&self, id: &str, patch: RecordPatch) -> Result<MutationOutcome> {
        let expected_sync_version = self.base_version(patch.resource(), id).await?;
        self.mutate(
            id.to_string(),
            Mutation::Update {
                expected_sync_version,
                patch,
            },
        )
        .await
    }

    /// Soft-delete a record against the version currently held locally.
    pub async fn delete(&self, resource: Resource, id: &str) -> Result<MutationOutcome> {
        let expected_sync_version = self.base_version(resource, id).await?;
        self.mutate(
            id.to_string(),
            Mutation::Delete {
                resource,
                expected_sync_version,
            },
        )
        .await
    }

    /// The version an edit is based on. A create the server has not yet
    /// confirmed will land at version 1.
    async fn base_version(&self, resource: Resource, id: &str) -> Result<u64> {
        let state = self.client.lock().await;
        let cached = state
            .projection
            .get(resource, id)
            .ok_or_else(|| Error::RecordNotFound {
                resource,
                id: id.to_string(),
            })?;
        Ok(cached.record.sync_version.max(1))
    }

    /// Apply a mutation with an explicit payload.
    pub async fn mutate(&self, record_id: RecordId, mutation: Mutation) -> Result<MutationOutcome> {
        let op = OfflineOperation::new(record_id, mutation, self.ctx.device_id(), now_millis());
        op.validate()?;

        if self.ctx.is_online() {
            self.send_direct(op).await
        } else {
            self.enqueue(op).await
        }
    }

    /// Offline path: optimistic apply, queue, persist. Rolls back on storage failure.
    async fn enqueue(&self, op: OfflineOperation) -> Result<MutationOutcome> {
        let mut guard = self.client.lock().await;
        let state = &mut *guard;
        let saved = (state.queue.clone(), state.projection.clone());

        let outcome = match apply_offline(&mut state.queue, &mut state.projection, op) {
            Ok(outcome) => outcome,
            Err(e) => {
                (state.queue, state.projection) = saved;
                return Err(e.into());
            }
        };

        if let Err(e) = self.client.persist(state).await {
            tracing::error!(device_id = %self.ctx.device_id(), error = %e, "failed to persist queued operation");
            (state.queue, state.projection) = saved;
            return Err(e);
        }

        self.ctx.set_queue_count(state.queue.len());
        tracing::debug!(device_id = %self.ctx.device_id(), queued = state.queue.len(), "mutation queued");
        Ok(outcome)
    }

    /// Online path: one-operation sync, bypassing the queue.
    async fn send_direct(&self, op: OfflineOperation) -> Result<MutationOutcome> {
        let request = {
            let mut state = self.client.lock().await;
            state.projection.apply_optimistic(&op, op.local_timestamp)?;
            SyncRequest::new(self.ctx.device_id(), state.last_sync_timestamp, [op.clone()])
        };

        let response = self.client.send(&request).await;

        let mut state = self.client.lock().await;
        let result = match response {
            Ok(result) => result,
            Err(e) => {
                state.projection.revert(op.resource(), &op.record_id);
                tracing::warn!(operation_id = %op.operation_id, error = %e, "direct mutation failed");
                return Err(ClientError::Transport(e));
            }
        };

        let mut report = self.client.apply_result(&mut state, result.clone(), std::slice::from_ref(&op));
        // The server already holds the outcome; the next successful save catches up
        if let Err(e) = self.client.persist(&state).await {
            tracing::error!(error = %e, "failed to persist sync result");
        }
        drop(state);

        if let Some(conflict) = report.conflicts.pop() {
            self.client.emit(SyncEvent::Conflict(conflict.clone()));
            return Ok(MutationOutcome::Conflict(conflict));
        }
        if let Some(rejected) = report.rejected.pop() {
            self.client.emit(SyncEvent::Rejected(rejected.clone()));
            return Ok(MutationOutcome::Rejected(rejected));
        }
        result
            .accepted
            .into_iter()
            .next()
            .map(MutationOutcome::Accepted)
            .ok_or_else(|| {
                ClientError::Transport(crate::error::TransportError::Malformed(format!(
                    "no outcome for operation {}",
                    op.operation_id
                )))
            })
    }

    // Connectivity

    pub fn connectivity_lost(&self) -> Transition {
        self.ctx.apply(ConnectivityEvent::ConnectionLost)
    }

    /// Go from offline to syncing, flush once, then go online.
    ///
    /// Returns `None` when the signal was spurious (already online or syncing).
    pub async fn connectivity_restored(&self) -> Result<Option<FlushOutcome>> {
        let transition = self.ctx.apply(ConnectivityEvent::ConnectionRestored);
        if !transition.flush {
            return Ok(None);
        }
        let outcome = self.client.flush().await;
        self.ctx.apply(ConnectivityEvent::FlushCompleted);
        outcome.map(Some)
    }

    pub async fn flush(&self) -> Result<FlushOutcome> {
        self.client.flush().await
    }

    pub async fn pull(&self) -> Result<usize> {
        self.client.pull().await
    }

    /// Drive the device until the signal channel closes.
    ///
    /// Handles connectivity signals, retries failed flushes when the backoff
    /// delay expires, and pulls remote changes on an interval while online.
    pub async fn run(&self, mut signals: mpsc::Receiver<ConnectivityEvent>) {
        let mut pull = tokio::time::interval(self.pull_interval);
        pull.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            let retry_at = self.client.retry_at().await;
            let retry = async {
                match retry_at {
                    Some(at) => tokio::time::sleep_until(at).await,
                    None => std::future::pending().await,
                }
            };

            tokio::select! {
                signal = signals.recv() => match signal {
                    Some(ConnectivityEvent::ConnectionLost) => {
                        self.connectivity_lost();
                    }
                    Some(ConnectivityEvent::ConnectionRestored) => {
                        if let Err(e) = self.connectivity_restored().await {
                            tracing::warn!(error = %e, "reconnection flush failed");
                        }
                    }
                    Some(ConnectivityEvent::FlushCompleted) => {}
                    None => break,
                },
                _ = retry, if self.ctx.is_online() => {
                    if let Err(e) = self.client.flush().await {
                        tracing::warn!(error = %e, "retry flush failed");
                    }
                }
                _ = pull.tick(), if self.ctx.is_online() => {
                    if let Err(e) = self.client.pull().await {
                        tracing::debug!(error = %e, "periodic pull failed");
                    }
                }
            }
        }
        tracing::info!(device_id = %self.ctx.device_id(), "device driver stopped");
    }
}

/// Queue an offline operation, folding it into a never-sent entry for the
/// same record where possible.
fn apply_offline(
    queue: &mut OperationQueue,
    projection: &mut tally_engine::LocalProjection,
    op: OfflineOperation,
) -> std::result::Result<MutationOutcome, Error> {
    projection.apply_optimistic(&op, op.local_timestamp)?;

    let Some(last) = queue
        .last_for(op.resource(), &op.record_id)
        .filter(|last| !queue.is_transmitted(last))
        .cloned()
    else {
        return queue.enqueue(op).map(MutationOutcome::Queued);
    };

    let folded = match (&last.mutation, &op.mutation) {
        (Mutation::Create(body), Mutation::Update { patch, .. }) => {
            let mut body = body.clone();
            body.apply(patch)?;
            Some(Mutation::Create(body))
        }
        (
            Mutation::Update {
                expected_sync_version,
                patch: earlier,
            },
            Mutation::Update { patch, .. },
        ) => {
            let mut merged = earlier.clone();
            merged.merge(patch)?;
            Some(Mutation::Update {
                expected_sync_version: *expected_sync_version,
                patch: merged,
            })
        }
        (
            Mutation::Update {
                expected_sync_version,
                ..
            },
            Mutation::Delete { resource, .. },
        ) => Some(Mutation::Delete {
            resource: *resource,
            expected_sync_version: *expected_sync_version,
        }),
        (Mutation::Create(_), Mutation::Delete { resource, .. }) => {
            queue.discard(&last.operation_id);
            projection.overwrite(*resource, &op.record_id, None);
            return Ok(MutationOutcome::Cancelled);
        }
        _ => None,
    };
    let Some(folded) = folded else {
        return queue.enqueue(op).map(MutationOutcome::Queued);
    };

    queue.amend(&last.operation_id, folded)?;
    Ok(MutationOutcome::Queued(last.operation_id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tally_engine::record::{Category, CategoryKind, CategoryPatch};
    use tally_engine::LocalProjection;

    fn groceries() -> RecordBody {
        RecordBody::Category(Category {
            name: "Groceries".into(),
            kind: CategoryKind::Expense,
            color: None,
            parent_id: None,
        })
    }

    fn recolor(expected: u64, color: &str) -> OfflineOperation {
        OfflineOperation::new(
            "cat-1",
            Mutation::Update {
                expected_sync_version: expected,
                patch: RecordPatch::Category(CategoryPatch {
                    color: Some(color.into()),
                    ..Default::default()
                }),
            },
            "device-1",
            2,
        )
    }

    fn rename(expected: u64, name: &str) -> OfflineOperation {
        OfflineOperation::new(
            "cat-1",
            Mutation::Update {
                expected_sync_version: expected,
                patch: RecordPatch::Category(CategoryPatch {
                    name: Some(name.into()),
                    ..Default::default()
                }),
            },
            "device-1",
            3,
        )
    }

    fn create() -> OfflineOperation {
        OfflineOperation::new("cat-1", Mutation::Create(groceries()), "device-1", 1)
    }

    fn confirmed_projection() -> LocalProjection {
        let mut projection = LocalProjection::new();
        let mut record = Record::new("cat-1", groceries(), "device-0", 0);
        record.sync_version = 4;
        projection.apply_server([record]);
        projection
    }

    #[test]
    fn update_after_create_folds_into_create() {
        let mut queue = OperationQueue::new();
        let mut projection = LocalProjection::new();

        apply_offline(&mut queue, &mut projection, create()).unwrap();
        apply_offline(&mut queue, &mut projection, rename(1, "Food")).unwrap();

        assert_eq!(queue.len(), 1);
        let Mutation::Create(RecordBody::Category(category)) = &queue.peek_batch()[0].mutation else {
            panic!("expected create");
        };
        assert_eq!(category.name, "Food");
    }

    #[test]
    fn update_after_update_merges_and_keeps_base_version() {
        let mut queue = OperationQueue::new();
        let mut projection = confirmed_projection();

        apply_offline(&mut queue, &mut projection, recolor(4, "#ff0000")).unwrap();
        apply_offline(&mut queue, &mut projection, rename(4, "Food")).unwrap();

        assert_eq!(queue.len(), 1);
        let op = &queue.peek_batch()[0];
        assert_eq!(op.expected_sync_version(), Some(4));
        let Mutation::Update {
            patch: RecordPatch::Category(patch),
            ..
        } = &op.mutation
        else {
            panic!("expected update");
        };
        assert_eq!(patch.color.as_deref(), Some("#ff0000"));
        assert_eq!(patch.name.as_deref(), Some("Food"));
    }

    #[test]
    fn delete_after_update_replaces_update() {
        let mut queue = OperationQueue::new();
        let mut projection = confirmed_projection();

        apply_offline(&mut queue, &mut projection, rename(4, "Food")).unwrap();
        let delete = OfflineOperation::new(
            "cat-1",
            Mutation::Delete {
                resource: Resource::Category,
                expected_sync_version: 4,
            },
            "device-1",
            5,
        );
        apply_offline(&mut queue, &mut projection, delete).unwrap();

        assert_eq!(queue.len(), 1);
        assert!(matches!(
            queue.peek_batch()[0].mutation,
            Mutation::Delete {
                expected_sync_version: 4,
                ..
            }
        ));
        assert!(projection.record(Resource::Category, "cat-1").is_none());
    }

    #[test]
    fn delete_after_create_cancels_both() {
        let mut queue = OperationQueue::new();
        let mut projection = LocalProjection::new();

        apply_offline(&mut queue, &mut projection, create()).unwrap();
        let delete = OfflineOperation::new(
            "cat-1",
            Mutation::Delete {
                resource: Resource::Category,
                expected_sync_version: 1,
            },
            "device-1",
            5,
        );
        let outcome = apply_offline(&mut queue, &mut projection, delete).unwrap();

        assert_eq!(outcome, MutationOutcome::Cancelled);
        assert!(queue.is_empty());
        assert!(projection.is_empty());
    }

    #[test]
    fn transmitted_entries_are_not_folded() {
        let mut queue = OperationQueue::new();
        let mut projection = confirmed_projection();

        apply_offline(&mut queue, &mut projection, recolor(4, "#ff0000")).unwrap();
        let first = queue.peek_batch()[0].operation_id.clone();
        queue.increment_retry(&first);

        apply_offline(&mut queue, &mut projection, rename(4, "Food")).unwrap();
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn sent_entries_are_not_folded_before_any_failure() {
        let mut queue = OperationQueue::new();
        let mut projection = confirmed_projection();

        apply_offline(&mut queue, &mut projection, recolor(4, "#ff0000")).unwrap();
        let first = queue.peek_batch()[0].operation_id.clone();
        queue.mark_sent([first.as_str()]);

        let outcome = apply_offline(&mut queue, &mut projection, rename(4, "Food")).unwrap();
        assert!(matches!(outcome, MutationOutcome::Queued(id) if id != first));
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.peek_batch()[0].retry_count, 0);
    }

    #[test]
    fn update_of_unknown_record_fails_without_queueing() {
        let mut queue = OperationQueue::new();
        let mut projection = LocalProjection::new();

        let result = apply_offline(&mut queue, &mut projection, rename(1, "Food"));
        assert!(matches!(result, Err(Error::RecordNotFound { .. })));
        assert!(queue.is_empty());
    }
}
