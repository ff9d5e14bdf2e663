//! Device runtime tests against an in-process Reconciler.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tally_client::{
    ClientError, Device, DeviceOptions, DeviceStorage, FileStorage, FlushOutcome,
    InProcessTransport, MemoryStorage, MutationOutcome, SyncEvent, TransportError,
};
use tally_engine::{
    record::{Account, AccountKind, AccountPatch},
    Change, CacheState, ConflictKind, ConnectivityState, CreateOutcome, MemoryRecordStore,
    MutationContext, Receipt, Reconciler, Record, RecordBody, RecordPatch, RecordStore, Resource,
    StoreResult, SwapOutcome, Timestamp, Version,
};

struct Harness {
    store: Arc<MemoryRecordStore>,
    server: Reconciler<dyn RecordStore>,
}

impl Harness {
    fn new() -> Self {
        let store = Arc::new(MemoryRecordStore::new());
        Self::serving(store.clone(), store)
    }

    /// One server Reconciler over `served`; assertions read `store` directly.
    fn serving(store: Arc<MemoryRecordStore>, served: Arc<dyn RecordStore>) -> Self {
        Self {
            server: Reconciler::new(served),
            store,
        }
    }

    fn transport(&self) -> Arc<InProcessTransport> {
        Arc::new(InProcessTransport::with_reconciler(self.server.clone()))
    }

    async fn device(&self) -> (Device, Arc<InProcessTransport>, Arc<MemoryStorage>) {
        self.device_with(options()).await
    }

    async fn device_with(
        &self,
        options: DeviceOptions,
    ) -> (Device, Arc<InProcessTransport>, Arc<MemoryStorage>) {
        let transport = self.transport();
        let storage = Arc::new(MemoryStorage::new());
        let device = Device::open(storage.clone(), transport.clone(), options)
            .await
            .unwrap();
        (device, transport, storage)
    }

    async fn server_record(&self, id: &str) -> Option<Record> {
        self.store.get(Resource::Account, id).await.unwrap()
    }
}

fn options() -> DeviceOptions {
    DeviceOptions {
        request_timeout: Duration::from_secs(5),
        pull_interval: Duration::from_secs(60),
        backoff_base: Duration::from_millis(10),
        backoff_max: Duration::from_millis(100),
    }
}

fn checking() -> RecordBody {
    RecordBody::Account(Account {
        name: "Checking".into(),
        kind: AccountKind::Checking,
        currency: "USD".into(),
        balance: 0,
        archived: false,
    })
}

fn balance(amount: i64) -> RecordPatch {
    RecordPatch::Account(AccountPatch {
        balance: Some(amount),
        ..Default::default()
    })
}

fn rename(name: &str) -> RecordPatch {
    RecordPatch::Account(AccountPatch {
        name: Some(name.into()),
        ..Default::default()
    })
}

fn name_of(record: &Record) -> &str {
    match &record.body {
        RecordBody::Account(account) => &account.name,
        _ => panic!("expected account"),
    }
}

fn balance_of(record: &Record) -> i64 {
    match &record.body {
        RecordBody::Account(account) => account.balance,
        _ => panic!("expected account"),
    }
}

async fn go_online(device: &Device) {
    device.connectivity_restored().await.unwrap();
    assert_eq!(device.context().state(), ConnectivityState::Online);
}

/// Memory store whose compare-and-swap stalls before touching the record.
struct SlowSwapStore {
    inner: Arc<MemoryRecordStore>,
    delay: Duration,
}

#[async_trait]
impl RecordStore for SlowSwapStore {
    async fn get(&self, resource: Resource, id: &str) -> StoreResult<Option<Record>> {
        self.inner.get(resource, id).await
    }

    async fn create_if_absent(
        &self,
        record: Record,
        ctx: &MutationContext,
    ) -> StoreResult<CreateOutcome> {
        self.inner.create_if_absent(record, ctx).await
    }

    async fn compare_and_swap(
        &self,
        resource: Resource,
        id: &str,
        expected: Version,
        change: Change,
        ctx: &MutationContext,
    ) -> StoreResult<SwapOutcome> {
        tokio::time::sleep(self.delay).await;
        self.inner
            .compare_and_swap(resource, id, expected, change, ctx)
            .await
    }

    async fn receipt(&self, operation_id: &str) -> StoreResult<Option<Receipt>> {
        self.inner.receipt(operation_id).await
    }

    async fn changed_since(&self, since: Timestamp) -> StoreResult<Vec<Record>> {
        self.inner.changed_since(since).await
    }
}

// ============================================================================
// Offline queue and reconnection
// ============================================================================

#[tokio::test]
async fn offline_mutations_queue_and_flush_on_reconnect() {
    let h = Harness::new();
    let (device, _, _) = h.device().await;

    assert!(matches!(
        device.create("acc-1", checking()).await.unwrap(),
        MutationOutcome::Queued(_)
    ));
    assert!(matches!(
        device.create("acc-2", checking()).await.unwrap(),
        MutationOutcome::Queued(_)
    ));
    assert_eq!(device.queue_count(), 2);

    let cached = device.record(Resource::Account, "acc-1").await.unwrap();
    assert_eq!(cached.state, CacheState::Pending);
    assert_eq!(cached.record.sync_version, 0);

    let outcome = device.connectivity_restored().await.unwrap();
    let Some(FlushOutcome::Completed(report)) = outcome else {
        panic!("expected a completed flush");
    };
    assert_eq!(report.accepted, 2);
    assert_eq!(device.queue_count(), 0);
    assert_eq!(device.context().state(), ConnectivityState::Online);

    let cached = device.record(Resource::Account, "acc-1").await.unwrap();
    assert_eq!(cached.state, CacheState::Confirmed);
    assert_eq!(cached.record.sync_version, 1);
    assert_eq!(h.server_record("acc-2").await.unwrap().sync_version, 1);
}

#[tokio::test]
async fn offline_edits_of_a_new_record_travel_as_one_create() {
    let h = Harness::new();
    let (device, _, _) = h.device().await;

    device.create("acc-1", checking()).await.unwrap();
    device.update("acc-1", balance(500)).await.unwrap();
    assert_eq!(device.queue_count(), 1);

    go_online(&device).await;

    let record = h.server_record("acc-1").await.unwrap();
    assert_eq!(record.sync_version, 1);
    assert_eq!(balance_of(&record), 500);
}

#[tokio::test]
async fn offline_create_then_delete_never_reaches_server() {
    let h = Harness::new();
    let (device, _, _) = h.device().await;

    device.create("acc-1", checking()).await.unwrap();
    let outcome = device.delete(Resource::Account, "acc-1").await.unwrap();

    assert_eq!(outcome, MutationOutcome::Cancelled);
    assert_eq!(device.queue_count(), 0);
    assert!(device.record(Resource::Account, "acc-1").await.is_none());

    go_online(&device).await;
    assert!(h.server_record("acc-1").await.is_none());
}

#[tokio::test]
async fn online_mutations_bypass_the_queue() {
    let h = Harness::new();
    let (device, _, _) = h.device().await;
    go_online(&device).await;

    let outcome = device.create("acc-1", checking()).await.unwrap();
    let MutationOutcome::Accepted(accepted) = outcome else {
        panic!("expected accepted, got {outcome:?}");
    };
    assert_eq!(accepted.sync_version, 1);

    device.update("acc-1", balance(42)).await.unwrap();
    assert_eq!(device.queue_count(), 0);
    assert!(device.queued().await.is_empty());

    let cached = device.record(Resource::Account, "acc-1").await.unwrap();
    assert_eq!(cached.state, CacheState::Confirmed);
    assert_eq!(cached.record.sync_version, 2);
    assert_eq!(balance_of(&cached.record), 42);
}

// ============================================================================
// First-to-sync-wins across devices
// ============================================================================

#[tokio::test]
async fn second_device_to_sync_gets_conflict_and_server_truth() {
    let h = Harness::new();
    let (phone, _, _) = h.device().await;
    let (laptop, _, _) = h.device().await;

    go_online(&phone).await;
    phone.create("acc-1", checking()).await.unwrap();
    go_online(&laptop).await;
    assert!(laptop.record(Resource::Account, "acc-1").await.is_some());

    phone.connectivity_lost();
    laptop.connectivity_lost();
    phone.update("acc-1", balance(100)).await.unwrap();
    laptop.update("acc-1", balance(200)).await.unwrap();

    let mut events = laptop.subscribe();

    go_online(&phone).await;
    let outcome = laptop.connectivity_restored().await.unwrap();
    let Some(FlushOutcome::Completed(report)) = outcome else {
        panic!("expected a completed flush");
    };

    assert_eq!(report.accepted, 0);
    assert_eq!(report.conflicts.len(), 1);
    assert_eq!(report.conflicts[0].conflict_type, ConflictKind::StaleVersion);
    assert_eq!(laptop.queue_count(), 0);

    let cached = laptop.record(Resource::Account, "acc-1").await.unwrap();
    assert_eq!(cached.record.sync_version, 2);
    assert_eq!(balance_of(&cached.record), 100);
    assert_eq!(cached.record.last_modified_by, phone.device_id());

    let mut saw_conflict = false;
    while let Ok(event) = events.try_recv() {
        if let SyncEvent::Conflict(conflict) = event {
            assert_eq!(conflict.record_id, "acc-1");
            saw_conflict = true;
        }
    }
    assert!(saw_conflict);
}

#[tokio::test]
async fn online_conflict_is_reported_to_the_caller() {
    let h = Harness::new();
    let (phone, _, _) = h.device().await;
    let (laptop, _, _) = h.device().await;

    go_online(&phone).await;
    phone.create("acc-1", checking()).await.unwrap();
    go_online(&laptop).await;

    phone.update("acc-1", balance(100)).await.unwrap();
    let outcome = laptop.update("acc-1", balance(200)).await.unwrap();

    let MutationOutcome::Conflict(conflict) = outcome else {
        panic!("expected conflict, got {outcome:?}");
    };
    assert_eq!(conflict.expected_sync_version, Some(1));
    assert_eq!(conflict.server_sync_version, Some(2));

    let cached = laptop.record(Resource::Account, "acc-1").await.unwrap();
    assert_eq!(cached.state, CacheState::Overwritten);
    assert_eq!(balance_of(&cached.record), 100);
}

#[tokio::test]
async fn pull_catches_a_write_that_commits_after_the_checkpoint() {
    let store = Arc::new(MemoryRecordStore::new());
    let h = Harness::serving(
        store.clone(),
        Arc::new(SlowSwapStore {
            inner: store,
            delay: Duration::from_millis(200),
        }),
    );
    let (phone, _, _) = h.device().await;
    let (laptop, _, _) = h.device().await;
    let phone = Arc::new(phone);

    go_online(&phone).await;
    go_online(&laptop).await;
    phone.create("acc-1", checking()).await.unwrap();
    laptop.pull().await.unwrap();

    let write = tokio::spawn({
        let phone = phone.clone();
        async move { phone.update("acc-1", balance(100)).await }
    });
    tokio::time::sleep(Duration::from_millis(50)).await;

    // Pulls while the update is stamped but not yet visible
    laptop.pull().await.unwrap();
    let cached = laptop.record(Resource::Account, "acc-1").await.unwrap();
    assert_eq!(cached.record.sync_version, 1);

    let outcome = write.await.unwrap().unwrap();
    assert!(matches!(outcome, MutationOutcome::Accepted(ref a) if a.sync_version == 2));

    laptop.pull().await.unwrap();
    let cached = laptop.record(Resource::Account, "acc-1").await.unwrap();
    assert_eq!(cached.record.sync_version, 2);
    assert_eq!(balance_of(&cached.record), 100);
}

#[tokio::test]
async fn pull_brings_in_remote_changes() {
    let h = Harness::new();
    let (phone, _, _) = h.device().await;
    let (laptop, _, _) = h.device().await;

    go_online(&laptop).await;
    go_online(&phone).await;
    phone.create("acc-1", checking()).await.unwrap();

    assert!(laptop.record(Resource::Account, "acc-1").await.is_none());
    let received = laptop.pull().await.unwrap();

    assert!(received >= 1);
    let cached = laptop.record(Resource::Account, "acc-1").await.unwrap();
    assert_eq!(cached.state, CacheState::Confirmed);
    assert!(laptop.last_sync_timestamp().await > 0);
}

// ============================================================================
// Transport failures
// ============================================================================

#[tokio::test]
async fn unreachable_server_keeps_queue_and_schedules_retry() {
    let h = Harness::new();
    let (device, transport, _) = h.device().await;

    device.create("acc-1", checking()).await.unwrap();
    transport.set_reachable(false);

    let result = device.connectivity_restored().await;
    assert!(matches!(
        result,
        Err(ClientError::Transport(TransportError::Unreachable))
    ));
    assert_eq!(device.queue_count(), 1);
    assert_eq!(device.queued().await[0].retry_count, 1);
    assert!(device.sync_client().retry_at().await.is_some());

    transport.set_reachable(true);
    assert!(matches!(
        device.flush().await.unwrap(),
        FlushOutcome::Completed(_)
    ));
    assert_eq!(device.queue_count(), 0);
    assert!(device.sync_client().retry_at().await.is_none());
}

#[tokio::test]
async fn lost_response_is_retried_without_double_apply() {
    let h = Harness::new();
    let (device, transport, _) = h
        .device_with(DeviceOptions {
            request_timeout: Duration::from_millis(50),
            ..options()
        })
        .await;

    device.create("acc-1", checking()).await.unwrap();
    device.create("acc-2", checking()).await.unwrap();
    transport.set_response_delay(Some(Duration::from_millis(500)));

    let result = device.connectivity_restored().await;
    assert!(matches!(
        result,
        Err(ClientError::Transport(TransportError::Timeout(_)))
    ));
    // committed on the server, still queued on the device
    assert!(h.server_record("acc-1").await.is_some());
    assert_eq!(device.queue_count(), 2);

    transport.set_response_delay(None);
    let FlushOutcome::Completed(report) = device.flush().await.unwrap() else {
        panic!("expected a completed flush");
    };
    assert_eq!(report.accepted, 2);
    assert!(report.conflicts.is_empty());
    assert_eq!(device.queue_count(), 0);
    assert_eq!(h.server_record("acc-1").await.unwrap().sync_version, 1);
}

#[tokio::test]
async fn queued_edits_of_one_record_are_sent_in_order() {
    let h = Harness::new();
    let (device, transport, _) = h.device().await;
    go_online(&device).await;
    device.create("acc-1", checking()).await.unwrap();
    device.connectivity_lost();

    device.update("acc-1", balance(100)).await.unwrap();
    let first = device.queued().await[0].operation_id.clone();
    transport.set_reachable(false);
    assert!(device.flush().await.is_err());
    transport.set_reachable(true);

    // A retried edit is never folded into, so the rename is queued behind it
    device.update("acc-1", rename("Renamed")).await.unwrap();
    assert_eq!(device.queue_count(), 2);
    assert_eq!(device.queued().await[0].operation_id, first);

    let Some(FlushOutcome::Completed(report)) = device.connectivity_restored().await.unwrap() else {
        panic!("expected a completed flush");
    };
    assert_eq!(report.accepted, 2);
    assert!(report.conflicts.is_empty());

    let record = h.server_record("acc-1").await.unwrap();
    assert_eq!(record.sync_version, 3);
    assert_eq!(name_of(&record), "Renamed");
    assert_eq!(balance_of(&record), 100);

    let cached = device.record(Resource::Account, "acc-1").await.unwrap();
    assert_eq!(cached.state, CacheState::Confirmed);
    assert_eq!(cached.record.sync_version, 3);
}

#[tokio::test]
async fn going_offline_aborts_the_flush() {
    let h = Harness::new();
    let (device, transport, _) = h.device().await;
    let device = Arc::new(device);

    device.create("acc-1", checking()).await.unwrap();
    transport.set_response_delay(Some(Duration::from_millis(500)));

    let task = tokio::spawn({
        let device = device.clone();
        async move { device.connectivity_restored().await }
    });
    tokio::time::sleep(Duration::from_millis(50)).await;
    device.connectivity_lost();

    let result = task.await.unwrap();
    assert!(matches!(
        result,
        Err(ClientError::Transport(TransportError::Aborted))
    ));
    assert_eq!(device.context().state(), ConnectivityState::Offline);
    assert_eq!(device.queue_count(), 1);
    assert_eq!(device.queued().await[0].retry_count, 1);
}

#[tokio::test]
async fn only_one_flush_runs_at_a_time() {
    let h = Harness::new();
    let (device, transport, _) = h.device().await;
    let device = Arc::new(device);
    go_online(&device).await;

    transport.set_response_delay(Some(Duration::from_millis(300)));
    let task = tokio::spawn({
        let device = device.clone();
        async move { device.flush().await }
    });
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert!(device.context().is_flushing());
    assert_eq!(device.flush().await.unwrap(), FlushOutcome::AlreadyRunning);
    assert!(matches!(
        task.await.unwrap().unwrap(),
        FlushOutcome::Completed(_)
    ));
    assert!(!device.context().is_flushing());
}

#[tokio::test]
async fn spurious_reconnect_does_not_flush() {
    let h = Harness::new();
    let (device, _, _) = h.device().await;
    go_online(&device).await;

    assert!(device.connectivity_restored().await.unwrap().is_none());
}

// ============================================================================
// Durability
// ============================================================================

#[tokio::test]
async fn failed_persist_rolls_back_the_mutation() {
    let h = Harness::new();
    let (device, _, storage) = h.device().await;

    storage.fail_writes(true);
    let result = device.create("acc-1", checking()).await;

    assert!(matches!(result, Err(ClientError::Storage(_))));
    assert_eq!(device.queue_count(), 0);
    assert!(device.record(Resource::Account, "acc-1").await.is_none());
}

#[tokio::test]
async fn conflict_is_reported_when_the_result_cannot_be_saved() {
    let h = Harness::new();
    let (phone, _, _) = h.device().await;
    let (laptop, transport, storage) = h.device().await;
    let laptop = Arc::new(laptop);

    go_online(&phone).await;
    phone.create("acc-1", checking()).await.unwrap();
    go_online(&laptop).await;
    phone.update("acc-1", balance(100)).await.unwrap();

    laptop.connectivity_lost();
    laptop.update("acc-1", balance(200)).await.unwrap();
    let mut events = laptop.subscribe();

    transport.set_response_delay(Some(Duration::from_millis(200)));
    let flush = tokio::spawn({
        let laptop = laptop.clone();
        async move { laptop.connectivity_restored().await }
    });
    tokio::time::sleep(Duration::from_millis(50)).await;
    storage.fail_writes(true);

    let result = flush.await.unwrap();
    assert!(matches!(result, Err(ClientError::Storage(_))));

    let mut conflicts = 0;
    while let Ok(event) = events.try_recv() {
        if let SyncEvent::Conflict(conflict) = event {
            assert_eq!(conflict.record_id, "acc-1");
            conflicts += 1;
        }
    }
    assert_eq!(conflicts, 1);

    // Memory matches disk: the batch is still queued and a retry is scheduled
    assert_eq!(laptop.queue_count(), 1);
    assert_eq!(storage.saved().await.unwrap().operations.len(), 1);
    assert!(laptop.sync_client().retry_at().await.is_some());

    storage.fail_writes(false);
    transport.set_response_delay(None);
    let FlushOutcome::Completed(report) = laptop.flush().await.unwrap() else {
        panic!("expected a completed flush");
    };
    assert_eq!(report.conflicts.len(), 1);
    assert_eq!(laptop.queue_count(), 0);
    let cached = laptop.record(Resource::Account, "acc-1").await.unwrap();
    assert_eq!(balance_of(&cached.record), 100);
}

#[tokio::test]
async fn edit_made_after_a_crash_mid_flush_is_not_lost() {
    let h = Harness::new();
    let storage = Arc::new(MemoryStorage::new());
    let transport = h.transport();
    let device = Arc::new(
        Device::open(storage.clone(), transport.clone(), options())
            .await
            .unwrap(),
    );

    go_online(&device).await;
    device.create("acc-1", checking()).await.unwrap();
    device.connectivity_lost();
    device.update("acc-1", balance(100)).await.unwrap();

    // The server applies the batch, then the app dies before the response arrives
    transport.set_response_delay(Some(Duration::from_secs(5)));
    let flush = tokio::spawn({
        let device = device.clone();
        async move { device.connectivity_restored().await }
    });
    while h.server_record("acc-1").await.unwrap().sync_version < 2 {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    flush.abort();
    let _ = flush.await;
    drop(device);

    let device = Device::open(storage.clone(), h.transport(), options())
        .await
        .unwrap();
    let queued = device.queued().await;
    assert_eq!(queued.len(), 1);
    assert_eq!(queued[0].retry_count, 0);

    let outcome = device.update("acc-1", rename("Renamed")).await.unwrap();
    assert!(matches!(outcome, MutationOutcome::Queued(ref id) if *id != queued[0].operation_id));
    assert_eq!(device.queue_count(), 2);

    go_online(&device).await;
    assert_eq!(device.queue_count(), 0);

    let record = h.server_record("acc-1").await.unwrap();
    assert_eq!(record.sync_version, 3);
    assert_eq!(name_of(&record), "Renamed");
    assert_eq!(balance_of(&record), 100);
}

#[tokio::test]
async fn queue_survives_restart() {
    let h = Harness::new();
    let dir = tempfile::tempdir().unwrap();

    let device_id = {
        let storage = Arc::new(FileStorage::new(dir.path()));
        let device = Device::open(storage, h.transport(), options()).await.unwrap();
        device.create("acc-1", checking()).await.unwrap();
        device.update("acc-1", balance(7)).await.unwrap();
        device.device_id().to_string()
    };

    let storage = Arc::new(FileStorage::new(dir.path()));
    assert!(storage.load().await.unwrap().is_some());
    let device = Device::open(storage, h.transport(), options()).await.unwrap();

    assert_eq!(device.device_id(), device_id);
    assert_eq!(device.queue_count(), 1);
    let cached = device.record(Resource::Account, "acc-1").await.unwrap();
    assert!(cached.is_pending());
    assert_eq!(balance_of(&cached.record), 7);

    go_online(&device).await;
    assert_eq!(device.queue_count(), 0);
    assert_eq!(balance_of(&h.server_record("acc-1").await.unwrap()), 7);
}

#[tokio::test]
async fn first_launch_assigns_a_stable_identity() {
    let h = Harness::new();
    let storage = Arc::new(MemoryStorage::new());

    let first = Device::open(storage.clone(), h.transport(), options())
        .await
        .unwrap();
    let second = Device::open(storage.clone(), h.transport(), options())
        .await
        .unwrap();

    assert!(!first.device_id().is_empty());
    assert_eq!(first.device_id(), second.device_id());
    assert_eq!(
        storage.saved().await.unwrap().device_id,
        first.device_id()
    );
}
