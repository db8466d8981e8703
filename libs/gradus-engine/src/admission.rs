//! Cross-process admission control for the per-language execution
//! sandboxes.
//!
//! Each language's toolchain is provisioned as a single long-lived
//! execution environment shared by every engine process, so at most one
//! submission may occupy it at a time. The occupancy record lives in
//! the coordination store and is only ever mutated through
//! compare-and-set, which makes acquisition a race with exactly one
//! winner. A release names the sequence it frees, so a retried release
//! can only ever undo its own hold, never a later one. Release
//! broadcasts a notification carrying the freed sequence number;
//! waiters treat the subscription as the primary signal and fall back
//! to a short poll so a dropped notification can never strand them.
//! Between waiting submissions the order is first-ready-wins, not FIFO.

use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::time;
use tracing::{debug, warn};

use gradus_common::redis::{release_channel, slot_key};

use crate::error::StoreError;
use crate::store::CoordinationStore;

/// Per-language occupancy record stored under `gradus:slot:<language>`.
/// `holder = None` means free; otherwise it carries the sequence number
/// of the current occupant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SandboxSlot {
    pub sequence: u64,
    pub holder: Option<u64>,
}

impl SandboxSlot {
    fn initial() -> Self {
        Self { sequence: 0, holder: None }
    }

    pub fn is_free(&self) -> bool {
        self.holder.is_none()
    }
}

// Slot records are compared as raw strings by compare_and_set, so the
// encoding must stay deterministic across all engine processes.
fn encode(slot: &SandboxSlot) -> Result<String, StoreError> {
    serde_json::to_string(slot).map_err(|e| StoreError::Payload(e.to_string()))
}

fn decode(raw: &str) -> Result<SandboxSlot, StoreError> {
    serde_json::from_str(raw).map_err(|e| StoreError::Payload(e.to_string()))
}

/// Outcome of a single acquisition attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquireAttempt {
    /// The caller now holds the slot under this sequence number.
    Acquired { sequence: u64 },
    /// Someone else holds the slot or won the race; `sequence` is the
    /// round whose release the caller should wait out.
    Occupied { sequence: u64 },
}

#[derive(Clone)]
pub struct AdmissionController {
    store: Arc<dyn CoordinationStore>,
    poll_interval: Duration,
}

impl AdmissionController {
    pub fn new(store: Arc<dyn CoordinationStore>, poll_interval: Duration) -> Self {
        Self { store, poll_interval }
    }

    /// Read the slot, lazily initializing it on first reference.
    async fn load_slot(&self, language: &str) -> Result<SandboxSlot, StoreError> {
        let key = slot_key(language);
        if let Some(raw) = self.store.get(&key).await? {
            return decode(&raw);
        }
        let initial = SandboxSlot::initial();
        if self.store.compare_and_set(&key, None, &encode(&initial)?).await? {
            return Ok(initial);
        }
        // Lost the initialization race; the slot exists now.
        match self.store.get(&key).await? {
            Some(raw) => decode(&raw),
            None => Err(StoreError::Payload(format!(
                "slot {} vanished after initialization race",
                key
            ))),
        }
    }

    pub async fn is_free(&self, language: &str) -> Result<bool, StoreError> {
        Ok(self.load_slot(language).await?.is_free())
    }

    /// One compare-and-set round. Two processes observing the same free
    /// slot cannot both win; the loser is told which round to wait out.
    pub async fn try_acquire(&self, language: &str) -> Result<AcquireAttempt, StoreError> {
        let slot = self.load_slot(language).await?;
        if !slot.is_free() {
            return Ok(AcquireAttempt::Occupied { sequence: slot.sequence });
        }
        let claimed = SandboxSlot {
            sequence: slot.sequence + 1,
            holder: Some(slot.sequence + 1),
        };
        let swapped = self
            .store
            .compare_and_set(&slot_key(language), Some(&encode(&slot)?), &encode(&claimed)?)
            .await?;
        if swapped {
            debug!(language, sequence = claimed.sequence, "sandbox slot acquired");
            Ok(AcquireAttempt::Acquired { sequence: claimed.sequence })
        } else {
            Ok(AcquireAttempt::Occupied { sequence: slot.sequence })
        }
    }

    /// Block until the slot is held by this caller. Losing a race to
    /// another process is expected and handled by re-waiting.
    pub async fn acquire(&self, language: &str) -> Result<u64, StoreError> {
        loop {
            match self.try_acquire(language).await? {
                AcquireAttempt::Acquired { sequence } => return Ok(sequence),
                AcquireAttempt::Occupied { sequence } => {
                    self.wait_until_available(language, sequence).await?;
                }
            }
        }
    }

    /// Free the hold identified by `sequence`, keeping the sequence
    /// counter, and notify waiters with the released sequence number.
    ///
    /// A slot that is already free, or held under a different sequence,
    /// is left untouched. A release can therefore be retried after a
    /// partial failure (the swap landed but the notification did not)
    /// without revoking a hold that was granted in the meantime; the
    /// retry only re-sends the notification.
    pub async fn release(&self, language: &str, sequence: u64) -> Result<(), StoreError> {
        let key = slot_key(language);
        loop {
            let slot = self.load_slot(language).await?;
            if slot.holder != Some(sequence) {
                warn!(
                    language,
                    sequence,
                    holder = ?slot.holder,
                    "sandbox slot release skipped, hold is no longer current"
                );
                break;
            }
            let freed = SandboxSlot { sequence: slot.sequence, holder: None };
            if self
                .store
                .compare_and_set(&key, Some(&encode(&slot)?), &encode(&freed)?)
                .await?
            {
                debug!(language, sequence, "sandbox slot released");
                break;
            }
            // Raced with a concurrent mutation; re-read and retry.
        }
        self.store
            .publish(&release_channel(language), &sequence.to_string())
            .await
    }

    /// Wait for the release of the round observed at the last
    /// acquisition attempt. The subscription is set up before the first
    /// poll so a release cannot slip between them; the poll rescues
    /// waiters whose notification was dropped.
    pub async fn wait_until_available(
        &self,
        language: &str,
        observed_sequence: u64,
    ) -> Result<(), StoreError> {
        let mut notifications = self.store.subscribe(&release_channel(language)).await?;
        let mut poll = time::interval(self.poll_interval);
        poll.set_missed_tick_behavior(time::MissedTickBehavior::Delay);
        poll.tick().await; // the first tick completes immediately

        loop {
            tokio::select! {
                message = notifications.next() => match message {
                    Some(payload) => {
                        let released: u64 = payload.parse().unwrap_or(0);
                        if released >= observed_sequence && self.is_free(language).await? {
                            return Ok(());
                        }
                    }
                    None => {
                        warn!(language, "release channel closed, falling back to polling");
                        loop {
                            time::sleep(self.poll_interval).await;
                            if self.is_free(language).await? {
                                return Ok(());
                            }
                        }
                    }
                },
                _ = poll.tick() => {
                    if self.is_free(language).await? {
                        return Ok(());
                    }
                }
            }
        }
    }
}

/// Spawn-on-drop backstop so an abnormal unwind between acquire and the
/// structured release still frees the slot. The guard remembers the
/// sequence it was armed for and releases only that hold.
pub struct ReleaseGuard {
    controller: AdmissionController,
    language: String,
    sequence: u64,
    armed: bool,
}

impl ReleaseGuard {
    pub fn new(controller: AdmissionController, language: &str, sequence: u64) -> Self {
        Self { controller, language: language.to_string(), sequence, armed: true }
    }

    /// Call once the structured release has run.
    pub fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for ReleaseGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        // Cannot be async in Drop; hand the release to the runtime.
        let controller = self.controller.clone();
        let language = self.language.clone();
        let sequence = self.sequence;
        tokio::spawn(async move {
            if let Err(e) = controller.release(&language, sequence).await {
                warn!(language = %language, error = %e, "guard failed to release sandbox slot");
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{InMemoryStore, MessageStream};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn controller(store: &Arc<InMemoryStore>) -> AdmissionController {
        AdmissionController::new(store.clone() as Arc<dyn CoordinationStore>, Duration::from_millis(10))
    }

    #[tokio::test]
    async fn test_slot_initialized_lazily() {
        let store = Arc::new(InMemoryStore::new());
        let admission = controller(&store);

        assert!(admission.is_free("c").await.unwrap());
        let raw = store.get(&slot_key("c")).await.unwrap().expect("slot created");
        assert_eq!(raw, r#"{"sequence":0,"holder":null}"#);
    }

    #[tokio::test]
    async fn test_acquire_marks_slot_occupied() {
        let store = Arc::new(InMemoryStore::new());
        let admission = controller(&store);

        let sequence = admission.acquire("c").await.unwrap();
        assert_eq!(sequence, 1);
        assert!(!admission.is_free("c").await.unwrap());
    }

    #[tokio::test]
    async fn test_release_frees_slot_and_keeps_sequence() {
        let store = Arc::new(InMemoryStore::new());
        let admission = controller(&store);

        let sequence = admission.acquire("c").await.unwrap();
        admission.release("c", sequence).await.unwrap();

        assert!(admission.is_free("c").await.unwrap());
        let raw = store.get(&slot_key("c")).await.unwrap().unwrap();
        assert_eq!(decode(&raw).unwrap(), SandboxSlot { sequence: 1, holder: None });
    }

    #[tokio::test]
    async fn test_release_notifies_waiting_round() {
        let store = Arc::new(InMemoryStore::new());
        let admission = controller(&store);

        let mut notifications = store.subscribe(&release_channel("c")).await.unwrap();
        let sequence = admission.acquire("c").await.unwrap();
        admission.release("c", sequence).await.unwrap();

        assert_eq!(notifications.next().await.as_deref(), Some("1"));
    }

    #[tokio::test]
    async fn test_sequence_advances_per_acquisition() {
        let store = Arc::new(InMemoryStore::new());
        let admission = controller(&store);

        assert_eq!(admission.acquire("c").await.unwrap(), 1);
        admission.release("c", 1).await.unwrap();
        assert_eq!(admission.acquire("c").await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_racing_acquires_have_one_winner() {
        let store = Arc::new(InMemoryStore::new());
        let first = controller(&store);
        let second = controller(&store);

        let (a, b) = tokio::join!(first.try_acquire("c"), second.try_acquire("c"));
        let outcomes = [a.unwrap(), b.unwrap()];
        let winners = outcomes
            .iter()
            .filter(|o| matches!(o, AcquireAttempt::Acquired { .. }))
            .count();
        assert_eq!(winners, 1);
    }

    #[tokio::test]
    async fn test_concurrent_holders_never_exceed_one() {
        let store = Arc::new(InMemoryStore::new());
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let admission = controller(&store);
            let active = active.clone();
            let peak = peak.clone();
            tasks.push(tokio::spawn(async move {
                let sequence = admission.acquire("c").await.unwrap();
                let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                time::sleep(Duration::from_millis(2)).await;
                active.fetch_sub(1, Ordering::SeqCst);
                admission.release("c", sequence).await.unwrap();
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        assert_eq!(peak.load(Ordering::SeqCst), 1);
        let admission = controller(&store);
        assert!(admission.is_free("c").await.unwrap());
        let raw = store.get(&slot_key("c")).await.unwrap().unwrap();
        assert_eq!(decode(&raw).unwrap().sequence, 8);
    }

    #[tokio::test]
    async fn test_wait_wakes_on_release() {
        let store = Arc::new(InMemoryStore::new());
        let holder = controller(&store);
        let waiter = controller(&store);

        let held = holder.acquire("c").await.unwrap();
        let observed = match waiter.try_acquire("c").await.unwrap() {
            AcquireAttempt::Occupied { sequence } => sequence,
            other => panic!("expected occupied slot, got {:?}", other),
        };

        let release = tokio::spawn(async move {
            time::sleep(Duration::from_millis(20)).await;
            holder.release("c", held).await.unwrap();
        });

        time::timeout(Duration::from_secs(1), waiter.wait_until_available("c", observed))
            .await
            .expect("waiter should wake on release")
            .unwrap();
        release.await.unwrap();

        assert!(matches!(
            waiter.try_acquire("c").await.unwrap(),
            AcquireAttempt::Acquired { .. }
        ));
    }

    #[tokio::test]
    async fn test_wait_survives_dropped_notification() {
        let store = Arc::new(InMemoryStore::new());
        let admission = controller(&store);

        admission.acquire("c").await.unwrap();

        // Free the slot behind the controller's back, without publishing.
        let key = slot_key("c");
        let held = store.get(&key).await.unwrap().unwrap();
        let freed = encode(&SandboxSlot { sequence: 1, holder: None }).unwrap();
        assert!(store.compare_and_set(&key, Some(&held), &freed).await.unwrap());

        time::timeout(Duration::from_secs(1), admission.wait_until_available("c", 1))
            .await
            .expect("poll fallback should observe the free slot")
            .unwrap();
    }

    #[tokio::test]
    async fn test_release_of_unheld_slot_is_tolerated() {
        let store = Arc::new(InMemoryStore::new());
        let admission = controller(&store);

        admission.release("c", 1).await.unwrap();
        assert!(admission.is_free("c").await.unwrap());
    }

    /// Delegates to an in-memory store but drops the first
    /// `publish_failures` publishes, so a release can land its swap and
    /// still report an error.
    struct FlakyPublishStore {
        inner: InMemoryStore,
        publish_failures: AtomicUsize,
    }

    impl FlakyPublishStore {
        fn new(publish_failures: usize) -> Self {
            Self {
                inner: InMemoryStore::new(),
                publish_failures: AtomicUsize::new(publish_failures),
            }
        }
    }

    #[async_trait]
    impl CoordinationStore for FlakyPublishStore {
        async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
            self.inner.get(key).await
        }

        async fn compare_and_set(
            &self,
            key: &str,
            expected: Option<&str>,
            new: &str,
        ) -> Result<bool, StoreError> {
            self.inner.compare_and_set(key, expected, new).await
        }

        async fn publish(&self, channel: &str, message: &str) -> Result<(), StoreError> {
            if self.publish_failures.load(Ordering::SeqCst) > 0 {
                self.publish_failures.fetch_sub(1, Ordering::SeqCst);
                return Err(StoreError::Unreachable("publish dropped".to_string()));
            }
            self.inner.publish(channel, message).await
        }

        async fn subscribe(&self, channel: &str) -> Result<MessageStream, StoreError> {
            self.inner.subscribe(channel).await
        }
    }

    #[tokio::test]
    async fn test_retried_release_leaves_a_newer_hold_in_place() {
        let store = Arc::new(FlakyPublishStore::new(1));
        let admission = AdmissionController::new(
            store.clone() as Arc<dyn CoordinationStore>,
            Duration::from_millis(10),
        );

        let first = admission.acquire("c").await.unwrap();
        let guard = ReleaseGuard::new(admission.clone(), "c", first);

        // The swap lands but the notification is dropped, so the
        // structured release fails and the guard stays armed.
        assert!(admission.release("c", first).await.is_err());
        assert!(admission.is_free("c").await.unwrap());

        let second = admission.acquire("c").await.unwrap();
        assert_eq!(second, 2);

        drop(guard);
        time::sleep(Duration::from_millis(50)).await;

        // The guard's retry belonged to the finished first hold and must
        // not have freed the second one.
        assert!(!admission.is_free("c").await.unwrap());
        assert!(matches!(
            admission.try_acquire("c").await.unwrap(),
            AcquireAttempt::Occupied { sequence: 2 }
        ));
    }

    #[tokio::test]
    async fn test_release_retry_republishes_without_refreeing() {
        let store = Arc::new(FlakyPublishStore::new(1));
        let admission = AdmissionController::new(
            store.clone() as Arc<dyn CoordinationStore>,
            Duration::from_millis(10),
        );

        let sequence = admission.acquire("c").await.unwrap();
        assert!(admission.release("c", sequence).await.is_err());

        let mut notifications = store.subscribe(&release_channel("c")).await.unwrap();
        admission.release("c", sequence).await.unwrap();

        assert_eq!(notifications.next().await.as_deref(), Some("1"));
        // The first attempt already freed the slot; the retry left the
        // record alone.
        let raw = store.get(&slot_key("c")).await.unwrap().unwrap();
        assert_eq!(decode(&raw).unwrap(), SandboxSlot { sequence: 1, holder: None });
    }

    struct FailingStore;

    #[async_trait]
    impl CoordinationStore for FailingStore {
        async fn get(&self, _key: &str) -> Result<Option<String>, StoreError> {
            Err(StoreError::Unreachable("injected outage".to_string()))
        }

        async fn compare_and_set(
            &self,
            _key: &str,
            _expected: Option<&str>,
            _new: &str,
        ) -> Result<bool, StoreError> {
            Err(StoreError::Unreachable("injected outage".to_string()))
        }

        async fn publish(&self, _channel: &str, _message: &str) -> Result<(), StoreError> {
            Err(StoreError::Unreachable("injected outage".to_string()))
        }

        async fn subscribe(&self, _channel: &str) -> Result<MessageStream, StoreError> {
            Err(StoreError::Unreachable("injected outage".to_string()))
        }
    }

    #[tokio::test]
    async fn test_unreachable_store_fails_every_operation() {
        let admission =
            AdmissionController::new(Arc::new(FailingStore), Duration::from_millis(10));

        assert!(admission.is_free("c").await.is_err());
        assert!(admission.acquire("c").await.is_err());
        assert!(admission.release("c", 1).await.is_err());
        assert!(admission.wait_until_available("c", 1).await.is_err());
    }
}
