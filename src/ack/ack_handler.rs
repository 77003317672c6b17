use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use rustc_hash::FxHashMap;
use tokio::sync::oneshot;
use tokio::time::{self, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::error::RelayError;
use crate::protocol::service_messages::AckStatus;


const SWEEP_INTERVAL: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
enum AckKind {
    Single,
    Multi,
}

struct AckEntry {
    kind: AckKind,
    expected: Option<usize>,
    current: usize,
    status: Option<AckStatus>,
    deadline: Instant,
    sender: oneshot::Sender<AckStatus>,
}
impl AckEntry {
    fn record(&mut self, status: AckStatus) {
        self.current += 1;
        // any Ok wins, otherwise the most recent status counts
        if self.status != Some(AckStatus::Ok) {
            self.status = Some(status);
        }
    }

    fn is_complete(&self) -> bool {
        match self.expected {
            Some(expected) => self.current >= expected,
            None => false,
        }
    }
}

/// The receiving side of an ack registration
pub struct AckWaiter {
    ack_id: u32,
    receiver: oneshot::Receiver<AckStatus>,
}

impl AckWaiter {
    pub fn ack_id(&self) -> u32 {
        self.ack_id
    }

    /// the final status if the ack is already resolved
    pub fn try_status(&mut self) -> Option<AckStatus> {
        self.receiver.try_recv().ok()
    }

    pub async fn wait(self) -> AckStatus {
        // the sender is only dropped without a value if the handler itself goes away
        self.receiver.await
            .unwrap_or(AckStatus::Timeout)
    }

    /// Waits for the ack, giving up when `cancel` fires. The entry stays registered and
    ///  resolves (or times out) on its own later.
    pub async fn wait_cancellable(self, cancel: &CancellationToken) -> anyhow::Result<AckStatus> {
        tokio::select! {
            status = self.wait() => Ok(status),
            _ = cancel.cancelled() => Err(RelayError::Cancelled.into()),
        }
    }

    /// Maps the final status to the result of an ackable write: `Ok` is true, `NotFound` is
    ///  false, everything else an error
    pub async fn wait_for_write_result(self, cancel: &CancellationToken) -> anyhow::Result<bool> {
        let ack_id = self.ack_id;
        match self.wait_cancellable(cancel).await? {
            AckStatus::Ok => Ok(true),
            AckStatus::NotFound => Ok(false),
            AckStatus::Timeout => Err(RelayError::AckTimeout(ack_id).into()),
            status => Err(RelayError::AckFailed(ack_id, status).into()),
        }
    }
}

/// Correlates requests with the acks the service sends back for them. Every entry resolves
///  exactly once: when the expected number of acks arrived, or with `Timeout` when its
///  deadline passes.
pub struct AckHandler {
    acks: Mutex<FxHashMap<u32, AckEntry>>,
    next_id: AtomicU32,
    ack_timeout: Duration,
}

impl AckHandler {
    /// Creates the handler and spawns its timeout sweeper, so this must be called from inside a
    ///  tokio runtime. The sweeper ends when the handler is dropped.
    pub fn new(ack_timeout: Duration) -> Arc<AckHandler> {
        let result = Arc::new(AckHandler {
            acks: Mutex::new(FxHashMap::default()),
            next_id: AtomicU32::new(1),
            ack_timeout,
        });

        tokio::spawn(Self::sweep_loop(Arc::downgrade(&result)));
        result
    }

    async fn sweep_loop(handler: Weak<AckHandler>) {
        let mut interval = time::interval(SWEEP_INTERVAL);
        interval.set_missed_tick_behavior(time::MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            match handler.upgrade() {
                Some(handler) => handler.check_timeouts(Instant::now()),
                None => break,
            }
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, FxHashMap<u32, AckEntry>> {
        self.acks.lock()
            .unwrap_or_else(|e| e.into_inner())
    }

    fn next_ack_id(&self) -> u32 {
        loop {
            let id = self.next_id.fetch_add(1, Ordering::Relaxed);
            if id != 0 {
                return id;
            }
        }
    }

    fn create(&self, kind: AckKind, expected: Option<usize>) -> AckWaiter {
        let (sender, receiver) = oneshot::channel();
        let ack_id = self.next_ack_id();
        self.lock().insert(ack_id, AckEntry {
            kind,
            expected,
            current: 0,
            status: None,
            deadline: Instant::now() + self.ack_timeout,
            sender,
        });
        trace!(ack_id, ?kind, "registered ack");

        AckWaiter {
            ack_id,
            receiver,
        }
    }

    pub fn create_single_ack(&self) -> AckWaiter {
        self.create(AckKind::Single, Some(1))
    }

    /// The expected count stays open until [AckHandler::set_expected_count] is called
    pub fn create_multi_ack(&self) -> AckWaiter {
        self.create(AckKind::Multi, None)
    }

    pub fn trigger_ack(&self, ack_id: u32) {
        self.trigger_ack_with_status(ack_id, AckStatus::Ok);
    }

    /// Unknown or already resolved ids are ignored
    pub fn trigger_ack_with_status(&self, ack_id: u32, status: AckStatus) {
        let mut acks = self.lock();
        let Some(entry) = acks.get_mut(&ack_id) else {
            debug!(ack_id, ?status, "ignoring ack for unknown id");
            return;
        };

        entry.record(status);
        if entry.is_complete() {
            if let Some(entry) = acks.remove(&ack_id) {
                Self::resolve(ack_id, entry);
            }
        }
    }

    pub fn set_expected_count(&self, ack_id: u32, expected: usize) -> anyhow::Result<()> {
        let mut acks = self.lock();
        let Some(entry) = acks.get_mut(&ack_id) else {
            debug!(ack_id, "ignoring expected count for unknown id");
            return Ok(());
        };

        if entry.kind == AckKind::Single {
            return Err(RelayError::InvalidAckOperation(format!("ack {} was created as a single ack", ack_id)).into());
        }
        if entry.expected.is_some() {
            return Err(RelayError::InvalidAckOperation(format!("expected count of ack {} is already set", ack_id)).into());
        }

        entry.expected = Some(expected);
        if entry.is_complete() {
            if let Some(entry) = acks.remove(&ack_id) {
                Self::resolve(ack_id, entry);
            }
        }
        Ok(())
    }

    /// Drops an entry without resolving it
    pub fn discard(&self, ack_id: u32) {
        self.lock().remove(&ack_id);
    }

    pub fn pending_count(&self) -> usize {
        self.lock().len()
    }

    fn check_timeouts(&self, now: Instant) {
        let mut acks = self.lock();
        let expired = acks.iter()
            .filter(|(_, entry)| entry.deadline <= now)
            .map(|(id, _)| *id)
            .collect::<Vec<_>>();

        for ack_id in expired {
            if let Some(mut entry) = acks.remove(&ack_id) {
                debug!(ack_id, current = entry.current, expected = ?entry.expected, "ack timed out");
                entry.status = Some(AckStatus::Timeout);
                Self::resolve(ack_id, entry);
            }
        }
    }

    fn resolve(ack_id: u32, entry: AckEntry) {
        let status = entry.status.unwrap_or(AckStatus::Ok);
        trace!(ack_id, ?status, "resolved ack");
        // the waiter may have given up already
        let _ = entry.sender.send(status);
    }
}

#[cfg(test)]
mod test {
    use rstest::rstest;

    use crate::error::relay_error;
    use super::*;

    fn handler() -> Arc<AckHandler> {
        AckHandler::new(Duration::from_secs(10))
    }

    #[tokio::test]
    async fn test_single_ack() {
        let handler = handler();
        let mut waiter = handler.create_single_ack();
        assert_eq!(waiter.try_status(), None);

        handler.trigger_ack(waiter.ack_id());
        assert_eq!(waiter.try_status(), Some(AckStatus::Ok));
        assert_eq!(handler.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_single_ack_with_status() {
        let handler = handler();
        let waiter = handler.create_single_ack();
        handler.trigger_ack_with_status(waiter.ack_id(), AckStatus::NotFound);
        assert_eq!(waiter.wait().await, AckStatus::NotFound);
    }

    #[tokio::test]
    async fn test_set_expected_count_on_single_ack_fails() {
        let handler = handler();
        let mut waiter = handler.create_single_ack();

        let err = handler.set_expected_count(waiter.ack_id(), 2).unwrap_err();
        assert!(matches!(relay_error(&err), Some(RelayError::InvalidAckOperation(_))));

        // the entry is unaffected
        handler.trigger_ack(waiter.ack_id());
        assert_eq!(waiter.try_status(), Some(AckStatus::Ok));
    }

    #[tokio::test]
    async fn test_set_expected_count_twice_fails() {
        let handler = handler();
        let waiter = handler.create_multi_ack();
        handler.set_expected_count(waiter.ack_id(), 2).unwrap();
        assert!(handler.set_expected_count(waiter.ack_id(), 3).is_err());
    }

    #[rstest]
    #[case::set_first(true)]
    #[case::triggers_first(false)]
    #[tokio::test]
    async fn test_multi_ack(#[case] set_first: bool) {
        let handler = handler();
        let mut waiter = handler.create_multi_ack();
        let id = waiter.ack_id();

        if set_first {
            handler.set_expected_count(id, 3).unwrap();
        }
        handler.trigger_ack(id);
        handler.trigger_ack(id);
        assert_eq!(waiter.try_status(), None);
        if !set_first {
            handler.set_expected_count(id, 3).unwrap();
            assert_eq!(waiter.try_status(), None);
        }
        handler.trigger_ack(id);
        assert_eq!(waiter.try_status(), Some(AckStatus::Ok));

        // late triggers are no-ops
        handler.trigger_ack(id);
        assert_eq!(handler.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_triggers_before_expected_count_resolve_synchronously() {
        let handler = handler();
        let mut waiter = handler.create_multi_ack();
        handler.trigger_ack(waiter.ack_id());
        handler.trigger_ack(waiter.ack_id());

        handler.set_expected_count(waiter.ack_id(), 2).unwrap();
        assert_eq!(waiter.try_status(), Some(AckStatus::Ok));
    }

    #[tokio::test]
    async fn test_multi_ack_without_expected_count_never_resolves_early() {
        let handler = handler();
        let mut waiter = handler.create_multi_ack();
        for _ in 0..10 {
            handler.trigger_ack(waiter.ack_id());
        }
        assert_eq!(waiter.try_status(), None);
    }

    #[rstest]
    #[case::ok_first(vec![AckStatus::Ok, AckStatus::NotFound], AckStatus::Ok)]
    #[case::ok_last(vec![AckStatus::NotFound, AckStatus::Ok], AckStatus::Ok)]
    #[case::all_not_found(vec![AckStatus::NotFound, AckStatus::NotFound], AckStatus::NotFound)]
    #[case::last_failure_wins(vec![AckStatus::NotFound, AckStatus::InternalServerError], AckStatus::InternalServerError)]
    #[tokio::test]
    async fn test_multi_ack_status_aggregation(#[case] statuses: Vec<AckStatus>, #[case] expected: AckStatus) {
        let handler = handler();
        let waiter = handler.create_multi_ack();
        handler.set_expected_count(waiter.ack_id(), statuses.len()).unwrap();
        for status in statuses {
            handler.trigger_ack_with_status(waiter.ack_id(), status);
        }
        assert_eq!(waiter.wait().await, expected);
    }

    #[tokio::test]
    async fn test_unknown_id_is_ignored() {
        let handler = handler();
        handler.trigger_ack(12345);
        handler.trigger_ack_with_status(0, AckStatus::NotFound);
        handler.set_expected_count(12345, 1).unwrap();
        assert_eq!(handler.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_ids_are_monotonic() {
        let handler = handler();
        let a = handler.create_single_ack();
        let b = handler.create_multi_ack();
        assert!(b.ack_id() > a.ack_id());
    }

    #[rstest]
    #[case::single(false, 0)]
    #[case::multi_partial(true, 1)]
    #[tokio::test(start_paused = true)]
    async fn test_timeout(#[case] multi: bool, #[case] triggers: usize) {
        let handler = AckHandler::new(Duration::from_secs(2));
        let mut waiter = if multi {
            let waiter = handler.create_multi_ack();
            handler.set_expected_count(waiter.ack_id(), 2).unwrap();
            waiter
        }
        else {
            handler.create_single_ack()
        };
        for _ in 0..triggers {
            handler.trigger_ack(waiter.ack_id());
        }

        time::sleep(Duration::from_millis(1500)).await;
        assert_eq!(waiter.try_status(), None);

        time::sleep(Duration::from_secs(1)).await;
        assert_eq!(waiter.try_status(), Some(AckStatus::Timeout));

        // resolved exactly once: a late trigger finds nothing
        handler.trigger_ack(waiter.ack_id());
        assert_eq!(handler.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_wait_cancellable() {
        let handler = handler();
        let waiter = handler.create_single_ack();
        let id = waiter.ack_id();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = waiter.wait_cancellable(&cancel).await.unwrap_err();
        assert_eq!(relay_error(&err), Some(&RelayError::Cancelled));

        // the entry still resolves later without anyone listening
        assert_eq!(handler.pending_count(), 1);
        handler.trigger_ack(id);
        assert_eq!(handler.pending_count(), 0);
    }

    #[rstest]
    #[case::ok(AckStatus::Ok, Some(true))]
    #[case::not_found(AckStatus::NotFound, Some(false))]
    #[case::timeout(AckStatus::Timeout, None)]
    #[case::error(AckStatus::InternalServerError, None)]
    #[tokio::test]
    async fn test_wait_for_write_result(#[case] status: AckStatus, #[case] expected: Option<bool>) {
        let handler = handler();
        let waiter = handler.create_single_ack();
        handler.trigger_ack_with_status(waiter.ack_id(), status);

        let result = waiter.wait_for_write_result(&CancellationToken::new()).await;
        match expected {
            Some(expected) => assert_eq!(result.unwrap(), expected),
            None => assert!(result.is_err()),
        }
    }

    #[tokio::test]
    async fn test_dropped_handler_times_out_waiters() {
        let handler = handler();
        let waiter = handler.create_single_ack();
        drop(handler);
        assert_eq!(waiter.wait().await, AckStatus::Timeout);
    }
}
