//! Matches asynchronous completions from the radio stack with the callers
//! waiting on them.
//!
//! Each submitted [`Operation`] is identified by a key (for example "read
//! characteristic X on link Y"). A caller registers interest in that key, the
//! operation's `run` closure kicks off the radio request, and the caller then
//! waits until a callback reports a completion for the same key, or until its
//! own deadline passes.
//!
//! Several callers may wait on the same key at once and are all released by a
//! single completion. Completions that arrive when nobody is waiting are
//! dropped, so an identity is effectively single-shot: submitting it again is a
//! fresh operation.
//!
//! Retries are not built in; callers loop and decide which failures are worth
//! retrying. A [`Error::Timeout`] is reported distinctly from an
//! [`Error::Gatt`] failure so that decision is possible.

use std::fmt;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use log::{debug, trace};
use tokio::sync::oneshot;

use crate::{Error, GattError, GattStatus, Result};

/// What a waiter is released with
pub type Completion<V> = std::result::Result<Option<V>, GattError>;

/// A unit of work submitted to an [`Executor`]
pub struct Operation<K> {
    key: K,
    run: Box<dyn FnOnce() -> Result<()> + Send>,
    on_cancel: Option<Box<dyn FnOnce() + Send>>,
}

impl<K> Operation<K> {
    /// `run` is expected to trigger the underlying asynchronous radio request.
    ///
    /// If it fails, nothing is left registered and the error is handed straight
    /// back to the submitter.
    pub fn new<F>(key: K, run: F) -> Self
        where F: FnOnce() -> Result<()> + Send + 'static
    {
        Self {
            key,
            run: Box::new(run),
            on_cancel: None,
        }
    }

    /// A side effect to run (once) if the submission is explicitly cancelled
    pub fn on_cancel<F>(mut self, on_cancel: F) -> Self
        where F: FnOnce() + Send + 'static
    {
        self.on_cancel = Some(Box::new(on_cancel));
        self
    }

    pub fn key(&self) -> &K {
        &self.key
    }
}

impl<K: fmt::Debug> fmt::Debug for Operation<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Operation")
            .field("key", &self.key)
            .field("cancellable", &self.on_cancel.is_some())
            .finish()
    }
}

/// An operation identity.
///
/// Identities usually embed something short-lived (a link, an attribute
/// handle) so long-running totals are kept per [`kind`](Self::kind) instead.
pub trait OperationKey: Eq + Hash + Clone + fmt::Debug {
    fn kind(&self) -> &'static str;
}

struct Waiter<V> {
    id: u64,
    tx: oneshot::Sender<Completion<V>>,
}

pub struct Executor<K, V>
    where K: Eq + Hash
{
    // Keyed by operation identity, with every caller currently waiting on it
    pending: DashMap<K, Vec<Waiter<V>>>,

    // Per identity, until forgotten
    submissions: DashMap<K, usize>,
    submissions_by_kind: DashMap<&'static str, usize>,
    next_waiter_id: AtomicU64,
    notifications: AtomicUsize,
}

impl<K, V> fmt::Debug for Executor<K, V>
    where K: Eq + Hash
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Executor")
            .field("pending_keys", &self.pending.len())
            .field("tracked_keys", &self.submissions.len())
            .field("notifications", &self.notifications.load(Ordering::Relaxed))
            .finish()
    }
}

impl<K, V> Default for Executor<K, V>
    where K: OperationKey,
          V: Clone
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V> Executor<K, V>
    where K: OperationKey,
          V: Clone
{
    pub fn new() -> Self {
        Self {
            pending: DashMap::new(),
            submissions: DashMap::new(),
            submissions_by_kind: DashMap::new(),
            next_waiter_id: AtomicU64::new(0),
            notifications: AtomicUsize::new(0),
        }
    }

    /// Registers the operation as pending and runs it, without waiting.
    ///
    /// The returned [`Submission`] is used to wait for the completion, or to
    /// cancel it.
    pub fn submit(&self, op: Operation<K>) -> Result<Submission<'_, K, V>> {
        let Operation { key, run, on_cancel } = op;

        let waiter_id = self.next_waiter_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();

        // The registration has to be in place before run() since the
        // completion may race back from a radio thread before run() returns
        self.pending
            .entry(key.clone())
            .or_insert_with(Vec::new)
            .push(Waiter { id: waiter_id, tx });
        self.count_submission(&key);

        trace!("Submitting {:?}", key);
        if let Err(err) = run() {
            debug!("{:?} failed to start: {}", key, err);
            self.deregister(&key, waiter_id);
            return Err(err);
        }

        Ok(Submission {
            executor: self,
            key,
            waiter_id,
            rx: Some(rx),
            on_cancel,
        })
    }

    /// Submits `op` and waits for its completion, or until `timeout` elapses.
    ///
    /// With no timeout the caller waits until a completion (or a cancellation)
    /// is delivered.
    pub async fn execute(&self, op: Operation<K>, timeout: Option<Duration>) -> Result<Option<V>> {
        let mut submission = self.submit(op)?;
        submission.wait(timeout).await
    }

    /// As [`Self::execute`] but a completion without a value is an error
    pub async fn execute_nonnull(&self, op: Operation<K>, timeout: Option<Duration>) -> Result<V> {
        let key = op.key().clone();
        self.execute(op, timeout)
            .await?
            .ok_or_else(|| Error::MissingResult(format!("{:?}", key)))
    }

    /// Runs a synchronous closure under the executor's bookkeeping.
    ///
    /// This is for idempotent state queries (such as "are services already
    /// cached?") that never involve the radio.
    pub fn execute_sync<T, F>(&self, key: K, f: F) -> Result<Option<T>>
        where F: FnOnce() -> Result<Option<T>>
    {
        trace!("Running {:?} synchronously", key);
        self.count_submission(&key);
        f()
    }

    pub fn execute_sync_nonnull<T, F>(&self, key: K, f: F) -> Result<T>
        where F: FnOnce() -> Result<Option<T>>
    {
        let label = format!("{:?}", key);
        self.execute_sync(key, f)?
            .ok_or(Error::MissingResult(label))
    }

    /// Completes `key` according to a raw status code.
    ///
    /// Returns whether any waiter was released.
    pub fn notify_completion(&self, key: &K, status: GattStatus, value: Option<V>) -> bool {
        if status.is_success() {
            self.notify_success(key, value)
        } else {
            self.notify_failure(key, GattError::from(status))
        }
    }

    pub fn notify_success(&self, key: &K, value: Option<V>) -> bool {
        self.release(key, Ok(value))
    }

    pub fn notify_failure(&self, key: &K, error: GattError) -> bool {
        self.release(key, Err(error))
    }

    /// Fails every pending operation whose key matches `predicate`.
    ///
    /// Returns the number of keys that were completed.
    pub fn notify_failure_where<P>(&self, predicate: P, error: GattError) -> usize
        where P: Fn(&K) -> bool
    {
        let keys: Vec<K> = self.pending
                               .iter()
                               .filter(|entry| predicate(entry.key()))
                               .map(|entry| entry.key().clone())
                               .collect();
        keys.iter()
            .filter(|key| self.notify_failure(key, error.clone()))
            .count()
    }

    fn count_submission(&self, key: &K) {
        *self.submissions.entry(key.clone()).or_insert(0) += 1;
        *self.submissions_by_kind.entry(key.kind()).or_insert(0) += 1;
    }

    /// Drops the per-identity submission counts for every key matching
    /// `predicate`, such as those belonging to a link that has been torn down.
    ///
    /// Totals per kind are kept.
    pub fn forget_where<P>(&self, predicate: P)
        where P: Fn(&K) -> bool
    {
        self.submissions.retain(|key, _| !predicate(key));
    }

    fn release(&self, key: &K, completion: Completion<V>) -> bool {
        self.notifications.fetch_add(1, Ordering::Relaxed);
        match self.pending.remove(key) {
            Some((_, waiters)) => {
                trace!("Completing {:?} for {} waiter(s)", key, waiters.len());
                for waiter in waiters {
                    // The receiver may have just been dropped by a caller that gave up
                    let _ = waiter.tx.send(completion.clone());
                }
                true
            }
            None => {
                trace!("Dropping completion for {:?}: nobody is waiting", key);
                false
            }
        }
    }

    fn deregister(&self, key: &K, waiter_id: u64) {
        let now_empty = match self.pending.get_mut(key) {
            Some(mut waiters) => {
                waiters.retain(|waiter| waiter.id != waiter_id);
                waiters.is_empty()
            }
            None => false,
        };
        if now_empty {
            self.pending.remove_if(key, |_, waiters| waiters.is_empty());
        }
    }

    pub fn is_pending(&self, key: &K) -> bool {
        self.pending.contains_key(key)
    }

    /// The number of callers currently waiting, across all keys
    pub fn pending_count(&self) -> usize {
        self.pending.iter().map(|entry| entry.value().len()).sum()
    }

    /// How many times `key` has been submitted (asynchronously or not)
    pub fn submission_count(&self, key: &K) -> usize {
        self.submissions.get(key).map(|count| *count).unwrap_or(0)
    }

    /// How many operations of the given kind have ever been submitted,
    /// including those whose identities were forgotten
    pub fn submission_count_of_kind(&self, kind: &str) -> usize {
        self.submissions_by_kind.get(kind).map(|count| *count).unwrap_or(0)
    }

    /// Sums [`Self::submission_count`] over the identities still tracked
    pub fn submission_count_where<P>(&self, predicate: P) -> usize
        where P: Fn(&K) -> bool
    {
        self.submissions
            .iter()
            .filter(|entry| predicate(entry.key()))
            .map(|entry| *entry.value())
            .sum()
    }

    /// The number of completion notifications received, whether or not
    /// anybody was waiting for them
    pub fn notification_count(&self) -> usize {
        self.notifications.load(Ordering::Relaxed)
    }
}

/// A registered, running operation
///
/// Dropping a submission that hasn't resolved removes its registration, so a
/// late completion can't be delivered to a caller that stopped listening.
pub struct Submission<'a, K, V>
    where K: OperationKey,
          V: Clone
{
    executor: &'a Executor<K, V>,
    key: K,
    waiter_id: u64,
    rx: Option<oneshot::Receiver<Completion<V>>>,
    on_cancel: Option<Box<dyn FnOnce() + Send>>,
}

impl<'a, K, V> Submission<'a, K, V>
    where K: OperationKey,
          V: Clone
{
    pub fn key(&self) -> &K {
        &self.key
    }

    /// Waits for the completion of this submission.
    ///
    /// A timed out wait removes its own registration before returning. If a
    /// completion landed in the meantime it's still returned rather than being
    /// reported as a timeout.
    pub async fn wait(&mut self, timeout: Option<Duration>) -> Result<Option<V>> {
        let rx = match self.rx.as_mut() {
            Some(rx) => rx,
            None => return Err(Error::Cancelled),
        };

        let received = match timeout {
            Some(timeout) => match tokio::time::timeout(timeout, &mut *rx).await {
                Ok(received) => received,
                Err(_elapsed) => {
                    self.executor.deregister(&self.key, self.waiter_id);
                    match rx.try_recv() {
                        Ok(completion) => Ok(completion),
                        Err(_) => {
                            self.rx = None;
                            debug!("{:?} timed out after {:?}", self.key, timeout);
                            return Err(Error::Timeout {
                                operation: format!("{:?}", self.key),
                                timeout,
                            });
                        }
                    }
                }
            },
            None => (&mut *rx).await,
        };
        self.rx = None;

        match received {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(err)) => Err(Error::Gatt(err)),
            Err(_) => Err(Error::Cancelled),
        }
    }

    /// Removes the registration and runs the operation's cancellation side
    /// effect, if it has one.
    pub fn cancel(mut self) {
        self.executor.deregister(&self.key, self.waiter_id);
        self.rx = None;
        if let Some(on_cancel) = self.on_cancel.take() {
            debug!("Cancelling {:?}", self.key);
            on_cancel();
        }
    }
}

impl<'a, K, V> Drop for Submission<'a, K, V>
    where K: OperationKey,
          V: Clone
{
    fn drop(&mut self) {
        if self.rx.is_some() {
            self.executor.deregister(&self.key, self.waiter_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    type TestExecutor = Executor<&'static str, u32>;

    impl OperationKey for &'static str {
        fn kind(&self) -> &'static str {
            let key: &'static str = self;
            key.rsplit('/').next().unwrap_or(key)
        }
    }

    impl OperationKey for (u32, &'static str) {
        fn kind(&self) -> &'static str {
            self.1
        }
    }

    fn noop(key: &'static str) -> Operation<&'static str> {
        Operation::new(key, || Ok(()))
    }

    #[tokio::test]
    async fn completion_releases_every_waiter() {
        let executor = TestExecutor::new();
        let mut first = executor.submit(noop("discover")).unwrap();
        let mut second = executor.submit(noop("discover")).unwrap();
        assert_eq!(executor.pending_count(), 2);

        assert!(executor.notify_success(&"discover", Some(7)));

        assert_eq!(first.wait(Some(Duration::from_secs(1))).await.unwrap(), Some(7));
        assert_eq!(second.wait(Some(Duration::from_secs(1))).await.unwrap(), Some(7));
        assert_eq!(executor.pending_count(), 0);
        assert_eq!(executor.submission_count(&"discover"), 2);
    }

    #[tokio::test]
    async fn completion_from_another_task() {
        let executor = Arc::new(TestExecutor::new());
        let notifier = executor.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            notifier.notify_completion(&"rssi", GattStatus::SUCCESS, Some(42));
        });

        let value = executor.execute_nonnull(noop("rssi"), Some(Duration::from_secs(5))).await;
        assert_eq!(value.unwrap(), 42);
    }

    #[tokio::test]
    async fn failure_status_is_reported_as_gatt_error() {
        let executor = TestExecutor::new();
        let mut submission = executor.submit(noop("read")).unwrap();
        executor.notify_completion(&"read", GattStatus::INTERNAL_ERROR, Some(1));

        let err = submission.wait(None).await.unwrap_err();
        assert!(matches!(err, Error::Gatt(GattError::InternalError)));
    }

    #[tokio::test]
    async fn timeout_removes_registration() {
        let executor = TestExecutor::new();
        let err = executor.execute(noop("write"), Some(Duration::from_millis(10)))
                          .await
                          .unwrap_err();
        assert!(err.is_timeout());
        assert_eq!(executor.pending_count(), 0);
        assert!(!executor.notify_success(&"write", None));
    }

    #[tokio::test]
    async fn completion_before_wait_is_not_lost() {
        let executor = TestExecutor::new();
        let mut submission = executor.submit(noop("mtu")).unwrap();
        executor.notify_success(&"mtu", Some(247));
        assert_eq!(submission.wait(Some(Duration::from_millis(1))).await.unwrap(), Some(247));
    }

    #[tokio::test]
    async fn failing_run_leaves_nothing_registered() {
        let executor = TestExecutor::new();
        let op = Operation::new("connect", || Err(Error::PeripheralUnreachable));
        let err = executor.execute(op, Some(Duration::from_secs(1))).await.unwrap_err();
        assert!(matches!(err, Error::PeripheralUnreachable));
        assert_eq!(executor.pending_count(), 0);
        assert!(!executor.is_pending(&"connect"));
    }

    #[tokio::test]
    async fn second_completion_is_a_noop() {
        let executor = TestExecutor::new();
        let mut submission = executor.submit(noop("read")).unwrap();
        assert!(executor.notify_success(&"read", Some(1)));
        assert!(!executor.notify_success(&"read", Some(2)));
        assert_eq!(submission.wait(None).await.unwrap(), Some(1));
        assert_eq!(executor.notification_count(), 2);
    }

    #[tokio::test]
    async fn cancel_runs_side_effect_once() {
        let executor = TestExecutor::new();
        let cancelled = Arc::new(AtomicUsize::new(0));
        let counter = cancelled.clone();
        let op = noop("connect").on_cancel(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        let submission = executor.submit(op).unwrap();
        submission.cancel();
        assert_eq!(cancelled.load(Ordering::SeqCst), 1);

        // A late completion finds nobody to release
        assert!(!executor.notify_success(&"connect", None));
        assert_eq!(cancelled.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn dropped_submission_deregisters() {
        let executor = TestExecutor::new();
        let submission = executor.submit(noop("scan")).unwrap();
        assert!(executor.is_pending(&"scan"));
        drop(submission);
        assert!(!executor.is_pending(&"scan"));
    }

    #[tokio::test]
    async fn nonnull_rejects_empty_completion() {
        let executor = TestExecutor::new();
        let mut submission = executor.submit(noop("read")).unwrap();
        executor.notify_success(&"read", None);
        assert_eq!(submission.wait(None).await.unwrap(), None);

        let executor = Arc::new(TestExecutor::new());
        let notifier = executor.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            notifier.notify_success(&"read", None);
        });
        let err = executor.execute_nonnull(noop("read"), Some(Duration::from_secs(5)))
                          .await
                          .unwrap_err();
        assert!(matches!(err, Error::MissingResult(_)));
    }

    #[test]
    fn failure_where_only_touches_matching_keys() {
        let executor = TestExecutor::new();
        let _a = executor.submit(noop("link1/read")).unwrap();
        let _b = executor.submit(noop("link1/write")).unwrap();
        let _c = executor.submit(noop("link2/read")).unwrap();

        let failed = executor.notify_failure_where(|key| key.starts_with("link1/"),
                                                   GattError::Disconnected);
        assert_eq!(failed, 2);
        assert!(executor.is_pending(&"link2/read"));
    }

    #[tokio::test]
    async fn forgotten_keys_stop_being_tracked() {
        let executor = Executor::<(u32, &'static str), u32>::new();
        for link in 0..1000 {
            let mut submission = executor.submit(Operation::new((link, "read"), || Ok(()))).unwrap();
            executor.notify_success(&(link, "read"), Some(link));
            assert_eq!(submission.wait(None).await.unwrap(), Some(link));
            executor.forget_where(|key| key.0 == link);
        }

        assert_eq!(executor.pending_count(), 0);
        assert_eq!(executor.submissions.len(), 0);
        assert_eq!(executor.submission_count(&(7, "read")), 0);
        assert_eq!(executor.submission_count_of_kind("read"), 1000);
    }

    #[test]
    fn forget_only_touches_matching_keys() {
        let executor = TestExecutor::new();
        executor.execute_sync("link1/read", || Ok(Some(1))).unwrap();
        executor.execute_sync("link2/read", || Ok(Some(2))).unwrap();

        executor.forget_where(|key| key.starts_with("link1/"));
        assert_eq!(executor.submission_count(&"link1/read"), 0);
        assert_eq!(executor.submission_count(&"link2/read"), 1);
        assert_eq!(executor.submission_count_where(|key| key.ends_with("/read")), 1);
        assert_eq!(executor.submission_count_of_kind("read"), 2);
    }

    #[test]
    fn sync_execution_is_counted() {
        let executor = TestExecutor::new();
        let value = executor.execute_sync("cached", || Ok(Some(3))).unwrap();
        assert_eq!(value, Some(3));
        let err = executor.execute_sync_nonnull::<u32, _>("cached", || Ok(None)).unwrap_err();
        assert!(matches!(err, Error::MissingResult(_)));
        assert_eq!(executor.submission_count(&"cached"), 2);
    }
}
