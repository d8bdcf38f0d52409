//! Poll a remote object until it settles in a target state.
//!
//! A [`WaitSpec`] is built fresh for every mutating call: the labels that
//! mean "still in progress", the labels that mean "done", the refresh
//! closure and the timing. [`wait_for_state`] drives it:
//!
//! ```text
//! sleep(initial_delay)
//! loop until deadline:
//!     refresh()   (cut off at the deadline)
//!       error     → NotFound: success if "deleted" is a target, else fail
//!                   retryable: poll again
//!                   otherwise: fail
//!       target    → success
//!       pending   → sleep(poll_interval)
//!       otherwise → fail with UnexpectedState (never retried)
//! deadline → fail with Timeout carrying the last observed label
//! ```
//!
//! The engine has no cancellation signal of its own. A refresh closure that
//! notices its caller was cancelled returns [`ApiError::cancelled`], which is
//! fatal and stops the loop. Dropping the returned future also stops it.

use std::collections::HashSet;
use std::future::Future;
use std::time::Duration;

use futures::FutureExt;
use futures::future::BoxFuture;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::classify::{ApiError, Classifier, Outcome};
use crate::error::{ReconcileError, Subject};
use crate::label::{self, Label};

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(600);
pub const DEFAULT_INITIAL_DELAY: Duration = Duration::from_secs(10);
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// One refresh result: the current snapshot and its state label.
#[derive(Debug, Clone, PartialEq)]
pub struct Observation<T, L> {
    pub snapshot: T,
    pub label: L,
}

impl<T, L> Observation<T, L> {
    pub fn new(snapshot: T, label: L) -> Self {
        Self { snapshot, label }
    }
}

/// Boxed refresh closure.
pub type RefreshFn<'a, T, L> =
    Box<dyn FnMut() -> BoxFuture<'a, Result<Observation<T, L>, ApiError>> + Send + 'a>;

/// Describes one polling operation.
pub struct WaitSpec<'a, T, L: Label> {
    subject: Subject,
    pending: HashSet<L>,
    target: HashSet<L>,
    refresh: RefreshFn<'a, T, L>,
    timeout: Duration,
    initial_delay: Duration,
    poll_interval: Duration,
    classifier: Classifier,
    target_occurrences: u32,
}

impl<'a, T, L> WaitSpec<'a, T, L>
where
    T: Send + 'a,
    L: Label + 'a,
{
    /// Wait for `subject` to reach one of `target`, observed through `refresh`.
    ///
    /// Pending labels default to empty, meaning any non-target label keeps
    /// the wait going.
    pub fn new<F, Fut>(subject: Subject, target: impl IntoIterator<Item = L>, mut refresh: F) -> Self
    where
        F: FnMut() -> Fut + Send + 'a,
        Fut: Future<Output = Result<Observation<T, L>, ApiError>> + Send + 'a,
    {
        Self {
            subject,
            pending: HashSet::new(),
            target: target.into_iter().collect(),
            refresh: Box::new(move || refresh().boxed()),
            timeout: DEFAULT_TIMEOUT,
            initial_delay: DEFAULT_INITIAL_DELAY,
            poll_interval: DEFAULT_POLL_INTERVAL,
            classifier: Classifier::default(),
            target_occurrences: 1,
        }
    }
}

impl<'a, T, L: Label> WaitSpec<'a, T, L> {
    pub fn pending(mut self, pending: impl IntoIterator<Item = L>) -> Self {
        self.pending = pending.into_iter().collect();
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn classifier(mut self, classifier: Classifier) -> Self {
        self.classifier = classifier;
        self
    }

    /// Require the target to be seen on this many consecutive polls.
    pub fn target_occurrences(mut self, n: u32) -> Self {
        self.target_occurrences = n.max(1);
        self
    }

    fn validate(&self) -> Result<(), ReconcileError> {
        if self.target.is_empty() {
            return Err(self.subject.invalid_wait("no target states"));
        }
        let overlap: HashSet<L> = self.target.intersection(&self.pending).cloned().collect();
        if !overlap.is_empty() {
            return Err(self.subject.invalid_wait(format!(
                "states {} are both pending and target",
                label::describe(&overlap)
            )));
        }
        Ok(())
    }

    fn is_pending(&self, label: &L) -> bool {
        self.pending.is_empty() || self.pending.contains(label)
    }
}

/// Poll until the object reaches a target state.
///
/// Returns the snapshot that carried the target label, or `None` when the
/// object disappeared while `"deleted"` was a target.
pub async fn wait_for_state<T, L: Label>(
    mut spec: WaitSpec<'_, T, L>,
) -> Result<Option<T>, ReconcileError> {
    spec.validate()?;

    let started = Instant::now();
    let deadline = started + spec.timeout;
    let target = label::describe(&spec.target);
    let mut last_label: Option<L> = None;
    let mut target_seen = 0u32;
    let mut polls = 0u32;

    debug!(
        "Waiting for {} to reach {} (timeout {:?})",
        spec.subject, target, spec.timeout
    );

    if !spec.initial_delay.is_zero() {
        tokio::time::sleep_until((started + spec.initial_delay).min(deadline)).await;
    }

    loop {
        polls += 1;

        let refreshed = match tokio::time::timeout_at(deadline, (spec.refresh)()).await {
            Ok(result) => result,
            Err(_) => {
                warn!(
                    "Refresh of {} still running at the deadline (poll {})",
                    spec.subject, polls
                );
                return Err(spec.subject.timeout(
                    spec.timeout,
                    target,
                    last_label.map(|l| l.to_string()),
                ));
            }
        };

        match refreshed {
            Ok(Observation { snapshot, label }) => {
                debug!("{} is {} (poll {})", spec.subject, label, polls);

                if spec.target.contains(&label) {
                    target_seen += 1;
                    if target_seen >= spec.target_occurrences {
                        info!(
                            "{} reached {} after {} polls in {:?}",
                            spec.subject,
                            label,
                            polls,
                            started.elapsed()
                        );
                        return Ok(Some(snapshot));
                    }
                } else if spec.is_pending(&label) {
                    target_seen = 0;
                } else {
                    warn!(
                        "{} entered unexpected state {} while waiting for {}",
                        spec.subject, label, target
                    );
                    return Err(spec.subject.unexpected_state(&label, target));
                }
                last_label = Some(label);
            }
            Err(err) => match spec.classifier.classify(&err) {
                Outcome::NotFound if spec.target.contains(&L::deleted()) => {
                    info!("{} is gone after {} polls", spec.subject, polls);
                    return Ok(None);
                }
                outcome if outcome.is_retryable() => {
                    warn!(
                        "Refresh of {} failed ({}), polling again: {}",
                        spec.subject, outcome, err
                    );
                    target_seen = 0;
                }
                outcome => return Err(spec.subject.remote(outcome, err)),
            },
        }

        let now = Instant::now();
        if now >= deadline {
            return Err(spec.subject.timeout(
                spec.timeout,
                target,
                last_label.map(|l| l.to_string()),
            ));
        }
        tokio::time::sleep(spec.poll_interval.min(deadline - now)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::{Arc, Mutex};

    type Step = Result<&'static str, ApiError>;

    /// Refresh closure replaying `steps`, repeating the last one forever.
    fn scripted(
        steps: Vec<Step>,
    ) -> (
        Arc<AtomicU32>,
        impl FnMut() -> futures::future::Ready<Result<Observation<u32, &'static str>, ApiError>>
        + Send
        + 'static,
    ) {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        let steps = Arc::new(Mutex::new(VecDeque::from(steps)));
        let refresh = move || {
            let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
            let mut steps = steps.lock().unwrap();
            let step = if steps.len() > 1 {
                steps.pop_front().unwrap()
            } else {
                steps.front().cloned().unwrap()
            };
            futures::future::ready(step.map(|label| Observation::new(n, label)))
        };
        (calls, refresh)
    }

    fn subject() -> Subject {
        Subject::new("volume v-1", "create")
    }

    #[tokio::test(start_paused = true)]
    async fn test_target_on_first_poll_does_not_sleep() {
        let (calls, refresh) = scripted(vec![Ok("available")]);
        let start = Instant::now();

        let spec = WaitSpec::new(subject(), ["available"], refresh)
            .pending(["creating"])
            .initial_delay(Duration::ZERO);

        assert_eq!(wait_for_state(spec).await.unwrap(), Some(1));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(start.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_eventual_success_polls_k_plus_one_times() {
        let k = 4;
        let mut steps: Vec<Step> = vec![Ok("creating"); k];
        steps.push(Ok("available"));
        let (calls, refresh) = scripted(steps);

        let spec = WaitSpec::new(subject(), ["available"], refresh)
            .pending(["creating"])
            .initial_delay(Duration::from_secs(2))
            .poll_interval(Duration::from_secs(5))
            .timeout(Duration::from_secs(60));

        let start = Instant::now();
        assert_eq!(wait_for_state(spec).await.unwrap(), Some(k as u32 + 1));
        assert_eq!(calls.load(Ordering::SeqCst), k as u32 + 1);
        assert_eq!(start.elapsed(), Duration::from_secs(2 + 5 * k as u64));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_carries_last_label() {
        let (_, refresh) = scripted(vec![Ok("creating")]);
        let spec = WaitSpec::new(subject(), ["available"], refresh)
            .pending(["creating"])
            .initial_delay(Duration::from_secs(3))
            .poll_interval(Duration::from_secs(7))
            .timeout(Duration::from_secs(30));

        let start = Instant::now();
        let err = wait_for_state(spec).await.unwrap_err();

        assert!(start.elapsed() <= Duration::from_secs(3 + 30));
        match err {
            ReconcileError::Timeout {
                last_label,
                timeout,
                ..
            } => {
                assert_eq!(last_label.as_deref(), Some("creating"));
                assert_eq!(timeout, Duration::from_secs(30));
            }
            other => panic!("expected timeout, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_refresh_is_cut_off_at_deadline() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        let refresh = move || {
            let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
            async move {
                if n > 1 {
                    tokio::time::sleep(Duration::from_secs(3600)).await;
                }
                Ok(Observation::new(n, "creating"))
            }
        };
        let spec = WaitSpec::new(subject(), ["available"], refresh)
            .pending(["creating"])
            .initial_delay(Duration::ZERO)
            .poll_interval(Duration::from_secs(1))
            .timeout(Duration::from_secs(10));

        let start = Instant::now();
        let err = wait_for_state(spec).await.unwrap_err();

        assert_eq!(start.elapsed(), Duration::from_secs(10));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert!(matches!(err, ReconcileError::Timeout { .. }));
        assert_eq!(err.last_label(), Some("creating"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_not_found_satisfies_deleted_target() {
        let (calls, refresh) = scripted(vec![
            Ok("deleting"),
            Ok("deleting"),
            Err(ApiError::not_found("no such volume")),
        ]);
        let spec = WaitSpec::new(subject(), ["deleted"], refresh)
            .pending(["deleting", "available"])
            .initial_delay(Duration::ZERO)
            .poll_interval(Duration::from_secs(1));

        assert_eq!(wait_for_state(spec).await.unwrap(), None);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_not_found_is_fatal_otherwise() {
        let (calls, refresh) = scripted(vec![Err(ApiError::not_found("no such volume"))]);
        let spec = WaitSpec::new(subject(), ["active"], refresh).initial_delay(Duration::ZERO);

        let start = Instant::now();
        let err = wait_for_state(spec).await.unwrap_err();
        assert!(err.is_not_found());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(start.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unexpected_state_is_not_retried() {
        let (calls, refresh) = scripted(vec![Ok("error"), Ok("available")]);
        let spec = WaitSpec::new(subject(), ["available"], refresh)
            .pending(["creating"])
            .initial_delay(Duration::ZERO);

        let err = wait_for_state(spec).await.unwrap_err();
        assert!(matches!(
            err,
            ReconcileError::UnexpectedState { ref label, .. } if label == "error"
        ));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_empty_pending_accepts_any_label() {
        let (calls, refresh) = scripted(vec![Ok("queued"), Ok("building"), Ok("active")]);
        let spec = WaitSpec::new(subject(), ["active"], refresh)
            .initial_delay(Duration::ZERO)
            .poll_interval(Duration::from_secs(1));

        assert!(wait_for_state(spec).await.is_ok());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_refresh_errors_keep_polling() {
        let (calls, refresh) = scripted(vec![
            Ok("creating"),
            Err(ApiError::new(502, "bad gateway")),
            Err(ApiError::unavailable("maintenance")),
            Ok("available"),
        ]);
        let spec = WaitSpec::new(subject(), ["available"], refresh)
            .pending(["creating"])
            .initial_delay(Duration::ZERO)
            .poll_interval(Duration::from_secs(1));

        assert_eq!(wait_for_state(spec).await.unwrap(), Some(4));
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fatal_refresh_error_stops() {
        let (calls, refresh) = scripted(vec![Ok("creating"), Err(ApiError::cancelled())]);
        let spec = WaitSpec::new(subject(), ["available"], refresh)
            .pending(["creating"])
            .initial_delay(Duration::ZERO)
            .poll_interval(Duration::from_secs(1));

        let err = wait_for_state(spec).await.unwrap_err();
        assert!(matches!(err, ReconcileError::Fatal { .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_target_occurrences() {
        let (calls, refresh) = scripted(vec![
            Ok("available"),
            Ok("creating"),
            Ok("available"),
            Ok("available"),
        ]);
        let spec = WaitSpec::new(subject(), ["available"], refresh)
            .pending(["creating"])
            .initial_delay(Duration::ZERO)
            .poll_interval(Duration::from_secs(1))
            .target_occurrences(2);

        assert_eq!(wait_for_state(spec).await.unwrap(), Some(4));
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_invalid_specs_never_refresh() {
        let (calls, refresh) = scripted(vec![Ok("available")]);
        let spec = WaitSpec::new(subject(), ["available"], refresh)
            .pending(["creating", "available"]);
        let err = wait_for_state(spec).await.unwrap_err();
        assert!(matches!(err, ReconcileError::InvalidWait { .. }));

        let (_, refresh2) = scripted(vec![Ok("available")]);
        let spec = WaitSpec::new(subject(), Vec::<&'static str>::new(), refresh2);
        let err = wait_for_state(spec).await.unwrap_err();
        assert!(matches!(err, ReconcileError::InvalidWait { .. }));

        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }
}
