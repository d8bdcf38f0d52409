//! Ordered, state-gated phases against one composite object.
//!
//! A composite update (upgrade a cluster template, resize its masters, turn
//! it off) is declared as a list of [`Phase`]s. The [`PhaseRunner`] walks
//! the list strictly in order:
//!
//! 1. Read the object's label once.
//! 2. For each phase, check its gate against the *current* label. A failed
//!    gate aborts with `Prohibited` (or skips the phase if it is optional).
//! 3. Issue the mutation and wait for the phase's target state. Any failure
//!    aborts the remaining phases; nothing is rolled back.
//! 4. Re-read the label before the next phase.
//!
//! Phase n+1 never starts before phase n's wait has returned.

use std::future::Future;

use futures::FutureExt;
use futures::future::BoxFuture;
use tracing::{debug, info, warn};

use crate::classify::{ApiError, Classifier};
use crate::error::{ReconcileError, Subject};
use crate::label::Label;
use crate::retry::{RetryConfig, retry_mutation};
use crate::wait::{WaitSpec, wait_for_state};

type MutateFn<'a> = Box<dyn FnMut() -> BoxFuture<'a, Result<(), ApiError>> + Send + 'a>;
type Predicate<'a, L> = Box<dyn Fn(&L) -> bool + Send + Sync + 'a>;
type ReadLabelFn<'a, L> = Box<dyn FnMut() -> BoxFuture<'a, Result<L, ApiError>> + Send + 'a>;

/// One optional step of a composite update.
pub struct Phase<'a, T, L: Label> {
    name: &'static str,
    mutate: MutateFn<'a>,
    wait: WaitSpec<'a, T, L>,
    gate: Option<Predicate<'a, L>>,
    done: Option<Predicate<'a, L>>,
    mandatory: bool,
    retry: RetryConfig,
}

impl<'a, T, L: Label> Phase<'a, T, L> {
    /// A mandatory phase that applies in every state unless gated with
    /// [`when`](Self::when).
    pub fn new<F, Fut>(name: &'static str, mut mutate: F, wait: WaitSpec<'a, T, L>) -> Self
    where
        F: FnMut() -> Fut + Send + 'a,
        Fut: Future<Output = Result<(), ApiError>> + Send + 'a,
    {
        Self {
            name,
            mutate: Box::new(move || mutate().boxed()),
            wait,
            gate: None,
            done: None,
            mandatory: true,
            retry: RetryConfig::once(),
        }
    }

    /// Only legal while `gate` holds for the current label.
    pub fn when(mut self, gate: impl Fn(&L) -> bool + Send + Sync + 'a) -> Self {
        self.gate = Some(Box::new(gate));
        self
    }

    /// Nothing to do while `done` holds; the phase is skipped.
    pub fn unless(mut self, done: impl Fn(&L) -> bool + Send + Sync + 'a) -> Self {
        self.done = Some(Box::new(done));
        self
    }

    /// Skip instead of failing when the gate does not hold.
    pub fn optional(mut self) -> Self {
        self.mandatory = false;
        self
    }

    /// Retry the mutation on retryable outcomes before waiting.
    pub fn retry(mut self, config: RetryConfig) -> Self {
        self.retry = config;
        self
    }
}

/// Drives a list of phases against one composite object.
pub struct PhaseRunner<'a, L: Label> {
    object: String,
    read_label: ReadLabelFn<'a, L>,
    classifier: Classifier,
}

impl<'a, L: Label + 'a> PhaseRunner<'a, L> {
    /// `read_label` fetches the object's current state label.
    pub fn new<F, Fut>(object: impl Into<String>, mut read_label: F) -> Self
    where
        F: FnMut() -> Fut + Send + 'a,
        Fut: Future<Output = Result<L, ApiError>> + Send + 'a,
    {
        Self {
            object: object.into(),
            read_label: Box::new(move || read_label().boxed()),
            classifier: Classifier::default(),
        }
    }

    /// Classifier for label reads and retried mutations.
    pub fn classifier(mut self, classifier: Classifier) -> Self {
        self.classifier = classifier;
        self
    }

    /// Run `phases` in order. Returns the names of the phases that were applied.
    pub async fn run<T>(
        mut self,
        phases: Vec<Phase<'a, T, L>>,
    ) -> Result<Vec<&'static str>, ReconcileError> {
        let mut applied = Vec::new();
        let initial = Subject::new(self.object.clone(), "read-state");
        let mut current = self.read(&initial).await?;
        let mut stale = false;

        info!(
            "Running {} phases on {} (state {})",
            phases.len(),
            self.object,
            current
        );

        for phase in phases {
            let Phase {
                name,
                mut mutate,
                wait,
                gate,
                done,
                mandatory,
                retry,
            } = phase;
            let subject = initial.with_operation(name);

            if stale {
                current = self.read(&subject).await?;
                stale = false;
            }

            if done.as_ref().is_some_and(|done| done(&current)) {
                debug!("Skipping {}: nothing to do in state {}", subject, current);
                continue;
            }

            if gate.as_ref().is_some_and(|gate| !gate(&current)) {
                if mandatory {
                    warn!("{} is prohibited in state {}", subject, current);
                    return Err(subject.prohibited(&current));
                }
                debug!("Skipping optional {} in state {}", subject, current);
                continue;
            }

            info!("Applying {} (state {})", subject, current);
            retry_mutation(&retry, &self.classifier, &subject, || mutate()).await?;
            wait_for_state(wait).await?;

            applied.push(name);
            stale = true;
        }

        info!("{} phases applied to {}", applied.len(), self.object);
        Ok(applied)
    }

    async fn read(&mut self, subject: &Subject) -> Result<L, ReconcileError> {
        (self.read_label)()
            .await
            .map_err(|err| subject.remote(self.classifier.classify(&err), err))
    }
}
