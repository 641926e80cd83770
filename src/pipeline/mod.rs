//! Staged, cancellable processing chains.
//!
//! A chain starts at a trigger source ([`periodic`]). It runs through any number
//! of [`stage`]s and ends in a sink ([`drain`]). Every trigger carries a
//! completion channel. A producer is not done with an item until the consumer
//! and everything the consumer produced in turn have reported back. So a fast
//! stage can never race ahead of a slow one downstream.
//!
//! ```text
//! periodic ──▶ stage("list") ──▶ stage("refresh") ──▶ stage("schedule") ──▶ drain
//!    ▲              │  produce(a), produce(b)                │
//!    └──── Ok / Err (own error joined with downstream) ◀─────┘
//! ```
//!
//! The root only uses the reported outcome to choose its next delay: a short
//! `fail_delay` after a failed iteration, a longer `success_delay` otherwise.

mod scope;

pub use scope::{Expired, Scope};

use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use anyhow::anyhow;
use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::errors::{PipelineError, join_errors};

/// One unit of upstream work.
pub struct Trigger<T> {
    scope: Scope,
    data: T,
    done: oneshot::Sender<anyhow::Result<()>>,
}

impl<T> Trigger<T> {
    pub fn scope(&self) -> &Scope {
        &self.scope
    }

    pub fn data(&self) -> &T {
        &self.data
    }

    pub fn into_parts(self) -> (Scope, T, Completion) {
        (self.scope, self.data, Completion(self.done))
    }

    /// Report the outcome of everything this trigger caused.
    pub fn complete(self, result: anyhow::Result<()>) {
        Completion(self.done).report(result);
    }
}

/// The reporting half of a trigger once its payload has been taken.
pub struct Completion(oneshot::Sender<anyhow::Result<()>>);

impl Completion {
    pub fn report(self, result: anyhow::Result<()>) {
        // The producer may already be gone after cancellation.
        let _ = self.0.send(result);
    }
}

/// A sequence of triggers consumed by a stage or a sink.
pub struct Triggers<T> {
    rx: mpsc::Receiver<Trigger<T>>,
}

impl<T> Triggers<T> {
    pub async fn next(&mut self) -> Option<Trigger<T>> {
        self.rx.recv().await
    }
}

/// Sending half of a trigger sequence.
pub struct Emitter<T> {
    tx: mpsc::Sender<Trigger<T>>,
}

impl<T> Clone for Emitter<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
        }
    }
}

impl<T> Emitter<T> {
    /// Emit `data` downstream and wait until it has been fully processed.
    pub async fn emit(&self, scope: Scope, data: T) -> anyhow::Result<()> {
        let (done, completed) = oneshot::channel();
        self.tx
            .send(Trigger { scope, data, done })
            .await
            .map_err(|_| PipelineError::Dropped)?;
        completed.await.map_err(|_| PipelineError::Dropped)?
    }
}

/// A rendezvous channel: at most one trigger is in flight between two stages.
pub fn channel<T>() -> (Emitter<T>, Triggers<T>) {
    let (tx, rx) = mpsc::channel(1);
    (Emitter { tx }, Triggers { rx })
}

/// Handed to a stage body to emit zero or more downstream items.
///
/// Each produced item runs independently; the stage joins all of them before
/// reporting its own completion upstream.
pub struct Producer<T> {
    stage: &'static str,
    emitter: Emitter<T>,
    scope: Scope,
    pending: Mutex<Vec<JoinHandle<anyhow::Result<()>>>>,
}

impl<T: Send + 'static> Producer<T> {
    fn new(stage: &'static str, emitter: Emitter<T>, scope: Scope) -> Self {
        Self {
            stage,
            emitter,
            scope,
            pending: Mutex::new(Vec::new()),
        }
    }

    pub fn produce(&self, item: T) {
        let emitter = self.emitter.clone();
        let scope = self.scope.clone();
        let stage = self.stage;
        let handle = tokio::spawn(async move {
            let result = emitter.emit(scope, item).await;
            if let Err(e) = &result {
                warn!(stage, error = %format!("{:#}", e), "downstream failed");
            }
            result
        });
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(handle);
    }

    async fn join(self) -> Vec<anyhow::Error> {
        let handles = self
            .pending
            .into_inner()
            .unwrap_or_else(PoisonError::into_inner);
        let mut errors = Vec::new();
        for handle in handles {
            match handle.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => errors.push(e),
                Err(e) => errors.push(anyhow!("{}: downstream task panicked: {}", self.stage, e)),
            }
        }
        errors
    }
}

/// One bounded-time step of a chain.
///
/// `scope` expires after the stage's timeout or when the run is cancelled;
/// implementations must stop blocking work once it has expired.
#[async_trait]
pub trait Stage<In, Out>: Send + Sync + 'static
where
    In: Send + 'static,
    Out: Send + 'static,
{
    async fn run(&self, scope: &Scope, item: In, out: &Producer<Out>) -> anyhow::Result<()>;
}

/// Run `body` for every upstream trigger, bounded by `timeout` per item.
pub fn stage<In, Out, S>(
    name: &'static str,
    mut upstream: Triggers<In>,
    timeout: Duration,
    body: S,
) -> Triggers<Out>
where
    In: Send + 'static,
    Out: Send + 'static,
    S: Stage<In, Out>,
{
    let (emitter, downstream) = channel();
    tokio::spawn(async move {
        while let Some(trigger) = upstream.next().await {
            let (scope, item, completion) = trigger.into_parts();
            let producer = Producer::new(name, emitter.clone(), scope.clone());
            let stage_scope = scope.with_timeout(timeout);

            let own = body.run(&stage_scope, item, &producer).await;
            let mut errors = producer.join().await;
            if let Err(e) = own {
                let e = if stage_scope.is_expired() && !scope.is_expired() {
                    e.context(format!("stage {} exceeded {:?}", name, timeout))
                } else {
                    e.context(format!("stage {}", name))
                };
                errors.insert(0, e);
            }
            completion.report(join_errors(errors));
        }
        debug!(stage = name, "upstream closed");
    });
    downstream
}

/// An endless sequence of empty triggers, paced by the outcome of each one.
///
/// Stops emitting once `token` is cancelled.
pub fn periodic(token: CancellationToken, fail_delay: Duration, success_delay: Duration) -> Triggers<()> {
    let (emitter, triggers) = channel();
    tokio::spawn(async move {
        let scope = Scope::root(token);
        while !scope.is_expired() {
            let delay = match emitter.emit(scope.clone(), ()).await {
                Ok(()) => {
                    info!(delay = ?success_delay, "sleeping after successful iteration");
                    success_delay
                }
                Err(e) => {
                    info!(delay = ?fail_delay, error = %format!("{:#}", e), "sleeping after failed iteration");
                    fail_delay
                }
            };
            if scope.sleep(delay).await.is_err() {
                break;
            }
        }
        debug!("periodic source stopped");
    });
    triggers
}

/// Terminal sink: completes every trigger immediately. Returns once the chain closes.
pub async fn drain<T>(mut triggers: Triggers<T>) {
    while let Some(trigger) = triggers.next().await {
        trigger.complete(Ok(()));
    }
}
