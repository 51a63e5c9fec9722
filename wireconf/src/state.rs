// Commit-confirm transaction guard

//! Time-boxed, crash-recoverable commits
//!
//! A guarded commit deploys first and only then puts the guard into `Pending`
//! for [`CONFIRM_WINDOW`], so the window never starts before the host runs
//! the change. The pending record is mirrored to a sidecar file so a restart
//! can pick it up. If nobody confirms before the deadline, the domain store
//! is restored from the last-known-good baseline and the host is redeployed
//! from it.
//!
//! All state transitions and every deployment happen under one async mutex.
//! The deadline task re-checks the transaction id under that mutex before
//! acting, so a confirm that wins the race always prevents the revert.

use crate::error::{Error, Result};
use crate::orchestrator::{CommitReport, Redeploy};
use crate::state_file::{unix_now, SidecarFile, TransactionRecord, TransactionStatus};
use crate::store::{Baseline, DomainStore};
use crate::types::TransactionState;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use uuid::Uuid;

/// How long a provisional commit waits for confirmation
pub const CONFIRM_WINDOW: Duration = Duration::from_secs(60);

/// What startup recovery found
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Recovery {
    /// No transaction was pending
    Clean,
    /// A pending transaction is still within its window; the deadline is re-armed
    Resumed { id: String, remaining: Duration },
    /// A pending transaction had expired and was reverted
    Reverted(CommitReport),
}

struct Inner {
    state: TransactionState,
    timer: Option<JoinHandle<()>>,
}

/// What watchers see: the state, plus why the revert that last ended a
/// transaction failed
#[derive(Debug, Clone)]
struct Published {
    state: TransactionState,
    revert_failure: Option<String>,
}

struct Shared<R> {
    inner: Mutex<Inner>,
    published: watch::Sender<Published>,
    store: Arc<dyn DomainStore>,
    baseline: Baseline,
    sidecar: SidecarFile,
    redeploy: Arc<R>,
}

/// Handle to the single process-wide transaction state machine
pub struct TransactionGuard<R> {
    shared: Arc<Shared<R>>,
}

impl<R> Clone for TransactionGuard<R> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

fn pending_record(id: &str, expires_at: u64) -> TransactionRecord {
    TransactionRecord {
        transaction_id: id.to_string(),
        status: TransactionStatus::Pending,
        expires_at,
    }
}

fn failure_reason<T>(outcome: &Result<T>) -> Option<String> {
    match outcome {
        Ok(_) => None,
        Err(Error::RevertFailed { reason }) => Some(reason.clone()),
        Err(e) => Some(e.to_string()),
    }
}

impl<R: Redeploy> Shared<R> {
    fn publish(&self, inner: &mut Inner, state: TransactionState, revert_failure: Option<String>) {
        inner.state = state.clone();
        self.published.send_replace(Published {
            state,
            revert_failure,
        });
    }

    /// Back to `Idle`: forget the deadline and drop the sidecar
    fn finish(&self, inner: &mut Inner, revert_failure: Option<String>) {
        if let Some(timer) = inner.timer.take() {
            timer.abort();
        }
        self.sidecar.clear();
        self.publish(inner, TransactionState::Idle, revert_failure);
    }

    /// Restore the last-known-good domain and push it to the host.
    /// Caller holds the state lock.
    async fn revert(&self) -> Result<CommitReport> {
        let image = self.baseline.load()?;
        self.store.restore(&image).map_err(|e| Error::RevertFailed {
            reason: format!("cannot restore domain store: {}", e),
        })?;
        self.store.invalidate();
        log::info!("Domain restored from last-known-good baseline");

        match self.redeploy.redeploy().await {
            Ok(report) => {
                if report.is_degraded() {
                    log::error!("Redeploy after revert is degraded: {:?}", report.status);
                } else {
                    log::info!("Last-known-good configuration redeployed ({:?})", report.strategy);
                }
                Ok(report)
            }
            Err(e) => {
                log::error!("Redeploy after revert failed: {}", e);
                Err(Error::RevertFailed {
                    reason: format!("domain restored but redeploy failed: {}", e),
                })
            }
        }
    }

    /// Deadline callback
    async fn expire(&self, id: &str) {
        let mut inner = self.inner.lock().await;
        match &inner.state {
            TransactionState::Pending { id: current, .. } if current == id => {}
            _ => return,
        }
        // This task is the timer; aborting it in `finish` would cancel us
        inner.timer = None;

        log::warn!("Transaction {} was not confirmed in time, reverting", id);
        let outcome = self.revert().await;
        if let Err(e) = &outcome {
            log::error!("Automatic revert of transaction {} failed: {}", id, e);
        }
        self.finish(&mut inner, failure_reason(&outcome));
    }
}

impl<R: Redeploy> TransactionGuard<R> {
    pub fn new(
        store: Arc<dyn DomainStore>,
        baseline: Baseline,
        sidecar: SidecarFile,
        redeploy: Arc<R>,
    ) -> Self {
        let (published, _) = watch::channel(Published {
            state: TransactionState::Idle,
            revert_failure: None,
        });
        Self {
            shared: Arc::new(Shared {
                inner: Mutex::new(Inner {
                    state: TransactionState::Idle,
                    timer: None,
                }),
                published,
                store,
                baseline,
                sidecar,
                redeploy,
            }),
        }
    }

    /// Replace any running deadline with one firing after `after`.
    /// Caller holds the state lock.
    fn arm(&self, inner: &mut Inner, id: &str, after: Duration) {
        if let Some(stale) = inner.timer.take() {
            stale.abort();
        }
        let shared = Arc::clone(&self.shared);
        let id = id.to_string();
        inner.timer = Some(tokio::spawn(async move {
            tokio::time::sleep(after).await;
            shared.expire(&id).await;
        }));
    }

    /// Record `id` as pending for a full window and arm its deadline.
    /// Caller holds the state lock.
    fn enter_pending(&self, inner: &mut Inner, id: &str) -> Result<()> {
        let expires_at = unix_now() + CONFIRM_WINDOW.as_secs();
        self.shared.sidecar.save(&pending_record(id, expires_at))?;
        self.arm(inner, id, CONFIRM_WINDOW);
        self.shared.publish(
            inner,
            TransactionState::Pending {
                id: id.to_string(),
                expires_at,
            },
            None,
        );

        log::info!(
            "Transaction {} started, confirm within {}s",
            id,
            CONFIRM_WINDOW.as_secs()
        );
        Ok(())
    }

    /// Startup recovery: bootstrap the baseline, then resolve any transaction
    /// left pending by a previous process.
    pub async fn init(&self) -> Result<Recovery> {
        let shared = &self.shared;
        let mut inner = shared.inner.lock().await;

        if !shared.baseline.exists() && shared.store.exists() {
            shared.baseline.save(&shared.store.snapshot()?)?;
            log::info!("Created initial last-known-good baseline");
        }

        let record = match shared.sidecar.load() {
            Ok(Some(record)) => record,
            Ok(None) => return Ok(Recovery::Clean),
            Err(e) => {
                log::warn!("Discarding unreadable transaction sidecar: {}", e);
                shared.sidecar.clear();
                return Ok(Recovery::Clean);
            }
        };

        let now = unix_now();
        if record.expires_at <= now {
            log::warn!(
                "Transaction {} expired while the service was down, reverting",
                record.transaction_id
            );
            let outcome = shared.revert().await;
            shared.finish(&mut inner, failure_reason(&outcome));
            return outcome.map(Recovery::Reverted);
        }

        let remaining = Duration::from_secs(record.expires_at - now);
        log::info!(
            "Resuming transaction {} ({}s left to confirm)",
            record.transaction_id,
            remaining.as_secs()
        );
        self.arm(&mut inner, &record.transaction_id, remaining);
        shared.publish(
            &mut inner,
            TransactionState::Pending {
                id: record.transaction_id.clone(),
                expires_at: record.expires_at,
            },
            None,
        );

        Ok(Recovery::Resumed {
            id: record.transaction_id,
            remaining,
        })
    }

    /// Enter `Pending` and arm the deadline. Returns the transaction id.
    pub async fn start_transaction(&self) -> Result<String> {
        let mut inner = self.shared.inner.lock().await;

        if let TransactionState::Pending { id, .. } = &inner.state {
            return Err(Error::TransactionConflict { id: id.clone() });
        }

        let id = Uuid::new_v4().to_string();
        self.enter_pending(&mut inner, &id)?;
        Ok(id)
    }

    /// Keep the pending change. Returns `false` if `id` is not the pending
    /// transaction, without side effects.
    pub async fn confirm_transaction(&self, id: &str) -> bool {
        let shared = &self.shared;
        let mut inner = shared.inner.lock().await;

        match &inner.state {
            TransactionState::Pending { id: current, .. } if current == id => {}
            _ => {
                log::warn!("Ignoring confirmation of stale transaction {}", id);
                return false;
            }
        }

        if let Some(timer) = inner.timer.take() {
            timer.abort();
        }

        match shared
            .store
            .snapshot()
            .and_then(|image| shared.baseline.save(&image))
        {
            Ok(()) => log::info!("Transaction {} confirmed, baseline updated", id),
            Err(e) => log::error!(
                "Transaction {} confirmed but the baseline could not be updated: {}",
                id,
                e
            ),
        }

        shared.finish(&mut inner, None);
        true
    }

    /// Revert a pending change right away. Returns `Ok(None)` when nothing is
    /// pending. State is back to `Idle` even when the revert fails.
    pub async fn abort_transaction(&self) -> Result<Option<CommitReport>> {
        let shared = &self.shared;
        let mut inner = shared.inner.lock().await;

        if let Some(timer) = inner.timer.take() {
            timer.abort();
        }
        let id = match &inner.state {
            TransactionState::Pending { id, .. } => id.clone(),
            TransactionState::Idle => return Ok(None),
        };

        log::warn!("Transaction {} aborted, reverting", id);
        let outcome = shared.revert().await;
        shared.finish(&mut inner, failure_reason(&outcome));
        outcome.map(Some)
    }

    /// Deploy the current domain provisionally and open a transaction for it.
    ///
    /// The deployment runs under the state lock and the confirmation window
    /// starts once it has finished. A failed deployment is reverted before
    /// its error is returned.
    pub async fn commit_provisional(&self) -> Result<(String, CommitReport)> {
        let shared = &self.shared;
        let mut inner = shared.inner.lock().await;

        if let TransactionState::Pending { id, .. } = &inner.state {
            return Err(Error::TransactionConflict { id: id.clone() });
        }

        let id = Uuid::new_v4().to_string();
        // Already expired on disk: dying mid-deployment means revert on restart
        shared.sidecar.save(&pending_record(&id, unix_now()))?;
        log::info!("Deploying transaction {} provisionally", id);

        let deployed = match shared.redeploy.redeploy().await {
            Ok(report) => self.enter_pending(&mut inner, &id).map(|()| report),
            Err(e) => Err(e),
        };

        match deployed {
            Ok(report) => Ok((id, report)),
            Err(e) => {
                log::error!("Provisional commit {} failed: {}", id, e);
                let outcome = shared.revert().await;
                if let Err(revert) = &outcome {
                    log::error!("Rolling back transaction {} failed: {}", id, revert);
                }
                shared.finish(&mut inner, failure_reason(&outcome));
                Err(e)
            }
        }
    }

    /// Resolves once no transaction is pending.
    ///
    /// # Errors
    ///
    /// Returns [`Error::RevertFailed`] when the revert that ended the last
    /// transaction did not restore the previous configuration.
    pub async fn wait_until_idle(&self) -> Result<()> {
        let mut rx = self.shared.published.subscribe();
        let failure = match rx
            .wait_for(|published| published.state == TransactionState::Idle)
            .await
        {
            Ok(published) => published.revert_failure.clone(),
            Err(_) => None,
        };

        match failure {
            Some(reason) => Err(Error::RevertFailed { reason }),
            None => Ok(()),
        }
    }

    /// Current state
    pub fn state(&self) -> TransactionState {
        self.shared.published.borrow().state.clone()
    }

    /// True while a deadline task is waiting to fire
    pub async fn is_deadline_armed(&self) -> bool {
        let inner = self.shared.inner.lock().await;
        inner.timer.as_ref().is_some_and(|timer| !timer.is_finished())
    }
}
