//! # Leader Election
//!
//! Replicas coordinate through a `coordination.k8s.io/v1` Lease so that only
//! one of them runs the controller and writes the rules ConfigMap.
//!
//! `LeaseLock::spawn` claims or renews the Lease in a background task and
//! publishes the current `Claim` on a watch channel. The controller starts once
//! this replica holds the claim and is shut down when the claim is lost. When
//! every receiver is dropped the task vacates the Lease, so a standby replica
//! takes over without waiting for the claim to expire.

use crate::config::LeaderElection;
use crate::constants::{LEASE_DURATION_SECS, LEASE_RENEW_GRACE_SECS};
use crate::runtime::initialization::InitializationResult;
use crate::runtime::watch_loop::run_watch_loop;
use crate::store::{ClusterStore, StoreError};
use anyhow::{bail, Context};
use chrono::{DateTime, Utc};
use futures::FutureExt;
use k8s_openapi::api::coordination::v1::{Lease, LeaseSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{MicroTime, ObjectMeta};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

const RETRY_DELAY: Duration = Duration::from_secs(1);

/// Timing of a claim
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClaimParams {
    /// How long a claim is valid after its last renewal
    pub lease_duration: Duration,
    /// How long before expiry the holder renews
    pub renew_grace_period: Duration,
}

impl Default for ClaimParams {
    fn default() -> Self {
        Self {
            lease_duration: Duration::from_secs(LEASE_DURATION_SECS),
            renew_grace_period: Duration::from_secs(LEASE_RENEW_GRACE_SECS),
        }
    }
}

/// Holder of a Lease and when its claim runs out
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Claim {
    pub holder: String,
    pub expiry: DateTime<Utc>,
}

impl Claim {
    pub fn is_current(&self) -> bool {
        Utc::now() < self.expiry
    }

    pub fn is_current_for(&self, claimant: &str) -> bool {
        self.holder == claimant && self.is_current()
    }

    pub async fn expire(&self) {
        self.expire_with_grace(Duration::ZERO).await;
    }

    /// Sleep until `grace` before the claim expires
    pub async fn expire_with_grace(&self, grace: Duration) {
        if let Ok(remaining) = (self.expiry - Utc::now()).to_std() {
            let sleep = remaining.saturating_sub(grace);
            if !sleep.is_zero() {
                tokio::time::sleep(sleep).await;
            }
        }
    }
}

/// Unexpired claim recorded on a Lease
fn current_claim(lease: &Lease) -> Option<Claim> {
    let spec = lease.spec.as_ref()?;
    let holder = spec.holder_identity.clone().filter(|h| !h.is_empty())?;
    let renewed = spec.renew_time.as_ref()?.0;
    let duration = chrono::Duration::seconds(spec.lease_duration_seconds?.into());
    let claim = Claim {
        holder,
        expiry: renewed + duration,
    };
    claim.is_current().then_some(claim)
}

pub type Spawned = (
    watch::Receiver<Arc<Claim>>,
    JoinHandle<Result<(), StoreError>>,
);

/// Advisory lock over one Lease object
pub struct LeaseLock {
    store: Arc<dyn ClusterStore>,
    namespace: String,
    name: String,
}

impl std::fmt::Debug for LeaseLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LeaseLock")
            .field("namespace", &self.namespace)
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

impl LeaseLock {
    pub fn new(store: Arc<dyn ClusterStore>, namespace: &str, name: &str) -> Self {
        Self {
            store,
            namespace: namespace.to_string(),
            name: name.to_string(),
        }
    }

    /// Create the Lease, unclaimed, unless it already exists
    pub async fn ensure_lease(&self) -> Result<(), StoreError> {
        match self.store.get_lease(&self.namespace, &self.name).await {
            Ok(_) => Ok(()),
            Err(e) if e.is_not_found() => {
                let lease = Lease {
                    metadata: ObjectMeta {
                        name: Some(self.name.clone()),
                        namespace: Some(self.namespace.clone()),
                        ..Default::default()
                    },
                    spec: Some(LeaseSpec::default()),
                };
                match self.store.create_lease(&lease).await {
                    Ok(_) => {
                        info!("Created Lease {}/{}", self.namespace, self.name);
                        Ok(())
                    }
                    Err(e) if e.is_already_exists() => Ok(()),
                    Err(e) => Err(e),
                }
            }
            Err(e) => Err(e),
        }
    }

    /// Make sure the Lease is claimed and return the claim
    ///
    /// An unclaimed or expired Lease is acquired by `claimant`. A claim held by
    /// `claimant` is renewed once it is within the renew grace period. A
    /// current claim held by someone else is returned as is.
    pub async fn ensure_claimed(
        &self,
        claimant: &str,
        params: &ClaimParams,
    ) -> Result<Arc<Claim>, StoreError> {
        loop {
            let lease = self.store.get_lease(&self.namespace, &self.name).await?;
            let written = match current_claim(&lease) {
                Some(claim) if claim.holder == claimant => {
                    let grace = chrono::Duration::from_std(params.renew_grace_period)
                        .unwrap_or_else(|_| chrono::Duration::zero());
                    if Utc::now() < claim.expiry - grace {
                        return Ok(Arc::new(claim));
                    }
                    self.write_claim(lease, claimant, params, false).await
                }
                Some(claim) => return Ok(Arc::new(claim)),
                None => self.write_claim(lease, claimant, params, true).await,
            };

            match written {
                Err(StoreError::Conflict { .. }) => {
                    debug!(
                        "Lease {}/{} changed concurrently, re-reading",
                        self.namespace, self.name
                    );
                }
                other => return other,
            }
        }
    }

    async fn write_claim(
        &self,
        mut lease: Lease,
        claimant: &str,
        params: &ClaimParams,
        acquire: bool,
    ) -> Result<Arc<Claim>, StoreError> {
        let now = Utc::now();
        let seconds = i32::try_from(params.lease_duration.as_secs()).unwrap_or(i32::MAX);

        let spec = lease.spec.get_or_insert_with(LeaseSpec::default);
        if acquire {
            spec.holder_identity = Some(claimant.to_string());
            spec.acquire_time = Some(MicroTime(now));
            spec.lease_transitions = Some(spec.lease_transitions.unwrap_or(0).saturating_add(1));
        }
        spec.renew_time = Some(MicroTime(now));
        spec.lease_duration_seconds = Some(seconds);

        self.store.replace_lease(&lease).await?;
        if acquire {
            info!("Acquired Lease {}/{} as {}", self.namespace, self.name, claimant);
        }
        Ok(Arc::new(Claim {
            holder: claimant.to_string(),
            expiry: now + chrono::Duration::seconds(seconds.into()),
        }))
    }

    /// Clear the claim if `claimant` currently holds it
    pub async fn vacate(&self, claimant: &str) -> Result<bool, StoreError> {
        let mut lease = self.store.get_lease(&self.namespace, &self.name).await?;
        if !current_claim(&lease).is_some_and(|claim| claim.holder == claimant) {
            return Ok(false);
        }

        if let Some(spec) = lease.spec.as_mut() {
            spec.holder_identity = None;
            spec.acquire_time = None;
            spec.renew_time = None;
            spec.lease_duration_seconds = None;
        }
        self.store.replace_lease(&lease).await?;
        info!("Released Lease {}/{}", self.namespace, self.name);
        Ok(true)
    }

    /// Keep the Lease claimed in a background task
    ///
    /// The task publishes every claim it observes. It ends, vacating the Lease,
    /// once all receivers are dropped.
    pub async fn spawn(self, claimant: &str, params: ClaimParams) -> Result<Spawned, StoreError> {
        let claimant = claimant.to_string();
        let mut claim = self.ensure_claimed(&claimant, &params).await?;
        let (tx, rx) = watch::channel(Arc::clone(&claim));

        let task = tokio::spawn(async move {
            loop {
                // Only the holder renews ahead of expiry
                let grace = if claim.holder == claimant {
                    params.renew_grace_period
                } else {
                    Duration::ZERO
                };
                tokio::select! {
                    biased;
                    _ = tx.closed() => break,
                    _ = claim.expire_with_grace(grace) => {}
                }

                match self.ensure_claimed(&claimant, &params).await {
                    Ok(next) => {
                        if next.holder != claim.holder {
                            info!(
                                "Lease {}/{} is now held by {}",
                                self.namespace, self.name, next.holder
                            );
                        }
                        claim = next;
                        if tx.send(Arc::clone(&claim)).is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        warn!(
                            "Failed to claim Lease {}/{}, retrying: {}",
                            self.namespace, self.name, e
                        );
                        tokio::select! {
                            biased;
                            _ = tx.closed() => break,
                            _ = tokio::time::sleep(RETRY_DELAY) => {}
                        }
                    }
                }
            }

            self.vacate(&claimant).await?;
            Ok(())
        });

        Ok((rx, task))
    }
}

/// Wait until `claimant` holds the claim
///
/// Returns false when the claim task stopped first.
pub async fn wait_for_leadership(claims: &mut watch::Receiver<Arc<Claim>>, claimant: &str) -> bool {
    loop {
        let held = claims.borrow_and_update().is_current_for(claimant);
        if held {
            return true;
        }
        if claims.changed().await.is_err() {
            return false;
        }
    }
}

/// Resolve once `claimant` no longer holds a current claim
pub async fn leadership_lost(mut claims: watch::Receiver<Arc<Claim>>, claimant: String) {
    loop {
        let claim = Arc::clone(&claims.borrow_and_update());
        if !claim.is_current_for(&claimant) {
            return;
        }
        tokio::select! {
            changed = claims.changed() => {
                if changed.is_err() {
                    return;
                }
            }
            _ = claim.expire() => {}
        }
    }
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        if let Ok(mut terminate) = signal(SignalKind::terminate()) {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = terminate.recv() => {}
            }
            return;
        }
    }
    let _ = tokio::signal::ctrl_c().await;
}

/// Run the controller only while this replica holds the Lease
///
/// Returns an error when the Lease is lost so the process restarts and
/// competes again.
pub async fn run_elected(
    election: &LeaderElection,
    store: Arc<dyn ClusterStore>,
    init: InitializationResult,
    max_concurrent_reconciliations: u16,
) -> anyhow::Result<()> {
    let lock = LeaseLock::new(store, &election.namespace, &election.lease_name);
    lock.ensure_lease()
        .await
        .context("Failed to create the leader election Lease")?;
    let (mut claims, task) = lock
        .spawn(&election.identity, ClaimParams::default())
        .await
        .context("Failed to claim the leader election Lease")?;

    // Standby replicas are ready so rollouts can proceed
    init.server_state.mark_ready();
    info!(
        "Waiting for Lease {}/{} as {}",
        election.namespace, election.lease_name, election.identity
    );
    let acquired = tokio::select! {
        acquired = wait_for_leadership(&mut claims, &election.identity) => acquired,
        _ = shutdown_signal() => false,
    };

    let mut lost = false;
    let mut outcome = Ok(());
    if acquired {
        let (lost_tx, lost_rx) = oneshot::channel::<()>();
        let notifier = tokio::spawn(leadership_lost(claims.clone(), election.identity.clone()).map(
            move |()| {
                let _ = lost_tx.send(());
            },
        ));
        let shutdown = async move {
            if lost_rx.await.is_err() {
                futures::future::pending::<()>().await;
            }
            warn!("Leader election Lease lost, stopping the controller");
        };

        let result = run_watch_loop(
            init.rules,
            init.context,
            init.server_state,
            max_concurrent_reconciliations,
            shutdown,
        )
        .await;
        lost = !claims.borrow().is_current_for(&election.identity);
        notifier.abort();
        let _ = notifier.await;
        outcome = result;
    }

    drop(claims);
    match task.await {
        Ok(Ok(())) => debug!("Leader election task stopped"),
        Ok(Err(e)) => warn!("Failed to release the leader election Lease: {}", e),
        Err(e) => warn!("Leader election task failed: {}", e),
    }

    outcome?;
    if lost {
        bail!(
            "lost Lease {}/{} to another replica",
            election.namespace,
            election.lease_name
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{InMemoryStore, InjectedFailure};

    fn lock(store: &Arc<InMemoryStore>) -> LeaseLock {
        let store: Arc<dyn ClusterStore> = Arc::<InMemoryStore>::clone(store);
        LeaseLock::new(store, "loki", "21ccfc3d.quero.com")
    }

    fn spec(store: &InMemoryStore) -> LeaseSpec {
        store
            .lease("loki", "21ccfc3d.quero.com")
            .and_then(|lease| lease.spec)
            .unwrap()
    }

    #[tokio::test]
    async fn test_first_claimant_acquires_and_others_observe() {
        let store = Arc::new(InMemoryStore::new());
        let lock = lock(&store);
        lock.ensure_lease().await.unwrap();
        lock.ensure_lease().await.unwrap();

        let params = ClaimParams::default();
        let a = lock.ensure_claimed("a", &params).await.unwrap();
        assert!(a.is_current_for("a"));

        let seen_by_b = lock.ensure_claimed("b", &params).await.unwrap();
        assert_eq!(seen_by_b.holder, "a");
        assert!(!seen_by_b.is_current_for("b"));

        let spec = spec(&store);
        assert_eq!(spec.holder_identity.as_deref(), Some("a"));
        assert_eq!(spec.lease_duration_seconds, Some(15));
        assert_eq!(spec.lease_transitions, Some(1));
    }

    #[tokio::test]
    async fn test_holder_renews_only_inside_grace_period() {
        let store = Arc::new(InMemoryStore::new());
        let lock = lock(&store);
        lock.ensure_lease().await.unwrap();

        let relaxed = ClaimParams {
            lease_duration: Duration::from_secs(15),
            renew_grace_period: Duration::ZERO,
        };
        lock.ensure_claimed("a", &relaxed).await.unwrap();
        let version = store
            .lease("loki", "21ccfc3d.quero.com")
            .unwrap()
            .metadata
            .resource_version;
        lock.ensure_claimed("a", &relaxed).await.unwrap();
        let unchanged = store
            .lease("loki", "21ccfc3d.quero.com")
            .unwrap()
            .metadata
            .resource_version;
        assert_eq!(unchanged, version);

        // A grace period longer than the lease is always due for renewal
        let eager = ClaimParams {
            lease_duration: Duration::from_secs(15),
            renew_grace_period: Duration::from_secs(60),
        };
        lock.ensure_claimed("a", &eager).await.unwrap();
        let renewed = store.lease("loki", "21ccfc3d.quero.com").unwrap();
        assert_ne!(renewed.metadata.resource_version, version);
        assert_eq!(renewed.spec.unwrap().lease_transitions, Some(1));
    }

    #[tokio::test]
    async fn test_expired_claim_is_taken_over() {
        let store = Arc::new(InMemoryStore::new());
        let lock = lock(&store);
        lock.ensure_lease().await.unwrap();
        let params = ClaimParams::default();
        lock.ensure_claimed("a", &params).await.unwrap();

        let mut lease = store.lease("loki", "21ccfc3d.quero.com").unwrap();
        if let Some(spec) = lease.spec.as_mut() {
            spec.renew_time = Some(MicroTime(Utc::now() - chrono::Duration::seconds(60)));
        }
        store.replace_lease(&lease).await.unwrap();

        let b = lock.ensure_claimed("b", &params).await.unwrap();
        assert!(b.is_current_for("b"));
        assert_eq!(spec(&store).lease_transitions, Some(2));
    }

    #[tokio::test]
    async fn test_conflicting_claim_is_retried() {
        let store = Arc::new(InMemoryStore::new());
        let lock = lock(&store);
        lock.ensure_lease().await.unwrap();
        store.fail_next("replace_lease", InjectedFailure::Conflict);

        let a = lock.ensure_claimed("a", &ClaimParams::default()).await.unwrap();
        assert_eq!(a.holder, "a");
    }

    #[tokio::test]
    async fn test_only_the_holder_can_vacate() {
        let store = Arc::new(InMemoryStore::new());
        let lock = lock(&store);
        lock.ensure_lease().await.unwrap();
        let params = ClaimParams::default();
        lock.ensure_claimed("a", &params).await.unwrap();

        assert!(!lock.vacate("b").await.unwrap());
        assert!(lock.vacate("a").await.unwrap());
        assert_eq!(spec(&store).holder_identity, None);

        let b = lock.ensure_claimed("b", &params).await.unwrap();
        assert!(b.is_current_for("b"));
    }

    #[tokio::test]
    async fn test_spawned_claim_is_vacated_when_receivers_drop() {
        let store = Arc::new(InMemoryStore::new());
        let lock = lock(&store);
        lock.ensure_lease().await.unwrap();

        let (mut claims, task) = lock.spawn("a", ClaimParams::default()).await.unwrap();
        assert!(wait_for_leadership(&mut claims, "a").await);

        drop(claims);
        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(spec(&store).holder_identity, None);
    }

    #[tokio::test]
    async fn test_waiting_replica_takes_over_when_claim_moves() {
        let held_by_b = Arc::new(Claim {
            holder: "b".to_string(),
            expiry: Utc::now() + chrono::Duration::seconds(60),
        });
        let (tx, mut rx) = watch::channel(held_by_b);
        let waiter = tokio::spawn(async move { wait_for_leadership(&mut rx, "a").await });

        tx.send(Arc::new(Claim {
            holder: "a".to_string(),
            expiry: Utc::now() + chrono::Duration::seconds(60),
        }))
        .unwrap();
        assert!(tokio::time::timeout(Duration::from_secs(5), waiter)
            .await
            .unwrap()
            .unwrap());
    }

    #[tokio::test]
    async fn test_waiting_stops_when_claim_task_ends() {
        let held_by_b = Arc::new(Claim {
            holder: "b".to_string(),
            expiry: Utc::now() + chrono::Duration::seconds(60),
        });
        let (tx, mut rx) = watch::channel(held_by_b);
        drop(tx);
        assert!(!wait_for_leadership(&mut rx, "a").await);
    }

    #[tokio::test]
    async fn test_leadership_is_lost_when_another_replica_holds_the_claim() {
        let held_by_a = Arc::new(Claim {
            holder: "a".to_string(),
            expiry: Utc::now() + chrono::Duration::seconds(60),
        });
        let (tx, rx) = watch::channel(held_by_a);
        let lost = tokio::spawn(leadership_lost(rx, "a".to_string()));

        tx.send(Arc::new(Claim {
            holder: "b".to_string(),
            expiry: Utc::now() + chrono::Duration::seconds(60),
        }))
        .unwrap();
        tokio::time::timeout(Duration::from_secs(5), lost)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_leadership_is_lost_when_claim_expires_unrenewed() {
        let short = Arc::new(Claim {
            holder: "a".to_string(),
            expiry: Utc::now() + chrono::Duration::milliseconds(50),
        });
        let (_tx, rx) = watch::channel(short);
        tokio::time::timeout(Duration::from_secs(5), leadership_lost(rx, "a".to_string()))
            .await
            .unwrap();
    }
}
