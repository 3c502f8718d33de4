//! Waiting for peers to catch up to a metadata version.
//!
//! Every node publishes the metadata version it has applied in the
//! `MetadataVersion` gossip slot. [`MetadataVersionWaiter`] lets a caller
//! wait, with a bound, until every live peer in the local datacenter
//! reports at least a given version. Waiters suspend on a oneshot
//! channel; [`check_versions`](MetadataVersionWaiter::check_versions) is
//! driven by gossip notifications and releases whoever became satisfied.

use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::fact::MetadataVersionFact;
use crate::gossip::{FactSlot, PeerStateStore};

struct Waiter {
    id: u64,
    version: u64,
    release: oneshot::Sender<()>,
}

/// Blocks callers until live in-domain peers reach a metadata version.
pub struct MetadataVersionWaiter {
    gossip: Arc<dyn PeerStateStore>,
    datacenter: String,
    waiters: Mutex<Vec<Waiter>>,
    next_id: AtomicU64,
    closed: AtomicBool,
}

impl std::fmt::Debug for MetadataVersionWaiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetadataVersionWaiter")
            .field("datacenter", &self.datacenter)
            .field("waiting", &self.waiting())
            .finish_non_exhaustive()
    }
}

impl MetadataVersionWaiter {
    pub fn new(gossip: Arc<dyn PeerStateStore>, datacenter: impl Into<String>) -> Self {
        Self {
            gossip,
            datacenter: datacenter.into(),
            waiters: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        }
    }

    /// Waits until every live peer in the local datacenter has published a
    /// metadata version `>= version`. Returns `false` on timeout or
    /// shutdown.
    pub async fn await_version(&self, version: u64, timeout: Duration) -> bool {
        if self.closed.load(Ordering::Acquire) {
            return false;
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (release, released) = oneshot::channel();
        // register before scanning so a concurrent check can't slip between
        self.lock().push(Waiter {
            id,
            version,
            release,
        });

        if self.lowest_live_version() >= version {
            self.deregister(id);
            return true;
        }

        debug!(version, ?timeout, "waiting for peers to reach metadata version");
        match tokio::time::timeout(timeout, released).await {
            Ok(Ok(())) => true,
            // sender dropped: cancelled on shutdown
            Ok(Err(_)) => false,
            Err(_) => {
                self.deregister(id);
                debug!(version, "timed out waiting for metadata version");
                false
            }
        }
    }

    /// Releases every waiter whose version every live in-domain peer has
    /// reached.
    pub fn check_versions(&self) {
        let mut waiters = self.lock();
        if waiters.is_empty() {
            return;
        }
        let floor = self.lowest_live_version();
        let mut still_waiting = Vec::with_capacity(waiters.len());
        for waiter in waiters.drain(..) {
            if waiter.version <= floor {
                // the waiter may have just timed out; nothing to do then
                let _ = waiter.release.send(());
            } else {
                still_waiting.push(waiter);
            }
        }
        *waiters = still_waiting;
    }

    /// Number of callers currently waiting.
    pub fn waiting(&self) -> usize {
        self.lock().len()
    }

    /// Releases every waiter with `false` and rejects future waits.
    pub fn cancel_all(&self) {
        self.closed.store(true, Ordering::Release);
        // dropping the senders wakes every receiver with an error
        self.lock().clear();
    }

    /// Lowest version reported by a live peer of the local datacenter.
    ///
    /// A peer that has not published a version, or published garbage,
    /// counts as version 0. With no live peers at all, nothing is
    /// outstanding and the result is `u64::MAX`.
    fn lowest_live_version(&self) -> u64 {
        self.gossip
            .live_token_owners()
            .into_iter()
            .filter(|peer| self.in_domain(*peer))
            .map(|peer| self.reported_version(peer))
            .min()
            .unwrap_or(u64::MAX)
    }

    fn in_domain(&self, peer: IpAddr) -> bool {
        self.gossip.locality_of(peer).as_deref() == Some(self.datacenter.as_str())
    }

    fn reported_version(&self, peer: IpAddr) -> u64 {
        let Some(value) = self.gossip.fact_of(peer, FactSlot::MetadataVersion) else {
            return 0;
        };
        match value.parse::<MetadataVersionFact>() {
            Ok(fact) => fact.version,
            Err(e) => {
                warn!(%peer, "ignoring unreadable metadata version: {e}");
                0
            }
        }
    }

    fn deregister(&self, id: u64) {
        self.lock().retain(|w| w.id != id);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<Waiter>> {
        self.waiters.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gossip::MemoryGossip;
    use crate::node::NodeId;
    use uuid::Uuid;

    fn ip(last: u8) -> IpAddr {
        IpAddr::from([10, 0, 0, last])
    }

    fn publish_version(gossip: &MemoryGossip, peer: IpAddr, version: u64) {
        let fact = MetadataVersionFact {
            uuid: Uuid::nil(),
            version,
        };
        gossip.publish(peer, FactSlot::MetadataVersion, fact.to_string());
    }

    fn three_nodes() -> (MemoryGossip, Arc<MetadataVersionWaiter>) {
        let gossip = MemoryGossip::new();
        for last in 1..=3 {
            gossip.join(ip(last), NodeId::new(), "dc1", "r1");
        }
        let waiter = Arc::new(MetadataVersionWaiter::new(Arc::new(gossip.handle(ip(1))), "dc1"));
        (gossip, waiter)
    }

    #[tokio::test]
    async fn satisfied_immediately() {
        let (gossip, waiter) = three_nodes();
        for last in 1..=3 {
            publish_version(&gossip, ip(last), 4);
        }
        assert!(waiter.await_version(4, Duration::from_millis(10)).await);
        assert!(waiter.await_version(3, Duration::from_millis(10)).await);
        assert_eq!(waiter.waiting(), 0);
    }

    #[tokio::test]
    async fn times_out_when_a_peer_lags() {
        let (gossip, waiter) = three_nodes();
        publish_version(&gossip, ip(1), 2);
        publish_version(&gossip, ip(2), 2);
        publish_version(&gossip, ip(3), 1);

        let started = tokio::time::Instant::now();
        assert!(!waiter.await_version(2, Duration::from_millis(50)).await);
        assert!(started.elapsed() >= Duration::from_millis(50));
        assert_eq!(waiter.waiting(), 0);
    }

    #[tokio::test]
    async fn released_when_last_peer_catches_up() {
        let (gossip, waiter) = three_nodes();
        publish_version(&gossip, ip(1), 2);
        publish_version(&gossip, ip(2), 2);

        let wait = {
            let waiter = waiter.clone();
            tokio::spawn(async move { waiter.await_version(2, Duration::from_secs(5)).await })
        };
        tokio::task::yield_now().await;
        while waiter.waiting() == 0 {
            tokio::task::yield_now().await;
        }

        publish_version(&gossip, ip(3), 3);
        waiter.check_versions();
        assert!(wait.await.unwrap());
    }

    #[tokio::test]
    async fn dead_and_foreign_peers_are_ignored() {
        let (gossip, waiter) = three_nodes();
        gossip.join(ip(9), NodeId::new(), "dc2", "r1");
        publish_version(&gossip, ip(1), 5);
        publish_version(&gossip, ip(2), 5);
        gossip.set_alive(ip(3), false);

        assert!(waiter.await_version(5, Duration::from_millis(10)).await);
    }

    #[tokio::test]
    async fn garbled_fact_counts_as_not_caught_up() {
        let (gossip, waiter) = three_nodes();
        publish_version(&gossip, ip(1), 5);
        publish_version(&gossip, ip(2), 5);
        gossip.publish(ip(3), FactSlot::MetadataVersion, "garbage".into());

        assert!(!waiter.await_version(5, Duration::from_millis(10)).await);
    }

    #[tokio::test]
    async fn cancel_all_releases_with_false() {
        let (_gossip, waiter) = three_nodes();
        let wait = {
            let waiter = waiter.clone();
            tokio::spawn(async move { waiter.await_version(1, Duration::from_secs(60)).await })
        };
        while waiter.waiting() == 0 {
            tokio::task::yield_now().await;
        }
        waiter.cancel_all();
        assert!(!wait.await.unwrap());
        assert!(!waiter.await_version(0, Duration::from_secs(1)).await);
    }
}
