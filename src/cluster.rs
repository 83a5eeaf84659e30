use crate::executor::Executor;
use crate::replica::{Replica, ReplicaID, Timing};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex};

/// The shared directory of a fixed cluster's replicas. Replicas are keyed by
/// their small positive integer id and constructed lazily on first request;
/// the cluster owns them and hands out cloned handles per operation, while
/// each replica keeps only a weak backref here.
pub struct Cluster {
    executor: Arc<dyn Executor>,
    timing: Timing,
    size: usize,
    replicas: Mutex<BTreeMap<ReplicaID, Arc<Replica>>>,
}

impl Cluster {
    /// Creates an empty directory for a cluster of `size` replicas with the
    /// default timings. Quorum arithmetic runs against the configured size,
    /// not against however many replicas happen to be registered.
    pub fn new(size: usize, executor: Arc<dyn Executor>) -> Arc<Cluster> {
        Cluster::with_timing(size, executor, Timing::default())
    }

    /// Same as [`Cluster::new`] with explicit timings. Tests compress the
    /// timings to keep multi-election scenarios fast.
    pub fn with_timing(size: usize, executor: Arc<dyn Executor>, timing: Timing) -> Arc<Cluster> {
        Arc::new(Cluster {
            executor,
            timing,
            size,
            replicas: Mutex::new(BTreeMap::new()),
        })
    }

    /// Returns the replica with the given id, constructing it on first
    /// request. Identifier 0 is reserved and never names a replica.
    pub fn get(self: &Arc<Self>, id: ReplicaID) -> Arc<Replica> {
        debug_assert!(id >= 1 && id <= self.size, "replica id {} out of range", id);
        let mut replicas = self.replicas.lock().unwrap();
        replicas
            .entry(id)
            .or_insert_with(|| {
                Replica::new(
                    id,
                    Arc::downgrade(self),
                    self.executor.clone(),
                    self.timing.clone(),
                )
            })
            .clone()
    }

    /// Ids of every replica constructed so far.
    pub fn all_keys(&self) -> BTreeSet<ReplicaID> {
        self.replicas.lock().unwrap().keys().cloned().collect()
    }

    /// Ids of every known replica other than `id` (and the reserved id 0).
    pub fn peer_ids(&self, id: ReplicaID) -> Vec<ReplicaID> {
        self.all_keys()
            .into_iter()
            .filter(|&peer| peer != id && peer != 0)
            .collect()
    }

    /// The configured number of replicas in the cluster.
    pub fn size(&self) -> usize {
        self.size
    }

    /// The id of the running leader, or 0 when none exists. A deposed leader
    /// that has not yet learned of its successor can coexist with it for a
    /// moment; the higher term wins the answer.
    pub fn leader_id(&self) -> ReplicaID {
        let replicas: Vec<Arc<Replica>> = {
            let map = self.replicas.lock().unwrap();
            map.values().cloned().collect()
        };

        let mut leader = 0;
        let mut leader_term = 0;
        for replica in replicas {
            if let Some(term) = replica.leadership() {
                if term >= leader_term {
                    leader = replica.id();
                    leader_term = term;
                }
            }
        }
        leader
    }
}
