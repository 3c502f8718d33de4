//! The cluster state update queue.
//!
//! All cluster state mutation happens on a single executor task that
//! drains a priority queue of [`UpdateTask`]s one at a time. Callers on
//! any thread submit tasks and read the latest committed state from a
//! `watch` channel; they never see a half-applied state.
//!
//! For each task the executor:
//!
//! 1. skips it if the queue is not running or the task already timed out,
//! 2. executes it against the current state, turning errors and panics
//!    into the task's failure callback,
//! 3. treats an unchanged result as a no-op,
//! 4. persists changed metadata with compare-and-swap; on conflict the task
//!    is parked and resubmitted at [`Priority::Urgent`] after the next
//!    metadata change,
//! 5. commits: bumps the version, swaps the state, publishes the metadata
//!    version in gossip, connects new nodes and notifies listeners,
//! 6. opens an ack barrier for tasks that asked for one.
//!
//! Tasks of higher priority always run first; equal priorities run in
//! submission order. Lower priorities can starve under sustained
//! high-priority load.

use std::any::Any;
use std::cmp::Ordering as CmpOrdering;
use std::collections::{BTreeMap, BinaryHeap, HashSet};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::ack::AckCoordinator;
use crate::fact::MetadataVersionFact;
use crate::gossip::{FactSlot, PeerStateStore};
use crate::persist::ConflictAwarePersister;
use crate::state::{ClusterChangedEvent, ClusterState};
use crate::task::{Priority, UpdateTask};
use crate::transport::{connect_in_background, disconnect_in_background, NodeConnector};
use crate::ClusterError;

/// Running state of the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    Initialized,
    Started,
    Stopped,
}

/// Order in which listener groups are notified after a commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerTier {
    First,
    Normal,
    Last,
}

impl ListenerTier {
    fn index(self) -> usize {
        match self {
            ListenerTier::First => 0,
            ListenerTier::Normal => 1,
            ListenerTier::Last => 2,
        }
    }
}

/// Returned by a listener to stay registered or unregister itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerControl {
    Keep,
    Remove,
}

/// Handle for removing a registered listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

/// Callback invoked on the executor after every commit.
pub type StateListener = Box<dyn FnMut(&ClusterChangedEvent) -> ListenerControl + Send>;

/// Introspection entry for a task waiting in (or running on) the queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingClusterTask {
    pub insert_order: u64,
    pub priority: Priority,
    pub source: String,
    pub time_in_queue: Duration,
    pub executing: bool,
}

/// Collaborators the executor works with.
#[derive(Clone)]
pub struct QueueDeps {
    pub persister: ConflictAwarePersister,
    pub gossip: Arc<dyn PeerStateStore>,
    pub acks: Arc<AckCoordinator>,
    pub connector: Arc<dyn NodeConnector>,
}

/// A submitted task, claimable exactly once at a time by either the
/// executor or its deadline timer.
struct TaskSlot {
    source: String,
    task: Mutex<Option<Box<dyn UpdateTask>>>,
    deadline: Option<(Instant, Duration)>,
    timer: Mutex<Option<JoinHandle<()>>>,
}

impl TaskSlot {
    fn take(&self) -> Option<Box<dyn UpdateTask>> {
        self.task.lock().unwrap_or_else(|e| e.into_inner()).take()
    }

    fn put(&self, task: Box<dyn UpdateTask>) {
        *self.task.lock().unwrap_or_else(|e| e.into_inner()) = Some(task);
    }

    /// Arms the deadline timer while the task waits in the queue.
    fn arm_timer(self: &Arc<Self>, shared: Weak<QueueShared>) {
        if let Some((deadline, _)) = self.deadline {
            let handle = spawn_deadline_timer(shared, self.clone(), deadline);
            if let Some(old) = self.lock_timer().replace(handle) {
                old.abort();
            }
        }
    }

    fn disarm_timer(&self) {
        if let Some(handle) = self.lock_timer().take() {
            handle.abort();
        }
    }

    #[cfg(test)]
    fn has_timer(&self) -> bool {
        self.lock_timer().is_some()
    }

    fn lock_timer(&self) -> std::sync::MutexGuard<'_, Option<JoinHandle<()>>> {
        self.timer.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn expired(&self) -> Option<ClusterError> {
        let (deadline, timeout) = self.deadline?;
        (Instant::now() >= deadline).then(|| ClusterError::Timeout {
            task: self.source.clone(),
            timeout,
        })
    }
}

struct QueuedTask {
    seq: u64,
    priority: Priority,
    slot: Arc<TaskSlot>,
}

impl PartialEq for QueuedTask {
    fn eq(&self, other: &Self) -> bool {
        self.seq == other.seq
    }
}

impl Eq for QueuedTask {}

impl PartialOrd for QueuedTask {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueuedTask {
    // max-heap: higher priority first, then lower sequence number first
    fn cmp(&self, other: &Self) -> CmpOrdering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

struct PendingEntry {
    source: String,
    priority: Priority,
    inserted: Instant,
    executing: bool,
}

#[derive(Default)]
struct Listeners {
    next_id: u64,
    tiers: [Vec<(ListenerId, StateListener)>; 3],
    notifying: bool,
    /// Removals requested while the tiers were lent out for notification.
    tombstones: HashSet<ListenerId>,
}

struct QueueShared {
    tx: mpsc::UnboundedSender<QueuedTask>,
    state: watch::Sender<Arc<ClusterState>>,
    lifecycle: watch::Sender<Lifecycle>,
    seq: AtomicU64,
    pending: Mutex<BTreeMap<u64, PendingEntry>>,
    listeners: Mutex<Listeners>,
}

impl QueueShared {
    fn is_started(&self) -> bool {
        *self.lifecycle.borrow() == Lifecycle::Started
    }

    fn enqueue(self: &Arc<Self>, priority: Priority, slot: Arc<TaskSlot>) {
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        self.lock_pending().insert(
            seq,
            PendingEntry {
                source: slot.source.clone(),
                priority,
                inserted: Instant::now(),
                executing: false,
            },
        );
        if self.tx.send(QueuedTask { seq, priority, slot }).is_err() {
            self.lock_pending().remove(&seq);
            debug!("update queue closed, dropping task");
        }
    }

    fn add_listener(&self, tier: ListenerTier, listener: StateListener) -> ListenerId {
        let mut listeners = self.lock_listeners();
        listeners.next_id += 1;
        let id = ListenerId(listeners.next_id);
        listeners.tiers[tier.index()].push((id, listener));
        id
    }

    fn remove_listener(&self, id: ListenerId) -> bool {
        let mut listeners = self.lock_listeners();
        for tier in listeners.tiers.iter_mut() {
            if let Some(pos) = tier.iter().position(|(lid, _)| *lid == id) {
                tier.remove(pos);
                return true;
            }
        }
        if listeners.notifying {
            listeners.tombstones.insert(id);
            return true;
        }
        false
    }

    /// Runs every listener, tier by tier. The tiers are taken out of the
    /// lock while running so listeners may register or remove listeners.
    fn notify_listeners(&self, event: &ClusterChangedEvent) {
        let mut lent = {
            let mut listeners = self.lock_listeners();
            listeners.notifying = true;
            std::mem::take(&mut listeners.tiers)
        };

        for tier in lent.iter_mut() {
            tier.retain_mut(|(id, listener)| {
                let removed = self.lock_listeners().tombstones.contains(&*id);
                if removed {
                    return false;
                }
                match catch_unwind(AssertUnwindSafe(|| listener(event))) {
                    Ok(ListenerControl::Keep) => true,
                    Ok(ListenerControl::Remove) => false,
                    Err(panic) => {
                        error!(
                            source = event.source(),
                            "cluster state listener panicked: {}",
                            panic_message(panic.as_ref())
                        );
                        true
                    }
                }
            });
        }

        let mut listeners = self.lock_listeners();
        let tombstones = std::mem::take(&mut listeners.tombstones);
        for (returned, added) in lent.iter_mut().zip(listeners.tiers.iter_mut()) {
            returned.retain(|(id, _)| !tombstones.contains(id));
            // registrations made during notification go after the survivors
            returned.append(added);
            std::mem::swap(returned, added);
        }
        listeners.notifying = false;
    }

    fn lock_pending(&self) -> std::sync::MutexGuard<'_, BTreeMap<u64, PendingEntry>> {
        self.pending.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_listeners(&self) -> std::sync::MutexGuard<'_, Listeners> {
        self.listeners.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Handle to the update queue. Cheap to clone.
#[derive(Clone)]
pub struct StateUpdateQueue {
    shared: Arc<QueueShared>,
    startup: Arc<Mutex<Option<(mpsc::UnboundedReceiver<QueuedTask>, QueueDeps)>>>,
}

impl std::fmt::Debug for StateUpdateQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateUpdateQueue")
            .field("lifecycle", &self.lifecycle())
            .field("version", &self.current_state().version())
            .field("pending", &self.number_of_pending_tasks())
            .finish()
    }
}

impl StateUpdateQueue {
    /// Creates a stopped queue holding `initial` as the current state.
    pub fn new(initial: Arc<ClusterState>, deps: QueueDeps) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let shared = Arc::new(QueueShared {
            tx,
            state: watch::Sender::new(initial),
            lifecycle: watch::Sender::new(Lifecycle::Initialized),
            seq: AtomicU64::new(0),
            pending: Mutex::new(BTreeMap::new()),
            listeners: Mutex::new(Listeners::default()),
        });
        Self {
            shared,
            startup: Arc::new(Mutex::new(Some((rx, deps)))),
        }
    }

    /// Spawns the executor. Later calls are no-ops.
    pub fn start(&self) -> Option<JoinHandle<()>> {
        let (rx, deps) = self.startup.lock().unwrap_or_else(|e| e.into_inner()).take()?;
        self.shared.lifecycle.send_replace(Lifecycle::Started);
        let executor = Executor {
            shared: self.shared.clone(),
            rx,
            heap: BinaryHeap::new(),
            deps,
        };
        info!("cluster state update queue started");
        Some(tokio::spawn(executor.run()))
    }

    /// Stops the executor. Queued tasks are dropped without callbacks.
    pub fn stop(&self) {
        let previous = self.shared.lifecycle.send_replace(Lifecycle::Stopped);
        if previous == Lifecycle::Started {
            info!("cluster state update queue stopping");
        }
    }

    pub fn lifecycle(&self) -> Lifecycle {
        *self.shared.lifecycle.borrow()
    }

    pub fn lifecycle_watch(&self) -> watch::Receiver<Lifecycle> {
        self.shared.lifecycle.subscribe()
    }

    /// Enqueues a task. Dropped silently if the queue is not running.
    pub fn submit(&self, source: impl Into<String>, priority: Priority, task: impl UpdateTask) {
        self.submit_boxed(source.into(), priority, Box::new(task));
    }

    pub fn submit_boxed(&self, source: String, priority: Priority, task: Box<dyn UpdateTask>) {
        if !self.shared.is_started() {
            debug!(source, "update queue not running, dropping task");
            return;
        }
        let deadline = task.timeout().map(|t| (Instant::now() + t, t));
        let slot = Arc::new(TaskSlot {
            source,
            task: Mutex::new(Some(task)),
            deadline,
            timer: Mutex::new(None),
        });
        slot.arm_timer(Arc::downgrade(&self.shared));
        self.shared.enqueue(priority, slot);
    }

    /// The latest committed state.
    pub fn current_state(&self) -> Arc<ClusterState> {
        self.shared.state.borrow().clone()
    }

    /// Receiver that observes every committed state.
    pub fn subscribe(&self) -> watch::Receiver<Arc<ClusterState>> {
        self.shared.state.subscribe()
    }

    /// Waits until a committed state satisfies `predicate`, up to `timeout`.
    pub async fn wait_for_state<F>(&self, timeout: Duration, mut predicate: F) -> Option<Arc<ClusterState>>
    where
        F: FnMut(&ClusterState) -> bool,
    {
        let mut rx = self.subscribe();
        let found = tokio::time::timeout(timeout, rx.wait_for(|s| predicate(s.as_ref()))).await;
        match found {
            Ok(Ok(state)) => Some(state.clone()),
            _ => None,
        }
    }

    pub fn add_listener<F>(&self, tier: ListenerTier, listener: F) -> ListenerId
    where
        F: FnMut(&ClusterChangedEvent) -> ListenerControl + Send + 'static,
    {
        self.shared.add_listener(tier, Box::new(listener))
    }

    pub fn remove_listener(&self, id: ListenerId) -> bool {
        self.shared.remove_listener(id)
    }

    /// Tasks waiting or running, highest priority first.
    pub fn pending_tasks(&self) -> Vec<PendingClusterTask> {
        let now = Instant::now();
        let mut tasks: Vec<_> = self
            .shared
            .lock_pending()
            .iter()
            .map(|(seq, entry)| PendingClusterTask {
                insert_order: *seq,
                priority: entry.priority,
                source: entry.source.clone(),
                time_in_queue: now.saturating_duration_since(entry.inserted),
                executing: entry.executing,
            })
            .collect();
        tasks.sort_by(|a, b| {
            b.executing
                .cmp(&a.executing)
                .then(b.priority.cmp(&a.priority))
                .then(a.insert_order.cmp(&b.insert_order))
        });
        tasks
    }

    pub fn number_of_pending_tasks(&self) -> usize {
        self.shared.lock_pending().len()
    }
}

/// Fails the task with a timeout if nothing claimed it by `deadline`.
fn spawn_deadline_timer(shared: Weak<QueueShared>, slot: Arc<TaskSlot>, deadline: Instant) -> JoinHandle<()> {
    tokio::spawn(async move {
        tokio::time::sleep_until(deadline).await;
        let Some(mut task) = slot.take() else {
            return;
        };
        // the pending entry stays until the executor pops the empty slot
        let error = match shared.upgrade() {
            Some(shared) if shared.is_started() => slot.expired().unwrap_or(ClusterError::Closed),
            _ => ClusterError::Closed,
        };
        debug!(source = %slot.source, "task expired before execution: {error}");
        task.on_failure(&slot.source, error);
    })
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_owned()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_owned()
    }
}

struct Executor {
    shared: Arc<QueueShared>,
    rx: mpsc::UnboundedReceiver<QueuedTask>,
    heap: BinaryHeap<QueuedTask>,
    deps: QueueDeps,
}

impl Executor {
    async fn run(mut self) {
        let mut lifecycle = self.shared.lifecycle.subscribe();
        loop {
            if !self.shared.is_started() {
                break;
            }
            if self.heap.is_empty() {
                tokio::select! {
                    msg = self.rx.recv() => match msg {
                        Some(task) => self.heap.push(task),
                        None => break,
                    },
                    changed = lifecycle.changed() => {
                        if changed.is_err() || *lifecycle.borrow() != Lifecycle::Started {
                            break;
                        }
                        continue;
                    }
                }
            }
            // pull in everything already submitted so priorities apply
            while let Ok(task) = self.rx.try_recv() {
                self.heap.push(task);
            }
            if !self.shared.is_started() {
                break;
            }
            if let Some(next) = self.heap.pop() {
                self.run_task(next);
            }
            tokio::task::yield_now().await;
        }

        let dropped = self.heap.len();
        self.heap.clear();
        self.shared.lock_pending().clear();
        info!(dropped, "cluster state update queue stopped");
    }

    fn run_task(&mut self, queued: QueuedTask) {
        if let Some(entry) = self.shared.lock_pending().get_mut(&queued.seq) {
            entry.executing = true;
        }
        self.execute(&queued);
        self.shared.lock_pending().remove(&queued.seq);
    }

    fn execute(&mut self, queued: &QueuedTask) {
        let slot = &queued.slot;
        let source = slot.source.as_str();

        let Some(mut task) = slot.take() else {
            debug!(source, "task already timed out, skipping");
            return;
        };
        slot.disarm_timer();
        if let Some(err) = slot.expired() {
            debug!(source, "task expired in the queue");
            task.on_failure(source, err);
            return;
        }

        let previous = self.shared.state.borrow().clone();
        debug!(source, priority = %queued.priority, "executing cluster state update task");

        let next = match catch_unwind(AssertUnwindSafe(|| task.execute(&previous))) {
            Ok(Ok(next)) => next,
            Ok(Err(e)) => {
                debug!(source, "cluster state update task failed: {e}");
                task.on_failure(source, e);
                return;
            }
            Err(panic) => {
                let msg = panic_message(panic.as_ref());
                error!(source, "cluster state update task panicked: {msg}");
                task.on_failure(source, ClusterError::Task(format!("panicked: {msg}")));
                return;
            }
        };

        if Arc::ptr_eq(&previous, &next) || previous.same_content(&next) {
            debug!(source, "no change in cluster state");
            task.on_processed(source, &previous, &previous);
            if task.ack_timeout().is_some() {
                task.on_all_nodes_acked(None);
            }
            return;
        }

        let metadata_changed = !Arc::ptr_eq(previous.metadata(), next.metadata())
            && previous.metadata() != next.metadata();
        let mut persisted = false;
        if metadata_changed && task.persist_metadata() && !next.blocks().disables_state_persistence() {
            match self.deps.persister.persist(previous.metadata(), next.metadata(), source) {
                Ok(()) => persisted = true,
                Err(e) if e.is_conflict() => {
                    self.park_until_metadata_changes(slot, task, e);
                    return;
                }
                Err(e) => {
                    warn!(source, "failed to persist metadata: {e}");
                    task.on_failure(source, e);
                    return;
                }
            }
        }

        let committed = next.with_version(previous.version() + 1);
        self.shared.state.send_replace(committed.clone());
        let event = ClusterChangedEvent::new(source, committed.clone(), previous.clone());

        let delta = event.nodes_delta();
        if delta.has_changes() {
            info!("{source}: {}", delta.short_summary());
        }
        let local_id = committed.nodes().local_id();
        connect_in_background(
            &self.deps.connector,
            delta.added.iter().filter(|n| n.id != local_id).cloned().collect(),
        );

        if persisted {
            self.deps
                .gossip
                .publish_fact(FactSlot::Schema, committed.metadata().revision());
        }
        self.deps.gossip.publish_fact(
            FactSlot::MetadataVersion,
            MetadataVersionFact::of(committed.metadata()).to_string(),
        );

        self.shared.notify_listeners(&event);

        disconnect_in_background(&self.deps.connector, delta.removed.clone());

        task.on_processed(source, &previous, &committed);
        if let Some(timeout) = task.ack_timeout() {
            self.deps.acks.open(source, task, &committed, timeout);
        }

        debug!(source, version = committed.version(), "cluster state updated");
    }

    /// Parks a conflicting task until the next metadata-changing commit,
    /// then resubmits it at urgent priority with its original deadline.
    fn park_until_metadata_changes(&self, slot: &Arc<TaskSlot>, mut task: Box<dyn UpdateTask>, err: ClusterError) {
        if let Some(expired) = slot.expired() {
            task.on_failure(&slot.source, expired);
            return;
        }
        debug!(source = %slot.source, "{err}; retrying after the next metadata change");
        slot.put(task);
        slot.arm_timer(Arc::downgrade(&self.shared));

        let queue = Arc::downgrade(&self.shared);
        let slot = slot.clone();
        self.shared.add_listener(
            ListenerTier::First,
            Box::new(move |event: &ClusterChangedEvent| {
                if !event.metadata_changed() {
                    return ListenerControl::Keep;
                }
                if let Some(queue) = queue.upgrade() {
                    queue.enqueue(Priority::Urgent, slot.clone());
                }
                ListenerControl::Remove
            }),
        );
    }
}
