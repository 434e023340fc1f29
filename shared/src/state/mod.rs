mod metrics;
mod reducer;
mod snapshot;

use std::sync::{Arc, Mutex};

use tokio::runtime::Handle;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, error, info, instrument, warn};

pub use self::metrics::{MirrorMetrics, MirrorMetricsSnapshot};
pub use self::reducer::{update, Mirror, Transition};
pub use self::snapshot::Snapshot;

use crate::capabilities::DisplayHandleHost;
use crate::error::ValidationError;
use crate::event::Event;
use crate::model::{
    AppStateRecord, DisplayHandle, ItemId, ProblemSolution, ProcessingStatus, SolutionSet,
    UploadedItem, APP_STATE_KEY,
};
use crate::store::{Collection, DurableStore, StoreError};

/// Reactive session state mirrored to a [`DurableStore`].
///
/// Every action commits its snapshot before returning. The durable writes it
/// implies are queued, in commit order, to one detached writer task that
/// callers never await; their outcome is visible only through logs and
/// [`MirrorMetrics`]. The writer starts on the ambient tokio runtime the first
/// time a write is queued from inside one. Writes queued with no runtime
/// running wait for it.
pub struct StateContainer {
    tx: watch::Sender<Snapshot>,
    store: Option<Arc<DurableStore>>,
    queue: mpsc::UnboundedSender<MirrorJob>,
    /// Receiving end, held until the writer task is started.
    pending: Mutex<Option<mpsc::UnboundedReceiver<MirrorJob>>>,
    display: Arc<dyn DisplayHandleHost>,
    metrics: Arc<MirrorMetrics>,
}

enum MirrorJob {
    Write(Mirror),
    Flush(oneshot::Sender<()>),
}

impl StateContainer {
    pub fn new(store: Arc<DurableStore>, display: Arc<dyn DisplayHandleHost>) -> Self {
        Self::build(Some(store), display)
    }

    /// A container whose mutations are never persisted.
    pub fn memory_only(display: Arc<dyn DisplayHandleHost>) -> Self {
        Self::build(None, display)
    }

    fn build(store: Option<Arc<DurableStore>>, display: Arc<dyn DisplayHandleHost>) -> Self {
        let (tx, _rx) = watch::channel(Snapshot::default());
        let (queue, pending) = mpsc::unbounded_channel();
        Self {
            tx,
            store,
            queue,
            pending: Mutex::new(Some(pending)),
            display,
            metrics: Arc::new(MirrorMetrics::new()),
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<Snapshot> {
        self.tx.subscribe()
    }

    pub fn snapshot(&self) -> Snapshot {
        self.tx.borrow().clone()
    }

    pub fn metrics(&self) -> MirrorMetricsSnapshot {
        self.metrics.snapshot()
    }

    pub fn is_persistent(&self) -> bool {
        self.store.is_some()
    }

    // ========================================================================
    // Dispatch
    // ========================================================================

    /// Applies `event` to the latest snapshot, queues the mirror writes the
    /// transition produced, then releases handles.
    ///
    /// Writes are queued while the snapshot lock is held, so the store sees
    /// them in the same order the snapshots were committed.
    #[instrument(skip_all, fields(event = event.name()))]
    pub fn dispatch(&self, event: Event) -> Result<(), ValidationError> {
        let mut outcome = Ok(Vec::new());
        self.tx.send_if_modified(|snap| match update(snap, event) {
            Ok(transition) => {
                let changed = !transition.is_noop(snap);
                let Transition {
                    snapshot,
                    mirror,
                    released,
                } = transition;
                *snap = snapshot;
                for write in mirror {
                    self.enqueue_mirror(write);
                }
                outcome = Ok(released);
                changed
            }
            Err(e) => {
                outcome = Err(e);
                false
            }
        });

        let released = outcome.inspect_err(|e| debug!(error = %e, "event rejected"))?;
        self.release(released);
        self.start_writer();
        Ok(())
    }

    fn dispatch_logged(&self, event: Event) {
        let name = event.name();
        if let Err(e) = self.dispatch(event) {
            warn!(event = name, error = %e, "event rejected");
        }
    }

    fn release(&self, handles: Vec<DisplayHandle>) {
        for handle in handles {
            self.display.revoke(&handle);
            MirrorMetrics::bump(&self.metrics.handles_released);
        }
    }

    fn attach_handle(&self, item: &mut UploadedItem) {
        if item.display_handle.is_none() {
            item.display_handle = Some(self.display.create(&item.payload, &item.mime_type));
            MirrorMetrics::bump(&self.metrics.handles_created);
        }
    }

    fn enqueue_mirror(&self, write: Mirror) {
        if self.store.is_none() {
            MirrorMetrics::bump(&self.metrics.skipped);
            debug!(collection = %write.collection(), "memory-only, mirror write dropped");
            return;
        }

        MirrorMetrics::bump(&self.metrics.issued);
        if let Err(mpsc::error::SendError(job)) = self.queue.send(MirrorJob::Write(write)) {
            MirrorMetrics::bump(&self.metrics.failed);
            if let MirrorJob::Write(write) = job {
                warn!(
                    collection = %write.collection(),
                    key = %write.key(),
                    "mirror writer gone, write dropped"
                );
            }
        }
    }

    /// Spawns the writer task once a runtime is available.
    fn start_writer(&self) {
        let Some(store) = &self.store else {
            return;
        };
        let Ok(mut pending) = self.pending.lock() else {
            return;
        };
        if pending.is_none() {
            return;
        }
        let Ok(runtime) = Handle::try_current() else {
            debug!("no runtime yet, mirror writes stay queued");
            return;
        };
        if let Some(jobs) = pending.take() {
            runtime.spawn(run_writer(jobs, Arc::clone(store), Arc::clone(&self.metrics)));
        }
    }

    /// Waits until every mirror write queued before the call has been applied.
    pub async fn settle(&self) {
        if self.store.is_none() {
            return;
        }
        self.start_writer();
        let (done, flushed) = oneshot::channel();
        if self.queue.send(MirrorJob::Flush(done)).is_err() {
            return;
        }
        if flushed.await.is_err() {
            error!("mirror writer stopped before flushing");
        }
    }

    // ========================================================================
    // Items
    // ========================================================================

    /// Appends the batch, creating a display handle for each item.
    pub fn ingest_items(&self, items: Vec<UploadedItem>) -> Vec<ItemId> {
        let items: Vec<UploadedItem> = items
            .into_iter()
            .map(|mut item| {
                self.attach_handle(&mut item);
                item
            })
            .collect();
        let ids = items.iter().map(|i| i.id.clone()).collect();
        self.dispatch_logged(Event::ItemsIngested { items });
        ids
    }

    /// Unknown ids are ignored.
    pub fn update_status(&self, id: &ItemId, status: ProcessingStatus) {
        self.dispatch_logged(Event::StatusChanged {
            id: id.clone(),
            status,
        });
    }

    pub fn set_streaming_text(&self, id: &ItemId, text: Option<String>) {
        self.dispatch_logged(Event::StreamingTextChanged {
            id: id.clone(),
            text,
        });
    }

    /// Removes the item and its solutions. Removing an absent item does
    /// nothing, so its handle is never released twice.
    pub fn remove_item(&self, id: &ItemId) {
        self.dispatch_logged(Event::ItemRemoved { id: id.clone() });
    }

    // ========================================================================
    // Solutions
    // ========================================================================

    pub fn set_solution(&self, solution: SolutionSet) {
        self.dispatch_logged(Event::SolutionStored { solution });
    }

    pub fn append_problem(&self, item_id: &ItemId, problem: ProblemSolution) {
        self.dispatch_logged(Event::ProblemAppended {
            item_id: item_id.clone(),
            problem,
        });
    }

    pub fn update_problem(
        &self,
        item_id: &ItemId,
        index: usize,
        problem: ProblemSolution,
    ) -> Result<(), ValidationError> {
        self.dispatch(Event::ProblemReplaced {
            item_id: item_id.clone(),
            index,
            problem,
        })
    }

    // ========================================================================
    // Selection
    // ========================================================================

    pub fn select_item(&self, id: Option<ItemId>) -> Result<(), ValidationError> {
        self.dispatch(Event::ItemSelected { id })
    }

    /// Out-of-range indices are clamped to the selected solution's problems.
    pub fn select_problem(&self, index: i64) {
        self.dispatch_logged(Event::ProblemSelected { index });
    }

    // ========================================================================
    // Bulk operations
    // ========================================================================

    /// Releases every handle, clears the store, then resets the snapshot.
    /// The snapshot is reset even when the store clear fails; the error is
    /// returned so the caller can re-verify.
    #[instrument(skip(self))]
    pub async fn clear_all(&self) -> Result<(), StoreError> {
        self.dispatch_logged(Event::HandlesReleased);
        self.settle().await;

        let result = match &self.store {
            Some(store) => store.clear_all().await,
            None => Ok(()),
        };
        self.dispatch_logged(Event::Reset);

        match &result {
            Ok(()) => info!("all state cleared"),
            Err(e) => error!(error = %e, "store clear failed, memory reset anyway"),
        }
        result
    }

    /// Replaces the snapshot with the store's contents. On failure the
    /// container is left empty and the error returned.
    #[instrument(skip(self))]
    pub async fn load_from_store(&self) -> Result<(), StoreError> {
        let Some(store) = self.store.clone() else {
            debug!("memory-only, nothing to load");
            return Ok(());
        };

        match read_all(&store).await {
            Ok((mut items, solutions, app_state)) => {
                for item in &mut items {
                    self.attach_handle(item);
                }
                info!(items = items.len(), solutions = solutions.len(), "state loaded");
                self.dispatch_logged(Event::Loaded {
                    items,
                    solutions,
                    app_state,
                });
                Ok(())
            }
            Err(e) => {
                error!(error = %e, "loading state failed, starting empty");
                self.dispatch_logged(Event::Loaded {
                    items: Vec::new(),
                    solutions: Vec::new(),
                    app_state: None,
                });
                Err(e)
            }
        }
    }
}

async fn read_all(
    store: &DurableStore,
) -> Result<(Vec<UploadedItem>, Vec<SolutionSet>, Option<AppStateRecord>), StoreError> {
    store.open().await?;
    let items = store.get_all::<UploadedItem>().await?;
    let solutions = store.get_all::<SolutionSet>().await?;
    let app_state = store.get::<AppStateRecord>(APP_STATE_KEY).await?;
    Ok((items, solutions, app_state))
}

/// Applies queued writes one at a time, in queue order, until the container
/// is dropped.
async fn run_writer(
    mut jobs: mpsc::UnboundedReceiver<MirrorJob>,
    store: Arc<DurableStore>,
    metrics: Arc<MirrorMetrics>,
) {
    while let Some(job) = jobs.recv().await {
        match job {
            MirrorJob::Write(write) => {
                let collection = write.collection();
                let key = write.key();
                match apply_mirror(&store, write).await {
                    Ok(()) => MirrorMetrics::bump(&metrics.succeeded),
                    Err(e) => {
                        MirrorMetrics::bump(&metrics.failed);
                        warn!(%collection, %key, error = %e, "mirror write failed");
                    }
                }
            }
            MirrorJob::Flush(done) => {
                let _ = done.send(());
            }
        }
    }
    debug!("mirror writer stopped");
}

async fn apply_mirror(store: &DurableStore, write: Mirror) -> Result<(), StoreError> {
    match write {
        Mirror::PutItem(item) => store.put(&item).await,
        Mirror::DeleteItem(id) => store.delete(Collection::Files, id.as_str()).await,
        Mirror::PutSolution(set) => store.put(&set).await,
        Mirror::DeleteSolution(id) => store.delete(Collection::Solutions, id.as_str()).await,
        Mirror::PutAppState(state) => store.put(&state).await,
    }
}
