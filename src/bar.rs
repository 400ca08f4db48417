use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use tracing::debug;

use crate::stage::StageData;
use crate::tree::{StageId, Tree};
use crate::{
    ProgressListener, ProgressStream, ProgressUpdate, ProgressVector, Result, Stage, UpdateKind,
};

/// Buffer size of the update broadcast channel unless configured otherwise
pub const DEFAULT_UPDATE_CAPACITY: usize = 16;

/// State shared by every stage of one tree
///
/// The mutex is the only lock of the tree: every attach, completion and
/// failure holds it from the precondition check until the listener returns.
pub(crate) struct Shared<M> {
    tree: Mutex<Tree<M>>,
    listener: Box<dyn ProgressListener<M>>,
    update_sender: broadcast::Sender<ProgressUpdate<M>>,
}

impl<M> Shared<M> {
    /// Mutations finish before the listener runs, so a poisoned lock still
    /// guards a consistent tree
    pub(crate) fn lock(&self) -> MutexGuard<'_, Tree<M>> {
        self.tree.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Must be called while the caller holds [`Shared::lock`]
    pub(crate) fn notify(&self, kind: UpdateKind, progress: ProgressVector, stage: &Stage<M>) {
        match kind {
            UpdateKind::Done => self.listener.on_done(progress, stage),
            UpdateKind::Failed => self.listener.on_fail(progress, stage),
        }

        // broadcast to all subscribers, ignore send errors (no subscribers)
        let _ = self.update_sender.send(ProgressUpdate {
            kind,
            progress,
            stage: stage.clone(),
        });
    }
}

/// Configures a [`ProgressBar`] before it is created
#[derive(Debug, Clone)]
pub struct ProgressBarBuilder<M> {
    name: String,
    metadata: M,
    update_capacity: usize,
}

impl<M: Send + Sync + 'static> ProgressBarBuilder<M> {
    /// Metadata of the root stage
    pub fn metadata(mut self, metadata: M) -> Self {
        self.metadata = metadata;
        self
    }

    /// How many updates a slow [subscriber](ProgressBar::subscribe) may fall
    /// behind before it starts missing them
    pub fn update_capacity(mut self, capacity: usize) -> Self {
        self.update_capacity = capacity.max(1);
        self
    }

    pub fn build(self, listener: impl ProgressListener<M> + 'static) -> ProgressBar<M> {
        let (update_sender, _) = broadcast::channel(self.update_capacity);
        let Self { name, metadata, .. } = self;

        let data = Arc::new(StageData::new(name, metadata, 0));
        let shared = Arc::new(Shared {
            tree: Mutex::new(Tree::new(data.clone())),
            listener: Box::new(listener),
            update_sender,
        });
        let root = Stage::attached(data, shared.clone(), StageId::ROOT);
        debug!(bar = %root.name(), "progress bar created");

        ProgressBar { shared, root }
    }
}

/// The root of a stage tree
///
/// A progress bar is a stage of weight 0 that additionally owns the tree's
/// lock, the done and failed counters, the log of resolved stages and the
/// listener. It has to be [started](ProgressBar::start) before any of its
/// children can resolve.
pub struct ProgressBar<M = ()> {
    shared: Arc<Shared<M>>,
    root: Stage<M>,
}

impl<M> Clone for ProgressBar<M> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
            root: self.root.clone(),
        }
    }
}

impl<M> fmt::Debug for ProgressBar<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // no locking here, the listener may be formatting us
        f.debug_struct("ProgressBar")
            .field("name", &self.root.name())
            .finish()
    }
}

impl<M: Default + Send + Sync + 'static> ProgressBar<M> {
    /// Create a new progress bar with default root metadata
    pub fn new(name: impl Into<String>, listener: impl ProgressListener<M> + 'static) -> Self {
        Self::builder(name).build(listener)
    }

    pub fn builder(name: impl Into<String>) -> ProgressBarBuilder<M> {
        ProgressBarBuilder {
            name: name.into(),
            metadata: M::default(),
            update_capacity: DEFAULT_UPDATE_CAPACITY,
        }
    }
}

impl<M: Send + Sync + 'static> ProgressBar<M> {
    /// The root stage
    pub fn stage(&self) -> &Stage<M> {
        &self.root
    }

    pub fn name(&self) -> &str {
        self.root.name()
    }

    /// Start the bar by completing its root stage
    pub fn start(&self) -> Result<()> {
        self.root.complete()
    }

    /// Attach `child` directly under the root
    pub fn attach(&self, child: &Stage<M>) -> Result<()> {
        self.root.attach(child)
    }

    /// Current values of all three counters
    pub fn progress(&self) -> ProgressVector {
        self.shared.lock().progress()
    }

    /// Total weight of every attached stage; grows as stages are attached
    pub fn total(&self) -> u64 {
        self.progress().total
    }

    pub fn done_vector(&self) -> u64 {
        self.progress().done
    }

    pub fn failed_vector(&self) -> u64 {
        self.progress().failed
    }

    /// Every resolved stage in resolution order
    ///
    /// Completions add one entry. A failure adds the failed stage followed by
    /// all of its descendants.
    pub fn completed_stages(&self) -> Vec<Stage<M>> {
        let tree = self.shared.lock();
        tree.completed()
            .iter()
            .map(|&id| Stage::from_tree(&self.shared, &tree, id))
            .collect()
    }

    /// Number of attached stages, including the root
    pub fn stage_count(&self) -> usize {
        self.shared.lock().len()
    }

    /// Subscribe to the updates of this bar
    ///
    /// Only updates sent after subscribing are observed.
    pub fn subscribe(&self) -> ProgressStream<M> {
        ProgressStream::new(BroadcastStream::new(self.shared.update_sender.subscribe()))
    }
}
