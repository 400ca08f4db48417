use std::fmt;
use std::sync::{Arc, OnceLock};

use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};
use tracing::{debug, warn};

use crate::bar::Shared;
use crate::tree::{StageId, Tree};
use crate::{InvalidReason, ProgressError, Result, StageState, UpdateKind};

/// A guard that automatically completes a [`Stage`] when dropped
#[must_use = "if unused, the stage will be completed immediately"]
pub struct CompleteGuard<'a, M: Send + Sync + 'static> {
    stage: &'a Stage<M>,
}

impl<'a, M: Send + Sync + 'static> CompleteGuard<'a, M> {
    /// Forgets the guard without completing the stage
    pub fn forget(self) {
        std::mem::forget(self);
    }
}

impl<'a, M: Send + Sync + 'static> Drop for CompleteGuard<'a, M> {
    fn drop(&mut self) {
        if let Err(error) = self.stage.complete() {
            warn!(stage = %self.stage.name(), %error, "complete guard could not complete stage");
        }
    }
}

/// Immutable part of a stage, shared between its handles and the arena
pub(crate) struct StageData<M> {
    pub(crate) name: String,
    pub(crate) metadata: M,
    pub(crate) weight: u64,
    pub(crate) cancel_token: CancellationToken,
}

impl<M> StageData<M> {
    pub(crate) fn new(name: String, metadata: M, weight: u64) -> Self {
        Self {
            name,
            metadata,
            weight,
            cancel_token: CancellationToken::new(),
        }
    }
}

/// Where an attached stage lives
///
/// Holding the tree keeps it alive for as long as any handle to one of its
/// stages exists. The arena itself only stores [`StageData`], so this does
/// not form a cycle.
struct Slot<M> {
    tree: Arc<Shared<M>>,
    id: StageId,
}

/// One unit of work in a progress tree
///
/// A stage starts out detached. Once [attached](Stage::attach) it belongs to
/// the tree of its parent's [`ProgressBar`](crate::ProgressBar) and can be
/// resolved from any thread. Cloning is cheap and every clone refers to the
/// same stage.
pub struct Stage<M = ()> {
    data: Arc<StageData<M>>,
    slot: Arc<OnceLock<Slot<M>>>,
}

impl<M> Clone for Stage<M> {
    fn clone(&self) -> Self {
        Self {
            data: self.data.clone(),
            slot: self.slot.clone(),
        }
    }
}

impl<M> PartialEq for Stage<M> {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.data, &other.data)
    }
}

impl<M> Eq for Stage<M> {}

impl<M> fmt::Debug for Stage<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Stage")
            .field("name", &self.data.name)
            .field("weight", &self.data.weight)
            .field("attached", &self.slot.get().is_some())
            .finish()
    }
}

impl<M> Stage<M> {
    /// Create a detached stage with weight 1
    pub fn new(name: impl Into<String>, metadata: M) -> Self {
        Self::with_weight(name, metadata, 1)
    }

    /// Create a detached stage with an explicit weight
    pub fn with_weight(name: impl Into<String>, metadata: M, weight: u64) -> Self {
        Self {
            data: Arc::new(StageData::new(name.into(), metadata, weight)),
            slot: Arc::new(OnceLock::new()),
        }
    }

    /// A handle to a stage that already lives in `tree`
    pub(crate) fn attached(data: Arc<StageData<M>>, tree: Arc<Shared<M>>, id: StageId) -> Self {
        Self {
            data,
            slot: Arc::new(OnceLock::from(Slot { tree, id })),
        }
    }

    /// Rebuild the handle of node `id` while its tree is locked
    pub(crate) fn from_tree(shared: &Arc<Shared<M>>, tree: &Tree<M>, id: StageId) -> Self {
        Self::attached(tree.node(id).data.clone(), shared.clone(), id)
    }

    pub fn name(&self) -> &str {
        &self.data.name
    }

    pub fn metadata(&self) -> &M {
        &self.data.metadata
    }

    /// This stage's own contribution to the total
    pub fn weight(&self) -> u64 {
        self.data.weight
    }

    /// Whether this stage has been cancelled or failed
    pub fn is_cancelled(&self) -> bool {
        self.data.cancel_token.is_cancelled()
    }

    /// Resolves once this stage fails, or is cancelled by a failing ancestor
    pub fn cancelled(&self) -> WaitForCancellationFuture<'_> {
        self.data.cancel_token.cancelled()
    }

    /// Whether this stage belongs to a progress bar
    pub fn is_attached(&self) -> bool {
        self.slot.get().is_some()
    }

    fn invalid(&self, reason: InvalidReason) -> ProgressError {
        ProgressError::InvalidOperation {
            stage: self.data.name.clone(),
            reason,
        }
    }

    /// Find the progress bar that owns this stage
    fn locate(&self) -> Result<(&Arc<Shared<M>>, StageId)> {
        let slot = self.slot.get().ok_or_else(|| ProgressError::DetachedStage {
            stage: self.data.name.clone(),
        })?;
        Ok((&slot.tree, slot.id))
    }
}

impl<M: Send + Sync + 'static> Stage<M> {
    /// Attach `child` as the last child of this stage
    ///
    /// Allowed while this stage is `Initial` or `Done`; the child's weight is
    /// added to this stage and every ancestor, so the bar's total may grow
    /// after earlier notifications.
    pub fn attach(&self, child: &Stage<M>) -> Result<()> {
        let (shared, parent) = self.locate()?;
        let mut tree = shared.lock();

        tree.check_attachable(parent)
            .map_err(|reason| self.invalid(reason))?;

        let slot = Slot {
            tree: shared.clone(),
            id: tree.next_id(),
        };
        if child.slot.set(slot).is_err() {
            return Err(child.invalid(InvalidReason::AlreadyAttached));
        }

        tree.insert(parent, child.data.clone());
        debug!(
            stage = %child.name(),
            parent = %self.name(),
            weight = child.weight(),
            total = tree.node(StageId::ROOT).tree_weight,
            "stage attached"
        );

        Ok(())
    }

    /// Mark this stage as done
    ///
    /// The stage must still be `Initial` and its parent, if any, must be
    /// `Done`. The listener is notified before this returns.
    pub fn complete(&self) -> Result<()> {
        let (shared, id) = self.locate()?;
        let mut tree = shared.lock();

        tree.check_resolvable(id)
            .map_err(|reason| self.invalid(reason))?;

        let progress = tree.mark_done(id);
        debug!(stage = %self.name(), ?progress, "stage done");
        shared.notify(UpdateKind::Done, progress, self);

        Ok(())
    }

    /// Mark this stage as failed, cancelling all of its descendants
    ///
    /// Same preconditions as [`Stage::complete`]. The whole subtree weight is
    /// charged to the failed counter and a single failure notification covers
    /// the cascade.
    pub fn fail(&self) -> Result<()> {
        let (shared, id) = self.locate()?;
        let mut tree = shared.lock();

        tree.check_resolvable(id)
            .map_err(|reason| self.invalid(reason))?;

        let progress = tree.mark_failed(id);
        debug!(stage = %self.name(), ?progress, "stage failed");
        shared.notify(UpdateKind::Failed, progress, self);

        Ok(())
    }

    /// Creates a guard that will complete this stage when dropped
    pub fn complete_guard(&self) -> CompleteGuard<'_, M> {
        CompleteGuard { stage: self }
    }

    /// Current state; detached stages report [`StageState::Initial`]
    pub fn state(&self) -> StageState {
        self.read(|_, tree, id| tree.node(id).state)
            .unwrap_or_default()
    }

    /// Weight of this stage plus all currently attached descendants
    pub fn tree_weight(&self) -> u64 {
        self.read(|_, tree, id| tree.node(id).tree_weight)
            .unwrap_or(self.data.weight)
    }

    pub fn parent(&self) -> Option<Stage<M>> {
        self.read(|shared, tree, id| {
            tree.node(id)
                .parent
                .map(|parent| Stage::from_tree(shared, tree, parent))
        })
        .flatten()
    }

    /// Direct children in attachment order
    pub fn children(&self) -> Vec<Stage<M>> {
        self.read(|shared, tree, id| {
            tree.node(id)
                .children
                .iter()
                .map(|&child| Stage::from_tree(shared, tree, child))
                .collect()
        })
        .unwrap_or_default()
    }

    /// This stage followed by all of its descendants, in pre-order
    pub fn subtree(&self) -> Vec<Stage<M>> {
        self.read(|shared, tree, id| {
            tree.subtree(id)
                .into_iter()
                .map(|member| Stage::from_tree(shared, tree, member))
                .collect()
        })
        .unwrap_or_else(|| vec![self.clone()])
    }

    fn read<T>(&self, f: impl FnOnce(&Arc<Shared<M>>, &Tree<M>, StageId) -> T) -> Option<T> {
        let (shared, id) = self.locate().ok()?;
        let tree = shared.lock();
        Some(f(shared, &*tree, id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ProgressBar;
    use crate::NoopListener;

    fn bar() -> ProgressBar {
        ProgressBar::new("bar", NoopListener)
    }

    #[test]
    fn test_detached_stage() {
        let stage: Stage = Stage::new("1", ());

        assert!(!stage.is_attached());
        assert_eq!(stage.state(), StageState::Initial);
        assert_eq!(stage.tree_weight(), 1);
        assert!(stage.parent().is_none());
        assert!(stage.children().is_empty());
        assert_eq!(stage.subtree(), vec![stage.clone()]);

        assert_eq!(
            stage.complete(),
            Err(ProgressError::DetachedStage {
                stage: "1".to_string()
            })
        );
        assert!(matches!(stage.fail(), Err(ProgressError::DetachedStage { .. })));
    }

    #[test]
    fn test_attach_under_detached_parent() {
        let parent: Stage = Stage::new("parent", ());
        let child = Stage::new("child", ());

        assert!(matches!(
            parent.attach(&child),
            Err(ProgressError::DetachedStage { stage }) if stage == "parent"
        ));
        assert!(!child.is_attached());
    }

    #[test]
    fn test_stages_outlive_dropped_bar() {
        let bar = bar();
        let root = bar.stage().clone();
        let worker = Stage::new("worker", ());
        bar.attach(&worker).unwrap();

        drop(bar);

        assert!(worker.is_attached());
        root.complete().unwrap();
        worker.complete().unwrap();
        assert_eq!(worker.state(), StageState::Done);
        assert_eq!(worker.parent(), Some(root.clone()));
        assert_eq!(root.children(), vec![worker.clone()]);

        // the tree is still reachable through a handle rebuilt from it
        let late = Stage::new("late", ());
        worker.attach(&late).unwrap();
        assert_eq!(root.tree_weight(), 2);
        assert_eq!(late.parent(), Some(worker));
    }

    #[test]
    fn test_attach_twice_rejected() {
        let bar = bar();
        let other = self::bar();
        let stage = Stage::new("1", ());

        bar.attach(&stage).unwrap();
        assert_eq!(
            other.attach(&stage),
            Err(ProgressError::InvalidOperation {
                stage: "1".to_string(),
                reason: InvalidReason::AlreadyAttached,
            })
        );
        assert!(matches!(
            bar.attach(&stage),
            Err(ProgressError::InvalidOperation {
                reason: InvalidReason::AlreadyAttached,
                ..
            })
        ));
        assert_eq!(bar.total(), 1);
        assert_eq!(other.total(), 0);
    }

    #[test]
    fn test_bar_root_cannot_be_reparented() {
        let bar = bar();
        let other = self::bar();

        assert!(matches!(
            other.attach(bar.stage()),
            Err(ProgressError::InvalidOperation {
                reason: InvalidReason::AlreadyAttached,
                ..
            })
        ));
    }

    #[test]
    fn test_navigation() {
        let bar = bar();
        let a = Stage::new("a", ());
        let b = Stage::with_weight("b", (), 4);
        let c = Stage::new("c", ());
        bar.attach(&a).unwrap();
        a.attach(&b).unwrap();
        a.attach(&c).unwrap();

        assert_eq!(a.parent().as_ref(), Some(bar.stage()));
        assert_eq!(b.parent(), Some(a.clone()));
        assert!(bar.stage().parent().is_none());
        assert_eq!(a.children(), vec![b.clone(), c.clone()]);
        assert_eq!(a.tree_weight(), 6);
        assert_eq!(b.tree_weight(), 4);

        let names: Vec<_> = bar
            .stage()
            .subtree()
            .iter()
            .map(|s| s.name().to_string())
            .collect();
        assert_eq!(names, vec!["bar", "a", "b", "c"]);
    }

    #[test]
    fn test_metadata_is_opaque() {
        let bar: ProgressBar<Vec<&'static str>> = ProgressBar::builder("bar")
            .metadata(vec!["root"])
            .build(NoopListener);
        let stage = Stage::new("download", vec!["url", "https://example.com"]);
        bar.attach(&stage).unwrap();

        assert_eq!(bar.stage().metadata(), &vec!["root"]);
        assert_eq!(stage.metadata()[1], "https://example.com");
    }

    #[test]
    fn test_complete_guard() {
        let bar = bar();
        let stage = Stage::new("1", ());
        bar.attach(&stage).unwrap();
        bar.start().unwrap();

        {
            let _guard = stage.complete_guard();
            assert_eq!(stage.state(), StageState::Initial);
        } // guard is dropped here, stage should be done

        assert_eq!(stage.state(), StageState::Done);
        assert_eq!(bar.done_vector(), 1);

        // test forget
        let other = Stage::new("2", ());
        bar.attach(&other).unwrap();
        {
            let guard = other.complete_guard();
            guard.forget();
        }
        assert_eq!(other.state(), StageState::Initial);

        // a guard whose stage cannot complete only logs
        let detached: Stage = Stage::new("3", ());
        drop(detached.complete_guard());
        assert_eq!(detached.state(), StageState::Initial);
    }

    #[tokio::test]
    async fn test_cancelled_future() {
        let bar = bar();
        let parent = Stage::new("parent", ());
        let child = Stage::new("child", ());
        let sibling = Stage::new("sibling", ());
        bar.attach(&parent).unwrap();
        bar.attach(&sibling).unwrap();
        parent.attach(&child).unwrap();
        bar.start().unwrap();

        let waiter = {
            let child = child.clone();
            tokio::spawn(async move {
                child.cancelled().await;
                child.state()
            })
        };

        parent.fail().unwrap();

        assert_eq!(waiter.await.unwrap(), StageState::Cancel);
        assert!(parent.is_cancelled());
        assert!(child.is_cancelled());
        assert!(!sibling.is_cancelled());
        assert!(!bar.stage().is_cancelled());
    }
}
