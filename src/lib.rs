//! A hierarchical stage tracking library that rolls weighted progress up a
//! tree of stages and reports every completion and failure to a listener.
//!
//! # Overview
//!
//! A [`ProgressBar`] is the root of a tree of [`Stage`]s. Every stage has a
//! weight, and the bar keeps three counters, together a [`ProgressVector`]:
//!
//! - **done**: the weight of every stage that was completed
//! - **failed**: the subtree weight of every stage that failed
//! - **total**: the weight of every stage currently attached to the tree
//!
//! Stages are resolved top-down: a stage may only complete or fail once its
//! parent is done, and a progress bar has to be [started](ProgressBar::start)
//! before its children can resolve. Failing a stage cancels its whole
//! subtree.
//!
//! # Examples
//!
//! Basic usage with a listener:
//!
//! ```rust
//! use stage_tree::{ProgressBar, Stage, StageState, TracingListener};
//!
//! let bar = ProgressBar::new("Deploy", TracingListener);
//!
//! let build = Stage::with_weight("Build", (), 3);
//! let upload = Stage::new("Upload", ());
//! bar.attach(&build).unwrap();
//! bar.attach(&upload).unwrap();
//! assert_eq!(bar.total(), 4);
//!
//! bar.start().unwrap();
//! build.complete().unwrap();
//! upload.fail().unwrap();
//!
//! assert_eq!(bar.done_vector(), 3);
//! assert_eq!(bar.failed_vector(), 1);
//! assert_eq!(upload.state(), StageState::Fail);
//! ```
//!
//! The tree may keep growing after parts of it resolved, so the total can
//! increase after earlier notifications:
//!
//! ```rust
//! use stage_tree::{NoopListener, ProgressBar, Stage};
//!
//! let bar = ProgressBar::new("Crawl", NoopListener);
//! let index = Stage::new("index.html", ());
//! bar.attach(&index).unwrap();
//! bar.start().unwrap();
//! index.complete().unwrap();
//!
//! // links discovered while processing the page
//! for link in ["a.html", "b.html"] {
//!     index.attach(&Stage::new(link, ())).unwrap();
//! }
//!
//! let progress = bar.progress();
//! assert_eq!((progress.done, progress.total), (1, 3));
//! ```
//!
//! Observing updates as a stream:
//!
//! ```rust
//! use futures::StreamExt;
//! use stage_tree::{NoopListener, ProgressBar, UpdateKind};
//!
//! #[tokio::main]
//! async fn main() {
//!     let bar: ProgressBar = ProgressBar::new("Backup", NoopListener);
//!     let mut updates = bar.subscribe();
//!
//!     bar.start().unwrap();
//!
//!     let update = updates.next().await.unwrap().unwrap();
//!     assert_eq!(update.kind, UpdateKind::Done);
//!     assert_eq!(update.stage.name(), "Backup");
//! }
//! ```
//!
//! # Concurrency
//!
//! Every tree is guarded by a single mutex owned by its progress bar.
//! Attaching, completing and failing stages may happen from any number of
//! threads; each operation holds the lock from its precondition check until
//! the listener has returned, so all operations and notifications are
//! totally ordered. Read accessors take the same lock and return snapshots.
//!
//! # Implementation Notes
//!
//! - Weights are immutable; only the subtree weights grow, when stages are
//!   attached
//! - Stages are never removed from a tree, they only change state
//! - Children can be attached below `Initial` and `Done` stages, but not
//!   below failed or cancelled ones
//! - A failure charges the whole subtree weight, cancelled descendants
//!   included, to the failed counter
//! - Listeners must not touch the tree they are listening to
//! - A tree lives as long as its progress bar or any of its attached stages

mod bar;
mod stage;
mod tree;

use std::fmt;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures::Stream;
use pin_project_lite::pin_project;
use thiserror::Error;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tracing::info;

pub use bar::{DEFAULT_UPDATE_CAPACITY, ProgressBar, ProgressBarBuilder};
pub use stage::{CompleteGuard, Stage};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProgressError {
    /// The stage was never attached to a progress bar
    #[error("stage `{stage}` is not attached to a progress bar")]
    DetachedStage { stage: String },
    /// The tree rejected the operation; nothing was changed
    #[error("invalid operation on stage `{stage}`: {reason}")]
    InvalidOperation { stage: String, reason: InvalidReason },
    /// Too many updates have occurred since the stream was last polled, so
    /// some of them have been dropped
    #[error("progress updates lagged, {skipped} skipped")]
    Lagged {
        /// Number of updates the subscriber missed
        skipped: u64,
    },
}

/// Why an operation was rejected
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum InvalidReason {
    #[error("parent stage is {0:?}, no children can be attached")]
    ParentClosed(StageState),
    #[error("stage is already {0:?}")]
    AlreadyResolved(StageState),
    #[error("parent stage is {0:?}, not Done")]
    ParentNotDone(StageState),
    #[error("stage is already attached to a tree")]
    AlreadyAttached,
}

pub type Result<T, E = ProgressError> = std::result::Result<T, E>;

/// Resolution state of a [`Stage`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum StageState {
    /// Not resolved yet
    #[default]
    Initial,
    /// Completed successfully
    Done,
    /// Failed; every descendant has been cancelled
    Fail,
    /// Cancelled because an ancestor failed
    Cancel,
}

impl StageState {
    /// Whether the stage has left [`StageState::Initial`]
    pub fn is_resolved(self) -> bool {
        !matches!(self, StageState::Initial)
    }

    /// Whether new children may still be attached under a stage in this state
    pub fn accepts_children(self) -> bool {
        !matches!(self, StageState::Fail | StageState::Cancel)
    }
}

/// Snapshot of the three rollup counters of a progress bar
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ProgressVector {
    /// Sum of the own weights of every completed stage
    pub done: u64,
    /// Sum of the weights of every attached stage
    pub total: u64,
    /// Subtree weight of every failed stage, cancelled descendants included
    pub failed: u64,
}

impl ProgressVector {
    /// Weight that has been resolved one way or another
    pub fn resolved(&self) -> u64 {
        self.done.saturating_add(self.failed)
    }

    /// Resolved weight as a fraction of the total, clamped to 0.0-1.0
    ///
    /// Returns `None` while the total is zero.
    pub fn fraction(&self) -> Option<f64> {
        if self.total == 0 {
            return None;
        }

        Some((self.resolved() as f64 / self.total as f64).min(1.0))
    }
}

/// Receives a notification every time a stage of a progress bar resolves
///
/// Callbacks run synchronously while the progress bar's lock is held, so
/// every notification sees a consistent snapshot and notifications arrive in
/// one total order. An implementation must return promptly and must not
/// attach, complete or fail any stage of the same progress bar, since that
/// would deadlock.
pub trait ProgressListener<M>: Send + Sync {
    /// A stage was completed
    fn on_done(&self, progress: ProgressVector, stage: &Stage<M>);

    /// A stage failed; its whole subtree has been cancelled
    fn on_fail(&self, progress: ProgressVector, stage: &Stage<M>);
}

impl<M, L: ProgressListener<M> + ?Sized> ProgressListener<M> for Arc<L> {
    fn on_done(&self, progress: ProgressVector, stage: &Stage<M>) {
        (**self).on_done(progress, stage)
    }

    fn on_fail(&self, progress: ProgressVector, stage: &Stage<M>) {
        (**self).on_fail(progress, stage)
    }
}

/// Ignores every notification, for progress bars only observed through
/// [`ProgressBar::subscribe`]
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopListener;

impl<M> ProgressListener<M> for NoopListener {
    fn on_done(&self, _progress: ProgressVector, _stage: &Stage<M>) {}

    fn on_fail(&self, _progress: ProgressVector, _stage: &Stage<M>) {}
}

/// Logs every notification as a `tracing` event
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingListener;

impl<M> ProgressListener<M> for TracingListener {
    fn on_done(&self, progress: ProgressVector, stage: &Stage<M>) {
        info!(
            stage = %stage.name(),
            done = progress.done,
            failed = progress.failed,
            total = progress.total,
            "stage done"
        );
    }

    fn on_fail(&self, progress: ProgressVector, stage: &Stage<M>) {
        info!(
            stage = %stage.name(),
            done = progress.done,
            failed = progress.failed,
            total = progress.total,
            "stage failed"
        );
    }
}

/// Which notification an update corresponds to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum UpdateKind {
    Done,
    Failed,
}

/// Data for a progress update event, broadcast alongside every listener
/// notification
pub struct ProgressUpdate<M> {
    /// Whether the stage completed or failed
    pub kind: UpdateKind,
    /// Counters right after the stage resolved
    pub progress: ProgressVector,
    /// The stage that resolved
    pub stage: Stage<M>,
}

impl<M> Clone for ProgressUpdate<M> {
    fn clone(&self) -> Self {
        Self {
            kind: self.kind,
            progress: self.progress,
            stage: self.stage.clone(),
        }
    }
}

impl<M> fmt::Debug for ProgressUpdate<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProgressUpdate")
            .field("kind", &self.kind)
            .field("progress", &self.progress)
            .field("stage", &self.stage)
            .finish()
    }
}

pin_project! {
    /// A Stream that yields the updates of a [`ProgressBar`]
    ///
    /// Yields [`ProgressError::Lagged`] when the subscriber fell too far
    /// behind and some updates were dropped. Ends once the progress bar and
    /// every stage attached to it are gone.
    #[must_use = "streams do nothing unless polled"]
    pub struct ProgressStream<M> {
        #[pin]
        rx: BroadcastStream<ProgressUpdate<M>>,
    }
}

impl<M> ProgressStream<M> {
    pub(crate) fn new(rx: BroadcastStream<ProgressUpdate<M>>) -> Self {
        Self { rx }
    }
}

impl<M: Send + Sync + 'static> Stream for ProgressStream<M> {
    type Item = Result<ProgressUpdate<M>, ProgressError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.project().rx.poll_next(cx).map(|opt| {
            opt.map(|res| {
                res.map_err(|err| match err {
                    BroadcastStreamRecvError::Lagged(skipped) => ProgressError::Lagged { skipped },
                })
            })
        })
    }
}
