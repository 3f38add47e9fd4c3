//! Idle stream suspension
//!
//! Watches application visibility and suspends streaming while the app is
//! hidden, using tokio channels to receive visibility changes and to shut
//! the watcher down.

use std::sync::Weak;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::debug;

use crate::repository::RepositoryInner;

/// Visibility of the host application
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Visibility {
    Visible,
    Hidden,
}

/// Handle for the background visibility watcher
///
/// Dropping the handle stops the watcher.
pub(crate) struct IdleWatcher {
    _shutdown_tx: mpsc::Sender<()>,
}

impl IdleWatcher {
    /// Spawns the watcher
    ///
    /// Once the application has been hidden for `idle_after`, every stream is
    /// suspended. Becoming visible again cancels a pending suspension and
    /// resumes suspended streams immediately.
    pub(crate) fn spawn(
        inner: Weak<RepositoryInner>,
        mut visibility: watch::Receiver<Visibility>,
        idle_after: Duration,
    ) -> Self {
        let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<()>(1);

        tokio::spawn(async move {
            let mut idle_deadline: Option<Instant> = None;

            loop {
                tokio::select! {
                    changed = visibility.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        let current = *visibility.borrow_and_update();
                        match current {
                            Visibility::Visible => {
                                idle_deadline = None;
                                let Some(inner) = inner.upgrade() else { break };
                                inner.on_visible();
                            }
                            Visibility::Hidden => {
                                idle_deadline = Some(Instant::now() + idle_after);
                            }
                        }
                    }
                    _ = tokio::time::sleep_until(idle_deadline.unwrap_or_else(Instant::now)), if idle_deadline.is_some() => {
                        idle_deadline = None;
                        let Some(inner) = inner.upgrade() else { break };
                        debug!(?idle_after, "application idle, suspending streams");
                        inner.on_hidden();
                    }
                    _ = shutdown_rx.recv() => {
                        break;
                    }
                }
            }
        });

        Self {
            _shutdown_tx: shutdown_tx,
        }
    }
}
