//! Ruleset file watcher for hot reload.

use std::path::{Path, PathBuf};
use std::time::Duration;

use notify::{Config, Event, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;

use crate::config::loader::load_ruleset;
use crate::filters::Ruleset;

/// Watches a ruleset file and publishes every successfully parsed version.
pub struct FilterWatcher {
    path: PathBuf,
    update_tx: mpsc::UnboundedSender<Ruleset>,
}

impl FilterWatcher {
    /// Create a new FilterWatcher.
    ///
    /// Returns the watcher and a receiver for ruleset updates.
    pub fn new(path: &Path) -> (Self, mpsc::UnboundedReceiver<Ruleset>) {
        let (update_tx, update_rx) = mpsc::unbounded_channel();

        (
            Self {
                path: path.to_path_buf(),
                update_tx,
            },
            update_rx,
        )
    }

    /// Start watching. Keep the returned watcher alive for as long as
    /// updates are wanted.
    pub fn run(self) -> Result<RecommendedWatcher, notify::Error> {
        let tx = self.update_tx.clone();
        let path = self.path.clone();

        let mut watcher = RecommendedWatcher::new(
            move |res: notify::Result<Event>| match res {
                Ok(event) => {
                    if event.kind.is_modify() || event.kind.is_create() {
                        tracing::info!(path = %path.display(), "Filter file change detected, reloading...");
                        match load_ruleset(&path) {
                            Ok(ruleset) => {
                                let _ = tx.send(ruleset);
                            }
                            Err(e) => {
                                tracing::error!("Failed to reload filters: {}. Keeping current rules.", e);
                            }
                        }
                    }
                }
                Err(e) => tracing::error!("Watch error: {:?}", e),
            },
            Config::default().with_poll_interval(Duration::from_secs(2)),
        )?;

        watcher.watch(&self.path, RecursiveMode::NonRecursive)?;

        tracing::info!(path = ?self.path, "Filter watcher started");
        Ok(watcher)
    }
}
