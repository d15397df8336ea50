//! Follows the config file on disk and forwards every valid revision.

use std::path::{Path, PathBuf};
use std::time::Duration;

use notify::{Config, Event, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;

use crate::config::loader::load_config;
use crate::config::schema::GraceConfig;

/// Revisions that fail to load or validate are logged and dropped, so the
/// process keeps serving with what it has.
pub struct ConfigWatcher {
    path: PathBuf,
    revisions: mpsc::UnboundedSender<GraceConfig>,
}

impl ConfigWatcher {
    pub fn new(path: &Path) -> (Self, mpsc::UnboundedReceiver<GraceConfig>) {
        let (revisions, rx) = mpsc::unbounded_channel();
        let watcher = Self {
            path: path.to_path_buf(),
            revisions,
        };
        (watcher, rx)
    }

    /// Begin watching. Events arrive on notify's own thread; the returned
    /// handle must be kept alive for as long as updates are wanted.
    pub fn run(self) -> Result<RecommendedWatcher, notify::Error> {
        let Self { path, revisions } = self;
        let watched = path.clone();

        let mut handle = RecommendedWatcher::new(
            move |event: notify::Result<Event>| {
                let event = match event {
                    Ok(event) => event,
                    Err(e) => {
                        tracing::warn!(error = %e, "Config watch failed");
                        return;
                    }
                };
                if !(event.kind.is_modify() || event.kind.is_create()) {
                    return;
                }
                match load_config(&watched) {
                    Ok(config) => {
                        tracing::info!(path = %watched.display(), "Config file changed");
                        // Receiver gone means the process is shutting down.
                        let _ = revisions.send(config);
                    }
                    Err(e) => {
                        tracing::error!(path = %watched.display(), error = %e, "Ignoring invalid config revision");
                    }
                }
            },
            Config::default().with_poll_interval(Duration::from_secs(2)),
        )?;
        handle.watch(&path, RecursiveMode::NonRecursive)?;

        tracing::info!(path = %path.display(), "Watching config file");
        Ok(handle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_valid_edit_is_forwarded() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gracehttp.toml");
        std::fs::write(&path, "").unwrap();

        let (watcher, mut rx) = ConfigWatcher::new(&path);
        let _guard = watcher.run().unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;
        std::fs::write(&path, "[process]\ngraceful_timeout_secs = 7\n").unwrap();

        let config = tokio::time::timeout(Duration::from_secs(10), async {
            loop {
                match rx.recv().await {
                    Some(config) if config.process.graceful_timeout_secs == 7 => return config,
                    Some(_) => continue,
                    None => panic!("watcher closed"),
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(config.process.graceful_timeout_secs, 7);
    }
}
