use super::loader::{load_registry, StaticRegistry};
use super::types::RegistryEvent;
use crate::utils::error::{PoolError, Result};
use notify::{
    Config, Event, EventKind, RecommendedWatcher, RecursiveMode, Result as NotifyResult, Watcher,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, Mutex};
use tracing::{error, info};

/// Registry hot reload.
/// Watches the static registry file and forwards each edit as registry events.
pub struct RegistryWatcher {
    path: PathBuf,
    current: Arc<Mutex<StaticRegistry>>,
    events: mpsc::UnboundedSender<RegistryEvent>,
    watcher: Option<RecommendedWatcher>,
}

impl RegistryWatcher {
    pub fn new(
        path: PathBuf,
        initial: StaticRegistry,
        events: mpsc::UnboundedSender<RegistryEvent>,
    ) -> Self {
        Self {
            path,
            current: Arc::new(Mutex::new(initial)),
            events,
            watcher: None,
        }
    }

    /// Start watching the registry file
    pub async fn start(&mut self) -> Result<()> {
        let (tx, mut rx) = mpsc::channel(100);
        let path = self.path.clone();

        let mut watcher = RecommendedWatcher::new(
            move |res: NotifyResult<Event>| {
                if let Ok(event) = res {
                    if matches!(event.kind, EventKind::Modify(_) | EventKind::Create(_)) {
                        let _ = tx.blocking_send(event);
                    }
                }
            },
            Config::default()
                .with_poll_interval(Duration::from_secs(1))
                .with_compare_contents(true),
        )
        .map_err(|e| PoolError::Config(format!("Failed to create file watcher: {}", e)))?;

        watcher
            .watch(&path, RecursiveMode::NonRecursive)
            .map_err(|e| PoolError::Config(format!("Failed to watch registry file: {}", e)))?;

        self.watcher = Some(watcher);
        info!(path = ?path, "Registry watcher started");

        let current = self.current.clone();
        let events = self.events.clone();
        tokio::spawn(async move {
            while rx.recv().await.is_some() {
                info!("Registry file changed, reloading");
                Self::handle_change(&path, &current, &events).await;
            }
        });

        Ok(())
    }

    /// Reload the file and forward the diff against the last good view.
    ///
    /// A file that fails to load or validate leaves the current view in place.
    /// Returns the number of events sent.
    pub async fn handle_change(
        path: &Path,
        current: &Mutex<StaticRegistry>,
        events: &mpsc::UnboundedSender<RegistryEvent>,
    ) -> usize {
        let start_time = Instant::now();

        let next = match load_registry(path) {
            Ok(registry) => registry,
            Err(e) => {
                error!(error = %e, "Failed to load registry file, keeping current view");
                return 0;
            }
        };

        let diff = {
            let mut current = current.lock().await;
            let diff = current.diff(&next);
            *current = next;
            diff
        };

        let mut sent = 0;
        for event in diff {
            if events.send(event).is_err() {
                error!("Registry event receiver dropped");
                break;
            }
            sent += 1;
        }

        info!(
            events = sent,
            duration_ms = start_time.elapsed().as_millis(),
            "Registry changes forwarded"
        );
        sent
    }

    pub fn stop(&mut self) {
        if self.watcher.take().is_some() {
            info!("Registry watcher stopped");
        }
    }
}

impl Drop for RegistryWatcher {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    const ONE_SERVER: &str = r#"
[[apps]]
name = "orders"
  [[apps.servers]]
  host = "10.0.0.1"
  port = 8050
"#;

    const TWO_SERVERS: &str = r#"
[[apps]]
name = "orders"
  [[apps.servers]]
  host = "10.0.0.1"
  port = 8050
  [[apps.servers]]
  host = "10.0.0.2"
  port = 8050
"#;

    #[tokio::test]
    async fn change_forwards_diff() {
        let file = NamedTempFile::new().unwrap();
        std::fs::write(file.path(), ONE_SERVER).unwrap();
        let current = Mutex::new(load_registry(file.path()).unwrap());
        let (tx, mut rx) = mpsc::unbounded_channel();

        std::fs::write(file.path(), TWO_SERVERS).unwrap();
        let sent = RegistryWatcher::handle_change(file.path(), &current, &tx).await;

        assert_eq!(sent, 1);
        let event = rx.recv().await.unwrap();
        assert_eq!(event.kind(), "add");
        assert_eq!(event.servers()[0].host, "10.0.0.2");
        assert_eq!(current.lock().await.server_count(), 2);
    }

    #[tokio::test]
    async fn broken_file_keeps_current_view() {
        let file = NamedTempFile::new().unwrap();
        std::fs::write(file.path(), ONE_SERVER).unwrap();
        let initial = load_registry(file.path()).unwrap();
        let current = Mutex::new(initial.clone());
        let (tx, _rx) = mpsc::unbounded_channel();

        std::fs::write(file.path(), "[[apps]]\nname = ").unwrap();
        let sent = RegistryWatcher::handle_change(file.path(), &current, &tx).await;

        assert_eq!(sent, 0);
        assert_eq!(*current.lock().await, initial);
    }

    #[tokio::test]
    #[ignore] // Relies on real file system notifications
    async fn watcher_picks_up_file_edits() {
        let file = NamedTempFile::new().unwrap();
        std::fs::write(file.path(), ONE_SERVER).unwrap();
        let initial = load_registry(file.path()).unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();

        let mut watcher = RegistryWatcher::new(file.path().to_path_buf(), initial, tx);
        watcher.start().await.unwrap();
        tokio::time::sleep(Duration::from_millis(500)).await;

        std::fs::write(file.path(), TWO_SERVERS).unwrap();
        let event = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.kind(), "add");

        watcher.stop();
    }
}
