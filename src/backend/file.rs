//! Directory backend: serves each file in a directory as one message.
//!
//! The server scans the configured directory, emits every regular file
//! exactly once (body = file contents), and optionally deletes files whose
//! delivery succeeded. New files appearing between scans are picked up on
//! the next pass.

use std::{
    collections::HashSet,
    fs::File,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{WorkerPool, drain};
use crate::{
    api::{ReceiveError, Receiver, ServeError},
    message::{Attributes, Message},
};

const SHUTDOWN_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Pause between directory scans once every present file has been emitted.
const SCAN_INTERVAL: Duration = Duration::from_millis(100);

/// Serves the files of a directory to a receiver.
pub struct Server {
    dir: PathBuf,
    delete_after: bool,
    pool: WorkerPool,
    intake: CancellationToken,
    receivers: CancellationToken,
}

impl Server {
    /// Creates a server over `dir` with at most `concurrency` concurrent
    /// receiver invocations.
    ///
    /// With `delete_after`, files are removed from the directory once their
    /// delivery succeeds; failed deliveries leave the file in place for the
    /// next server run.
    pub fn new(dir: impl Into<PathBuf>, delete_after: bool, concurrency: usize) -> Self {
        Self {
            dir: dir.into(),
            delete_after,
            pool: WorkerPool::new(concurrency),
            intake: CancellationToken::new(),
            receivers: CancellationToken::new(),
        }
    }
}

#[async_trait]
impl crate::api::Server for Server {
    async fn serve(&self, receiver: Arc<dyn Receiver>) -> Result<(), ServeError> {
        // Paths already dispatched in this run; files that persist across
        // scans (delete_after = false, or failed deliveries) are emitted
        // only once.
        let mut seen: HashSet<PathBuf> = HashSet::new();

        loop {
            if self.intake.is_cancelled() {
                return Err(ServeError::Closed);
            }

            let mut entries = tokio::fs::read_dir(&self.dir).await?;
            let mut dispatched = false;

            while let Some(entry) = entries.next_entry().await? {
                if !entry.file_type().await?.is_file() {
                    continue;
                }
                // Entries are resolved against the configured directory.
                let path = self.dir.join(entry.file_name());
                if seen.contains(&path) {
                    continue;
                }

                let file = match File::open(&path) {
                    Ok(file) => file,
                    Err(e) => {
                        warn!(path = %path.display(), error = %e, "unable to open file");
                        continue;
                    }
                };
                seen.insert(path.clone());

                let Some(permit) = self.pool.acquire().await else {
                    return Err(ServeError::Closed);
                };
                dispatched = true;

                let receiver = receiver.clone();
                let ctx = self.receivers.clone();
                let delete_after = self.delete_after;
                tokio::spawn(async move {
                    let _permit = permit;

                    let msg = Message::new(Attributes::new(), Box::new(file));
                    match receiver.receive(ctx, msg).await {
                        Ok(()) => {
                            if delete_after {
                                remove(&path).await;
                            }
                        }
                        Err(ReceiveError::Throttled(pause)) => {
                            debug!(?pause, "receiver throttled");
                            tokio::time::sleep(pause).await;
                            if delete_after {
                                remove(&path).await;
                            }
                        }
                        Err(e) => {
                            warn!(path = %path.display(), error = %e, "could not process file");
                        }
                    }
                });
            }

            if !dispatched {
                tokio::select! {
                    _ = self.intake.cancelled() => return Err(ServeError::Closed),
                    _ = tokio::time::sleep(SCAN_INTERVAL) => {}
                }
            }
        }
    }

    async fn shutdown(&self, deadline: CancellationToken) -> Result<(), ServeError> {
        self.intake.cancel();
        Err(drain(&self.pool, SHUTDOWN_POLL_INTERVAL, &deadline, &self.receivers).await)
    }
}

async fn remove(path: &Path) {
    if let Err(e) = tokio::fs::remove_file(path).await {
        warn!(path = %path.display(), error = %e, "unable to remove processed file");
    }
}
