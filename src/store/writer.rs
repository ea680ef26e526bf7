use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::constants::WRITER_RETRY_INTERVAL_SECS;

/// Memory-first JSON state writer. `write` never fails: the payload always
/// lands in the in-memory cell, the disk write is attempted atomically, and
/// a failed attempt parks the payload in a retry registry drained by a
/// background ticker and by `flush_all` at shutdown.
///
/// serde_json maps are BTreeMap-backed, so encoded output has stable key
/// order and repeated writes of equal state are byte-identical.
pub struct ResilientWriter {
    memory: DashMap<PathBuf, Value>,
    pending: DashMap<PathBuf, Value>,
    healthy: AtomicBool,
    secure_mode: bool,
    cancel: CancellationToken,
}

impl ResilientWriter {
    pub fn new(secure_mode: bool) -> Arc<Self> {
        Arc::new(Self {
            memory: DashMap::new(),
            pending: DashMap::new(),
            healthy: AtomicBool::new(true),
            secure_mode,
            cancel: CancellationToken::new(),
        })
    }

    /// Spawn the 30 s retry ticker. Idempotent per writer instance in
    /// practice; the engine calls it once at startup.
    pub fn start_retry_ticker(self: &Arc<Self>) {
        let writer = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(std::time::Duration::from_secs(
                WRITER_RETRY_INTERVAL_SECS,
            ));
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = writer.cancel.cancelled() => break,
                    _ = interval.tick() => {
                        let retried = writer.retry_pending();
                        if retried > 0 {
                            info!("[Writer] Recovered {} buffered write(s)", retried);
                        }
                    }
                }
            }
        });
    }

    pub fn shutdown_ticker(&self) {
        self.cancel.cancel();
    }

    /// Total write: memory cell first, then best-effort atomic disk write.
    pub fn write(&self, path: &Path, data: Value) {
        self.memory.insert(path.to_path_buf(), data.clone());

        match self.write_atomic(path, &data) {
            Ok(()) => {
                self.healthy.store(true, Ordering::Relaxed);
                self.pending.remove(path);
            }
            Err(e) => {
                self.healthy.store(false, Ordering::Relaxed);
                warn!(
                    "[Writer] Disk write failed for {}, buffering for retry: {}",
                    path.display(),
                    e
                );
                self.pending.insert(path.to_path_buf(), data);
            }
        }
    }

    /// Latest payload for a path, disk state notwithstanding.
    pub fn read_memory(&self, path: &Path) -> Option<Value> {
        self.memory.get(path).map(|v| v.clone())
    }

    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::Relaxed)
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Re-attempt every buffered payload. Returns the number that succeeded.
    pub fn retry_pending(&self) -> usize {
        let mut recovered = 0;
        let paths: Vec<PathBuf> = self.pending.iter().map(|e| e.key().clone()).collect();
        for path in paths {
            // The memory cell may have moved past the buffered payload;
            // always flush the newest state.
            let Some(data) = self.read_memory(&path) else {
                self.pending.remove(&path);
                continue;
            };
            match self.write_atomic(&path, &data) {
                Ok(()) => {
                    self.pending.remove(&path);
                    recovered += 1;
                }
                Err(e) => {
                    debug!("[Writer] Retry still failing for {}: {}", path.display(), e);
                }
            }
        }
        if recovered > 0 {
            self.healthy.store(true, Ordering::Relaxed);
        }
        recovered
    }

    /// Final drain at shutdown. Returns the number of writes still pending;
    /// the process exits non-zero when this is not 0.
    pub fn flush_all(&self) -> usize {
        self.retry_pending();
        let remaining = self.pending.len();
        if remaining > 0 {
            error!(
                "[E-WRITER-FLUSH] {} state file(s) could not be persisted",
                remaining
            );
        }
        remaining
    }

    fn write_atomic(&self, path: &Path, data: &Value) -> std::io::Result<()> {
        use std::io::Write;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let tmp = path.with_extension("json.tmp");
        {
            let mut file = std::fs::File::create(&tmp)?;
            let encoded = serde_json::to_vec_pretty(data)
                .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
            file.write_all(&encoded)?;
            file.sync_all()?;
        }
        std::fs::rename(&tmp, path)?;

        #[cfg(unix)]
        if self.secure_mode {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
        }

        Ok(())
    }
}
