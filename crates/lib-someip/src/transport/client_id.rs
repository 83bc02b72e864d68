use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::types::ClientId;

use super::TransportError;

/// Ids handed out per network, persisted in a lockfile so that restarts
/// reuse the same ids deterministically. The file is shared between all
/// brokers of the host; an exclusive marker file serializes access.
#[derive(Debug, Default, Serialize, Deserialize)]
struct PoolFile {
    assigned: BTreeSet<ClientId>,
}

pub struct ClientIdPool {
    path: PathBuf,
    /// High byte of every dynamically assigned id.
    base: ClientId,
    local: Mutex<BTreeSet<ClientId>>,
}

impl ClientIdPool {
    pub fn new<P: AsRef<Path>>(path: P, diagnosis_address: u8) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            base: ClientId::from(diagnosis_address) << 8,
            local: Mutex::new(BTreeSet::new()),
        }
    }

    /// Assigns an id. A non-zero `requested` id is honored when free;
    /// otherwise the lowest free id of this network is used.
    pub fn assign(&self, requested: ClientId) -> Result<ClientId, TransportError> {
        let _guard = FileLock::acquire(&self.lock_path())?;
        let mut pool = self.load();

        let id = if requested != 0 && !pool.assigned.contains(&requested) {
            requested
        } else {
            let mut candidate = None;
            for low in 0x01..=0xFFu16 {
                let id = self.base | low;
                if !pool.assigned.contains(&id) {
                    candidate = Some(id);
                    break;
                }
            }
            candidate.ok_or(TransportError::NoFreeClientId)?
        };

        pool.assigned.insert(id);
        self.store(&pool)?;
        self.local.lock().expect("pool lock").insert(id);
        debug!(client = id, requested, "assigned client id");
        Ok(id)
    }

    /// Returns an id to the pool.
    pub fn release(&self, id: ClientId) {
        let guard = FileLock::acquire(&self.lock_path());
        if guard.is_err() {
            warn!(client = id, "could not lock client id pool for release");
            return;
        }
        let mut pool = self.load();
        pool.assigned.remove(&id);
        if let Err(err) = self.store(&pool) {
            warn!(client = id, %err, "could not persist client id release");
        }
        self.local.lock().expect("pool lock").remove(&id);
    }

    /// Releases every id assigned through this pool instance. Called on
    /// broker shutdown.
    pub fn release_all(&self) {
        let ids: Vec<ClientId> = {
            let local = self.local.lock().expect("pool lock");
            local.iter().copied().collect()
        };
        for id in ids {
            self.release(id);
        }
    }

    fn lock_path(&self) -> PathBuf {
        self.path.with_extension("lck.lock")
    }

    fn load(&self) -> PoolFile {
        match fs::read(&self.path) {
            Ok(data) => serde_json::from_slice(&data).unwrap_or_default(),
            Err(_) => PoolFile::default(),
        }
    }

    fn store(&self, pool: &PoolFile) -> Result<(), TransportError> {
        let data = serde_json::to_vec(pool).expect("pool serialization");
        let tmp = self.path.with_extension("tmp");
        fs::write(&tmp, data)?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

/// Exclusive marker file; creation fails while another process holds it.
/// Stale markers are broken after a bounded number of retries.
struct FileLock {
    path: PathBuf,
}

impl FileLock {
    fn acquire(path: &Path) -> Result<Self, TransportError> {
        for attempt in 0..50u32 {
            match fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(path)
            {
                Ok(_) => {
                    return Ok(Self {
                        path: path.to_path_buf(),
                    })
                }
                Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
                    if attempt == 49 {
                        warn!(path = %path.display(), "breaking stale client id lock");
                        let _ = fs::remove_file(path);
                    } else {
                        std::thread::sleep(Duration::from_millis(10));
                    }
                }
                Err(err) => return Err(TransportError::Io(err)),
            }
        }
        Err(TransportError::PoolLocked)
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool(name: &str) -> ClientIdPool {
        let path = std::env::temp_dir().join(format!("someip-test-pool-{name}"));
        let _ = fs::remove_file(&path);
        ClientIdPool::new(path, 0x01)
    }

    #[test]
    fn assigns_sequentially_and_reuses_released() {
        let pool = pool("seq");
        let a = pool.assign(0).unwrap();
        let b = pool.assign(0).unwrap();
        assert_eq!(a, 0x0101);
        assert_eq!(b, 0x0102);

        pool.release(a);
        assert_eq!(pool.assign(0).unwrap(), 0x0101);
    }

    #[test]
    fn honors_requested_id() {
        let pool = pool("req");
        assert_eq!(pool.assign(0x0555).unwrap(), 0x0555);
        // taken now, a second request falls back to dynamic assignment
        assert_eq!(pool.assign(0x0555).unwrap(), 0x0101);
    }

    #[test]
    fn persists_across_instances() {
        let path = std::env::temp_dir().join("someip-test-pool-persist");
        let _ = fs::remove_file(&path);

        let first = ClientIdPool::new(&path, 0x01);
        let id = first.assign(0).unwrap();

        let second = ClientIdPool::new(&path, 0x01);
        assert_ne!(second.assign(0).unwrap(), id);
    }

    #[test]
    fn release_all_clears_own_ids() {
        let pool = pool("release-all");
        pool.assign(0).unwrap();
        pool.assign(0).unwrap();
        pool.release_all();

        assert_eq!(pool.assign(0).unwrap(), 0x0101);
    }
}
