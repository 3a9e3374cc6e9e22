use std::{
    collections::BTreeMap,
    ffi::OsString,
    fs::{self, File, OpenOptions},
    io::{ErrorKind, Write},
    path::{Path, PathBuf},
    sync::Arc,
    thread,
    time::{Duration, Instant},
};

use fs2::FileExt;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::MintConfig;
use crate::error::{ConfigError, SnapshotError};
use crate::identity::Identity;
use crate::ledger::{Amount, IssuanceLedger, LedgerSnapshot};
use crate::payout::AccountBook;
use crate::registry::InMemoryRegistry;

/// On-disk form of a deployed ledger and the external accounts it pays into.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct StateFile {
    pub version: u8,
    pub ledger: LedgerSnapshot,
    #[serde(default)]
    pub accounts: BTreeMap<Identity, Amount>,
}

pub const STATE_VERSION: u8 = 1;
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(10);

const LOCK_POLL: Duration = Duration::from_millis(20);

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("state file {0} already exists")]
    AlreadyExists(PathBuf),
    #[error("state file {0} not found, run deploy first")]
    Missing(PathBuf),
    #[error("state file {0} is locked by another process")]
    Busy(PathBuf),
    #[error("unsupported state version {0}")]
    Version(u8),
    #[error("state io: {0}")]
    Io(#[from] std::io::Error),
    #[error("state parse: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("state snapshot: {0}")]
    Snapshot(#[from] SnapshotError),
    #[error("state config: {0}")]
    Config(#[from] ConfigError),
}

/// Exclusive advisory lock on `<state>.lock`, released on drop.
///
/// The state file itself is replaced by rename on every save, so the lock
/// lives on a sibling file whose inode never changes.
struct StateLock {
    file: File,
}

impl StateLock {
    fn acquire(state: &Path, timeout: Duration) -> Result<Self, StoreError> {
        let mut name = OsString::from(state.as_os_str());
        name.push(".lock");
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(PathBuf::from(name))?;
        let deadline = Instant::now() + timeout;
        loop {
            match file.try_lock_exclusive() {
                Ok(()) => return Ok(Self { file }),
                Err(err) if err.kind() == fs2::lock_contended_error().kind() => {
                    if Instant::now() >= deadline {
                        return Err(StoreError::Busy(state.to_path_buf()));
                    }
                    thread::sleep(LOCK_POLL);
                }
                Err(err) => return Err(err.into()),
            }
        }
    }
}

impl Drop for StateLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}

/// A ledger loaded from disk. Holds the state lock until dropped, so the
/// load, the calls made on it and [`save`](Self::save) form one transaction.
pub struct Loaded {
    pub ledger: IssuanceLedger,
    pub accounts: Arc<AccountBook>,
    path: PathBuf,
    _lock: StateLock,
}

impl Loaded {
    pub fn to_state(&self) -> StateFile {
        StateFile {
            version: STATE_VERSION,
            ledger: self.ledger.snapshot(),
            accounts: self.accounts.balances(),
        }
    }

    /// Writes through a sibling temp file and renames it into place.
    pub fn save(&self) -> Result<(), StoreError> {
        let json = serde_json::to_vec_pretty(&self.to_state())?;
        let tmp = self.path.with_extension("json.tmp");
        let mut f = File::create(&tmp)?;
        f.write_all(&json)?;
        f.sync_all()?;
        fs::rename(&tmp, &self.path)?;
        debug!(path = %self.path.display(), "state saved");
        Ok(())
    }
}

fn ensure_parent(path: &Path) -> Result<(), StoreError> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    Ok(())
}

pub fn load(path: &Path) -> Result<Loaded, StoreError> {
    load_with_timeout(path, DEFAULT_LOCK_TIMEOUT)
}

/// Waits at most `timeout` for the state lock before giving up with
/// [`StoreError::Busy`].
pub fn load_with_timeout(path: &Path, timeout: Duration) -> Result<Loaded, StoreError> {
    if !path.exists() {
        return Err(StoreError::Missing(path.to_path_buf()));
    }
    let lock = StateLock::acquire(path, timeout)?;
    let bytes = fs::read(path)?;
    let state: StateFile = serde_json::from_slice(&bytes)?;
    if state.version != STATE_VERSION {
        return Err(StoreError::Version(state.version));
    }
    let accounts = Arc::new(AccountBook::from_balances(state.accounts));
    let ledger = IssuanceLedger::restore(
        state.ledger,
        Box::new(InMemoryRegistry::new()),
        accounts.clone(),
    )?;
    Ok(Loaded {
        ledger,
        accounts,
        path: path.to_path_buf(),
        _lock: lock,
    })
}

/// Creates a fresh ledger at `path`. Fails if a state file is already there.
pub fn deploy(path: &Path, owner: Identity, config: MintConfig) -> Result<Loaded, StoreError> {
    config.validate()?;
    ensure_parent(path)?;
    let lock = StateLock::acquire(path, DEFAULT_LOCK_TIMEOUT)?;
    let mut f = match OpenOptions::new().write(true).create_new(true).open(path) {
        Ok(f) => f,
        Err(err) if err.kind() == ErrorKind::AlreadyExists => {
            return Err(StoreError::AlreadyExists(path.to_path_buf()))
        }
        Err(err) => return Err(err.into()),
    };

    let accounts = Arc::new(AccountBook::new());
    let ledger = IssuanceLedger::new(owner, config, accounts.clone())?;
    let loaded = Loaded {
        ledger,
        accounts,
        path: path.to_path_buf(),
        _lock: lock,
    };
    f.write_all(&serde_json::to_vec_pretty(&loaded.to_state())?)?;
    f.sync_all()?;
    Ok(loaded)
}
