//! Cross-process write locks for the persistent store.
//!
//! A lock is a marker file `<locks_dir>/<shard>.lock` whose *existence* means
//! "held". The file carries a [`LockHolder`] record (pid, token, acquisition
//! time, TTL) so that a waiter can tell a live holder from an abandoned one.
//!
//! - Creation is a `hard_link` of a fully written temp file onto the lock path,
//!   which fails atomically when the lock already exists. A visible lock file
//!   therefore always contains a complete record.
//! - Every *removal* (release or reclaim) happens while holding an exclusive
//!   `fs2` lock on the sibling `<shard>.guard` file, and only after re-reading
//!   the record and confirming it is the one the remover expects. Nobody can
//!   delete a lock file they did not just inspect under the guard, so a late
//!   reclaimer can never remove a successor's fresh lock.
//! - A record is stale when its holder process no longer exists, when it is
//!   older than its TTL, or when it is unreadable and the file is older than
//!   the TTL.

use crate::error::CacheError;
use crate::key::CacheKey;
use crate::util::{now_millis, remove_file_best_effort};
use fs2::FileExt as _;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{self, Write as _};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, OnceLock};
use std::time::{Duration, Instant, SystemTime};

const INITIAL_BACKOFF: Duration = Duration::from_millis(5);
const MAX_BACKOFF: Duration = Duration::from_millis(50);

static TOKEN_COUNTER: AtomicU64 = AtomicU64::new(0);

/// The record stored inside a lock file.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockHolder {
    pub pid: u32,
    /// Unique per acquisition; release only removes a lock carrying its own token.
    pub token: String,
    pub acquired_at_millis: u64,
    pub ttl_millis: u64,
}

impl LockHolder {
    fn new(ttl: Duration) -> Self {
        let pid = std::process::id();
        let counter = TOKEN_COUNTER.fetch_add(1, Ordering::Relaxed);
        let nanos = SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or_default();
        Self {
            pid,
            token: format!("{pid}-{nanos:x}-{counter}"),
            acquired_at_millis: now_millis(),
            ttl_millis: ttl.as_millis() as u64,
        }
    }

    fn age_millis(&self) -> u64 {
        now_millis().saturating_sub(self.acquired_at_millis)
    }
}

/// Result of [`FileLock::acquire`].
#[derive(Debug)]
pub enum Acquire {
    Acquired(WriteLock),
    /// The lock stayed held by a live holder for the whole timeout.
    TimedOut {
        waited: Duration,
        holder: Option<LockHolder>,
    },
}

/// One lockable slot (a shard of cache keys) in a segment's lock directory.
#[derive(Clone, Debug)]
pub struct FileLock {
    path: PathBuf,
    guard_path: PathBuf,
}

impl FileLock {
    pub fn for_shard(locks_dir: impl AsRef<Path>, shard: &str) -> Self {
        let locks_dir = locks_dir.as_ref();
        Self {
            path: locks_dir.join(format!("{shard}.lock")),
            guard_path: locks_dir.join(format!("{shard}.guard")),
        }
    }

    /// The lock guarding writes of `key`: one lock per key shard.
    pub fn for_key(locks_dir: impl AsRef<Path>, key: &CacheKey) -> Self {
        Self::for_shard(locks_dir, key.shard())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Wait up to `timeout` for exclusive ownership, reclaiming stale records.
    ///
    /// Returns `Ok(Acquire::TimedOut { .. })` rather than an error when a live
    /// holder outlasts the timeout; `Err` is reserved for filesystem failures.
    pub fn acquire(&self, timeout: Duration, ttl: Duration) -> Result<Acquire, CacheError> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let start = Instant::now();
        let mut backoff = INITIAL_BACKOFF;
        let mut contended = false;
        let mut reclaimed = false;

        loop {
            let holder = LockHolder::new(ttl);
            if self.try_create(&holder)? {
                return Ok(Acquire::Acquired(WriteLock {
                    lock: self.clone(),
                    holder,
                    waited: start.elapsed(),
                    contended,
                    reclaimed,
                    released: false,
                }));
            }
            contended = true;

            let observed = match self.observe()? {
                Some(observed) => observed,
                // Released between our create attempt and the read; retry now.
                None => continue,
            };

            if let Some(reason) = observed.stale_reason(ttl) {
                if self.reclaim(&observed, reason)? {
                    reclaimed = true;
                    continue;
                }
            }

            let waited = start.elapsed();
            if waited >= timeout {
                return Ok(Acquire::TimedOut {
                    waited,
                    holder: observed.holder,
                });
            }

            std::thread::sleep(backoff.min(timeout - waited));
            backoff = (backoff * 2).min(MAX_BACKOFF);
        }
    }

    /// Read the current holder, if the lock is held and its record is readable.
    pub fn current_holder(&self) -> Result<Option<LockHolder>, CacheError> {
        Ok(self.observe()?.and_then(|observed| observed.holder))
    }

    fn try_create(&self, holder: &LockHolder) -> Result<bool, CacheError> {
        let bytes = serde_json::to_vec(holder)?;
        let tmp_path = self.tmp_path(holder);

        let write_tmp = || -> io::Result<()> {
            let mut file = OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&tmp_path)?;
            file.write_all(&bytes)?;
            file.sync_all()
        };
        if let Err(err) = write_tmp() {
            remove_file_best_effort(&tmp_path, "lock.tmp_write_failed");
            return Err(err.into());
        }

        let linked = std::fs::hard_link(&tmp_path, &self.path);
        remove_file_best_effort(&tmp_path, "lock.tmp_cleanup");
        match linked {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == io::ErrorKind::AlreadyExists => Ok(false),
            Err(err) => {
                // Filesystems without hard links: exclusive create is still atomic,
                // but a concurrent reader may briefly see an empty record, which
                // `stale_reason` tolerates until the TTL elapses.
                tracing::debug!(
                    target: "symdex.cache",
                    path = %self.path.display(),
                    error = %err,
                    "hard_link unavailable for lock file; falling back to create_new"
                );
                match OpenOptions::new()
                    .write(true)
                    .create_new(true)
                    .open(&self.path)
                {
                    Ok(mut file) => {
                        file.write_all(&bytes)?;
                        file.sync_all()?;
                        Ok(true)
                    }
                    Err(err) if err.kind() == io::ErrorKind::AlreadyExists => Ok(false),
                    Err(err) => Err(err.into()),
                }
            }
        }
    }

    fn tmp_path(&self, holder: &LockHolder) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|name| name.to_os_string())
            .unwrap_or_default();
        name.push(format!(".tmp.{}", holder.token));
        self.path.with_file_name(name)
    }

    fn observe(&self) -> Result<Option<Observed>, CacheError> {
        let raw = match std::fs::read(&self.path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        let modified = std::fs::metadata(&self.path)
            .and_then(|meta| meta.modified())
            .ok();
        let holder = serde_json::from_slice::<LockHolder>(&raw).ok();
        Ok(Some(Observed {
            raw,
            modified,
            holder,
        }))
    }

    /// Remove `observed` if, under the guard, the lock file still holds exactly
    /// that record. Returns whether the lock file was removed.
    fn reclaim(&self, observed: &Observed, reason: &'static str) -> Result<bool, CacheError> {
        self.with_guard(|| {
            let Some(current) = self.observe()? else {
                return Ok(false);
            };
            if current.raw != observed.raw || current.modified != observed.modified {
                return Ok(false);
            }
            std::fs::remove_file(&self.path)?;
            tracing::warn!(
                target: "symdex.cache",
                path = %self.path.display(),
                reason,
                holder_pid = observed.holder.as_ref().map(|h| h.pid),
                "reclaimed stale cache write lock"
            );
            Ok(true)
        })
    }

    fn release_token(&self, token: &str) -> Result<bool, CacheError> {
        self.with_guard(|| {
            let Some(current) = self.observe()? else {
                return Ok(false);
            };
            match current.holder {
                Some(holder) if holder.token == token => {
                    std::fs::remove_file(&self.path)?;
                    Ok(true)
                }
                _ => Ok(false),
            }
        })
    }

    fn with_guard<T>(
        &self,
        f: impl FnOnce() -> Result<T, CacheError>,
    ) -> Result<T, CacheError> {
        with_exclusive_guard(&self.guard_path, f)
    }
}

/// Run `f` while holding an exclusive lock on `guard_path`, across processes
/// and across threads of this process.
pub(crate) fn with_exclusive_guard<T>(
    guard_path: &Path,
    f: impl FnOnce() -> Result<T, CacheError>,
) -> Result<T, CacheError> {
    // `fs2` file locks do not reliably exclude threads of the same process on
    // every platform; pair the file lock with a per-path in-process mutex.
    let mutex = process_lock_for_path(guard_path);
    let _thread_guard = mutex
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner());

    let file = OpenOptions::new()
        .create(true)
        .truncate(false)
        .read(true)
        .write(true)
        .open(guard_path)?;
    file.lock_exclusive()?;
    let result = f();
    unlock_best_effort(&file, guard_path);
    result
}

struct Observed {
    raw: Vec<u8>,
    modified: Option<SystemTime>,
    holder: Option<LockHolder>,
}

impl Observed {
    fn stale_reason(&self, ttl: Duration) -> Option<&'static str> {
        match &self.holder {
            Some(holder) => {
                if process_alive(holder.pid) == Some(false) {
                    Some("holder_exited")
                } else if holder.age_millis() > holder.ttl_millis {
                    Some("ttl_expired")
                } else {
                    None
                }
            }
            None => {
                // Unreadable record: only give up on it once it is older than our
                // own TTL, so an in-flight fallback create is not mistaken for
                // garbage.
                let age = self
                    .modified
                    .and_then(|modified| SystemTime::now().duration_since(modified).ok())?;
                (age > ttl).then_some("unreadable_record")
            }
        }
    }
}

/// A held write lock. Released on drop.
#[derive(Debug)]
pub struct WriteLock {
    lock: FileLock,
    holder: LockHolder,
    waited: Duration,
    contended: bool,
    reclaimed: bool,
    released: bool,
}

impl WriteLock {
    pub fn holder(&self) -> &LockHolder {
        &self.holder
    }

    /// Time spent between the first attempt and ownership.
    pub fn waited(&self) -> Duration {
        self.waited
    }

    /// Whether another holder had the lock when we first tried.
    pub fn contended(&self) -> bool {
        self.contended
    }

    /// Whether a stale record was removed on the way to acquiring.
    pub fn reclaimed(&self) -> bool {
        self.reclaimed
    }

    /// Whether the lock file still carries this holder's token.
    pub fn is_held(&self) -> bool {
        matches!(
            self.lock.current_holder(),
            Ok(Some(holder)) if holder.token == self.holder.token
        )
    }

    pub fn release(mut self) -> Result<bool, CacheError> {
        self.released = true;
        self.lock.release_token(&self.holder.token)
    }
}

impl Drop for WriteLock {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        if let Err(err) = self.lock.release_token(&self.holder.token) {
            tracing::debug!(
                target: "symdex.cache",
                path = %self.lock.path.display(),
                error = %err,
                "failed to release cache write lock"
            );
        }
    }
}

fn unlock_best_effort(file: &File, path: &Path) {
    if let Err(err) = file.unlock() {
        tracing::debug!(
            target: "symdex.cache",
            path = %path.display(),
            error = %err,
            "failed to unlock guard file"
        );
    }
}

fn process_lock_for_path(path: &Path) -> &'static Mutex<()> {
    static PROCESS_LOCKS: OnceLock<Mutex<HashMap<PathBuf, &'static Mutex<()>>>> = OnceLock::new();
    let locks = PROCESS_LOCKS.get_or_init(|| Mutex::new(HashMap::new()));

    let mut map = locks
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner());
    if let Some(existing) = map.get(path) {
        return existing;
    }

    let mutex: &'static Mutex<()> = Box::leak(Box::new(Mutex::new(())));
    map.insert(path.to_path_buf(), mutex);
    mutex
}

/// `Some(false)` only when the process is known not to exist.
#[cfg(unix)]
pub(crate) fn process_alive(pid: u32) -> Option<bool> {
    if pid == 0 || pid > i32::MAX as u32 {
        return Some(false);
    }
    // SAFETY: signal 0 performs error checking only; no signal is delivered.
    let rc = unsafe { libc::kill(pid as libc::pid_t, 0) };
    if rc == 0 {
        return Some(true);
    }
    match io::Error::last_os_error().raw_os_error() {
        Some(libc::ESRCH) => Some(false),
        Some(libc::EPERM) => Some(true),
        _ => None,
    }
}

#[cfg(not(unix))]
pub(crate) fn process_alive(pid: u32) -> Option<bool> {
    // Without a portable liveness probe, rely on the TTL.
    (pid == std::process::id()).then_some(true)
}
