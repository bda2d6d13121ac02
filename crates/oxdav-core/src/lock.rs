//! Lock table for WebDAV write locks.
//!
//! # Model
//!
//! A lock is rooted at one resource and either covers only that resource
//! (depth 0) or the whole subtree below it (depth infinity). At any point a
//! resource is covered by at most one exclusive lock, or by any number of
//! shared locks, never both.
//!
//! # Expiry
//!
//! Expiry is passive: every query ignores locks whose expiry instant has
//! passed, so an expired lock is indistinguishable from no lock. Expired
//! entries are physically removed by [`LockManager::purge_expired`], which the
//! server calls periodically.
//!
//! # Concurrency
//!
//! A single mutex guards the table; conflict checks and grants happen under
//! it. Releases notify a condition variable so [`LockManager::acquire_wait`]
//! callers can retry.

use crate::error::{DavError, DavResult};
use crate::path::CanonicalPath;
use parking_lot::{Condvar, Mutex};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, trace};
use uuid::Uuid;

/// Upper bound on a single condition-variable wait, so expiring locks are noticed.
const WAIT_SLICE: Duration = Duration::from_millis(100);

/// Lock token URI scheme.
pub const TOKEN_SCHEME: &str = "opaquelocktoken:";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockScope {
    Exclusive,
    Shared,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockDepth {
    Zero,
    Infinity,
}

/// Source of the current instant.
pub trait Clock: Send + Sync + fmt::Debug {
    fn now(&self) -> Instant;
}

/// Wall clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// Clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    base: Instant,
    offset: Mutex<Duration>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self {
            base: Instant::now(),
            offset: Mutex::new(Duration::ZERO),
        }
    }

    pub fn advance(&self, by: Duration) {
        *self.offset.lock() += by;
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        self.base + *self.offset.lock()
    }
}

/// Parameters of a lock to be granted.
#[derive(Debug, Clone)]
pub struct LockRequest {
    pub root: CanonicalPath,
    pub scope: LockScope,
    pub depth: LockDepth,
    /// Opaque XML supplied by the client, echoed back in lock discovery.
    pub owner: Option<String>,
    pub timeout: Duration,
}

/// A granted lock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActiveLock {
    pub token: String,
    pub root: CanonicalPath,
    pub scope: LockScope,
    pub depth: LockDepth,
    pub owner: Option<String>,
    pub timeout: Duration,
    pub expires_at: Instant,
}

impl ActiveLock {
    /// True if this lock applies to `path`.
    pub fn covers(&self, path: &CanonicalPath) -> bool {
        self.root == *path || (self.depth == LockDepth::Infinity && self.root.is_ancestor_of(path))
    }

    pub fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires_at
    }

    /// Time left before expiry.
    pub fn remaining(&self, now: Instant) -> Duration {
        self.expires_at.saturating_duration_since(now)
    }
}

#[derive(Debug, Default)]
struct LockTable {
    /// Locks grouped by root, ordered so a subtree is a contiguous range.
    by_root: BTreeMap<CanonicalPath, Vec<ActiveLock>>,
    tokens: HashMap<String, CanonicalPath>,
}

impl LockTable {
    fn get(&self, token: &str) -> Option<&ActiveLock> {
        let root = self.tokens.get(token)?;
        self.by_root.get(root)?.iter().find(|l| l.token == token)
    }

    fn get_mut(&mut self, token: &str) -> Option<&mut ActiveLock> {
        let root = self.tokens.get(token)?;
        self.by_root.get_mut(root)?.iter_mut().find(|l| l.token == token)
    }

    fn remove(&mut self, token: &str) -> Option<ActiveLock> {
        let root = self.tokens.remove(token)?;
        let locks = self.by_root.get_mut(&root)?;
        let idx = locks.iter().position(|l| l.token == token)?;
        let lock = locks.remove(idx);
        if locks.is_empty() {
            self.by_root.remove(&root);
        }
        Some(lock)
    }

    fn insert(&mut self, lock: ActiveLock) {
        self.tokens.insert(lock.token.clone(), lock.root.clone());
        self.by_root.entry(lock.root.clone()).or_default().push(lock);
    }

    /// Unexpired locks covering `path`: rooted at it, or deep locks on an ancestor.
    fn covering<'a>(
        &'a self,
        path: &CanonicalPath,
        now: Instant,
    ) -> impl Iterator<Item = &'a ActiveLock> {
        let own = self.by_root.get(path).into_iter().flatten();
        let inherited = path
            .ancestors()
            .filter_map(|ancestor| self.by_root.get(&ancestor))
            .flatten()
            .filter(|l| l.depth == LockDepth::Infinity);
        own.chain(inherited).filter(move |l| !l.is_expired(now))
    }

    /// Unexpired locks rooted strictly below `path`.
    fn below<'a>(
        &'a self,
        path: &CanonicalPath,
        now: Instant,
    ) -> impl Iterator<Item = &'a ActiveLock> {
        self.by_root
            .range(path.clone()..)
            .take_while(move |(root, _)| path.contains(root))
            .filter(move |(root, _)| *root != path)
            .flat_map(|(_, locks)| locks.iter())
            .filter(move |l| !l.is_expired(now))
    }

    fn conflicting(&self, request: &LockRequest, now: Instant) -> Option<&ActiveLock> {
        let compatible = |held: &ActiveLock| {
            held.scope == LockScope::Shared && request.scope == LockScope::Shared
        };
        let mut found = self.covering(&request.root, now).find(|&l| !compatible(l));
        if found.is_none() && request.depth == LockDepth::Infinity {
            found = self.below(&request.root, now).find(|&l| !compatible(l));
        }
        found
    }
}

/// Tracks active locks independently of any HTTP request.
#[derive(Debug)]
pub struct LockManager {
    table: Mutex<LockTable>,
    released: Condvar,
    clock: Arc<dyn Clock>,
}

impl Default for LockManager {
    fn default() -> Self {
        Self::new()
    }
}

impl LockManager {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// Manager reading time from `clock`.
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            table: Mutex::new(LockTable::default()),
            released: Condvar::new(),
            clock,
        }
    }

    pub fn now(&self) -> Instant {
        self.clock.now()
    }

    /// Grant a lock if nothing conflicts with it.
    pub fn acquire(&self, request: LockRequest) -> DavResult<ActiveLock> {
        let mut table = self.table.lock();
        Self::grant(&mut table, request, self.clock.now())
    }

    /// Like [`acquire`](Self::acquire), waiting up to `wait` for conflicting locks to go away.
    pub fn acquire_wait(&self, request: LockRequest, wait: Duration) -> DavResult<ActiveLock> {
        let deadline = Instant::now() + wait;
        let mut table = self.table.lock();
        loop {
            match Self::grant(&mut table, request.clone(), self.clock.now()) {
                Err(DavError::LockConflict(path)) => {
                    let left = deadline.saturating_duration_since(Instant::now());
                    if left.is_zero() {
                        return Err(DavError::LockConflict(path));
                    }
                    self.released.wait_for(&mut table, left.min(WAIT_SLICE));
                }
                other => return other,
            }
        }
    }

    fn grant(table: &mut LockTable, request: LockRequest, now: Instant) -> DavResult<ActiveLock> {
        if let Some(held) = table.conflicting(&request, now) {
            debug!(root = %request.root, held = %held.token, "lock conflict");
            return Err(DavError::LockConflict(request.root.to_string()));
        }
        let lock = ActiveLock {
            token: format!("{TOKEN_SCHEME}{}", Uuid::new_v4()),
            root: request.root,
            scope: request.scope,
            depth: request.depth,
            owner: request.owner,
            timeout: request.timeout,
            expires_at: now + request.timeout,
        };
        debug!(root = %lock.root, token = %lock.token, scope = ?lock.scope, depth = ?lock.depth, "lock granted");
        table.insert(lock.clone());
        Ok(lock)
    }

    /// Extend a lock's lifetime by `timeout` from now.
    pub fn refresh(&self, token: &str, timeout: Duration) -> DavResult<ActiveLock> {
        let now = self.clock.now();
        let mut table = self.table.lock();
        let lock = table
            .get_mut(token)
            .ok_or_else(|| DavError::InvalidToken(token.to_string()))?;
        if lock.is_expired(now) {
            table.remove(token);
            self.released.notify_all();
            return Err(DavError::LockExpired(token.to_string()));
        }
        lock.timeout = timeout;
        lock.expires_at = now + timeout;
        trace!(token, ?timeout, "lock refreshed");
        Ok(lock.clone())
    }

    /// Remove a lock.
    pub fn release(&self, token: &str) -> DavResult<ActiveLock> {
        let now = self.clock.now();
        let mut table = self.table.lock();
        let removed = table
            .remove(token)
            .ok_or_else(|| DavError::InvalidToken(token.to_string()))?;
        self.released.notify_all();
        if removed.is_expired(now) {
            return Err(DavError::InvalidToken(token.to_string()));
        }
        debug!(token, root = %removed.root, "lock released");
        Ok(removed)
    }

    /// The unexpired lock named by `token`.
    pub fn lookup(&self, token: &str) -> Option<ActiveLock> {
        let now = self.clock.now();
        let table = self.table.lock();
        table.get(token).filter(|l| !l.is_expired(now)).cloned()
    }

    /// Unexpired locks covering `path`, ordered by root.
    pub fn discover(&self, path: &CanonicalPath) -> Vec<ActiveLock> {
        let now = self.clock.now();
        let table = self.table.lock();
        let mut locks: Vec<ActiveLock> = table.covering(path, now).cloned().collect();
        locks.sort_by(|a, b| a.root.cmp(&b.root).then_with(|| a.token.cmp(&b.token)));
        locks
    }

    /// Verify the caller may modify `path`.
    ///
    /// Every lock covering `path` (and with `deep`, every lock rooted below
    /// it) must be matched by a submitted token. A shared lock is matched by
    /// the token of any shared lock with the same root.
    pub fn check(&self, path: &CanonicalPath, deep: bool, submitted: &[String]) -> DavResult<()> {
        let now = self.clock.now();
        let table = self.table.lock();
        let satisfied = |lock: &ActiveLock| {
            submitted.iter().any(|token| {
                token == &lock.token
                    || (lock.scope == LockScope::Shared
                        && table.get(token).is_some_and(|other| {
                            other.scope == LockScope::Shared
                                && other.root == lock.root
                                && !other.is_expired(now)
                        }))
            })
        };

        let mut blocking = table.covering(path, now).find(|&l| !satisfied(l));
        if blocking.is_none() && deep {
            blocking = table.below(path, now).find(|&l| !satisfied(l));
        }
        match blocking {
            Some(lock) => {
                debug!(path = %path, root = %lock.root, "locked, no matching token submitted");
                Err(DavError::Locked(lock.root.to_string()))
            }
            None => Ok(()),
        }
    }

    /// Drop every lock rooted at `path` or below it. Returns the removed locks.
    pub fn remove_tree(&self, path: &CanonicalPath) -> Vec<ActiveLock> {
        let mut table = self.table.lock();
        let roots: Vec<CanonicalPath> = table
            .by_root
            .range(path.clone()..)
            .take_while(|(root, _)| path.contains(root))
            .map(|(root, _)| root.clone())
            .collect();
        let mut removed = Vec::new();
        for root in roots {
            if let Some(locks) = table.by_root.remove(&root) {
                for lock in &locks {
                    table.tokens.remove(&lock.token);
                }
                removed.extend(locks);
            }
        }
        if !removed.is_empty() {
            debug!(path = %path, count = removed.len(), "removed locks with resource");
            self.released.notify_all();
        }
        removed
    }

    /// Physically remove expired locks. Returns how many were dropped.
    pub fn purge_expired(&self) -> usize {
        let now = self.clock.now();
        let mut table = self.table.lock();
        let expired: Vec<String> = table
            .by_root
            .values()
            .flatten()
            .filter(|l| l.is_expired(now))
            .map(|l| l.token.clone())
            .collect();
        for token in &expired {
            table.remove(token);
        }
        if !expired.is_empty() {
            debug!(count = expired.len(), "purged expired locks");
            self.released.notify_all();
        }
        expired.len()
    }

    /// Number of unexpired locks.
    pub fn active_count(&self) -> usize {
        let now = self.clock.now();
        let table = self.table.lock();
        table
            .by_root
            .values()
            .flatten()
            .filter(|l| !l.is_expired(now))
            .count()
    }
}

/// Shortest lock lifetime granted for an explicit `Second-N` request.
pub const MIN_LOCK_TIMEOUT: Duration = Duration::from_secs(1);

/// Parse a `Timeout` header (`Second-N`, `Infinite`, comma-separated
/// preferences). The first understood value wins, raised to
/// [`MIN_LOCK_TIMEOUT`] and capped at `max`; an absent or unusable header
/// yields `default`.
pub fn parse_timeout(header: Option<&str>, default: Duration, max: Duration) -> Duration {
    let Some(header) = header else {
        return default.min(max);
    };
    for candidate in header.split(',').map(str::trim) {
        if candidate.eq_ignore_ascii_case("infinite") {
            return max;
        }
        let seconds = candidate
            .get(..7)
            .filter(|prefix| prefix.eq_ignore_ascii_case("second-"))
            .and_then(|_| candidate[7..].parse::<u64>().ok());
        if let Some(seconds) = seconds {
            return Duration::from_secs(seconds).max(MIN_LOCK_TIMEOUT).min(max);
        }
    }
    default.min(max)
}
