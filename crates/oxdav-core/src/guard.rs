//! Per-resource critical sections.
//!
//! Every request holds a guard on each path it touches for the duration of
//! its store and property work: read guards for inspection, write guards for
//! mutation. Every ancestor of a touched path is read-guarded as well, so a
//! write guard on a collection excludes all work inside its subtree. Guards
//! for several paths are always acquired in path order (ancestors first), so
//! two requests touching the same pair of resources (e.g. crossing MOVEs)
//! cannot deadlock.
//!
//! Slots are created lazily and cached; [`ResourceGuards::prune`] drops the
//! ones nobody holds.

use crate::path::CanonicalPath;
use dashmap::DashMap;
use parking_lot::{ArcRwLockReadGuard, ArcRwLockWriteGuard, RawRwLock, RwLock};
use std::sync::Arc;

/// How a path is held.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum GuardMode {
    Read,
    Write,
}

#[allow(dead_code)]
enum Held {
    Read(ArcRwLockReadGuard<RawRwLock, ()>),
    Write(ArcRwLockWriteGuard<RawRwLock, ()>),
}

/// Set of held critical sections, released on drop.
#[must_use = "the critical section ends when the guard is dropped"]
pub struct ResourceGuard {
    held: Vec<Held>,
}

impl std::fmt::Debug for ResourceGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceGuard")
            .field("held", &self.held.len())
            .finish()
    }
}

/// Table of per-path reader-writer locks.
#[derive(Debug, Default)]
pub struct ResourceGuards {
    slots: DashMap<CanonicalPath, Arc<RwLock<()>>>,
}

impl ResourceGuards {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self, path: &CanonicalPath) -> Arc<RwLock<()>> {
        self.slots
            .entry(path.clone())
            .or_insert_with(|| Arc::new(RwLock::new(())))
            .clone()
    }

    pub fn read(&self, path: &CanonicalPath) -> ResourceGuard {
        self.acquire(vec![(path.clone(), GuardMode::Read)])
    }

    pub fn write(&self, path: &CanonicalPath) -> ResourceGuard {
        self.acquire(vec![(path.clone(), GuardMode::Write)])
    }

    /// Hold every listed path and read-hold each of their ancestors, in path
    /// order. A path listed twice is held once, in the stronger mode.
    pub fn acquire(&self, mut plan: Vec<(CanonicalPath, GuardMode)>) -> ResourceGuard {
        let ancestors: Vec<_> = plan
            .iter()
            .flat_map(|(path, _)| path.ancestors())
            .map(|ancestor| (ancestor, GuardMode::Read))
            .collect();
        plan.extend(ancestors);
        // Within one path the write entry sorts first and survives dedup.
        plan.sort_by(|a, b| a.0.cmp(&b.0).then(b.1.cmp(&a.1)));
        plan.dedup_by(|later, earlier| later.0 == earlier.0);

        let held = plan
            .into_iter()
            .map(|(path, mode)| {
                let slot = self.slot(&path);
                match mode {
                    GuardMode::Read => Held::Read(slot.read_arc()),
                    GuardMode::Write => Held::Write(slot.write_arc()),
                }
            })
            .collect();
        ResourceGuard { held }
    }

    /// Drop slots no request currently holds. Returns how many were dropped.
    pub fn prune(&self) -> usize {
        let before = self.slots.len();
        self.slots.retain(|_, slot| Arc::strong_count(slot) > 1);
        before.saturating_sub(self.slots.len())
    }

    /// Number of cached slots.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::thread;
    use std::time::Duration;

    fn p(s: &str) -> CanonicalPath {
        s.parse().unwrap()
    }

    #[test]
    fn test_readers_share() {
        let guards = ResourceGuards::new();
        let _a = guards.read(&p("/f"));
        let _b = guards.read(&p("/f"));
        assert_eq!(guards.len(), 2);
    }

    #[test]
    fn test_writer_excludes_reader() {
        let guards = Arc::new(ResourceGuards::new());
        let writing = guards.write(&p("/f"));
        let entered = Arc::new(AtomicBool::new(false));

        let reader = {
            let guards = Arc::clone(&guards);
            let entered = Arc::clone(&entered);
            thread::spawn(move || {
                let _g = guards.read(&p("/f"));
                entered.store(true, Ordering::SeqCst);
            })
        };
        thread::sleep(Duration::from_millis(50));
        assert!(!entered.load(Ordering::SeqCst));
        drop(writing);
        reader.join().unwrap();
        assert!(entered.load(Ordering::SeqCst));
    }

    #[test]
    fn test_duplicate_path_held_once_in_write_mode() {
        let guards = ResourceGuards::new();
        let guard = guards.acquire(vec![
            (p("/a"), GuardMode::Read),
            (p("/a"), GuardMode::Write),
            (p("/b"), GuardMode::Read),
        ]);
        // "/" is read-held as the common ancestor.
        assert_eq!(guard.held.len(), 3);
        assert!(matches!(guard.held[0], Held::Read(_)));
        assert!(matches!(guard.held[1], Held::Write(_)));
    }

    #[test]
    fn test_ancestors_are_read_held() {
        let guards = ResourceGuards::new();
        let guard = guards.write(&p("/a/b/c"));
        assert_eq!(guard.held.len(), 4);
        assert!(matches!(guard.held[3], Held::Write(_)));
        assert!(guard.held[..3].iter().all(|h| matches!(h, Held::Read(_))));
        // A second writer below the same ancestors shares them.
        let _sibling = guards.write(&p("/a/b/d"));
    }

    #[test]
    fn test_ancestor_writer_excludes_descendant() {
        let guards = Arc::new(ResourceGuards::new());
        let subtree = guards.write(&p("/a"));
        let entered = Arc::new(AtomicBool::new(false));

        let worker = {
            let guards = Arc::clone(&guards);
            let entered = Arc::clone(&entered);
            thread::spawn(move || {
                let _g = guards.write(&p("/a/b/c"));
                entered.store(true, Ordering::SeqCst);
            })
        };
        thread::sleep(Duration::from_millis(50));
        assert!(!entered.load(Ordering::SeqCst));
        drop(subtree);
        worker.join().unwrap();
        assert!(entered.load(Ordering::SeqCst));
    }

    #[test]
    fn test_nested_acquisitions_do_not_deadlock() {
        let guards = Arc::new(ResourceGuards::new());
        let paths = ["/a", "/a/b", "/a/b/c", "/a/d"];
        let workers: Vec<_> = (0..4)
            .map(|i| {
                let guards = Arc::clone(&guards);
                thread::spawn(move || {
                    for round in 0..200 {
                        let x = paths[(i + round) % paths.len()];
                        let y = paths[(i + round + 1) % paths.len()];
                        let _g = guards.acquire(vec![
                            (p(x), GuardMode::Write),
                            (p(y), GuardMode::Read),
                        ]);
                    }
                })
            })
            .collect();
        for worker in workers {
            worker.join().unwrap();
        }
    }

    #[test]
    fn test_crossing_acquisitions_do_not_deadlock() {
        let guards = Arc::new(ResourceGuards::new());
        let workers: Vec<_> = (0..4)
            .map(|i| {
                let guards = Arc::clone(&guards);
                thread::spawn(move || {
                    for _ in 0..200 {
                        let (x, y) = if i % 2 == 0 { ("/x", "/y") } else { ("/y", "/x") };
                        let _g = guards.acquire(vec![
                            (p(x), GuardMode::Write),
                            (p(y), GuardMode::Write),
                        ]);
                    }
                })
            })
            .collect();
        for worker in workers {
            worker.join().unwrap();
        }
    }

    #[test]
    fn test_prune_keeps_held_slots() {
        let guards = ResourceGuards::new();
        let held = guards.read(&p("/kept"));
        drop(guards.read(&p("/dropped")));
        assert_eq!(guards.prune(), 1);
        assert_eq!(guards.len(), 2);
        drop(held);
        assert_eq!(guards.prune(), 2);
        assert!(guards.is_empty());
    }
}
