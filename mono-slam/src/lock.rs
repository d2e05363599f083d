//! A reader-writer lock with optional instrumentation.
//!
//! Every acquisition names its call site. With the default [`NoProfiler`] the site names are
//! discarded and no clock is read. With [`LockDiagnostics`] the wait and hold times are collected
//! per site and can be printed with [`LockDiagnostics::report`].

use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::collections::HashMap;
use std::fmt::Write as _;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum LockKind {
    Read,
    Write,
}

/// Receives the timing of every lock acquisition.
pub trait LockProfiler: Send + Sync + 'static {
    /// When `false` the lock never reads the clock.
    const ENABLED: bool;

    fn record(&self, site: &'static str, kind: LockKind, wait: Duration, hold: Duration);
}

/// Discards all measurements.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoProfiler;

impl LockProfiler for NoProfiler {
    const ENABLED: bool = false;

    #[inline(always)]
    fn record(&self, _: &'static str, _: LockKind, _: Duration, _: Duration) {}
}

/// Accumulated timings of one lock site.
#[derive(Debug, Default, Clone, Copy, PartialEq)]
pub struct LockSiteStatistics {
    pub acquisitions: usize,
    pub total_wait: Duration,
    pub maximal_wait: Duration,
    pub total_hold: Duration,
    pub maximal_hold: Duration,
}

/// Collects the timings of all lock sites of one tracker.
#[derive(Debug, Default)]
pub struct LockDiagnostics {
    sites: parking_lot::Mutex<HashMap<(&'static str, LockKind), LockSiteStatistics>>,
}

impl LockDiagnostics {
    pub fn new() -> Self {
        Self::default()
    }

    /// The statistics of every site, sorted by site name.
    pub fn sites(&self) -> Vec<(&'static str, LockKind, LockSiteStatistics)> {
        let mut sites: Vec<_> = self
            .sites
            .lock()
            .iter()
            .map(|(&(site, kind), &statistics)| (site, kind, statistics))
            .collect();
        sites.sort_by_key(|&(site, kind, _)| (site, kind));
        sites
    }

    /// One line per site with the number of acquisitions and the average and maximal times.
    pub fn report(&self) -> String {
        let mut report = String::new();
        for (site, kind, statistics) in self.sites() {
            let count = statistics.acquisitions.max(1) as u32;
            let _ = writeln!(
                report,
                "{} ({:?}): {} acquisitions, wait {:.3?} avg {:.3?} max, hold {:.3?} avg {:.3?} max",
                site,
                kind,
                statistics.acquisitions,
                statistics.total_wait / count,
                statistics.maximal_wait,
                statistics.total_hold / count,
                statistics.maximal_hold,
            );
        }
        report
    }
}

impl LockProfiler for LockDiagnostics {
    const ENABLED: bool = true;

    fn record(&self, site: &'static str, kind: LockKind, wait: Duration, hold: Duration) {
        let mut sites = self.sites.lock();
        let statistics = sites.entry((site, kind)).or_default();
        statistics.acquisitions += 1;
        statistics.total_wait += wait;
        statistics.maximal_wait = statistics.maximal_wait.max(wait);
        statistics.total_hold += hold;
        statistics.maximal_hold = statistics.maximal_hold.max(hold);
    }
}

/// A reader-writer lock handing out scoped [`ReadLock`]s and [`WriteLock`]s.
#[derive(Debug)]
pub struct Mutex<T, P: LockProfiler = NoProfiler> {
    inner: RwLock<T>,
    profiler: Arc<P>,
}

impl<T> Mutex<T, NoProfiler> {
    pub fn new(value: T) -> Self {
        Self::with_profiler(value, Arc::new(NoProfiler))
    }
}

impl<T, P: LockProfiler> Mutex<T, P> {
    pub fn with_profiler(value: T, profiler: Arc<P>) -> Self {
        Self {
            inner: RwLock::new(value),
            profiler,
        }
    }

    /// Acquires shared access, other readers may hold the lock at the same time.
    pub fn read(&self, site: &'static str) -> ReadLock<'_, T, P> {
        let requested = P::ENABLED.then(Instant::now);
        let guard = self.inner.read();
        ReadLock {
            guard,
            timing: Timing::start(&*self.profiler, site, requested),
        }
    }

    /// Acquires exclusive access.
    pub fn write(&self, site: &'static str) -> WriteLock<'_, T, P> {
        let requested = P::ENABLED.then(Instant::now);
        let guard = self.inner.write();
        WriteLock {
            guard,
            timing: Timing::start(&*self.profiler, site, requested),
        }
    }
}

struct Timing<'a, P: LockProfiler> {
    profiler: &'a P,
    site: &'static str,
    wait: Duration,
    acquired: Option<Instant>,
}

impl<'a, P: LockProfiler> Timing<'a, P> {
    fn start(profiler: &'a P, site: &'static str, requested: Option<Instant>) -> Self {
        let acquired = requested.map(|_| Instant::now());
        let wait = match (requested, acquired) {
            (Some(requested), Some(acquired)) => acquired - requested,
            _ => Duration::ZERO,
        };
        Self {
            profiler,
            site,
            wait,
            acquired,
        }
    }

    fn finish(&self, kind: LockKind) {
        if let Some(acquired) = self.acquired {
            self.profiler
                .record(self.site, kind, self.wait, acquired.elapsed());
        }
    }
}

/// Shared access to the value of a [`Mutex`], released on drop or with [`ReadLock::unlock`].
pub struct ReadLock<'a, T, P: LockProfiler = NoProfiler> {
    guard: RwLockReadGuard<'a, T>,
    timing: Timing<'a, P>,
}

impl<'a, T, P: LockProfiler> ReadLock<'a, T, P> {
    pub fn unlock(self) {}
}

impl<'a, T, P: LockProfiler> Deref for ReadLock<'a, T, P> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.guard
    }
}

impl<'a, T, P: LockProfiler> Drop for ReadLock<'a, T, P> {
    fn drop(&mut self) {
        self.timing.finish(LockKind::Read);
    }
}

/// Exclusive access to the value of a [`Mutex`], released on drop or with [`WriteLock::unlock`].
pub struct WriteLock<'a, T, P: LockProfiler = NoProfiler> {
    guard: RwLockWriteGuard<'a, T>,
    timing: Timing<'a, P>,
}

impl<'a, T, P: LockProfiler> WriteLock<'a, T, P> {
    pub fn unlock(self) {}
}

impl<'a, T, P: LockProfiler> Deref for WriteLock<'a, T, P> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.guard
    }
}

impl<'a, T, P: LockProfiler> DerefMut for WriteLock<'a, T, P> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.guard
    }
}

impl<'a, T, P: LockProfiler> Drop for WriteLock<'a, T, P> {
    fn drop(&mut self) {
        self.timing.finish(LockKind::Write);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn readers_share_the_lock() {
        let mutex = Mutex::new(vec![1, 2, 3]);
        let a = mutex.read("a");
        let b = mutex.read("b");
        assert_eq!(a.len() + b.len(), 6);
        a.unlock();
        b.unlock();
        mutex.write("c").push(4);
        assert_eq!(mutex.read("d").len(), 4);
    }

    #[test]
    fn writers_exclude_each_other() {
        let mutex = Arc::new(Mutex::new(0usize));
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let mutex = mutex.clone();
                std::thread::spawn(move || {
                    for _ in 0..1000 {
                        *mutex.write("increment") += 1;
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(*mutex.read("result"), 4000);
    }

    #[test]
    fn diagnostics_count_every_site() {
        let diagnostics = Arc::new(LockDiagnostics::new());
        let mutex = Mutex::with_profiler(0u32, diagnostics.clone());
        for _ in 0..3 {
            let _ = *mutex.read("reader");
        }
        *mutex.write("writer") = 7;

        let sites = diagnostics.sites();
        assert_eq!(sites.len(), 2);
        assert_eq!(sites[0].0, "reader");
        assert_eq!(sites[0].2.acquisitions, 3);
        assert_eq!(sites[1].1, LockKind::Write);
        assert!(diagnostics.report().contains("writer (Write): 1 acquisitions"));
    }
}
