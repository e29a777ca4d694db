//! Timed read / read-upgradable / write lock placed in shared memory.
//!
//! The lock is a plain `#[repr(C)]` cell of atomics, so it can live inside
//! any mapped region. Holders are identified by their connection ID; when a
//! holder dies, the next waiter that probes liveness clears the stale state
//! in place.
//!
//! ## Protocol
//!
//! - `writer` holds the CID of the exclusive owner, 0 when free.
//! - `upgr` holds the CID of the single read-upgradable owner, 0 when free.
//!   A write acquisition always claims `upgr` first, which makes write and
//!   read-upgradable owners mutually exclusive by construction.
//! - `readers` counts plain readers; up to [`RWLOCK_READ_TRACK`] of their
//!   CIDs are tracked in `read_cids` so reader death is recoverable.
//!
//! All acquisitions carry an explicit timeout; on expiry the operation
//! fails with `TimedOut` and no state is changed. A failed upgrade retains
//! the read-upgradable mode.

use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};

use static_assertions::const_assert_eq;
use ycommon::consts::RWLOCK_READ_TRACK;
use ycommon::types::{LockClass, LockMode};

use crate::error::{ShmError, ShmResult};

/// Liveness probe for connection IDs, implemented by the main-SHM
/// connection table.
pub trait CidLiveness {
    /// Whether the connection is still attached and its process alive.
    fn is_alive(&self, cid: u32) -> bool;
}

/// How often stale holders are probed while waiting.
const RECOVERY_INTERVAL: Duration = Duration::from_millis(100);

/// Spin rounds before the waiter starts sleeping between attempts.
const SPIN_ROUNDS: u32 = 128;

/// Sleep between attempts once spinning stopped paying off.
const WAIT_SLEEP: Duration = Duration::from_micros(200);

// ─── Lock cell ──────────────────────────────────────────────────────

/// A read/upgradable/write lock living in shared memory.
#[repr(C, align(64))]
pub struct ShmRwLock {
    /// CID of the exclusive writer, 0 when free.
    writer: AtomicU32,
    /// CID of the read-upgradable holder, 0 when free.
    upgr: AtomicU32,
    /// Count of plain readers.
    readers: AtomicU32,
    /// Best-effort registry of reader CIDs for crash recovery.
    read_cids: [AtomicU32; RWLOCK_READ_TRACK],
    _pad: [u8; 20],
}

const_assert_eq!(std::mem::size_of::<ShmRwLock>(), 64);
const_assert_eq!(std::mem::align_of::<ShmRwLock>(), 64);

impl ShmRwLock {
    /// Initialize the cell in place. Only the region creator calls this.
    pub fn init(&self) {
        self.writer.store(0, Ordering::Relaxed);
        self.upgr.store(0, Ordering::Relaxed);
        self.readers.store(0, Ordering::Relaxed);
        for slot in &self.read_cids {
            slot.store(0, Ordering::Relaxed);
        }
    }

    /// Acquire the lock in `mode` within `timeout`.
    pub fn lock<'a>(
        &'a self,
        mode: LockMode,
        timeout: Duration,
        cid: u32,
        class: LockClass,
        live: &dyn CidLiveness,
    ) -> ShmResult<ShmLockGuard<'a>> {
        debug_assert!(mode != LockMode::None);
        order::check_and_push(class);

        let deadline = Instant::now() + timeout;
        let result = match mode {
            LockMode::Read => self.acquire_read(deadline, cid, live),
            LockMode::ReadUpgr => self.acquire_upgr(deadline, cid, live).map(|_| None),
            LockMode::Write => self
                .acquire_upgr(deadline, cid, live)
                .and_then(|_| match self.claim_writer(deadline, cid, live) {
                    Ok(()) => Ok(None),
                    Err(e) => {
                        self.upgr.store(0, Ordering::Release);
                        Err(e)
                    }
                }),
            LockMode::None => unreachable!(),
        };

        match result {
            Ok(read_slot) => Ok(ShmLockGuard {
                lock: self,
                mode,
                cid,
                class,
                read_slot,
            }),
            Err(e) => {
                order::pop(class);
                Err(e)
            }
        }
    }

    // Plain read: wait for the writer flag to clear, then join the readers.
    fn acquire_read(
        &self,
        deadline: Instant,
        cid: u32,
        live: &dyn CidLiveness,
    ) -> ShmResult<Option<usize>> {
        self.wait(deadline, live, "read lock", || {
            if self.writer.load(Ordering::Acquire) != 0 {
                return false;
            }
            self.readers.fetch_add(1, Ordering::AcqRel);
            if self.writer.load(Ordering::Acquire) == 0 {
                true
            } else {
                // Lost the race against a writer draining readers.
                self.readers.fetch_sub(1, Ordering::AcqRel);
                false
            }
        })?;
        Ok(self.track_reader(cid))
    }

    // Read-upgradable (also the first half of a write acquisition): claim
    // the single upgr slot, backing off whenever a writer is active.
    fn acquire_upgr(&self, deadline: Instant, cid: u32, live: &dyn CidLiveness) -> ShmResult<()> {
        self.wait(deadline, live, "read-upgr lock", || {
            if self.writer.load(Ordering::Acquire) != 0 {
                return false;
            }
            if self
                .upgr
                .compare_exchange(0, cid, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
            {
                return false;
            }
            if self.writer.load(Ordering::Acquire) == 0 {
                true
            } else {
                self.upgr.store(0, Ordering::Release);
                false
            }
        })
    }

    // Second half of a write acquisition or an upgrade: set the writer flag
    // (ours by virtue of holding upgr) and drain the readers.
    fn claim_writer(&self, deadline: Instant, cid: u32, live: &dyn CidLiveness) -> ShmResult<()> {
        self.writer.store(cid, Ordering::Release);
        let drained = self.wait(deadline, live, "reader drain", || {
            self.readers.load(Ordering::Acquire) == 0
        });
        if drained.is_err() {
            self.writer.store(0, Ordering::Release);
        }
        drained
    }

    // Register this reader's CID in a free tracking slot, best effort.
    fn track_reader(&self, cid: u32) -> Option<usize> {
        for (i, slot) in self.read_cids.iter().enumerate() {
            if slot
                .compare_exchange(0, cid, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return Some(i);
            }
        }
        None
    }

    fn untrack_reader(&self, cid: u32, slot: Option<usize>) {
        if let Some(i) = slot {
            let _ = self.read_cids[i].compare_exchange(
                cid,
                0,
                Ordering::AcqRel,
                Ordering::Acquire,
            );
        }
    }

    // Bounded wait: spin, then sleep, probing for dead holders on the way.
    fn wait(
        &self,
        deadline: Instant,
        live: &dyn CidLiveness,
        what: &'static str,
        mut attempt: impl FnMut() -> bool,
    ) -> ShmResult<()> {
        let timeout = deadline.saturating_duration_since(Instant::now());
        let mut rounds = 0u32;
        let mut last_probe = Instant::now();
        loop {
            if attempt() {
                return Ok(());
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(ShmError::TimedOut {
                    what,
                    ms: timeout.as_millis() as u64,
                });
            }
            if now.duration_since(last_probe) >= RECOVERY_INTERVAL {
                self.recover_dead(live);
                last_probe = now;
            }
            if rounds < SPIN_ROUNDS {
                rounds += 1;
                std::hint::spin_loop();
            } else {
                std::thread::sleep(WAIT_SLEEP);
            }
        }
    }

    /// Clear holders whose connection died. Called by waiters and by the
    /// liveness sweep.
    pub fn recover_dead(&self, live: &dyn CidLiveness) {
        let w = self.writer.load(Ordering::Acquire);
        if w != 0 && !live.is_alive(w) {
            if self
                .writer
                .compare_exchange(w, 0, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                tracing::warn!(cid = w, "recovered write lock of dead connection");
            }
        }
        let u = self.upgr.load(Ordering::Acquire);
        if u != 0 && !live.is_alive(u) {
            if self
                .upgr
                .compare_exchange(u, 0, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                tracing::warn!(cid = u, "recovered read-upgr lock of dead connection");
            }
        }
        for slot in &self.read_cids {
            let r = slot.load(Ordering::Acquire);
            if r != 0 && !live.is_alive(r) {
                if slot
                    .compare_exchange(r, 0, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    self.readers.fetch_sub(1, Ordering::AcqRel);
                    tracing::warn!(cid = r, "recovered read lock of dead connection");
                }
            }
        }
    }

    fn unlock(&self, mode: LockMode, cid: u32, read_slot: Option<usize>) {
        match mode {
            LockMode::Read => {
                self.untrack_reader(cid, read_slot);
                self.readers.fetch_sub(1, Ordering::AcqRel);
            }
            LockMode::ReadUpgr => {
                self.upgr.store(0, Ordering::Release);
            }
            LockMode::Write => {
                self.writer.store(0, Ordering::Release);
                self.upgr.store(0, Ordering::Release);
            }
            LockMode::None => {}
        }
    }
}

// ─── Guard ──────────────────────────────────────────────────────────

/// Scoped ownership of a [`ShmRwLock`]; releases on drop along every exit
/// path.
pub struct ShmLockGuard<'a> {
    lock: &'a ShmRwLock,
    mode: LockMode,
    cid: u32,
    class: LockClass,
    read_slot: Option<usize>,
}

impl ShmLockGuard<'_> {
    /// Mode currently held.
    #[inline]
    pub fn mode(&self) -> LockMode {
        self.mode
    }

    /// Promote a read-upgradable hold to write, draining readers. On
    /// timeout the guard stays read-upgradable and `TimedOut` is returned.
    pub fn upgrade(&mut self, timeout: Duration, live: &dyn CidLiveness) -> ShmResult<()> {
        match self.mode {
            LockMode::Write => Ok(()),
            LockMode::ReadUpgr => {
                let deadline = Instant::now() + timeout;
                self.lock.claim_writer(deadline, self.cid, live)?;
                self.mode = LockMode::Write;
                Ok(())
            }
            _ => Err(ShmError::NotFound {
                what: "upgradable hold to promote".to_string(),
            }),
        }
    }

    /// Demote a write hold back to read-upgradable. Readers may enter
    /// again; the upgr slot stays ours.
    pub fn downgrade(&mut self) {
        if self.mode == LockMode::Write {
            self.lock.writer.store(0, Ordering::Release);
            self.mode = LockMode::ReadUpgr;
        }
    }
}

impl Drop for ShmLockGuard<'_> {
    fn drop(&mut self) {
        self.lock.unlock(self.mode, self.cid, self.read_slot);
        order::pop(self.class);
    }
}

// ─── Acquisition-order tracking (debug builds) ──────────────────────

#[cfg(debug_assertions)]
mod order {
    use std::cell::RefCell;
    use ycommon::types::LockClass;

    thread_local! {
        static HELD: RefCell<Vec<LockClass>> = const { RefCell::new(Vec::new()) };
    }

    pub fn check_and_push(class: LockClass) {
        HELD.with(|held| {
            let mut held = held.borrow_mut();
            if let Some(&top) = held.last() {
                assert!(
                    top <= class,
                    "lock order violation: acquiring {class:?} while holding {top:?}"
                );
            }
            held.push(class);
        });
    }

    pub fn pop(class: LockClass) {
        HELD.with(|held| {
            let mut held = held.borrow_mut();
            if let Some(pos) = held.iter().rposition(|&c| c == class) {
                held.remove(pos);
            }
        });
    }
}

#[cfg(not(debug_assertions))]
mod order {
    use ycommon::types::LockClass;

    #[inline]
    pub fn check_and_push(_class: LockClass) {}

    #[inline]
    pub fn pop(_class: LockClass) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    struct AllAlive;

    impl CidLiveness for AllAlive {
        fn is_alive(&self, _cid: u32) -> bool {
            true
        }
    }

    struct NoneAlive;

    impl CidLiveness for NoneAlive {
        fn is_alive(&self, _cid: u32) -> bool {
            false
        }
    }

    fn fresh_lock() -> Box<ShmRwLock> {
        // The cell is all-zeroes-valid; box stands in for mapped memory.
        let lock: Box<ShmRwLock> = unsafe { Box::new(std::mem::zeroed()) };
        lock.init();
        lock
    }

    const T: Duration = Duration::from_millis(200);

    #[test]
    fn multiple_readers_coexist() {
        let lock = fresh_lock();
        let g1 = lock.lock(LockMode::Read, T, 1, LockClass::KindSub, &AllAlive).unwrap();
        let g2 = lock.lock(LockMode::Read, T, 2, LockClass::KindSub, &AllAlive).unwrap();
        assert_eq!(g1.mode(), LockMode::Read);
        drop(g1);
        drop(g2);
    }

    #[test]
    fn writer_excludes_reader() {
        let lock = fresh_lock();
        let g = lock.lock(LockMode::Write, T, 1, LockClass::KindSub, &AllAlive).unwrap();
        let r = lock.lock(
            LockMode::Read,
            Duration::from_millis(50),
            2,
            LockClass::KindSub,
            &AllAlive,
        );
        assert!(matches!(r, Err(ShmError::TimedOut { .. })));
        drop(g);
        // State unchanged by the failed attempt.
        let _r = lock.lock(LockMode::Read, T, 2, LockClass::KindSub, &AllAlive).unwrap();
    }

    #[test]
    fn upgr_coexists_with_readers_but_not_writers() {
        let lock = fresh_lock();
        let u = lock.lock(LockMode::ReadUpgr, T, 1, LockClass::KindSub, &AllAlive).unwrap();
        let r = lock.lock(LockMode::Read, T, 2, LockClass::KindSub, &AllAlive).unwrap();
        let w = lock.lock(
            LockMode::Write,
            Duration::from_millis(50),
            3,
            LockClass::KindSub,
            &AllAlive,
        );
        assert!(w.is_err());
        drop(r);
        drop(u);
    }

    #[test]
    fn upgrade_waits_for_readers_and_keeps_upgr_on_timeout() {
        let lock = fresh_lock();
        let mut u = lock.lock(LockMode::ReadUpgr, T, 1, LockClass::KindSub, &AllAlive).unwrap();
        let r = lock.lock(LockMode::Read, T, 2, LockClass::KindSub, &AllAlive).unwrap();

        // Reader present: upgrade must time out, hold stays upgradable.
        let res = u.upgrade(Duration::from_millis(50), &AllAlive);
        assert!(matches!(res, Err(ShmError::TimedOut { .. })));
        assert_eq!(u.mode(), LockMode::ReadUpgr);

        drop(r);
        u.upgrade(T, &AllAlive).unwrap();
        assert_eq!(u.mode(), LockMode::Write);

        u.downgrade();
        assert_eq!(u.mode(), LockMode::ReadUpgr);
        let _r2 = lock.lock(LockMode::Read, T, 2, LockClass::KindSub, &AllAlive).unwrap();
    }

    #[test]
    fn dead_writer_is_recovered() {
        let lock = fresh_lock();
        let g = lock.lock(LockMode::Write, T, 7, LockClass::KindSub, &AllAlive).unwrap();
        std::mem::forget(g); // simulate the holder dying with the lock held
        order::pop(LockClass::KindSub);

        // A waiter that observes CID 7 as dead clears the stale hold.
        let g2 = lock
            .lock(LockMode::Write, Duration::from_millis(500), 8, LockClass::KindSub, &NoneAlive)
            .unwrap();
        drop(g2);
    }

    #[test]
    fn dead_reader_is_recovered() {
        let lock = fresh_lock();
        let g = lock.lock(LockMode::Read, T, 7, LockClass::KindSub, &AllAlive).unwrap();
        std::mem::forget(g);
        order::pop(LockClass::KindSub);

        let g2 = lock
            .lock(LockMode::Write, Duration::from_millis(500), 8, LockClass::KindSub, &NoneAlive)
            .unwrap();
        drop(g2);
    }

    #[test]
    fn contended_writers_serialize() {
        let lock = Arc::new(*fresh_lock());
        let mut handles = Vec::new();
        for cid in 1..=4u32 {
            let lock = Arc::clone(&lock);
            handles.push(std::thread::spawn(move || {
                for _ in 0..50 {
                    let _g = lock
                        .lock(LockMode::Write, Duration::from_secs(5), cid, LockClass::KindSub, &AllAlive)
                        .unwrap();
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(lock.readers.load(Ordering::Relaxed), 0);
        assert_eq!(lock.writer.load(Ordering::Relaxed), 0);
    }
}
