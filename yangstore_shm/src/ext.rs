//! Ext SHM: the growable arena holding variable-length subscription arrays
//! and path strings, addressed by offsets stored in main-SHM module records.
//!
//! The first page holds the file magic, the arena header and the arena
//! lock; it is mapped once and never remapped, so lock guards stay valid
//! while the data mapping grows. Allocations start at the second page.
//! Offsets are stable forever because the file only grows.
//!
//! Freed space is not reused, only accounted in `wasted`; arrays are
//! reallocated with amortized doubling, so waste is bounded by live data.

use std::fs::File;
use std::path::Path;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

use memmap2::{MmapMut, MmapOptions};
use parking_lot::RwLock;
use static_assertions::const_assert_eq;
use ycommon::consts::{EXT_SHM_FILE, PAGE_SIZE};
use ycommon::types::{LockClass, LockMode};

use crate::error::ShmResult;
use crate::platform;
use crate::region::magic;
use crate::rwlock::{CidLiveness, ShmRwLock};

/// Initial ext file size.
const EXT_INITIAL_SIZE: usize = 16 * PAGE_SIZE;

/// Offset of the arena header, right after the padded file magic.
const HEADER_OFF: usize = 64;

/// Offset of the arena lock within the first page.
const LOCK_OFF: usize = 128;

/// First allocatable offset.
const DATA_START: usize = PAGE_SIZE;

/// Arena bookkeeping, lives in the never-remapped first page.
#[repr(C)]
struct ExtHeader {
    /// Current file size; peers compare against their mapping length and
    /// remap lazily.
    shm_size: AtomicU64,
    /// Next free offset.
    alloc_cursor: AtomicU64,
    /// Bytes freed and not reused.
    wasted: AtomicU64,
    _pad: [u8; 40],
}

const_assert_eq!(std::mem::size_of::<ExtHeader>(), 64);

/// Descriptor of one array allocation in ext SHM, stored inside a main-SHM
/// module record. Mutated only under the owning per-kind write lock.
#[repr(C)]
pub struct ExtArray {
    /// Byte offset of the first record, 0 when empty.
    pub off: AtomicU32,
    /// Live record count.
    pub count: AtomicU32,
    /// Allocated record capacity.
    pub cap: AtomicU32,
}

const_assert_eq!(std::mem::size_of::<ExtArray>(), 12);

/// Marker for `#[repr(C)]` records that may live in ext SHM. All fields
/// must be atomics or plain integers so shared references permit the
/// mutation the per-kind locks allow.
///
/// # Safety
///
/// Implementors guarantee any bit pattern is a valid value.
pub unsafe trait ExtRecord: Sized {}

/// The ext SHM arena of one daemon instance.
pub struct ExtShm {
    /// Fixed mapping of the first page: magic, header, lock.
    head: MmapMut,
    /// Mapping of the whole file; grows, protected against in-process
    /// use-during-remap by the RwLock.
    data: RwLock<MmapMut>,
    file: File,
    /// Per-kind lock timeout used for the arena lock.
    lock_timeout: Duration,
}

impl ExtShm {
    /// Create or attach the ext region under `run_dir`.
    pub fn open(run_dir: &Path, lock_timeout: Duration) -> ShmResult<Self> {
        let path = run_dir.join(EXT_SHM_FILE);
        let _create_guard = platform::create_lock(run_dir)?;
        let existed = path.exists() && std::fs::metadata(&path)?.len() > 0;

        let (file, data_map) = platform::create_file_mmap(&path, EXT_INITIAL_SIZE)?;
        let head = unsafe { MmapOptions::new().len(PAGE_SIZE).map_mut(&file)? };

        let ext = Self {
            head,
            data: RwLock::new(data_map),
            file,
            lock_timeout,
        };

        if existed {
            magic::validate(&ext.head, EXT_SHM_FILE)?;
        } else {
            magic::write(&ext.head);
            ext.header().shm_size.store(EXT_INITIAL_SIZE as u64, Ordering::Release);
            ext.header().alloc_cursor.store(DATA_START as u64, Ordering::Release);
            ext.header().wasted.store(0, Ordering::Release);
            ext.lock_cell().init();
        }
        Ok(ext)
    }

    fn header(&self) -> &ExtHeader {
        unsafe { &*(self.head.as_ptr().add(HEADER_OFF) as *const ExtHeader) }
    }

    fn lock_cell(&self) -> &ShmRwLock {
        unsafe { &*(self.head.as_ptr().add(LOCK_OFF) as *const ShmRwLock) }
    }

    /// Bytes freed but not yet reclaimed.
    pub fn wasted(&self) -> u64 {
        self.header().wasted.load(Ordering::Acquire)
    }

    // Remap if another process grew the file.
    fn sync_map(&self) {
        let size = self.header().shm_size.load(Ordering::Acquire) as usize;
        if self.data.read().len() < size {
            let mut map = self.data.write();
            if map.len() < size {
                match platform::remap_file(&self.file) {
                    Ok(new_map) => *map = new_map,
                    Err(e) => tracing::warn!("ext SHM remap failed: {e}"),
                }
            }
        }
    }

    /// Allocate `len` bytes and return their offset. Takes the arena write
    /// lock; grows the file by powers of two when full.
    pub fn alloc(&self, len: usize, cid: u32, live: &dyn CidLiveness) -> ShmResult<u32> {
        let len = (len + 7) & !7;
        let _guard = self.lock_cell().lock(
            LockMode::Write,
            self.lock_timeout,
            cid,
            LockClass::ExtShm,
            live,
        )?;

        let header = self.header();
        let cursor = header.alloc_cursor.load(Ordering::Acquire);
        let size = header.shm_size.load(Ordering::Acquire);

        if cursor + len as u64 > size {
            let new_size = platform::next_pow2((cursor + len as u64) as usize, size as usize * 2);
            self.file.set_len(new_size as u64)?;
            {
                let mut map = self.data.write();
                *map = platform::remap_file(&self.file)?;
            }
            header.shm_size.store(new_size as u64, Ordering::Release);
            tracing::debug!(new_size, "ext SHM grown");
        }

        header.alloc_cursor.store(cursor + len as u64, Ordering::Release);
        Ok(cursor as u32)
    }

    /// Release an allocation. Space is only accounted, not reused.
    pub fn free(&self, _off: u32, len: usize) {
        let len = (len + 7) & !7;
        self.header().wasted.fetch_add(len as u64, Ordering::AcqRel);
    }

    /// Copy bytes out of the arena.
    pub fn read_bytes(&self, off: u32, len: usize) -> Vec<u8> {
        if len == 0 {
            return Vec::new();
        }
        self.sync_map();
        let map = self.data.read();
        map[off as usize..off as usize + len].to_vec()
    }

    /// Allocate and fill a byte blob, returning its offset.
    pub fn alloc_bytes(&self, data: &[u8], cid: u32, live: &dyn CidLiveness) -> ShmResult<u32> {
        let off = self.alloc(data.len(), cid, live)?;
        {
            let map = self.data.read();
            let dst = unsafe { map.as_ptr().add(off as usize) as *mut u8 };
            unsafe { std::ptr::copy_nonoverlapping(data.as_ptr(), dst, data.len()) };
        }
        Ok(off)
    }

    /// Run `f` over the records of `arr`. The caller must hold the owning
    /// per-kind lock in at least read mode.
    pub fn with_records<T: ExtRecord, R>(&self, arr: &ExtArray, f: impl FnOnce(&[T]) -> R) -> R {
        self.sync_map();
        let map = self.data.read();
        let off = arr.off.load(Ordering::Acquire) as usize;
        let count = arr.count.load(Ordering::Acquire) as usize;
        let records: &[T] = if off == 0 || count == 0 {
            &[]
        } else {
            unsafe { std::slice::from_raw_parts(map.as_ptr().add(off) as *const T, count) }
        };
        f(records)
    }

    /// Append a record to `arr`, growing its allocation with amortized
    /// doubling. The caller must hold the owning per-kind write lock.
    pub fn push_record<T: ExtRecord>(
        &self,
        arr: &ExtArray,
        rec: T,
        cid: u32,
        live: &dyn CidLiveness,
    ) -> ShmResult<usize> {
        let size = std::mem::size_of::<T>();
        let count = arr.count.load(Ordering::Acquire) as usize;
        let cap = arr.cap.load(Ordering::Acquire) as usize;

        if count == cap {
            let new_cap = if cap == 0 { 4 } else { cap * 2 };
            let new_off = self.alloc(new_cap * size, cid, live)?;
            let old_off = arr.off.load(Ordering::Acquire);
            if old_off != 0 && count > 0 {
                let map = self.data.read();
                unsafe {
                    std::ptr::copy_nonoverlapping(
                        map.as_ptr().add(old_off as usize),
                        map.as_ptr().add(new_off as usize) as *mut u8,
                        count * size,
                    );
                }
            }
            if old_off != 0 {
                self.free(old_off, cap * size);
            }
            arr.off.store(new_off, Ordering::Release);
            arr.cap.store(new_cap as u32, Ordering::Release);
        }

        {
            self.sync_map();
            let map = self.data.read();
            let off = arr.off.load(Ordering::Acquire) as usize;
            unsafe {
                let dst = map.as_ptr().add(off + count * size) as *mut T;
                std::ptr::write(dst, rec);
            }
        }
        arr.count.store(count as u32 + 1, Ordering::Release);
        Ok(count)
    }

    /// Remove the record at `idx` by copying the last record over it. When
    /// the array empties, its allocation is released. The caller must hold
    /// the owning per-kind write lock.
    pub fn swap_remove_record<T: ExtRecord>(&self, arr: &ExtArray, idx: usize) {
        let size = std::mem::size_of::<T>();
        let count = arr.count.load(Ordering::Acquire) as usize;
        debug_assert!(idx < count);
        let off = arr.off.load(Ordering::Acquire) as usize;

        if idx + 1 < count {
            self.sync_map();
            let map = self.data.read();
            unsafe {
                std::ptr::copy_nonoverlapping(
                    map.as_ptr().add(off + (count - 1) * size),
                    map.as_ptr().add(off + idx * size) as *mut u8,
                    size,
                );
            }
        }
        arr.count.store(count as u32 - 1, Ordering::Release);

        if count == 1 {
            let cap = arr.cap.load(Ordering::Acquire) as usize;
            self.free(off as u32, cap * size);
            arr.off.store(0, Ordering::Release);
            arr.cap.store(0, Ordering::Release);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct AllAlive;

    impl CidLiveness for AllAlive {
        fn is_alive(&self, _cid: u32) -> bool {
            true
        }
    }

    #[repr(C)]
    struct TestRec {
        id: AtomicU32,
        val: AtomicU32,
    }

    unsafe impl ExtRecord for TestRec {}

    fn rec(id: u32, val: u32) -> TestRec {
        TestRec {
            id: AtomicU32::new(id),
            val: AtomicU32::new(val),
        }
    }

    fn fresh_array() -> ExtArray {
        ExtArray {
            off: AtomicU32::new(0),
            count: AtomicU32::new(0),
            cap: AtomicU32::new(0),
        }
    }

    fn open_ext(dir: &tempfile::TempDir) -> ExtShm {
        ExtShm::open(dir.path(), Duration::from_secs(1)).unwrap()
    }

    #[test]
    fn alloc_offsets_are_aligned_and_distinct() {
        let dir = tempfile::tempdir().unwrap();
        let ext = open_ext(&dir);

        let a = ext.alloc(10, 1, &AllAlive).unwrap();
        let b = ext.alloc(100, 1, &AllAlive).unwrap();
        assert_eq!(a % 8, 0);
        assert_eq!(b % 8, 0);
        assert!(b >= a + 16);
    }

    #[test]
    fn bytes_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let ext = open_ext(&dir);

        let off = ext.alloc_bytes(b"/mod:cfg/leaf", 1, &AllAlive).unwrap();
        assert_eq!(ext.read_bytes(off, 13), b"/mod:cfg/leaf");
    }

    #[test]
    fn growth_preserves_existing_data() {
        let dir = tempfile::tempdir().unwrap();
        let ext = open_ext(&dir);

        let off = ext.alloc_bytes(b"keepme", 1, &AllAlive).unwrap();
        // Force several growth rounds past the initial size.
        for _ in 0..8 {
            ext.alloc(EXT_INITIAL_SIZE / 2, 1, &AllAlive).unwrap();
        }
        assert_eq!(ext.read_bytes(off, 6), b"keepme");
    }

    #[test]
    fn push_and_swap_remove_keep_multiset() {
        let dir = tempfile::tempdir().unwrap();
        let ext = open_ext(&dir);
        let arr = fresh_array();

        for i in 0..7u32 {
            ext.push_record(&arr, rec(i, i * 10), 1, &AllAlive).unwrap();
        }
        assert_eq!(arr.count.load(Ordering::Relaxed), 7);

        // Remove id 2; the multiset minus that element must survive.
        let idx = ext.with_records::<TestRec, _>(&arr, |recs| {
            recs.iter().position(|r| r.id.load(Ordering::Relaxed) == 2).unwrap()
        });
        ext.swap_remove_record::<TestRec>(&arr, idx);

        let mut ids = ext.with_records::<TestRec, _>(&arr, |recs| {
            recs.iter().map(|r| r.id.load(Ordering::Relaxed)).collect::<Vec<_>>()
        });
        ids.sort_unstable();
        assert_eq!(ids, vec![0, 1, 3, 4, 5, 6]);
    }

    #[test]
    fn emptied_array_releases_storage() {
        let dir = tempfile::tempdir().unwrap();
        let ext = open_ext(&dir);
        let arr = fresh_array();

        ext.push_record(&arr, rec(1, 1), 1, &AllAlive).unwrap();
        ext.swap_remove_record::<TestRec>(&arr, 0);

        assert_eq!(arr.off.load(Ordering::Relaxed), 0);
        assert_eq!(arr.cap.load(Ordering::Relaxed), 0);
        assert!(ext.wasted() > 0);
    }

    #[test]
    fn reattach_sees_previous_state() {
        let dir = tempfile::tempdir().unwrap();
        let off;
        {
            let ext = open_ext(&dir);
            off = ext.alloc_bytes(b"persist", 1, &AllAlive).unwrap();
        }
        let ext2 = open_ext(&dir);
        assert_eq!(ext2.read_bytes(off, 7), b"persist");
    }
}
