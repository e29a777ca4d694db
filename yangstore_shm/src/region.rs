//! Main SHM region: file magic, global counters, connection slots and the
//! module table.
//!
//! The main region is sized at creation for `max_modules` records and never
//! remapped, so references into it stay valid for the lifetime of the
//! mapping. Module records are bump-allocated and chained into fixed hash
//! buckets; records never move, which keeps cross-process offsets and lock
//! cells stable. Variable-size state (subscription arrays, path strings)
//! lives in ext SHM and is referenced by offset.

use std::fs::File;
use std::path::Path;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

use memmap2::MmapMut;
use static_assertions::const_assert_eq;
use ycommon::consts::{
    CONN_SLOT_COUNT, MAIN_SHM_FILE, MODULE_NAME_MAX, PAGE_SIZE, SHM_ENDIAN, SHM_MAGIC, SHM_VERSION,
};
use ycommon::types::{LockClass, LockMode, DATASTORE_COUNT};

use crate::error::{ShmError, ShmResult};
use crate::ext::{ExtArray, ExtRecord};
use crate::platform;
use crate::rwlock::{CidLiveness, ShmRwLock};

// ─── File magic ─────────────────────────────────────────────────────

/// The 16-byte magic header every yangstore SHM file starts with.
pub mod magic {
    use super::*;

    #[repr(C)]
    struct FileMagic {
        magic: [u8; 4],
        version: u32,
        endian: u32,
        page_size: u32,
    }

    const_assert_eq!(std::mem::size_of::<FileMagic>(), 16);

    /// Stamp the magic header into a freshly created mapping.
    pub fn write(map: &MmapMut) {
        let m = FileMagic {
            magic: SHM_MAGIC,
            version: SHM_VERSION,
            endian: SHM_ENDIAN,
            page_size: PAGE_SIZE as u32,
        };
        unsafe { std::ptr::write_volatile(map.as_ptr() as *mut FileMagic, m) };
        std::sync::atomic::fence(Ordering::Release);
    }

    /// Validate the magic header of an attached mapping.
    pub fn validate(map: &MmapMut, file: &str) -> ShmResult<()> {
        let m = unsafe { &*(map.as_ptr() as *const FileMagic) };
        if m.magic != SHM_MAGIC {
            return Err(ShmError::Unsupported {
                file: file.to_string(),
                reason: "bad magic bytes".to_string(),
            });
        }
        if m.version != SHM_VERSION {
            return Err(ShmError::Unsupported {
                file: file.to_string(),
                reason: format!("layout version {} (expected {})", m.version, SHM_VERSION),
            });
        }
        if m.endian != SHM_ENDIAN {
            return Err(ShmError::Unsupported {
                file: file.to_string(),
                reason: "endianness mismatch".to_string(),
            });
        }
        if m.page_size != PAGE_SIZE as u32 {
            return Err(ShmError::Unsupported {
                file: file.to_string(),
                reason: format!("page size {} (expected {})", m.page_size, PAGE_SIZE),
            });
        }
        Ok(())
    }
}

/// FNV-1a hash of a string plus a numeric seed; the wire-stable hash used
/// for channel file names and oper-get topic keys.
pub fn str_hash(s: &str, seed: u32) -> u32 {
    let mut h: u32 = 0x811C_9DC5;
    for b in s.bytes() {
        h ^= b as u32;
        h = h.wrapping_mul(0x0100_0193);
    }
    for b in seed.to_le_bytes() {
        h ^= b as u32;
        h = h.wrapping_mul(0x0100_0193);
    }
    h
}

// ─── Layout offsets ─────────────────────────────────────────────────

const HEADER_OFF: usize = 64;
const CONN_OFF: usize = HEADER_OFF + std::mem::size_of::<MainHeader>();
const BUCKET_COUNT: usize = 64;
const BUCKETS_OFF: usize = CONN_OFF + CONN_SLOT_COUNT * std::mem::size_of::<ConnSlot>();
const BUMP_OFF: usize = (BUCKETS_OFF + BUCKET_COUNT * 4 + 63) & !63;

// ─── Headers and records ────────────────────────────────────────────

/// Global state of one daemon instance.
#[repr(C, align(64))]
pub struct MainHeader {
    /// Total file size, fixed at creation.
    shm_size: AtomicU64,
    /// Bumped whenever the module table changes; peers may use it to
    /// invalidate cached lookups.
    pub generation: AtomicU32,
    next_cid: AtomicU32,
    next_sid: AtomicU32,
    next_sub_id: AtomicU32,
    next_evpipe: AtomicU32,
    mod_count: AtomicU32,
    /// Bump cursor of the module record area.
    bump_cursor: AtomicU64,
    _pad: [u8; 24],
    /// Serializes module creation.
    mod_table_lock: ShmRwLock,
}

const_assert_eq!(std::mem::size_of::<MainHeader>(), 128);

/// One attached connection: its CID and the owning process.
#[repr(C)]
pub struct ConnSlot {
    cid: AtomicU32,
    pid: AtomicU32,
}

const_assert_eq!(std::mem::size_of::<ConnSlot>(), 8);

/// Per-module SHM record: identity, per-kind locks and the heads of the
/// ext-SHM subscriber arrays.
#[repr(C, align(64))]
pub struct ModuleShmRecord {
    /// Offset of the next record in the same hash bucket, 0 at the tail.
    next: AtomicU32,
    name_len: AtomicU32,
    name: [u8; MODULE_NAME_MAX],
    /// Wall-clock nanoseconds of the last configuration mutation.
    pub last_cfg_change: AtomicU64,
    /// Wall-clock nanoseconds of the last operational mutation.
    pub last_oper_change: AtomicU64,
    /// Earliest stored notification available for replay.
    pub replay_earliest: AtomicU64,
    /// Whether notification replay is kept for this module.
    pub replay_enabled: AtomicU32,
    _pad1: [u8; 28],
    /// Per-datastore change subscription locks.
    pub change_lock: [ShmRwLock; DATASTORE_COUNT],
    /// Operational get subscription lock.
    pub oper_get_lock: ShmRwLock,
    /// Operational poll subscription lock.
    pub oper_poll_lock: ShmRwLock,
    /// Notification subscription lock.
    pub notif_lock: ShmRwLock,
    /// RPC/action subscription lock (all operation paths of the module).
    pub rpc_lock: ShmRwLock,
    /// Per-datastore change subscriber arrays in ext SHM.
    pub change_subs: [ExtArray; DATASTORE_COUNT],
    /// Operational get subscriber array.
    pub oper_get_subs: ExtArray,
    /// Operational poll subscriber array.
    pub oper_poll_subs: ExtArray,
    /// Notification subscriber array.
    pub notif_subs: ExtArray,
    /// RPC/action operation groups, inline so their subscriber-array heads
    /// never move with ext-SHM growth.
    pub rpc_groups: [RpcGroupShm; RPC_GROUPS_PER_MODULE],
    _pad2: [u8; 44],
}

/// RPC/action operations one module can carry subscriptions for.
pub const RPC_GROUPS_PER_MODULE: usize = 8;

const_assert_eq!(std::mem::size_of::<ModuleShmRecord>(), 1024);

impl ModuleShmRecord {
    /// Module name.
    pub fn name(&self) -> &str {
        let len = self.name_len.load(Ordering::Acquire) as usize;
        std::str::from_utf8(&self.name[..len]).unwrap_or("")
    }

    /// The change lock of one datastore.
    #[inline]
    pub fn change_lock(&self, ds: ycommon::Datastore) -> &ShmRwLock {
        &self.change_lock[ds as usize]
    }

    /// The change subscriber array of one datastore.
    #[inline]
    pub fn change_subs(&self, ds: ycommon::Datastore) -> &ExtArray {
        &self.change_subs[ds as usize]
    }

    /// Find the RPC group of an operation path hash. The caller holds the
    /// module's RPC lock in any mode.
    pub fn rpc_group(&self, path_hash: u32) -> Option<&RpcGroupShm> {
        self.rpc_groups
            .iter()
            .find(|g| g.in_use() && g.path_hash.load(Ordering::Acquire) == path_hash)
    }

    /// Claim a free RPC group slot. The caller holds the RPC write lock.
    pub fn rpc_group_alloc(&self) -> Option<&RpcGroupShm> {
        self.rpc_groups.iter().find(|g| !g.in_use())
    }
}

// ─── Ext-SHM subscription records ───────────────────────────────────

/// Change subscriber as published in ext SHM.
#[repr(C)]
pub struct ChangeSubShm {
    /// Subscription ID.
    pub sub_id: AtomicU32,
    /// Owning connection.
    pub cid: AtomicU32,
    /// Event pipe the publisher wakes.
    pub evpipe_id: AtomicU32,
    /// Delivery priority, higher first.
    pub priority: AtomicU32,
    /// Subscription option flags.
    pub opts: AtomicU32,
    /// Skipped by the engine while set, retained in SHM.
    pub suspended: AtomicU32,
    /// XPath filter blob offset, 0 for whole-module interest.
    pub xpath_off: AtomicU32,
    /// XPath filter blob length.
    pub xpath_len: AtomicU32,
}

/// Operational get subscriber as published in ext SHM.
#[repr(C)]
pub struct OperGetSubShm {
    /// Subscription ID.
    pub sub_id: AtomicU32,
    /// Owning connection.
    pub cid: AtomicU32,
    /// Event pipe the publisher wakes.
    pub evpipe_id: AtomicU32,
    /// Delivery priority, higher first.
    pub priority: AtomicU32,
    /// Skipped by the engine while set.
    pub suspended: AtomicU32,
    /// Provided path blob offset.
    pub path_off: AtomicU32,
    /// Provided path blob length.
    pub path_len: AtomicU32,
    /// `str_hash(path, priority)`, the channel topic key.
    pub path_hash: AtomicU32,
}

/// Operational poll subscriber as published in ext SHM.
#[repr(C)]
pub struct OperPollSubShm {
    /// Subscription ID.
    pub sub_id: AtomicU32,
    /// Owning connection.
    pub cid: AtomicU32,
    /// Cache validity in milliseconds.
    pub valid_ms: AtomicU32,
    /// Subscription option flags.
    pub opts: AtomicU32,
    /// Skipped by the engine while set.
    pub suspended: AtomicU32,
    /// Polled path blob offset.
    pub path_off: AtomicU32,
    /// Polled path blob length.
    pub path_len: AtomicU32,
    /// Padding reserved for future use.
    pub _reserved: AtomicU32,
}

/// Notification subscriber as published in ext SHM.
#[repr(C)]
pub struct NotifSubShm {
    /// Subscription ID.
    pub sub_id: AtomicU32,
    /// Owning connection.
    pub cid: AtomicU32,
    /// Event pipe the publisher wakes.
    pub evpipe_id: AtomicU32,
    /// Skipped by the engine while set.
    pub suspended: AtomicU32,
}

/// RPC/action subscriber as published in ext SHM.
#[repr(C)]
pub struct RpcSubShm {
    /// Subscription ID.
    pub sub_id: AtomicU32,
    /// Owning connection.
    pub cid: AtomicU32,
    /// Event pipe the publisher wakes.
    pub evpipe_id: AtomicU32,
    /// Delivery priority, higher first.
    pub priority: AtomicU32,
    /// Skipped by the engine while set.
    pub suspended: AtomicU32,
    /// Subscriber XPath blob offset.
    pub xpath_off: AtomicU32,
    /// Subscriber XPath blob length.
    pub xpath_len: AtomicU32,
    /// Padding reserved for future use.
    pub _reserved: AtomicU32,
}

/// One RPC/action operation path of a module, with its subscriber array.
/// Lives inline in the module record; a zero `path_len` marks a free slot.
#[repr(C)]
pub struct RpcGroupShm {
    /// Operation path blob offset.
    pub path_off: AtomicU32,
    /// Operation path blob length, 0 for a free slot.
    pub path_len: AtomicU32,
    /// `str_hash(path, 0)`, the channel topic key.
    pub path_hash: AtomicU32,
    /// Whether the operation comes from a nested schema extension.
    pub is_ext: AtomicU32,
    /// Subscribers of this operation (of [`RpcSubShm`]).
    pub subs: ExtArray,
    _reserved: AtomicU32,
}

impl RpcGroupShm {
    /// Whether the slot carries an operation.
    #[inline]
    pub fn in_use(&self) -> bool {
        self.path_len.load(Ordering::Acquire) != 0
    }

    /// Release the slot. The caller holds the RPC write lock and has
    /// already freed the path blob and the subscriber array.
    pub fn clear(&self) {
        self.path_hash.store(0, Ordering::Release);
        self.path_off.store(0, Ordering::Release);
        self.is_ext.store(0, Ordering::Release);
        self.path_len.store(0, Ordering::Release);
    }
}

const_assert_eq!(std::mem::size_of::<ChangeSubShm>(), 32);
const_assert_eq!(std::mem::size_of::<OperGetSubShm>(), 32);
const_assert_eq!(std::mem::size_of::<OperPollSubShm>(), 32);
const_assert_eq!(std::mem::size_of::<NotifSubShm>(), 16);
const_assert_eq!(std::mem::size_of::<RpcSubShm>(), 32);
const_assert_eq!(std::mem::size_of::<RpcGroupShm>(), 32);

unsafe impl ExtRecord for ChangeSubShm {}
unsafe impl ExtRecord for OperGetSubShm {}
unsafe impl ExtRecord for OperPollSubShm {}
unsafe impl ExtRecord for NotifSubShm {}
unsafe impl ExtRecord for RpcSubShm {}

// ─── Main region ────────────────────────────────────────────────────

/// The main SHM region of one daemon instance.
pub struct MainShm {
    map: MmapMut,
    _file: File,
    lock_timeout: Duration,
}

impl MainShm {
    /// Create or attach the main region under `run_dir`, pre-sized for
    /// `max_modules` module records.
    pub fn open(run_dir: &Path, max_modules: usize, lock_timeout: Duration) -> ShmResult<Self> {
        std::fs::create_dir_all(run_dir)?;
        let _create_guard = platform::create_lock(run_dir)?;

        let path = run_dir.join(MAIN_SHM_FILE);
        let existed = path.exists() && std::fs::metadata(&path)?.len() > 0;

        let size = BUMP_OFF + max_modules * std::mem::size_of::<ModuleShmRecord>();
        let size = (size + PAGE_SIZE - 1) & !(PAGE_SIZE - 1);
        let (file, map) = platform::create_file_mmap(&path, size)?;

        let shm = Self {
            map,
            _file: file,
            lock_timeout,
        };

        if existed {
            magic::validate(&shm.map, MAIN_SHM_FILE)?;
        } else {
            magic::write(&shm.map);
            let h = shm.header();
            h.shm_size.store(size as u64, Ordering::Release);
            h.generation.store(0, Ordering::Release);
            h.next_cid.store(1, Ordering::Release);
            h.next_sid.store(1, Ordering::Release);
            h.next_sub_id.store(1, Ordering::Release);
            h.next_evpipe.store(1, Ordering::Release);
            h.mod_count.store(0, Ordering::Release);
            h.bump_cursor.store(BUMP_OFF as u64, Ordering::Release);
            h.mod_table_lock.init();
        }
        Ok(shm)
    }

    /// The global header.
    pub fn header(&self) -> &MainHeader {
        unsafe { &*(self.map.as_ptr().add(HEADER_OFF) as *const MainHeader) }
    }

    /// Allocate a host-unique connection ID.
    pub fn alloc_cid(&self) -> u32 {
        self.header().next_cid.fetch_add(1, Ordering::AcqRel)
    }

    /// Allocate a session ID.
    pub fn alloc_sid(&self) -> u32 {
        self.header().next_sid.fetch_add(1, Ordering::AcqRel)
    }

    /// Allocate a subscription ID.
    pub fn alloc_sub_id(&self) -> u32 {
        self.header().next_sub_id.fetch_add(1, Ordering::AcqRel)
    }

    /// Allocate an event pipe number.
    pub fn alloc_evpipe_id(&self) -> u32 {
        self.header().next_evpipe.fetch_add(1, Ordering::AcqRel)
    }

    /// View of the connection slot table.
    pub fn conn_slots(&self) -> ConnSlots<'_> {
        let slots = unsafe {
            std::slice::from_raw_parts(
                self.map.as_ptr().add(CONN_OFF) as *const ConnSlot,
                CONN_SLOT_COUNT,
            )
        };
        ConnSlots { slots }
    }

    fn buckets(&self) -> &[AtomicU32] {
        unsafe {
            std::slice::from_raw_parts(
                self.map.as_ptr().add(BUCKETS_OFF) as *const AtomicU32,
                BUCKET_COUNT,
            )
        }
    }

    fn record_at(&self, off: u32) -> &ModuleShmRecord {
        debug_assert!(off as usize >= BUMP_OFF);
        unsafe { &*(self.map.as_ptr().add(off as usize) as *const ModuleShmRecord) }
    }

    /// Look up a module record by name. Lock-free: records never move and
    /// bucket links are immutable once published.
    pub fn find_module(&self, name: &str) -> Option<&ModuleShmRecord> {
        let bucket = (str_hash(name, 0) as usize) % BUCKET_COUNT;
        let mut off = self.buckets()[bucket].load(Ordering::Acquire);
        while off != 0 {
            let rec = self.record_at(off);
            if rec.name() == name {
                return Some(rec);
            }
            off = rec.next.load(Ordering::Acquire);
        }
        None
    }

    /// Look up a module record, creating it on first use.
    pub fn find_or_create_module(
        &self,
        name: &str,
        cid: u32,
        live: &dyn CidLiveness,
    ) -> ShmResult<&ModuleShmRecord> {
        if name.is_empty() || name.len() > MODULE_NAME_MAX {
            return Err(ShmError::InvalidArg {
                what: format!("module name '{name}' must be 1..={MODULE_NAME_MAX} bytes"),
            });
        }
        if let Some(rec) = self.find_module(name) {
            return Ok(rec);
        }

        let header = self.header();
        let _guard = header.mod_table_lock.lock(
            LockMode::Write,
            self.lock_timeout,
            cid,
            LockClass::ModTable,
            live,
        )?;

        // Raced creation by a peer resolves to its record.
        if let Some(rec) = self.find_module(name) {
            return Ok(rec);
        }

        let rec_size = std::mem::size_of::<ModuleShmRecord>() as u64;
        let cursor = header.bump_cursor.load(Ordering::Acquire);
        if cursor + rec_size > self.map.len() as u64 {
            return Err(ShmError::NoMemory {
                what: "module table".to_string(),
            });
        }
        header.bump_cursor.store(cursor + rec_size, Ordering::Release);

        let rec = self.record_at(cursor as u32);
        // The bump area is fresh zeroes; only names and locks need init.
        unsafe {
            let name_dst = rec.name.as_ptr() as *mut u8;
            std::ptr::copy_nonoverlapping(name.as_ptr(), name_dst, name.len());
        }
        for ds_lock in &rec.change_lock {
            ds_lock.init();
        }
        rec.oper_get_lock.init();
        rec.oper_poll_lock.init();
        rec.notif_lock.init();
        rec.rpc_lock.init();
        rec.name_len.store(name.len() as u32, Ordering::Release);

        // Publish into the bucket chain, then bump the generation.
        let bucket = &self.buckets()[(str_hash(name, 0) as usize) % BUCKET_COUNT];
        rec.next.store(bucket.load(Ordering::Acquire), Ordering::Release);
        bucket.store(cursor as u32, Ordering::Release);
        header.mod_count.fetch_add(1, Ordering::AcqRel);
        header.generation.fetch_add(1, Ordering::AcqRel);

        tracing::debug!(module = name, "module record created");
        Ok(rec)
    }

    /// Number of registered modules.
    pub fn module_count(&self) -> u32 {
        self.header().mod_count.load(Ordering::Acquire)
    }

    /// Visit every module record.
    pub fn for_each_module(&self, mut f: impl FnMut(&ModuleShmRecord)) {
        for bucket in self.buckets() {
            let mut off = bucket.load(Ordering::Acquire);
            while off != 0 {
                let rec = self.record_at(off);
                f(rec);
                off = rec.next.load(Ordering::Acquire);
            }
        }
    }
}

// ─── Connection slots ───────────────────────────────────────────────

/// View of the main-SHM connection table; doubles as the CID liveness
/// probe handed to every lock acquisition.
pub struct ConnSlots<'a> {
    slots: &'a [ConnSlot],
}

impl ConnSlots<'_> {
    /// Register a connection, claiming a free slot.
    pub fn register(&self, cid: u32, pid: u32) -> ShmResult<()> {
        for slot in self.slots {
            if slot
                .cid
                .compare_exchange(0, cid, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                slot.pid.store(pid, Ordering::Release);
                return Ok(());
            }
        }
        Err(ShmError::NoMemory {
            what: "connection slots".to_string(),
        })
    }

    /// Release the slot of a detaching connection.
    pub fn unregister(&self, cid: u32) {
        for slot in self.slots {
            if slot.cid.load(Ordering::Acquire) == cid {
                slot.pid.store(0, Ordering::Release);
                slot.cid.store(0, Ordering::Release);
                return;
            }
        }
    }

    /// The process owning a connection, if it is still registered.
    pub fn pid_of(&self, cid: u32) -> Option<u32> {
        self.slots
            .iter()
            .find(|s| s.cid.load(Ordering::Acquire) == cid)
            .map(|s| s.pid.load(Ordering::Acquire))
    }

    /// Clear slots whose process died; returns how many were recovered.
    pub fn recover_dead(&self) -> usize {
        let mut recovered = 0;
        for slot in self.slots {
            let cid = slot.cid.load(Ordering::Acquire);
            if cid == 0 {
                continue;
            }
            let pid = slot.pid.load(Ordering::Acquire);
            if pid != 0 && !platform::is_process_alive(pid) {
                if slot
                    .cid
                    .compare_exchange(cid, 0, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    slot.pid.store(0, Ordering::Release);
                    tracing::warn!(cid, pid, "recovered dead connection slot");
                    recovered += 1;
                }
            }
        }
        recovered
    }

    /// Count of live registered connections.
    pub fn live_count(&self) -> usize {
        self.slots
            .iter()
            .filter(|s| s.cid.load(Ordering::Acquire) != 0)
            .count()
    }
}

impl CidLiveness for ConnSlots<'_> {
    fn is_alive(&self, cid: u32) -> bool {
        match self.pid_of(cid) {
            Some(pid) if pid != 0 => platform::is_process_alive(pid),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_main(dir: &tempfile::TempDir) -> MainShm {
        MainShm::open(dir.path(), 16, Duration::from_secs(1)).unwrap()
    }

    #[test]
    fn create_and_reattach() {
        let dir = tempfile::tempdir().unwrap();
        {
            let shm = open_main(&dir);
            assert_eq!(shm.alloc_cid(), 1);
            assert_eq!(shm.alloc_cid(), 2);
        }
        let shm2 = open_main(&dir);
        // Counters persist across attaches.
        assert_eq!(shm2.alloc_cid(), 3);
    }

    #[test]
    fn corrupt_magic_refuses_attach() {
        let dir = tempfile::tempdir().unwrap();
        {
            open_main(&dir);
        }
        let path = dir.path().join(MAIN_SHM_FILE);
        let data = std::fs::read(&path).unwrap();
        let mut bad = data;
        bad[0] = b'X';
        std::fs::write(&path, bad).unwrap();

        let res = MainShm::open(dir.path(), 16, Duration::from_secs(1));
        assert!(matches!(res, Err(ShmError::Unsupported { .. })));
    }

    #[test]
    fn module_create_find_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let shm = open_main(&dir);
        let conns = shm.conn_slots();

        assert!(shm.find_module("ietf-interfaces").is_none());
        let rec = shm
            .find_or_create_module("ietf-interfaces", 1, &conns)
            .unwrap();
        assert_eq!(rec.name(), "ietf-interfaces");
        assert_eq!(shm.module_count(), 1);

        // Second create resolves to the same record.
        let rec2 = shm
            .find_or_create_module("ietf-interfaces", 1, &conns)
            .unwrap();
        assert!(std::ptr::eq(rec, rec2));
        assert_eq!(shm.module_count(), 1);
    }

    #[test]
    fn many_modules_share_buckets() {
        let dir = tempfile::tempdir().unwrap();
        let shm = open_main(&dir);
        let conns = shm.conn_slots();

        let names: Vec<String> = (0..16).map(|i| format!("mod-{i}")).collect();
        for n in &names {
            shm.find_or_create_module(n, 1, &conns).unwrap();
        }
        for n in &names {
            assert_eq!(shm.find_module(n).unwrap().name(), n);
        }

        let mut seen = 0;
        shm.for_each_module(|_| seen += 1);
        assert_eq!(seen, 16);
    }

    #[test]
    fn module_table_capacity_is_bounded() {
        let dir = tempfile::tempdir().unwrap();
        let shm = MainShm::open(dir.path(), 2, Duration::from_secs(1)).unwrap();
        let conns = shm.conn_slots();

        shm.find_or_create_module("a", 1, &conns).unwrap();
        shm.find_or_create_module("b", 1, &conns).unwrap();
        let res = shm.find_or_create_module("c", 1, &conns);
        assert!(matches!(res, Err(ShmError::NoMemory { .. })));
    }

    #[test]
    fn conn_slots_register_and_probe() {
        let dir = tempfile::tempdir().unwrap();
        let shm = open_main(&dir);
        let conns = shm.conn_slots();

        let cid = shm.alloc_cid();
        conns.register(cid, platform::current_pid()).unwrap();
        assert!(conns.is_alive(cid));
        assert_eq!(conns.live_count(), 1);

        conns.unregister(cid);
        assert!(!conns.is_alive(cid));
        assert_eq!(conns.live_count(), 0);
    }

    #[test]
    fn dead_pid_slot_is_recovered() {
        let dir = tempfile::tempdir().unwrap();
        let shm = open_main(&dir);
        let conns = shm.conn_slots();

        let cid = shm.alloc_cid();
        conns.register(cid, 0x3FFF_FFFF).unwrap();
        assert!(!conns.is_alive(cid));
        assert_eq!(conns.recover_dead(), 1);
        assert_eq!(conns.live_count(), 0);
    }

    #[test]
    fn hash_is_stable() {
        // The hash keys channel file names; it must never change between
        // builds attached to the same instance.
        assert_eq!(str_hash("/m:ping", 0), str_hash("/m:ping", 0));
        assert_ne!(str_hash("/m:ping", 0), str_hash("/m:ping", 1));
        assert_ne!(str_hash("/m:ping", 0), str_hash("/m:pong", 0));
    }
}
