//! Per-topic event channels.
//!
//! Each topic maps to one file under the run directory named
//! `<module>.<kind>[.<hash>].sub`. The file starts with the magic header
//! and a channel header whose `event` atomic is the protocol state-machine
//! cell; one page in, the serialized payload follows, then the subscriber
//! reply slots.
//!
//! Writers hold the owning module-kind write lock while touching the
//! header; readers snapshot it under the read lock and append their reply
//! under the write lock. A publisher may only seed a new event once the
//! cell reads `None`, which serializes whole commits per topic.
//!
//! The first page is mapped once and never remapped; the data mapping
//! grows by powers of two when a payload outgrows it.

use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use memmap2::{MmapMut, MmapOptions};
use parking_lot::RwLock;
use static_assertions::const_assert_eq;
use ycommon::consts::{CHANNEL_INITIAL_SIZE, PAGE_SIZE};
use ycommon::EventKind;

use crate::error::{ShmError, ShmResult};
use crate::platform;
use crate::region::magic;

const HEADER_OFF: usize = 64;
const PAYLOAD_OFF: usize = PAGE_SIZE;

/// Sleep between publisher polls of the ack state.
const ACK_POLL_SLEEP: Duration = Duration::from_micros(300);

/// Channel header; the `event` cell drives the delivery state machine.
#[repr(C)]
pub struct ChannelHeader {
    /// Current event kind, [`EventKind::None`] when idle.
    pub event: AtomicU32,
    /// Monotonic identifier pairing events with their replies.
    pub request_id: AtomicU32,
    /// Priority of the wave currently in flight.
    pub priority: AtomicU32,
    /// First error code aggregated from the replies.
    pub error_code: AtomicU32,
    /// Serialized payload length.
    pub payload_len: AtomicU32,
    /// Connection that originated the event.
    pub orig_cid: AtomicU32,
    /// Session that originated the event.
    pub orig_sid: AtomicU32,
    /// Replies the publisher expects before the event is acknowledged.
    pub expected_replies: AtomicU32,
    /// Replies written so far.
    pub reply_count: AtomicU32,
    /// CID of the publisher owning the topic for a whole commit; all waves
    /// of one commit complete before another publisher may start.
    pub commit_cid: AtomicU32,
    /// Current file size, for lazy peer remaps.
    shm_size: AtomicU64,
    _pad: [u8; 16],
}

const_assert_eq!(std::mem::size_of::<ChannelHeader>(), 64);

#[repr(C)]
struct ReplyHeader {
    sub_id: u32,
    err_code: u32,
    msg_len: u32,
    data_len: u32,
}

const_assert_eq!(std::mem::size_of::<ReplyHeader>(), 16);

/// One subscriber reply copied out of a channel.
#[derive(Debug, Clone)]
pub struct Reply {
    /// Replying subscription.
    pub sub_id: u32,
    /// Raw error code, `0` on success.
    pub code: u32,
    /// Error message, empty on success.
    pub message: String,
    /// Reply data: an oper-get tree, an RPC output or an updated diff.
    pub data: Vec<u8>,
}

/// File name of a channel topic.
pub fn channel_file_name(module: &str, kind: &str, hash: Option<u32>) -> String {
    match hash {
        Some(h) => format!("{module}.{kind}.{h:08x}.sub"),
        None => format!("{module}.{kind}.sub"),
    }
}

/// A mapped event channel.
pub struct Channel {
    head: MmapMut,
    data: RwLock<MmapMut>,
    file: File,
    name: String,
    path: PathBuf,
}

impl Channel {
    /// Create or attach the channel for one topic. Creation must happen
    /// under the owning module-kind write lock so attachers never observe
    /// a half-initialized file.
    pub fn open(run_dir: &Path, module: &str, kind: &str, hash: Option<u32>) -> ShmResult<Self> {
        let name = channel_file_name(module, kind, hash);
        let path = run_dir.join(&name);
        let existed = path.exists() && std::fs::metadata(&path)?.len() > 0;

        let (file, data_map) = platform::create_file_mmap(&path, CHANNEL_INITIAL_SIZE)?;
        let head = unsafe { MmapOptions::new().len(PAGE_SIZE).map_mut(&file)? };

        let ch = Self {
            head,
            data: RwLock::new(data_map),
            file,
            name,
            path,
        };

        if existed {
            magic::validate(&ch.head, &ch.name)?;
        } else {
            magic::write(&ch.head);
            let h = ch.header();
            h.event.store(EventKind::None as u32, Ordering::Release);
            h.shm_size.store(CHANNEL_INITIAL_SIZE as u64, Ordering::Release);
        }
        Ok(ch)
    }

    /// Channel file name, for diagnostics.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Remove the backing file. Called when the last subscription of the
    /// topic goes away.
    pub fn unlink(&self) {
        let _ = std::fs::remove_file(&self.path);
    }

    /// Whether this mapping still backs the file currently on disk. False
    /// once the topic was unlinked (and possibly recreated by a newer
    /// subscriber); cached handles must reopen then.
    pub fn is_current(&self) -> bool {
        use std::os::unix::fs::MetadataExt;
        match (self.file.metadata(), std::fs::metadata(&self.path)) {
            (Ok(ours), Ok(on_disk)) => ours.ino() == on_disk.ino() && ours.dev() == on_disk.dev(),
            _ => false,
        }
    }

    /// The channel header.
    pub fn header(&self) -> &ChannelHeader {
        unsafe { &*(self.head.as_ptr().add(HEADER_OFF) as *const ChannelHeader) }
    }

    /// Current event kind, failing on out-of-range cell values.
    pub fn event(&self) -> ShmResult<EventKind> {
        let raw = self.header().event.load(Ordering::Acquire);
        EventKind::from_u32(raw).ok_or_else(|| ShmError::Corrupted {
            channel: self.name.clone(),
            value: raw,
        })
    }

    fn sync_map(&self) {
        let size = self.header().shm_size.load(Ordering::Acquire) as usize;
        if self.data.read().len() < size {
            let mut map = self.data.write();
            if map.len() < size {
                match platform::remap_file(&self.file) {
                    Ok(new_map) => *map = new_map,
                    Err(e) => tracing::warn!(channel = %self.name, "channel remap failed: {e}"),
                }
            }
        }
    }

    fn ensure_capacity(&self, required: usize) -> ShmResult<()> {
        let header = self.header();
        let size = header.shm_size.load(Ordering::Acquire) as usize;
        if required <= size {
            self.sync_map();
            return Ok(());
        }
        let new_size = platform::next_pow2(required, size * 2);
        self.file.set_len(new_size as u64)?;
        {
            let mut map = self.data.write();
            *map = platform::remap_file(&self.file)?;
        }
        header.shm_size.store(new_size as u64, Ordering::Release);
        tracing::debug!(channel = %self.name, new_size, "channel grown");
        Ok(())
    }

    /// Seed a new event. The caller holds the module-kind write lock and
    /// has verified the channel is idle (or deliberately overwrites a
    /// stale event it has flagged ignored).
    #[allow(clippy::too_many_arguments)]
    pub fn write_event(
        &self,
        kind: EventKind,
        request_id: u32,
        priority: u32,
        orig_cid: u32,
        orig_sid: u32,
        payload: &[u8],
        expected_replies: u32,
    ) -> ShmResult<()> {
        self.ensure_capacity(PAYLOAD_OFF + payload.len() + PAGE_SIZE)?;
        {
            let map = self.data.read();
            unsafe {
                std::ptr::copy_nonoverlapping(
                    payload.as_ptr(),
                    map.as_ptr().add(PAYLOAD_OFF) as *mut u8,
                    payload.len(),
                );
            }
        }
        let h = self.header();
        h.payload_len.store(payload.len() as u32, Ordering::Release);
        h.request_id.store(request_id, Ordering::Release);
        h.priority.store(priority, Ordering::Release);
        h.orig_cid.store(orig_cid, Ordering::Release);
        h.orig_sid.store(orig_sid, Ordering::Release);
        h.error_code.store(0, Ordering::Release);
        h.reply_count.store(0, Ordering::Release);
        h.expected_replies.store(expected_replies, Ordering::Release);
        // The event cell is stored last; its release publishes the rest.
        h.event.store(kind as u32, Ordering::Release);
        Ok(())
    }

    /// Snapshot the current event. The caller holds the kind read lock.
    pub fn read_event(&self) -> ShmResult<(EventKind, u32, u32, Vec<u8>)> {
        let kind = self.event()?;
        let h = self.header();
        let request_id = h.request_id.load(Ordering::Acquire);
        let priority = h.priority.load(Ordering::Acquire);
        let len = h.payload_len.load(Ordering::Acquire) as usize;
        self.sync_map();
        let map = self.data.read();
        let payload = map[PAYLOAD_OFF..PAYLOAD_OFF + len].to_vec();
        Ok((kind, request_id, priority, payload))
    }

    /// Originator of the current event as `(cid, sid)`.
    pub fn originator(&self) -> (u32, u32) {
        let h = self.header();
        (
            h.orig_cid.load(Ordering::Acquire),
            h.orig_sid.load(Ordering::Acquire),
        )
    }

    // Byte offset just past the last written reply record.
    fn replies_end(&self, map: &MmapMut, count: u32) -> usize {
        let payload_len = self.header().payload_len.load(Ordering::Acquire) as usize;
        let mut off = (PAYLOAD_OFF + payload_len + 7) & !7;
        for _ in 0..count {
            let rh = unsafe { &*(map.as_ptr().add(off) as *const ReplyHeader) };
            off = (off + std::mem::size_of::<ReplyHeader>()
                + rh.msg_len as usize
                + rh.data_len as usize
                + 7)
                & !7;
        }
        off
    }

    /// Append a subscriber reply. The caller holds the kind write lock.
    ///
    /// The reply is dropped (returning `false`) when the event in the
    /// channel no longer matches `for_event`/`for_request`; a late reply
    /// to a reused channel must not corrupt the next exchange. The reply
    /// that completes the expected set acknowledges the event by resetting
    /// the cell to `None`.
    pub fn write_reply(
        &self,
        for_event: EventKind,
        for_request: u32,
        sub_id: u32,
        code: u32,
        message: &str,
        data: &[u8],
    ) -> ShmResult<bool> {
        let h = self.header();
        if self.event()? != for_event || h.request_id.load(Ordering::Acquire) != for_request {
            return Ok(false);
        }

        let count = h.reply_count.load(Ordering::Acquire);
        let end = {
            self.sync_map();
            let map = self.data.read();
            self.replies_end(&map, count)
        };
        let record_len =
            (std::mem::size_of::<ReplyHeader>() + message.len() + data.len() + 7) & !7;
        self.ensure_capacity(end + record_len)?;

        {
            let map = self.data.read();
            let base = unsafe { map.as_ptr().add(end) as *mut u8 };
            let rh = ReplyHeader {
                sub_id,
                err_code: code,
                msg_len: message.len() as u32,
                data_len: data.len() as u32,
            };
            unsafe {
                std::ptr::write(base as *mut ReplyHeader, rh);
                let mut cursor = base.add(std::mem::size_of::<ReplyHeader>());
                std::ptr::copy_nonoverlapping(message.as_ptr(), cursor, message.len());
                cursor = cursor.add(message.len());
                std::ptr::copy_nonoverlapping(data.as_ptr(), cursor, data.len());
            }
        }

        if code != 0 && h.error_code.load(Ordering::Acquire) == 0 {
            h.error_code.store(code, Ordering::Release);
        }

        let new_count = count + 1;
        h.reply_count.store(new_count, Ordering::Release);
        if new_count >= h.expected_replies.load(Ordering::Acquire) {
            h.event.store(EventKind::None as u32, Ordering::Release);
        }
        Ok(true)
    }

    /// Copy all replies of the current exchange out. The caller holds the
    /// kind read lock.
    pub fn read_replies(&self) -> ShmResult<Vec<Reply>> {
        let h = self.header();
        let count = h.reply_count.load(Ordering::Acquire);
        self.sync_map();
        let map = self.data.read();

        let payload_len = h.payload_len.load(Ordering::Acquire) as usize;
        let mut off = (PAYLOAD_OFF + payload_len + 7) & !7;
        let mut replies = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let rh = unsafe { &*(map.as_ptr().add(off) as *const ReplyHeader) };
            let msg_start = off + std::mem::size_of::<ReplyHeader>();
            let data_start = msg_start + rh.msg_len as usize;
            replies.push(Reply {
                sub_id: rh.sub_id,
                code: rh.err_code,
                message: String::from_utf8_lossy(&map[msg_start..data_start]).into_owned(),
                data: map[data_start..data_start + rh.data_len as usize].to_vec(),
            });
            off = (data_start + rh.data_len as usize + 7) & !7;
        }
        Ok(replies)
    }

    /// Wait until the event with `request_id` is fully acknowledged (the
    /// cell returned to `None`). Returns `false` on timeout.
    pub fn wait_acked(&self, request_id: u32, timeout: Duration) -> ShmResult<bool> {
        let deadline = Instant::now() + timeout;
        loop {
            let h = self.header();
            if self.event()? == EventKind::None
                && h.request_id.load(Ordering::Acquire) == request_id
            {
                return Ok(true);
            }
            if Instant::now() >= deadline {
                return Ok(false);
            }
            std::thread::sleep(ACK_POLL_SLEEP);
        }
    }

    /// Claim the topic for a whole commit. Blocks until the previous
    /// commit releases its claim or its owner is found dead; a dead
    /// owner's in-flight event is flagged ignored on takeover.
    pub fn claim_commit(
        &self,
        cid: u32,
        timeout: Duration,
        live: &dyn crate::rwlock::CidLiveness,
    ) -> ShmResult<()> {
        let deadline = Instant::now() + timeout;
        let h = self.header();
        loop {
            match h
                .commit_cid
                .compare_exchange(0, cid, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return Ok(()),
                Err(holder) => {
                    if !live.is_alive(holder) {
                        if h.commit_cid
                            .compare_exchange(
                                holder,
                                cid,
                                Ordering::AcqRel,
                                Ordering::Acquire,
                            )
                            .is_ok()
                        {
                            tracing::warn!(
                                channel = %self.name,
                                cid = holder,
                                "took over commit claim of dead publisher"
                            );
                            self.clear_stale();
                            return Ok(());
                        }
                    }
                }
            }
            if Instant::now() >= deadline {
                return Err(ShmError::TimedOut {
                    what: "commit claim",
                    ms: timeout.as_millis() as u64,
                });
            }
            std::thread::sleep(ACK_POLL_SLEEP);
        }
    }

    /// Release the commit claim taken with [`Self::claim_commit`].
    pub fn release_commit(&self, cid: u32) {
        let _ = self.header().commit_cid.compare_exchange(
            cid,
            0,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }

    /// Flag a stale in-flight event ignored and reset the channel to idle.
    /// Used before topic reuse when a previous exchange never completed.
    pub fn clear_stale(&self) {
        let h = self.header();
        let prev = h.event.swap(EventKind::None as u32, Ordering::AcqRel);
        if prev != EventKind::None as u32 {
            tracing::warn!(
                channel = %self.name,
                event = prev,
                request_id = h.request_id.load(Ordering::Acquire),
                "stale event ignored"
            );
        }
    }
}
