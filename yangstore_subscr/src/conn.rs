//! Connections and sessions.
//!
//! A [`Connection`] is one attachment to the shared-memory instance: it
//! owns a host-unique CID registered in the main-SHM connection table,
//! caches for publisher-side channels and event pipes, and the per-poll
//! operational data cache. A [`Session`] is a scoped handle on a
//! connection carrying a datastore selector, a staged edit and the
//! accumulated error info.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant, SystemTime};

use parking_lot::Mutex;
use ycommon::{Datastore, ErrorInfo, ShmConfig};
use yangstore_shm::{platform, Channel, ConnSlots, EventPipe, ExtShm, MainShm};

use crate::context::SubscriptionContext;
use crate::error::SubscrResult;

/// Cached operational data of one poll subscription.
pub(crate) struct OperCacheEntry {
    /// Serialized tree fetched on the last poll.
    pub data: Vec<u8>,
    /// When the data was fetched.
    pub fetched_at: Instant,
    /// How long the entry stays valid.
    pub valid_for: Duration,
}

impl OperCacheEntry {
    /// Whether the cached data is still usable.
    pub fn is_fresh(&self) -> bool {
        self.fetched_at.elapsed() <= self.valid_for
    }
}

/// One endpoint attached to the shared-memory instance.
pub struct Connection {
    cfg: ShmConfig,
    main: MainShm,
    ext: ExtShm,
    cid: u32,
    /// Publisher-side channel cache, keyed by channel file name.
    channels: Mutex<HashMap<String, Arc<Channel>>>,
    /// Publisher-side event pipe cache, keyed by pipe number.
    evpipes: Mutex<HashMap<u32, Arc<EventPipe>>>,
    /// Operational data cache of poll subscriptions, keyed by sub ID.
    oper_cache: Mutex<HashMap<u32, OperCacheEntry>>,
}

impl Connection {
    /// Attach to the instance under the configured run directory, creating
    /// the regions on first attach.
    pub fn attach(cfg: ShmConfig) -> SubscrResult<Arc<Self>> {
        let main = MainShm::open(&cfg.run_dir, cfg.max_modules, cfg.shm_lock_timeout())?;
        let ext = ExtShm::open(&cfg.run_dir, cfg.shm_lock_timeout())?;

        // Detach of a crashed peer happens here, on the next attach.
        main.conn_slots().recover_dead();

        let cid = main.alloc_cid();
        main.conn_slots().register(cid, platform::current_pid())?;
        tracing::debug!(cid, "connection attached");

        Ok(Arc::new(Self {
            cfg,
            main,
            ext,
            cid,
            channels: Mutex::new(HashMap::new()),
            evpipes: Mutex::new(HashMap::new()),
            oper_cache: Mutex::new(HashMap::new()),
        }))
    }

    /// This connection's host-unique ID.
    #[inline]
    pub fn cid(&self) -> u32 {
        self.cid
    }

    /// The shared-memory configuration this connection attached with.
    #[inline]
    pub fn config(&self) -> &ShmConfig {
        &self.cfg
    }

    /// Run directory of the instance.
    #[inline]
    pub fn run_dir(&self) -> &PathBuf {
        &self.cfg.run_dir
    }

    pub(crate) fn main(&self) -> &MainShm {
        &self.main
    }

    pub(crate) fn ext(&self) -> &ExtShm {
        &self.ext
    }

    /// Liveness view over the connection table.
    pub fn slots(&self) -> ConnSlots<'_> {
        self.main.conn_slots()
    }

    /// Start a session operating on `ds`.
    pub fn session(self: &Arc<Self>, ds: Datastore) -> Session {
        Session {
            conn: Arc::clone(self),
            sid: self.main.alloc_sid(),
            ds: AtomicU32::new(ds as u32),
            errors: Mutex::new(ErrorInfo::new()),
            staged: Mutex::new(None),
            cancel: Arc::new(AtomicBool::new(false)),
            subscriptions: Mutex::new(Vec::new()),
        }
    }

    /// Publisher-side channel lookup, opening and caching on first use.
    pub(crate) fn channel(
        &self,
        module: &str,
        kind: &str,
        hash: Option<u32>,
    ) -> SubscrResult<Arc<Channel>> {
        let name = yangstore_shm::channel_file_name(module, kind, hash);
        let mut channels = self.channels.lock();
        if let Some(ch) = channels.get(&name) {
            if ch.is_current() {
                return Ok(Arc::clone(ch));
            }
            // The topic was unlinked and recreated; the mapping is stale.
            channels.remove(&name);
        }
        let ch = Arc::new(Channel::open(&self.cfg.run_dir, module, kind, hash)?);
        channels.insert(name, Arc::clone(&ch));
        Ok(ch)
    }

    /// Forget a cached channel whose topic went away.
    pub(crate) fn forget_channel(&self, name: &str) {
        self.channels.lock().remove(name);
    }

    /// Publisher-side event pipe lookup by number.
    pub(crate) fn evpipe(&self, id: u32) -> Option<Arc<EventPipe>> {
        let mut evpipes = self.evpipes.lock();
        if let Some(p) = evpipes.get(&id) {
            return Some(Arc::clone(p));
        }
        match EventPipe::open(&self.cfg.run_dir, id) {
            Ok(p) => {
                let p = Arc::new(p);
                evpipes.insert(id, Arc::clone(&p));
                Some(p)
            }
            Err(e) => {
                tracing::warn!(pipe = id, "event pipe open failed: {e}");
                None
            }
        }
    }

    pub(crate) fn oper_cache_put(&self, sub_id: u32, entry: OperCacheEntry) {
        self.oper_cache.lock().insert(sub_id, entry);
    }

    pub(crate) fn oper_cache_get(&self, sub_id: u32) -> Option<Vec<u8>> {
        let cache = self.oper_cache.lock();
        cache.get(&sub_id).filter(|e| e.is_fresh()).map(|e| e.data.clone())
    }

    /// Drop the cached operational data of one poll subscription.
    pub(crate) fn oper_cache_del(&self, sub_id: u32) {
        self.oper_cache.lock().remove(&sub_id);
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.main.conn_slots().unregister(self.cid);
        tracing::debug!(cid = self.cid, "connection detached");
    }
}

/// A scoped handle on a connection: datastore selector, staged edit,
/// originated subscriptions and accumulated errors.
pub struct Session {
    conn: Arc<Connection>,
    sid: u32,
    ds: AtomicU32,
    errors: Mutex<ErrorInfo>,
    staged: Mutex<Option<StagedEdit>>,
    cancel: Arc<AtomicBool>,
    subscriptions: Mutex<Vec<Weak<SubscriptionContext>>>,
}

/// An edit accumulated on a session before `apply_changes`.
pub(crate) struct StagedEdit {
    pub path: String,
    pub diff: Vec<u8>,
}

impl Session {
    /// Session ID.
    #[inline]
    pub fn sid(&self) -> u32 {
        self.sid
    }

    /// The owning connection.
    #[inline]
    pub fn connection(&self) -> &Arc<Connection> {
        &self.conn
    }

    /// Currently selected datastore.
    pub fn datastore(&self) -> Datastore {
        Datastore::from_u8(self.ds.load(Ordering::Acquire) as u8).unwrap_or(Datastore::Running)
    }

    /// Switch the session to another datastore.
    pub fn switch_datastore(&self, ds: Datastore) {
        self.ds.store(ds as u32, Ordering::Release);
    }

    /// Stage an edit for the next `apply_changes` call. A later stage on
    /// the same path replaces the staged diff; a different path merges by
    /// keeping the shallower common ancestor path.
    pub fn stage_edit(&self, path: &str, diff: &[u8]) {
        let mut staged = self.staged.lock();
        match staged.as_mut() {
            Some(edit) if edit.path == path => {
                edit.diff = diff.to_vec();
            }
            Some(edit) => {
                edit.path = common_ancestor(&edit.path, path);
                edit.diff.extend_from_slice(diff);
            }
            None => {
                *staged = Some(StagedEdit {
                    path: path.to_string(),
                    diff: diff.to_vec(),
                });
            }
        }
    }

    /// Discard the staged edit.
    pub fn discard_changes(&self) {
        self.staged.lock().take();
    }

    pub(crate) fn take_staged(&self) -> Option<StagedEdit> {
        self.staged.lock().take()
    }

    /// Apply the staged edit to `module` in the selected datastore,
    /// driving the change protocol over its subscribers.
    pub fn apply_changes(&self, module: &str) -> SubscrResult<()> {
        let staged = self.take_staged().ok_or_else(|| {
            crate::error::SubscrError::InvalArg("no changes staged on the session".to_string())
        })?;
        crate::engine::apply_changes(self, module, &staged.path, &staged.diff)
    }

    /// Accumulated error info of the last failed operation.
    pub fn errors(&self) -> ErrorInfo {
        self.errors.lock().clone()
    }

    pub(crate) fn set_errors(&self, info: ErrorInfo) {
        *self.errors.lock() = info;
    }

    /// Timestamp helper for notification sends.
    pub fn now(&self) -> SystemTime {
        SystemTime::now()
    }

    /// Request cancellation of the operation currently driven by this
    /// session. The engine finishes the wave in flight, unwinds with
    /// `Abort` to the waves already delivered and returns.
    pub fn cancel(&self) {
        self.cancel.store(true, Ordering::Release);
    }

    /// Re-arm the session after a cancelled operation.
    pub fn reset_cancel(&self) {
        self.cancel.store(false, Ordering::Release);
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        self.cancel.load(Ordering::Acquire)
    }

    pub(crate) fn attach_subscription(&self, ctx: &Arc<SubscriptionContext>) {
        let mut subs = self.subscriptions.lock();
        if !subs.iter().any(|w| w.ptr_eq(&Arc::downgrade(ctx))) {
            subs.push(Arc::downgrade(ctx));
        }
    }

    pub(crate) fn detach_subscription(&self, ctx: &SubscriptionContext) {
        self.subscriptions
            .lock()
            .retain(|w| match w.upgrade() {
                Some(c) => !std::ptr::eq(Arc::as_ptr(&c), ctx as *const _),
                None => false,
            });
    }

    /// Subscription contexts this session originated subscriptions in.
    pub fn subscription_contexts(&self) -> Vec<Arc<SubscriptionContext>> {
        self.subscriptions
            .lock()
            .iter()
            .filter_map(|w| w.upgrade())
            .collect()
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        // Session teardown removes every subscription it originated.
        for ctx in self.subscription_contexts() {
            if let Err(e) = ctx.unsubscribe_session(self.sid) {
                tracing::warn!(sid = self.sid, "session teardown: {e}");
            }
        }
    }
}

fn common_ancestor(a: &str, b: &str) -> String {
    let mut end = 0;
    for (i, (ca, cb)) in a.bytes().zip(b.bytes()).enumerate() {
        if ca != cb {
            break;
        }
        if ca == b'/' {
            end = i;
        }
        if i + 1 == a.len().min(b.len()) {
            end = i + 1;
        }
    }
    a[..end].to_string()
}
