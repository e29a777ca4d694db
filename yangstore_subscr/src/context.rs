//! The subscription context: the public API an application subscribes
//! through, and the dispatcher that runs its callbacks.
//!
//! A context groups the subscriptions sharing one event pipe. Unless the
//! `NO_THREAD` option is given, the first subscription starts a listener
//! thread that blocks on the pipe and processes events; applications with
//! their own event loop read [`SubscriptionContext::event_pipe_fd`] and
//! call [`SubscriptionContext::process_events`] themselves.
//!
//! Registry and shared memory are transitioned together: the registry is
//! updated first and rolled back when publishing the SHM record fails, so
//! a subscription is visible to publishers exactly when it can be served.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;
use std::time::{Duration, Instant, SystemTime};

use parking_lot::{Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};
use ycommon::{Datastore, ErrorCode, ErrorInfo, ErrorItem, EventKind, NotifKind, SubscrOptions};
use yangstore_shm::{str_hash, Channel, EventPipe};

use crate::conn::{Connection, OperCacheEntry, Session};
use crate::engine::{decode_change, decode_notif};
use crate::error::{SubscrError, SubscrResult};
use crate::registry::{Registry, SubKind, SubTrack};
use crate::shm_index;
use crate::types::{
    xpath_covers, ChangeCallback, ChangeEvent, NotifCallback, NotifEvent, OperGetCallback,
    OperGetEvent, RpcCallback, RpcEvent,
};

/// Sleep of a suspended handler thread between wake checks.
const THREAD_SUSPEND_SLEEP: Duration = Duration::from_millis(50);

/// Pipe wait of the handler thread per loop iteration.
const THREAD_WAIT_SLICE: Duration = Duration::from_millis(200);

/// Process-local grouping of subscriptions sharing one event pipe.
pub struct SubscriptionContext {
    conn: Arc<Connection>,
    evpipe: Arc<EventPipe>,
    registry: RwLock<Registry>,
    thread: Mutex<Option<JoinHandle<()>>>,
    stop: Arc<AtomicBool>,
    thread_suspended: Arc<AtomicBool>,
}

impl SubscriptionContext {
    /// Create an empty context on `conn`, allocating its event pipe.
    pub fn new(conn: &Arc<Connection>) -> SubscrResult<Arc<Self>> {
        let evpipe_id = conn.main().alloc_evpipe_id();
        let evpipe = Arc::new(EventPipe::create(conn.run_dir(), evpipe_id)?);
        Ok(Arc::new(Self {
            conn: Arc::clone(conn),
            evpipe,
            registry: RwLock::new(Registry::new()),
            thread: Mutex::new(None),
            stop: Arc::new(AtomicBool::new(false)),
            thread_suspended: Arc::new(AtomicBool::new(false)),
        }))
    }

    /// The owning connection.
    #[inline]
    pub fn connection(&self) -> &Arc<Connection> {
        &self.conn
    }

    /// Raw descriptor of the context's event pipe, for integration with an
    /// external event loop.
    pub fn event_pipe_fd(&self) -> i32 {
        self.evpipe.as_raw_fd()
    }

    /// Highest subscription ID ever created in this context.
    pub fn last_sub_id(&self) -> u32 {
        self.registry.read().last_sub_id
    }

    /// Number of subscriptions originated by a session in this context.
    pub fn session_sub_count(&self, sess: &Session) -> usize {
        self.registry.read().count_for_session(sess.sid())
    }

    fn write_reg(&self) -> SubscrResult<RwLockWriteGuard<'_, Registry>> {
        self.registry
            .try_write_for(self.conn.config().subs_lock_timeout())
            .ok_or_else(|| SubscrError::Locked("subscription registry".to_string()))
    }

    fn read_reg(&self) -> SubscrResult<RwLockReadGuard<'_, Registry>> {
        self.registry
            .try_read_for(self.conn.config().subs_lock_timeout())
            .ok_or_else(|| SubscrError::Locked("subscription registry".to_string()))
    }

    fn check_session(&self, sess: &Session) -> SubscrResult<()> {
        if !Arc::ptr_eq(sess.connection(), &self.conn) {
            return Err(SubscrError::InvalArg(
                "session belongs to another connection".to_string(),
            ));
        }
        Ok(())
    }

    // ─── subscribe ──────────────────────────────────────────────────

    /// Subscribe to configuration changes of `module` in the session's
    /// datastore. Returns the subscription ID.
    pub fn subscribe_change<F>(
        self: &Arc<Self>,
        sess: &Session,
        module: &str,
        xpath: Option<&str>,
        priority: u32,
        opts: SubscrOptions,
        cb: F,
    ) -> SubscrResult<u32>
    where
        F: Fn(&ChangeEvent<'_>) -> Result<Option<Vec<u8>>, ErrorItem> + Send + Sync + 'static,
    {
        self.check_session(sess)?;
        if module.is_empty() {
            return Err(SubscrError::InvalArg("empty module name".to_string()));
        }
        let ds = sess.datastore();
        let sub_id = self.conn.main().alloc_sub_id();
        let cb: ChangeCallback = Arc::new(cb);

        {
            let mut reg = self.write_reg()?;
            let channel = match reg.change_group_channel(module, ds) {
                Some(ch) => ch,
                None => self.conn.channel(module, ds.as_str(), None)?,
            };
            reg.add_change(
                sub_id,
                sess.sid(),
                module,
                ds,
                xpath,
                priority,
                opts,
                Arc::clone(&cb),
                channel,
            );
            if let Err(e) = shm_index::change_add(
                &self.conn,
                module,
                ds,
                sub_id,
                self.evpipe.id(),
                priority,
                opts,
                xpath,
            ) {
                reg.del_change(sub_id);
                return Err(e);
            }
        }

        if opts.contains(SubscrOptions::ENABLED) {
            if let Err(item) = self.deliver_enabled(&cb, sub_id, module, xpath) {
                let _ = self.unsubscribe(sub_id);
                let info = ErrorInfo::from(item);
                return Err(SubscrError::Callback(info));
            }
        }

        sess.attach_subscription(self);
        self.ensure_thread(opts)?;
        Ok(sub_id)
    }

    // Enabled events run synchronously inside the subscribe call, in the
    // subscriber's own thread; a channel round-trip would deadlock it.
    fn deliver_enabled(
        &self,
        cb: &ChangeCallback,
        sub_id: u32,
        module: &str,
        xpath: Option<&str>,
    ) -> Result<(), ErrorItem> {
        let ev = ChangeEvent {
            sub_id,
            module,
            xpath,
            event: EventKind::Enabled,
            request_id: 0,
            path: xpath.unwrap_or(""),
            diff: &[],
            orig_cid: self.conn.cid(),
            orig_sid: 0,
        };
        match (cb)(&ev) {
            Ok(_) => {}
            Err(item) if item.is_shelve() => {
                // Shelving is not permitted for the enabled event.
                return Err(ErrorItem::new(
                    ErrorCode::InvalArg,
                    "enabled event cannot be shelved",
                ));
            }
            Err(item) => return Err(item),
        }
        let done = ChangeEvent {
            event: EventKind::Done,
            ..ev
        };
        if let Err(item) = (cb)(&done) {
            tracing::warn!(sub_id, "done after enabled failed: {}", item.message);
        }
        Ok(())
    }

    /// Subscribe as the operational data provider of `path` in `module`.
    pub fn subscribe_oper_get<F>(
        self: &Arc<Self>,
        sess: &Session,
        module: &str,
        path: &str,
        priority: u32,
        cb: F,
    ) -> SubscrResult<u32>
    where
        F: Fn(&OperGetEvent<'_>) -> Result<Vec<u8>, ErrorItem> + Send + Sync + 'static,
    {
        self.check_session(sess)?;
        if module.is_empty() || path.is_empty() {
            return Err(SubscrError::InvalArg("empty module or path".to_string()));
        }
        let sub_id = self.conn.main().alloc_sub_id();
        let cb: OperGetCallback = Arc::new(cb);

        {
            let mut reg = self.write_reg()?;
            if reg.oper_get_topic_taken(module, path, priority) {
                return Err(SubscrError::Exists(format!(
                    "operational get provider for '{path}' at priority {priority}"
                )));
            }
            let channel = self
                .conn
                .channel(module, "oper", Some(str_hash(path, priority)))?;
            reg.add_oper_get(
                sub_id,
                sess.sid(),
                module,
                path,
                priority,
                Arc::clone(&cb),
                channel,
            );
            if let Err(e) = shm_index::oper_get_add(
                &self.conn,
                module,
                path,
                sub_id,
                self.evpipe.id(),
                priority,
            ) {
                reg.del_oper_get(sub_id);
                return Err(e);
            }
        }

        sess.attach_subscription(self);
        self.ensure_thread(SubscrOptions::DEFAULT)?;
        Ok(sub_id)
    }

    /// Subscribe to periodic polling of operational data at `path`. The
    /// fetched tree is cached on the connection for `valid_ms`.
    pub fn subscribe_oper_poll(
        self: &Arc<Self>,
        sess: &Session,
        module: &str,
        path: &str,
        valid_ms: u32,
        opts: SubscrOptions,
    ) -> SubscrResult<u32> {
        self.check_session(sess)?;
        if module.is_empty() || path.is_empty() || valid_ms == 0 {
            return Err(SubscrError::InvalArg(
                "empty module/path or zero validity".to_string(),
            ));
        }
        let sub_id = self.conn.main().alloc_sub_id();

        {
            let mut reg = self.write_reg()?;
            reg.add_oper_poll(sub_id, sess.sid(), module, path, valid_ms, opts);
            if let Err(e) =
                shm_index::oper_poll_add(&self.conn, module, path, sub_id, valid_ms, opts)
            {
                reg.del_oper_poll(sub_id);
                return Err(e);
            }
        }

        sess.attach_subscription(self);
        self.ensure_thread(opts)?;
        Ok(sub_id)
    }

    /// Subscribe to notifications of `module`, optionally bounded by a
    /// stop time after which the subscription terminates itself.
    #[allow(clippy::too_many_arguments)]
    pub fn subscribe_notif<F>(
        self: &Arc<Self>,
        sess: &Session,
        module: &str,
        xpath: Option<&str>,
        start: Option<SystemTime>,
        stop: Option<SystemTime>,
        cb: F,
    ) -> SubscrResult<u32>
    where
        F: Fn(&NotifEvent<'_>) + Send + Sync + 'static,
    {
        self.check_session(sess)?;
        if module.is_empty() {
            return Err(SubscrError::InvalArg("empty module name".to_string()));
        }
        let listen_since_real = SystemTime::now();
        let listen_since_mono = Instant::now();
        if let Some(stop) = stop {
            let reference = start.unwrap_or(listen_since_real);
            if stop <= reference {
                return Err(SubscrError::InvalArg(
                    "stop time is not later than the subscription start".to_string(),
                ));
            }
        }
        let sub_id = self.conn.main().alloc_sub_id();
        let cb: NotifCallback = Arc::new(cb);

        {
            let mut reg = self.write_reg()?;
            let channel = match reg.notif_group_channel(module) {
                Some(ch) => ch,
                None => self.conn.channel(module, "notif", None)?,
            };
            reg.add_notif(
                sub_id,
                sess.sid(),
                module,
                xpath,
                listen_since_mono,
                listen_since_real,
                start,
                stop,
                Arc::clone(&cb),
                channel,
            );
            if let Err(e) = shm_index::notif_add(&self.conn, module, sub_id, self.evpipe.id()) {
                reg.del_notif(sub_id);
                return Err(e);
            }
        }

        sess.attach_subscription(self);
        self.ensure_thread(SubscrOptions::DEFAULT)?;
        Ok(sub_id)
    }

    /// Subscribe as a handler of the RPC/action identified by `xpath`.
    pub fn subscribe_rpc<F>(
        self: &Arc<Self>,
        sess: &Session,
        xpath: &str,
        priority: u32,
        cb: F,
    ) -> SubscrResult<u32>
    where
        F: Fn(&RpcEvent<'_>) -> Result<Vec<u8>, ErrorItem> + Send + Sync + 'static,
    {
        self.check_session(sess)?;
        if xpath.is_empty() {
            return Err(SubscrError::InvalArg("empty operation xpath".to_string()));
        }
        let path = trim_predicates(xpath);
        shm_index::first_ns(&path)?;
        let sub_id = self.conn.main().alloc_sub_id();
        let cb: RpcCallback = Arc::new(cb);
        // Whether the operation comes from a nested schema extension is the
        // schema engine's verdict; plain paths are not extensions.
        let is_ext = false;

        {
            let mut reg = self.write_reg()?;
            let module = shm_index::first_ns(&path)?.to_string();
            let channel = match reg.rpc_group_channel(&path) {
                Some(ch) => ch,
                None => self.conn.channel(&module, "rpc", Some(str_hash(&path, 0)))?,
            };
            reg.add_rpc(
                sub_id,
                sess.sid(),
                &path,
                is_ext,
                xpath,
                priority,
                Arc::clone(&cb),
                channel,
            );
            if let Err(e) = shm_index::rpc_add(
                &self.conn,
                &path,
                is_ext,
                xpath,
                sub_id,
                self.evpipe.id(),
                priority,
            ) {
                reg.del_rpc(sub_id);
                return Err(e);
            }
        }

        sess.attach_subscription(self);
        self.ensure_thread(SubscrOptions::DEFAULT)?;
        Ok(sub_id)
    }

    // ─── unsubscribe ────────────────────────────────────────────────

    /// Remove one subscription, or every subscription in the context when
    /// `sub_id` is zero.
    pub fn unsubscribe(&self, sub_id: u32) -> SubscrResult<()> {
        if sub_id == 0 {
            let ids = self.read_reg()?.all_sub_ids();
            for id in ids {
                if let Err(e) = self.del_one(id) {
                    tracing::warn!(sub_id = id, "unsubscribe: {e}");
                }
            }
            return Ok(());
        }
        self.del_one(sub_id)
    }

    /// Remove all subscriptions originated by a session. Used during
    /// session teardown.
    pub(crate) fn unsubscribe_session(&self, sid: u32) -> SubscrResult<()> {
        let ids = self.read_reg()?.session_sub_ids(sid);
        for id in ids {
            if let Err(e) = self.del_one(id) {
                tracing::warn!(sub_id = id, "session unsubscribe: {e}");
            }
        }
        Ok(())
    }

    fn del_one(&self, sub_id: u32) -> SubscrResult<()> {
        let (kind, key, ds) = self
            .read_reg()?
            .find(sub_id)
            .ok_or_else(|| SubscrError::NotFound(format!("subscription {sub_id}")))?;

        match kind {
            SubKind::Change => {
                let ds = ds.unwrap_or(Datastore::Running);
                // SHM first: a publisher enumerating after this point no
                // longer targets the subscription.
                shm_index::change_del(&self.conn, &key, ds, sub_id)?;
                self.write_reg()?.del_change(sub_id);
            }
            SubKind::OperGet => {
                shm_index::oper_get_del(&self.conn, &key, sub_id)?;
                self.write_reg()?.del_oper_get(sub_id);
            }
            SubKind::OperPoll => {
                shm_index::oper_poll_del(&self.conn, &key, sub_id)?;
                self.write_reg()?.del_oper_poll(sub_id);
                self.conn.oper_cache_del(sub_id);
            }
            SubKind::Rpc => {
                shm_index::rpc_del(&self.conn, &key, sub_id)?;
                self.write_reg()?.del_rpc(sub_id);
            }
            SubKind::Notif => self.del_notif(sub_id, &key)?,
        }
        Ok(())
    }

    // Notification removal delivers a final synthetic notification, with
    // the user callback running outside every lock so it can re-enter.
    fn del_notif(&self, sub_id: u32, module: &str) -> SubscrResult<()> {
        let (channel, cb, track) = {
            let reg = self.read_reg()?;
            let group = reg
                .notif
                .iter()
                .find(|g| g.module == module)
                .ok_or_else(|| SubscrError::NotFound(format!("subscription {sub_id}")))?;
            let sub = group
                .subs
                .iter()
                .find(|s| s.sub_id == sub_id)
                .ok_or_else(|| SubscrError::NotFound(format!("subscription {sub_id}")))?;
            (
                Arc::clone(&group.channel),
                Arc::clone(&sub.cb),
                Arc::clone(&sub.track),
            )
        };

        // An event we were supposed to process is too late now; ack it as
        // ignored so the publisher is not left waiting.
        if let Some(rec) = self.conn.main().find_module(module) {
            let _guard = shm_index::kind_write(&self.conn, &rec.notif_lock)?;
            if let Ok(EventKind::Notif) = channel.event() {
                let req = channel.header().request_id.load(Ordering::Acquire);
                if !track.is_done(EventKind::Notif, req) {
                    let _ = channel.write_reply(EventKind::Notif, req, sub_id, 0, "ignored", b"");
                    track.mark_done(EventKind::Notif, req, true);
                }
            }
        }

        let ev = NotifEvent {
            sub_id,
            module,
            kind: NotifKind::Terminated,
            path: "",
            payload: &[],
            timestamp: SystemTime::now(),
        };
        (cb)(&ev);

        shm_index::notif_del(&self.conn, module, sub_id)?;
        self.write_reg()?.del_notif(sub_id);
        Ok(())
    }

    // ─── suspension ─────────────────────────────────────────────────

    /// Suspend event delivery to one subscription; it stays registered.
    pub fn suspend(&self, sub_id: u32) -> SubscrResult<()> {
        self.set_suspended(sub_id, true)
    }

    /// Resume a previously suspended subscription.
    pub fn resume(&self, sub_id: u32) -> SubscrResult<()> {
        self.set_suspended(sub_id, false)
    }

    /// Whether a subscription is currently suspended.
    pub fn is_suspended(&self, sub_id: u32) -> SubscrResult<bool> {
        let (kind, key, ds) = self
            .read_reg()?
            .find(sub_id)
            .ok_or_else(|| SubscrError::NotFound(format!("subscription {sub_id}")))?;
        shm_index::is_suspended(&self.conn, kind, &key, ds, sub_id)
    }

    fn set_suspended(&self, sub_id: u32, suspended: bool) -> SubscrResult<()> {
        let (kind, key, ds) = self
            .read_reg()?
            .find(sub_id)
            .ok_or_else(|| SubscrError::NotFound(format!("subscription {sub_id}")))?;
        let prev = shm_index::set_suspended(&self.conn, kind, &key, ds, sub_id, suspended)?;
        if prev == suspended {
            return Ok(());
        }

        // Notification subscriptions learn about their own suspension.
        if kind == SubKind::Notif {
            let cb = {
                let reg = self.read_reg()?;
                reg.notif
                    .iter()
                    .find(|g| g.module == key)
                    .and_then(|g| g.subs.iter().find(|s| s.sub_id == sub_id))
                    .map(|s| Arc::clone(&s.cb))
            };
            if let Some(cb) = cb {
                let ev = NotifEvent {
                    sub_id,
                    module: &key,
                    kind: if suspended {
                        NotifKind::Suspended
                    } else {
                        NotifKind::Resumed
                    },
                    path: "",
                    payload: &[],
                    timestamp: SystemTime::now(),
                };
                (cb)(&ev);
            }
        }
        Ok(())
    }

    // ─── handler thread ─────────────────────────────────────────────

    fn ensure_thread(self: &Arc<Self>, opts: SubscrOptions) -> SubscrResult<()> {
        if opts.contains(SubscrOptions::NO_THREAD) {
            return Ok(());
        }
        if opts.contains(SubscrOptions::THREAD_SUSPEND) {
            self.thread_suspended.store(true, Ordering::Release);
        }

        let mut thread = self.thread.lock();
        if thread.is_some() {
            return Ok(());
        }
        let weak: Weak<Self> = Arc::downgrade(self);
        let stop = Arc::clone(&self.stop);
        let suspended = Arc::clone(&self.thread_suspended);
        let handle = std::thread::Builder::new()
            .name("ys-subscr".to_string())
            .spawn(move || loop {
                if stop.load(Ordering::Acquire) {
                    break;
                }
                let Some(ctx) = weak.upgrade() else {
                    break;
                };
                if suspended.load(Ordering::Acquire) {
                    drop(ctx);
                    std::thread::sleep(THREAD_SUSPEND_SLEEP);
                    continue;
                }
                ctx.evpipe.wait(THREAD_WAIT_SLICE);
                if let Err(e) = ctx.process_events_now() {
                    tracing::warn!("event processing failed: {e}");
                }
            })
            .map_err(|e| SubscrError::Shm(e.into()))?;
        *thread = Some(handle);
        Ok(())
    }

    /// Suspend the handler thread; events stay pending until resume.
    pub fn thread_suspend(&self) {
        self.thread_suspended.store(true, Ordering::Release);
    }

    /// Resume a suspended handler thread.
    pub fn thread_resume(&self) {
        self.thread_suspended.store(false, Ordering::Release);
        self.evpipe.notify();
    }

    // ─── event processing ───────────────────────────────────────────

    /// Wait up to `timeout` for a wake, then walk all channels and
    /// dispatch pending events. Returns how many callbacks ran.
    pub fn process_events(&self, timeout: Option<Duration>) -> SubscrResult<usize> {
        if let Some(t) = timeout {
            self.evpipe.wait(t);
        }
        self.process_events_now()
    }

    fn process_events_now(&self) -> SubscrResult<usize> {
        self.evpipe.drain();
        self.sweep_notif_stops();

        let mut processed = 0;

        let change_groups = {
            let reg = self.read_reg()?;
            reg.change
                .iter()
                .map(|g| ChangeDispatch {
                    module: g.module.clone(),
                    ds: g.ds,
                    channel: Arc::clone(&g.channel),
                    subs: g
                        .subs
                        .iter()
                        .map(|s| ChangeDispatchSub {
                            sub_id: s.sub_id,
                            xpath: s.xpath.clone(),
                            priority: s.priority,
                            opts: s.opts,
                            cb: Arc::clone(&s.cb),
                            track: Arc::clone(&s.track),
                        })
                        .collect(),
                })
                .collect::<Vec<_>>()
        };
        for group in &change_groups {
            match self.dispatch_change_group(group) {
                Ok(n) => processed += n,
                Err(e) => tracing::warn!(module = %group.module, "change dispatch: {e}"),
            }
        }

        let oper_subs = {
            let reg = self.read_reg()?;
            reg.oper_get
                .iter()
                .flat_map(|g| {
                    g.subs.iter().map(|s| OperDispatch {
                        module: g.module.clone(),
                        sub_id: s.sub_id,
                        path: s.path.clone(),
                        channel: Arc::clone(&s.channel),
                        cb: Arc::clone(&s.cb),
                        track: Arc::clone(&s.track),
                    })
                })
                .collect::<Vec<_>>()
        };
        for sub in &oper_subs {
            match self.dispatch_oper_sub(sub) {
                Ok(n) => processed += n,
                Err(e) => tracing::warn!(module = %sub.module, "oper dispatch: {e}"),
            }
        }

        let rpc_groups = {
            let reg = self.read_reg()?;
            reg.rpc
                .iter()
                .map(|g| RpcDispatch {
                    path: g.path.clone(),
                    channel: Arc::clone(&g.channel),
                    subs: g
                        .subs
                        .iter()
                        .map(|s| RpcDispatchSub {
                            sub_id: s.sub_id,
                            priority: s.priority,
                            cb: Arc::clone(&s.cb),
                            track: Arc::clone(&s.track),
                        })
                        .collect(),
                })
                .collect::<Vec<_>>()
        };
        for group in &rpc_groups {
            match self.dispatch_rpc_group(group) {
                Ok(n) => processed += n,
                Err(e) => tracing::warn!(path = %group.path, "RPC dispatch: {e}"),
            }
        }

        let notif_groups = {
            let reg = self.read_reg()?;
            reg.notif
                .iter()
                .map(|g| NotifDispatch {
                    module: g.module.clone(),
                    channel: Arc::clone(&g.channel),
                    subs: g
                        .subs
                        .iter()
                        .map(|s| NotifDispatchSub {
                            sub_id: s.sub_id,
                            xpath: s.xpath.clone(),
                            stop: s.stop,
                            cb: Arc::clone(&s.cb),
                            track: Arc::clone(&s.track),
                        })
                        .collect(),
                })
                .collect::<Vec<_>>()
        };
        for group in &notif_groups {
            match self.dispatch_notif_group(group) {
                Ok(n) => processed += n,
                Err(e) => tracing::warn!(module = %group.module, "notif dispatch: {e}"),
            }
        }

        self.refresh_oper_polls();
        Ok(processed)
    }

    // Auto-unsubscribe notification subscriptions whose stop time passed;
    // each gets its final `Terminated` delivery on the way out.
    fn sweep_notif_stops(&self) {
        let now = SystemTime::now();
        let expired: Vec<u32> = match self.read_reg() {
            Ok(reg) => reg
                .notif
                .iter()
                .flat_map(|g| g.subs.iter())
                .filter(|s| s.stop.is_some_and(|stop| stop <= now))
                .map(|s| s.sub_id)
                .collect(),
            Err(_) => return,
        };
        for sub_id in expired {
            if let Err(e) = self.del_one(sub_id) {
                tracing::warn!(sub_id, "stop-time unsubscribe: {e}");
            }
        }
    }

    fn dispatch_change_group(&self, group: &ChangeDispatch) -> SubscrResult<usize> {
        let Some(rec) = self.conn.main().find_module(&group.module) else {
            return Ok(0);
        };
        let lock = rec.change_lock(group.ds);

        let (kind, req, prio, payload) = {
            let _guard = shm_index::kind_read(&self.conn, lock)?;
            group.channel.read_event()?
        };
        if !matches!(
            kind,
            EventKind::Update | EventKind::Change | EventKind::Done | EventKind::Abort
        ) {
            return Ok(0);
        }
        let (path, diff) = decode_change(&payload);
        let (orig_cid, orig_sid) = group.channel.originator();
        let suspended: HashSet<u32> = shm_index::change_suspended(&self.conn, &group.module, group.ds)?
            .into_iter()
            .collect();

        let mut replies: Vec<(u32, u32, String, Vec<u8>)> = Vec::new();
        let mut processed = 0;

        for sub in &group.subs {
            if sub.priority != prio
                || suspended.contains(&sub.sub_id)
                || sub.track.is_done(kind, req)
            {
                continue;
            }
            let covers = xpath_covers(sub.xpath.as_deref(), &path);
            let deliver = match kind {
                EventKind::Update => sub.opts.contains(SubscrOptions::UPDATE) && covers,
                EventKind::Change => !sub.opts.contains(SubscrOptions::DONE_ONLY) && covers,
                EventKind::Done => {
                    covers
                        && (sub.opts.contains(SubscrOptions::DONE_ONLY)
                            || sub.track.ok_req.load(Ordering::Acquire) == req)
                }
                EventKind::Abort => sub.track.ok_req.load(Ordering::Acquire) == req,
                _ => false,
            };
            if !deliver {
                continue;
            }

            let ev = ChangeEvent {
                sub_id: sub.sub_id,
                module: &group.module,
                xpath: sub.xpath.as_deref(),
                event: kind,
                request_id: req,
                path: &path,
                diff: &diff,
                orig_cid,
                orig_sid,
            };
            match (sub.cb)(&ev) {
                Ok(update_data) => {
                    let data = match kind {
                        EventKind::Update => update_data.unwrap_or_default(),
                        _ => Vec::new(),
                    };
                    replies.push((sub.sub_id, 0, String::new(), data));
                    sub.track.mark_done(kind, req, true);
                    processed += 1;
                }
                Err(item) if item.is_shelve() && matches!(kind, EventKind::Update | EventKind::Change) => {
                    sub.track.shelved_req.store(req, Ordering::Release);
                    tracing::debug!(sub_id = sub.sub_id, "event shelved by callback");
                }
                Err(item) => {
                    if matches!(kind, EventKind::Done | EventKind::Abort) {
                        // Too late to deny anything; log and acknowledge.
                        tracing::warn!(sub_id = sub.sub_id, "callback failed: {}", item.message);
                        replies.push((sub.sub_id, 0, String::new(), Vec::new()));
                    } else {
                        replies.push((sub.sub_id, item.code, item.message, Vec::new()));
                    }
                    sub.track.mark_done(kind, req, false);
                    processed += 1;
                }
            }
        }

        if !replies.is_empty() {
            let _guard = shm_index::kind_write(&self.conn, lock)?;
            for (sub_id, code, message, data) in replies {
                group
                    .channel
                    .write_reply(kind, req, sub_id, code, &message, &data)?;
            }
        }
        Ok(processed)
    }

    fn dispatch_oper_sub(&self, sub: &OperDispatch) -> SubscrResult<usize> {
        let Some(rec) = self.conn.main().find_module(&sub.module) else {
            return Ok(0);
        };
        let lock = &rec.oper_get_lock;

        let (kind, req, _prio, payload) = {
            let _guard = shm_index::kind_read(&self.conn, lock)?;
            sub.channel.read_event()?
        };
        if kind != EventKind::Oper || sub.track.is_done(kind, req) {
            return Ok(0);
        }
        let request_xpath = String::from_utf8_lossy(&payload).into_owned();

        let ev = OperGetEvent {
            sub_id: sub.sub_id,
            module: &sub.module,
            path: &sub.path,
            request_xpath: &request_xpath,
            request_id: req,
        };
        let (code, message, data) = match (sub.cb)(&ev) {
            Ok(tree) => (0, String::new(), tree),
            Err(item) if item.is_shelve() => {
                sub.track.shelved_req.store(req, Ordering::Release);
                return Ok(0);
            }
            Err(item) => (item.code, item.message, Vec::new()),
        };
        sub.track.mark_done(kind, req, code == 0);

        {
            let _guard = shm_index::kind_write(&self.conn, lock)?;
            sub.channel
                .write_reply(kind, req, sub.sub_id, code, &message, &data)?;
        }
        Ok(1)
    }

    fn dispatch_rpc_group(&self, group: &RpcDispatch) -> SubscrResult<usize> {
        let module = shm_index::first_ns(&group.path)?.to_string();
        let Some(rec) = self.conn.main().find_module(&module) else {
            return Ok(0);
        };
        let lock = &rec.rpc_lock;

        let (kind, req, prio, payload) = {
            let _guard = shm_index::kind_read(&self.conn, lock)?;
            group.channel.read_event()?
        };
        if !matches!(kind, EventKind::Rpc | EventKind::Abort) {
            return Ok(0);
        }
        let (orig_cid, orig_sid) = group.channel.originator();
        let suspended: HashSet<u32> = shm_index::rpc_suspended(&self.conn, &group.path)?
            .into_iter()
            .collect();

        let mut replies: Vec<(u32, u32, String, Vec<u8>)> = Vec::new();
        let mut processed = 0;

        for sub in &group.subs {
            if sub.priority != prio
                || suspended.contains(&sub.sub_id)
                || sub.track.is_done(kind, req)
            {
                continue;
            }
            if kind == EventKind::Abort && sub.track.ok_req.load(Ordering::Acquire) != req {
                continue;
            }

            let ev = RpcEvent {
                sub_id: sub.sub_id,
                path: &group.path,
                event: kind,
                request_id: req,
                input: &payload,
                orig_cid,
                orig_sid,
            };
            match (sub.cb)(&ev) {
                Ok(output) => {
                    let data = if kind == EventKind::Rpc { output } else { Vec::new() };
                    replies.push((sub.sub_id, 0, String::new(), data));
                    sub.track.mark_done(kind, req, true);
                    processed += 1;
                }
                Err(item) if item.is_shelve() && kind == EventKind::Rpc => {
                    sub.track.shelved_req.store(req, Ordering::Release);
                }
                Err(item) => {
                    if kind == EventKind::Abort {
                        tracing::warn!(sub_id = sub.sub_id, "abort callback failed: {}", item.message);
                        replies.push((sub.sub_id, 0, String::new(), Vec::new()));
                    } else {
                        replies.push((sub.sub_id, item.code, item.message, Vec::new()));
                    }
                    sub.track.mark_done(kind, req, false);
                    processed += 1;
                }
            }
        }

        if !replies.is_empty() {
            let _guard = shm_index::kind_write(&self.conn, lock)?;
            for (sub_id, code, message, data) in replies {
                group
                    .channel
                    .write_reply(kind, req, sub_id, code, &message, &data)?;
            }
        }
        Ok(processed)
    }

    fn dispatch_notif_group(&self, group: &NotifDispatch) -> SubscrResult<usize> {
        let Some(rec) = self.conn.main().find_module(&group.module) else {
            return Ok(0);
        };
        let lock = &rec.notif_lock;

        let (kind, req, _prio, payload) = {
            let _guard = shm_index::kind_read(&self.conn, lock)?;
            group.channel.read_event()?
        };
        if kind != EventKind::Notif {
            return Ok(0);
        }
        let (timestamp, path, tree) = decode_notif(&payload);
        let suspended: HashSet<u32> = shm_index::notif_suspended(&self.conn, &group.module)?
            .into_iter()
            .collect();

        let mut acks: Vec<u32> = Vec::new();
        let mut processed = 0;

        for sub in &group.subs {
            if suspended.contains(&sub.sub_id) || sub.track.is_done(kind, req) {
                continue;
            }
            let in_window = sub.stop.map_or(true, |stop| timestamp <= stop);
            if in_window && xpath_covers(sub.xpath.as_deref(), &path) {
                let ev = NotifEvent {
                    sub_id: sub.sub_id,
                    module: &group.module,
                    kind: NotifKind::Realtime,
                    path: &path,
                    payload: &tree,
                    timestamp,
                };
                (sub.cb)(&ev);
                processed += 1;
            }
            sub.track.mark_done(kind, req, true);
            acks.push(sub.sub_id);
        }

        if !acks.is_empty() {
            let _guard = shm_index::kind_write(&self.conn, lock)?;
            for sub_id in acks {
                group.channel.write_reply(kind, req, sub_id, 0, "", b"")?;
            }
        }
        Ok(processed)
    }

    // Refresh expired poll caches by pulling from the providers. A poll
    // whose provider lives in this very context is skipped: the pull would
    // wait on the thread currently running it.
    fn refresh_oper_polls(&self) {
        let polls = {
            let Ok(reg) = self.read_reg() else { return };
            reg.oper_poll
                .iter()
                .flat_map(|g| {
                    g.subs.iter().map(|s| {
                        let own_provider = reg.oper_get.iter().any(|og| {
                            og.module == g.module
                                && og.subs.iter().any(|o| xpath_covers(Some(&o.path), &s.path))
                        });
                        (s.sub_id, g.module.clone(), s.path.clone(), s.valid_ms, own_provider)
                    })
                })
                .collect::<Vec<_>>()
        };

        for (sub_id, module, path, valid_ms, own_provider) in polls {
            if own_provider || self.conn.oper_cache_get(sub_id).is_some() {
                continue;
            }
            let sess = self.conn.session(Datastore::Operational);
            match crate::engine::get_oper_data(&sess, &module, &path) {
                Ok(data) => {
                    self.conn.oper_cache_put(
                        sub_id,
                        OperCacheEntry {
                            data,
                            fetched_at: Instant::now(),
                            valid_for: Duration::from_millis(valid_ms as u64),
                        },
                    );
                }
                Err(e) => tracing::debug!(sub_id, "oper poll refresh failed: {e}"),
            }
        }
    }

    /// Cached operational data of a poll subscription, when still fresh.
    pub fn oper_poll_data(&self, sub_id: u32) -> Option<Vec<u8>> {
        self.conn.oper_cache_get(sub_id)
    }
}

impl Drop for SubscriptionContext {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Release);
        self.evpipe.notify();
        if let Some(handle) = self.thread.lock().take() {
            // The handler thread may itself hold the final reference.
            if handle.thread().id() != std::thread::current().id() {
                let _ = handle.join();
            }
        }
        // Best-effort removal of anything the application left behind.
        let ids = self.registry.get_mut().all_sub_ids();
        for sub_id in ids {
            if let Err(e) = self.del_one(sub_id) {
                tracing::warn!(sub_id, "context teardown: {e}");
            }
        }
    }
}

/// Strip `[...]` predicates from an operation xpath, yielding the plain
/// operation path used as the routing key.
fn trim_predicates(xpath: &str) -> String {
    let mut out = String::with_capacity(xpath.len());
    let mut depth = 0usize;
    for c in xpath.chars() {
        match c {
            '[' => depth += 1,
            ']' => depth = depth.saturating_sub(1),
            _ if depth == 0 => out.push(c),
            _ => {}
        }
    }
    out
}

// ─── Dispatch snapshots ─────────────────────────────────────────────

struct ChangeDispatch {
    module: String,
    ds: Datastore,
    channel: Arc<Channel>,
    subs: Vec<ChangeDispatchSub>,
}

struct ChangeDispatchSub {
    sub_id: u32,
    xpath: Option<String>,
    priority: u32,
    opts: SubscrOptions,
    cb: ChangeCallback,
    track: Arc<SubTrack>,
}

struct OperDispatch {
    module: String,
    sub_id: u32,
    path: String,
    channel: Arc<Channel>,
    cb: OperGetCallback,
    track: Arc<SubTrack>,
}

struct RpcDispatch {
    path: String,
    channel: Arc<Channel>,
    subs: Vec<RpcDispatchSub>,
}

struct RpcDispatchSub {
    sub_id: u32,
    priority: u32,
    cb: RpcCallback,
    track: Arc<SubTrack>,
}

struct NotifDispatch {
    module: String,
    channel: Arc<Channel>,
    subs: Vec<NotifDispatchSub>,
}

struct NotifDispatchSub {
    sub_id: u32,
    xpath: Option<String>,
    stop: Option<SystemTime>,
    cb: NotifCallback,
    track: Arc<SubTrack>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn predicates_are_trimmed() {
        assert_eq!(trim_predicates("/m:ping"), "/m:ping");
        assert_eq!(trim_predicates("/m:list[name='a']/act"), "/m:list/act");
        assert_eq!(trim_predicates("/m:l[a='[x]']/op"), "/m:l/op");
    }
}
