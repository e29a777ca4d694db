//! The in-process subscription registry.
//!
//! Five parallel tables keyed by module (or operation path), each holding
//! per-module groups with an inner subscriber list. Removal is
//! swap-with-last at both levels; when a group empties it is removed and
//! its channel handle dropped in the same critical section. The tables are
//! guarded by the context's `subs_lock`; this module only manipulates the
//! process-local side, the SHM mirror lives in [`crate::shm_index`].

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Instant, SystemTime};

use ycommon::{Datastore, EventKind, SubscrOptions};
use yangstore_shm::Channel;

use crate::types::{ChangeCallback, NotifCallback, OperGetCallback, RpcCallback};

/// Per-subscription delivery trackers, shared between the registry and the
/// dispatch snapshots so progress survives table mutation.
#[derive(Default)]
pub(crate) struct SubTrack {
    /// Request ID of the last event this subscription replied to.
    pub done_req: AtomicU32,
    /// Event kind of that reply.
    pub done_event: AtomicU32,
    /// Request ID of the last `Change`/`Rpc` this subscription processed
    /// successfully; gates `Done` and `Abort` delivery.
    pub ok_req: AtomicU32,
    /// Request ID the subscription shelved, to be retried on the next
    /// event-pipe wake.
    pub shelved_req: AtomicU32,
}

impl SubTrack {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Whether the `(event, request)` pair was already replied to.
    pub fn is_done(&self, event: EventKind, request_id: u32) -> bool {
        self.done_req.load(Ordering::Acquire) == request_id
            && self.done_event.load(Ordering::Acquire) == event as u32
    }

    /// Record a written reply.
    pub fn mark_done(&self, event: EventKind, request_id: u32, ok: bool) {
        self.done_req.store(request_id, Ordering::Release);
        self.done_event.store(event as u32, Ordering::Release);
        if ok && matches!(event, EventKind::Change | EventKind::Rpc) {
            self.ok_req.store(request_id, Ordering::Release);
        }
        self.shelved_req.store(0, Ordering::Release);
    }
}

// ─── Table entries ──────────────────────────────────────────────────

pub(crate) struct ChangeSub {
    pub sub_id: u32,
    pub sid: u32,
    pub xpath: Option<String>,
    pub priority: u32,
    pub opts: SubscrOptions,
    pub cb: ChangeCallback,
    pub track: Arc<SubTrack>,
}

pub(crate) struct ChangeGroup {
    pub module: String,
    pub ds: Datastore,
    pub channel: Arc<Channel>,
    pub subs: Vec<ChangeSub>,
}

pub(crate) struct OperGetSub {
    pub sub_id: u32,
    pub sid: u32,
    pub path: String,
    pub priority: u32,
    pub cb: OperGetCallback,
    /// Oper-get channels are per subscription, not per group.
    pub channel: Arc<Channel>,
    pub track: Arc<SubTrack>,
}

pub(crate) struct OperGetGroup {
    pub module: String,
    pub subs: Vec<OperGetSub>,
}

pub(crate) struct OperPollSub {
    pub sub_id: u32,
    pub sid: u32,
    pub path: String,
    pub valid_ms: u32,
    pub opts: SubscrOptions,
}

pub(crate) struct OperPollGroup {
    pub module: String,
    pub subs: Vec<OperPollSub>,
}

pub(crate) struct NotifSub {
    pub sub_id: u32,
    pub sid: u32,
    pub xpath: Option<String>,
    pub listen_since_mono: Instant,
    pub listen_since_real: SystemTime,
    pub start: Option<SystemTime>,
    pub stop: Option<SystemTime>,
    pub cb: NotifCallback,
    pub track: Arc<SubTrack>,
}

pub(crate) struct NotifGroup {
    pub module: String,
    pub channel: Arc<Channel>,
    pub subs: Vec<NotifSub>,
}

pub(crate) struct RpcSub {
    pub sub_id: u32,
    pub sid: u32,
    pub xpath: String,
    pub priority: u32,
    pub cb: RpcCallback,
    pub track: Arc<SubTrack>,
}

pub(crate) struct RpcGroup {
    pub path: String,
    pub is_ext: bool,
    pub channel: Arc<Channel>,
    pub subs: Vec<RpcSub>,
}

/// Which table a subscription lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SubKind {
    Change,
    OperGet,
    OperPoll,
    Notif,
    Rpc,
}

/// Result of removing one subscription: what the SHM side and the caller
/// still need to clean up.
pub(crate) struct Removed {
    pub kind: SubKind,
    /// Owning module name, or the operation path for RPC subscriptions.
    pub key: String,
    pub ds: Option<Datastore>,
    pub sid: u32,
    /// The subscription's channel when it was the last user in this
    /// registry (per-sub for oper-get, per-group otherwise).
    pub channel: Option<Arc<Channel>>,
}

// ─── Registry ───────────────────────────────────────────────────────

/// The five parallel tables of one subscription context.
#[derive(Default)]
pub(crate) struct Registry {
    pub change: Vec<ChangeGroup>,
    pub oper_get: Vec<OperGetGroup>,
    pub oper_poll: Vec<OperPollGroup>,
    pub notif: Vec<NotifGroup>,
    pub rpc: Vec<RpcGroup>,
    /// Highest subscription ID ever added to this context.
    pub last_sub_id: u32,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    // ── add ──

    pub fn add_change(
        &mut self,
        sub_id: u32,
        sid: u32,
        module: &str,
        ds: Datastore,
        xpath: Option<&str>,
        priority: u32,
        opts: SubscrOptions,
        cb: ChangeCallback,
        channel: Arc<Channel>,
    ) -> Arc<SubTrack> {
        let group = match self
            .change
            .iter_mut()
            .position(|g| g.module == module && g.ds == ds)
        {
            Some(i) => &mut self.change[i],
            None => {
                self.change.push(ChangeGroup {
                    module: module.to_string(),
                    ds,
                    channel,
                    subs: Vec::new(),
                });
                self.change.last_mut().unwrap()
            }
        };
        let track = SubTrack::new();
        group.subs.push(ChangeSub {
            sub_id,
            sid,
            xpath: xpath.map(str::to_string),
            priority,
            opts,
            cb,
            track: Arc::clone(&track),
        });
        self.last_sub_id = sub_id;
        track
    }

    pub fn add_oper_get(
        &mut self,
        sub_id: u32,
        sid: u32,
        module: &str,
        path: &str,
        priority: u32,
        cb: OperGetCallback,
        channel: Arc<Channel>,
    ) -> Arc<SubTrack> {
        let group = match self.oper_get.iter_mut().position(|g| g.module == module) {
            Some(i) => &mut self.oper_get[i],
            None => {
                self.oper_get.push(OperGetGroup {
                    module: module.to_string(),
                    subs: Vec::new(),
                });
                self.oper_get.last_mut().unwrap()
            }
        };
        let track = SubTrack::new();
        group.subs.push(OperGetSub {
            sub_id,
            sid,
            path: path.to_string(),
            priority,
            cb,
            channel,
            track: Arc::clone(&track),
        });
        self.last_sub_id = sub_id;
        track
    }

    pub fn add_oper_poll(
        &mut self,
        sub_id: u32,
        sid: u32,
        module: &str,
        path: &str,
        valid_ms: u32,
        opts: SubscrOptions,
    ) {
        let group = match self.oper_poll.iter_mut().position(|g| g.module == module) {
            Some(i) => &mut self.oper_poll[i],
            None => {
                self.oper_poll.push(OperPollGroup {
                    module: module.to_string(),
                    subs: Vec::new(),
                });
                self.oper_poll.last_mut().unwrap()
            }
        };
        group.subs.push(OperPollSub {
            sub_id,
            sid,
            path: path.to_string(),
            valid_ms,
            opts,
        });
        self.last_sub_id = sub_id;
    }

    #[allow(clippy::too_many_arguments)]
    pub fn add_notif(
        &mut self,
        sub_id: u32,
        sid: u32,
        module: &str,
        xpath: Option<&str>,
        listen_since_mono: Instant,
        listen_since_real: SystemTime,
        start: Option<SystemTime>,
        stop: Option<SystemTime>,
        cb: NotifCallback,
        channel: Arc<Channel>,
    ) -> Arc<SubTrack> {
        let group = match self.notif.iter_mut().position(|g| g.module == module) {
            Some(i) => &mut self.notif[i],
            None => {
                self.notif.push(NotifGroup {
                    module: module.to_string(),
                    channel,
                    subs: Vec::new(),
                });
                self.notif.last_mut().unwrap()
            }
        };
        let track = SubTrack::new();
        group.subs.push(NotifSub {
            sub_id,
            sid,
            xpath: xpath.map(str::to_string),
            listen_since_mono,
            listen_since_real,
            start,
            stop,
            cb,
            track: Arc::clone(&track),
        });
        self.last_sub_id = sub_id;
        track
    }

    pub fn add_rpc(
        &mut self,
        sub_id: u32,
        sid: u32,
        path: &str,
        is_ext: bool,
        xpath: &str,
        priority: u32,
        cb: RpcCallback,
        channel: Arc<Channel>,
    ) -> Arc<SubTrack> {
        let group = match self.rpc.iter_mut().position(|g| g.path == path) {
            Some(i) => &mut self.rpc[i],
            None => {
                self.rpc.push(RpcGroup {
                    path: path.to_string(),
                    is_ext,
                    channel,
                    subs: Vec::new(),
                });
                self.rpc.last_mut().unwrap()
            }
        };
        let track = SubTrack::new();
        group.subs.push(RpcSub {
            sub_id,
            sid,
            xpath: xpath.to_string(),
            priority,
            cb,
            track: Arc::clone(&track),
        });
        self.last_sub_id = sub_id;
        track
    }

    // ── del ──

    pub fn del_change(&mut self, sub_id: u32) -> Option<Removed> {
        for gi in 0..self.change.len() {
            let group = &mut self.change[gi];
            let Some(si) = group.subs.iter().position(|s| s.sub_id == sub_id) else {
                continue;
            };
            let sub = group.subs.swap_remove(si);
            let mut removed = Removed {
                kind: SubKind::Change,
                key: group.module.clone(),
                ds: Some(group.ds),
                sid: sub.sid,
                channel: None,
            };
            if group.subs.is_empty() {
                let group = self.change.swap_remove(gi);
                removed.channel = Some(group.channel);
            }
            return Some(removed);
        }
        None
    }

    pub fn del_oper_get(&mut self, sub_id: u32) -> Option<Removed> {
        for gi in 0..self.oper_get.len() {
            let group = &mut self.oper_get[gi];
            let Some(si) = group.subs.iter().position(|s| s.sub_id == sub_id) else {
                continue;
            };
            let sub = group.subs.swap_remove(si);
            let removed = Removed {
                kind: SubKind::OperGet,
                key: group.module.clone(),
                ds: None,
                sid: sub.sid,
                channel: Some(sub.channel),
            };
            if group.subs.is_empty() {
                self.oper_get.swap_remove(gi);
            }
            return Some(removed);
        }
        None
    }

    pub fn del_oper_poll(&mut self, sub_id: u32) -> Option<Removed> {
        for gi in 0..self.oper_poll.len() {
            let group = &mut self.oper_poll[gi];
            let Some(si) = group.subs.iter().position(|s| s.sub_id == sub_id) else {
                continue;
            };
            let sub = group.subs.swap_remove(si);
            let removed = Removed {
                kind: SubKind::OperPoll,
                key: group.module.clone(),
                ds: None,
                sid: sub.sid,
                channel: None,
            };
            if group.subs.is_empty() {
                self.oper_poll.swap_remove(gi);
            }
            return Some(removed);
        }
        None
    }

    pub fn del_notif(&mut self, sub_id: u32) -> Option<Removed> {
        for gi in 0..self.notif.len() {
            let group = &mut self.notif[gi];
            let Some(si) = group.subs.iter().position(|s| s.sub_id == sub_id) else {
                continue;
            };
            let sub = group.subs.swap_remove(si);
            let mut removed = Removed {
                kind: SubKind::Notif,
                key: group.module.clone(),
                ds: None,
                sid: sub.sid,
                channel: None,
            };
            if group.subs.is_empty() {
                let group = self.notif.swap_remove(gi);
                removed.channel = Some(group.channel);
            }
            return Some(removed);
        }
        None
    }

    pub fn del_rpc(&mut self, sub_id: u32) -> Option<Removed> {
        for gi in 0..self.rpc.len() {
            let group = &mut self.rpc[gi];
            let Some(si) = group.subs.iter().position(|s| s.sub_id == sub_id) else {
                continue;
            };
            let sub = group.subs.swap_remove(si);
            let mut removed = Removed {
                kind: SubKind::Rpc,
                key: group.path.clone(),
                ds: None,
                sid: sub.sid,
                channel: None,
            };
            if group.subs.is_empty() {
                let group = self.rpc.swap_remove(gi);
                removed.channel = Some(group.channel);
            }
            return Some(removed);
        }
        None
    }

    // ── find ──

    /// The table a subscription lives in, with its owning module name (or
    /// operation path) and, for change subscriptions, the datastore.
    pub fn find(&self, sub_id: u32) -> Option<(SubKind, String, Option<Datastore>)> {
        for g in &self.change {
            if g.subs.iter().any(|s| s.sub_id == sub_id) {
                return Some((SubKind::Change, g.module.clone(), Some(g.ds)));
            }
        }
        for g in &self.oper_get {
            if g.subs.iter().any(|s| s.sub_id == sub_id) {
                return Some((SubKind::OperGet, g.module.clone(), None));
            }
        }
        for g in &self.oper_poll {
            if g.subs.iter().any(|s| s.sub_id == sub_id) {
                return Some((SubKind::OperPoll, g.module.clone(), None));
            }
        }
        for g in &self.notif {
            if g.subs.iter().any(|s| s.sub_id == sub_id) {
                return Some((SubKind::Notif, g.module.clone(), None));
            }
        }
        for g in &self.rpc {
            if g.subs.iter().any(|s| s.sub_id == sub_id) {
                return Some((SubKind::Rpc, g.path.clone(), None));
            }
        }
        None
    }

    /// The session that originated a subscription.
    pub fn session_of(&self, sub_id: u32) -> Option<u32> {
        self.change
            .iter()
            .flat_map(|g| g.subs.iter().map(|s| (s.sub_id, s.sid)))
            .chain(
                self.oper_get
                    .iter()
                    .flat_map(|g| g.subs.iter().map(|s| (s.sub_id, s.sid))),
            )
            .chain(
                self.oper_poll
                    .iter()
                    .flat_map(|g| g.subs.iter().map(|s| (s.sub_id, s.sid))),
            )
            .chain(
                self.notif
                    .iter()
                    .flat_map(|g| g.subs.iter().map(|s| (s.sub_id, s.sid))),
            )
            .chain(
                self.rpc
                    .iter()
                    .flat_map(|g| g.subs.iter().map(|s| (s.sub_id, s.sid))),
            )
            .find(|(id, _)| *id == sub_id)
            .map(|(_, sid)| sid)
    }

    /// Number of subscriptions across all kinds originated by `sid`.
    pub fn count_for_session(&self, sid: u32) -> usize {
        self.change
            .iter()
            .flat_map(|g| g.subs.iter().map(|s| s.sid))
            .chain(self.oper_get.iter().flat_map(|g| g.subs.iter().map(|s| s.sid)))
            .chain(self.oper_poll.iter().flat_map(|g| g.subs.iter().map(|s| s.sid)))
            .chain(self.notif.iter().flat_map(|g| g.subs.iter().map(|s| s.sid)))
            .chain(self.rpc.iter().flat_map(|g| g.subs.iter().map(|s| s.sid)))
            .filter(|s| *s == sid)
            .count()
    }

    /// All subscription IDs originated by `sid`.
    pub fn session_sub_ids(&self, sid: u32) -> Vec<u32> {
        let mut ids = Vec::new();
        for g in &self.change {
            ids.extend(g.subs.iter().filter(|s| s.sid == sid).map(|s| s.sub_id));
        }
        for g in &self.oper_get {
            ids.extend(g.subs.iter().filter(|s| s.sid == sid).map(|s| s.sub_id));
        }
        for g in &self.oper_poll {
            ids.extend(g.subs.iter().filter(|s| s.sid == sid).map(|s| s.sub_id));
        }
        for g in &self.notif {
            ids.extend(g.subs.iter().filter(|s| s.sid == sid).map(|s| s.sub_id));
        }
        for g in &self.rpc {
            ids.extend(g.subs.iter().filter(|s| s.sid == sid).map(|s| s.sub_id));
        }
        ids
    }

    /// All subscription IDs in the context.
    pub fn all_sub_ids(&self) -> Vec<u32> {
        let mut ids = Vec::new();
        for g in &self.change {
            ids.extend(g.subs.iter().map(|s| s.sub_id));
        }
        for g in &self.oper_get {
            ids.extend(g.subs.iter().map(|s| s.sub_id));
        }
        for g in &self.oper_poll {
            ids.extend(g.subs.iter().map(|s| s.sub_id));
        }
        for g in &self.notif {
            ids.extend(g.subs.iter().map(|s| s.sub_id));
        }
        for g in &self.rpc {
            ids.extend(g.subs.iter().map(|s| s.sub_id));
        }
        ids
    }

    /// Total number of subscriptions.
    pub fn total(&self) -> usize {
        self.all_sub_ids().len()
    }

    /// The channel of an existing change group, if any.
    pub fn change_group_channel(&self, module: &str, ds: Datastore) -> Option<Arc<Channel>> {
        self.change
            .iter()
            .find(|g| g.module == module && g.ds == ds)
            .map(|g| Arc::clone(&g.channel))
    }

    /// The channel of an existing notification group, if any.
    pub fn notif_group_channel(&self, module: &str) -> Option<Arc<Channel>> {
        self.notif
            .iter()
            .find(|g| g.module == module)
            .map(|g| Arc::clone(&g.channel))
    }

    /// The channel of an existing RPC group, if any.
    pub fn rpc_group_channel(&self, path: &str) -> Option<Arc<Channel>> {
        self.rpc
            .iter()
            .find(|g| g.path == path)
            .map(|g| Arc::clone(&g.channel))
    }

    /// Whether an oper-get subscription with the same `(path, priority)`
    /// topic hash already exists for the module.
    pub fn oper_get_topic_taken(&self, module: &str, path: &str, priority: u32) -> bool {
        self.oper_get.iter().any(|g| {
            g.module == module
                && g.subs
                    .iter()
                    .any(|s| s.path == path && s.priority == priority)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn dummy_channel(dir: &tempfile::TempDir, module: &str, kind: &str) -> Arc<Channel> {
        Arc::new(Channel::open(dir.path(), module, kind, None).unwrap())
    }

    fn change_cb() -> ChangeCallback {
        Arc::new(|_| Ok(None))
    }

    #[test]
    fn last_sub_id_tracks_adds() {
        let dir = tempfile::tempdir().unwrap();
        let mut reg = Registry::new();
        let ch = dummy_channel(&dir, "m", "running");

        for id in [3u32, 9, 17] {
            reg.add_change(
                id,
                1,
                "m",
                Datastore::Running,
                None,
                0,
                SubscrOptions::DEFAULT,
                change_cb(),
                Arc::clone(&ch),
            );
            assert_eq!(reg.last_sub_id, id);
        }
        let ids = reg.all_sub_ids();
        assert_eq!(ids.len(), 3);
        assert!(ids.iter().all(|id| *id <= reg.last_sub_id));
    }

    #[test]
    fn groups_share_one_channel_per_module_ds() {
        let dir = tempfile::tempdir().unwrap();
        let mut reg = Registry::new();
        let ch = dummy_channel(&dir, "m", "running");

        reg.add_change(1, 1, "m", Datastore::Running, None, 0, SubscrOptions::DEFAULT, change_cb(), Arc::clone(&ch));
        reg.add_change(2, 1, "m", Datastore::Running, None, 5, SubscrOptions::DEFAULT, change_cb(), Arc::clone(&ch));
        assert_eq!(reg.change.len(), 1);
        assert_eq!(reg.change[0].subs.len(), 2);

        // Different datastore forms a separate group.
        let ch2 = dummy_channel(&dir, "m", "candidate");
        reg.add_change(3, 1, "m", Datastore::Candidate, None, 0, SubscrOptions::DEFAULT, change_cb(), ch2);
        assert_eq!(reg.change.len(), 2);
    }

    #[test]
    fn swap_with_last_preserves_remaining_multiset() {
        let dir = tempfile::tempdir().unwrap();
        let mut reg = Registry::new();
        let ch = dummy_channel(&dir, "m", "running");

        for id in 1..=5u32 {
            reg.add_change(id, 1, "m", Datastore::Running, None, id, SubscrOptions::DEFAULT, change_cb(), Arc::clone(&ch));
        }
        let removed = reg.del_change(3).unwrap();
        assert_eq!(removed.kind, SubKind::Change);
        assert_eq!(removed.key, "m");
        assert_eq!(removed.ds, Some(Datastore::Running));
        assert_eq!(removed.sid, 1);
        assert!(removed.channel.is_none());

        let mut ids = reg.all_sub_ids();
        ids.sort_unstable();
        assert_eq!(ids, vec![1, 2, 4, 5]);
    }

    #[test]
    fn emptied_group_returns_its_channel() {
        let dir = tempfile::tempdir().unwrap();
        let mut reg = Registry::new();
        let ch = dummy_channel(&dir, "m", "running");

        reg.add_change(1, 1, "m", Datastore::Running, None, 0, SubscrOptions::DEFAULT, change_cb(), ch);
        let removed = reg.del_change(1).unwrap();
        assert!(removed.channel.is_some());
        assert!(reg.change.is_empty());
        assert!(reg.del_change(1).is_none());
    }

    #[test]
    fn session_count_spans_all_kinds() {
        let dir = tempfile::tempdir().unwrap();
        let mut reg = Registry::new();
        let ch = dummy_channel(&dir, "m", "running");
        let och = dummy_channel(&dir, "m", "oper");
        let nch = dummy_channel(&dir, "m", "notif");

        reg.add_change(1, 10, "m", Datastore::Running, None, 0, SubscrOptions::DEFAULT, change_cb(), ch);
        reg.add_oper_get(2, 10, "m", "/m:state", 0, Arc::new(|_| Ok(vec![])), och);
        reg.add_oper_poll(3, 11, "m", "/m:state", 1000, SubscrOptions::DEFAULT);
        reg.add_notif(
            4,
            10,
            "m",
            None,
            Instant::now(),
            SystemTime::now(),
            None,
            None,
            Arc::new(|_| {}),
            nch,
        );

        assert_eq!(reg.count_for_session(10), 3);
        assert_eq!(reg.count_for_session(11), 1);
        assert_eq!(reg.count_for_session(12), 0);

        let mut sess_ids = reg.session_sub_ids(10);
        sess_ids.sort_unstable();
        assert_eq!(sess_ids, vec![1, 2, 4]);
    }

    #[test]
    fn find_reports_kind_and_key() {
        let dir = tempfile::tempdir().unwrap();
        let mut reg = Registry::new();
        let rch = dummy_channel(&dir, "m", "rpc");

        reg.add_rpc(9, 1, "/m:ping", false, "/m:ping", 10, Arc::new(|_| Ok(vec![])), rch);
        assert_eq!(reg.find(9), Some((SubKind::Rpc, "/m:ping".to_string(), None)));
        assert_eq!(reg.session_of(9), Some(1));
        assert_eq!(reg.find(42), None);
    }

    #[test]
    fn oper_get_topic_collision_is_visible() {
        let dir = tempfile::tempdir().unwrap();
        let mut reg = Registry::new();
        let och = dummy_channel(&dir, "m", "oper");

        reg.add_oper_get(1, 1, "m", "/m:state", 5, Arc::new(|_| Ok(vec![])), och);
        assert!(reg.oper_get_topic_taken("m", "/m:state", 5));
        assert!(!reg.oper_get_topic_taken("m", "/m:state", 6));
        assert!(!reg.oper_get_topic_taken("m", "/m:other", 5));
    }
}
