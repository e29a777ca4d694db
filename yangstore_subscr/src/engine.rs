//! The delivery engine, running in the publisher's process.
//!
//! A publisher locates the target module, snapshots the subscribers other
//! processes published into shared memory, claims the topic for the whole
//! commit and drives the protocol: priority-ordered waves of `Update`,
//! `Change`, `Done` and `Abort` for configuration changes, a single
//! request/reply exchange for operational gets, `Rpc`/`Abort` waves for
//! operations and a broadcast for notifications.
//!
//! Every wait is bounded by the configured apply timeout. Subscribers that
//! fail to reply in time are recorded with `TimeOut` and left to the
//! liveness sweep of the next enumeration. Cancellation requested on the
//! originating session finishes the wave in flight, then unwinds with
//! `Abort` to every wave already delivered.

use std::sync::atomic::Ordering;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use ycommon::{ErrorCode, ErrorInfo, ErrorItem, EventKind, SubscrOptions};
use yangstore_shm::{platform, Channel, Reply, ShmRwLock};

use crate::conn::{Connection, Session};
use crate::error::{SubscrError, SubscrResult};
use crate::shm_index::{self, ChangeTarget, RpcTarget};
use crate::types::xpath_covers;

/// How often unresponsive subscribers are re-notified while a wave waits.
const RENOTIFY_INTERVAL: Duration = Duration::from_millis(200);

// ─── Payload framing ────────────────────────────────────────────────

/// Frame a change payload: the changed subtree path, then the diff.
pub(crate) fn encode_change(path: &str, diff: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(2 + path.len() + diff.len());
    buf.extend_from_slice(&(path.len() as u16).to_le_bytes());
    buf.extend_from_slice(path.as_bytes());
    buf.extend_from_slice(diff);
    buf
}

/// Split a change payload back into `(path, diff)`.
pub(crate) fn decode_change(payload: &[u8]) -> (String, Vec<u8>) {
    if payload.len() < 2 {
        return (String::new(), Vec::new());
    }
    let len = u16::from_le_bytes([payload[0], payload[1]]) as usize;
    let path_end = (2 + len).min(payload.len());
    (
        String::from_utf8_lossy(&payload[2..path_end]).into_owned(),
        payload[path_end..].to_vec(),
    )
}

/// Frame a notification payload: timestamp, notification path, tree.
pub(crate) fn encode_notif(timestamp: SystemTime, path: &str, notif: &[u8]) -> Vec<u8> {
    let nanos = timestamp
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0);
    let mut buf = Vec::with_capacity(10 + path.len() + notif.len());
    buf.extend_from_slice(&nanos.to_le_bytes());
    buf.extend_from_slice(&(path.len() as u16).to_le_bytes());
    buf.extend_from_slice(path.as_bytes());
    buf.extend_from_slice(notif);
    buf
}

/// Split a notification payload back into `(timestamp, path, tree)`.
pub(crate) fn decode_notif(payload: &[u8]) -> (SystemTime, String, Vec<u8>) {
    if payload.len() < 10 {
        return (UNIX_EPOCH, String::new(), Vec::new());
    }
    let nanos = u64::from_le_bytes(payload[..8].try_into().unwrap());
    let len = u16::from_le_bytes([payload[8], payload[9]]) as usize;
    let path_end = (10 + len).min(payload.len());
    (
        UNIX_EPOCH + Duration::from_nanos(nanos),
        String::from_utf8_lossy(&payload[10..path_end]).into_owned(),
        payload[path_end..].to_vec(),
    )
}

// ─── Wave plumbing ──────────────────────────────────────────────────

/// Group targets into waves of equal priority, highest first, preserving
/// the publication order inside each wave.
fn waves<T>(targets: Vec<T>, priority_of: impl Fn(&T) -> u32) -> Vec<(u32, Vec<T>)> {
    let mut prios: Vec<u32> = targets.iter().map(&priority_of).collect();
    prios.sort_unstable_by(|a, b| b.cmp(a));
    prios.dedup();

    let mut out: Vec<(u32, Vec<T>)> = prios.into_iter().map(|p| (p, Vec::new())).collect();
    for t in targets {
        let p = priority_of(&t);
        if let Some((_, wave)) = out.iter_mut().find(|(wp, _)| *wp == p) {
            wave.push(t);
        }
    }
    out
}

/// Scoped ownership of a channel topic for one commit.
struct CommitClaim<'a> {
    channel: &'a Channel,
    cid: u32,
}

impl<'a> CommitClaim<'a> {
    fn take(conn: &Connection, channel: &'a Channel, timeout: Duration) -> SubscrResult<Self> {
        channel.claim_commit(conn.cid(), timeout, &conn.slots())?;
        Ok(Self {
            channel,
            cid: conn.cid(),
        })
    }
}

impl Drop for CommitClaim<'_> {
    fn drop(&mut self) {
        self.channel.release_commit(self.cid);
    }
}

fn next_request_id(channel: &Channel) -> u32 {
    let cur = channel
        .header()
        .request_id
        .load(Ordering::Acquire);
    let next = cur.wrapping_add(1);
    if next == 0 {
        1
    } else {
        next
    }
}

/// Deliver one event to one wave of subscribers and collect the replies.
/// Non-repliers are reported as `TimeOut` entries appended to the reply
/// list; the stale event is flagged ignored so the topic stays usable.
#[allow(clippy::too_many_arguments)]
fn send_wave(
    conn: &Connection,
    lock: &ShmRwLock,
    channel: &Channel,
    event: EventKind,
    request_id: u32,
    priority: u32,
    orig_sid: u32,
    payload: &[u8],
    targets: &[(u32, u32)], // (sub_id, evpipe_id)
    timeout: Duration,
) -> SubscrResult<Vec<Reply>> {
    {
        let _guard = shm_index::kind_write(conn, lock)?;
        if channel.event()? != EventKind::None {
            channel.clear_stale();
        }
        channel.write_event(
            event,
            request_id,
            priority,
            conn.cid(),
            orig_sid,
            payload,
            targets.len() as u32,
        )?;
    }

    let notify_all = || {
        for (_, evpipe_id) in targets {
            if let Some(pipe) = conn.evpipe(*evpipe_id) {
                pipe.notify();
            }
        }
    };
    notify_all();

    // Wait in slices, nudging shelved or slow subscribers between them.
    let deadline = Instant::now() + timeout;
    let mut acked = false;
    loop {
        let slice = RENOTIFY_INTERVAL.min(deadline.saturating_duration_since(Instant::now()));
        if slice.is_zero() {
            break;
        }
        if channel.wait_acked(request_id, slice)? {
            acked = true;
            break;
        }
        notify_all();
    }

    let mut replies = {
        let _guard = shm_index::kind_read(conn, lock)?;
        channel.read_replies()?
    };

    if !acked {
        {
            let _guard = shm_index::kind_write(conn, lock)?;
            channel.clear_stale();
        }
        for (sub_id, _) in targets {
            if !replies.iter().any(|r| r.sub_id == *sub_id) {
                tracing::warn!(
                    sub_id,
                    event = event.as_str(),
                    "subscriber did not reply within the apply timeout"
                );
                replies.push(Reply {
                    sub_id: *sub_id,
                    code: ErrorCode::TimeOut as u32,
                    message: format!("subscriber {sub_id} event \"{}\" timed out", event.as_str()),
                    data: Vec::new(),
                });
            }
        }
    }
    Ok(replies)
}

fn reply_errors(replies: &[Reply]) -> ErrorInfo {
    let mut info = ErrorInfo::new();
    for r in replies {
        if r.code != 0 {
            let mut item = ErrorItem::from_raw(r.code, r.message.clone());
            if item.error_code() == Some(ErrorCode::TimeOut) {
                // A timed-out verifier is treated like a failed one.
                item = ErrorItem::new(ErrorCode::CallbackFailed, item.message);
            }
            info.push(item);
        }
    }
    info
}

// ─── Change protocol ────────────────────────────────────────────────

/// Apply a configuration change to `module` in the session's datastore,
/// driving the full multi-phase protocol over the module's subscribers.
pub fn apply_changes(
    sess: &Session,
    module: &str,
    path: &str,
    diff: &[u8],
) -> SubscrResult<()> {
    let conn = sess.connection();
    let ds = sess.datastore();
    let timeout = conn.config().apply_timeout();

    let targets = shm_index::change_targets(conn, module, ds)?;
    let relevant: Vec<ChangeTarget> = targets
        .into_iter()
        .filter(|t| !t.suspended && xpath_covers(t.xpath.as_deref(), path))
        .collect();

    if relevant.is_empty() {
        touch_cfg_timestamp(conn, module);
        return Ok(());
    }

    let rec = conn
        .main()
        .find_module(module)
        .ok_or_else(|| SubscrError::NotFound(format!("module '{module}'")))?;
    let lock = rec.change_lock(ds);
    let channel = conn.channel(module, ds.as_str(), None)?;
    let _claim = CommitClaim::take(conn, &channel, timeout)?;
    let request_id = next_request_id(&channel);

    let mut current_diff = diff.to_vec();

    // Update phase: subscribers that opted in may amend the pending diff.
    let updaters: Vec<&ChangeTarget> = relevant
        .iter()
        .filter(|t| t.opts.contains(SubscrOptions::UPDATE))
        .collect();
    for (prio, wave) in waves(updaters, |t| t.priority) {
        let wave_targets: Vec<(u32, u32)> =
            wave.iter().map(|t| (t.sub_id, t.evpipe_id)).collect();
        let replies = send_wave(
            conn,
            lock,
            &channel,
            EventKind::Update,
            request_id,
            prio,
            sess.sid(),
            &encode_change(path, &current_diff),
            &wave_targets,
            timeout,
        )?;
        let errors = reply_errors(&replies);
        if !errors.is_empty() {
            sess.set_errors(errors.clone());
            return Err(SubscrError::Callback(errors));
        }
        if let Some(updated) = replies.iter().find(|r| !r.data.is_empty()) {
            current_diff = updated.data.clone();
        }
    }

    // Change phase: verifiers may deny; the first failing wave stops the
    // commit and everything already delivered is aborted.
    let verifiers: Vec<&ChangeTarget> = relevant
        .iter()
        .filter(|t| !t.opts.contains(SubscrOptions::DONE_ONLY))
        .collect();
    let payload = encode_change(path, &current_diff);
    let mut errors = ErrorInfo::new();
    let mut ok_subs: Vec<&ChangeTarget> = Vec::new();

    for (prio, wave) in waves(verifiers.clone(), |t| t.priority) {
        if sess.is_cancelled() {
            errors.push(ErrorItem::new(
                ErrorCode::OperationFailed,
                "operation cancelled by the caller",
            ));
            break;
        }
        let wave_targets: Vec<(u32, u32)> =
            wave.iter().map(|t| (t.sub_id, t.evpipe_id)).collect();
        let replies = send_wave(
            conn,
            lock,
            &channel,
            EventKind::Change,
            request_id,
            prio,
            sess.sid(),
            &payload,
            &wave_targets,
            timeout,
        )?;
        for t in &wave {
            if replies.iter().any(|r| r.sub_id == t.sub_id && r.code == 0) {
                ok_subs.push(t);
            }
        }
        errors.extend(reply_errors(&replies));
        if !errors.is_empty() {
            break;
        }
    }

    if !errors.is_empty() {
        // Abort everyone that processed Change successfully; the failing
        // subscriber never sees the abort.
        for (prio, wave) in waves(ok_subs, |t| t.priority) {
            let wave_targets: Vec<(u32, u32)> =
                wave.iter().map(|t| (t.sub_id, t.evpipe_id)).collect();
            if let Err(e) = send_wave(
                conn,
                lock,
                &channel,
                EventKind::Abort,
                request_id,
                prio,
                sess.sid(),
                &payload,
                &wave_targets,
                timeout,
            ) {
                tracing::warn!(module, "abort wave failed: {e}");
            }
        }
        sess.set_errors(errors.clone());
        return Err(SubscrError::Callback(errors));
    }

    // Done phase: all verifiers plus the done-only subscribers. Errors can
    // no longer fail the commit, they are only logged.
    let done_targets: Vec<&ChangeTarget> = relevant.iter().collect();
    for (prio, wave) in waves(done_targets, |t| t.priority) {
        let wave_targets: Vec<(u32, u32)> =
            wave.iter().map(|t| (t.sub_id, t.evpipe_id)).collect();
        match send_wave(
            conn,
            lock,
            &channel,
            EventKind::Done,
            request_id,
            prio,
            sess.sid(),
            &payload,
            &wave_targets,
            timeout,
        ) {
            Ok(replies) => {
                for r in replies.iter().filter(|r| r.code != 0) {
                    tracing::warn!(sub_id = r.sub_id, "done callback failed: {}", r.message);
                }
            }
            Err(e) => tracing::warn!(module, "done wave failed: {e}"),
        }
    }

    touch_cfg_timestamp(conn, module);
    Ok(())
}

fn touch_cfg_timestamp(conn: &Connection, module: &str) {
    if let Some(rec) = conn.main().find_module(module) {
        rec.last_cfg_change
            .store(platform::wall_nanos(), Ordering::Release);
    }
}

// ─── Operational get protocol ───────────────────────────────────────

/// Pull operational data for `request_xpath` from the provider covering
/// it. Returns the serialized subtree, empty when no provider matches.
pub fn get_oper_data(sess: &Session, module: &str, request_xpath: &str) -> SubscrResult<Vec<u8>> {
    let conn = sess.connection();
    let timeout = conn.config().apply_timeout();

    let targets = shm_index::oper_get_targets(conn, module)?;
    // Highest priority wins; publication order breaks ties. Duplicate
    // (path, priority) pairs were already rejected at subscribe time.
    let provider = targets
        .iter()
        .filter(|t| !t.suspended && xpath_covers(Some(&t.path), request_xpath))
        .max_by_key(|t| t.priority);
    let Some(provider) = provider else {
        return Ok(Vec::new());
    };

    let rec = conn
        .main()
        .find_module(module)
        .ok_or_else(|| SubscrError::NotFound(format!("module '{module}'")))?;
    let channel = conn.channel(module, "oper", Some(provider.path_hash))?;
    let _claim = CommitClaim::take(conn, &channel, timeout)?;
    let request_id = next_request_id(&channel);

    let replies = send_wave(
        conn,
        &rec.oper_get_lock,
        &channel,
        EventKind::Oper,
        request_id,
        provider.priority,
        sess.sid(),
        request_xpath.as_bytes(),
        &[(provider.sub_id, provider.evpipe_id)],
        timeout,
    )?;

    let errors = reply_errors(&replies);
    if !errors.is_empty() {
        sess.set_errors(errors.clone());
        return Err(SubscrError::Callback(errors));
    }
    Ok(replies.into_iter().next().map(|r| r.data).unwrap_or_default())
}

// ─── RPC protocol ───────────────────────────────────────────────────

/// Execute an RPC/action: `Rpc` waves in descending priority, each of
/// which may transform the input; a failure aborts the waves already
/// delivered and returns the error to the invoker.
pub fn send_rpc(sess: &Session, path: &str, input: &[u8]) -> SubscrResult<Vec<u8>> {
    let conn = sess.connection();
    let timeout = conn.config().apply_timeout();
    let module = shm_index::first_ns(path)?.to_string();

    let targets = shm_index::rpc_targets(conn, path)?;
    let active: Vec<RpcTarget> = targets.into_iter().filter(|t| !t.suspended).collect();
    if active.is_empty() {
        return Err(SubscrError::NotFound(format!(
            "RPC subscriber for '{path}'"
        )));
    }

    let rec = conn
        .main()
        .find_module(&module)
        .ok_or_else(|| SubscrError::NotFound(format!("module '{module}'")))?;
    let channel = conn.channel(&module, "rpc", Some(yangstore_shm::str_hash(path, 0)))?;
    let _claim = CommitClaim::take(conn, &channel, timeout)?;
    let request_id = next_request_id(&channel);

    let mut errors = ErrorInfo::new();
    let mut ok_subs: Vec<RpcTarget> = Vec::new();
    let mut current_input = input.to_vec();
    let mut output: Option<Vec<u8>> = None;

    for (prio, wave) in waves(active, |t| t.priority) {
        if sess.is_cancelled() {
            errors.push(ErrorItem::new(
                ErrorCode::OperationFailed,
                "operation cancelled by the caller",
            ));
            break;
        }
        let wave_targets: Vec<(u32, u32)> =
            wave.iter().map(|t| (t.sub_id, t.evpipe_id)).collect();
        let replies = send_wave(
            conn,
            &rec.rpc_lock,
            &channel,
            EventKind::Rpc,
            request_id,
            prio,
            sess.sid(),
            &current_input,
            &wave_targets,
            timeout,
        )?;
        for t in &wave {
            if replies.iter().any(|r| r.sub_id == t.sub_id && r.code == 0) {
                ok_subs.push(t.clone());
            }
        }
        errors.extend(reply_errors(&replies));
        if !errors.is_empty() {
            break;
        }
        if let Some(data) = replies
            .iter()
            .find(|r| !r.data.is_empty())
            .map(|r| r.data.clone())
        {
            if output.is_none() {
                output = Some(data.clone());
            }
            current_input = data;
        }
    }

    if !errors.is_empty() {
        for (prio, wave) in waves(ok_subs, |t| t.priority) {
            let wave_targets: Vec<(u32, u32)> =
                wave.iter().map(|t| (t.sub_id, t.evpipe_id)).collect();
            if let Err(e) = send_wave(
                conn,
                &rec.rpc_lock,
                &channel,
                EventKind::Abort,
                request_id,
                prio,
                sess.sid(),
                &current_input,
                &wave_targets,
                timeout,
            ) {
                tracing::warn!(path, "RPC abort wave failed: {e}");
            }
        }
        sess.set_errors(errors.clone());
        return Err(SubscrError::Callback(errors));
    }

    Ok(output.unwrap_or_default())
}

// ─── Notification delivery ──────────────────────────────────────────

/// Broadcast a notification to every live subscriber of the module.
/// Application errors are not collected; a subscriber that fails to ack
/// within the timeout is left to the liveness sweep.
pub fn send_notif(
    sess: &Session,
    module: &str,
    path: &str,
    notif: &[u8],
    timestamp: SystemTime,
) -> SubscrResult<()> {
    let conn = sess.connection();
    let timeout = conn.config().apply_timeout();

    let targets = shm_index::notif_targets(conn, module)?;
    let live: Vec<_> = targets.into_iter().filter(|t| !t.suspended).collect();
    if live.is_empty() {
        return Ok(());
    }

    let rec = conn
        .main()
        .find_module(module)
        .ok_or_else(|| SubscrError::NotFound(format!("module '{module}'")))?;
    if rec.replay_enabled.load(Ordering::Acquire) != 0 {
        // The replay window opens with the first stored notification.
        let nanos = timestamp
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or(0);
        let _ = rec.replay_earliest.compare_exchange(
            0,
            nanos,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }
    let channel = conn.channel(module, "notif", None)?;
    let _claim = CommitClaim::take(conn, &channel, timeout)?;
    let request_id = next_request_id(&channel);

    let wave_targets: Vec<(u32, u32)> = live.iter().map(|t| (t.sub_id, t.evpipe_id)).collect();
    let replies = send_wave(
        conn,
        &rec.notif_lock,
        &channel,
        EventKind::Notif,
        request_id,
        0,
        sess.sid(),
        &encode_notif(timestamp, path, notif),
        &wave_targets,
        timeout,
    )?;
    for r in replies.iter().filter(|r| r.code != 0) {
        tracing::debug!(sub_id = r.sub_id, "notification ack: {}", r.message);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn change_framing_round_trips() {
        let payload = encode_change("/m:cfg", b"a=1");
        let (path, diff) = decode_change(&payload);
        assert_eq!(path, "/m:cfg");
        assert_eq!(diff, b"a=1");
    }

    #[test]
    fn notif_framing_round_trips() {
        let ts = UNIX_EPOCH + Duration::from_secs(1_700_000_000);
        let payload = encode_notif(ts, "/m:link-down", b"<notif/>");
        let (got_ts, path, tree) = decode_notif(&payload);
        assert_eq!(got_ts, ts);
        assert_eq!(path, "/m:link-down");
        assert_eq!(tree, b"<notif/>");
    }

    #[test]
    fn truncated_frames_decode_to_empty() {
        assert_eq!(decode_change(b""), (String::new(), Vec::new()));
        let (ts, path, tree) = decode_notif(b"abc");
        assert_eq!(ts, UNIX_EPOCH);
        assert!(path.is_empty() && tree.is_empty());
    }

    #[test]
    fn waves_are_priority_descending_and_stable() {
        let targets = vec![(5u32, "a"), (10, "b"), (5, "c"), (0, "d"), (10, "e")];
        let grouped = waves(targets, |t| t.0);
        let prios: Vec<u32> = grouped.iter().map(|(p, _)| *p).collect();
        assert_eq!(prios, vec![10, 5, 0]);
        assert_eq!(
            grouped[0].1.iter().map(|t| t.1).collect::<Vec<_>>(),
            vec!["b", "e"]
        );
        assert_eq!(
            grouped[1].1.iter().map(|t| t.1).collect::<Vec<_>>(),
            vec!["a", "c"]
        );
    }

    #[test]
    fn timeout_replies_become_callback_failures() {
        let replies = vec![Reply {
            sub_id: 1,
            code: ErrorCode::TimeOut as u32,
            message: "too slow".into(),
            data: vec![],
        }];
        let info = reply_errors(&replies);
        assert_eq!(
            info.first().unwrap().error_code(),
            Some(ErrorCode::CallbackFailed)
        );
    }
}
