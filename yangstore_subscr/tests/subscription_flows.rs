//! End-to-end delivery flows: publisher and subscribers attached to one
//! run directory through separate connections, events crossing the shared
//! memory channels exactly as they would between processes.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

use ycommon::{ErrorCode, ErrorItem, EventKind, ShmConfig, SubscrOptions};
use yangstore_subscr::{engine, Connection, SubscrError, SubscriptionContext};

fn test_config(dir: &tempfile::TempDir) -> ShmConfig {
    let mut cfg = ShmConfig::with_run_dir(dir.path());
    // Keep failure paths snappy.
    cfg.apply_timeout_ms = 2_000;
    cfg
}

/// Ordered record of `(sub_id, event)` observations.
#[derive(Clone, Default)]
struct Recorder(Arc<Mutex<Vec<(u32, String)>>>);

impl Recorder {
    fn push(&self, sub_id: u32, event: impl Into<String>) {
        self.0.lock().unwrap().push((sub_id, event.into()));
    }

    fn events(&self) -> Vec<(u32, String)> {
        self.0.lock().unwrap().clone()
    }

    fn events_of(&self, sub_id: u32) -> Vec<String> {
        self.events()
            .into_iter()
            .filter(|(id, _)| *id == sub_id)
            .map(|(_, e)| e)
            .collect()
    }

    fn wait_for(&self, sub_id: u32, event: &str, timeout: Duration) -> bool {
        let deadline = std::time::Instant::now() + timeout;
        while std::time::Instant::now() < deadline {
            if self.events_of(sub_id).iter().any(|e| e == event) {
                return true;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        false
    }
}

#[test]
fn single_change_subscriber_gets_change_then_done() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = test_config(&dir);

    let sub_conn = Connection::attach(cfg.clone()).unwrap();
    let ctx = SubscriptionContext::new(&sub_conn).unwrap();
    let sub_sess = sub_conn.session(ycommon::Datastore::Running);

    let rec = Recorder::default();
    let rec_cb = rec.clone();
    let sub_id = ctx
        .subscribe_change(
            &sub_sess,
            "m",
            Some("/m:cfg"),
            0,
            SubscrOptions::DEFAULT,
            move |ev| {
                rec_cb.push(ev.sub_id, format!("{}:{}", ev.event.as_str(), ev.request_id));
                Ok(None)
            },
        )
        .unwrap();

    let pub_conn = Connection::attach(cfg).unwrap();
    let pub_sess = pub_conn.session(ycommon::Datastore::Running);
    engine::apply_changes(&pub_sess, "m", "/m:cfg/a", b"a=1").unwrap();

    assert!(rec.wait_for(sub_id, "done:1", Duration::from_secs(3)));
    assert_eq!(rec.events_of(sub_id), vec!["change:1", "done:1"]);
}

#[test]
fn failing_verifier_aborts_higher_priority_wave() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = test_config(&dir);

    let sub_conn = Connection::attach(cfg.clone()).unwrap();
    let ctx = SubscriptionContext::new(&sub_conn).unwrap();
    let sess = sub_conn.session(ycommon::Datastore::Running);

    let rec = Recorder::default();
    let rec10 = rec.clone();
    let hi = ctx
        .subscribe_change(&sess, "m", None, 10, SubscrOptions::DEFAULT, move |ev| {
            rec10.push(ev.sub_id, ev.event.as_str().to_string());
            Ok(None)
        })
        .unwrap();
    let rec5 = rec.clone();
    let lo = ctx
        .subscribe_change(&sess, "m", None, 5, SubscrOptions::DEFAULT, move |ev| {
            rec5.push(ev.sub_id, ev.event.as_str().to_string());
            if ev.event == EventKind::Change {
                Err(ErrorItem::new(ErrorCode::CallbackFailed, "denied"))
            } else {
                Ok(None)
            }
        })
        .unwrap();

    let pub_conn = Connection::attach(cfg).unwrap();
    let pub_sess = pub_conn.session(ycommon::Datastore::Running);
    let err = engine::apply_changes(&pub_sess, "m", "/m:cfg", b"bad").unwrap_err();
    assert_eq!(err.code(), ErrorCode::CallbackFailed);

    assert!(rec.wait_for(hi, "abort", Duration::from_secs(3)));
    // Priority 10 verified first and was rolled back; priority 5 failed
    // and never saw the abort.
    assert_eq!(rec.events_of(hi), vec!["change", "abort"]);
    assert_eq!(rec.events_of(lo), vec!["change"]);
    assert!(!pub_sess.errors().is_empty());
}

#[test]
fn change_waves_visit_priorities_in_descending_order() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = test_config(&dir);

    let sub_conn = Connection::attach(cfg.clone()).unwrap();
    let ctx = SubscriptionContext::new(&sub_conn).unwrap();
    let sess = sub_conn.session(ycommon::Datastore::Running);

    let order = Arc::new(Mutex::new(Vec::new()));
    for prio in [5u32, 10, 1] {
        let order = Arc::clone(&order);
        ctx.subscribe_change(&sess, "m", None, prio, SubscrOptions::DEFAULT, move |ev| {
            if ev.event == EventKind::Change {
                order.lock().unwrap().push(prio);
            }
            Ok(None)
        })
        .unwrap();
    }

    let pub_conn = Connection::attach(cfg).unwrap();
    let pub_sess = pub_conn.session(ycommon::Datastore::Running);
    engine::apply_changes(&pub_sess, "m", "/m:cfg", b"x").unwrap();

    assert_eq!(*order.lock().unwrap(), vec![10, 5, 1]);
}

#[test]
fn done_only_subscriber_skips_verification() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = test_config(&dir);

    let sub_conn = Connection::attach(cfg.clone()).unwrap();
    let ctx = SubscriptionContext::new(&sub_conn).unwrap();
    let sess = sub_conn.session(ycommon::Datastore::Running);

    let rec = Recorder::default();
    let rec_cb = rec.clone();
    let sub_id = ctx
        .subscribe_change(&sess, "m", None, 0, SubscrOptions::DONE_ONLY, move |ev| {
            rec_cb.push(ev.sub_id, ev.event.as_str().to_string());
            Ok(None)
        })
        .unwrap();

    let pub_conn = Connection::attach(cfg).unwrap();
    let pub_sess = pub_conn.session(ycommon::Datastore::Running);
    engine::apply_changes(&pub_sess, "m", "/m:cfg", b"x").unwrap();

    assert!(rec.wait_for(sub_id, "done", Duration::from_secs(3)));
    assert_eq!(rec.events_of(sub_id), vec!["done"]);
}

#[test]
fn update_subscriber_amends_the_diff() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = test_config(&dir);

    let sub_conn = Connection::attach(cfg.clone()).unwrap();
    let ctx = SubscriptionContext::new(&sub_conn).unwrap();
    let sess = sub_conn.session(ycommon::Datastore::Running);

    let seen_diff = Arc::new(Mutex::new(Vec::new()));
    ctx.subscribe_change(
        &sess,
        "m",
        None,
        10,
        SubscrOptions::UPDATE,
        move |ev| match ev.event {
            EventKind::Update => Ok(Some(b"amended".to_vec())),
            _ => Ok(None),
        },
    )
    .unwrap();
    let seen = Arc::clone(&seen_diff);
    let verifier = ctx
        .subscribe_change(&sess, "m", None, 0, SubscrOptions::DEFAULT, move |ev| {
            if ev.event == EventKind::Change {
                seen.lock().unwrap().push(ev.diff.to_vec());
            }
            Ok(None)
        })
        .unwrap();
    let _ = verifier;

    let pub_conn = Connection::attach(cfg).unwrap();
    let pub_sess = pub_conn.session(ycommon::Datastore::Running);
    engine::apply_changes(&pub_sess, "m", "/m:cfg", b"original").unwrap();

    let diffs = seen_diff.lock().unwrap().clone();
    assert_eq!(diffs, vec![b"amended".to_vec()]);
}

#[test]
fn oper_get_round_trips_the_provided_tree() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = test_config(&dir);

    let sub_conn = Connection::attach(cfg.clone()).unwrap();
    let ctx = SubscriptionContext::new(&sub_conn).unwrap();
    let sess = sub_conn.session(ycommon::Datastore::Operational);

    ctx.subscribe_oper_get(&sess, "m", "/m:state", 0, |ev| {
        assert_eq!(ev.path, "/m:state");
        Ok(b"<state><x>42</x></state>".to_vec())
    })
    .unwrap();

    let pub_conn = Connection::attach(cfg).unwrap();
    let pub_sess = pub_conn.session(ycommon::Datastore::Operational);
    let data = engine::get_oper_data(&pub_sess, "m", "/m:state").unwrap();
    assert_eq!(data, b"<state><x>42</x></state>");

    // No provider covers an unrelated path.
    let empty = engine::get_oper_data(&pub_sess, "m", "/m:other").unwrap();
    assert!(empty.is_empty());
}

#[test]
fn duplicate_oper_get_topic_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = test_config(&dir);

    let conn_a = Connection::attach(cfg.clone()).unwrap();
    let ctx_a = SubscriptionContext::new(&conn_a).unwrap();
    let sess_a = conn_a.session(ycommon::Datastore::Operational);
    ctx_a
        .subscribe_oper_get(&sess_a, "m", "/m:state", 7, |_| Ok(vec![]))
        .unwrap();

    // The same (path, priority) from another connection collides in SHM.
    let conn_b = Connection::attach(cfg).unwrap();
    let ctx_b = SubscriptionContext::new(&conn_b).unwrap();
    let sess_b = conn_b.session(ycommon::Datastore::Operational);
    let err = ctx_b
        .subscribe_oper_get(&sess_b, "m", "/m:state", 7, |_| Ok(vec![]))
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::Exists);

    // A different priority is a different topic.
    ctx_b
        .subscribe_oper_get(&sess_b, "m", "/m:state", 8, |_| Ok(vec![]))
        .unwrap();
}

#[test]
fn rpc_failure_aborts_earlier_priorities_and_reaches_invoker() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = test_config(&dir);

    let sub_conn = Connection::attach(cfg.clone()).unwrap();
    let ctx = SubscriptionContext::new(&sub_conn).unwrap();
    let sess = sub_conn.session(ycommon::Datastore::Running);

    let rec = Recorder::default();
    let rec20 = rec.clone();
    let hi = ctx
        .subscribe_rpc(&sess, "/m:ping", 20, move |ev| {
            rec20.push(ev.sub_id, ev.event.as_str().to_string());
            Ok(b"pong".to_vec())
        })
        .unwrap();
    let rec10 = rec.clone();
    let lo = ctx
        .subscribe_rpc(&sess, "/m:ping", 10, move |ev| {
            rec10.push(ev.sub_id, ev.event.as_str().to_string());
            Err(ErrorItem::new(ErrorCode::OperationFailed, "ping broken"))
        })
        .unwrap();

    let pub_conn = Connection::attach(cfg).unwrap();
    let pub_sess = pub_conn.session(ycommon::Datastore::Running);
    let err = engine::send_rpc(&pub_sess, "/m:ping", b"ping").unwrap_err();
    assert!(matches!(err, SubscrError::Callback(_)));

    assert!(rec.wait_for(hi, "abort", Duration::from_secs(3)));
    assert_eq!(rec.events_of(hi), vec!["rpc", "abort"]);
    assert_eq!(rec.events_of(lo), vec!["rpc"]);
}

#[test]
fn rpc_output_of_highest_priority_wave_is_returned() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = test_config(&dir);

    let sub_conn = Connection::attach(cfg.clone()).unwrap();
    let ctx = SubscriptionContext::new(&sub_conn).unwrap();
    let sess = sub_conn.session(ycommon::Datastore::Running);

    ctx.subscribe_rpc(&sess, "/m:ping", 20, |_| Ok(b"first".to_vec()))
        .unwrap();
    let lower_saw = Arc::new(Mutex::new(Vec::new()));
    let lower = Arc::clone(&lower_saw);
    ctx.subscribe_rpc(&sess, "/m:ping", 10, move |ev| {
        lower.lock().unwrap().push(ev.input.to_vec());
        Ok(Vec::new())
    })
    .unwrap();

    let pub_conn = Connection::attach(cfg).unwrap();
    let pub_sess = pub_conn.session(ycommon::Datastore::Running);
    let out = engine::send_rpc(&pub_sess, "/m:ping", b"input").unwrap();

    assert_eq!(out, b"first");
    // The lower-priority wave received the transformed input.
    assert_eq!(lower_saw.lock().unwrap().clone(), vec![b"first".to_vec()]);
}

#[test]
fn rpc_without_subscriber_is_not_found() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = test_config(&dir);
    let conn = Connection::attach(cfg).unwrap();
    let sess = conn.session(ycommon::Datastore::Running);

    let err = engine::send_rpc(&sess, "/m:absent", b"").unwrap_err();
    assert_eq!(err.code(), ErrorCode::NotFound);
}

#[test]
fn notification_broadcast_reaches_matching_subscribers() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = test_config(&dir);

    let sub_conn = Connection::attach(cfg.clone()).unwrap();
    let ctx = SubscriptionContext::new(&sub_conn).unwrap();
    let sess = sub_conn.session(ycommon::Datastore::Running);

    let rec = Recorder::default();
    let rec_all = rec.clone();
    let all = ctx
        .subscribe_notif(&sess, "m", None, None, None, move |ev| {
            rec_all.push(ev.sub_id, format!("{:?}:{}", ev.kind, ev.path));
        })
        .unwrap();
    let rec_filtered = rec.clone();
    let filtered = ctx
        .subscribe_notif(&sess, "m", Some("/m:other"), None, None, move |ev| {
            rec_filtered.push(ev.sub_id, format!("{:?}:{}", ev.kind, ev.path));
        })
        .unwrap();

    let pub_conn = Connection::attach(cfg).unwrap();
    let pub_sess = pub_conn.session(ycommon::Datastore::Running);
    engine::send_notif(&pub_sess, "m", "/m:link-down", b"<notif/>", SystemTime::now()).unwrap();

    assert!(rec.wait_for(all, "Realtime:/m:link-down", Duration::from_secs(3)));
    // The xpath-filtered subscriber acked but saw no callback.
    assert!(rec.events_of(filtered).is_empty());
}

#[test]
fn notif_stop_time_terminates_the_subscription() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = test_config(&dir);

    let sub_conn = Connection::attach(cfg).unwrap();
    let ctx = SubscriptionContext::new(&sub_conn).unwrap();
    let sess = sub_conn.session(ycommon::Datastore::Running);

    let rec = Recorder::default();
    let rec_cb = rec.clone();
    let subscribed_at = SystemTime::now();
    let sub_id = ctx
        .subscribe_notif(
            &sess,
            "m",
            None,
            None,
            Some(subscribed_at + Duration::from_millis(100)),
            move |ev| {
                rec_cb.push(ev.sub_id, format!("{:?}", ev.kind));
            },
        )
        .unwrap();

    // The handler thread sweeps stop times on its own.
    assert!(rec.wait_for(sub_id, "Terminated", Duration::from_secs(3)));
    assert_eq!(rec.events_of(sub_id), vec!["Terminated"]);
    // The subscription is gone.
    assert!(matches!(
        ctx.unsubscribe(sub_id),
        Err(SubscrError::NotFound(_))
    ));
}

#[test]
fn explicit_notif_unsubscribe_delivers_terminated() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = test_config(&dir);

    let sub_conn = Connection::attach(cfg).unwrap();
    let ctx = SubscriptionContext::new(&sub_conn).unwrap();
    let sess = sub_conn.session(ycommon::Datastore::Running);

    let rec = Recorder::default();
    let rec_cb = rec.clone();
    let sub_id = ctx
        .subscribe_notif(&sess, "m", None, None, None, move |ev| {
            rec_cb.push(ev.sub_id, format!("{:?}", ev.kind));
        })
        .unwrap();

    ctx.unsubscribe(sub_id).unwrap();
    assert_eq!(rec.events_of(sub_id), vec!["Terminated"]);
}

#[test]
fn suspended_subscription_is_skipped_until_resumed() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = test_config(&dir);

    let sub_conn = Connection::attach(cfg.clone()).unwrap();
    let ctx = SubscriptionContext::new(&sub_conn).unwrap();
    let sess = sub_conn.session(ycommon::Datastore::Running);

    let changes = Arc::new(AtomicU32::new(0));
    let counter = Arc::clone(&changes);
    let sub_id = ctx
        .subscribe_change(&sess, "m", None, 0, SubscrOptions::DEFAULT, move |ev| {
            if ev.event == EventKind::Change {
                counter.fetch_add(1, Ordering::SeqCst);
            }
            Ok(None)
        })
        .unwrap();

    ctx.suspend(sub_id).unwrap();
    assert!(ctx.is_suspended(sub_id).unwrap());

    let pub_conn = Connection::attach(cfg).unwrap();
    let pub_sess = pub_conn.session(ycommon::Datastore::Running);
    engine::apply_changes(&pub_sess, "m", "/m:cfg", b"skipped").unwrap();
    assert_eq!(changes.load(Ordering::SeqCst), 0);

    ctx.resume(sub_id).unwrap();
    assert!(!ctx.is_suspended(sub_id).unwrap());
    engine::apply_changes(&pub_sess, "m", "/m:cfg", b"seen").unwrap();

    let deadline = std::time::Instant::now() + Duration::from_secs(3);
    while changes.load(Ordering::SeqCst) == 0 && std::time::Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(10));
    }
    assert_eq!(changes.load(Ordering::SeqCst), 1);
}

#[test]
fn dead_subscriber_is_recovered_by_the_next_publisher() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = test_config(&dir);

    // A subscriber that will "crash": no handler thread, so nothing ever
    // replies for it.
    let dead_conn = Connection::attach(cfg.clone()).unwrap();
    let dead_ctx = SubscriptionContext::new(&dead_conn).unwrap();
    let dead_sess = dead_conn.session(ycommon::Datastore::Running);
    dead_ctx
        .subscribe_change(&dead_sess, "m", None, 0, SubscrOptions::NO_THREAD, |_| Ok(None))
        .unwrap();
    let dead_cid = dead_conn.cid();

    // Simulate the crash: the connection slot vanishes, the SHM records
    // stay behind.
    let pub_conn = Connection::attach(cfg).unwrap();
    pub_conn.slots().unregister(dead_cid);
    std::mem::forget(dead_ctx);
    std::mem::forget(dead_sess);
    std::mem::forget(dead_conn);

    // The publisher sweeps the dead record and commits with nobody left.
    let pub_sess = pub_conn.session(ycommon::Datastore::Running);
    let started = std::time::Instant::now();
    engine::apply_changes(&pub_sess, "m", "/m:cfg", b"x").unwrap();
    // No wave was waited for: the commit never saw the dead subscriber.
    assert!(started.elapsed() < Duration::from_millis(1_500));
}

#[test]
fn unsubscribe_all_and_session_teardown() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = test_config(&dir);

    let conn = Connection::attach(cfg.clone()).unwrap();
    let ctx = SubscriptionContext::new(&conn).unwrap();
    let sess = conn.session(ycommon::Datastore::Running);

    let s1 = ctx
        .subscribe_change(&sess, "m", None, 0, SubscrOptions::DEFAULT, |_| Ok(None))
        .unwrap();
    let s2 = ctx
        .subscribe_oper_get(&sess, "m", "/m:state", 0, |_| Ok(vec![]))
        .unwrap();
    assert_eq!(ctx.session_sub_count(&sess), 2);
    assert!(ctx.last_sub_id() >= s2);
    assert_ne!(s1, s2);

    // Zero removes everything in the context.
    ctx.unsubscribe(0).unwrap();
    assert_eq!(ctx.session_sub_count(&sess), 0);

    // A torn-down session takes its subscriptions with it.
    let sess2 = conn.session(ycommon::Datastore::Running);
    ctx.subscribe_change(&sess2, "m", None, 0, SubscrOptions::DEFAULT, |_| Ok(None))
        .unwrap();
    assert_eq!(ctx.session_sub_count(&sess2), 1);
    drop(sess2);

    // Publishing afterwards finds no subscribers and returns immediately.
    let pub_conn = Connection::attach(cfg).unwrap();
    let pub_sess = pub_conn.session(ycommon::Datastore::Running);
    engine::apply_changes(&pub_sess, "m", "/m:cfg", b"x").unwrap();
}

#[test]
fn enabled_subscription_failure_rolls_back() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = test_config(&dir);

    let conn = Connection::attach(cfg).unwrap();
    let ctx = SubscriptionContext::new(&conn).unwrap();
    let sess = conn.session(ycommon::Datastore::Running);

    let err = ctx
        .subscribe_change(&sess, "m", None, 0, SubscrOptions::ENABLED, |ev| {
            if ev.event == EventKind::Enabled {
                Err(ErrorItem::new(ErrorCode::OperationFailed, "no startup data"))
            } else {
                Ok(None)
            }
        })
        .unwrap_err();
    assert!(matches!(err, SubscrError::Callback(_)));
    assert_eq!(ctx.session_sub_count(&sess), 0);
}

#[test]
fn staged_session_edit_drives_the_commit() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = test_config(&dir);

    let sub_conn = Connection::attach(cfg.clone()).unwrap();
    let ctx = SubscriptionContext::new(&sub_conn).unwrap();
    let sess = sub_conn.session(ycommon::Datastore::Running);

    let rec = Recorder::default();
    let rec_cb = rec.clone();
    let sub_id = ctx
        .subscribe_change(&sess, "m", None, 0, SubscrOptions::DEFAULT, move |ev| {
            if ev.event == EventKind::Change {
                rec_cb.push(ev.sub_id, String::from_utf8_lossy(ev.diff).into_owned());
            }
            Ok(None)
        })
        .unwrap();

    let pub_conn = Connection::attach(cfg).unwrap();
    let pub_sess = pub_conn.session(ycommon::Datastore::Running);
    pub_sess.stage_edit("/m:cfg/a", b"a=1");
    pub_sess.apply_changes("m").unwrap();

    assert!(rec.wait_for(sub_id, "a=1", Duration::from_secs(3)));
    // Applying without a staged edit is an error.
    assert_eq!(
        pub_sess.apply_changes("m").unwrap_err().code(),
        ErrorCode::InvalArg
    );
}
