//! Cross-attachment tests of the shared regions: two independently mapped
//! views of one run directory must observe each other's state, the way
//! separate processes do.

use std::sync::atomic::Ordering;
use std::time::Duration;

use ycommon::types::{LockClass, LockMode};
use ycommon::Datastore;
use yangstore_shm::{Channel, CidLiveness, EventPipe, ExtShm, MainShm};

const T: Duration = Duration::from_secs(1);

fn open_pair(dir: &tempfile::TempDir) -> (MainShm, MainShm) {
    let a = MainShm::open(dir.path(), 32, T).unwrap();
    let b = MainShm::open(dir.path(), 32, T).unwrap();
    (a, b)
}

#[test]
fn peers_share_counters_and_modules() {
    let dir = tempfile::tempdir().unwrap();
    let (a, b) = open_pair(&dir);

    let cid_a = a.alloc_cid();
    let cid_b = b.alloc_cid();
    assert_ne!(cid_a, cid_b);

    a.conn_slots().register(cid_a, std::process::id()).unwrap();
    assert!(b.conn_slots().is_alive(cid_a));

    a.find_or_create_module("net", cid_a, &a.conn_slots()).unwrap();
    let rec_b = b.find_module("net").expect("peer sees the module");
    assert_eq!(rec_b.name(), "net");
}

#[test]
fn kind_lock_is_shared_between_attachments() {
    let dir = tempfile::tempdir().unwrap();
    let (a, b) = open_pair(&dir);

    let cid_a = a.alloc_cid();
    let cid_b = b.alloc_cid();
    a.conn_slots().register(cid_a, std::process::id()).unwrap();
    b.conn_slots().register(cid_b, std::process::id()).unwrap();

    let rec_a = a.find_or_create_module("net", cid_a, &a.conn_slots()).unwrap();
    let rec_b = b.find_module("net").unwrap();

    let guard = rec_a
        .change_lock(Datastore::Running)
        .lock(LockMode::Write, T, cid_a, LockClass::KindSub, &a.conn_slots())
        .unwrap();

    // The same lock cell through the other mapping is busy.
    let blocked = rec_b.change_lock(Datastore::Running).lock(
        LockMode::Write,
        Duration::from_millis(50),
        cid_b,
        LockClass::KindSub,
        &b.conn_slots(),
    );
    assert!(blocked.is_err());

    drop(guard);
    rec_b
        .change_lock(Datastore::Running)
        .lock(LockMode::Write, T, cid_b, LockClass::KindSub, &b.conn_slots())
        .unwrap();
}

#[test]
fn dead_holder_is_recovered_through_the_slot_table() {
    let dir = tempfile::tempdir().unwrap();
    let (a, b) = open_pair(&dir);

    let cid_dead = a.alloc_cid();
    // A connection whose pid cannot exist: registered, then "crashes".
    a.conn_slots().register(cid_dead, 0x3FFF_FFFF).unwrap();

    let rec = a.find_or_create_module("net", cid_dead, &a.conn_slots()).unwrap();
    let guard = rec
        .notif_lock
        .lock(LockMode::Write, T, cid_dead, LockClass::KindSub, &a.conn_slots())
        .unwrap();
    std::mem::forget(guard);

    let cid_b = b.alloc_cid();
    b.conn_slots().register(cid_b, std::process::id()).unwrap();
    let rec_b = b.find_module("net").unwrap();
    // The waiter probes liveness, finds the dead CID and recovers.
    rec_b
        .notif_lock
        .lock(LockMode::Write, T, cid_b, LockClass::KindSub, &b.conn_slots())
        .unwrap();
}

#[test]
fn ext_growth_is_visible_to_peers() {
    let dir = tempfile::tempdir().unwrap();
    let _main = MainShm::open(dir.path(), 32, T).unwrap();
    let ext_a = ExtShm::open(dir.path(), T).unwrap();
    let ext_b = ExtShm::open(dir.path(), T).unwrap();

    struct AllAlive;
    impl yangstore_shm::CidLiveness for AllAlive {
        fn is_alive(&self, _cid: u32) -> bool {
            true
        }
    }

    // Grow well past the initial size from attachment A.
    let mut last = 0;
    for _ in 0..40 {
        last = ext_a.alloc_bytes(&[0xEE; 8192], 1, &AllAlive).unwrap();
    }
    ext_a.alloc_bytes(b"fence", 1, &AllAlive).unwrap();

    // Attachment B lazily remaps and reads data beyond its original map.
    assert_eq!(ext_b.read_bytes(last, 4), vec![0xEE; 4]);
}

#[test]
fn channel_exchange_between_attachments() {
    let dir = tempfile::tempdir().unwrap();
    let publisher = Channel::open(dir.path(), "net", "running", None).unwrap();
    let subscriber = Channel::open(dir.path(), "net", "running", None).unwrap();

    publisher
        .write_event(ycommon::EventKind::Change, 1, 0, 1, 1, b"diff", 1)
        .unwrap();

    let (kind, req, _, payload) = subscriber.read_event().unwrap();
    assert_eq!(kind, ycommon::EventKind::Change);
    assert_eq!(payload, b"diff");
    subscriber
        .write_reply(kind, req, 7, 0, "", b"")
        .unwrap();

    assert!(publisher.wait_acked(1, T).unwrap());
    let replies = publisher.read_replies().unwrap();
    assert_eq!(replies.len(), 1);
    assert_eq!(replies[0].sub_id, 7);
}

#[test]
fn commit_claim_serializes_publishers() {
    let dir = tempfile::tempdir().unwrap();
    let ch_a = Channel::open(dir.path(), "net", "running", None).unwrap();
    let ch_b = Channel::open(dir.path(), "net", "running", None).unwrap();

    struct AllAlive;
    impl yangstore_shm::CidLiveness for AllAlive {
        fn is_alive(&self, _cid: u32) -> bool {
            true
        }
    }
    struct NoneAlive;
    impl yangstore_shm::CidLiveness for NoneAlive {
        fn is_alive(&self, _cid: u32) -> bool {
            false
        }
    }

    ch_a.claim_commit(1, T, &AllAlive).unwrap();
    assert!(ch_b.claim_commit(2, Duration::from_millis(50), &AllAlive).is_err());
    ch_a.release_commit(1);
    ch_b.claim_commit(2, T, &AllAlive).unwrap();

    // A claim whose owner died is taken over.
    assert!(ch_a.claim_commit(3, T, &NoneAlive).is_ok());
}

#[test]
fn event_pipe_wakes_across_attachments() {
    let dir = tempfile::tempdir().unwrap();
    let owner = EventPipe::create(dir.path(), 9).unwrap();
    let publisher = EventPipe::open(dir.path(), 9).unwrap();

    let waiter = std::thread::spawn(move || owner.wait(Duration::from_secs(2)));
    std::thread::sleep(Duration::from_millis(20));
    publisher.notify();
    assert!(waiter.join().unwrap());
}

#[test]
fn rwlock_contention_across_threads_on_mapped_memory() {
    let dir = tempfile::tempdir().unwrap();
    let main = std::sync::Arc::new(MainShm::open(dir.path(), 8, T).unwrap());

    let cid = main.alloc_cid();
    main.conn_slots().register(cid, std::process::id()).unwrap();
    main.find_or_create_module("contended", cid, &main.conn_slots()).unwrap();

    let mut handles = Vec::new();
    for worker_cid in 100..104u32 {
        let main = std::sync::Arc::clone(&main);
        handles.push(std::thread::spawn(move || {
            main.conn_slots().register(worker_cid, std::process::id()).unwrap();
            let rec = main.find_module("contended").unwrap();
            for _ in 0..100 {
                let mut guard = rec
                    .oper_get_lock
                    .lock(
                        LockMode::ReadUpgr,
                        Duration::from_secs(5),
                        worker_cid,
                        LockClass::KindSub,
                        &main.conn_slots(),
                    )
                    .unwrap();
                guard.upgrade(Duration::from_secs(5), &main.conn_slots()).unwrap();
                rec.last_oper_change.fetch_add(1, Ordering::AcqRel);
                guard.downgrade();
            }
            main.conn_slots().unregister(worker_cid);
        }));
    }
    for h in handles {
        h.join().unwrap();
    }
    let rec = main.find_module("contended").unwrap();
    assert_eq!(rec.last_oper_change.load(Ordering::Acquire), 400);
}
