//! The shared-memory side of the subscription registry.
//!
//! For every registry entry a parallel record lives in ext SHM under the
//! per-kind lock of the owning module record, so publishers in other
//! processes can discover subscribers. Add and delete take the per-kind
//! write lock and transition registry and SHM together; enumeration sweeps
//! records of dead connections in place before snapshotting.

use std::sync::atomic::Ordering;

use ycommon::{Datastore, SubscrOptions};
use yangstore_shm::{
    channel_file_name, str_hash, ChangeSubShm, CidLiveness, ExtArray, ModuleShmRecord,
    NotifSubShm, OperGetSubShm, OperPollSubShm, RpcSubShm, ShmLockGuard,
};
use ycommon::types::{LockClass, LockMode};

use crate::conn::Connection;
use crate::error::{SubscrError, SubscrResult};
use crate::registry::SubKind;

use std::sync::atomic::AtomicU32;

/// Module namespace of an operation path: `/m:ping` → `m`.
pub(crate) fn first_ns(path: &str) -> SubscrResult<&str> {
    let trimmed = path.strip_prefix('/').unwrap_or(path);
    let end = trimmed
        .find(':')
        .ok_or_else(|| SubscrError::InvalArg(format!("path '{path}' has no module prefix")))?;
    if end == 0 {
        return Err(SubscrError::InvalArg(format!("path '{path}' has no module prefix")));
    }
    Ok(&trimmed[..end])
}

pub(crate) fn kind_write<'a>(
    conn: &'a Connection,
    lock: &'a yangstore_shm::ShmRwLock,
) -> SubscrResult<ShmLockGuard<'a>> {
    Ok(lock.lock(
        LockMode::Write,
        conn.config().shm_lock_timeout(),
        conn.cid(),
        LockClass::KindSub,
        &conn.slots(),
    )?)
}

pub(crate) fn kind_read<'a>(
    conn: &'a Connection,
    lock: &'a yangstore_shm::ShmRwLock,
) -> SubscrResult<ShmLockGuard<'a>> {
    Ok(lock.lock(
        LockMode::Read,
        conn.config().shm_lock_timeout(),
        conn.cid(),
        LockClass::KindSub,
        &conn.slots(),
    )?)
}

fn module_rec<'a>(conn: &'a Connection, module: &str) -> SubscrResult<&'a ModuleShmRecord> {
    conn.main()
        .find_or_create_module(module, conn.cid(), &conn.slots())
        .map_err(Into::into)
}

// ─── Publisher-facing target snapshots ──────────────────────────────

/// Change subscriber as seen by a publisher.
#[derive(Debug, Clone)]
pub(crate) struct ChangeTarget {
    pub sub_id: u32,
    pub cid: u32,
    pub evpipe_id: u32,
    pub priority: u32,
    pub opts: SubscrOptions,
    pub suspended: bool,
    pub xpath: Option<String>,
}

/// Operational get subscriber as seen by a publisher.
#[derive(Debug, Clone)]
pub(crate) struct OperGetTarget {
    pub sub_id: u32,
    pub cid: u32,
    pub evpipe_id: u32,
    pub priority: u32,
    pub suspended: bool,
    pub path: String,
    pub path_hash: u32,
}

/// Notification subscriber as seen by a publisher.
#[derive(Debug, Clone)]
pub(crate) struct NotifTarget {
    pub sub_id: u32,
    pub cid: u32,
    pub evpipe_id: u32,
    pub suspended: bool,
}

/// RPC subscriber as seen by a publisher.
#[derive(Debug, Clone)]
pub(crate) struct RpcTarget {
    pub sub_id: u32,
    pub cid: u32,
    pub evpipe_id: u32,
    pub priority: u32,
    pub suspended: bool,
}

// ─── Sweeps ─────────────────────────────────────────────────────────

// Remove records of dead connections in place. Caller holds the kind
// write lock. Returns whether the array emptied.
fn sweep_dead<T, F>(conn: &Connection, arr: &ExtArray, cid_of: F, on_drop: impl Fn(&T)) -> bool
where
    T: yangstore_shm::ExtRecord,
    F: Fn(&T) -> u32,
{
    let slots = conn.slots();
    loop {
        let dead_idx = conn.ext().with_records::<T, _>(arr, |recs| {
            recs.iter().position(|r| !slots.is_alive(cid_of(r)))
        });
        match dead_idx {
            Some(idx) => {
                conn.ext().with_records::<T, _>(arr, |recs| on_drop(&recs[idx]));
                conn.ext().swap_remove_record::<T>(arr, idx);
                tracing::warn!("recovered subscription of dead connection");
            }
            None => break,
        }
    }
    arr.count.load(Ordering::Acquire) == 0
}

fn free_blob(conn: &Connection, off: &AtomicU32, len: &AtomicU32) {
    let off_v = off.load(Ordering::Acquire);
    let len_v = len.load(Ordering::Acquire);
    if off_v != 0 && len_v != 0 {
        conn.ext().free(off_v, len_v as usize);
    }
}

fn unlink_channel(conn: &Connection, module: &str, kind: &str, hash: Option<u32>) {
    let name = channel_file_name(module, kind, hash);
    let _ = std::fs::remove_file(conn.run_dir().join(&name));
    conn.forget_channel(&name);
}

// ─── Change subscriptions ───────────────────────────────────────────

pub(crate) fn change_add(
    conn: &Connection,
    module: &str,
    ds: Datastore,
    sub_id: u32,
    evpipe_id: u32,
    priority: u32,
    opts: SubscrOptions,
    xpath: Option<&str>,
) -> SubscrResult<()> {
    let rec = module_rec(conn, module)?;
    let _guard = kind_write(conn, rec.change_lock(ds))?;

    let (xpath_off, xpath_len) = match xpath {
        Some(xp) if !xp.is_empty() => (
            conn.ext().alloc_bytes(xp.as_bytes(), conn.cid(), &conn.slots())?,
            xp.len() as u32,
        ),
        _ => (0, 0),
    };

    let shm_sub = ChangeSubShm {
        sub_id: AtomicU32::new(sub_id),
        cid: AtomicU32::new(conn.cid()),
        evpipe_id: AtomicU32::new(evpipe_id),
        priority: AtomicU32::new(priority),
        opts: AtomicU32::new(opts.0),
        suspended: AtomicU32::new(0),
        xpath_off: AtomicU32::new(xpath_off),
        xpath_len: AtomicU32::new(xpath_len),
    };
    conn.ext()
        .push_record(rec.change_subs(ds), shm_sub, conn.cid(), &conn.slots())?;
    Ok(())
}

pub(crate) fn change_del(
    conn: &Connection,
    module: &str,
    ds: Datastore,
    sub_id: u32,
) -> SubscrResult<()> {
    let rec = module_rec(conn, module)?;
    let _guard = kind_write(conn, rec.change_lock(ds))?;
    let arr = rec.change_subs(ds);

    let idx = conn
        .ext()
        .with_records::<ChangeSubShm, _>(arr, |recs| {
            recs.iter().position(|r| r.sub_id.load(Ordering::Acquire) == sub_id)
        })
        .ok_or_else(|| SubscrError::NotFound(format!("change subscription {sub_id}")))?;

    conn.ext().with_records::<ChangeSubShm, _>(arr, |recs| {
        free_blob(conn, &recs[idx].xpath_off, &recs[idx].xpath_len);
    });
    conn.ext().swap_remove_record::<ChangeSubShm>(arr, idx);

    if arr.count.load(Ordering::Acquire) == 0 {
        unlink_channel(conn, module, ds.as_str(), None);
    }
    Ok(())
}

/// Snapshot the change subscribers of one module + datastore, sweeping
/// dead ones first. An unregistered module has no subscribers.
pub(crate) fn change_targets(
    conn: &Connection,
    module: &str,
    ds: Datastore,
) -> SubscrResult<Vec<ChangeTarget>> {
    let Some(rec) = conn.main().find_module(module) else {
        return Ok(Vec::new());
    };
    let _guard = kind_write(conn, rec.change_lock(ds))?;
    let arr = rec.change_subs(ds);

    let emptied = sweep_dead::<ChangeSubShm, _>(
        conn,
        arr,
        |r| r.cid.load(Ordering::Acquire),
        |r| free_blob(conn, &r.xpath_off, &r.xpath_len),
    );
    if emptied {
        unlink_channel(conn, module, ds.as_str(), None);
        return Ok(Vec::new());
    }

    let raw = conn.ext().with_records::<ChangeSubShm, _>(arr, |recs| {
        recs.iter()
            .map(|r| {
                (
                    r.sub_id.load(Ordering::Acquire),
                    r.cid.load(Ordering::Acquire),
                    r.evpipe_id.load(Ordering::Acquire),
                    r.priority.load(Ordering::Acquire),
                    r.opts.load(Ordering::Acquire),
                    r.suspended.load(Ordering::Acquire),
                    r.xpath_off.load(Ordering::Acquire),
                    r.xpath_len.load(Ordering::Acquire),
                )
            })
            .collect::<Vec<_>>()
    });
    Ok(raw
        .into_iter()
        .map(|(sub_id, cid, evpipe_id, priority, opts, suspended, xoff, xlen)| ChangeTarget {
            sub_id,
            cid,
            evpipe_id,
            priority,
            opts: SubscrOptions(opts),
            suspended: suspended != 0,
            xpath: (xlen > 0).then(|| {
                String::from_utf8_lossy(&conn.ext().read_bytes(xoff, xlen as usize)).into_owned()
            }),
        })
        .collect())
}

// ─── Operational get subscriptions ──────────────────────────────────

pub(crate) fn oper_get_add(
    conn: &Connection,
    module: &str,
    path: &str,
    sub_id: u32,
    evpipe_id: u32,
    priority: u32,
) -> SubscrResult<u32> {
    let rec = module_rec(conn, module)?;
    let _guard = kind_write(conn, &rec.oper_get_lock)?;
    let arr = &rec.oper_get_subs;

    let hash = str_hash(path, priority);
    // Two subscribers racing for one (path, priority) topic: the loser is
    // rejected, its channel name would collide.
    let taken = conn.ext().with_records::<OperGetSubShm, _>(arr, |recs| {
        recs.iter()
            .any(|r| r.path_hash.load(Ordering::Acquire) == hash)
    });
    if taken {
        return Err(SubscrError::Exists(format!(
            "operational get provider for '{path}' at priority {priority}"
        )));
    }

    let path_off = conn.ext().alloc_bytes(path.as_bytes(), conn.cid(), &conn.slots())?;
    let shm_sub = OperGetSubShm {
        sub_id: AtomicU32::new(sub_id),
        cid: AtomicU32::new(conn.cid()),
        evpipe_id: AtomicU32::new(evpipe_id),
        priority: AtomicU32::new(priority),
        suspended: AtomicU32::new(0),
        path_off: AtomicU32::new(path_off),
        path_len: AtomicU32::new(path.len() as u32),
        path_hash: AtomicU32::new(hash),
    };
    conn.ext().push_record(arr, shm_sub, conn.cid(), &conn.slots())?;
    Ok(hash)
}

pub(crate) fn oper_get_del(conn: &Connection, module: &str, sub_id: u32) -> SubscrResult<()> {
    let rec = module_rec(conn, module)?;
    let _guard = kind_write(conn, &rec.oper_get_lock)?;
    let arr = &rec.oper_get_subs;

    let found = conn.ext().with_records::<OperGetSubShm, _>(arr, |recs| {
        recs.iter()
            .position(|r| r.sub_id.load(Ordering::Acquire) == sub_id)
            .map(|idx| (idx, recs[idx].path_hash.load(Ordering::Acquire)))
    });
    let (idx, hash) =
        found.ok_or_else(|| SubscrError::NotFound(format!("oper get subscription {sub_id}")))?;

    conn.ext().with_records::<OperGetSubShm, _>(arr, |recs| {
        free_blob(conn, &recs[idx].path_off, &recs[idx].path_len);
    });
    conn.ext().swap_remove_record::<OperGetSubShm>(arr, idx);
    // Oper-get channels are per subscription; the topic dies with it.
    unlink_channel(conn, module, "oper", Some(hash));
    Ok(())
}

pub(crate) fn oper_get_targets(conn: &Connection, module: &str) -> SubscrResult<Vec<OperGetTarget>> {
    let Some(rec) = conn.main().find_module(module) else {
        return Ok(Vec::new());
    };
    let _guard = kind_write(conn, &rec.oper_get_lock)?;
    let arr = &rec.oper_get_subs;

    sweep_dead::<OperGetSubShm, _>(
        conn,
        arr,
        |r| r.cid.load(Ordering::Acquire),
        |r| free_blob(conn, &r.path_off, &r.path_len),
    );

    let raw = conn.ext().with_records::<OperGetSubShm, _>(arr, |recs| {
        recs.iter()
            .map(|r| {
                (
                    r.sub_id.load(Ordering::Acquire),
                    r.cid.load(Ordering::Acquire),
                    r.evpipe_id.load(Ordering::Acquire),
                    r.priority.load(Ordering::Acquire),
                    r.suspended.load(Ordering::Acquire),
                    r.path_off.load(Ordering::Acquire),
                    r.path_len.load(Ordering::Acquire),
                    r.path_hash.load(Ordering::Acquire),
                )
            })
            .collect::<Vec<_>>()
    });
    Ok(raw
        .into_iter()
        .map(|(sub_id, cid, evpipe_id, priority, suspended, poff, plen, path_hash)| OperGetTarget {
            sub_id,
            cid,
            evpipe_id,
            priority,
            suspended: suspended != 0,
            path: String::from_utf8_lossy(&conn.ext().read_bytes(poff, plen as usize)).into_owned(),
            path_hash,
        })
        .collect())
}

// ─── Operational poll subscriptions ─────────────────────────────────

pub(crate) fn oper_poll_add(
    conn: &Connection,
    module: &str,
    path: &str,
    sub_id: u32,
    valid_ms: u32,
    opts: SubscrOptions,
) -> SubscrResult<()> {
    let rec = module_rec(conn, module)?;
    let _guard = kind_write(conn, &rec.oper_poll_lock)?;

    let path_off = conn.ext().alloc_bytes(path.as_bytes(), conn.cid(), &conn.slots())?;
    let shm_sub = OperPollSubShm {
        sub_id: AtomicU32::new(sub_id),
        cid: AtomicU32::new(conn.cid()),
        valid_ms: AtomicU32::new(valid_ms),
        opts: AtomicU32::new(opts.0),
        suspended: AtomicU32::new(0),
        path_off: AtomicU32::new(path_off),
        path_len: AtomicU32::new(path.len() as u32),
        _reserved: AtomicU32::new(0),
    };
    conn.ext()
        .push_record(&rec.oper_poll_subs, shm_sub, conn.cid(), &conn.slots())?;
    Ok(())
}

pub(crate) fn oper_poll_del(conn: &Connection, module: &str, sub_id: u32) -> SubscrResult<()> {
    let rec = module_rec(conn, module)?;
    let _guard = kind_write(conn, &rec.oper_poll_lock)?;
    let arr = &rec.oper_poll_subs;

    let idx = conn
        .ext()
        .with_records::<OperPollSubShm, _>(arr, |recs| {
            recs.iter().position(|r| r.sub_id.load(Ordering::Acquire) == sub_id)
        })
        .ok_or_else(|| SubscrError::NotFound(format!("oper poll subscription {sub_id}")))?;

    conn.ext().with_records::<OperPollSubShm, _>(arr, |recs| {
        free_blob(conn, &recs[idx].path_off, &recs[idx].path_len);
    });
    conn.ext().swap_remove_record::<OperPollSubShm>(arr, idx);
    Ok(())
}

// ─── Notification subscriptions ─────────────────────────────────────

pub(crate) fn notif_add(
    conn: &Connection,
    module: &str,
    sub_id: u32,
    evpipe_id: u32,
) -> SubscrResult<()> {
    let rec = module_rec(conn, module)?;
    let _guard = kind_write(conn, &rec.notif_lock)?;

    let shm_sub = NotifSubShm {
        sub_id: AtomicU32::new(sub_id),
        cid: AtomicU32::new(conn.cid()),
        evpipe_id: AtomicU32::new(evpipe_id),
        suspended: AtomicU32::new(0),
    };
    conn.ext()
        .push_record(&rec.notif_subs, shm_sub, conn.cid(), &conn.slots())?;
    Ok(())
}

pub(crate) fn notif_del(conn: &Connection, module: &str, sub_id: u32) -> SubscrResult<()> {
    let rec = module_rec(conn, module)?;
    let _guard = kind_write(conn, &rec.notif_lock)?;
    let arr = &rec.notif_subs;

    let idx = conn
        .ext()
        .with_records::<NotifSubShm, _>(arr, |recs| {
            recs.iter().position(|r| r.sub_id.load(Ordering::Acquire) == sub_id)
        })
        .ok_or_else(|| SubscrError::NotFound(format!("notif subscription {sub_id}")))?;

    conn.ext().swap_remove_record::<NotifSubShm>(arr, idx);
    if arr.count.load(Ordering::Acquire) == 0 {
        unlink_channel(conn, module, "notif", None);
    }
    Ok(())
}

pub(crate) fn notif_targets(conn: &Connection, module: &str) -> SubscrResult<Vec<NotifTarget>> {
    let Some(rec) = conn.main().find_module(module) else {
        return Ok(Vec::new());
    };
    let _guard = kind_write(conn, &rec.notif_lock)?;
    let arr = &rec.notif_subs;

    let emptied = sweep_dead::<NotifSubShm, _>(
        conn,
        arr,
        |r| r.cid.load(Ordering::Acquire),
        |_| {},
    );
    if emptied {
        unlink_channel(conn, module, "notif", None);
        return Ok(Vec::new());
    }

    Ok(conn.ext().with_records::<NotifSubShm, _>(arr, |recs| {
        recs.iter()
            .map(|r| NotifTarget {
                sub_id: r.sub_id.load(Ordering::Acquire),
                cid: r.cid.load(Ordering::Acquire),
                evpipe_id: r.evpipe_id.load(Ordering::Acquire),
                suspended: r.suspended.load(Ordering::Acquire) != 0,
            })
            .collect()
    }))
}

// ─── RPC/action subscriptions ───────────────────────────────────────

pub(crate) fn rpc_add(
    conn: &Connection,
    path: &str,
    is_ext: bool,
    xpath: &str,
    sub_id: u32,
    evpipe_id: u32,
    priority: u32,
) -> SubscrResult<()> {
    let module = first_ns(path)?.to_string();
    let rec = module_rec(conn, &module)?;
    let _guard = kind_write(conn, &rec.rpc_lock)?;

    let hash = str_hash(path, 0);
    let group = match rec.rpc_group(hash) {
        Some(g) => g,
        None => {
            let g = rec.rpc_group_alloc().ok_or_else(|| SubscrError::Shm(
                yangstore_shm::ShmError::NoMemory {
                    what: format!("RPC group slots of module '{module}'"),
                },
            ))?;
            let path_off = conn.ext().alloc_bytes(path.as_bytes(), conn.cid(), &conn.slots())?;
            g.path_off.store(path_off, Ordering::Release);
            g.path_hash.store(hash, Ordering::Release);
            g.is_ext.store(is_ext as u32, Ordering::Release);
            // Non-zero length publishes the slot.
            g.path_len.store(path.len() as u32, Ordering::Release);
            g
        }
    };

    let xpath_off = conn.ext().alloc_bytes(xpath.as_bytes(), conn.cid(), &conn.slots())?;
    let shm_sub = RpcSubShm {
        sub_id: AtomicU32::new(sub_id),
        cid: AtomicU32::new(conn.cid()),
        evpipe_id: AtomicU32::new(evpipe_id),
        priority: AtomicU32::new(priority),
        suspended: AtomicU32::new(0),
        xpath_off: AtomicU32::new(xpath_off),
        xpath_len: AtomicU32::new(xpath.len() as u32),
        _reserved: AtomicU32::new(0),
    };
    conn.ext().push_record(&group.subs, shm_sub, conn.cid(), &conn.slots())?;
    Ok(())
}

pub(crate) fn rpc_del(conn: &Connection, path: &str, sub_id: u32) -> SubscrResult<()> {
    let module = first_ns(path)?.to_string();
    let rec = module_rec(conn, &module)?;
    let _guard = kind_write(conn, &rec.rpc_lock)?;

    let hash = str_hash(path, 0);
    let group = rec
        .rpc_group(hash)
        .ok_or_else(|| SubscrError::NotFound(format!("RPC subscriptions for '{path}'")))?;

    let idx = conn
        .ext()
        .with_records::<RpcSubShm, _>(&group.subs, |recs| {
            recs.iter().position(|r| r.sub_id.load(Ordering::Acquire) == sub_id)
        })
        .ok_or_else(|| SubscrError::NotFound(format!("RPC subscription {sub_id}")))?;

    conn.ext().with_records::<RpcSubShm, _>(&group.subs, |recs| {
        free_blob(conn, &recs[idx].xpath_off, &recs[idx].xpath_len);
    });
    conn.ext().swap_remove_record::<RpcSubShm>(&group.subs, idx);

    if group.subs.count.load(Ordering::Acquire) == 0 {
        free_blob(conn, &group.path_off, &group.path_len);
        group.clear();
        unlink_channel(conn, &module, "rpc", Some(hash));
    }
    Ok(())
}

pub(crate) fn rpc_targets(conn: &Connection, path: &str) -> SubscrResult<Vec<RpcTarget>> {
    let module = first_ns(path)?.to_string();
    let Some(rec) = conn.main().find_module(&module) else {
        return Ok(Vec::new());
    };
    let _guard = kind_write(conn, &rec.rpc_lock)?;

    let hash = str_hash(path, 0);
    let Some(group) = rec.rpc_group(hash) else {
        return Ok(Vec::new());
    };

    let emptied = sweep_dead::<RpcSubShm, _>(
        conn,
        &group.subs,
        |r| r.cid.load(Ordering::Acquire),
        |r| free_blob(conn, &r.xpath_off, &r.xpath_len),
    );
    if emptied {
        free_blob(conn, &group.path_off, &group.path_len);
        group.clear();
        unlink_channel(conn, &module, "rpc", Some(hash));
        return Ok(Vec::new());
    }

    Ok(conn.ext().with_records::<RpcSubShm, _>(&group.subs, |recs| {
        recs.iter()
            .map(|r| RpcTarget {
                sub_id: r.sub_id.load(Ordering::Acquire),
                cid: r.cid.load(Ordering::Acquire),
                evpipe_id: r.evpipe_id.load(Ordering::Acquire),
                priority: r.priority.load(Ordering::Acquire),
                suspended: r.suspended.load(Ordering::Acquire) != 0,
            })
            .collect()
    }))
}

// ─── Suspended-set snapshots for dispatch ───────────────────────────

/// Suspended change subscription IDs of one module + datastore.
pub(crate) fn change_suspended(
    conn: &Connection,
    module: &str,
    ds: Datastore,
) -> SubscrResult<Vec<u32>> {
    let Some(rec) = conn.main().find_module(module) else {
        return Ok(Vec::new());
    };
    let _guard = kind_read(conn, rec.change_lock(ds))?;
    Ok(conn.ext().with_records::<ChangeSubShm, _>(rec.change_subs(ds), |recs| {
        recs.iter()
            .filter(|r| r.suspended.load(Ordering::Acquire) != 0)
            .map(|r| r.sub_id.load(Ordering::Acquire))
            .collect()
    }))
}

/// Suspended notification subscription IDs of one module.
pub(crate) fn notif_suspended(conn: &Connection, module: &str) -> SubscrResult<Vec<u32>> {
    let Some(rec) = conn.main().find_module(module) else {
        return Ok(Vec::new());
    };
    let _guard = kind_read(conn, &rec.notif_lock)?;
    Ok(conn.ext().with_records::<NotifSubShm, _>(&rec.notif_subs, |recs| {
        recs.iter()
            .filter(|r| r.suspended.load(Ordering::Acquire) != 0)
            .map(|r| r.sub_id.load(Ordering::Acquire))
            .collect()
    }))
}

/// Suspended RPC subscription IDs of one operation path.
pub(crate) fn rpc_suspended(conn: &Connection, path: &str) -> SubscrResult<Vec<u32>> {
    let module = first_ns(path)?.to_string();
    let Some(rec) = conn.main().find_module(&module) else {
        return Ok(Vec::new());
    };
    let _guard = kind_read(conn, &rec.rpc_lock)?;
    let Some(group) = rec.rpc_group(str_hash(path, 0)) else {
        return Ok(Vec::new());
    };
    Ok(conn.ext().with_records::<RpcSubShm, _>(&group.subs, |recs| {
        recs.iter()
            .filter(|r| r.suspended.load(Ordering::Acquire) != 0)
            .map(|r| r.sub_id.load(Ordering::Acquire))
            .collect()
    }))
}

// ─── Suspension ─────────────────────────────────────────────────────

/// Set or clear the `suspended` atomic of a subscription's SHM record.
/// Returns the previous value.
pub(crate) fn set_suspended(
    conn: &Connection,
    kind: SubKind,
    key: &str,
    ds: Option<Datastore>,
    sub_id: u32,
    suspended: bool,
) -> SubscrResult<bool> {
    let flag = suspended as u32;
    let flip = |arr_suspended: &AtomicU32| arr_suspended.swap(flag, Ordering::AcqRel) != 0;

    match kind {
        SubKind::Change => {
            let rec = module_rec(conn, key)?;
            let ds = ds.unwrap_or(Datastore::Running);
            let _guard = kind_write(conn, rec.change_lock(ds))?;
            conn.ext()
                .with_records::<ChangeSubShm, _>(rec.change_subs(ds), |recs| {
                    recs.iter()
                        .find(|r| r.sub_id.load(Ordering::Acquire) == sub_id)
                        .map(|r| flip(&r.suspended))
                })
                .ok_or_else(|| SubscrError::NotFound(format!("subscription {sub_id}")))
        }
        SubKind::OperGet => {
            let rec = module_rec(conn, key)?;
            let _guard = kind_write(conn, &rec.oper_get_lock)?;
            conn.ext()
                .with_records::<OperGetSubShm, _>(&rec.oper_get_subs, |recs| {
                    recs.iter()
                        .find(|r| r.sub_id.load(Ordering::Acquire) == sub_id)
                        .map(|r| flip(&r.suspended))
                })
                .ok_or_else(|| SubscrError::NotFound(format!("subscription {sub_id}")))
        }
        SubKind::OperPoll => {
            let rec = module_rec(conn, key)?;
            let _guard = kind_write(conn, &rec.oper_poll_lock)?;
            conn.ext()
                .with_records::<OperPollSubShm, _>(&rec.oper_poll_subs, |recs| {
                    recs.iter()
                        .find(|r| r.sub_id.load(Ordering::Acquire) == sub_id)
                        .map(|r| flip(&r.suspended))
                })
                .ok_or_else(|| SubscrError::NotFound(format!("subscription {sub_id}")))
        }
        SubKind::Notif => {
            let rec = module_rec(conn, key)?;
            let _guard = kind_write(conn, &rec.notif_lock)?;
            conn.ext()
                .with_records::<NotifSubShm, _>(&rec.notif_subs, |recs| {
                    recs.iter()
                        .find(|r| r.sub_id.load(Ordering::Acquire) == sub_id)
                        .map(|r| flip(&r.suspended))
                })
                .ok_or_else(|| SubscrError::NotFound(format!("subscription {sub_id}")))
        }
        SubKind::Rpc => {
            let module = first_ns(key)?.to_string();
            let rec = module_rec(conn, &module)?;
            let _guard = kind_write(conn, &rec.rpc_lock)?;
            let group = rec
                .rpc_group(str_hash(key, 0))
                .ok_or_else(|| SubscrError::NotFound(format!("RPC subscriptions for '{key}'")))?;
            conn.ext()
                .with_records::<RpcSubShm, _>(&group.subs, |recs| {
                    recs.iter()
                        .find(|r| r.sub_id.load(Ordering::Acquire) == sub_id)
                        .map(|r| flip(&r.suspended))
                })
                .ok_or_else(|| SubscrError::NotFound(format!("subscription {sub_id}")))
        }
    }
}

/// Read the `suspended` atomic of a subscription's SHM record.
pub(crate) fn is_suspended(
    conn: &Connection,
    kind: SubKind,
    key: &str,
    ds: Option<Datastore>,
    sub_id: u32,
) -> SubscrResult<bool> {
    let check = |arr_suspended: &AtomicU32| arr_suspended.load(Ordering::Acquire) != 0;

    match kind {
        SubKind::Change => {
            let rec = module_rec(conn, key)?;
            let ds = ds.unwrap_or(Datastore::Running);
            let _guard = kind_read(conn, rec.change_lock(ds))?;
            conn.ext()
                .with_records::<ChangeSubShm, _>(rec.change_subs(ds), |recs| {
                    recs.iter()
                        .find(|r| r.sub_id.load(Ordering::Acquire) == sub_id)
                        .map(|r| check(&r.suspended))
                })
                .ok_or_else(|| SubscrError::NotFound(format!("subscription {sub_id}")))
        }
        SubKind::OperGet => {
            let rec = module_rec(conn, key)?;
            let _guard = kind_read(conn, &rec.oper_get_lock)?;
            conn.ext()
                .with_records::<OperGetSubShm, _>(&rec.oper_get_subs, |recs| {
                    recs.iter()
                        .find(|r| r.sub_id.load(Ordering::Acquire) == sub_id)
                        .map(|r| check(&r.suspended))
                })
                .ok_or_else(|| SubscrError::NotFound(format!("subscription {sub_id}")))
        }
        SubKind::OperPoll => {
            let rec = module_rec(conn, key)?;
            let _guard = kind_read(conn, &rec.oper_poll_lock)?;
            conn.ext()
                .with_records::<OperPollSubShm, _>(&rec.oper_poll_subs, |recs| {
                    recs.iter()
                        .find(|r| r.sub_id.load(Ordering::Acquire) == sub_id)
                        .map(|r| check(&r.suspended))
                })
                .ok_or_else(|| SubscrError::NotFound(format!("subscription {sub_id}")))
        }
        SubKind::Notif => {
            let rec = module_rec(conn, key)?;
            let _guard = kind_read(conn, &rec.notif_lock)?;
            conn.ext()
                .with_records::<NotifSubShm, _>(&rec.notif_subs, |recs| {
                    recs.iter()
                        .find(|r| r.sub_id.load(Ordering::Acquire) == sub_id)
                        .map(|r| check(&r.suspended))
                })
                .ok_or_else(|| SubscrError::NotFound(format!("subscription {sub_id}")))
        }
        SubKind::Rpc => {
            let module = first_ns(key)?.to_string();
            let rec = module_rec(conn, &module)?;
            let _guard = kind_read(conn, &rec.rpc_lock)?;
            let group = rec
                .rpc_group(str_hash(key, 0))
                .ok_or_else(|| SubscrError::NotFound(format!("RPC subscriptions for '{key}'")))?;
            conn.ext()
                .with_records::<RpcSubShm, _>(&group.subs, |recs| {
                    recs.iter()
                        .find(|r| r.sub_id.load(Ordering::Acquire) == sub_id)
                        .map(|r| check(&r.suspended))
                })
                .ok_or_else(|| SubscrError::NotFound(format!("subscription {sub_id}")))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_ns_extracts_the_module() {
        assert_eq!(first_ns("/m:ping").unwrap(), "m");
        assert_eq!(first_ns("/ietf-interfaces:reset").unwrap(), "ietf-interfaces");
        assert!(first_ns("/noprefix").is_err());
        assert!(first_ns("/:bad").is_err());
    }
}
