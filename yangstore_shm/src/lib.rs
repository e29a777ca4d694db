//! # Yangstore Shared Memory
//!
//! Process-shared state of one yangstore instance: the main region holding
//! connection slots and the module table, the growable ext region holding
//! per-module subscription arrays, the timed read/upgradable/write lock
//! placed in shared memory, per-topic event channels and the named event
//! pipe used to wake subscribers.
//!
//! All files live under one run directory and start with a 16-byte magic
//! header; peers with an incompatible layout refuse to attach. Offsets, not
//! pointers, are stored throughout, so any process can map the files at any
//! address.
//!
//! ## Crash safety
//!
//! Every lock holder and every subscription record is tagged with the
//! owner's connection ID. Any process that observes a dead CID while
//! waiting for a lock or enumerating subscribers recovers the stale state
//! in place.

#![deny(missing_docs)]
#![warn(clippy::all)]

pub mod channel;
pub mod error;
pub mod evpipe;
pub mod ext;
pub mod platform;
pub mod region;
pub mod rwlock;

pub use channel::{channel_file_name, Channel, ChannelHeader, Reply};
pub use error::{ShmError, ShmResult};
pub use evpipe::EventPipe;
pub use ext::{ExtArray, ExtRecord, ExtShm};
pub use region::{
    str_hash, ChangeSubShm, ConnSlots, MainShm, ModuleShmRecord, NotifSubShm, OperGetSubShm,
    OperPollSubShm, RpcGroupShm, RpcSubShm, RPC_GROUPS_PER_MODULE,
};
pub use rwlock::{CidLiveness, ShmLockGuard, ShmRwLock};
