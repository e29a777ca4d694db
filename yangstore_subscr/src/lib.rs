//! # Yangstore Subscriptions
//!
//! The process-local half of the yangstore event system: connections and
//! sessions, the subscription registry, its shared-memory index, the
//! delivery engine and the public subscription context API.
//!
//! Publishers locate the target module in shared memory, enumerate the
//! subscribers other processes published there, seed an event in the
//! per-topic channel and drive the multi-phase protocol. Subscribers hold
//! their callbacks in a [`SubscriptionContext`]; a wake on the context's
//! event pipe makes it walk its channels, run the callbacks and write the
//! replies.

#![warn(clippy::all)]

pub mod conn;
pub mod context;
pub mod engine;
pub mod error;
pub mod types;

mod registry;
mod shm_index;

pub use conn::{Connection, Session};
pub use context::SubscriptionContext;
pub use engine::{apply_changes, get_oper_data, send_notif, send_rpc};
pub use error::{SubscrError, SubscrResult};
pub use types::{
    ChangeCallback, ChangeEvent, NotifCallback, NotifEvent, OperGetCallback, OperGetEvent,
    RpcCallback, RpcEvent,
};
