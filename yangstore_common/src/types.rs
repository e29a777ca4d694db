//! Core value types shared by all yangstore crates.

use serde::{Deserialize, Serialize};

// ─── Datastores ─────────────────────────────────────────────────────

/// Logical configuration datastores a session can operate on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum Datastore {
    /// Configuration loaded when the device starts.
    Startup = 0,
    /// Current configuration data.
    Running = 1,
    /// Prepared configuration that does not affect the actual one.
    Candidate = 2,
    /// Currently used configuration plus state data.
    Operational = 3,
}

/// Count of all datastore types.
pub const DATASTORE_COUNT: usize = 4;

impl Datastore {
    /// Convert from a raw `u8` value. Returns `None` for invalid values.
    #[inline]
    pub const fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Startup),
            1 => Some(Self::Running),
            2 => Some(Self::Candidate),
            3 => Some(Self::Operational),
            _ => None,
        }
    }

    /// Datastore name as used in channel file names.
    #[inline]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Startup => "startup",
            Self::Running => "running",
            Self::Candidate => "candidate",
            Self::Operational => "operational",
        }
    }
}

// ─── Event kinds ────────────────────────────────────────────────────

/// State-machine cell value of an event channel, also the event type passed
/// to change and RPC callbacks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum EventKind {
    /// Channel idle, no event in flight.
    None = 0,
    /// Update phase: the subscriber may modify the pending diff.
    Update = 1,
    /// Verify phase: the subscriber may still deny the changes.
    Change = 2,
    /// The changes were committed; errors are logged and ignored.
    Done = 3,
    /// A verifier denied the commit; roll back the `Change` processing.
    Abort = 4,
    /// Synchronous delivery of current data at subscribe time.
    Enabled = 5,
    /// Standard RPC/action execution.
    Rpc = 6,
    /// Notification delivery.
    Notif = 7,
    /// Operational data request.
    Oper = 8,
}

impl EventKind {
    /// Convert from the raw channel cell. Returns `None` for values outside
    /// the enum range, which the engine treats as channel corruption.
    #[inline]
    pub const fn from_u32(value: u32) -> Option<Self> {
        match value {
            0 => Some(Self::None),
            1 => Some(Self::Update),
            2 => Some(Self::Change),
            3 => Some(Self::Done),
            4 => Some(Self::Abort),
            5 => Some(Self::Enabled),
            6 => Some(Self::Rpc),
            7 => Some(Self::Notif),
            8 => Some(Self::Oper),
            _ => None,
        }
    }

    /// Event name for logging.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Update => "update",
            Self::Change => "change",
            Self::Done => "done",
            Self::Abort => "abort",
            Self::Enabled => "enabled",
            Self::Rpc => "rpc",
            Self::Notif => "notif",
            Self::Oper => "oper",
        }
    }
}

// ─── Notification kinds ─────────────────────────────────────────────

/// Type of a delivered notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotifKind {
    /// Real-time notification.
    Realtime,
    /// Replayed stored notification.
    Replay,
    /// All stored notifications from the requested interval were delivered.
    ReplayComplete,
    /// The subscription was terminated; always the last notification any
    /// subscription receives.
    Terminated,
    /// The subscription parameters were modified.
    Modified,
    /// The subscription was suspended.
    Suspended,
    /// The subscription was resumed after a suspend.
    Resumed,
}

// ─── Subscription options ───────────────────────────────────────────

/// OR-able subscription option flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SubscrOptions(pub u32);

impl SubscrOptions {
    /// Default behaviour.
    pub const DEFAULT: Self = Self(0);
    /// No handler thread is created; the application drives
    /// `process_events` from its own event loop.
    pub const NO_THREAD: Self = Self(1);
    /// Passive watcher; the subscription does not claim subtree ownership.
    pub const PASSIVE: Self = Self(2);
    /// Only `Done` events are delivered, never `Change`/`Abort`.
    pub const DONE_ONLY: Self = Self(4);
    /// Deliver an `Enabled` event with current data during subscribe.
    pub const ENABLED: Self = Self(8);
    /// Receive the `Update` phase and be allowed to amend the diff.
    pub const UPDATE: Self = Self(16);
    /// Merge operational data into existing nodes instead of replacing.
    pub const OPER_MERGE: Self = Self(32);
    /// Start the handler thread suspended.
    pub const THREAD_SUSPEND: Self = Self(64);

    /// Whether all flags of `other` are set in `self`.
    #[inline]
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

impl std::ops::BitOr for SubscrOptions {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

// ─── Lock modes and ordering ────────────────────────────────────────

/// Mode of a read/upgradable/write lock, held or requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LockMode {
    /// Not holding the lock.
    None,
    /// Shared read access.
    Read,
    /// Shared read access that can be atomically promoted to write.
    ReadUpgr,
    /// Exclusive access.
    Write,
}

/// Lock classes in acquisition order. A thread must never acquire a lock of
/// a class lower than one it already holds; debug builds assert this in the
/// lock primitives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum LockClass {
    /// The registry `subs_lock`.
    Subs = 0,
    /// The main-SHM module table lock.
    ModTable = 1,
    /// A per-kind sublock inside a module record.
    KindSub = 2,
    /// The ext-SHM arena lock.
    ExtShm = 3,
}
