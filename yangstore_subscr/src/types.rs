//! Callback signatures and the event views handed to them.
//!
//! Trees and diffs are opaque serialized payloads here; parsing them is
//! the schema engine's business. A callback returning an [`ErrorItem`]
//! with the `CallbackShelve` code asks the engine to keep the event
//! pending and retry it on the next event-pipe wake.

use std::sync::Arc;
use std::time::SystemTime;

use ycommon::{ErrorItem, EventKind, NotifKind};

/// View of one change-protocol phase delivered to a change subscriber.
#[derive(Debug)]
pub struct ChangeEvent<'a> {
    /// Subscription the event addresses.
    pub sub_id: u32,
    /// Module whose datastore content changed.
    pub module: &'a str,
    /// XPath given at subscribe time, if any.
    pub xpath: Option<&'a str>,
    /// Protocol phase: `Update`, `Change`, `Done`, `Abort` or `Enabled`.
    pub event: EventKind,
    /// Request ID pairing the phases of one commit.
    pub request_id: u32,
    /// Path of the changed subtree.
    pub path: &'a str,
    /// Serialized diff.
    pub diff: &'a [u8],
    /// Connection that originated the commit.
    pub orig_cid: u32,
    /// Session that originated the commit.
    pub orig_sid: u32,
}

/// Change callback. During `Update` the returned bytes, if any, replace
/// the pending diff for the remaining waves.
pub type ChangeCallback =
    Arc<dyn Fn(&ChangeEvent<'_>) -> Result<Option<Vec<u8>>, ErrorItem> + Send + Sync>;

/// View of an operational get request.
#[derive(Debug)]
pub struct OperGetEvent<'a> {
    /// Subscription the request addresses.
    pub sub_id: u32,
    /// Module the data belongs to.
    pub module: &'a str,
    /// Path given at subscribe time.
    pub path: &'a str,
    /// XPath the requesting client asked for.
    pub request_xpath: &'a str,
    /// Request ID of this exchange.
    pub request_id: u32,
}

/// Operational get callback; returns the serialized subtree.
pub type OperGetCallback =
    Arc<dyn Fn(&OperGetEvent<'_>) -> Result<Vec<u8>, ErrorItem> + Send + Sync>;

/// View of one RPC-protocol phase.
#[derive(Debug)]
pub struct RpcEvent<'a> {
    /// Subscription the event addresses.
    pub sub_id: u32,
    /// Operation path identifying the RPC/action.
    pub path: &'a str,
    /// Protocol phase: `Rpc` or `Abort`.
    pub event: EventKind,
    /// Request ID pairing `Rpc` with a possible `Abort`.
    pub request_id: u32,
    /// Serialized input tree.
    pub input: &'a [u8],
    /// Connection that invoked the operation.
    pub orig_cid: u32,
    /// Session that invoked the operation.
    pub orig_sid: u32,
}

/// RPC callback; on success returns the serialized output tree.
pub type RpcCallback =
    Arc<dyn Fn(&RpcEvent<'_>) -> Result<Vec<u8>, ErrorItem> + Send + Sync>;

/// View of a delivered notification (real or synthetic).
#[derive(Debug)]
pub struct NotifEvent<'a> {
    /// Subscription the notification addresses.
    pub sub_id: u32,
    /// Module the notification belongs to.
    pub module: &'a str,
    /// Notification kind; synthetic kinds carry an empty payload.
    pub kind: NotifKind,
    /// Path of the notification node, empty for synthetic kinds.
    pub path: &'a str,
    /// Serialized notification tree.
    pub payload: &'a [u8],
    /// Generation time of the notification.
    pub timestamp: SystemTime,
}

/// Notification callback. Notifications collect no application errors.
pub type NotifCallback = Arc<dyn Fn(&NotifEvent<'_>) + Send + Sync>;

/// Whether a subscriber xpath covers a changed or notified path. An absent
/// xpath means whole-module interest; otherwise one path must be a
/// '/'-boundary prefix of the other. This is the seam where a schema
/// engine's real XPath evaluation plugs in.
pub fn xpath_covers(xpath: Option<&str>, path: &str) -> bool {
    let Some(xp) = xpath else {
        return true;
    };
    if xp.is_empty() || xp == path {
        return true;
    }
    let boundary_prefix = |shorter: &str, longer: &str| {
        longer.starts_with(shorter) && longer.as_bytes().get(shorter.len()) == Some(&b'/')
    };
    boundary_prefix(xp, path) || boundary_prefix(path, xp)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn absent_xpath_covers_everything() {
        assert!(xpath_covers(None, "/m:cfg/a"));
    }

    #[test]
    fn prefix_matches_respect_boundaries() {
        assert!(xpath_covers(Some("/m:cfg"), "/m:cfg"));
        assert!(xpath_covers(Some("/m:cfg"), "/m:cfg/a"));
        assert!(xpath_covers(Some("/m:cfg/a/b"), "/m:cfg"));
        assert!(!xpath_covers(Some("/m:cfg"), "/m:cfgx"));
        assert!(!xpath_covers(Some("/m:other"), "/m:cfg/a"));
    }
}
