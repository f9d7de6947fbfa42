//! Classifies decoded envelopes and picks the callback that receives them.
//!
//! Routing runs under the registry lock and only decides *who* gets *what*;
//! the caller invokes the callback after releasing the lock.

use tracing::{debug, warn};

use crate::registry::Registry;
use crate::rpc::protocol::{correlation_id, unwrap_notification, Envelope};
use crate::types::{Callback, Response};

/// A callback paired with the envelope it should receive.
#[derive(Debug)]
pub struct Delivery {
    pub callback: Callback,
    pub response: Response,
}

/// Route one envelope. `None` means it was dropped (and logged): unknown or
/// already-resolved reply ids, error notifications, malformed or orphan
/// notifications. None of these are fatal for the connection.
pub fn route(registry: &mut Registry, envelope: Envelope) -> Option<Delivery> {
    let Envelope {
        id,
        method,
        params,
        result,
        error,
    } = envelope;

    if let Some(error) = error {
        warn!(rpc.id = ?id, rpc.method = ?method, error = %error, "received error");
        let Some(raw_id) = id else {
            warn!("dropping error without id");
            return None;
        };
        let id = reply_id(&raw_id)?;
        let entry = resolve(registry, id)?;
        return Some(Delivery {
            callback: entry.callback,
            response: Response {
                method: entry.method,
                params: entry.params,
                result: None,
                error: Some(error),
                id: Some(id),
            },
        });
    }

    if let Some(raw_id) = id {
        let id = reply_id(&raw_id)?;
        let entry = resolve(registry, id)?;
        debug!(rpc.id = id, rpc.method = %entry.method, "reply");
        return Some(Delivery {
            callback: entry.callback,
            response: Response {
                method: entry.method,
                params: entry.params,
                result,
                error: None,
                id: Some(id),
            },
        });
    }

    let Some(method) = method else {
        warn!("dropping message with neither id nor method");
        return None;
    };
    let Some((params, unwrapped)) = unwrap_notification(&method, params.unwrap_or_default())
    else {
        warn!(rpc.method = %method, "dropping notification with malformed params");
        return None;
    };

    let Some(callback) = registry.subscriptions.route(&method, &params) else {
        warn!(
            rpc.method = %method,
            rpc.params = %serde_json::Value::Array(params),
            subscribers = registry.subscriptions.len(),
            "received unexpected notification"
        );
        return None;
    };

    debug!(rpc.method = %method, "notification");
    Some(Delivery {
        callback,
        response: Response {
            method,
            params,
            result: unwrapped.or(result),
            error: None,
            id: None,
        },
    })
}

fn reply_id(raw: &serde_json::Value) -> Option<u64> {
    let id = correlation_id(raw);
    if id.is_none() {
        warn!(rpc.id = %raw, "dropping reply with an id this client never issues");
    }
    id
}

fn resolve(registry: &mut Registry, id: u64) -> Option<crate::registry::PendingEntry> {
    let entry = registry.pending.resolve(id);
    if entry.is_none() {
        warn!(rpc.id = id, "dropping reply for unknown or already resolved id");
    }
    entry
}
