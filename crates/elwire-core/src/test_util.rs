//! Shared test helpers for `elwire-core` unit tests.

use std::sync::{Arc, Mutex};

use serde_json::Value;

use crate::rpc::protocol::Envelope;
use crate::types::{Callback, Event};

/// Decode a JSON literal into an inbound envelope.
pub fn envelope(value: Value) -> Envelope {
    serde_json::from_value(value).expect("test envelope must decode")
}

/// A callback that appends every event it receives to the returned log.
pub fn recording_callback() -> (Callback, Arc<Mutex<Vec<Event>>>) {
    let log = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&log);
    let callback = Callback::new(move |event| {
        sink.lock().expect("event log lock").push(event);
    });
    (callback, log)
}

/// Snapshot of a recorded event log.
pub fn events(log: &Arc<Mutex<Vec<Event>>>) -> Vec<Event> {
    log.lock().expect("event log lock").clone()
}
