//! Host-facing callbacks.

use serde_json::{Map, Value};

/// Datapoint map as delivered by the device: id string to JSON value.
pub type Dps = Map<String, Value>;

/// Receives unsolicited updates from one device connection.
///
/// Callbacks run on the connection's reader task; keep them short and
/// never block.
pub trait TuyaListener: Send + Sync {
    /// A status push (or a response nobody was waiting for) carried datapoints.
    fn status_updated(&self, dps: &Dps);

    /// The connection was lost or closed. Fires exactly once per connection.
    fn disconnected(&self);
}

/// Listener that ignores every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct EmptyListener;

impl TuyaListener for EmptyListener {
    fn status_updated(&self, _dps: &Dps) {}

    fn disconnected(&self) {}
}
