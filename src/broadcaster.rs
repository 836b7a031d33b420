//! Best-effort fan-out of position/alarm events to subscribed observers
//! (component I). Never back-pressures ingestion — a lagging subscriber
//! drops messages rather than slowing the connection that produced them,
//! the same shape as `tr8tmnvny9-lab-Regatta_Race_Suite`'s UWB hub.

use tokio::sync::broadcast;

use crate::codec::AlarmKind;
use crate::identity::DeviceIdentity;

const CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone)]
pub enum DeviceEvent {
    Position {
        identity: DeviceIdentity,
        lat: f64,
        lon: f64,
        is_alarm: bool,
    },
    Alarm {
        identity: DeviceIdentity,
        kind: AlarmKind,
    },
}

#[derive(Clone)]
pub struct Broadcaster {
    tx: broadcast::Sender<DeviceEvent>,
}

impl Default for Broadcaster {
    fn default() -> Self {
        Self::new()
    }
}

impl Broadcaster {
    pub fn new() -> Self {
        let (tx, _rx) = broadcast::channel(CHANNEL_CAPACITY);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DeviceEvent> {
        self.tx.subscribe()
    }

    /// Publishes an event. No subscribers is the common case and is not
    /// an error; a full/lagged channel just drops for slow subscribers.
    pub fn publish(&self, event: DeviceEvent) {
        let _ = self.tx.send(event);
    }
}
