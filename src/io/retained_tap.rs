//! Local link that seeds the engine and reports publishes
//!
//! Before the listeners start, the messages loaded from the snapshot are
//! republished as retained QoS 0 publishes (local links only carry QoS 0).
//! The tap then subscribes to `#` on its own thread and reports every
//! forwarded publish as `BrokerEvent::Publish`. The router clears the retain
//! flag and downgrades QoS to the subscription's level on forwards, so the
//! events carry neither; the retained set itself is read through
//! `io::retained_dump`.

use crate::domain::events::{BrokerEvent, PublishPacket};
use crate::domain::types::{Qos, RetainedMessage};
use bytes::Bytes;
use futures::executor::block_on;
use rumqttd::local::{LinkRx, LinkTx};
use rumqttd::protocol::{Packet, Publish};
use rumqttd::Notification;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, info, warn};

pub struct RetainedTap {
    events: mpsc::Sender<BrokerEvent>,
    restore: Vec<RetainedMessage>,
}

impl RetainedTap {
    pub fn new(events: mpsc::Sender<BrokerEvent>, restore: Vec<RetainedMessage>) -> Self {
        Self { events, restore }
    }

    /// Republish the loaded snapshot into the engine
    ///
    /// Runs before the listeners start so no client sees an empty retained set.
    pub fn restore(&self, link_tx: &mut LinkTx) -> usize {
        let mut sent = 0;
        for msg in &self.restore {
            match block_on(link_tx.send(Packet::Publish(restore_publish(msg), None))) {
                Ok(_) => sent += 1,
                Err(e) => warn!(topic = %msg.topic, error = %e, "retained_restore_publish_failed"),
            }
        }
        if sent > 0 {
            info!(count = %sent, "retained_restored_into_engine");
        }
        sent
    }

    /// Blocking loop; returns when the engine link closes
    pub fn run(self, mut link_tx: LinkTx, mut link_rx: LinkRx) {
        if let Err(e) = link_tx.subscribe("#") {
            warn!(error = %e, "retained_tap_subscribe_failed");
            return;
        }

        let mut last_drop_warn = Instant::now() - Duration::from_secs(2);
        loop {
            match link_rx.recv() {
                Ok(Some(Notification::Forward(forward))) => {
                    // Replay of the retained set for the new subscription
                    if forward.publish.retain {
                        continue;
                    }
                    let event = BrokerEvent::Publish {
                        client: None,
                        packet: publish_packet(&forward.publish.topic, &forward.publish.payload),
                    };
                    match self.events.try_send(event) {
                        Ok(()) => {}
                        Err(TrySendError::Full(_)) => {
                            if last_drop_warn.elapsed() > Duration::from_secs(1) {
                                warn!("publish_event_dropped: channel full");
                                last_drop_warn = Instant::now();
                            }
                        }
                        Err(TrySendError::Closed(_)) => {
                            debug!("event channel closed");
                        }
                    }
                }
                // Outgoing buffer was full; ask the router to resume
                Ok(Some(Notification::Unschedule)) => {
                    if let Err(e) = link_rx.ready() {
                        warn!(error = %e, "retained_tap_link_closed");
                        return;
                    }
                }
                Ok(Some(_)) | Ok(None) => {}
                Err(e) => {
                    warn!(error = %e, "retained_tap_link_closed");
                    return;
                }
            }
        }
    }
}

/// Retained QoS 0 publish that re-establishes a stored message
pub fn restore_publish(msg: &RetainedMessage) -> Publish {
    Publish::new(Bytes::from(msg.topic.clone()), msg.payload.clone(), true)
}

fn publish_packet(topic: &[u8], payload: &[u8]) -> PublishPacket {
    PublishPacket {
        topic: String::from_utf8_lossy(topic).into_owned(),
        payload: String::from_utf8_lossy(payload).into_owned(),
        qos: Qos::AT_MOST_ONCE,
        retain: false,
    }
}
