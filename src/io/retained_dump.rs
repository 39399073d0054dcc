//! Reads the engine's retained set back over a dedicated local link
//!
//! rumqttd clears the retain flag on every live forward, so watching traffic
//! cannot tell which publishes the router kept. A new subscription is the one
//! place the router replays its retained store, with the flag set. Each dump
//! subscribes, collects the replay and unsubscribes again, so the next dump
//! is a new subscription too.

use crate::io::persistence::PersistenceError;
use bytes::Bytes;
use futures::executor::block_on;
use rumqttd::local::{LinkError, LinkRx, LinkTx};
use rumqttd::protocol::{Filter, Packet, QoS, RetainForwardRule, Subscribe, Unsubscribe};
use rumqttd::Notification;
use std::collections::BTreeMap;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

/// Quiet period that ends a replay
const DUMP_IDLE: Duration = Duration::from_millis(100);
/// Upper bound for one dump
const DUMP_TIMEOUT: Duration = Duration::from_secs(5);

struct DumpRequest {
    filters: Vec<String>,
    reply: oneshot::Sender<Result<Vec<(String, Bytes)>, PersistenceError>>,
}

/// Handle used by the async side to request a dump
#[derive(Debug, Clone)]
pub struct RetainedDump {
    requests: mpsc::UnboundedSender<DumpRequest>,
}

/// Receiving end, served on an engine thread by `serve_dumps`
pub struct DumpRequests(mpsc::UnboundedReceiver<DumpRequest>);

pub fn dump_channel() -> (RetainedDump, DumpRequests) {
    let (tx, rx) = mpsc::unbounded_channel();
    (RetainedDump { requests: tx }, DumpRequests(rx))
}

impl RetainedDump {
    /// Every (topic, payload) the engine retains under `filters`
    pub async fn dump(&self, filters: &[&str]) -> Result<Vec<(String, Bytes)>, PersistenceError> {
        let (reply, rx) = oneshot::channel();
        let request = DumpRequest { filters: filters.iter().map(|f| f.to_string()).collect(), reply };
        self.requests.send(request).map_err(|_| PersistenceError::Closed)?;
        rx.await.map_err(|_| PersistenceError::Closed)?
    }
}

/// Blocking loop; returns when every `RetainedDump` handle is dropped
///
/// `limit` is the router's replay cap per subscription; reaching it means the
/// dump may be short.
pub fn serve_dumps(mut link_tx: LinkTx, mut link_rx: LinkRx, mut requests: DumpRequests, limit: usize) {
    let mut pkid: u16 = 0;
    while let Some(request) = requests.0.blocking_recv() {
        pkid = pkid.wrapping_add(1).max(1);
        let result = dump_once(&mut link_tx, &mut link_rx, &request.filters, pkid)
            .map_err(|e| {
                warn!(error = %e, "retained_dump_failed");
                PersistenceError::Closed
            })
            .inspect(|entries| {
                if entries.len() >= limit {
                    warn!(count = %entries.len(), limit = %limit, "retained_dump_truncated");
                }
                debug!(count = %entries.len(), "retained_dumped");
            });
        let _ = request.reply.send(result);
    }
    debug!("retained dump link stopped");
}

fn dump_once(
    link_tx: &mut LinkTx,
    link_rx: &mut LinkRx,
    filters: &[String],
    pkid: u16,
) -> Result<Vec<(String, Bytes)>, LinkError> {
    // Leftovers from the previous dump
    while let Ok(Some(notification)) = link_rx.recv_deadline(Instant::now()) {
        if matches!(notification, Notification::Unschedule) {
            link_rx.ready()?;
        }
    }

    let subscribe = Subscribe {
        pkid,
        filters: filters
            .iter()
            .map(|path| Filter {
                path: path.clone(),
                qos: QoS::AtMostOnce,
                nolocal: false,
                preserve_retain: true,
                retain_forward_rule: RetainForwardRule::OnEverySubscribe,
            })
            .collect(),
    };
    block_on(link_tx.send(Packet::Subscribe(subscribe, None)))?;

    let mut retained = BTreeMap::new();
    let deadline = Instant::now() + DUMP_TIMEOUT;
    loop {
        let wait = (Instant::now() + DUMP_IDLE).min(deadline);
        match link_rx.recv_deadline(wait) {
            Ok(Some(Notification::Forward(forward))) => {
                // The replay precedes live data, so the first live forward ends it
                if !forward.publish.retain {
                    break;
                }
                match std::str::from_utf8(&forward.publish.topic) {
                    Ok(topic) => {
                        retained.insert(topic.to_string(), forward.publish.payload);
                    }
                    Err(_) => debug!("retained topic is not UTF-8"),
                }
            }
            Ok(Some(Notification::Unschedule)) => link_rx.ready()?,
            Ok(_) => {}
            Err(LinkError::RecvTimeout(_)) => break,
            Err(e) => return Err(e),
        }
        if Instant::now() >= deadline {
            warn!("retained_dump_timeout");
            break;
        }
    }

    let unsubscribe = Unsubscribe { pkid, filters: filters.to_vec() };
    block_on(link_tx.send(Packet::Unsubscribe(unsubscribe, None)))?;

    Ok(retained.into_iter().collect())
}
