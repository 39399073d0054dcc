//! Embedded MQTT broker using rumqttd
//!
//! Translates node configuration into rumqttd startup options: a raw MQTT
//! listener, an optional WebSocket listener, TLS on both when configured, and
//! static credentials checked by an auth hook that reports each connect.

use crate::domain::events::BrokerEvent;
use crate::domain::types::ClientInfo;
use crate::infra::config::Config as AppConfig;
use crate::io::retained_dump::{serve_dumps, DumpRequests};
use crate::io::retained_tap::RetainedTap;
use rumqttd::{
    AuthHandler, Broker, Config, ConnectionSettings, RouterConfig, ServerSettings, TlsConfig,
};
use std::collections::HashMap;
use std::io;
use std::net::{SocketAddr, TcpListener};
use std::sync::Arc;
use std::thread;
use tokio::sync::mpsc;
use tracing::{info, warn};

/// Link id used by the retained-message tap
const TAP_CLIENT_ID: &str = "broker-node-retained-tap";
/// Link id used to read the retained set back
const DUMP_CLIENT_ID: &str = "broker-node-retained-dump";

/// Most retained messages the router replays to one new subscription
pub const RETAINED_REPLAY_LIMIT: u64 = 10_000;

#[derive(Debug, thiserror::Error)]
pub enum BrokerSetupError {
    #[error("invalid bind address {addr}: {source}")]
    InvalidBindAddress { addr: String, source: std::net::AddrParseError },
    #[error("Error: Port {0} is already in use")]
    PortInUse(u16),
    #[error("Error: Port {port} {source}")]
    Port { port: u16, source: io::Error },
    #[error("missing-file: TLS needs both a certificate and a key")]
    MissingTlsFile,
    #[error("cannot read TLS file {path}: {source}")]
    TlsFileUnreadable { path: String, source: io::Error },
    #[error("no listener configured")]
    NoListeners,
}

impl BrokerSetupError {
    /// Short text for the node status
    pub fn status_text(&self) -> &'static str {
        match self {
            BrokerSetupError::MissingTlsFile | BrokerSetupError::TlsFileUnreadable { .. } => {
                "missing-file"
            }
            _ => "disconnected",
        }
    }
}

/// Validated TLS file paths; `ca` turns on client certificate verification
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsFiles {
    pub cert: String,
    pub key: String,
    pub ca: Option<String>,
}

/// Validate the TLS file configuration
///
/// Returns `None` when TLS is off or no cert/key are configured. Files are
/// checked even when TLS is off so a broken configuration is reported early.
pub fn resolve_tls(config: &AppConfig) -> Result<Option<TlsFiles>, BrokerSetupError> {
    let (cert, key, ca) = (config.tls_cert(), config.tls_key(), config.tls_ca());
    if cert.is_none() && key.is_none() && ca.is_none() {
        return Ok(None);
    }
    if cert.is_some() != key.is_some() {
        return Err(BrokerSetupError::MissingTlsFile);
    }

    for path in [cert, key, ca].into_iter().flatten() {
        std::fs::read(path).map_err(|source| BrokerSetupError::TlsFileUnreadable {
            path: path.to_string(),
            source,
        })?;
    }

    match (config.use_tls(), cert, key) {
        (true, Some(cert), Some(key)) => Ok(Some(TlsFiles {
            cert: cert.to_string(),
            key: key.to_string(),
            ca: ca.map(str::to_string),
        })),
        _ => Ok(None),
    }
}

fn listen_addr(bind_address: &str, port: u16) -> Result<SocketAddr, BrokerSetupError> {
    let addr = format!("{}:{}", bind_address, port);
    addr.parse().map_err(|source| BrokerSetupError::InvalidBindAddress { addr, source })
}

/// Check that a port can be bound before handing it to the engine
///
/// The engine binds inside its own threads and only logs failures there.
pub fn probe_port(bind_address: &str, port: u16) -> Result<(), BrokerSetupError> {
    let addr = listen_addr(bind_address, port)?;
    match TcpListener::bind(addr) {
        Ok(listener) => {
            drop(listener);
            Ok(())
        }
        Err(e) if e.kind() == io::ErrorKind::AddrInUse => Err(BrokerSetupError::PortInUse(port)),
        Err(source) => Err(BrokerSetupError::Port { port, source }),
    }
}

/// Credential check that reports every connect attempt
///
/// rumqttd only calls the hook for clients that send a login, so it is
/// installed only when credentials are configured.
pub fn auth_hook(user: &str, pass: &str, events: mpsc::Sender<BrokerEvent>) -> AuthHandler {
    let (user, pass) = (user.to_string(), pass.to_string());
    Arc::new(move |client_id: String, username: String, password: String| {
        let accepted = username == user && password == pass;
        let client = ClientInfo { id: client_id, user: Some(username) };
        let event = if accepted {
            BrokerEvent::Client(client)
        } else {
            warn!(client = %client, "client_auth_rejected");
            BrokerEvent::ClientError { client, error: "Bad username or password".to_string() }
        };
        if events.try_send(event).is_err() {
            warn!("client_event_dropped");
        }
        accepted
    })
}

fn connection_settings(
    app_config: &AppConfig,
    events: Option<&mpsc::Sender<BrokerEvent>>,
) -> ConnectionSettings {
    let (auth, external_auth) = match (app_config.credentials(), events) {
        (Some((user, pass)), Some(events)) => (None, Some(auth_hook(user, pass, events.clone()))),
        (Some((user, pass)), None) => {
            (Some(HashMap::from([(user.to_string(), pass.to_string())])), None)
        }
        (None, _) => (None, None),
    };

    ConnectionSettings {
        connection_timeout_ms: 5000,
        max_payload_size: 262144,
        max_inflight_count: 200,
        auth,
        dynamic_filters: false,
        external_auth,
    }
}

fn server_settings(
    name: &str,
    listen: SocketAddr,
    tls: Option<&TlsFiles>,
    connections: ConnectionSettings,
) -> ServerSettings {
    ServerSettings {
        name: name.to_string(),
        listen,
        tls: tls.map(|files| TlsConfig::Rustls {
            capath: files.ca.clone(),
            certpath: files.cert.clone(),
            keypath: files.key.clone(),
        }),
        next_connection_delay_ms: 1,
        connections,
    }
}

fn router_config() -> RouterConfig {
    RouterConfig {
        max_segment_size: 104857600,
        max_segment_count: 10,
        max_connections: 10010,
        // Also caps the retained replay a new QoS 0 subscription gets
        max_outgoing_packet_count: RETAINED_REPLAY_LIMIT,
        initialized_filters: None,
        ..Default::default()
    }
}

/// Build the rumqttd configuration for the node
///
/// `events` receives connect reports from the auth hook.
pub fn engine_config(
    app_config: &AppConfig,
    tls: Option<&TlsFiles>,
    events: Option<&mpsc::Sender<BrokerEvent>>,
) -> Result<Config, BrokerSetupError> {
    let bind = app_config.bind_address();

    let v4 = if app_config.mqtt_port() > 0 {
        let listen = listen_addr(bind, app_config.mqtt_port())?;
        let settings = server_settings("v4", listen, tls, connection_settings(app_config, events));
        Some(HashMap::from([("v4".to_string(), settings)]))
    } else {
        None
    };

    let ws = if app_config.ws_port() > 0 {
        let listen = listen_addr(bind, app_config.ws_port())?;
        let settings = server_settings("ws", listen, tls, connection_settings(app_config, events));
        Some(HashMap::from([("ws".to_string(), settings)]))
    } else {
        None
    };

    if v4.is_none() && ws.is_none() {
        return Err(BrokerSetupError::NoListeners);
    }

    Ok(Config { id: 0, router: router_config(), v4, ws, ..Default::default() })
}

/// Router without listeners, for driving local links directly
#[cfg(test)]
pub(crate) fn local_engine() -> Broker {
    Broker::new(Config { id: 0, router: router_config(), ..Default::default() })
}

/// Start the embedded MQTT broker with configuration
///
/// Every configured port is probed first; nothing is started if one is taken.
/// The loaded snapshot is republished and the dump link is up before any
/// listener binds.
pub fn start_embedded_broker(
    app_config: &AppConfig,
    tls: Option<&TlsFiles>,
    tap: RetainedTap,
    dumps: DumpRequests,
    events: &mpsc::Sender<BrokerEvent>,
) -> Result<thread::JoinHandle<()>, BrokerSetupError> {
    let config = engine_config(app_config, tls, Some(events))?;

    for port in [app_config.mqtt_port(), app_config.ws_port()] {
        if port > 0 {
            probe_port(app_config.bind_address(), port)?;
        }
    }

    let handle = thread::spawn(move || {
        let mut broker = Broker::new(config);

        match broker.link(DUMP_CLIENT_ID) {
            Ok((link_tx, link_rx)) => {
                let limit = RETAINED_REPLAY_LIMIT as usize;
                thread::spawn(move || serve_dumps(link_tx, link_rx, dumps, limit));
            }
            Err(e) => warn!(error = %e, "retained_dump_link_failed"),
        }

        match broker.link(TAP_CLIENT_ID) {
            Ok((mut link_tx, link_rx)) => {
                // The router is already running; listeners only start below
                tap.restore(&mut link_tx);
                thread::spawn(move || tap.run(link_tx, link_rx));
            }
            Err(e) => warn!(error = %e, "retained_tap_link_failed"),
        }

        if let Err(e) = broker.start() {
            warn!(error = %e, "broker_start_failed");
        }
    });

    info!(
        bind_address = %app_config.bind_address(),
        mqtt_port = %app_config.mqtt_port(),
        ws_port = %app_config.ws_port(),
        tls = %tls.is_some(),
        "broker_started"
    );
    Ok(handle)
}
