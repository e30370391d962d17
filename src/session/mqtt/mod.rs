//! MQTT-backed device session.
//!
//! Thin adapter over `rumqttc`: it authenticates, waits for CONNACK, then runs one
//! dispatcher task that routes incoming publishes to subscriptions, method handlers
//! and pending twin requests. Reconnection is not attempted; when the connection
//! drops every open subscription ends with `ConnectionLost`.
//!
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Packet, TlsConfiguration};
use serde::Deserialize;
use tokio::sync::{Mutex, OnceCell, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use super::auth::AuthMode;
use super::{
    EventMessage, MethodHandler, Payload, QoS, SendOptions, Session, SessionError, Subscription,
    SubscriptionSender, TwinState, subscription_channel,
};

mod credentials;
mod topic;

use credentials::ConnectionString;

const PORT: u16 = 8883;
const API_VERSION: &str = "2021-04-12";
const KEEP_ALIVE: Duration = Duration::from_secs(30);
const MAX_PACKET_SIZE: usize = 256 * 1024;
const CLIENT_CAPACITY: usize = 64;
const SUBSCRIPTION_BUFFER: usize = 16;
const TWIN_TIMEOUT: Duration = Duration::from_secs(30);

/* ---- Transport ---- */

/// Constructor side of the MQTT transport.
#[derive(Debug, Clone)]
pub struct MqttTransport {
    ca_file: PathBuf,
}

/// Who we are on the wire.
struct Identity {
    host: String,
    device_id: String,
    password: String,
    client_auth: Option<(Vec<u8>, Vec<u8>)>,
}

impl MqttTransport {
    pub fn new(ca_file: PathBuf) -> Self {
        Self { ca_file }
    }

    async fn identity(auth: &AuthMode) -> Result<Identity, SessionError> {
        match auth {
            AuthMode::ConnectionString(raw) => {
                let cs: ConnectionString = raw.parse()?;
                let password = cs.token()?;
                Ok(Identity {
                    host: cs.host_name,
                    device_id: cs.device_id,
                    password,
                    client_auth: None,
                })
            }
            AuthMode::X509 {
                device_id,
                hostname,
                cert_path,
                key_path,
            } => {
                let read = |path: PathBuf| async move {
                    tokio::fs::read(&path).await.map_err(|e| {
                        SessionError::Credentials(format!("reading {}: {e}", path.display()))
                    })
                };
                let cert = read(cert_path.clone()).await?;
                let key = read(key_path.clone()).await?;
                Ok(Identity {
                    host: hostname.clone(),
                    device_id: device_id.clone(),
                    password: String::new(),
                    client_auth: Some((cert, key)),
                })
            }
        }
    }

    /// Open the connection and block until the hub accepted it.
    pub async fn connect(self, auth: &AuthMode) -> Result<MqttSession, SessionError> {
        let identity = Self::identity(auth).await?;
        let ca = tokio::fs::read(&self.ca_file).await.map_err(|e| {
            SessionError::Credentials(format!(
                "reading CA bundle {}: {e}",
                self.ca_file.display()
            ))
        })?;

        let mut options = MqttOptions::new(&identity.device_id, &identity.host, PORT);
        options
            .set_credentials(
                format!(
                    "{}/{}/?api-version={API_VERSION}",
                    identity.host, identity.device_id
                ),
                identity.password,
            )
            .set_keep_alive(KEEP_ALIVE)
            .set_max_packet_size(MAX_PACKET_SIZE, MAX_PACKET_SIZE)
            .set_transport(rumqttc::Transport::tls_with_config(
                TlsConfiguration::Simple {
                    ca,
                    alpn: None,
                    client_auth: identity.client_auth,
                },
            ));

        let (client, mut eventloop) = AsyncClient::new(options, CLIENT_CAPACITY);
        wait_for_connack(&mut eventloop).await?;
        info!(host = %identity.host, device_id = %identity.device_id, "connected");

        Ok(MqttSession::start(client, eventloop, identity.device_id))
    }
}

async fn wait_for_connack(eventloop: &mut EventLoop) -> Result<(), SessionError> {
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                debug!(?ack, "connack");
                return Ok(());
            }
            Ok(event) => trace!(?event, "mqtt event before connack"),
            Err(e) => return Err(SessionError::Connect(e.to_string())),
        }
    }
}

/* ---- Routing ---- */

/// Reply to a twin request, matched by request id.
#[derive(Debug)]
struct TwinReply {
    status: u16,
    version: Option<i64>,
    body: Vec<u8>,
}

#[derive(Default)]
struct Routes {
    events: Vec<SubscriptionSender<EventMessage>>,
    desired: Vec<SubscriptionSender<TwinState>>,
    methods: HashMap<String, MethodHandler>,
    pending: HashMap<String, oneshot::Sender<TwinReply>>,
    /// Set once the connection is gone.
    lost: Option<String>,
}

type Pick<T> = fn(&mut Routes) -> &mut Vec<SubscriptionSender<T>>;

/// Hand `item` to every subscriber picked by `pick`, then forget the ones whose reader
/// has gone. The lock is not held while a send waits for buffer space.
async fn deliver<T: Clone>(routes: &Mutex<Routes>, pick: Pick<T>, item: T) {
    let subs = pick(&mut *routes.lock().await).clone();
    for tx in &subs {
        tx.send(item.clone()).await;
    }
    pick(&mut *routes.lock().await).retain(|tx| !tx.is_closed());
}

async fn dispatch(
    mut eventloop: EventLoop,
    client: AsyncClient,
    device_id: String,
    routes: Arc<Mutex<Routes>>,
    lost: CancellationToken,
) {
    let reason = loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                route(&client, &device_id, &routes, &publish.topic, &publish.payload).await;
            }
            Ok(event) => trace!(?event, "mqtt event"),
            Err(e) => break e.to_string(),
        }
    };
    warn!(%reason, "connection lost");

    let mut routes = routes.lock().await;
    for tx in routes.events.drain(..) {
        tx.close(Some(SessionError::ConnectionLost(reason.clone())));
    }
    for tx in routes.desired.drain(..) {
        tx.close(Some(SessionError::ConnectionLost(reason.clone())));
    }
    // Dropping the senders wakes every pending twin request.
    routes.pending.clear();
    routes.lost = Some(reason);
    lost.cancel();
}

async fn route(
    client: &AsyncClient,
    device_id: &str,
    routes: &Mutex<Routes>,
    topic_name: &str,
    payload: &[u8],
) {
    match topic::classify(device_id, topic_name) {
        topic::Incoming::CloudToDevice(props) => {
            let msg = topic::decode_cloud_to_device(props, payload);
            deliver(routes, |r| &mut r.events, msg).await;
        }
        topic::Incoming::DesiredUpdate => match serde_json::from_slice::<TwinState>(payload) {
            Ok(state) => deliver(routes, |r| &mut r.desired, state).await,
            Err(e) => {
                // Watchers must not silently miss a version.
                warn!(error = %e, "malformed desired state update");
                let reason = format!("malformed desired state update: {e}");
                for tx in routes.lock().await.desired.drain(..) {
                    tx.close(Some(SessionError::Protocol(reason.clone())));
                }
            }
        },
        topic::Incoming::Method { name, rid } => {
            let handler = routes.lock().await.methods.get(name).cloned();
            if let Some(handler) = handler {
                debug!(method = name, %rid, "method invoked");
                tokio::spawn(answer_method(
                    client.clone(),
                    handler,
                    rid,
                    payload.to_vec(),
                ));
            } else {
                debug!(method = name, "no handler registered");
                respond(client, 404, &rid, &serde_json::json!({ "message": "method not registered" }))
                    .await;
            }
        }
        topic::Incoming::TwinResponse(resp) => {
            let waiter = routes.lock().await.pending.remove(&resp.rid);
            match waiter {
                Some(tx) => {
                    let _ = tx.send(TwinReply {
                        status: resp.status,
                        version: resp.version,
                        body: payload.to_vec(),
                    });
                }
                None => debug!(rid = %resp.rid, "unsolicited twin response"),
            }
        }
        topic::Incoming::Unknown => debug!(topic = topic_name, "ignoring publish"),
    }
}

fn decode_method_payload(body: &[u8]) -> Result<Payload, serde_json::Error> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(Payload::new());
    }
    let value: Option<Payload> = serde_json::from_slice(body)?;
    Ok(value.unwrap_or_default())
}

async fn answer_method(client: AsyncClient, handler: MethodHandler, rid: String, body: Vec<u8>) {
    match decode_method_payload(&body) {
        Ok(payload) => match handler(payload).await {
            Ok(out) => respond(&client, 200, &rid, &out).await,
            Err(e) => {
                respond(&client, 500, &rid, &serde_json::json!({ "message": e.message() })).await;
            }
        },
        Err(e) => {
            let msg = format!("invalid payload: {e}");
            respond(&client, 400, &rid, &serde_json::json!({ "message": msg })).await;
        }
    }
}

async fn respond<T: serde::Serialize>(client: &AsyncClient, status: u16, rid: &str, body: &T) {
    let body = match serde_json::to_vec(body) {
        Ok(b) => b,
        Err(e) => {
            warn!(error = %e, %rid, "unable to encode method response");
            return;
        }
    };
    if let Err(e) = client
        .publish(
            topic::method_response(status, rid),
            rumqttc::QoS::AtMostOnce,
            false,
            body,
        )
        .await
    {
        warn!(error = %e, %rid, "unable to publish method response");
    }
}

/* ---- Session ---- */

/// A connected MQTT device session.
pub struct MqttSession {
    client: AsyncClient,
    device_id: String,
    routes: Arc<Mutex<Routes>>,
    next_rid: AtomicU64,
    methods_subscribed: OnceCell<()>,
    twin_subscribed: OnceCell<()>,
    lost: CancellationToken,
    dispatcher: JoinHandle<()>,
}

impl Drop for MqttSession {
    fn drop(&mut self) {
        self.dispatcher.abort();
    }
}

#[derive(Deserialize)]
struct TwinDocument {
    #[serde(default)]
    desired: TwinState,
    #[serde(default)]
    reported: TwinState,
}

fn mqtt_qos(qos: QoS) -> rumqttc::QoS {
    match qos {
        QoS::AtMostOnce => rumqttc::QoS::AtMostOnce,
        QoS::AtLeastOnce => rumqttc::QoS::AtLeastOnce,
    }
}

impl MqttSession {
    /// Take over a connected client and start routing its incoming publishes.
    fn start(client: AsyncClient, eventloop: EventLoop, device_id: String) -> Self {
        let routes = Arc::new(Mutex::new(Routes::default()));
        let lost = CancellationToken::new();
        let dispatcher = tokio::spawn(dispatch(
            eventloop,
            client.clone(),
            device_id.clone(),
            routes.clone(),
            lost.clone(),
        ));
        MqttSession {
            client,
            device_id,
            routes,
            next_rid: AtomicU64::new(1),
            methods_subscribed: OnceCell::new(),
            twin_subscribed: OnceCell::new(),
            lost,
            dispatcher,
        }
    }

    async fn subscribe_once(&self, cell: &OnceCell<()>, filter: &str) -> Result<(), SessionError> {
        cell.get_or_try_init(|| async {
            self.client
                .subscribe(filter, rumqttc::QoS::AtLeastOnce)
                .await
                .map_err(SessionError::from)
        })
        .await?;
        Ok(())
    }

    /// Publish a twin request and wait for the matching response.
    async fn twin_request(
        &self,
        topic_for: fn(&str) -> String,
        body: Vec<u8>,
    ) -> Result<TwinReply, SessionError> {
        self.subscribe_once(&self.twin_subscribed, topic::TWIN_RESPONSES_SUBSCRIBE)
            .await?;

        let rid = self.next_rid.fetch_add(1, Ordering::Relaxed).to_string();
        let (tx, rx) = oneshot::channel();
        {
            let mut routes = self.routes.lock().await;
            if let Some(reason) = &routes.lost {
                return Err(SessionError::ConnectionLost(reason.clone()));
            }
            routes.pending.insert(rid.clone(), tx);
        }

        if let Err(e) = self
            .client
            .publish(topic_for(&rid), rumqttc::QoS::AtMostOnce, false, body)
            .await
        {
            self.routes.lock().await.pending.remove(&rid);
            return Err(e.into());
        }

        let reply = match tokio::time::timeout(TWIN_TIMEOUT, rx).await {
            Ok(Ok(reply)) => reply,
            Ok(Err(_)) => {
                let reason = self.routes.lock().await.lost.clone().unwrap_or_default();
                return Err(SessionError::ConnectionLost(reason));
            }
            Err(_) => {
                self.routes.lock().await.pending.remove(&rid);
                return Err(SessionError::Timeout);
            }
        };
        if !(200..300).contains(&reply.status) {
            return Err(SessionError::Rejected {
                status: reply.status,
            });
        }
        Ok(reply)
    }

    async fn add_subscriber<T>(
        &self,
        pick: Pick<T>,
        filter: &str,
    ) -> Result<Subscription<T>, SessionError> {
        let (tx, sub) = subscription_channel(SUBSCRIPTION_BUFFER);
        {
            let mut routes = self.routes.lock().await;
            if let Some(reason) = &routes.lost {
                return Err(SessionError::ConnectionLost(reason.clone()));
            }
            pick(&mut *routes).push(tx);
        }
        self.client
            .subscribe(filter, rumqttc::QoS::AtLeastOnce)
            .await?;
        Ok(sub)
    }
}

#[async_trait]
impl Session for MqttSession {
    async fn send_event(&self, payload: Vec<u8>, opts: SendOptions) -> Result<(), SessionError> {
        let topic_name = topic::events(&self.device_id, &opts);
        debug!(topic = %topic_name, bytes = payload.len(), "sending event");
        self.client
            .publish(topic_name, mqtt_qos(opts.qos), false, payload)
            .await?;
        Ok(())
    }

    async fn subscribe_events(&self) -> Result<Subscription<EventMessage>, SessionError> {
        self.add_subscriber(
            |r| &mut r.events,
            &topic::cloud_to_device_subscribe(&self.device_id),
        )
        .await
    }

    async fn subscribe_twin_updates(&self) -> Result<Subscription<TwinState>, SessionError> {
        self.add_subscriber(|r| &mut r.desired, topic::TWIN_DESIRED_SUBSCRIBE)
            .await
    }

    async fn register_method(
        &self,
        name: &str,
        handler: MethodHandler,
    ) -> Result<(), SessionError> {
        {
            let mut routes = self.routes.lock().await;
            if let Some(reason) = &routes.lost {
                return Err(SessionError::ConnectionLost(reason.clone()));
            }
            if routes.methods.contains_key(name) {
                return Err(SessionError::DuplicateMethod(name.to_string()));
            }
            routes.methods.insert(name.to_string(), handler);
        }
        self.subscribe_once(&self.methods_subscribed, topic::METHODS_SUBSCRIBE)
            .await
    }

    async fn retrieve_twin_state(&self) -> Result<(TwinState, TwinState), SessionError> {
        let reply = self.twin_request(topic::twin_get, Vec::new()).await?;
        let doc: TwinDocument = serde_json::from_slice(&reply.body)?;
        Ok((doc.desired, doc.reported))
    }

    async fn update_twin_state(&self, state: TwinState) -> Result<i64, SessionError> {
        let body = serde_json::to_vec(&state)?;
        let reply = self.twin_request(topic::twin_patch_reported, body).await?;
        reply
            .version
            .ok_or_else(|| SessionError::Protocol("twin update response has no version".into()))
    }

    async fn closed(&self) -> SessionError {
        self.lost.cancelled().await;
        let reason = self.routes.lock().await.lost.clone().unwrap_or_default();
        SessionError::ConnectionLost(reason)
    }
}
