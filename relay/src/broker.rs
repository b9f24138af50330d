//! Signaling broker.
//!
//! A WebSocket hub that registers clients, hands the publisher a
//! `viewer_connected` notification whenever a new client joins, and routes
//! addressed signaling messages between peers. Payloads are opaque: the
//! broker only reads the `type` discriminator and stamps the routing ids.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use actix::{Actor, ActorContext, AsyncContext, Handler, Message, Recipient, StreamHandler};
use actix_web::http::header;
use actix_web::{web, HttpRequest, HttpResponse, Responder};
use actix_web_actors::ws;
use derivative::Derivative;
use serde_json::Value;

use crate::protocol;

/// Ping cadence; clients silent for longer than `CLIENT_TIMEOUT` are torn
/// down at the next tick.
const PING_INTERVAL: Duration = Duration::from_secs(54);
const CLIENT_TIMEOUT: Duration = Duration::from_secs(60);

/// Message pushed to a client's socket actor.
#[derive(Message, Debug, Clone)]
#[rtype(result = "()")]
pub enum Outbound {
    Text(String),
    Shutdown,
}

/// The connected-client table. Ids are `client-<n>` from a counter that is
/// monotonic for the broker's lifetime; assignment and insertion happen
/// under one write-lock section so ids are never reused or raced.
#[derive(Derivative)]
#[derivative(Debug)]
pub struct Hub {
    #[derivative(Debug = "ignore")]
    clients: RwLock<HashMap<String, Recipient<Outbound>>>,
    next_id: AtomicU64,
}

impl Hub {
    pub fn new() -> Self {
        Hub {
            clients: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(0),
        }
    }

    /// Registers a client, assigns its id, and notifies every existing
    /// client that a viewer joined.
    pub fn register(&self, recipient: Recipient<Outbound>) -> String {
        let (id, peers) = {
            let mut clients = self.clients.write().unwrap();
            let n = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
            let id = format!("client-{}", n);
            let peers: Vec<(String, Recipient<Outbound>)> = clients
                .iter()
                .map(|(peer_id, recipient)| (peer_id.clone(), recipient.clone()))
                .collect();
            clients.insert(id.clone(), recipient);
            (id, peers)
        };
        tracing::info!("client {} connected ({} total)", id, peers.len() + 1);

        if !peers.is_empty() {
            let notification = protocol::viewer_connected_notification(&id);
            tracing::debug!(
                "notifying {} client(s) that {} joined",
                peers.len(),
                id
            );
            self.deliver(&peers, &notification);
        }
        id
    }

    pub fn unregister(&self, id: &str) {
        if self.clients.write().unwrap().remove(id).is_some() {
            tracing::info!("client {} disconnected", id);
        }
    }

    /// Relays a stamped message to every client except the sender.
    pub fn broadcast_from(&self, sender_id: &str, text: &str) {
        let targets: Vec<(String, Recipient<Outbound>)> = {
            let clients = self.clients.read().unwrap();
            clients
                .iter()
                .filter(|(id, _)| id.as_str() != sender_id)
                .map(|(id, recipient)| (id.clone(), recipient.clone()))
                .collect()
        };
        self.deliver(&targets, text);
    }

    /// Best-effort, non-blocking delivery. A client whose mailbox is full is
    /// disconnected and removed rather than allowed to stall the hub.
    fn deliver(&self, targets: &[(String, Recipient<Outbound>)], text: &str) {
        let mut dead: Vec<&str> = Vec::new();
        for (id, recipient) in targets {
            if recipient.try_send(Outbound::Text(text.to_owned())).is_err() {
                tracing::warn!("client {} mailbox full or gone, disconnecting", id);
                dead.push(id.as_str());
            }
        }
        if !dead.is_empty() {
            let mut clients = self.clients.write().unwrap();
            for id in dead {
                if let Some(recipient) = clients.remove(id) {
                    recipient.do_send(Outbound::Shutdown);
                }
            }
        }
    }

    pub fn client_count(&self) -> usize {
        self.clients.read().unwrap().len()
    }
}

impl Default for Hub {
    fn default() -> Self {
        Hub::new()
    }
}

/// One WebSocket client connection.
#[derive(Debug)]
pub struct ClientSession {
    id: Option<String>,
    hub: Arc<Hub>,
    last_heartbeat: Instant,
}

impl ClientSession {
    pub fn new(hub: Arc<Hub>) -> Self {
        ClientSession {
            id: None,
            hub,
            last_heartbeat: Instant::now(),
        }
    }

    fn route_text(&self, text: &str) {
        let Some(id) = &self.id else {
            return;
        };
        let value: Value = match serde_json::from_str(text) {
            Ok(value) => value,
            Err(err) => {
                tracing::error!("client {} sent unparseable message: {}", id, err);
                return;
            }
        };
        // Join notifications are broker-originated only.
        if value.get("type").and_then(Value::as_str) == Some("viewer_connected") {
            tracing::debug!("client {} sent viewer_connected, ignoring", id);
            return;
        }
        let stamped = protocol::stamp_routed_message(value, id);
        match serde_json::to_string(&stamped) {
            Ok(text) => self.hub.broadcast_from(id, &text),
            Err(err) => tracing::error!("failed to serialize routed message: {}", err),
        }
    }
}

impl Actor for ClientSession {
    type Context = ws::WebsocketContext<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        let id = self.hub.register(ctx.address().recipient());
        tracing::debug!("session {} started", id);
        self.id = Some(id);

        ctx.run_interval(PING_INTERVAL, |session, ctx| {
            if session.last_heartbeat.elapsed() > CLIENT_TIMEOUT {
                tracing::warn!(
                    "client {:?} missed heartbeat, dropping",
                    session.id
                );
                ctx.stop();
                return;
            }
            ctx.ping(b"");
        });
    }

    fn stopped(&mut self, _ctx: &mut Self::Context) {
        if let Some(id) = &self.id {
            self.hub.unregister(id);
        }
    }
}

impl StreamHandler<Result<ws::Message, ws::ProtocolError>> for ClientSession {
    fn handle(&mut self, item: Result<ws::Message, ws::ProtocolError>, ctx: &mut Self::Context) {
        match item {
            Ok(ws::Message::Ping(payload)) => {
                self.last_heartbeat = Instant::now();
                ctx.pong(&payload);
            }
            Ok(ws::Message::Pong(_)) => {
                self.last_heartbeat = Instant::now();
            }
            Ok(ws::Message::Text(text)) => {
                self.last_heartbeat = Instant::now();
                self.route_text(&text);
            }
            Ok(ws::Message::Binary(_)) => {
                tracing::debug!("ignoring binary frame");
            }
            Ok(ws::Message::Close(reason)) => {
                ctx.close(reason);
                ctx.stop();
            }
            Err(err) => {
                tracing::warn!("websocket protocol error: {}", err);
                ctx.stop();
            }
            _ => {}
        }
    }
}

impl Handler<Outbound> for ClientSession {
    type Result = ();

    fn handle(&mut self, msg: Outbound, ctx: &mut Self::Context) -> Self::Result {
        match msg {
            Outbound::Text(text) => ctx.text(text),
            Outbound::Shutdown => {
                ctx.close(None);
                ctx.stop();
            }
        }
    }
}

/// Upgrades with no `Origin` header are internal clients and accepted;
/// configured origins are accepted; localhost origins are accepted for
/// development; everything else is refused.
fn origin_allowed(origin: Option<&str>, allowed: &[String]) -> bool {
    let Some(origin) = origin else {
        return true;
    };
    if allowed.iter().any(|candidate| candidate == origin) {
        return true;
    }
    let is_http = origin.starts_with("http://") || origin.starts_with("https://");
    if is_http && (origin.contains("localhost") || origin.contains("127.0.0.1")) {
        tracing::warn!("allowing localhost origin for development: {}", origin);
        return true;
    }
    false
}

/// `GET /ws`: WebSocket upgrade with origin policy applied.
pub async fn ws_route(
    req: HttpRequest,
    stream: web::Payload,
    hub: web::Data<Arc<Hub>>,
    origins: web::Data<Vec<String>>,
) -> actix_web::Result<HttpResponse> {
    let origin = req
        .headers()
        .get(header::ORIGIN)
        .and_then(|value| value.to_str().ok());
    if !origin_allowed(origin, origins.as_ref()) {
        tracing::warn!("rejected WebSocket upgrade from origin {:?}", origin);
        return Ok(HttpResponse::Forbidden().body("origin not allowed"));
    }
    ws::start(ClientSession::new(hub.get_ref().clone()), &req, stream)
}

/// `GET /health`
pub async fn health() -> impl Responder {
    HttpResponse::Ok().body("OK")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_origin_absent_is_accepted() {
        assert!(origin_allowed(None, &[]));
    }

    #[test]
    fn test_origin_allow_list() {
        let allowed = vec!["https://viewer.example.com".to_owned()];
        assert!(origin_allowed(Some("https://viewer.example.com"), &allowed));
        assert!(!origin_allowed(Some("https://evil.example.com"), &allowed));
    }

    #[test]
    fn test_localhost_origin_accepted_in_dev() {
        assert!(origin_allowed(Some("http://localhost:5173"), &[]));
        assert!(origin_allowed(Some("http://127.0.0.1:3000"), &[]));
        // Only http(s) schemes qualify for the development carve-out.
        assert!(!origin_allowed(Some("ftp://localhost"), &[]));
    }

    #[test]
    fn test_monotonic_ids_survive_disconnects() {
        // Ids come from a counter, not the table size, so an id is never
        // handed out twice even after clients leave. Exercised through the
        // counter directly since recipients need a running actor system.
        let hub = Hub::new();
        let first = hub.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let second = hub.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        assert_eq!(first, 1);
        assert_eq!(second, 2);
        assert_eq!(hub.client_count(), 0);
    }
}
