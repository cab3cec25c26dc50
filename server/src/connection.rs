use std::sync::atomic::{AtomicU32, Ordering};

use actix::{Actor, ActorContext, Addr, AsyncContext, Handler, Message, Running, StreamHandler};
use actix_web::{web, Error, HttpRequest, HttpResponse};
use actix_web_actors::ws::{self, CloseCode, CloseReason};
use serde::Deserialize;
use tokio::sync::mpsc::error::TrySendError;

use system::{ClientMessage, ConnectionId, ErrorKind, ServerMessage, UserId, WireFormat};

use crate::config::Config;
use crate::connection_tx_storage::ConnectionTx;
use crate::gateway::{send_or_spawn, GatewayCommand, GatewayTx};
use crate::outbox::{CloseCause, Delivery, Outbox};

pub const USER_ID_HEADER: &str = "X-User-Id";

/// Source of connection ids, shared by every HTTP worker.
#[derive(Default)]
pub struct ConnectionCounter(AtomicU32);

impl ConnectionCounter {
    pub fn next(&self) -> ConnectionId {
        self.0.fetch_add(1, Ordering::Relaxed).wrapping_add(1)
    }
}

#[derive(Message)]
#[rtype(result = "()")]
enum Egress {
    Deliver(ServerMessage),
    Close(CloseCause),
}

struct ConnectionActor {
    connection_id: ConnectionId,
    user_id: UserId,
    gateway_tx: GatewayTx,
    tx: ConnectionTx,
    /// Replies follow the encoding of the latest inbound frame.
    format: WireFormat,
}

impl ConnectionActor {
    fn ingress(&mut self, format: WireFormat, bytes: &[u8], ctx: &mut ws::WebsocketContext<Self>) {
        self.format = format;
        let message = match ClientMessage::decode(format, bytes) {
            Ok(message) => message,
            Err(error) => {
                log::warn!("Connection {} sent {}", self.connection_id, error);
                self.egress(ServerMessage::error(ErrorKind::Protocol, error.to_string()), ctx);
                return;
            }
        };
        let command = GatewayCommand::Message {
            connection_id: self.connection_id,
            message,
        };
        match self.gateway_tx.try_send(command) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                log::warn!("Gateway is overloaded, refusing a message from {}", self.connection_id);
                self.egress(
                    ServerMessage::error(ErrorKind::Overloaded, "server is busy, retry later"),
                    ctx,
                );
            }
            Err(TrySendError::Closed(_)) => ctx.stop(),
        }
    }

    fn egress(&self, message: ServerMessage, ctx: &mut ws::WebsocketContext<Self>) {
        log::debug!("Egress to {}: {:?}", self.connection_id, message);
        let written = match self.format {
            WireFormat::Json => message.to_json().map(|text| ctx.text(text)),
            WireFormat::Binary => message.to_bincode().map(|bytes| ctx.binary(bytes)),
        };
        if let Err(error) = written {
            log::error!("Cannot encode message for {}: {}", self.connection_id, error);
        }
    }
}

impl Actor for ConnectionActor {
    type Context = ws::WebsocketContext<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        let connect = GatewayCommand::Connect {
            connection_id: self.connection_id,
            user_id: self.user_id.clone(),
            tx: self.tx.clone(),
        };
        if self.gateway_tx.try_send(connect).is_err() {
            log::warn!("Gateway refused connection {}", self.connection_id);
            ctx.close(Some(CloseReason {
                code: CloseCode::Again,
                description: Some("server is busy".into()),
            }));
            ctx.stop();
            return;
        }

        let addr: Addr<Self> = ctx.address();
        let tx = self.tx.clone();
        let connection_id = self.connection_id;
        actix::spawn(async move {
            log::debug!("Connection {} forwarder started", connection_id);
            loop {
                let egress = match tx.recv().await {
                    Delivery::Message(message) => Egress::Deliver(message),
                    Delivery::Closed(cause) => Egress::Close(cause),
                };
                let closing = matches!(egress, Egress::Close(_));
                if addr.send(egress).await.is_err() || closing {
                    break;
                }
            }
            log::debug!("Connection {} forwarder terminated", connection_id);
        });
    }

    fn stopping(&mut self, _: &mut Self::Context) -> Running {
        self.tx.close(CloseCause::Disconnected);
        send_or_spawn(
            &self.gateway_tx,
            GatewayCommand::Disconnect {
                connection_id: self.connection_id,
            },
        );
        Running::Stop
    }
}

/// Ingress
impl StreamHandler<Result<ws::Message, ws::ProtocolError>> for ConnectionActor {
    fn handle(&mut self, msg: Result<ws::Message, ws::ProtocolError>, ctx: &mut Self::Context) {
        match msg {
            Ok(ws::Message::Ping(msg)) => ctx.pong(&msg),
            Ok(ws::Message::Text(text)) => {
                self.ingress(WireFormat::Json, text.as_bytes(), ctx);
            }
            Ok(ws::Message::Binary(bin)) => {
                log::debug!("Ingress size: {}", bin.len());
                self.ingress(WireFormat::Binary, &bin, ctx);
            }
            Ok(ws::Message::Close(reason)) => {
                ctx.close(reason);
                ctx.stop();
            }
            Ok(ws::Message::Pong(_)) | Ok(ws::Message::Nop) => (),
            Ok(ws::Message::Continuation(_)) => {
                self.egress(
                    ServerMessage::error(ErrorKind::Protocol, "fragmented frames are not supported"),
                    ctx,
                );
            }
            Err(error) => {
                log::warn!("Connection {} protocol error: {}", self.connection_id, error);
                ctx.stop();
            }
        }
    }
}

/// Egress
impl Handler<Egress> for ConnectionActor {
    type Result = ();

    fn handle(&mut self, msg: Egress, ctx: &mut ws::WebsocketContext<Self>) -> Self::Result {
        match msg {
            Egress::Deliver(message) => self.egress(message, ctx),
            Egress::Close(CloseCause::Overflow) => {
                log::warn!("Connection {} fell behind, asking it to resync", self.connection_id);
                ctx.close(Some(CloseReason {
                    code: CloseCode::Again,
                    description: Some("resync".into()),
                }));
                ctx.stop();
            }
            Egress::Close(CloseCause::Disconnected) => {
                ctx.close(None);
                ctx.stop();
            }
        }
    }
}

#[derive(Deserialize)]
pub struct WsQuery {
    user: Option<String>,
}

fn user_id_of(req: &HttpRequest, query: &WsQuery) -> Option<UserId> {
    req.headers()
        .get(USER_ID_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::to_owned)
        .or_else(|| query.user.clone())
        .filter(|user_id| !user_id.trim().is_empty())
}

pub async fn ws_index(
    req: HttpRequest,
    stream: web::Payload,
    query: web::Query<WsQuery>,
    gateway_tx: web::Data<GatewayTx>,
    counter: web::Data<ConnectionCounter>,
    config: web::Data<Config>,
) -> Result<HttpResponse, Error> {
    let user_id = match user_id_of(&req, &query) {
        Some(user_id) => user_id,
        None => return Ok(HttpResponse::Unauthorized().body("missing user identity")),
    };
    ws::start(
        ConnectionActor {
            connection_id: counter.next(),
            user_id,
            gateway_tx: gateway_tx.get_ref().clone(),
            tx: Outbox::new(config.outbox_capacity),
            format: WireFormat::Json,
        },
        &req,
        stream,
    )
}
