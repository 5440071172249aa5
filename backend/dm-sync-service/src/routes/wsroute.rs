use crate::error::AppError;
use crate::gateway::{IngressGateway, SubscriberId};
use crate::metrics;
use crate::middleware::bearer_token;
use crate::middleware::error_handling::map_error;
use crate::state::AppState;
use actix::{Actor, ActorContext, AsyncContext, Handler, Message as ActixMessage, StreamHandler};
use actix_web::{get, web, Error, HttpRequest, HttpResponse};
use actix_web_actors::ws;
use event_schema::{ClientFrame, ServerFrame};
use futures::StreamExt;
use serde::Deserialize;
use std::time::{Duration, Instant};
use tokio::sync::mpsc::UnboundedReceiver;
use tokio_stream::wrappers::UnboundedReceiverStream;
use uuid::Uuid;

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5);
const CLIENT_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Deserialize)]
pub struct WsParams {
    pub thread_id: Uuid,
    pub token: Option<String>,
}

// Serialized server frame for this connection
#[derive(ActixMessage)]
#[rtype(result = "()")]
struct RoomFrame(String);

struct WsSession {
    thread_id: Uuid,
    user_id: Uuid,
    subscriber_id: SubscriberId,
    gateway: IngressGateway,
    hb: Instant,
    room: Option<UnboundedReceiver<String>>,
}

fn error_frame(thread_id: Uuid, client_msg_id: Option<Uuid>, err: &AppError) -> Option<String> {
    let (_, body) = map_error(err);
    ServerFrame::Error {
        thread_id,
        client_msg_id,
        code: body.code,
        message: body.message,
    }
    .to_json()
    .ok()
}

impl WsSession {
    fn new(
        thread_id: Uuid,
        user_id: Uuid,
        subscriber_id: SubscriberId,
        gateway: IngressGateway,
        room: UnboundedReceiver<String>,
    ) -> Self {
        Self {
            thread_id,
            user_id,
            subscriber_id,
            gateway,
            hb: Instant::now(),
            room: Some(room),
        }
    }

    fn hb(&self, ctx: &mut ws::WebsocketContext<Self>) {
        ctx.run_interval(HEARTBEAT_INTERVAL, |act, ctx| {
            if Instant::now().duration_since(act.hb) > CLIENT_TIMEOUT {
                tracing::warn!(user_id = %act.user_id, "websocket heartbeat failed, disconnecting");
                ctx.stop();
                return;
            }
            ctx.ping(b"");
        });
    }

    fn reject(
        &self,
        ctx: &mut ws::WebsocketContext<Self>,
        client_msg_id: Option<Uuid>,
        err: AppError,
    ) {
        if let Some(json) = error_frame(self.thread_id, client_msg_id, &err) {
            ctx.text(json);
        }
    }

    fn dispatch(&self, frame: ClientFrame, ctx: &mut ws::WebsocketContext<Self>) {
        let gateway = self.gateway.clone();
        let user_id = self.user_id;
        let addr = ctx.address();

        match frame {
            ClientFrame::SendMessage {
                thread_id,
                body,
                client_msg_id,
            } => {
                actix::spawn(async move {
                    if let Err(e) = gateway.send(thread_id, user_id, body, client_msg_id).await {
                        tracing::warn!(%thread_id, %client_msg_id, error = %e, "send rejected");
                        if let Some(json) = error_frame(thread_id, Some(client_msg_id), &e) {
                            addr.do_send(RoomFrame(json));
                        }
                    }
                });
            }
            ClientFrame::Typing { thread_id, typing } => {
                actix::spawn(async move {
                    gateway.typing(thread_id, user_id, typing).await;
                });
            }
            ClientFrame::Presence { thread_id, online } => {
                actix::spawn(async move {
                    gateway.presence(thread_id, user_id, online).await;
                });
            }
            ClientFrame::Delivered {
                thread_id,
                up_to_message_id,
            } => {
                actix::spawn(async move {
                    if let Err(e) = gateway
                        .mark_delivered(thread_id, user_id, up_to_message_id)
                        .await
                    {
                        if let Some(json) = error_frame(thread_id, None, &e) {
                            addr.do_send(RoomFrame(json));
                        }
                    }
                });
            }
            ClientFrame::MarkRead {
                thread_id,
                up_to_message_id,
            } => {
                actix::spawn(async move {
                    if let Err(e) = gateway.mark_read(thread_id, user_id, up_to_message_id).await {
                        if let Some(json) = error_frame(thread_id, None, &e) {
                            addr.do_send(RoomFrame(json));
                        }
                    }
                });
            }
        }
    }
}

impl Actor for WsSession {
    type Context = ws::WebsocketContext<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        tracing::info!(
            user_id = %self.user_id,
            thread_id = %self.thread_id,
            "websocket session started"
        );
        metrics::connection_opened();
        self.hb(ctx);

        if let Some(room) = self.room.take() {
            ctx.add_message_stream(UnboundedReceiverStream::new(room).map(RoomFrame));
        }

        let gateway = self.gateway.clone();
        let (thread_id, user_id) = (self.thread_id, self.user_id);
        actix::spawn(async move {
            gateway.presence(thread_id, user_id, true).await;
        });
    }

    fn stopped(&mut self, _ctx: &mut Self::Context) {
        tracing::info!(
            user_id = %self.user_id,
            thread_id = %self.thread_id,
            "websocket session stopped"
        );
        metrics::connection_closed();

        let gateway = self.gateway.clone();
        let (thread_id, user_id, subscriber_id) =
            (self.thread_id, self.user_id, self.subscriber_id);
        actix::spawn(async move {
            gateway
                .registry()
                .remove_subscriber(thread_id, subscriber_id)
                .await;
            gateway.presence(thread_id, user_id, false).await;
        });
    }
}

impl Handler<RoomFrame> for WsSession {
    type Result = ();

    fn handle(&mut self, msg: RoomFrame, ctx: &mut Self::Context) {
        ctx.text(msg.0);
    }
}

impl StreamHandler<Result<ws::Message, ws::ProtocolError>> for WsSession {
    fn handle(&mut self, msg: Result<ws::Message, ws::ProtocolError>, ctx: &mut Self::Context) {
        match msg {
            Ok(ws::Message::Ping(msg)) => {
                self.hb = Instant::now();
                ctx.pong(&msg);
            }
            Ok(ws::Message::Pong(_)) => {
                self.hb = Instant::now();
            }
            Ok(ws::Message::Text(text)) => {
                self.hb = Instant::now();
                match serde_json::from_str::<ClientFrame>(&text) {
                    Ok(frame) if frame.thread_id() != self.thread_id => {
                        self.reject(
                            ctx,
                            frame.client_msg_id(),
                            AppError::BadRequest("frame targets a different thread".into()),
                        );
                    }
                    Ok(frame) => self.dispatch(frame, ctx),
                    Err(e) => {
                        tracing::warn!(error = %e, "unparseable client frame");
                        self.reject(ctx, None, AppError::BadRequest(e.to_string()));
                    }
                }
            }
            Ok(ws::Message::Binary(_)) => {
                self.reject(
                    ctx,
                    None,
                    AppError::BadRequest("binary frames are not supported".into()),
                );
            }
            Ok(ws::Message::Close(reason)) => {
                tracing::debug!(?reason, "websocket close received");
                ctx.close(reason);
                ctx.stop();
            }
            Err(e) => {
                tracing::warn!(error = %e, "websocket protocol error");
                ctx.stop();
            }
            _ => {}
        }
    }
}

/// GET /ws?thread_id=..&token=..
/// The token may also arrive as a Bearer header. The caller must be a
/// participant of the thread before the upgrade is accepted.
#[get("/ws")]
pub async fn ws_handler(
    req: HttpRequest,
    stream: web::Payload,
    state: web::Data<AppState>,
    query: web::Query<WsParams>,
) -> Result<HttpResponse, Error> {
    let params = query.into_inner();

    let token = params
        .token
        .clone()
        .or_else(|| bearer_token(&req))
        .ok_or(AppError::Unauthorized)?;
    let user_id = state.jwt.verify(&token)?;
    state.gateway.authorize(params.thread_id, user_id).await?;

    let (subscriber_id, room) = state
        .registry
        .add_subscriber(params.thread_id, user_id)
        .await;

    let session = WsSession::new(
        params.thread_id,
        user_id,
        subscriber_id,
        state.gateway.clone(),
        room,
    );

    ws::start(session, &req, stream)
}
