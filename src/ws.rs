//! # WebSocket Sessions
//!
//! Handles the RFC 6455 handshake and runs the per-connection session loop.
//! An upgrade request passes through the same middleware and validators as a
//! plain request, plus the route's optional upgrade gate, before the 101 is
//! sent. One [`Context`] then lives for the whole connection: `on_open`,
//! every `on_message`, and `on_close` all see the same custom state, while
//! the response draft and deferred queue are reset per message.
//!
//! The session loop is generic over the socket so it can run against an
//! in-memory stream in tests.

use crate::context::{Context, ResponseDraft};
use crate::error::Error;
use crate::events::{EventKind, EventPayload};
use crate::pipeline::{Engine, Resolution};
use crate::ratelimit::Transport;
use crate::route::{ContextSeed, Flow, Method, WsRoute};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use http_body_util::Full;
use hyper::body::{Bytes, Incoming};
use hyper::header::{CONNECTION, SEC_WEBSOCKET_ACCEPT, SEC_WEBSOCKET_KEY, SEC_WEBSOCKET_VERSION, UPGRADE};
use hyper::{HeaderMap, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use sha1::{Digest, Sha1};
use std::net::IpAddr;
use std::sync::Arc;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::{CloseFrame, Role, WebSocketConfig};
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, warn};

/// Fixed GUID appended to the client key per RFC 6455 §4.2.2
const WS_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// `Sec-WebSocket-Accept` value for a client key
pub(crate) fn accept_key(key: &str) -> String {
    let mut sha = Sha1::new();
    sha.update(key.as_bytes());
    sha.update(WS_GUID.as_bytes());
    BASE64.encode(sha.finalize())
}

/// Whether a request is asking for a WebSocket upgrade
pub(crate) fn is_upgrade_request(headers: &HeaderMap) -> bool {
    let wants = |name, token: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|v| v.split(',').any(|part| part.trim().eq_ignore_ascii_case(token)))
    };
    wants(UPGRADE, "websocket") && wants(CONNECTION, "upgrade")
}

fn plain(status: StatusCode, text: &str) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::from(text.to_string())));
    *response.status_mut() = status;
    response
}

/// Run the handshake: resolve the route, pass the upgrade gate, send the
/// 101, and spawn the session task on the upgraded stream.
pub(crate) async fn handle_upgrade(
    engine: Arc<Engine>,
    mut req: Request<Incoming>,
    client_ip: IpAddr,
) -> Response<Full<Bytes>> {
    let Some(key) = req
        .headers()
        .get(SEC_WEBSOCKET_KEY)
        .and_then(|v| v.to_str().ok())
        .map(str::to_owned)
    else {
        return plain(StatusCode::BAD_REQUEST, "missing Sec-WebSocket-Key\n");
    };
    let version_ok = req
        .headers()
        .get(SEC_WEBSOCKET_VERSION)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.trim() == "13");
    if !version_ok {
        return plain(StatusCode::UPGRADE_REQUIRED, "unsupported WebSocket version\n");
    }

    let target = req
        .uri()
        .path_and_query()
        .map_or_else(|| req.uri().path().to_string(), ToString::to_string);
    let mut ctx = Context::new(
        Transport::Ws,
        Method::Get,
        &target,
        req.headers().clone(),
        client_ip,
        &ContextSeed::None,
        Arc::clone(&engine.fs),
    );

    let Some(Resolution::Ws { route, params }) = engine.resolve(&ctx).await else {
        let listing = engine
            .registry
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .listing();
        engine
            .dispatcher
            .dispatch(EventKind::NotFound, &mut ctx, EventPayload::Listing(&listing))
            .await;
        engine.drain(&mut ctx).await;
        return engine.emit(&mut ctx);
    };
    ctx.params = params;
    ctx.apply_seed(&route.seed);

    if !engine.admit(&mut ctx).await
        || !engine.run_middleware(&mut ctx).await
        || !engine.run_validators(&mut ctx, &[]).await
        || !pass_gate(&engine, &mut ctx, &route).await
    {
        engine.drain(&mut ctx).await;
        return engine.emit(&mut ctx);
    }

    let accept = accept_key(&key);
    let config = WebSocketConfig::default()
        .max_message_size(Some(engine.config.message.max_size))
        .max_frame_size(Some(engine.config.message.max_size));

    tokio::spawn(async move {
        match hyper::upgrade::on(&mut req).await {
            Ok(upgraded) => {
                let io = TokioIo::new(upgraded);
                let mut socket =
                    WebSocketStream::from_raw_socket(io, Role::Server, Some(config)).await;
                session(&engine, &mut ctx, &route, &mut socket).await;
            }
            Err(e) => warn!(error = %e, "upgrade failed after 101"),
        }
    });

    let mut response = Response::new(Full::new(Bytes::new()));
    *response.status_mut() = StatusCode::SWITCHING_PROTOCOLS;
    let headers = response.headers_mut();
    headers.insert(UPGRADE, hyper::header::HeaderValue::from_static("websocket"));
    headers.insert(CONNECTION, hyper::header::HeaderValue::from_static("Upgrade"));
    if let Ok(value) = accept.parse() {
        headers.insert(SEC_WEBSOCKET_ACCEPT, value);
    }
    response
}

/// Route-level upgrade gate. Declining (by `End`, a non-2xx status, or an
/// error) raises the upgrade-error event.
async fn pass_gate(engine: &Engine, ctx: &mut Context, route: &WsRoute) -> bool {
    let Some(gate) = &route.on_upgrade else {
        return true;
    };
    let cause = match gate(ctx).await {
        Ok(Flow::Continue) if ctx.response.is_success() => return true,
        Ok(_) => Error::UpgradeRejected {
            reason: "upgrade gate declined".to_string(),
        },
        Err(e) => Error::UpgradeRejected {
            reason: e.to_string(),
        },
    };
    engine
        .dispatcher
        .dispatch(EventKind::UpgradeError, ctx, EventPayload::Cause(&cause))
        .await;
    false
}

/// Per-connection loop. The context carries over between callbacks;
/// `on_close` runs exactly once, whatever ends the session.
pub(crate) async fn session<S>(engine: &Engine, ctx: &mut Context, route: &WsRoute, socket: &mut S)
where
    S: Stream<Item = Result<Message, WsError>> + Sink<Message, Error = WsError> + Unpin,
{
    if let Some(on_open) = &route.on_open {
        if let Err(e) = on_open(ctx).await {
            warn!(path = %ctx.path, error = %e, "on_open failed");
            engine
                .dispatcher
                .dispatch(EventKind::HandlerError, ctx, EventPayload::Cause(&e))
                .await;
        }
        flush(engine, ctx, socket, true).await;
    }

    while let Some(frame) = socket.next().await {
        let msg = match frame {
            Ok(msg) => msg,
            Err(e) => {
                debug!(path = %ctx.path, error = %e, "socket error, closing session");
                break;
            }
        };
        if ctx.aborted() {
            break;
        }
        match msg {
            Message::Close(_) => break,
            Message::Ping(payload) => {
                let _ = socket.send(Message::Pong(payload)).await;
            }
            Message::Pong(_) | Message::Frame(_) => {}
            Message::Text(_) | Message::Binary(_) => {
                if msg.len() > engine.config.message.max_size {
                    let err = Error::PayloadTooLarge {
                        limit: engine.config.message.max_size,
                        actual: msg.len(),
                    };
                    warn!(path = %ctx.path, error = %err, "message dropped");
                    let _ = socket
                        .send(Message::Close(Some(CloseFrame {
                            code: CloseCode::Size,
                            reason: "message too large".into(),
                        })))
                        .await;
                    break;
                }
                let prefer_text = msg.is_text();

                // Fresh draft and queue per message; custom state persists.
                ctx.response = ResponseDraft::default();
                ctx.reset_queue();
                ctx.rate_keys.clear();
                ctx.event = None;

                if engine.admit(ctx).await && engine.run_middleware(ctx).await {
                    if let Some(on_message) = &route.on_message {
                        if let Err(e) = on_message(ctx, &msg).await {
                            warn!(path = %ctx.path, error = %e, "on_message failed");
                            engine
                                .dispatcher
                                .dispatch(EventKind::HandlerError, ctx, EventPayload::Cause(&e))
                                .await;
                        }
                    }
                }
                flush(engine, ctx, socket, prefer_text).await;
            }
        }
        if ctx.aborted() {
            break;
        }
    }

    if let Some(on_close) = &route.on_close {
        if let Err(e) = on_close(ctx).await {
            warn!(path = %ctx.path, error = %e, "on_close failed");
        }
        if let Err(e) = ctx.drain_deferred().await {
            warn!(path = %ctx.path, error = %e, "close task failed");
        }
    }
    ctx.abort();
    debug!(path = %ctx.path, "session closed");
}

/// Drain the queue and ship any drafted body as one outgoing message
async fn flush<S>(engine: &Engine, ctx: &mut Context, socket: &mut S, prefer_text: bool)
where
    S: Sink<Message, Error = WsError> + Unpin,
{
    engine.drain(ctx).await;
    if ctx.response.body.is_empty() {
        return;
    }
    let body = std::mem::take(&mut ctx.response.body);
    let msg = match String::from_utf8(body) {
        Ok(text) if prefer_text => Message::Text(text.into()),
        Ok(text) => Message::Binary(text.into_bytes().into()),
        Err(e) => Message::Binary(e.into_bytes().into()),
    };
    if let Err(e) = socket.send(msg).await {
        debug!(path = %ctx.path, error = %e, "send failed");
    }
}
