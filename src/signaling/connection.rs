#![forbid(unsafe_code)]

// Per-connection request pump: token-bound identity, request dispatch,
// disconnect supervision

use crate::auth::token::TokenClaims;
use crate::media::{MediaEngine, TransportInfo};
use crate::metrics::ServerMetrics;
use crate::room::{RoomProducer, RoomRegistry};
use crate::session::{ConnHandle, Peer, SessionRegistry, SharedPeer, GRACE_WINDOW};
use crate::signaling::protocol::{
    ConnectTransportPayload, ConsumeData, ConsumePayload, ConsumerControlPayload,
    CreateTransportPayload, JoinData, JoinPayload, ListProducersPayload, ProducePayload,
    ProducerControlPayload, RequestEnvelope, ResponseEnvelope, ServerEvent, SignalError,
};
use axum::extract::ws::{close_code, CloseFrame, Message, WebSocket};
use futures_util::{SinkExt, StreamExt};
use mediasoup::prelude::*;
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::sync::Mutex as TokioMutex;
use tokio::sync::OwnedSemaphorePermit;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Bounded outbound queue per client; events beyond this are dropped.
const CHANNEL_CAPACITY: usize = 64;

/// Everything a request handler needs for one authenticated connection.
struct ConnCtx {
    sessions: Arc<SessionRegistry>,
    rooms: Arc<RoomRegistry>,
    engine: Arc<MediaEngine>,
    metrics: ServerMetrics,
    claims: TokenClaims,
    conn: ConnHandle,
}

/// Drives one WebSocket from accept to disconnect. `auth` is the token gate
/// verdict; a rejected token closes 1008 with the failure kind and nothing
/// else is ever sent on the socket.
#[allow(clippy::too_many_arguments)]
pub async fn handle_connection(
    mut socket: WebSocket,
    sessions: Arc<SessionRegistry>,
    rooms: Arc<RoomRegistry>,
    engine: Arc<MediaEngine>,
    metrics: ServerMetrics,
    auth: Result<TokenClaims, String>,
    _permit: OwnedSemaphorePermit,
) {
    let claims = match auth {
        Ok(claims) => claims,
        Err(reason) => {
            metrics.inc_auth_failures();
            info!("rejecting connection: {}", reason);
            let _ = socket
                .send(Message::Close(Some(CloseFrame {
                    code: close_code::POLICY,
                    reason: reason.into(),
                })))
                .await;
            return;
        }
    };

    info!(
        "connection accepted for peer {} in room {}",
        claims.peer_id, claims.room_id
    );
    metrics.inc_connections();
    let _active = metrics.active_connection_guard();

    let (mut ws_sender, mut ws_receiver) = socket.split();
    let (tx, mut rx) = mpsc::channel::<Arc<String>>(CHANNEL_CAPACITY);
    let (kick_tx, mut kick_rx) = mpsc::channel::<(u16, String)>(1);
    let conn = ConnHandle::new(tx.clone(), kick_tx);

    // close instruction for the send task, used on supersede
    let (close_tx, mut close_rx) = mpsc::channel::<(u16, String)>(1);

    let send_metrics = metrics.clone();
    let send_task = tokio::spawn(async move {
        loop {
            tokio::select! {
                maybe = rx.recv() => match maybe {
                    Some(json) => {
                        send_metrics.inc_messages_sent();
                        if ws_sender
                            .send(Message::Text((*json).clone().into()))
                            .await
                            .is_err()
                        {
                            break;
                        }
                    }
                    None => break,
                },
                frame = close_rx.recv() => {
                    if let Some((code, reason)) = frame {
                        let _ = ws_sender
                            .send(Message::Close(Some(CloseFrame {
                                code,
                                reason: reason.into(),
                            })))
                            .await;
                    }
                    break;
                }
            }
        }
    });

    let ctx = ConnCtx {
        sessions: sessions.clone(),
        rooms: rooms.clone(),
        engine,
        metrics: metrics.clone(),
        claims,
        conn: conn.clone(),
    };

    // unsolicited greeting with the token-bound identity
    send_event(
        &ctx.conn,
        &ServerEvent::Welcome {
            peer_id: ctx.claims.peer_id.clone(),
            session_id: ctx.claims.session_id.clone(),
            hint: "send join or resumeSession".to_string(),
            existing_peers: None,
            existing_producers: None,
        },
    );

    loop {
        tokio::select! {
            maybe = ws_receiver.next() => {
                let msg = match maybe {
                    Some(Ok(msg)) => msg,
                    _ => break,
                };
                match msg {
                    Message::Text(text) => {
                        ctx.metrics.inc_messages_received();
                        let response = match serde_json::from_str::<RequestEnvelope>(&text) {
                            Ok(envelope) => dispatch(&ctx, envelope).await,
                            Err(e) => {
                                warn!(
                                    "unparseable request from peer {}: {}",
                                    ctx.claims.peer_id, e
                                );
                                ResponseEnvelope::err(Value::Null, "bad envelope")
                            }
                        };
                        if !response.ok {
                            ctx.metrics.inc_errors();
                        }
                        send_response(&ctx.conn, &response);
                    }
                    Message::Close(_) => {
                        debug!("peer {} closed the socket", ctx.claims.peer_id);
                        break;
                    }
                    Message::Ping(_) | Message::Pong(_) => {}
                    _ => {
                        warn!("unexpected binary frame from peer {}", ctx.claims.peer_id);
                    }
                }
            }
            kick = kick_rx.recv() => {
                if let Some((code, reason)) = kick {
                    debug!("connection for peer {} superseded", ctx.claims.peer_id);
                    let _ = close_tx.try_send((code, reason));
                }
                break;
            }
        }
    }

    // Disconnect: if a live peer still owns this socket, start the grace
    // window. A superseded socket no longer matches and arms nothing.
    if let Some(peer_lock) = sessions.find_by_sender(&tx).await {
        let mut peer = peer_lock.lock().await;
        if peer.conn.as_ref().is_some_and(|c| c.same_sender(&tx)) {
            let session_id = peer.session_id.clone();
            info!(
                "peer {} (session {}) disconnected, arming {}s grace",
                peer.peer_id,
                session_id,
                GRACE_WINDOW.as_secs()
            );
            let rooms_at_expiry = rooms.clone();
            let sessions_at_expiry = sessions.clone();
            let metrics_at_expiry = metrics.clone();
            sessions.arm_grace(&mut peer, GRACE_WINDOW, async move {
                metrics_at_expiry.inc_grace_expiries();
                rooms_at_expiry
                    .destroy_peer(&sessions_at_expiry, &session_id)
                    .await;
            });
        }
    }

    drop(ctx);
    drop(conn);
    drop(tx);
    let _ = send_task.await;
}

/// Routes one request and turns the outcome into a response envelope. A
/// successful join/resume additionally pushes the follow-up welcome with the
/// room snapshot.
async fn dispatch(ctx: &ConnCtx, envelope: RequestEnvelope) -> ResponseEnvelope {
    let request_id = envelope.request_id.clone();
    match route(ctx, &envelope).await {
        Ok(Reply::Data(data)) => ResponseEnvelope::ok(request_id, data),
        Ok(Reply::Joined(data)) => {
            let response = ResponseEnvelope::ok(
                request_id,
                serde_json::to_value(&data).unwrap_or(Value::Null),
            );
            send_event(
                &ctx.conn,
                &ServerEvent::Welcome {
                    peer_id: data.peer_id.clone(),
                    session_id: Some(data.session_id.clone()),
                    hint: "joined".to_string(),
                    existing_peers: Some(data.existing_peers),
                    existing_producers: Some(data.existing_producers),
                },
            );
            response
        }
        Err(error) => {
            debug!(
                "request {} from peer {} failed: {}",
                envelope.kind, ctx.claims.peer_id, error
            );
            ResponseEnvelope::err(request_id, &error.to_string())
        }
    }
}

enum Reply {
    Data(Value),
    Joined(JoinData),
}

async fn route(ctx: &ConnCtx, envelope: &RequestEnvelope) -> Result<Reply, SignalError> {
    match envelope.kind.as_str() {
        "join" => handle_join(ctx, parse(envelope)?, false).await.map(Reply::Joined),
        "resumeSession" => handle_join(ctx, parse(envelope)?, true).await.map(Reply::Joined),
        "listProducers" | "getRoomProducers" => {
            handle_list_producers(ctx, parse(envelope)?).await.map(Reply::Data)
        }
        "createTransport" => handle_create_transport(ctx, parse(envelope)?).await.map(Reply::Data),
        "connectTransport" => {
            handle_connect_transport(ctx, parse(envelope)?).await.map(Reply::Data)
        }
        "produce" => handle_produce(ctx, parse(envelope)?).await.map(Reply::Data),
        "consume" => handle_consume(ctx, parse(envelope)?).await.map(Reply::Data),
        "pauseProducer" => {
            handle_producer_control(ctx, parse(envelope)?, true).await.map(Reply::Data)
        }
        "resumeProducer" => {
            handle_producer_control(ctx, parse(envelope)?, false).await.map(Reply::Data)
        }
        "pauseConsumer" => {
            handle_consumer_control(ctx, parse(envelope)?, true).await.map(Reply::Data)
        }
        "resumeConsumer" => {
            handle_consumer_control(ctx, parse(envelope)?, false).await.map(Reply::Data)
        }
        _ => Err(SignalError::UnknownType),
    }
}

fn parse<T: serde::de::DeserializeOwned>(envelope: &RequestEnvelope) -> Result<T, SignalError> {
    serde_json::from_value(envelope.payload.clone())
        .map_err(|e| SignalError::BadPayload(e.to_string()))
}

/// Resolves the effective sessionId for this request against the token
/// binding: payload wins when both agree, a conflict is a mismatch, and a
/// request with neither is unauthenticated.
fn resolve_session_id(
    claims: &TokenClaims,
    payload_session: Option<&str>,
) -> Result<Option<String>, SignalError> {
    match (payload_session, claims.session_id.as_deref()) {
        (Some(from_payload), Some(from_token)) if from_payload != from_token => {
            Err(SignalError::SessionIdMismatch)
        }
        (Some(from_payload), _) => Ok(Some(from_payload.to_string())),
        (None, Some(from_token)) => Ok(Some(from_token.to_string())),
        (None, None) => Ok(None),
    }
}

/// Cross-cutting peer resolution for every request after the handshake:
/// the sessionId must resolve to a live peer whose token bindings hold.
async fn resolve_peer(
    ctx: &ConnCtx,
    payload_session: Option<&str>,
) -> Result<SharedPeer, SignalError> {
    let session_id =
        resolve_session_id(&ctx.claims, payload_session)?.ok_or(SignalError::NotAuthed)?;
    let peer_lock = ctx
        .sessions
        .lookup(&session_id)
        .ok_or(SignalError::InvalidSessionId)?;
    {
        let peer = peer_lock.lock().await;
        if peer.peer_id != ctx.claims.peer_id {
            return Err(SignalError::PeerIdMismatch);
        }
        if peer
            .room_id
            .as_deref()
            .is_some_and(|room_id| room_id != ctx.claims.room_id)
        {
            return Err(SignalError::RoomIdMismatch);
        }
    }
    Ok(peer_lock)
}

/// join and resumeSession share the adopt path: same token-bound identity,
/// grace disarmed, media silently reset, a still-held prior socket kicked
/// with a normal close.
async fn handle_join(
    ctx: &ConnCtx,
    payload: JoinPayload,
    resume: bool,
) -> Result<JoinData, SignalError> {
    let room_id = payload.room_id.ok_or(SignalError::RoomIdRequired)?;
    if room_id != ctx.claims.room_id {
        return Err(SignalError::RoomIdMismatch);
    }
    let session_id = resolve_session_id(&ctx.claims, payload.session_id.as_deref())?
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    let (mut peer, adopting) = loop {
        let (peer_lock, created) = if resume {
            match ctx.sessions.lookup(&session_id) {
                Some(existing) => (existing, false),
                None => return Err(SignalError::PeerNotFound),
            }
        } else {
            ctx.sessions.get_or_insert_with(&session_id, || {
                Arc::new(TokioMutex::new(Peer::new(
                    session_id.clone(),
                    ctx.claims.peer_id.clone(),
                )))
            })
        };
        let peer = peer_lock.clone().lock_owned().await;
        // The record can be destroyed by grace expiry while we wait for its
        // lock; a vanished registration means this identity starts over.
        if !created && !ctx.sessions.is_registered(&session_id, &peer_lock) {
            continue;
        }
        break (peer, !created);
    };

    if adopting {
        if peer.peer_id != ctx.claims.peer_id {
            return Err(SignalError::PeerIdMismatch);
        }
        if peer
            .room_id
            .as_deref()
            .is_some_and(|current| current != room_id)
        {
            return Err(SignalError::RoomIdMismatch);
        }
        ctx.sessions.disarm_grace(&mut peer);
        ctx.rooms.reset_peer_media(&mut peer).await;
        if let Some(prior) = peer.conn.take() {
            if !prior.same_socket(&ctx.conn) {
                prior.kick(close_code::NORMAL, "superseded");
            }
        }
    }
    peer.conn = Some(ctx.conn.clone());

    let (rtp_capabilities, existing_peers, existing_producers) = ctx
        .rooms
        .join_peer(&mut peer, &ctx.conn, &room_id, !resume)
        .await?;

    if resume {
        ctx.metrics.inc_resumes();
        info!(
            "peer {} resumed session {} in room {}",
            peer.peer_id, session_id, room_id
        );
    } else {
        ctx.metrics.inc_joins();
        info!(
            "peer {} joined room {} (session {})",
            peer.peer_id, room_id, session_id
        );
    }

    Ok(JoinData {
        room_id,
        session_id: peer.session_id.clone(),
        peer_id: peer.peer_id.clone(),
        rtp_capabilities,
        existing_peers,
        existing_producers,
    })
}

async fn handle_list_producers(
    ctx: &ConnCtx,
    payload: ListProducersPayload,
) -> Result<Value, SignalError> {
    if payload
        .room_id
        .as_deref()
        .is_some_and(|room_id| room_id != ctx.claims.room_id)
    {
        return Err(SignalError::RoomIdMismatch);
    }
    // a sessionId, when supplied, must still resolve to a live peer
    if payload.session_id.is_some() {
        resolve_peer(ctx, payload.session_id.as_deref()).await?;
    }
    let room_lock = ctx
        .rooms
        .get(&ctx.claims.room_id)
        .ok_or(SignalError::RoomNotFound)?;
    let room = room_lock.read().await;
    Ok(json!({ "list": room.producer_list() }))
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Direction {
    Send,
    Recv,
}

fn parse_direction(direction: Option<&str>) -> Result<Direction, SignalError> {
    match direction {
        Some("send") => Ok(Direction::Send),
        Some("recv") => Ok(Direction::Recv),
        _ => Err(SignalError::InvalidDirection),
    }
}

async fn handle_create_transport(
    ctx: &ConnCtx,
    payload: CreateTransportPayload,
) -> Result<Value, SignalError> {
    let direction = parse_direction(payload.direction.as_deref())?;
    let peer_lock = resolve_peer(ctx, payload.session_id.as_deref()).await?;
    let mut peer = peer_lock.lock().await;
    let room_id = peer.room_id.clone().ok_or(SignalError::RoomNotJoined)?;
    let room_lock = ctx.rooms.get(&room_id).ok_or(SignalError::RoomNotFound)?;
    let router = room_lock.read().await.router.clone();

    // replace any existing transport of this direction
    match direction {
        Direction::Send => peer.send_transport = None,
        Direction::Recv => peer.recv_transport = None,
    }

    let transport = ctx.engine.create_webrtc_transport(&router).await?;
    let info = TransportInfo::from(&transport);
    watch_dtls_close(&transport, &peer_lock);

    debug!(
        "created {} transport {} for peer {}",
        if direction == Direction::Send { "send" } else { "recv" },
        info.id,
        peer.peer_id
    );
    match direction {
        Direction::Send => peer.send_transport = Some(transport),
        Direction::Recv => peer.recv_transport = Some(transport),
    }

    Ok(serde_json::to_value(info).unwrap_or(Value::Null))
}

/// Transports self-clear when DTLS reaches closed: dropping the peer's handle
/// closes the engine object and frees the slot for a fresh createTransport.
fn watch_dtls_close(transport: &WebRtcTransport, peer_lock: &SharedPeer) {
    let transport_id = transport.id().to_string();
    let peer_lock = Arc::clone(peer_lock);
    let runtime = tokio::runtime::Handle::current();
    transport
        .on_dtls_state_change(move |state| {
            if state == DtlsState::Closed {
                let peer_lock = Arc::clone(&peer_lock);
                let transport_id = transport_id.clone();
                runtime.spawn(async move {
                    let mut peer = peer_lock.lock().await;
                    if peer
                        .send_transport
                        .as_ref()
                        .is_some_and(|t| t.id().to_string() == transport_id)
                    {
                        peer.send_transport = None;
                        warn!(
                            "send transport {} of peer {} closed by DTLS",
                            transport_id, peer.peer_id
                        );
                    } else if peer
                        .recv_transport
                        .as_ref()
                        .is_some_and(|t| t.id().to_string() == transport_id)
                    {
                        peer.recv_transport = None;
                        warn!(
                            "recv transport {} of peer {} closed by DTLS",
                            transport_id, peer.peer_id
                        );
                    }
                });
            }
        })
        .detach();
}

async fn handle_connect_transport(
    ctx: &ConnCtx,
    payload: ConnectTransportPayload,
) -> Result<Value, SignalError> {
    let direction = parse_direction(payload.direction.as_deref())?;
    let dtls_parameters = payload
        .dtls_parameters
        .ok_or(SignalError::MissingDtlsParameters)?;
    let peer_lock = resolve_peer(ctx, payload.session_id.as_deref()).await?;
    let peer = peer_lock.lock().await;
    let transport = match direction {
        Direction::Send => peer.send_transport.as_ref(),
        Direction::Recv => peer.recv_transport.as_ref(),
    }
    .ok_or(SignalError::TransportNotFound)?;

    ctx.engine.connect_transport(transport, dtls_parameters).await?;
    Ok(json!({ "connected": true }))
}

async fn handle_produce(ctx: &ConnCtx, payload: ProducePayload) -> Result<Value, SignalError> {
    let kind = match payload.kind.as_deref() {
        Some("audio") => MediaKind::Audio,
        Some("video") => MediaKind::Video,
        _ => return Err(SignalError::InvalidKind),
    };
    let rtp_parameters = payload
        .rtp_parameters
        .ok_or(SignalError::MissingRtpParameters)?;
    let peer_lock = resolve_peer(ctx, payload.session_id.as_deref()).await?;
    let mut peer = peer_lock.lock().await;
    let room_id = peer.room_id.clone().ok_or(SignalError::RoomNotJoined)?;
    let transport = peer
        .send_transport
        .as_ref()
        .ok_or(SignalError::SendTransportNotReady)?;

    let producer = ctx.engine.produce(transport, kind, rtp_parameters).await?;
    let producer_id = producer.id().to_string();
    peer.producers.insert(producer_id.clone(), producer.clone());

    // the producer must be in both the peer map and the room index before
    // anyone hears about it
    let room_lock = ctx.rooms.get(&room_id).ok_or(SignalError::RoomNotFound)?;
    let mut room = room_lock.write().await;
    room.producers.insert(
        producer_id.clone(),
        RoomProducer {
            peer_id: peer.peer_id.clone(),
            producer: producer.clone(),
            kind,
        },
    );
    if kind == MediaKind::Audio {
        if let Err(e) = ctx
            .engine
            .attach_to_level_observer(&room.level_observer, producer.id())
            .await
        {
            warn!(
                "could not attach producer {} to level observer: {}",
                producer_id, e
            );
        }
    }
    room.broadcast(
        &ServerEvent::NewProducer {
            producer_id: producer_id.clone(),
            peer_id: peer.peer_id.clone(),
            kind,
        },
        Some(&peer.peer_id),
    );
    drop(room);

    ctx.metrics.inc_producers();
    info!(
        "peer {} producing {:?} as {} in room {}",
        peer.peer_id, kind, producer_id, room_id
    );
    Ok(json!({ "producerId": producer_id }))
}

async fn handle_consume(ctx: &ConnCtx, payload: ConsumePayload) -> Result<Value, SignalError> {
    let producer_id = payload.producer_id.ok_or(SignalError::ProducerNotFound)?;
    let rtp_capabilities = payload
        .rtp_capabilities
        .ok_or(SignalError::MissingRtpCapabilities)?;
    let peer_lock = resolve_peer(ctx, payload.session_id.as_deref()).await?;
    let mut peer = peer_lock.lock().await;
    let room_id = peer.room_id.clone().ok_or(SignalError::RoomNotJoined)?;
    let room_lock = ctx.rooms.get(&room_id).ok_or(SignalError::RoomNotFound)?;

    let (owner, router) = {
        let room = room_lock.read().await;
        let entry = room
            .producers
            .get(&producer_id)
            .ok_or(SignalError::ProducerNotFound)?;
        (entry.peer_id.clone(), room.router.clone())
    };
    if owner == peer.peer_id {
        return Err(SignalError::CannotConsumeSelf);
    }
    let target: ProducerId = producer_id
        .parse()
        .map_err(|_| SignalError::ProducerNotFound)?;
    if !ctx.engine.can_consume(&router, &target, &rtp_capabilities) {
        return Err(SignalError::CannotConsume);
    }
    let transport = peer
        .recv_transport
        .as_ref()
        .ok_or(SignalError::RecvTransportNotReady)?;

    let consumer = ctx.engine.consume(transport, target, rtp_capabilities).await?;
    let data = ConsumeData {
        id: consumer.id().to_string(),
        producer_id,
        kind: consumer.kind(),
        rtp_parameters: consumer.rtp_parameters().clone(),
    };
    peer.consumers.insert(data.id.clone(), consumer);

    ctx.metrics.inc_consumers();
    debug!(
        "peer {} consuming {} as {}",
        peer.peer_id, data.producer_id, data.id
    );
    Ok(serde_json::to_value(data).unwrap_or(Value::Null))
}

async fn handle_producer_control(
    ctx: &ConnCtx,
    payload: ProducerControlPayload,
    pause: bool,
) -> Result<Value, SignalError> {
    let producer_id = payload.producer_id.ok_or(SignalError::ProducerNotFound)?;
    let peer_lock = resolve_peer(ctx, payload.session_id.as_deref()).await?;
    let peer = peer_lock.lock().await;
    let producer = peer
        .producers
        .get(&producer_id)
        .ok_or(SignalError::ProducerNotFound)?;

    if pause {
        ctx.engine.pause_producer(producer).await?;
        Ok(json!({ "paused": true }))
    } else {
        ctx.engine.resume_producer(producer).await?;
        Ok(json!({ "resumed": true }))
    }
}

async fn handle_consumer_control(
    ctx: &ConnCtx,
    payload: ConsumerControlPayload,
    pause: bool,
) -> Result<Value, SignalError> {
    let consumer_id = payload.consumer_id.ok_or(SignalError::ConsumerNotFound)?;
    let peer_lock = resolve_peer(ctx, payload.session_id.as_deref()).await?;
    let peer = peer_lock.lock().await;
    let consumer = peer
        .consumers
        .get(&consumer_id)
        .ok_or(SignalError::ConsumerNotFound)?;

    if pause {
        ctx.engine.pause_consumer(consumer).await?;
    } else {
        ctx.engine.resume_consumer(consumer).await?;
    }
    Ok(json!({}))
}

fn send_event(conn: &ConnHandle, event: &ServerEvent) {
    if let Ok(json) = serde_json::to_string(event) {
        conn.send_json(Arc::new(json));
    }
}

fn send_response(conn: &ConnHandle, response: &ResponseEnvelope) {
    if let Ok(json) = serde_json::to_string(response) {
        conn.send_json(Arc::new(json));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn direction_parsing() {
        assert!(matches!(
            parse_direction(Some("send")),
            Ok(Direction::Send)
        ));
        assert!(matches!(
            parse_direction(Some("recv")),
            Ok(Direction::Recv)
        ));
        assert!(matches!(
            parse_direction(Some("sideways")),
            Err(SignalError::InvalidDirection)
        ));
        assert!(matches!(
            parse_direction(None),
            Err(SignalError::InvalidDirection)
        ));
    }

    #[test]
    fn session_id_resolution_against_token_binding() {
        let claims = TokenClaims {
            room_id: "r1".to_string(),
            peer_id: "p1".to_string(),
            session_id: Some("s1".to_string()),
            jti: "j1".to_string(),
            iat: 0,
            exp: 1,
        };
        assert_eq!(
            resolve_session_id(&claims, Some("s1")).unwrap(),
            Some("s1".to_string())
        );
        assert_eq!(
            resolve_session_id(&claims, None).unwrap(),
            Some("s1".to_string())
        );
        assert!(matches!(
            resolve_session_id(&claims, Some("other")),
            Err(SignalError::SessionIdMismatch)
        ));

        let unbound = TokenClaims {
            session_id: None,
            ..claims
        };
        assert_eq!(
            resolve_session_id(&unbound, Some("s9")).unwrap(),
            Some("s9".to_string())
        );
        assert_eq!(resolve_session_id(&unbound, None).unwrap(), None);
    }
}
