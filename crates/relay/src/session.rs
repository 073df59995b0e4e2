// y-websocket collaboration rooms.
//
// One room per document id. The first connection binds persisted state into
// the room's doc; the last disconnect writes it back while the room is still
// registered, so a reconnect during the flush reuses the in-memory doc.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, PoisonError};

use anyhow::{Context, Result};
use axum::extract::ws::{Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, info, warn};
use yrs::encoding::read::Cursor;
use yrs::sync::{Awareness, DefaultProtocol, Message, MessageReader, Protocol, SyncMessage};
use yrs::updates::decoder::{Decode, DecoderV1};
use yrs::updates::encoder::Encode;
use yrs::{Doc, ReadTxn, Transact, Update};

use crate::gateway::PersistenceGateway;

const UPDATE_BUFFER_SIZE: usize = 256;

struct Room {
    doc_id: String,
    doc: Doc,
    awareness: Mutex<Awareness>,
    updates_tx: broadcast::Sender<(u64, Vec<u8>)>,
    connections: AtomicUsize,
    bound: Mutex<bool>,
}

impl Room {
    fn new(doc_id: &str) -> Self {
        let doc = Doc::new();
        let (updates_tx, _) = broadcast::channel(UPDATE_BUFFER_SIZE);
        Self {
            doc_id: doc_id.to_owned(),
            awareness: Mutex::new(Awareness::new(doc.clone())),
            doc,
            updates_tx,
            connections: AtomicUsize::new(0),
            bound: Mutex::new(false),
        }
    }
}

/// Open collaboration rooms keyed by document id.
pub struct SessionRegistry {
    gateway: Arc<PersistenceGateway>,
    rooms: StdMutex<HashMap<String, Arc<Room>>>,
    next_client_id: AtomicU64,
}

impl SessionRegistry {
    pub fn new(gateway: Arc<PersistenceGateway>) -> Self {
        Self {
            gateway,
            rooms: StdMutex::new(HashMap::new()),
            next_client_id: AtomicU64::new(1),
        }
    }

    pub fn router(self: Arc<Self>) -> Router {
        Router::new().route("/{*doc_id}", get(session_route)).with_state(self)
    }

    pub fn is_open(&self, doc_id: &str) -> bool {
        self.rooms().contains_key(doc_id)
    }

    pub fn open_rooms(&self) -> usize {
        self.rooms().len()
    }

    /// Persist and drop every open room. Called once connections stopped.
    pub async fn close_all(&self) {
        let rooms: Vec<Arc<Room>> = self.rooms().drain().map(|(_, room)| room).collect();
        let mut closed = 0usize;
        for room in rooms {
            let mut bound = room.bound.lock().await;
            if *bound {
                self.gateway.write_state(&room.doc_id, &room.doc).await;
                *bound = false;
                closed += 1;
            }
        }
        info!(closed, "closed collaboration rooms");
    }

    async fn join(&self, doc_id: &str) -> Arc<Room> {
        let room = {
            let mut rooms = self.rooms();
            let room = rooms.entry(doc_id.to_owned()).or_insert_with(|| Arc::new(Room::new(doc_id)));
            room.connections.fetch_add(1, Ordering::SeqCst);
            Arc::clone(room)
        };

        let mut bound = room.bound.lock().await;
        if !*bound {
            self.gateway.bind_state(&room.doc_id, &room.doc).await;
            *bound = true;
        }
        drop(bound);
        room
    }

    async fn leave(&self, room: &Arc<Room>) {
        if room.connections.fetch_sub(1, Ordering::SeqCst) != 1 {
            return;
        }

        {
            let mut bound = room.bound.lock().await;
            if *bound && room.connections.load(Ordering::SeqCst) == 0 {
                self.gateway.write_state(&room.doc_id, &room.doc).await;
                *bound = false;
            }
        }

        let mut rooms = self.rooms();
        let idle = rooms.get(&room.doc_id).is_some_and(|current| {
            Arc::ptr_eq(current, room) && current.connections.load(Ordering::SeqCst) == 0
        });
        if idle {
            rooms.remove(&room.doc_id);
            debug!(doc_id = %room.doc_id, "room closed");
        }
    }

    fn rooms(&self) -> MutexGuard<'_, HashMap<String, Arc<Room>>> {
        self.rooms.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Authentication hook for WebSocket upgrades. Admits every connection to a
/// named document.
pub fn authorize_upgrade(_headers: &HeaderMap, doc_id: &str) -> bool {
    !doc_id.is_empty()
}

/// Serve `router` until `shutdown` resolves. In-flight connections are
/// drained before this returns.
pub async fn serve<F>(listener: tokio::net::TcpListener, router: Router, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown)
        .await
        .context("relay server exited unexpectedly")
}

async fn session_route(
    ws: WebSocketUpgrade,
    Path(doc_id): Path<String>,
    headers: HeaderMap,
    State(registry): State<Arc<SessionRegistry>>,
) -> Response {
    if !authorize_upgrade(&headers, &doc_id) {
        return StatusCode::FORBIDDEN.into_response();
    }
    ws.on_upgrade(move |socket| handle_socket(socket, registry, doc_id))
}

async fn handle_socket(mut socket: WebSocket, registry: Arc<SessionRegistry>, doc_id: String) {
    let client_id = registry.next_client_id.fetch_add(1, Ordering::Relaxed);
    let room = registry.join(&doc_id).await;
    let mut updates_rx = room.updates_tx.subscribe();
    debug!(doc_id = %doc_id, client_id, "collaborator connected");

    loop {
        tokio::select! {
            incoming = socket.recv() => {
                let Some(Ok(message)) = incoming else {
                    break;
                };

                match message {
                    WsMessage::Binary(payload) => {
                        if let Err(error) = process_incoming_binary(client_id, payload.as_ref(), &room, &mut socket).await {
                            warn!(doc_id = %doc_id, ?error, "failed to process y-websocket frame");
                            break;
                        }
                    }
                    WsMessage::Close(_) => break,
                    WsMessage::Ping(payload) => {
                        if socket.send(WsMessage::Pong(payload)).await.is_err() {
                            break;
                        }
                    }
                    WsMessage::Pong(_) | WsMessage::Text(_) => {}
                }
            }
            outbound = updates_rx.recv() => {
                match outbound {
                    Ok((sender_id, payload)) if sender_id != client_id => {
                        if socket.send(WsMessage::Binary(payload.into())).await.is_err() {
                            break;
                        }
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        }
    }

    debug!(doc_id = %doc_id, client_id, "collaborator disconnected");
    registry.leave(&room).await;
}

async fn process_incoming_binary(
    client_id: u64,
    payload: &[u8],
    room: &Room,
    socket: &mut WebSocket,
) -> Result<()> {
    let protocol = DefaultProtocol;
    let mut responses = Vec::new();
    let mut fanout = Vec::new();

    {
        let awareness = room.awareness.lock().await;
        let mut decoder = DecoderV1::new(Cursor::new(payload));
        let mut reader = MessageReader::new(&mut decoder);

        while let Some(next_message) = reader.next() {
            let message = next_message.context("failed to decode y-sync message")?;
            match message {
                Message::Sync(SyncMessage::SyncStep1(state_vector)) => {
                    if let Some(response) = protocol
                        .handle_sync_step1(&awareness, state_vector)
                        .context("failed to process sync step 1")?
                    {
                        responses.push(response.encode_v1());
                    }

                    let room_sv = awareness.doc().transact().state_vector();
                    responses.push(Message::Sync(SyncMessage::SyncStep1(room_sv)).encode_v1());
                }
                Message::Sync(SyncMessage::SyncStep2(update)) => {
                    let decoded = Update::decode_v1(&update)
                        .context("failed to decode sync step 2 update")?;
                    protocol
                        .handle_sync_step2(&awareness, decoded)
                        .context("failed to process sync step 2")?;
                    fanout.push(Message::Sync(SyncMessage::Update(update)).encode_v1());
                }
                Message::Sync(SyncMessage::Update(update)) => {
                    let decoded = Update::decode_v1(&update)
                        .context("failed to decode incremental update")?;
                    protocol
                        .handle_update(&awareness, decoded)
                        .context("failed to process incremental update")?;
                    fanout.push(Message::Sync(SyncMessage::Update(update)).encode_v1());
                }
                Message::Awareness(update) => {
                    fanout.push(Message::Awareness(update.clone()).encode_v1());
                    if let Some(response) = protocol
                        .handle_message(&awareness, Message::Awareness(update))
                        .context("failed to process awareness update")?
                    {
                        responses.push(response.encode_v1());
                    }
                }
                other => {
                    if let Some(response) = protocol
                        .handle_message(&awareness, other)
                        .context("failed to process y-sync message")?
                    {
                        responses.push(response.encode_v1());
                    }
                }
            }
        }
    }

    for response in responses {
        socket
            .send(WsMessage::Binary(response.into()))
            .await
            .context("failed to send y-sync response")?;
    }

    for frame in fanout {
        let _ = room.updates_tx.send((client_id, frame));
    }

    Ok(())
}
