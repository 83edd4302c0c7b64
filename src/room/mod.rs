#![forbid(unsafe_code)]

// Room registry - membership, producer index, speaking state, event fan-out

use crate::media::{MediaEngine, MediaResult};
use crate::metrics::ServerMetrics;
use crate::session::{ConnHandle, Peer, SessionRegistry};
use crate::signaling::protocol::{PeerSummary, ProducerSummary, ServerEvent, SignalError};
use mediasoup::audio_level_observer::AudioLevelObserver;
use mediasoup::prelude::*;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::RwLock as StdRwLock;
use tokio::sync::mpsc;
use tokio::sync::RwLock as TokioRwLock;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// One room member as seen by the broadcaster.
pub struct RoomPeer {
    pub session_id: String,
    pub conn: ConnHandle,
}

/// A producer as indexed by the room.
pub struct RoomProducer {
    pub peer_id: String,
    pub producer: Producer,
    pub kind: MediaKind,
}

/// Level-observer tick forwarded from the engine callback thread.
enum VadTick {
    Volumes(Vec<(String, i8)>),
    Silence,
}

pub struct Room {
    pub id: String,
    pub router: Router,
    pub level_observer: AudioLevelObserver,
    pub peers: HashMap<String, RoomPeer>,
    pub producers: HashMap<String, RoomProducer>,
    pub speaking: HashSet<String>,
    closed: bool,
    vad_task: Option<JoinHandle<()>>,
}

impl Room {
    fn new(id: String, router: Router, level_observer: AudioLevelObserver) -> Self {
        Self {
            id,
            router,
            level_observer,
            peers: HashMap::new(),
            producers: HashMap::new(),
            speaking: HashSet::new(),
            closed: false,
            vad_task: None,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Sends an event to every member except `exclude`. Send failures are
    /// swallowed so one stuck peer cannot stall the fan-out.
    pub fn broadcast(&self, event: &ServerEvent, exclude: Option<&str>) {
        let json = match serde_json::to_string(event) {
            Ok(json) => Arc::new(json),
            Err(e) => {
                warn!("failed to serialize event for room {}: {}", self.id, e);
                return;
            }
        };
        for (peer_id, member) in &self.peers {
            if exclude.is_some_and(|excluded| excluded == peer_id) {
                continue;
            }
            if !member.conn.send_json(json.clone()) {
                debug!("dropped event for peer {} in room {}", peer_id, self.id);
            }
        }
    }

    /// Membership and producer snapshot for join responses, excluding the
    /// joining peer itself.
    pub fn snapshot_excluding(&self, exclude: &str) -> (Vec<PeerSummary>, Vec<ProducerSummary>) {
        let peers = self
            .peers
            .keys()
            .filter(|peer_id| peer_id.as_str() != exclude)
            .map(|peer_id| PeerSummary {
                peer_id: peer_id.clone(),
            })
            .collect();
        let producers = self
            .producers
            .iter()
            .filter(|(_, entry)| entry.peer_id != exclude)
            .map(|(producer_id, entry)| ProducerSummary {
                producer_id: producer_id.clone(),
                peer_id: entry.peer_id.clone(),
                kind: entry.kind,
            })
            .collect();
        (peers, producers)
    }

    pub fn producer_list(&self) -> Vec<ProducerSummary> {
        self.producers
            .iter()
            .map(|(producer_id, entry)| ProducerSummary {
                producer_id: producer_id.clone(),
                peer_id: entry.peer_id.clone(),
                kind: entry.kind,
            })
            .collect()
    }
}

pub type SharedRoom = Arc<TokioRwLock<Room>>;

/// Process-wide roomId -> room map. Rooms are created lazily on first join
/// and torn down when the last member is destroyed.
///
/// The outer map uses a std RwLock held only for brief non-await sections;
/// each room is serialized by its own tokio RwLock.
pub struct RoomRegistry {
    rooms: StdRwLock<HashMap<String, SharedRoom>>,
    engine: Arc<MediaEngine>,
    metrics: ServerMetrics,
}

impl RoomRegistry {
    pub fn new(engine: Arc<MediaEngine>, metrics: ServerMetrics) -> Self {
        Self {
            rooms: StdRwLock::new(HashMap::new()),
            engine,
            metrics,
        }
    }

    pub fn engine(&self) -> &MediaEngine {
        &self.engine
    }

    pub fn get(&self, room_id: &str) -> Option<SharedRoom> {
        let rooms = self.rooms.read().unwrap_or_else(|e| e.into_inner());
        rooms.get(room_id).cloned()
    }

    pub fn room_count(&self) -> usize {
        self.rooms.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Idempotent by room id: the first join creates a router and level
    /// observer and publishes the room record.
    pub async fn get_or_create(&self, room_id: &str) -> MediaResult<SharedRoom> {
        {
            let rooms = self.rooms.read().unwrap_or_else(|e| e.into_inner());
            if let Some(room) = rooms.get(room_id) {
                return Ok(room.clone());
            }
        }

        // engine calls happen with no lock held; a lost creation race just
        // drops the extra router below
        let router = self.engine.create_router().await?;
        let level_observer = self.engine.create_level_observer(&router).await?;

        let (tick_tx, tick_rx) = mpsc::unbounded_channel();
        let volumes_tx = tick_tx.clone();
        level_observer
            .on_volumes(move |volumes| {
                let active: Vec<(String, i8)> = volumes
                    .iter()
                    .map(|entry| (entry.producer.id().to_string(), entry.volume))
                    .collect();
                let _ = volumes_tx.send(VadTick::Volumes(active));
            })
            .detach();
        level_observer
            .on_silence(move || {
                let _ = tick_tx.send(VadTick::Silence);
            })
            .detach();

        let room = Arc::new(TokioRwLock::new(Room::new(
            room_id.to_string(),
            router,
            level_observer,
        )));

        let published = {
            let mut rooms = self.rooms.write().unwrap_or_else(|e| e.into_inner());
            rooms
                .entry(room_id.to_string())
                .or_insert_with(|| room.clone())
                .clone()
        };

        if Arc::ptr_eq(&published, &room) {
            info!("created room {}", room_id);
            self.metrics.inc_rooms_created();
            let task = tokio::spawn(drive_speaking(room.clone(), tick_rx));
            room.write().await.vad_task = Some(task);
        }

        Ok(published)
    }

    /// Adds (or re-adds) a peer to a room. Broadcasts peerJoined to the other
    /// members unless the peer was already a member and `always_announce` is
    /// off (a resume into a still-live membership).
    pub async fn join_peer(
        &self,
        peer: &mut Peer,
        conn: &ConnHandle,
        room_id: &str,
        always_announce: bool,
    ) -> Result<(RtpCapabilitiesFinalized, Vec<PeerSummary>, Vec<ProducerSummary>), SignalError>
    {
        loop {
            let room_lock = self.get_or_create(room_id).await.map_err(SignalError::Media)?;
            let mut room = room_lock.write().await;
            if room.is_closed() {
                // lost to a concurrent teardown; re-create
                continue;
            }

            if let Some(existing) = room.peers.get(&peer.peer_id) {
                if existing.session_id != peer.session_id {
                    return Err(SignalError::PeerIdMismatch);
                }
            }
            let was_member = room
                .peers
                .insert(
                    peer.peer_id.clone(),
                    RoomPeer {
                        session_id: peer.session_id.clone(),
                        conn: conn.clone(),
                    },
                )
                .is_some();
            peer.room_id = Some(room_id.to_string());

            if always_announce || !was_member {
                room.broadcast(
                    &ServerEvent::PeerJoined {
                        peer_id: peer.peer_id.clone(),
                    },
                    Some(&peer.peer_id),
                );
            }

            let (existing_peers, existing_producers) = room.snapshot_excluding(&peer.peer_id);
            let rtp_capabilities = room.router.rtp_capabilities().clone();
            return Ok((rtp_capabilities, existing_peers, existing_producers));
        }
    }

    /// Closes and forgets the peer's transports, producers, and consumers and
    /// silently removes its entries from the room producer index and speaking
    /// set. No events: reconnects must not disturb the other clients.
    /// Idempotent.
    pub async fn reset_peer_media(&self, peer: &mut Peer) {
        let room_lock = peer.room_id.as_ref().and_then(|room_id| self.get(room_id));
        if let Some(room_lock) = room_lock {
            let mut room = room_lock.write().await;
            for producer_id in peer.producers.keys() {
                room.producers.remove(producer_id);
                room.speaking.remove(producer_id);
            }
        }
        peer.producers.clear();
        peer.consumers.clear();
        peer.send_transport = None;
        peer.recv_transport = None;
    }

    /// Final teardown for a peer: producer cleanup with closure events,
    /// membership removal, media close, session removal, and empty-room
    /// teardown. Runs from the grace timer.
    pub async fn destroy_peer(&self, sessions: &SessionRegistry, session_id: &str) {
        let Some(peer_lock) = sessions.lookup(session_id) else {
            return;
        };
        let mut peer = peer_lock.lock().await;
        let peer_id = peer.peer_id.clone();

        if let Some(room_id) = peer.room_id.take() {
            if let Some(room_lock) = self.get(&room_id) {
                let mut room = room_lock.write().await;
                let producers: Vec<(String, Producer)> = peer.producers.drain().collect();
                for (producer_id, producer) in producers {
                    let kind = producer.kind();
                    room.producers.remove(&producer_id);
                    if room.speaking.remove(&producer_id) {
                        room.broadcast(
                            &ServerEvent::ProducerSpeaking {
                                producer_id: producer_id.clone(),
                                peer_id: peer_id.clone(),
                                speaking: false,
                                volume: None,
                            },
                            None,
                        );
                    }
                    room.broadcast(
                        &ServerEvent::ProducerClosed {
                            producer_id,
                            peer_id: peer_id.clone(),
                            kind,
                            reason: "left",
                        },
                        None,
                    );
                }

                room.peers.remove(&peer_id);
                room.broadcast(
                    &ServerEvent::PeerLeft {
                        peer_id: peer_id.clone(),
                    },
                    None,
                );
                info!(
                    "destroyed peer {} (session {}) in room {}",
                    peer_id, session_id, room_id
                );

                if room.peers.is_empty() {
                    room.closed = true;
                    if let Some(task) = room.vad_task.take() {
                        task.abort();
                    }
                    // unpublish before releasing the room lock so a
                    // concurrent join re-creates instead of joining a corpse
                    let mut rooms = self.rooms.write().unwrap_or_else(|e| e.into_inner());
                    rooms.remove(&room_id);
                    info!("room {} is empty, closed router and level observer", room_id);
                }
            }
        }

        peer.consumers.clear();
        peer.send_transport = None;
        peer.recv_transport = None;
        peer.conn = None;
        // detach rather than abort: this very function runs inside the timer
        let _ = peer.grace.take();
        drop(peer);
        sessions.remove(session_id);
    }
}

/// Applies level-observer ticks to the room's speaking set and fans out the
/// resulting producerSpeaking events.
async fn drive_speaking(room_lock: SharedRoom, mut ticks: mpsc::UnboundedReceiver<VadTick>) {
    while let Some(tick) = ticks.recv().await {
        let mut room = room_lock.write().await;
        if room.closed {
            break;
        }
        let updates = match tick {
            VadTick::Volumes(active) => {
                // only producers still indexed by the room count
                let active: Vec<(String, i8)> = active
                    .into_iter()
                    .filter(|(producer_id, _)| room.producers.contains_key(producer_id))
                    .collect();
                let mut speaking = std::mem::take(&mut room.speaking);
                let updates = volumes_tick(&mut speaking, &active);
                room.speaking = speaking;
                updates
            }
            VadTick::Silence => {
                let mut speaking = std::mem::take(&mut room.speaking);
                let updates = silence_tick(&mut speaking);
                room.speaking = speaking;
                updates
            }
        };
        for (producer_id, speaking, volume) in updates {
            let peer_id = match room.producers.get(&producer_id) {
                Some(entry) => entry.peer_id.clone(),
                None => continue,
            };
            room.broadcast(
                &ServerEvent::ProducerSpeaking {
                    producer_id,
                    peer_id,
                    speaking,
                    volume,
                },
                None,
            );
        }
    }
}

/// One volumes tick: every active producer emits speaking=true with its
/// volume; producers that left the active set emit speaking=false; active ids
/// are then folded into the speaking set.
fn volumes_tick(
    speaking: &mut HashSet<String>,
    active: &[(String, i8)],
) -> Vec<(String, bool, Option<i8>)> {
    let mut updates: Vec<(String, bool, Option<i8>)> = Vec::with_capacity(active.len());
    for (producer_id, volume) in active {
        updates.push((producer_id.clone(), true, Some(*volume)));
    }
    let still_active: HashSet<&str> = active.iter().map(|(id, _)| id.as_str()).collect();
    let stopped: Vec<String> = speaking
        .iter()
        .filter(|id| !still_active.contains(id.as_str()))
        .cloned()
        .collect();
    for producer_id in stopped {
        speaking.remove(&producer_id);
        updates.push((producer_id, false, None));
    }
    for (producer_id, _) in active {
        speaking.insert(producer_id.clone());
    }
    updates
}

/// Silence tick: everything still marked speaking stops.
fn silence_tick(speaking: &mut HashSet<String>) -> Vec<(String, bool, Option<i8>)> {
    speaking.drain().map(|id| (id, false, None)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set(ids: &[&str]) -> HashSet<String> {
        ids.iter().map(|id| id.to_string()).collect()
    }

    #[test]
    fn volumes_tick_reports_active_and_stopped() {
        let mut speaking = set(&["a", "b"]);
        let active = vec![("b".to_string(), -40_i8), ("c".to_string(), -50_i8)];

        let updates = volumes_tick(&mut speaking, &active);

        // active producers first, each with its volume
        assert_eq!(updates[0], ("b".to_string(), true, Some(-40)));
        assert_eq!(updates[1], ("c".to_string(), true, Some(-50)));
        // then the one that fell silent
        assert!(updates.contains(&("a".to_string(), false, None)));
        assert_eq!(updates.len(), 3);

        assert_eq!(speaking, set(&["b", "c"]));
    }

    #[test]
    fn volumes_tick_re_reports_ongoing_speakers() {
        let mut speaking = set(&["a"]);
        let active = vec![("a".to_string(), -30_i8)];

        let updates = volumes_tick(&mut speaking, &active);

        assert_eq!(updates, vec![("a".to_string(), true, Some(-30))]);
        assert_eq!(speaking, set(&["a"]));
    }

    #[test]
    fn volumes_tick_with_empty_set_only_adds() {
        let mut speaking = HashSet::new();
        let active = vec![("a".to_string(), -60_i8)];

        let updates = volumes_tick(&mut speaking, &active);

        assert_eq!(updates, vec![("a".to_string(), true, Some(-60))]);
        assert_eq!(speaking, set(&["a"]));
    }

    #[test]
    fn silence_tick_drains_everything() {
        let mut speaking = set(&["a", "b"]);

        let mut updates = silence_tick(&mut speaking);
        updates.sort();

        assert_eq!(
            updates,
            vec![
                ("a".to_string(), false, None),
                ("b".to_string(), false, None)
            ]
        );
        assert!(speaking.is_empty());
    }

    #[test]
    fn silence_tick_on_empty_set_is_a_no_op() {
        let mut speaking = HashSet::new();
        assert!(silence_tick(&mut speaking).is_empty());
    }
}
