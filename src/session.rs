#![forbid(unsafe_code)]

// Session registry - stable peer identities and the reconnect grace window

use mediasoup::prelude::*;
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::sync::RwLock as StdRwLock;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::sync::Mutex as TokioMutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::debug;

/// How long a dropped peer keeps its identity and room membership.
pub const GRACE_WINDOW: Duration = Duration::from_secs(25);

/// Handle to one live WebSocket connection: the outbound message channel plus
/// a kick channel telling the owning pump to close with a given code.
#[derive(Clone)]
pub struct ConnHandle {
    sender: mpsc::Sender<Arc<String>>,
    kick: mpsc::Sender<(u16, String)>,
}

impl ConnHandle {
    pub fn new(sender: mpsc::Sender<Arc<String>>, kick: mpsc::Sender<(u16, String)>) -> Self {
        Self { sender, kick }
    }

    /// Queues a pre-serialized message. Returns false when the client is not
    /// keeping up or already gone; callers ignore that.
    pub fn send_json(&self, json: Arc<String>) -> bool {
        self.sender.try_send(json).is_ok()
    }

    pub fn same_socket(&self, other: &ConnHandle) -> bool {
        self.sender.same_channel(&other.sender)
    }

    pub fn same_sender(&self, sender: &mpsc::Sender<Arc<String>>) -> bool {
        self.sender.same_channel(sender)
    }

    /// Asks the owning pump to close the socket.
    pub fn kick(&self, code: u16, reason: &str) {
        let _ = self.kick.try_send((code, reason.to_string()));
    }
}

/// Server-side record of one session. The sessionId is the stable identity
/// across reconnects; the peerId is the room-local identity bound by the
/// admission token.
pub struct Peer {
    pub session_id: String,
    pub peer_id: String,
    pub room_id: Option<String>,
    pub conn: Option<ConnHandle>,
    pub send_transport: Option<WebRtcTransport>,
    pub recv_transport: Option<WebRtcTransport>,
    pub producers: HashMap<String, Producer>,
    pub consumers: HashMap<String, Consumer>,
    pub(crate) grace: Option<JoinHandle<()>>,
    pub disconnected_at: Option<Instant>,
}

impl Peer {
    pub fn new(session_id: String, peer_id: String) -> Self {
        Self {
            session_id,
            peer_id,
            room_id: None,
            conn: None,
            send_transport: None,
            recv_transport: None,
            producers: HashMap::new(),
            consumers: HashMap::new(),
            grace: None,
            disconnected_at: None,
        }
    }
}

pub type SharedPeer = Arc<TokioMutex<Peer>>;

/// Process-wide sessionId -> peer map. A peer leaves this map only through
/// final destruction; grace keeps it here so a reconnect can adopt it.
///
/// The outer map uses a std RwLock held only for brief non-await sections;
/// each peer is serialized by its own tokio Mutex.
pub struct SessionRegistry {
    peers: StdRwLock<HashMap<String, SharedPeer>>,
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self {
            peers: StdRwLock::new(HashMap::new()),
        }
    }

    pub fn lookup(&self, session_id: &str) -> Option<SharedPeer> {
        let peers = self.peers.read().unwrap_or_else(|e| e.into_inner());
        peers.get(session_id).cloned()
    }

    pub fn insert(&self, session_id: String, peer: SharedPeer) {
        let mut peers = self.peers.write().unwrap_or_else(|e| e.into_inner());
        peers.insert(session_id, peer);
    }

    /// Returns the registered peer for `session_id`, inserting a fresh one
    /// when absent. The bool is true when this call created the record.
    pub fn get_or_insert_with(
        &self,
        session_id: &str,
        make: impl FnOnce() -> SharedPeer,
    ) -> (SharedPeer, bool) {
        let mut peers = self.peers.write().unwrap_or_else(|e| e.into_inner());
        match peers.entry(session_id.to_string()) {
            Entry::Occupied(entry) => (entry.get().clone(), false),
            Entry::Vacant(entry) => (entry.insert(make()).clone(), true),
        }
    }

    /// True when `peer` is still the record registered under `session_id`.
    pub fn is_registered(&self, session_id: &str, peer: &SharedPeer) -> bool {
        let peers = self.peers.read().unwrap_or_else(|e| e.into_inner());
        peers
            .get(session_id)
            .is_some_and(|registered| Arc::ptr_eq(registered, peer))
    }

    pub fn remove(&self, session_id: &str) -> Option<SharedPeer> {
        let mut peers = self.peers.write().unwrap_or_else(|e| e.into_inner());
        peers.remove(session_id)
    }

    pub fn session_count(&self) -> usize {
        self.peers.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Finds the peer owning a connection by scanning the registry. Linear,
    /// which is fine at the scale this server targets.
    pub async fn find_by_sender(&self, sender: &mpsc::Sender<Arc<String>>) -> Option<SharedPeer> {
        let all: Vec<SharedPeer> = {
            let peers = self.peers.read().unwrap_or_else(|e| e.into_inner());
            peers.values().cloned().collect()
        };
        for peer_lock in all {
            let owns = {
                let peer = peer_lock.lock().await;
                peer.conn.as_ref().is_some_and(|c| c.same_sender(sender))
            };
            if owns {
                return Some(peer_lock);
            }
        }
        None
    }

    /// Arms the single-shot grace timer. Re-arming cancels the prior timer.
    /// `on_expiry` runs the final destroy path.
    pub fn arm_grace<F>(&self, peer: &mut Peer, window: Duration, on_expiry: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if let Some(old) = peer.grace.take() {
            old.abort();
        }
        peer.disconnected_at = Some(Instant::now());
        let session_id = peer.session_id.clone();
        peer.grace = Some(tokio::spawn(async move {
            tokio::time::sleep(window).await;
            debug!("grace expired for session {}", session_id);
            on_expiry.await;
        }));
    }

    /// Cancels a pending grace timer, if any. Safe to call when none is armed.
    pub fn disarm_grace(&self, peer: &mut Peer) {
        if let Some(handle) = peer.grace.take() {
            handle.abort();
        }
        peer.disconnected_at = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    fn registry_with_peer() -> (SessionRegistry, SharedPeer) {
        let registry = SessionRegistry::new();
        let peer: SharedPeer = Arc::new(TokioMutex::new(Peer::new(
            "s1".to_string(),
            "p1".to_string(),
        )));
        registry.insert("s1".to_string(), peer.clone());
        (registry, peer)
    }

    #[tokio::test]
    async fn lookup_insert_remove() {
        let (registry, _peer) = registry_with_peer();
        assert!(registry.lookup("s1").is_some());
        assert_eq!(registry.session_count(), 1);
        assert!(registry.remove("s1").is_some());
        assert!(registry.lookup("s1").is_none());
        assert_eq!(registry.session_count(), 0);
    }

    #[tokio::test]
    async fn find_by_sender_matches_the_owning_peer() {
        let (registry, peer) = registry_with_peer();
        let (tx, _rx) = mpsc::channel::<Arc<String>>(4);
        let (kick_tx, _kick_rx) = mpsc::channel(1);
        peer.lock().await.conn = Some(ConnHandle::new(tx.clone(), kick_tx));

        assert!(registry.find_by_sender(&tx).await.is_some());

        let (other_tx, _other_rx) = mpsc::channel::<Arc<String>>(4);
        assert!(registry.find_by_sender(&other_tx).await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn grace_fires_after_the_window() {
        let (registry, peer) = registry_with_peer();
        let fired = Arc::new(AtomicBool::new(false));
        {
            let mut peer = peer.lock().await;
            let fired = fired.clone();
            registry.arm_grace(&mut peer, GRACE_WINDOW, async move {
                fired.store(true, Ordering::SeqCst);
            });
            assert!(peer.disconnected_at.is_some());
        }

        tokio::time::sleep(GRACE_WINDOW + Duration::from_secs(1)).await;
        assert!(fired.load(Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn disarm_cancels_the_timer() {
        let (registry, peer) = registry_with_peer();
        let fired = Arc::new(AtomicBool::new(false));
        {
            let mut peer = peer.lock().await;
            let fired = fired.clone();
            registry.arm_grace(&mut peer, GRACE_WINDOW, async move {
                fired.store(true, Ordering::SeqCst);
            });
            registry.disarm_grace(&mut peer);
            assert!(peer.disconnected_at.is_none());
        }

        tokio::time::sleep(GRACE_WINDOW * 2).await;
        assert!(!fired.load(Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn rearming_cancels_the_prior_timer() {
        let (registry, peer) = registry_with_peer();
        let first = Arc::new(AtomicBool::new(false));
        let second = Arc::new(AtomicBool::new(false));
        {
            let mut peer = peer.lock().await;
            let first = first.clone();
            registry.arm_grace(&mut peer, GRACE_WINDOW, async move {
                first.store(true, Ordering::SeqCst);
            });
            let second = second.clone();
            registry.arm_grace(&mut peer, GRACE_WINDOW, async move {
                second.store(true, Ordering::SeqCst);
            });
        }

        tokio::time::sleep(GRACE_WINDOW * 2).await;
        assert!(!first.load(Ordering::SeqCst));
        assert!(second.load(Ordering::SeqCst));
    }
}
