//! Table node: peer lifecycle, handshakes, message routing and the event loop.
//!
//! Every mutation (peer added or removed, message dispatched, game state
//! updated) happens on one event loop task, which is what keeps the
//! round-start gate consistent without locking across connections. The peer
//! map and the game state sit behind read/write locks only so the status
//! ticker and the public accessors can take point-in-time snapshots.

use super::addr;
use super::game_state::{GameState, PlayerRecord, ShuffleStep};
use super::gossip::PeerListGossip;
use super::messages::{
    BroadcastTo, EncryptedDeck, Envelope, GameVariant, Handshake, Payload, PeerAddr, PeerList,
    ProtocolVersion,
};
use super::peer::{Direction, InboundMessage, Peer, PeerClosed, PeerHandle};
use super::status::GameStatus;
use super::transport::{DialPolicy, TcpTransport};
use crate::encryption::{DeckCipher, XorStreamCipher};
use crate::error::{HandshakeError, NodeError, NodeResult};
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Default protocol version string
pub const DEFAULT_VERSION: &str = "1";

/// Default bound on a handshake exchange
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Default period of the status log line
pub const DEFAULT_STATUS_INTERVAL: Duration = Duration::from_secs(5);

/// Pending add-peer notifications
const ADD_PEER_BUFFER: usize = 10;

const EVENT_BUFFER: usize = 64;

const INBOUND_BUFFER: usize = 256;

/// Node configuration
#[derive(Clone, Debug)]
pub struct NetworkConfig {
    /// Protocol version; peers must match exactly
    pub version: ProtocolVersion,

    /// Listen address. Port 0 picks a free port.
    pub listen_addr: String,

    /// Game variant; peers must match exactly
    pub game_variant: GameVariant,

    /// Start as the table's dealer
    pub dealer: bool,

    /// Seated players required before a round may start
    pub min_players: usize,

    /// Retry policy for outbound connections
    pub dial: DialPolicy,

    pub handshake_timeout: Duration,

    pub status_interval: Duration,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            version: DEFAULT_VERSION.to_string(),
            listen_addr: "127.0.0.1:0".to_string(),
            game_variant: GameVariant::TexasHoldem,
            dealer: false,
            min_players: 2,
            dial: DialPolicy::default(),
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            status_interval: DEFAULT_STATUS_INTERVAL,
        }
    }
}

impl NetworkConfig {
    pub fn validate(&self) -> NodeResult<()> {
        if self.version.trim().is_empty() {
            return Err(NodeError::Config("version must not be empty".to_string()));
        }
        if self.min_players < 2 {
            return Err(NodeError::Config(format!(
                "min_players must be at least 2, got {}",
                self.min_players
            )));
        }
        if self.dial.attempts == 0 {
            return Err(NodeError::Config(
                "at least one dial attempt is required".to_string(),
            ));
        }
        if self.handshake_timeout.is_zero() || self.status_interval.is_zero() {
            return Err(NodeError::Config(
                "handshake timeout and status interval must be non-zero".to_string(),
            ));
        }
        match self.listen_addr.trim().parse::<SocketAddr>() {
            // the listen address is also the identity other players dial
            Ok(socket) if socket.ip().is_unspecified() => {
                return Err(NodeError::Config(format!(
                    "listen address {} is not reachable by other players",
                    self.listen_addr
                )));
            }
            Ok(_) => {}
            Err(_) if addr::normalize(&self.listen_addr).is_some() => {}
            Err(_) => {
                return Err(NodeError::Config(format!(
                    "invalid listen address {:?}",
                    self.listen_addr
                )));
            }
        }
        Ok(())
    }
}

enum NodeCommand {
    AssignDealer,
}

/// Outcomes reported back to the event loop by per-connection tasks
enum PeerEvent {
    Handshaken {
        peer: Peer,
        remote: Handshake,
    },
    Rejected {
        conn_id: u64,
        dialed: Option<PeerAddr>,
        error: NodeError,
    },
    DialFailed {
        addr: PeerAddr,
        error: NodeError,
    },
}

/// A running table node
pub struct Node {
    config: NetworkConfig,
    listen_addr: PeerAddr,
    transport: Arc<TcpTransport>,
    state: Arc<RwLock<GameState>>,
    peers: Arc<RwLock<HashMap<PeerAddr, PeerHandle>>>,
    commands: mpsc::UnboundedSender<NodeCommand>,
    shutdown: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Node {
    /// Bind, then start the accept loop, the event loop and the status ticker.
    pub async fn start(config: NetworkConfig) -> NodeResult<Self> {
        Self::start_with_cipher(config, Arc::new(XorStreamCipher::random())).await
    }

    /// Like [`Node::start`] with a caller-supplied shuffle cipher.
    pub async fn start_with_cipher(
        config: NetworkConfig,
        cipher: Arc<dyn DeckCipher>,
    ) -> NodeResult<Self> {
        config.validate()?;

        let (add_peer_tx, add_peer_rx) = mpsc::channel(ADD_PEER_BUFFER);
        let transport =
            Arc::new(TcpTransport::bind(&config.listen_addr, add_peer_tx, config.dial).await?);
        let listen_addr = transport.listen_addr().to_string();

        let (broadcast_tx, broadcast_rx) = mpsc::unbounded_channel();
        let state = GameState::new(
            &listen_addr,
            config.dealer,
            config.min_players,
            cipher,
            broadcast_tx,
        )?;
        let state = Arc::new(RwLock::new(state));
        let peers = Arc::new(RwLock::new(HashMap::new()));

        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::channel(EVENT_BUFFER);
        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_BUFFER);
        let (closed_tx, closed_rx) = mpsc::channel(EVENT_BUFFER);
        let shutdown = CancellationToken::new();

        let event_loop = EventLoop {
            config: config.clone(),
            listen_addr: listen_addr.clone(),
            gossip: PeerListGossip::new(listen_addr.clone()),
            transport: Arc::clone(&transport),
            state: Arc::clone(&state),
            peers: Arc::clone(&peers),
            dialing: HashSet::new(),
            add_peer_rx,
            events_tx,
            events_rx,
            inbound_tx,
            inbound_rx,
            closed_tx,
            closed_rx,
            broadcast_rx,
            commands_rx,
            shutdown: shutdown.clone(),
        };

        let accept = {
            let transport = Arc::clone(&transport);
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                if let Err(e) = transport.listen_and_accept(shutdown).await {
                    error!(error = %e, "accept loop failed");
                }
            })
        };
        let ticker = tokio::spawn(status_ticker(
            Arc::clone(&state),
            Arc::clone(&peers),
            config.status_interval,
            shutdown.clone(),
        ));
        let event_loop = tokio::spawn(event_loop.run());

        info!(
            addr = %listen_addr,
            variant = %config.game_variant,
            version = %config.version,
            dealer = config.dealer,
            "started new game server"
        );

        Ok(Self {
            config,
            listen_addr,
            transport,
            state,
            peers,
            commands: commands_tx,
            shutdown,
            tasks: Mutex::new(vec![accept, event_loop, ticker]),
        })
    }

    pub fn listen_addr(&self) -> &str {
        &self.listen_addr
    }

    pub fn config(&self) -> &NetworkConfig {
        &self.config
    }

    /// Dial a peer and hand the connection to the event loop.
    ///
    /// Returns once the socket is up; the handshake completes asynchronously.
    /// Blocks across the whole retry window when the address is unreachable.
    pub async fn connect(&self, addr: &str) -> NodeResult<()> {
        if self.shutdown.is_cancelled() {
            return Err(NodeError::Shutdown);
        }
        self.transport.dial(addr).await
    }

    /// Make this node the dealer and re-check the round-start gate.
    pub fn assign_dealer(&self) -> NodeResult<()> {
        self.commands
            .send(NodeCommand::AssignDealer)
            .map_err(|_| NodeError::Shutdown)
    }

    /// Listen addresses of active peers, in seating order
    pub async fn connected_peers(&self) -> Vec<PeerAddr> {
        let mut peers: Vec<PeerAddr> = self.peers.read().await.keys().cloned().collect();
        peers.sort_by(|a, b| addr::seat_key(a).cmp(&addr::seat_key(b)));
        peers
    }

    pub async fn table(&self) -> Vec<PeerAddr> {
        self.state.read().await.table().to_vec()
    }

    pub async fn players(&self) -> Vec<PlayerRecord> {
        self.state.read().await.players()
    }

    pub async fn status(&self) -> GameStatus {
        self.state.read().await.status()
    }

    pub async fn is_dealer(&self) -> bool {
        self.state.read().await.is_dealer()
    }

    pub async fn completed_deck(&self) -> Option<Vec<Vec<u8>>> {
        self.state.read().await.completed_deck().map(<[_]>::to_vec)
    }

    /// Cancel every background task and wait for them to finish.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let tasks = std::mem::take(&mut *self.tasks.lock().await);
        for task in tasks {
            if let Err(e) = task.await {
                warn!(addr = %self.listen_addr, error = %e, "task ended abnormally");
            }
        }
        info!(addr = %self.listen_addr, "node stopped");
    }
}

impl Drop for Node {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

struct EventLoop {
    config: NetworkConfig,
    listen_addr: PeerAddr,
    gossip: PeerListGossip,
    transport: Arc<TcpTransport>,
    state: Arc<RwLock<GameState>>,
    peers: Arc<RwLock<HashMap<PeerAddr, PeerHandle>>>,

    /// Gossip dials in flight
    dialing: HashSet<PeerAddr>,

    add_peer_rx: mpsc::Receiver<Peer>,
    events_tx: mpsc::Sender<PeerEvent>,
    events_rx: mpsc::Receiver<PeerEvent>,
    inbound_tx: mpsc::Sender<InboundMessage>,
    inbound_rx: mpsc::Receiver<InboundMessage>,
    closed_tx: mpsc::Sender<PeerClosed>,
    closed_rx: mpsc::Receiver<PeerClosed>,
    broadcast_rx: mpsc::UnboundedReceiver<BroadcastTo>,
    commands_rx: mpsc::UnboundedReceiver<NodeCommand>,
    shutdown: CancellationToken,
}

impl EventLoop {
    async fn run(mut self) {
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                Some(peer) = self.add_peer_rx.recv() => self.on_connected(peer).await,
                Some(event) = self.events_rx.recv() => self.on_peer_event(event).await,
                Some(msg) = self.inbound_rx.recv() => self.on_message(msg).await,
                Some(closed) = self.closed_rx.recv() => self.on_closed(closed).await,
                Some(directive) = self.broadcast_rx.recv() => self.on_broadcast(directive).await,
                Some(command) = self.commands_rx.recv() => self.on_command(command).await,
            }
        }

        // dropping the handles cancels every receive task
        self.peers.write().await.clear();
        debug!(addr = %self.listen_addr, "event loop stopped");
    }

    async fn own_handshake(&self) -> Handshake {
        Handshake {
            game_variant: self.config.game_variant,
            version: self.config.version.clone(),
            game_status: self.state.read().await.status(),
            listen_addr: self.listen_addr.clone(),
        }
    }

    /// A socket is up; run the handshake off the loop.
    async fn on_connected(&mut self, peer: Peer) {
        let ours = self.own_handshake().await;
        let limit = self.config.handshake_timeout;
        let events = self.events_tx.clone();
        let shutdown = self.shutdown.clone();

        tokio::spawn(async move {
            let conn_id = peer.id();
            let dialed = peer.dialed().map(str::to_string);
            let event = tokio::select! {
                _ = shutdown.cancelled() => return,
                result = handshake(peer, ours, limit) => match result {
                    Ok((peer, remote)) => PeerEvent::Handshaken { peer, remote },
                    Err(error) => PeerEvent::Rejected { conn_id, dialed, error },
                },
            };
            let _ = events.send(event).await;
        });
    }

    async fn on_peer_event(&mut self, event: PeerEvent) {
        match event {
            PeerEvent::Handshaken { peer, remote } => self.register(peer, remote).await,
            PeerEvent::Rejected {
                conn_id,
                dialed,
                error,
            } => {
                if let Some(addr) = dialed.as_deref().and_then(addr::normalize) {
                    self.dialing.remove(&addr);
                }
                error!(
                    addr = %self.listen_addr,
                    conn_id,
                    dialed = ?dialed,
                    error = %error,
                    "{}",
                    rejection_message(dialed.as_deref())
                );
            }
            PeerEvent::DialFailed { addr, error } => {
                self.dialing.remove(&addr);
                error!(addr = %self.listen_addr, peer = %addr, error = %error, "failed to dial peer");
            }
        }
    }

    /// Handshake succeeded: start the receive task, register and seat the peer,
    /// and push our peer list if we were the accepting side.
    async fn register(&mut self, peer: Peer, remote: Handshake) {
        let addr = remote.listen_addr.clone();
        if let Some(dialed) = peer.dialed().and_then(addr::normalize) {
            self.dialing.remove(&dialed);
        }
        self.dialing.remove(&addr);

        let direction = peer.direction();
        {
            let mut peers = self.peers.write().await;
            if let Some(existing) = peers.get(&addr) {
                if !self.keeps_new_connection(&addr, direction, existing.direction()) {
                    debug!(peer = %addr, conn_id = peer.id(), "duplicate connection, keeping the existing one");
                    return;
                }
                debug!(peer = %addr, conn_id = existing.id(), "replacing duplicate connection");
            }
            let handle = peer.activate(
                addr.clone(),
                self.inbound_tx.clone(),
                self.closed_tx.clone(),
                self.shutdown.child_token(),
            );
            peers.insert(addr.clone(), handle);
        }
        info!(
            addr = %self.listen_addr,
            peer = %addr,
            direction = ?direction,
            status = %remote.game_status,
            "handshake successful - new player connected"
        );

        if let Err(e) = self
            .state
            .write()
            .await
            .add_player(&addr, remote.game_status)
        {
            let e = NodeError::from(e);
            error!(peer = %addr, error = %e, fatal = e.is_protocol_violation(), "failed to seat player");
        }

        if direction == Direction::Inbound {
            self.send_peer_list(&addr).await;
        }
    }

    /// Two nodes that dial each other at once end up with two connections.
    /// Both ends keep the one opened by the smaller listen address.
    fn keeps_new_connection(&self, remote: &str, new: Direction, existing: Direction) -> bool {
        if new == existing {
            return false;
        }
        let we_dial = addr::seat_key(&self.listen_addr) < addr::seat_key(remote);
        let preferred = if we_dial {
            Direction::Outbound
        } else {
            Direction::Inbound
        };
        new == preferred
    }

    async fn send_peer_list(&self, to: &str) {
        let peers = self.peers.read().await;
        let list = self
            .gossip
            .outgoing(peers.keys().map(String::as_str), to);
        let Some(peer) = peers.get(to) else {
            return;
        };

        debug!(peer = %to, peers = ?list.peers, "sending peer list");
        let envelope = Envelope::new(self.listen_addr.clone(), Payload::PeerList(list));
        if let Err(e) = peer.send(&envelope).await {
            error!(peer = %to, error = %e, "peerlist error");
        }
    }

    async fn on_closed(&mut self, closed: PeerClosed) {
        {
            let mut peers = self.peers.write().await;
            match peers.get(&closed.peer) {
                Some(handle) if handle.id() == closed.conn_id => {
                    peers.remove(&closed.peer);
                    info!(addr = %self.listen_addr, peer = %closed.peer, "player disconnected");
                }
                _ => {
                    debug!(peer = %closed.peer, conn_id = closed.conn_id, "stale connection closed");
                    return;
                }
            }
        }

        // seating must only hold players we can still reach
        if let Err(e) = self.state.write().await.remove_player(&closed.peer) {
            let e = NodeError::from(e);
            error!(peer = %closed.peer, error = %e, fatal = e.is_protocol_violation(), "failed to unseat player");
        }
    }

    async fn on_message(&mut self, msg: InboundMessage) {
        let InboundMessage {
            peer,
            conn_id,
            envelope,
        } = msg;

        if addr::normalize(&envelope.from).as_deref() != Some(peer.as_str()) {
            warn!(peer = %peer, from = %envelope.from, "envelope sender does not match connection");
        }
        debug!(
            from = %peer,
            conn_id,
            kind = %envelope.payload.message_type(),
            "received message"
        );

        match envelope.payload {
            Payload::Handshake(_) => {
                warn!(peer = %peer, "unexpected handshake on an active connection");
            }
            Payload::PeerList(list) => self.handle_peer_list(list).await,
            Payload::EncryptedDeck(EncryptedDeck { deck }) => {
                self.handle_encrypted_deck(&peer, deck).await
            }
        }
    }

    async fn handle_peer_list(&mut self, list: PeerList) {
        let connected: HashSet<PeerAddr> = self.peers.read().await.keys().cloned().collect();
        let to_dial = self
            .gossip
            .to_dial(&list, |a| connected.contains(a) || self.dialing.contains(a));

        for addr in to_dial {
            debug!(peer = %addr, "dialing gossiped peer");
            self.dialing.insert(addr.clone());

            let transport = Arc::clone(&self.transport);
            let events = self.events_tx.clone();
            let shutdown = self.shutdown.clone();
            tokio::spawn(async move {
                tokio::select! {
                    _ = shutdown.cancelled() => {}
                    result = transport.dial(&addr) => {
                        if let Err(error) = result {
                            let _ = events.send(PeerEvent::DialFailed { addr, error }).await;
                        }
                    }
                }
            });
        }
    }

    async fn handle_encrypted_deck(&mut self, from: &str, deck: Vec<Vec<u8>>) {
        let result = self.state.write().await.shuffle_and_encrypt(from, deck);
        match result {
            Ok(ShuffleStep::Forwarded { to }) => {
                debug!(from = %from, to = %to, "deck shuffled and passed on");
            }
            Ok(ShuffleStep::Completed) => {
                info!(addr = %self.listen_addr, "shuffle rotation complete");
            }
            Err(e) => {
                let e = NodeError::from(e);
                error!(from = %from, error = %e, fatal = e.is_protocol_violation(), "failed to handle encrypted deck");
            }
        }
    }

    async fn on_broadcast(&mut self, directive: BroadcastTo) {
        let BroadcastTo { to, payload } = directive;
        let envelope = Envelope::new(self.listen_addr.clone(), payload);

        let peers = self.peers.read().await;
        for addr in &to {
            match peers.get(addr) {
                Some(peer) => {
                    if let Err(e) = peer.send(&envelope).await {
                        error!(peer = %addr, error = %e, "failed to send payload");
                    }
                }
                None => {
                    warn!(peer = %addr, kind = %envelope.payload.message_type(), "not connected to player, dropping payload");
                }
            }
        }
    }

    async fn on_command(&mut self, command: NodeCommand) {
        match command {
            NodeCommand::AssignDealer => {
                let result = self.state.write().await.set_dealer(true);
                match result {
                    Ok(started) => info!(addr = %self.listen_addr, started, "assigned as dealer"),
                    Err(e) => {
                        let e = NodeError::from(e);
                        error!(error = %e, fatal = e.is_protocol_violation(), "failed to assign dealer");
                    }
                }
            }
        }
    }
}

/// Exchange handshakes on a fresh connection.
///
/// The dialing side speaks first; the accepting side answers only after the
/// remote handshake checks out, so a rejected dialer never learns our state.
async fn handshake(
    mut peer: Peer,
    ours: Handshake,
    limit: Duration,
) -> NodeResult<(Peer, Handshake)> {
    let exchange = async {
        let hello = Envelope::new(ours.listen_addr.clone(), Payload::Handshake(ours.clone()));
        if peer.is_outbound() {
            peer.send(&hello).await?;
        }

        let theirs = match peer.recv().await?.payload {
            Payload::Handshake(hs) => hs,
            other => {
                return Err(NodeError::from(HandshakeError::Unexpected(
                    other.message_type().as_str(),
                )))
            }
        };
        let theirs = validate_handshake(&ours, theirs)?;
        info!(
            peer = %peer.remote_addr(),
            listen_addr = %theirs.listen_addr,
            version = %theirs.version,
            variant = %theirs.game_variant,
            game_status = %theirs.game_status,
            "received handshake"
        );

        if !peer.is_outbound() {
            peer.send(&hello).await?;
        }
        Ok::<Handshake, NodeError>(theirs)
    };

    match tokio::time::timeout(limit, exchange).await {
        Ok(Ok(theirs)) => Ok((peer, theirs)),
        Ok(Err(e)) => Err(e),
        Err(_) => Err(HandshakeError::Timeout(limit).into()),
    }
}

fn rejection_message(dialed: Option<&str>) -> &'static str {
    match dialed {
        Some(_) => "handshake with dialed player failed",
        None => "handshake with incoming player failed",
    }
}

/// Check a remote handshake against ours and normalize its listen address.
pub fn validate_handshake(
    ours: &Handshake,
    mut theirs: Handshake,
) -> Result<Handshake, HandshakeError> {
    if theirs.game_variant != ours.game_variant {
        return Err(HandshakeError::VariantMismatch {
            ours: ours.game_variant,
            theirs: theirs.game_variant,
        });
    }
    if theirs.version != ours.version {
        return Err(HandshakeError::VersionMismatch {
            ours: ours.version.clone(),
            theirs: theirs.version,
        });
    }
    let listen_addr = addr::normalize(&theirs.listen_addr)
        .ok_or_else(|| HandshakeError::InvalidAddress(theirs.listen_addr.clone()))?;
    if listen_addr == ours.listen_addr {
        return Err(HandshakeError::SelfConnection(listen_addr));
    }
    theirs.listen_addr = listen_addr;
    Ok(theirs)
}

async fn status_ticker(
    state: Arc<RwLock<GameState>>,
    peers: Arc<RwLock<HashMap<PeerAddr, PeerHandle>>>,
    period: Duration,
    shutdown: CancellationToken,
) {
    let mut ticker = tokio::time::interval(period);
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {
                let (addr, status, players) = {
                    let state = state.read().await;
                    (state.listen_addr().to_string(), state.status(), state.players())
                };
                let connected = peers.read().await.len();
                let players: Vec<String> = players.iter().map(ToString::to_string).collect();
                info!(addr = %addr, status = %status, connected, players = ?players, "table status");
            }
        }
    }
}
