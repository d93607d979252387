//! Session node — one process's endpoint in a session, as host or client.
//!
//! The node owns the per-session state (directory, roster, correlator) and
//! routes every inbound datagram: discovery requests and player-id service
//! are answered here when hosting, discovery replies go to the directory,
//! and anything else is offered to the correlator.

use std::net::SocketAddr;
use std::ops::ControlFlow;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::net::UdpSocket;
use tokio::sync::{broadcast, Notify};

use playnet_core::config::{PlaynetConfig, ProviderConfig};
use playnet_core::wire::{
    self, CommandId, DiscoveryQuery, ForwardAddPlayer, MAX_DATAGRAM, VERSION,
};
use playnet_core::{Guid, PlayerName, SessionDescriptor, SessionFlags};

use crate::correlator::ReplyCorrelator;
use crate::directory::{Clock, SessionDirectory, DEFAULT_MAX_AGE};
use crate::discovery::{Broadcaster, EnumEvent};
use crate::error::{PlayError, PlayResult};
use crate::providers::ProviderCatalogue;
use crate::roster::{Dpid, RequestedId, Roster};
use crate::transport::Transport;

/// Reasons carried in a `ForwardAddPlayerNack`.
pub mod nack {
    pub const CANNOT_CREATE: u32 = 1;
    pub const INVALID_PASSWORD: u32 = 2;
    pub const SESSION_FULL: u32 = 3;
    pub const JOIN_DISABLED: u32 = 4;

    pub fn describe(code: u32) -> &'static str {
        match code {
            INVALID_PASSWORD => "host rejected the session password",
            SESSION_FULL => "session is full",
            JOIN_DISABLED => "session is not accepting new players",
            _ => "host refused the player",
        }
    }
}

/// Whether this node hosts the session it belongs to.
#[derive(Debug, Clone)]
pub enum NodeRole {
    Host(SessionDescriptor),
    Client,
}

/// Tunables taken from configuration.
#[derive(Debug, Clone)]
pub struct NodeSettings {
    pub reply_timeout: Duration,
    pub session_max_age: u32,
    pub providers: Vec<ProviderConfig>,
}

impl Default for NodeSettings {
    fn default() -> Self {
        Self {
            reply_timeout: Duration::from_secs(5),
            session_max_age: DEFAULT_MAX_AGE,
            providers: Vec::new(),
        }
    }
}

impl From<&PlaynetConfig> for NodeSettings {
    fn from(config: &PlaynetConfig) -> Self {
        Self {
            reply_timeout: config.discovery.reply_timeout(),
            session_max_age: config.discovery.session_max_age_secs,
            providers: config.providers.clone(),
        }
    }
}

/// Session this node has joined, and where its host lives.
#[derive(Debug, Clone)]
struct Joined {
    session: SessionDescriptor,
    host: SocketAddr,
}

pub struct Node {
    is_host: bool,
    hosted: Mutex<Option<SessionDescriptor>>,
    joined: Mutex<Option<Joined>>,
    transport: Arc<dyn Transport>,
    correlator: ReplyCorrelator,
    directory: Arc<SessionDirectory>,
    broadcaster: Broadcaster,
    roster: Roster,
    /// Where each remote player's traffic goes.
    peers: DashMap<Dpid, SocketAddr>,
    providers: ProviderCatalogue,
    clock: Clock,
    session_max_age: u32,
    reply_timeout: Duration,
}

impl Node {
    pub fn new(transport: Arc<dyn Transport>, role: NodeRole, settings: NodeSettings) -> PlayResult<Self> {
        let (is_host, hosted) = match role {
            NodeRole::Host(session) => {
                session
                    .validate()
                    .map_err(|e| PlayError::InvalidParams(e.to_string()))?;
                (true, Some(session))
            }
            NodeRole::Client => (false, None),
        };

        let clock = Clock::new();
        let directory = Arc::new(SessionDirectory::new());
        let broadcaster = Broadcaster::new(Arc::clone(&transport), Arc::clone(&directory), clock)
            .with_max_age(settings.session_max_age);

        Ok(Self {
            is_host,
            hosted: Mutex::new(hosted),
            joined: Mutex::new(None),
            transport,
            correlator: ReplyCorrelator::new(),
            directory,
            broadcaster,
            roster: Roster::new(is_host),
            peers: DashMap::new(),
            providers: ProviderCatalogue::new(&settings.providers),
            clock,
            session_max_age: settings.session_max_age,
            reply_timeout: settings.reply_timeout,
        })
    }

    pub fn is_host(&self) -> bool {
        self.is_host
    }

    pub fn roster(&self) -> &Roster {
        &self.roster
    }

    pub fn directory(&self) -> &Arc<SessionDirectory> {
        &self.directory
    }

    pub fn correlator(&self) -> &ReplyCorrelator {
        &self.correlator
    }

    pub fn broadcaster(&self) -> &Broadcaster {
        &self.broadcaster
    }

    pub fn providers(&self) -> &ProviderCatalogue {
        &self.providers
    }

    pub fn initialize_connection(&self, provider: &Guid) -> PlayResult<()> {
        self.providers.initialize_connection(provider).map(|_| ())
    }

    /// The hosted session with a live player count, or the joined session.
    pub fn session(&self) -> Option<SessionDescriptor> {
        if let Some(mut session) = self.hosted.lock().clone() {
            session.current_players = self.roster.player_count() as u32;
            return Some(session);
        }
        self.joined.lock().as_ref().map(|j| j.session.clone())
    }

    /// Change the hosted session's flags, e.g. to stop accepting joins.
    pub fn set_session_flags(&self, flags: SessionFlags) -> PlayResult<()> {
        match self.hosted.lock().as_mut() {
            Some(session) => {
                session.flags = flags;
                Ok(())
            }
            None => Err(PlayError::InvalidParams("only the host owns session flags".into())),
        }
    }

    pub fn peer_addr(&self, player: Dpid) -> Option<SocketAddr> {
        self.peers.get(&player).map(|e| *e.value())
    }

    // ── Discovery ────────────────────────────────────────────────────────────

    /// One-shot enumeration of sessions on the local segment.
    pub async fn enum_sessions<F>(&self, query: &DiscoveryQuery, timeout: Duration, visitor: F) -> PlayResult<()>
    where
        F: FnMut(EnumEvent<'_>) -> ControlFlow<()>,
    {
        self.broadcaster.broadcast_and_wait(query, timeout, visitor).await
    }

    /// Drop cached sessions that have not answered within the max age.
    pub fn expire_sessions(&self) -> usize {
        self.directory.prune(self.clock.now(), self.session_max_age)
    }

    /// Attach to a cached session. Player creation then goes to its host.
    pub fn join(&self, instance_id: &Guid, password: Option<&str>) -> PlayResult<SessionDescriptor> {
        if self.is_host {
            return Err(PlayError::InvalidParams("a host cannot join another session".into()));
        }
        let entry = self
            .directory
            .find(instance_id)
            .ok_or_else(|| PlayError::NotFound(format!("session {instance_id}")))?;
        self.attach(entry.descriptor, entry.source, password)
    }

    /// Attach to whichever cached session was heard first.
    pub fn join_first(&self, password: Option<&str>) -> PlayResult<SessionDescriptor> {
        let host = self
            .directory
            .first_source_address()
            .ok_or_else(|| PlayError::NotFound("no sessions cached".into()))?;
        let descriptor = self
            .directory
            .enumerate()
            .into_iter()
            .find(|e| e.source == host)
            .map(|e| e.descriptor)
            .ok_or_else(|| PlayError::NotFound("no sessions cached".into()))?;
        self.attach(descriptor, host, password)
    }

    fn attach(
        &self,
        mut session: SessionDescriptor,
        host: SocketAddr,
        password: Option<&str>,
    ) -> PlayResult<SessionDescriptor> {
        if session.flags.contains(SessionFlags::JOIN_DISABLED) {
            return Err(PlayError::InvalidParams(format!(
                "session {} is not accepting joins",
                session.instance_id
            )));
        }
        session.password = password.map(str::to_string);
        *self.joined.lock() = Some(Joined {
            session: session.clone(),
            host,
        });
        tracing::info!(instance = %session.instance_id, %host, name = %session.name, "joined session");
        Ok(session)
    }

    // ── Players ──────────────────────────────────────────────────────────────

    /// Create the host's own player.
    pub fn create_server_player(&self, name: PlayerName, data: &[u8]) -> PlayResult<Dpid> {
        self.roster
            .create_player(RequestedId::Fixed(Dpid::SERVER_PLAYER), name, data, None)
    }

    /// Create a local player. A client first obtains the id from the host
    /// and then has the host mirror the player.
    pub async fn create_player(
        &self,
        name: PlayerName,
        data: &[u8],
        wait_handle: Option<Arc<Notify>>,
    ) -> PlayResult<Dpid> {
        if self.is_host {
            return self.roster.create_player(RequestedId::Auto, name, data, wait_handle);
        }

        let joined = self
            .joined
            .lock()
            .clone()
            .ok_or_else(|| PlayError::InvalidParams("not joined to a session".into()))?;

        let pending = self
            .correlator
            .expect(&[CommandId::NewPlayerIdReply], self.reply_timeout);
        self.send(
            CommandId::RequestNewPlayerId,
            &wire::encode_new_player_id_request(0),
            joined.host,
        )?;
        let reply = pending.wait().await?;
        let id = Dpid(wire::decode_new_player_id_reply(&reply.payload)?);

        self.roster
            .create_player(RequestedId::Fixed(id), name.clone(), data, wait_handle)?;

        let forward = ForwardAddPlayer {
            to_id: Dpid::SERVER_PLAYER.0,
            player_id: id.0,
            group_id: 0,
            flags: 0,
            name,
            data: data.to_vec(),
            password: joined.session.password.clone(),
        };
        let pending = self.correlator.expect(
            &[CommandId::GetNameTableReply, CommandId::ForwardAddPlayerNack],
            self.reply_timeout,
        );
        if let Err(e) = self.send(CommandId::ForwardAddPlayer, &forward.encode(), joined.host) {
            let _ = self.roster.destroy_player(id);
            return Err(e);
        }

        let outcome = match pending.wait().await {
            Ok(reply) if reply.command == CommandId::GetNameTableReply => {
                let ids = wire::decode_name_table(&reply.payload)?;
                tracing::info!(player = %id, players = ids.len(), "player added to session");
                Ok(id)
            }
            Ok(reply) => {
                let code = wire::decode_forward_add_player_nack(&reply.payload)?;
                tracing::warn!(player = %id, code, "host refused player");
                Err(PlayError::CannotCreatePlayer(nack::describe(code)))
            }
            Err(e) => Err(e),
        };
        if outcome.is_err() {
            let _ = self.roster.destroy_player(id);
        }
        outcome
    }

    // ── Inbound path ─────────────────────────────────────────────────────────

    /// Handle one datagram. Malformed input is logged and dropped.
    pub fn dispatch(&self, datagram: &[u8], from: SocketAddr) {
        let msg = match wire::decode(datagram) {
            Ok(msg) => msg,
            Err(e) => {
                tracing::debug!(
                    %from,
                    error = %e,
                    head = hex::encode(&datagram[..datagram.len().min(16)]),
                    "dropping malformed datagram"
                );
                return;
            }
        };

        let handled = match msg.command {
            CommandId::EnumSessionsRequest => self.on_discovery_request(msg.payload, from),
            CommandId::EnumSessionsReply => self.on_discovery_reply(msg.payload, from),
            CommandId::RequestNewPlayerId if self.is_host => self.on_new_player_id(msg.payload, from),
            CommandId::ForwardAddPlayer if self.is_host => self.on_forward_add_player(msg.payload, from),
            CommandId::GetNameTable if self.is_host => self.send_name_table(from),
            command => {
                if !self.correlator.deliver(command, msg.payload) {
                    tracing::trace!(?command, %from, "unsolicited message");
                }
                Ok(())
            }
        };

        if let Err(e) = handled {
            tracing::debug!(command = ?msg.command, %from, error = %e, "message dropped");
        }
    }

    /// Receive and dispatch until `shutdown` fires.
    pub async fn run_receiver(self: Arc<Self>, socket: Arc<UdpSocket>, mut shutdown: broadcast::Receiver<()>) {
        let mut buf = vec![0u8; MAX_DATAGRAM];
        tracing::info!(host = self.is_host, "receiver starting");
        loop {
            tokio::select! {
                received = socket.recv_from(&mut buf) => match received {
                    Ok((len, from)) => self.dispatch(&buf[..len], from),
                    Err(e) => tracing::warn!(error = %e, "recv_from failed"),
                },
                _ = shutdown.recv() => break,
            }
        }
        tracing::info!("receiver stopped");
    }

    /// Stop background enumeration and wake every waiting request.
    pub async fn shutdown(&self) {
        self.broadcaster.stop_async().await;
        self.correlator.cancel_all();
    }

    fn on_discovery_request(&self, payload: &[u8], from: SocketAddr) -> PlayResult<()> {
        let query = DiscoveryQuery::decode(payload)?;
        let Some(session) = self.session().filter(|_| self.is_host) else {
            return Ok(());
        };
        if !query.admits(&session) {
            tracing::trace!(%from, "discovery request does not match hosted session");
            return Ok(());
        }
        self.send(CommandId::EnumSessionsReply, &session.encode_reply(), from)?;
        tracing::debug!(%from, instance = %session.instance_id, "answered discovery request");
        Ok(())
    }

    fn on_discovery_reply(&self, payload: &[u8], from: SocketAddr) -> PlayResult<()> {
        let session = SessionDescriptor::decode_reply(payload)?;
        self.directory.insert(session, from, self.clock.now());
        Ok(())
    }

    fn on_new_player_id(&self, payload: &[u8], from: SocketAddr) -> PlayResult<()> {
        let _flags = wire::decode_new_player_id_request(payload)?;
        let id = self.roster.allocate_id()?;
        self.send(CommandId::NewPlayerIdReply, &wire::encode_new_player_id_reply(id.0), from)?;
        tracing::debug!(%from, player = %id, "issued player id");
        Ok(())
    }

    fn on_forward_add_player(&self, payload: &[u8], from: SocketAddr) -> PlayResult<()> {
        let forward = ForwardAddPlayer::decode(payload)?;
        match self.admit_remote_player(&forward, from) {
            Ok(()) => self.send_name_table(from),
            Err(code) => {
                tracing::info!(%from, player = forward.player_id, reason = nack::describe(code), "refusing player");
                self.send(
                    CommandId::ForwardAddPlayerNack,
                    &wire::encode_forward_add_player_nack(code),
                    from,
                )
            }
        }
    }

    fn admit_remote_player(&self, forward: &ForwardAddPlayer, from: SocketAddr) -> Result<(), u32> {
        let session = self.session().ok_or(nack::CANNOT_CREATE)?;
        if session.flags.contains(SessionFlags::NEW_PLAYERS_DISABLED)
            || session.flags.contains(SessionFlags::JOIN_DISABLED)
        {
            return Err(nack::JOIN_DISABLED);
        }
        if let Some(expected) = session.password.as_deref().filter(|p| !p.is_empty()) {
            if forward.password.as_deref() != Some(expected) {
                return Err(nack::INVALID_PASSWORD);
            }
        }
        if session.max_players != 0 && session.current_players >= session.max_players {
            return Err(nack::SESSION_FULL);
        }

        let id = Dpid(forward.player_id);
        if matches!(id, Dpid::SYSTEM | Dpid::SERVER_PLAYER) {
            return Err(nack::CANNOT_CREATE);
        }
        self.roster
            .create_remote_player(id, forward.name.clone(), &forward.data)
            .map_err(|_| nack::CANNOT_CREATE)?;
        self.peers.insert(id, from);

        if forward.group_id != 0 {
            if let Err(e) = self.roster.add_player_to_group(Dpid(forward.group_id), id) {
                tracing::debug!(player = %id, group = forward.group_id, error = %e, "group join skipped");
            }
        }
        tracing::info!(player = %id, %from, "remote player added");
        Ok(())
    }

    fn send_name_table(&self, to: SocketAddr) -> PlayResult<()> {
        let ids: Vec<u32> = self.roster.player_ids().into_iter().map(|d| d.0).collect();
        self.send(CommandId::GetNameTableReply, &wire::encode_name_table(&ids), to)
    }

    fn send(&self, command: CommandId, payload: &[u8], to: SocketAddr) -> PlayResult<()> {
        let datagram = wire::encode(command, VERSION, payload);
        self.transport.send_to(&datagram, to)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::UdpTransport;

    const ENUM_WAIT: Duration = Duration::from_millis(300);

    struct Running {
        node: Arc<Node>,
        addr: SocketAddr,
        _shutdown: broadcast::Sender<()>,
    }

    fn start(role: NodeRole, broadcast_to: SocketAddr, reply_timeout: Duration) -> Running {
        let transport = UdpTransport::bind("127.0.0.1:0".parse().unwrap(), broadcast_to).unwrap();
        let addr = transport.local_addr().unwrap();
        let socket = transport.socket();
        let settings = NodeSettings {
            reply_timeout,
            ..NodeSettings::default()
        };
        let node = Arc::new(Node::new(Arc::new(transport), role, settings).unwrap());
        let (tx, rx) = broadcast::channel(1);
        tokio::spawn(node.clone().run_receiver(socket, rx));
        Running {
            node,
            addr,
            _shutdown: tx,
        }
    }

    fn hosted(app: Guid, max_players: u32) -> SessionDescriptor {
        SessionDescriptor::new(app, "test arena", max_players)
    }

    async fn discover(client: &Node, app: Guid) -> Vec<SessionDescriptor> {
        let mut found = Vec::new();
        client
            .enum_sessions(&DiscoveryQuery::for_application(app), ENUM_WAIT, |event| {
                if let EnumEvent::Session(entry) = event {
                    found.push(entry.descriptor.clone());
                }
                ControlFlow::Continue(())
            })
            .await
            .unwrap();
        found
    }

    #[tokio::test]
    async fn client_discovers_joins_and_creates_player() {
        let app = Guid::random();
        let host = start(
            NodeRole::Host(hosted(app, 4)),
            "127.0.0.1:9".parse().unwrap(),
            Duration::from_secs(2),
        );
        host.node
            .create_server_player(PlayerName::short("host"), &[])
            .unwrap();
        let client = start(NodeRole::Client, host.addr, Duration::from_secs(2));

        let found = discover(&client.node, app).await;
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].current_players, 1);

        client.node.join(&found[0].instance_id, None).unwrap();
        let id = client
            .node
            .create_player(PlayerName::new("guest", "The Guest"), b"loadout", None)
            .await
            .unwrap();

        assert_eq!(id, Dpid(2));
        assert!(client.node.roster().find_player(id).unwrap().local);
        let mirrored = host.node.roster().find_player(id).unwrap();
        assert!(!mirrored.local);
        assert_eq!(&mirrored.data[..], b"loadout");
        assert_eq!(host.node.peer_addr(id), Some(client.addr));
    }

    #[tokio::test]
    async fn wrong_password_is_refused_and_local_player_removed() {
        let app = Guid::random();
        let mut session = hosted(app, 0);
        session.password = Some("letmein".into());
        let host = start(NodeRole::Host(session), "127.0.0.1:9".parse().unwrap(), Duration::from_secs(2));
        let client = start(NodeRole::Client, host.addr, Duration::from_secs(2));

        // Password-protected sessions are only listed when asked for.
        let query = DiscoveryQuery {
            application_id: app,
            password: None,
            flags: wire::EnumFlags::PASSWORD_REQUIRED,
        };
        let mut instance = None;
        client
            .node
            .enum_sessions(&query, ENUM_WAIT, |event| {
                if let EnumEvent::Session(entry) = event {
                    instance = Some(entry.descriptor.instance_id);
                }
                ControlFlow::Continue(())
            })
            .await
            .unwrap();

        client.node.join(&instance.unwrap(), Some("guess")).unwrap();
        let err = client
            .node
            .create_player(PlayerName::short("intruder"), &[], None)
            .await
            .unwrap_err();
        assert!(matches!(err, PlayError::CannotCreatePlayer(_)));
        assert_eq!(client.node.roster().player_count(), 0);
        assert_eq!(host.node.roster().player_count(), 0);
    }

    #[tokio::test]
    async fn join_disabled_session_is_hidden_by_default() {
        let app = Guid::random();
        let host = start(NodeRole::Host(hosted(app, 0)), "127.0.0.1:9".parse().unwrap(), Duration::from_secs(2));
        host.node.set_session_flags(SessionFlags::JOIN_DISABLED).unwrap();
        let client = start(NodeRole::Client, host.addr, Duration::from_secs(2));

        assert!(discover(&client.node, app).await.is_empty());
    }

    #[tokio::test]
    async fn silent_host_times_out() {
        let silent = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let silent_addr = silent.local_addr().unwrap();
        let client = start(NodeRole::Client, silent_addr, Duration::from_millis(200));

        // Seed the directory as if the silent peer had answered once.
        client.node.directory().insert(hosted(Guid::random(), 0), silent_addr, client.node.clock.now());
        client.node.join_first(None).unwrap();

        let err = client
            .node
            .create_player(PlayerName::short("lonely"), &[], None)
            .await
            .unwrap_err();
        assert!(matches!(err, PlayError::Timeout));
        assert_eq!(client.node.correlator().pending_count(), 0);
        assert_eq!(client.node.roster().player_count(), 0);
    }

    #[tokio::test]
    async fn garbage_and_unsolicited_datagrams_are_ignored() {
        let client = start(NodeRole::Client, "127.0.0.1:9".parse().unwrap(), Duration::from_secs(1));
        let from: SocketAddr = "127.0.0.1:4000".parse().unwrap();

        client.node.dispatch(b"not a playnet datagram", from);
        client.node.dispatch(
            &wire::encode(CommandId::NewPlayerIdReply, VERSION, &wire::encode_new_player_id_reply(5)),
            from,
        );
        // A reply with impossible player counts never reaches the directory.
        let mut bad = hosted(Guid::random(), 2);
        bad.current_players = 3;
        client
            .node
            .dispatch(&wire::encode(CommandId::EnumSessionsReply, VERSION, &bad.encode_reply()), from);

        assert!(client.node.directory().is_empty());
        assert_eq!(client.node.correlator().pending_count(), 0);
    }

    #[tokio::test]
    async fn host_cannot_join_and_client_needs_a_session() {
        let host = start(NodeRole::Host(hosted(Guid::NIL, 0)), "127.0.0.1:9".parse().unwrap(), Duration::from_secs(1));
        assert!(host.node.join(&Guid::random(), None).is_err());

        let client = start(NodeRole::Client, "127.0.0.1:9".parse().unwrap(), Duration::from_secs(1));
        assert!(matches!(
            client.node.create_player(PlayerName::short("x"), &[], None).await,
            Err(PlayError::InvalidParams(_))
        ));
    }
}
