//! Core shard server implementation.
//!
//! The [`Server`] owns one shard's listener, session set, stage table, and
//! semaphore set. `start()` launches three background workers: the accept
//! loop, the session-registration loop, and the idle-session reaper. Each
//! accepted connection then runs on its own pair of tasks (packet loop and
//! writer), so no single event loop exists.
//!
//! Lock ordering: server-level state, then a stage lock, then the semaphore
//! set. Stage operations return notification lists as data and broadcasts
//! happen only after the stage lock is released, so the ordering holds by
//! construction. The stage map and the session map lock internally and may
//! be touched at any point.

use crate::config::ShardConfig;
use crate::error::ServerError;
use crate::repository::{CharacterRepository, LoginIdentity, LoginRepository, MemoryRepository};
use crate::semaphore::SemaphoreSet;
use crate::server::connection::{spawn_session_tasks, HandlerContext};
use crate::server::packets::{ObjectDeleted, Pong};
use crate::session::{Session, SessionId};
use crate::stage::{Object, StageId};
use crate::stage_map::StageMap;
use channel_protocol::frame::opcodes;
use channel_protocol::{DispatchTable, HandlerError, PacketBuild};
use dashmap::DashMap;
use futures::FutureExt;
use socket2::{Domain, Protocol, Socket, Type};
use std::net::{SocketAddr, TcpListener as StdTcpListener};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc, Notify};
use tokio::time::interval;
use tracing::{debug, error, info, warn};

type Handoff = (TcpStream, SocketAddr);

/// One shard of the game world: listener, session set, stage table, and
/// semaphore set, plus the background workers that keep them consistent.
pub struct Server {
    config: ShardConfig,
    sessions: DashMap<SessionId, Arc<Session>>,
    stages: StageMap,
    semaphores: SemaphoreSet,
    dispatch: Arc<DispatchTable<HandlerContext>>,
    login_repo: Arc<dyn LoginRepository>,
    character_repo: Arc<dyn CharacterRepository>,
    shutdown_tx: broadcast::Sender<()>,
    listener_abort: Notify,
    closed: AtomicBool,
    local_addr: StdMutex<Option<SocketAddr>>,
    next_session_id: AtomicU64,
    handoff_tx: mpsc::Sender<Handoff>,
    handoff_rx: StdMutex<Option<mpsc::Receiver<Handoff>>>,
    dereg_tx: mpsc::Sender<SessionId>,
    dereg_rx: StdMutex<Option<mpsc::Receiver<SessionId>>>,
}

impl Server {
    /// Creates a shard with the given configuration, dispatch table, and
    /// repositories. The dispatch table is built exactly once by the caller
    /// and shared read-only from here on.
    pub fn new(
        config: ShardConfig,
        dispatch: DispatchTable<HandlerContext>,
        login_repo: Arc<dyn LoginRepository>,
        character_repo: Arc<dyn CharacterRepository>,
    ) -> Arc<Self> {
        let (shutdown_tx, _) = broadcast::channel(1);
        let (handoff_tx, handoff_rx) = mpsc::channel(config.handoff_capacity);
        let (dereg_tx, dereg_rx) = mpsc::channel(config.handoff_capacity);
        Arc::new(Self {
            config,
            sessions: DashMap::new(),
            stages: StageMap::new(),
            semaphores: SemaphoreSet::new(),
            dispatch: Arc::new(dispatch),
            login_repo,
            character_repo,
            shutdown_tx,
            listener_abort: Notify::new(),
            closed: AtomicBool::new(false),
            local_addr: StdMutex::new(None),
            next_session_id: AtomicU64::new(0),
            handoff_tx,
            handoff_rx: StdMutex::new(Some(handoff_rx)),
            dereg_tx,
            dereg_rx: StdMutex::new(Some(dereg_rx)),
        })
    }

    /// Shard backed by in-memory repositories and the core dispatch table.
    /// Convenient for tests and local development.
    pub fn with_defaults(config: ShardConfig) -> Arc<Self> {
        let repo = Arc::new(MemoryRepository::new());
        Self::new(config, core_dispatch_table(), repo.clone(), repo)
    }

    /// Starts the shard: binds the listener and launches the accept loop,
    /// the registration loop, and the idle reaper.
    ///
    /// # Errors
    ///
    /// Only a bind failure is fatal; everything later is contained to the
    /// smallest possible scope (one packet, one session, one request).
    pub async fn start(self: &Arc<Self>) -> Result<(), ServerError> {
        let listener = self.build_listener()?;
        let bound = listener.local_addr()?;
        *self.local_addr.lock().unwrap_or_else(PoisonError::into_inner) = Some(bound);
        info!("🚀 Shard {} listening on {}", self.config.name, bound);

        let handoff_rx = self
            .handoff_rx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let dereg_rx = self
            .dereg_rx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let (Some(handoff_rx), Some(dereg_rx)) = (handoff_rx, dereg_rx) else {
            return Err(ServerError::Network(std::io::Error::other("server already started")));
        };

        tokio::spawn(self.clone().run_acceptor(listener));
        tokio::spawn(self.clone().run_registrar(handoff_rx, dereg_rx));
        tokio::spawn(self.clone().run_reaper());
        Ok(())
    }

    fn build_listener(&self) -> Result<TcpListener, ServerError> {
        let addr = self.config.bind_address;
        let bind = |addr: SocketAddr| -> std::io::Result<TcpListener> {
            let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
            socket.set_reuse_address(true).ok();
            socket.bind(&addr.into())?;
            socket.listen(1024)?;
            let std_listener: StdTcpListener = socket.into();
            std_listener.set_nonblocking(true)?;
            TcpListener::from_std(std_listener)
        };
        bind(addr).map_err(|source| ServerError::Bind { addr, source })
    }

    /// Blocking accept loop. An accept error during shutdown is expected and
    /// silent; otherwise it is logged and accepting continues. Hand-off to
    /// the registrar races the shutdown signal so the acceptor can never
    /// block forever after `shutdown()`.
    async fn run_acceptor(self: Arc<Self>, listener: TcpListener) {
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        loop {
            tokio::select! {
                result = listener.accept() => match result {
                    Ok((stream, addr)) => {
                        tokio::select! {
                            sent = self.handoff_tx.send((stream, addr)) => {
                                if sent.is_err() {
                                    break;
                                }
                            }
                            _ = shutdown_rx.recv() => break,
                        }
                    }
                    Err(e) => {
                        if self.is_shut_down() {
                            break;
                        }
                        error!("Failed to accept connection: {}", e);
                    }
                },
                _ = self.listener_abort.notified() => {
                    debug!("Listener for shard {} closed on request", self.config.name);
                    break;
                }
                _ = shutdown_rx.recv() => break,
            }
        }
        debug!("Acceptor for shard {} stopped", self.config.name);
    }

    /// Consumes the hand-off queue to register sessions and the
    /// deregistration queue to drop sessions whose connection closed.
    async fn run_registrar(
        self: Arc<Self>,
        mut handoff_rx: mpsc::Receiver<Handoff>,
        mut dereg_rx: mpsc::Receiver<SessionId>,
    ) {
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        loop {
            tokio::select! {
                conn = handoff_rx.recv() => match conn {
                    Some((stream, addr)) => self.register_session(stream, addr),
                    None => break,
                },
                dereg = dereg_rx.recv() => {
                    if let Some(id) = dereg {
                        if let Some((_, session)) = self.sessions.remove(&id) {
                            self.logout_session(session).await;
                        }
                    }
                }
                _ = shutdown_rx.recv() => break,
            }
        }
        debug!("Registrar for shard {} stopped", self.config.name);
    }

    fn register_session(self: &Arc<Self>, stream: TcpStream, addr: SocketAddr) {
        let id = self.next_session_id.fetch_add(1, Ordering::Relaxed) + 1;
        let (session, send_rx) = Session::new(id, addr, self.config.send_queue_capacity);
        let session = Arc::new(session);
        self.sessions.insert(id, session.clone());
        info!("👋 Session {} registered from {}", id, addr);
        spawn_session_tasks(self.clone(), session, stream, send_rx);
    }

    /// Every tick, snapshots sessions idle past the timeout and asks each to
    /// close; the resulting logout (including persistence) runs in the
    /// registrar, outside any shard lock. Also sweeps empty transient stages.
    async fn run_reaper(self: Arc<Self>) {
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let mut ticker = interval(self.config.reaper_interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let idle: Vec<Arc<Session>> = self
                        .sessions
                        .iter()
                        .filter(|entry| entry.value().idle_for() > self.config.idle_timeout)
                        .map(|entry| entry.value().clone())
                        .collect();
                    for session in idle {
                        info!("⏰ Session {} idle for {:?}, closing", session.id, session.idle_for());
                        session.close();
                    }

                    let swept = self.stages.sweep_empty();
                    if swept > 0 {
                        debug!("Swept {} empty transient stage(s)", swept);
                    }
                }
                _ = shutdown_rx.recv() => break,
            }
        }
        debug!("Reaper for shard {} stopped", self.config.name);
    }

    /// Initiates shard shutdown. Idempotent: the first call wins, later
    /// calls are no-ops. Wakes every select-based waiter and closes the
    /// listener; existing sessions are not force-closed and drain naturally.
    pub fn shutdown(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("🛑 Shutting down shard {}", self.config.name);
        let _ = self.shutdown_tx.send(());
    }

    /// Closes the listener without shutting the shard down: the acceptor
    /// exits and drops the socket, new connections are refused, and every
    /// existing session keeps running. Used to drain a shard, and mirrors
    /// what an OS-level listener failure does to the acceptor.
    pub fn close_listener(&self) {
        self.listener_abort.notify_one();
    }

    /// Whether `shutdown()` has been requested.
    pub fn is_shut_down(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// The address the listener actually bound, once `start()` succeeded.
    /// With a configured port of 0 this is where the OS put us.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Serializes `packet` once per local recipient and enqueues it
    /// non-blockingly; a full send queue drops the packet rather than
    /// blocking the broadcaster.
    pub fn broadcast(&self, packet: &dyn PacketBuild, ignored: Option<SessionId>) {
        for entry in self.sessions.iter() {
            if Some(*entry.key()) == ignored {
                continue;
            }
            entry.value().queue_send_nonblock(packet);
        }
    }

    /// Removes a session whose connection ended. Falls back to an inline
    /// logout if the registrar is already gone (post-shutdown drain).
    pub(crate) async fn deregister_session(self: &Arc<Self>, session: Arc<Session>) {
        if self.dereg_tx.send(session.id).await.is_err() {
            if self.sessions.remove(&session.id).is_some() {
                self.logout_session(session).await;
            }
        }
    }

    /// Validates a login token and binds the session to the resolved
    /// character. A token failure closes the connection rather than leaving
    /// a half-authenticated session.
    pub async fn login_session(
        &self,
        session: &Arc<Session>,
        token: &str,
    ) -> Result<LoginIdentity, ServerError> {
        let identity = match self.login_repo.validate_login_token(token).await {
            Ok(identity) => identity,
            Err(e) => {
                error!("Login token rejected for session {}: {}", session.id, e);
                session.close();
                return Err(e);
            }
        };
        session.bind_character(identity.char_id, identity.name.clone());
        if let Err(e) = self.login_repo.bind_session(identity.char_id, &self.config.name).await {
            warn!("Failed to bind session for char {}: {}", identity.char_id, e);
        }
        if let Err(e) = self
            .login_repo
            .update_player_count(&self.config.name, self.sessions.len())
            .await
        {
            warn!("Failed to publish player count: {}", e);
        }
        info!("🔑 Session {} logged in as char {} ({})", session.id, identity.char_id, identity.name);
        Ok(identity)
    }

    /// Tears a session down: cancels its reservation, removes it from its
    /// stage (notifying the remaining clients after the stage lock drops),
    /// and persists accumulated data. Repository failures are logged, never
    /// retried.
    pub async fn logout_session(&self, session: Arc<Session>) {
        let (char_id, reservation, save_data) = {
            let mut state = session.state();
            (state.char_id, state.reservation_stage_id.take(), std::mem::take(&mut state.save_data))
        };

        if let (Some(stage_id), Some(char_id)) = (&reservation, char_id) {
            if let Some(stage) = self.stages.get(stage_id) {
                stage.cancel_reservation(char_id);
            }
        }

        self.leave_current_stage(&session);

        if let Some(char_id) = char_id {
            if let Err(e) = self.character_repo.save_character_data(char_id, &save_data).await {
                error!("Failed to save char {} at logout: {}", char_id, e);
            }
            if let Err(e) = self
                .login_repo
                .update_player_count(&self.config.name, self.sessions.len())
                .await
            {
                warn!("Failed to publish player count: {}", e);
            }
        }

        info!("👋 Session {} logged out", session.id);
    }

    /// Removes the session from its current stage and, after the stage lock
    /// is released, tells the remaining clients about the deleted objects.
    ///
    /// The notices are enqueued non-blockingly: this runs in the registrar
    /// during logout, and a peer with a stalled socket must never stall the
    /// registrar.
    pub fn leave_current_stage(&self, session: &Arc<Session>) {
        let Some(stage_id) = session.state().stage_id.take() else {
            return;
        };
        let Some(stage) = self.stages.get(&stage_id) else {
            return;
        };
        let removal = stage.remove_client(session.id);
        for object in &removal.deleted_objects {
            let notice = ObjectDeleted { object: *object };
            for peer_id in &removal.remaining {
                if let Some(peer) = self.session(*peer_id) {
                    if !peer.queue_send_nonblock(&notice) {
                        debug!("Object-delete notice to session {} dropped", peer_id);
                    }
                }
            }
        }
    }

    // ---- derived queries over shard state ----

    /// The session registered under `id`, if any.
    pub fn session(&self, id: SessionId) -> Option<Arc<Session>> {
        self.sessions.get(&id).map(|entry| entry.value().clone())
    }

    /// Linear scan for the session bound to `char_id`.
    pub fn find_session_by_char_id(&self, char_id: u32) -> Option<Arc<Session>> {
        self.sessions
            .iter()
            .map(|entry| entry.value().clone())
            .find(|session| session.char_id() == Some(char_id))
    }

    /// The object owned by `char_id` in any of this shard's stages.
    pub fn find_object_by_char(&self, char_id: u32) -> Option<Object> {
        let mut found = None;
        self.stages.for_each(|stage| {
            if found.is_none() {
                found = stage.object_by_char(char_id);
            }
        });
        found
    }

    /// Whether `session` participates in any semaphore on this shard.
    pub fn has_semaphore(&self, session: SessionId) -> bool {
        self.semaphores.has_session(session)
    }

    /// Bounded wait for a binary blob another client is expected to store on
    /// `stage_id`, using the configured retry budget. An unknown stage or an
    /// exhausted budget yields an empty buffer.
    pub async fn wait_stage_binary(&self, stage_id: &StageId, key: (u8, u8)) -> Vec<u8> {
        match self.stages.get(stage_id) {
            Some(stage) => {
                stage
                    .wait_binary(key, self.config.binary_wait_retries, self.config.binary_wait_interval)
                    .await
            }
            None => Vec::new(),
        }
    }

    /// Season index (0-2) derived from the shard's ordinal.
    pub fn season(&self) -> u8 {
        self.config.ordinal % 3
    }

    /// Number of sessions currently registered.
    pub fn current_players(&self) -> usize {
        self.sessions.len()
    }

    /// The shard's stage table.
    pub fn stages(&self) -> &StageMap {
        &self.stages
    }

    /// The shard's semaphore set.
    pub fn semaphores(&self) -> &SemaphoreSet {
        &self.semaphores
    }

    /// The shard's configuration.
    pub fn config(&self) -> &ShardConfig {
        &self.config
    }

    /// The dispatch table shared by every session's packet loop.
    pub fn dispatch_table(&self) -> &DispatchTable<HandlerContext> {
        self.dispatch.as_ref()
    }

    /// Snapshot of all registered sessions.
    pub fn sessions_snapshot(&self) -> Vec<Arc<Session>> {
        self.sessions.iter().map(|entry| entry.value().clone()).collect()
    }

    /// Registers a session that has no backing socket.
    #[cfg(test)]
    pub(crate) fn insert_session_direct(&self, session: Arc<Session>) {
        self.sessions.insert(session.id, session);
    }
}

/// Dispatch table carrying only the core's own handlers (keepalive). Game
/// handlers are registered on top of this by the embedding binary.
pub fn core_dispatch_table() -> DispatchTable<HandlerContext> {
    DispatchTable::builder()
        .register(opcodes::PING, |ctx: HandlerContext, _payload| {
            async move {
                ctx.session
                    .queue_send(&Pong)
                    .await
                    .map_err(|_| HandlerError::SessionClosed)
            }
            .boxed()
        })
        .build()
}
