use crate::commands::{Input, SessionCommand};
use crate::sync::{AvatarApply, CanvasApply, FullSyncStep, StateSyncEngine};
use log::{debug, error, info, trace, warn};
use network::protocol;
use network::{
    join_address, Acceptance, CloseKind, Connector, Dialer, Discovery, Link, LinkEvent,
    LinkHandle, PeerRegistry, PlayerAdmission,
};
use rand::seq::SliceRandom;
use room_core::{
    now_millis, AvatarState, CanvasId, CanvasState, Envelope, Error, PeerId, PeerList, PlayerInfo,
    PlayerLeft, PlayerMove, SessionEvent, SessionSnapshot, AVATAR_PALETTE, CONNECT_TIMEOUT,
};
use settings_manager::CanvasCache;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// Static parameters of a session
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Peers to dial as soon as the endpoint is up
    pub bootstrap: Vec<PeerId>,
    /// Canvas slots per wall
    pub slots_per_wall: usize,
    /// Base of the join address handed out to others
    pub join_base_url: String,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            bootstrap: Vec::new(),
            slots_per_wall: 4,
            join_base_url: "room://join".to_string(),
        }
    }
}

/// Everything the handlers write to besides the session state itself
struct Context {
    events: mpsc::UnboundedSender<SessionEvent>,
    inputs: mpsc::UnboundedSender<Input>,
    discovery: Discovery,
    cache: Option<CanvasCache>,
    status: String,
    /// Bumped on every rebind; inputs from an older binding are dropped
    epoch: u64,
}

impl Context {
    fn emit(&self, event: SessionEvent) {
        if self.events.send(event).is_err() {
            trace!("No one is listening for session events");
        }
    }

    fn set_status(&mut self, status: impl Into<String>) {
        self.status = status.into();
        info!("{}", self.status);
        self.emit(SessionEvent::Status(self.status.clone()));
    }

    fn cache_canvas(&self, canvas: &CanvasState) {
        if let Some(cache) = &self.cache {
            if let Err(e) = cache.store(canvas, now_millis()) {
                warn!("Failed to cache canvas {}: {}", canvas.canvas_id, e);
            }
        }
    }

    /// Post `input` back to the loop after `delay`
    fn schedule(&self, delay: Duration, input: Input) -> JoinHandle<()> {
        let inputs = self.inputs.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = inputs.send(input);
        })
    }
}

/// A started session: the bound endpoint and all per-peer state
struct Session {
    /// `None` when binding failed; the session then runs with zero peers
    dialer: Option<Box<dyn Dialer>>,
    incoming: Option<JoinHandle<()>>,
    registry: PeerRegistry,
    engine: StateSyncEngine,
}

impl Session {
    fn local(&self) -> &PeerId {
        self.registry.local()
    }

    fn release_endpoint(&mut self) {
        if let Some(incoming) = self.incoming.take() {
            incoming.abort();
        }
        if let Some(dialer) = self.dialer.take() {
            dialer.close();
        }
    }

    fn send(&self, link: &LinkHandle, envelope: &Envelope) {
        let bytes = match protocol::encode(envelope) {
            Ok(bytes) => bytes,
            Err(e) => {
                error!("{}", e);
                return;
            }
        };
        if let Err(e) = link.send(bytes) {
            debug!("Dropping {} for {}: {}", envelope.kind(), link.remote(), e);
        }
    }

    fn send_to(&self, peer: &PeerId, envelope: &Envelope) {
        if let Some(conn) = self.registry.connection(peer) {
            self.send(conn.link(), envelope);
        }
    }

    fn broadcast(&self, envelope: &Envelope, except: Option<&PeerId>) {
        for link in self.registry.open_links(except) {
            self.send(&link, envelope);
        }
    }

    /// Dial `peer` unless it is ourselves or already pending/open
    fn connect(&mut self, ctx: &mut Context, peer: &PeerId, retry_on_timeout: bool) {
        if !self.registry.should_connect(peer) {
            trace!("Not dialing {}: self or already connecting", peer);
            return;
        }
        let Some(dialer) = self.dialer.as_ref() else {
            debug!("Not dialing {}: no endpoint", peer);
            return;
        };

        let link = match dialer.dial(peer) {
            Ok(link) => link,
            Err(e) => {
                warn!("Failed to dial {}: {}", peer, e);
                self.schedule_retry(ctx, peer);
                return;
            }
        };

        let Link { handle, events } = link;
        let Some(conn_id) = self.registry.register_outbound(handle, retry_on_timeout) else {
            return;
        };
        debug!("Dialing {} (connection {})", peer, conn_id);
        self.watch(ctx, peer, conn_id, events);
    }

    /// Forward a link's events into the loop and arm its connect timeout
    fn watch(
        &mut self,
        ctx: &Context,
        peer: &PeerId,
        conn_id: u64,
        mut events: mpsc::UnboundedReceiver<LinkEvent>,
    ) {
        let inputs = ctx.inputs.clone();
        let forward_peer = peer.clone();
        let forward = tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                let input = Input::Link {
                    peer: forward_peer.clone(),
                    conn_id,
                    event,
                };
                if inputs.send(input).is_err() {
                    break;
                }
            }
        });
        let timeout = ctx.schedule(
            CONNECT_TIMEOUT,
            Input::ConnectTimeout {
                peer: peer.clone(),
                conn_id,
            },
        );

        if let Some(conn) = self.registry.connection_mut(peer) {
            conn.attach_task(forward);
            conn.attach_task(timeout);
        }
    }

    fn schedule_retry(&mut self, ctx: &mut Context, peer: &PeerId) {
        match self.registry.record_failure(peer) {
            Some(delay) => {
                debug!("Retrying {} in {:?}", peer, delay);
                let timer = ctx.schedule(
                    delay,
                    Input::RetryConnect {
                        peer: peer.clone(),
                        epoch: ctx.epoch,
                    },
                );
                self.registry.set_retry_timer(peer, timer);
            }
            None => ctx.set_status(format!("Giving up on {} until it is rediscovered", peer)),
        }
    }

    fn on_incoming(&mut self, ctx: &mut Context, link: Link) {
        let Link { handle, events } = link;
        let peer = handle.remote().clone();

        let conn_id = match self.registry.accept(handle.clone()) {
            Acceptance::Rejected => {
                debug!("Rejecting inbound connection from {}", peer);
                handle.close();
                return;
            }
            Acceptance::Accepted(conn_id) => conn_id,
            Acceptance::Replaced { conn_id, previous } => {
                debug!(
                    "Inbound connection {} from {} replaces {}",
                    conn_id,
                    peer,
                    previous.conn_id()
                );
                previous.link().close();
                conn_id
            }
        };
        self.watch(ctx, &peer, conn_id, events);
    }

    fn on_link_event(&mut self, ctx: &mut Context, peer: PeerId, conn_id: u64, event: LinkEvent) {
        if !self.registry.is_current(&peer, conn_id) {
            trace!("Ignoring {:?} from stale connection {} to {}", event, conn_id, peer);
            return;
        }

        match event {
            LinkEvent::Open => self.on_open(ctx, &peer, conn_id),
            LinkEvent::Message(bytes) => {
                self.registry.touch(&peer, conn_id);
                match protocol::decode(&bytes) {
                    Ok(envelope) => self.on_envelope(ctx, &peer, envelope),
                    Err(e) => warn!("Dropping message from {}: {}", peer, e),
                }
            }
            LinkEvent::Closed => self.close_connection(ctx, &peer, conn_id, CloseKind::Graceful),
            LinkEvent::Error(reason) => {
                warn!("Connection to {} failed: {}", peer, reason);
                self.close_connection(ctx, &peer, conn_id, CloseKind::Error);
                self.schedule_retry(ctx, &peer);
            }
        }
    }

    fn on_open(&mut self, ctx: &mut Context, peer: &PeerId, conn_id: u64) {
        if !self.registry.mark_open(peer, conn_id) {
            return;
        }
        ctx.set_status(format!(
            "Connected to {} ({} open)",
            peer,
            self.registry.open_peers().len()
        ));

        for envelope in ctx.discovery.greeting(self.engine.player_info()) {
            self.send_to(peer, &envelope);
        }

        let (request, check_after) = self.engine.begin_full_sync(peer);
        self.send_to(peer, &Envelope::RequestAllCanvasData(request));
        let check = ctx.schedule(
            check_after,
            Input::FullSyncCheck {
                peer: peer.clone(),
                conn_id,
            },
        );
        if let Some(conn) = self.registry.connection_mut(peer) {
            conn.attach_task(check);
        }
    }

    fn close_connection(&mut self, ctx: &mut Context, peer: &PeerId, conn_id: u64, kind: CloseKind) {
        let Some(conn) = self.registry.mark_closed(peer, conn_id, kind) else {
            return;
        };
        conn.link().close();
        drop(conn);

        if self.engine.remove_avatar(peer) {
            ctx.emit(SessionEvent::PeerLeft(peer.clone()));
        }
        ctx.set_status(format!(
            "Disconnected from {} ({} open)",
            peer,
            self.registry.open_peers().len()
        ));
    }

    fn on_connect_timeout(&mut self, ctx: &mut Context, peer: &PeerId, conn_id: u64) {
        let Some(conn) = self.registry.expire_pending(peer, conn_id) else {
            return;
        };
        conn.link().close();
        let retry = conn.retry_on_timeout();
        drop(conn);

        if retry {
            warn!("Connection to {} timed out, retrying once", peer);
            self.connect(ctx, peer, false);
        } else {
            ctx.set_status(format!("Connection to {} timed out", peer));
        }
    }

    fn on_full_sync_check(&mut self, ctx: &mut Context, peer: &PeerId, conn_id: u64) {
        if !self.registry.is_current(peer, conn_id) {
            return;
        }
        match self.engine.full_sync_step(peer) {
            FullSyncStep::Done => {}
            FullSyncStep::Resend { next_check } => {
                debug!("No canvas data from {} yet, asking again", peer);
                let request = Envelope::RequestAllCanvasData(self.engine.full_sync_request());
                self.send_to(peer, &request);
                if let Some(delay) = next_check {
                    let check = ctx.schedule(
                        delay,
                        Input::FullSyncCheck {
                            peer: peer.clone(),
                            conn_id,
                        },
                    );
                    if let Some(conn) = self.registry.connection_mut(peer) {
                        conn.attach_task(check);
                    }
                }
            }
        }
    }

    fn on_envelope(&mut self, ctx: &mut Context, from: &PeerId, envelope: Envelope) {
        trace!("{} from {}", envelope.kind(), from);
        match envelope {
            Envelope::PlayerInfo(info) => self.on_player_info(ctx, from, info),
            Envelope::PlayerMove(update) => self.on_player_move(ctx, from, update),
            Envelope::CanvasUpdate(update) => {
                self.engine.note_canvas_from(from);
                match self.engine.apply_canvas(update.clone()) {
                    CanvasApply::Applied(canvas) => {
                        ctx.cache_canvas(&canvas);
                        ctx.emit(SessionEvent::CanvasChanged {
                            canvas_id: canvas.canvas_id,
                            image: canvas.image,
                        });
                        // Only applied updates travel on; stale ones stop here
                        self.broadcast(&Envelope::CanvasUpdate(update), Some(from));
                    }
                    CanvasApply::Stale => {}
                    CanvasApply::Unknown => {
                        warn!("Dropping update for unknown canvas {} from {}", update.canvas_id, from)
                    }
                }
            }
            Envelope::RequestPeerList(_) => {
                let reply = ctx.discovery.peer_list(&self.registry);
                self.send_to(from, &reply);
            }
            Envelope::PeerList(list) => self.on_peer_list(ctx, &list),
            Envelope::RequestAllCanvasData(request) => {
                let canvases = self.engine.canvas_snapshot();
                debug!(
                    "Sending {} canvases to {} for a full sync",
                    canvases.len(),
                    request.requester_id
                );
                for canvas in canvases {
                    self.send_to(from, &Envelope::CanvasUpdate(canvas));
                }
            }
            Envelope::PlayerLeft(PlayerLeft { id }) => {
                if &id != from {
                    warn!("Dropping PlayerLeft for {} received from {}", id, from);
                    return;
                }
                if let Some(conn_id) = self.registry.connection(from).map(|conn| conn.conn_id()) {
                    info!("{} is leaving", from);
                    self.close_connection(ctx, from, conn_id, CloseKind::Graceful);
                }
            }
        }
    }

    fn on_player_info(&mut self, ctx: &mut Context, from: &PeerId, info: PlayerInfo) {
        match ctx.discovery.admit_player(&info, from, &mut self.registry) {
            PlayerAdmission::Echo | PlayerAdmission::Misattributed => {}
            PlayerAdmission::Admitted { .. } => match self.engine.apply_player_info(info) {
                AvatarApply::Joined(avatar) => ctx.emit(SessionEvent::PeerJoined(avatar)),
                AvatarApply::Updated(avatar) => ctx.emit(SessionEvent::PeerMoved(avatar)),
                AvatarApply::Ignored => {}
            },
        }
    }

    fn on_player_move(&mut self, ctx: &mut Context, from: &PeerId, update: PlayerMove) {
        match self.engine.apply_move(from, update) {
            AvatarApply::Joined(avatar) => ctx.emit(SessionEvent::PeerJoined(avatar)),
            AvatarApply::Updated(avatar) => ctx.emit(SessionEvent::PeerMoved(avatar)),
            AvatarApply::Ignored => {}
        }
    }

    fn on_peer_list(&mut self, ctx: &mut Context, list: &PeerList) {
        let candidates = ctx.discovery.candidates(list, &self.registry);
        if !candidates.is_empty() {
            debug!("Discovered {} new peers", candidates.len());
        }
        for peer in candidates {
            self.connect(ctx, &peer, true);
        }
    }

    /// Say goodbye to every open peer and drop every connection.
    /// Returns the peers that were open.
    fn leave(&mut self, ctx: &Context) -> Vec<PeerId> {
        let open = self.registry.open_peers();
        let goodbye = Envelope::PlayerLeft(PlayerLeft {
            id: self.local().clone(),
        });
        self.broadcast(&goodbye, None);

        for conn in self.registry.drain() {
            conn.link().close();
        }
        for peer in self.engine.clear_remote() {
            ctx.emit(SessionEvent::PeerLeft(peer));
        }
        self.release_endpoint();
        open
    }

    fn snapshot(&self, status: &str) -> SessionSnapshot {
        SessionSnapshot {
            local: Some(self.engine.local().clone()),
            peers: self.engine.avatars(),
            canvases: self.engine.canvases(),
            open_peers: self.registry.open_peers(),
            status: status.to_string(),
        }
    }
}

/// The session actor: owns all state and processes one command or input at a time
pub struct SessionController {
    connector: Arc<dyn Connector>,
    config: SessionConfig,
    ctx: Context,
    session: Option<Session>,
    command_rx: mpsc::UnboundedReceiver<SessionCommand>,
    input_rx: mpsc::UnboundedReceiver<Input>,
}

impl SessionController {
    pub fn new(
        connector: Arc<dyn Connector>,
        cache: Option<CanvasCache>,
        config: SessionConfig,
        command_rx: mpsc::UnboundedReceiver<SessionCommand>,
        event_tx: mpsc::UnboundedSender<SessionEvent>,
    ) -> Self {
        let (input_tx, input_rx) = mpsc::unbounded_channel();
        Self {
            connector,
            ctx: Context {
                events: event_tx,
                inputs: input_tx,
                discovery: Discovery::new(config.bootstrap.clone()),
                cache,
                status: "Not started".to_string(),
                epoch: 0,
            },
            config,
            session: None,
            command_rx,
            input_rx,
        }
    }

    /// Process commands and inputs until shutdown or until every handle is dropped
    pub async fn run(&mut self) -> Result<(), Error> {
        loop {
            tokio::select! {
                command = self.command_rx.recv() => {
                    let Some(command) = command else {
                        debug!("All session handles dropped");
                        break;
                    };
                    if let SessionCommand::Shutdown = command {
                        info!("Received shutdown command, exiting session");
                        break;
                    }
                    self.handle_command(command).await;
                }

                Some(input) = self.input_rx.recv() => {
                    self.handle_input(input);
                }
            }
        }

        self.shutdown();
        Ok(())
    }

    async fn handle_command(&mut self, command: SessionCommand) {
        match command {
            SessionCommand::Start {
                display_name,
                reply,
            } => {
                let result = self.start(display_name).await;
                let _ = reply.send(result);
            }

            SessionCommand::Tick => {
                if let Some(session) = self.session.as_mut() {
                    if let Some(update) = session.engine.poll_broadcast(Instant::now()) {
                        session.broadcast(&Envelope::PlayerMove(update), None);
                    }
                }
            }

            SessionCommand::UpdatePose { position, heading } => {
                if let Some(session) = self.session.as_mut() {
                    session.engine.set_pose(position, heading);
                }
            }

            SessionCommand::RequestDraw { canvas_id, reply } => {
                let result = match self.session.as_mut() {
                    Some(session) => session.engine.begin_edit(&canvas_id),
                    None => Err(not_started()),
                };
                let _ = reply.send(result);
            }

            SessionCommand::CommitDraw {
                canvas_id,
                image,
                reply,
            } => {
                let result = self.commit_draw(&canvas_id, image);
                let _ = reply.send(result);
            }

            SessionCommand::ForceReconnect { reply } => {
                let result = self.force_reconnect().await;
                let _ = reply.send(result);
            }

            SessionCommand::JoinAddress { reply } => {
                let address = self
                    .session
                    .as_ref()
                    .map(|session| join_address(&self.config.join_base_url, &[session.local().clone()]));
                let _ = reply.send(address);
            }

            SessionCommand::Snapshot { reply } => {
                let snapshot = match self.session.as_ref() {
                    Some(session) => session.snapshot(&self.ctx.status),
                    None => SessionSnapshot {
                        status: self.ctx.status.clone(),
                        ..SessionSnapshot::default()
                    },
                };
                let _ = reply.send(snapshot);
            }

            SessionCommand::Shutdown => {
                // Handled in run before we get here
            }
        }
    }

    fn handle_input(&mut self, input: Input) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        let ctx = &mut self.ctx;

        match input {
            Input::Incoming { epoch, link } => {
                if epoch != ctx.epoch {
                    link.handle.close();
                    return;
                }
                session.on_incoming(ctx, link);
            }
            Input::Link {
                peer,
                conn_id,
                event,
            } => session.on_link_event(ctx, peer, conn_id, event),
            Input::ConnectTimeout { peer, conn_id } => {
                session.on_connect_timeout(ctx, &peer, conn_id)
            }
            Input::RetryConnect { peer, epoch } => {
                if epoch != ctx.epoch {
                    return;
                }
                session.registry.clear_retry_timer(&peer);
                session.connect(ctx, &peer, true);
            }
            Input::FullSyncCheck { peer, conn_id } => {
                session.on_full_sync_check(ctx, &peer, conn_id)
            }
        }
    }

    /// Bind an endpoint for `local` and forward its inbound links into the loop.
    /// A failed bind leaves the session running without peers.
    async fn bind(&mut self, local: &PeerId) -> (Option<Box<dyn Dialer>>, Option<JoinHandle<()>>) {
        match self.connector.bind(local.clone()).await {
            Ok(binding) => {
                let inputs = self.ctx.inputs.clone();
                let epoch = self.ctx.epoch;
                let mut incoming = binding.incoming;
                let forward = tokio::spawn(async move {
                    while let Some(link) = incoming.recv().await {
                        if inputs.send(Input::Incoming { epoch, link }).is_err() {
                            break;
                        }
                    }
                });
                self.ctx.set_status(format!("Listening as {}", local));
                (Some(binding.dialer), Some(forward))
            }
            Err(e) => {
                error!("Failed to bind endpoint for {}: {}", local, e);
                self.ctx
                    .set_status(format!("Offline, could not reach the network: {}", e));
                (None, None)
            }
        }
    }

    async fn start(&mut self, display_name: String) -> Result<PeerId, Error> {
        if self.session.is_some() {
            return Err(Error::InvalidState("Session already started".to_string()));
        }

        let local = PeerId::generate();
        let color = AVATAR_PALETTE
            .choose(&mut rand::thread_rng())
            .copied()
            .unwrap_or(AVATAR_PALETTE[0]);
        info!("Starting session as {} ({})", local, display_name);

        let mut engine = StateSyncEngine::new(
            AvatarState::new(local.clone(), display_name, color),
            &CanvasId::layout(self.config.slots_per_wall),
        );
        self.restore_cached(&mut engine);

        let (dialer, incoming) = self.bind(&local).await;
        let mut session = Session {
            dialer,
            incoming,
            registry: PeerRegistry::new(local.clone()),
            engine,
        };
        self.ctx.emit(SessionEvent::SelfReady(local.clone()));

        let bootstrap = self.ctx.discovery.bootstrap().to_vec();
        for peer in &bootstrap {
            session.connect(&mut self.ctx, peer, true);
        }

        self.session = Some(session);
        Ok(local)
    }

    fn restore_cached(&self, engine: &mut StateSyncEngine) {
        let Some(cache) = &self.ctx.cache else {
            return;
        };
        let now = now_millis();
        for canvas in engine.canvases() {
            match cache.load(&canvas.canvas_id, now) {
                Ok(Some(cached)) => {
                    engine.apply_canvas((&cached).into());
                }
                Ok(None) => {}
                Err(e) => warn!("Failed to load cached canvas {}: {}", canvas.canvas_id, e),
            }
        }
    }

    fn commit_draw(&mut self, canvas_id: &CanvasId, image: Vec<u8>) -> Result<(), Error> {
        let session = self.session.as_mut().ok_or_else(not_started)?;
        let (update, outcome) = session.engine.commit_canvas(canvas_id, image, now_millis())?;

        if let CanvasApply::Applied(canvas) = outcome {
            self.ctx.cache_canvas(&canvas);
            self.ctx.emit(SessionEvent::CanvasChanged {
                canvas_id: canvas.canvas_id,
                image: canvas.image,
            });
        }
        session.broadcast(&Envelope::CanvasUpdate(update), None);
        Ok(())
    }

    /// Tear everything down and rejoin under a fresh identity
    async fn force_reconnect(&mut self) -> Result<PeerId, Error> {
        let mut session = self.session.take().ok_or_else(not_started)?;
        info!("Forcing reconnect, leaving as {}", session.local());

        let previously_open = session.leave(&self.ctx);
        self.ctx.epoch += 1;

        let local = PeerId::generate();
        session.registry.reset(local.clone());
        session.engine.set_local_id(local.clone());

        let (dialer, incoming) = self.bind(&local).await;
        session.dialer = dialer;
        session.incoming = incoming;
        self.ctx.emit(SessionEvent::SelfReady(local.clone()));

        let mut seen = HashSet::new();
        let seeds: Vec<PeerId> = self
            .ctx
            .discovery
            .bootstrap()
            .iter()
            .chain(previously_open.iter())
            .filter(|peer| seen.insert((*peer).clone()))
            .cloned()
            .collect();
        for peer in &seeds {
            session.connect(&mut self.ctx, peer, true);
        }

        self.session = Some(session);
        Ok(local)
    }

    fn shutdown(&mut self) {
        if let Some(mut session) = self.session.take() {
            session.leave(&self.ctx);
        }
        self.ctx.status = "Stopped".to_string();
    }
}

fn not_started() -> Error {
    Error::InvalidState("Session not started".to_string())
}
