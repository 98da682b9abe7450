use std::{
    collections::VecDeque,
    fmt,
    sync::{Arc, Mutex as StdMutex, MutexGuard, PoisonError, Weak},
};

use async_trait::async_trait;
use rtc_integration::{
    CameraFacing, IceCandidate, MediaConstraints, MediaDevices, MediaStream, MediaTrack,
    PeerConnection, PeerConnectionFactory, PeerConnectionState, PeerEvent, RtcConfiguration,
    SessionDescription, TrackKind,
};
use shared::{
    domain::{CallId, UserId},
    protocol::CallSignal,
};
use tokio::{
    sync::{broadcast, mpsc, Mutex},
    task::JoinHandle,
};
use tracing::{debug, info, warn};

use crate::{chat::ChatApi, error::CallError, error::InvokeError, handlers::Subscription};

const CALL_EVENT_CAPACITY: usize = 64;
const MAX_EARLY_CANDIDATES: usize = 32;

/// Outbound side channel for call signals.
#[async_trait]
pub trait CallSignaling: Send + Sync {
    async fn send_signal(&self, to: &UserId, signal: CallSignal) -> Result<(), InvokeError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallState {
    Idle,
    Offering,
    Answering,
    DescriptionExchanged,
    Connected,
    Ended,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallRole {
    Caller,
    Callee,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EndReason {
    LocalHangup,
    RemoteHangup,
    PeerFailed,
    PeerClosed,
    Backgrounded,
    Error(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallEvent {
    StateChanged(CallState),
    RemoteTrackAdded { track_id: String, kind: TrackKind },
    Ended(EndReason),
}

/// Platform seams and configuration every call needs.
#[derive(Clone)]
pub struct CallDependencies {
    pub peers: Arc<dyn PeerConnectionFactory>,
    pub media: Arc<dyn MediaDevices>,
    pub signaling: Arc<dyn CallSignaling>,
    pub rtc: RtcConfiguration,
}

struct CallInner {
    state: CallState,
    peer: Option<Arc<dyn PeerConnection>>,
    local_stream: Option<MediaStream>,
    remote_stream: Option<MediaStream>,
    pending_candidates: VecDeque<IceCandidate>,
    remote_description_set: bool,
    muted: bool,
    video_enabled: bool,
    facing: CameraFacing,
    peer_events: Option<JoinHandle<()>>,
}

/// One-to-one call driven over hub signaling.
pub struct CallSession {
    call_id: CallId,
    peer_user: UserId,
    role: CallRole,
    video: bool,
    deps: CallDependencies,
    inner: Mutex<CallInner>,
    events: broadcast::Sender<CallEvent>,
}

impl fmt::Debug for CallSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallSession")
            .field("call_id", &self.call_id)
            .field("peer_user", &self.peer_user)
            .field("role", &self.role)
            .field("video", &self.video)
            .finish_non_exhaustive()
    }
}

impl CallSession {
    pub fn outgoing(deps: CallDependencies, to: UserId, video: bool) -> Arc<Self> {
        Self::build(deps, CallId::generate(), to, CallRole::Caller, video)
    }

    pub fn incoming(deps: CallDependencies, from: UserId, call_id: CallId, video: bool) -> Arc<Self> {
        Self::build(deps, call_id, from, CallRole::Callee, video)
    }

    fn build(
        deps: CallDependencies,
        call_id: CallId,
        peer_user: UserId,
        role: CallRole,
        video: bool,
    ) -> Arc<Self> {
        let (events, _) = broadcast::channel(CALL_EVENT_CAPACITY);
        Arc::new(Self {
            call_id,
            peer_user,
            role,
            video,
            deps,
            inner: Mutex::new(CallInner {
                state: CallState::Idle,
                peer: None,
                local_stream: None,
                remote_stream: None,
                pending_candidates: VecDeque::new(),
                remote_description_set: false,
                muted: false,
                video_enabled: video,
                facing: CameraFacing::Front,
                peer_events: None,
            }),
            events,
        })
    }

    pub fn call_id(&self) -> &CallId {
        &self.call_id
    }

    pub fn peer_user(&self) -> &UserId {
        &self.peer_user
    }

    pub fn role(&self) -> CallRole {
        self.role
    }

    pub fn is_video(&self) -> bool {
        self.video
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<CallEvent> {
        self.events.subscribe()
    }

    pub async fn state(&self) -> CallState {
        self.inner.lock().await.state
    }

    pub async fn is_muted(&self) -> bool {
        self.inner.lock().await.muted
    }

    pub async fn pending_candidate_count(&self) -> usize {
        self.inner.lock().await.pending_candidates.len()
    }

    pub async fn remote_track_ids(&self) -> Vec<String> {
        self.inner
            .lock()
            .await
            .remote_stream
            .as_ref()
            .map(|stream| stream.tracks().iter().map(|t| t.id().to_string()).collect())
            .unwrap_or_default()
    }

    /// Caller path: media, peer, offer, then wait for the answer signal.
    pub async fn start(self: &Arc<Self>) -> Result<(), CallError> {
        let sdp = {
            let mut inner = self.inner.lock().await;
            if inner.state != CallState::Idle || self.role != CallRole::Caller {
                return Err(CallError::InvalidState {
                    operation: "start call",
                    state: inner.state,
                });
            }
            self.set_state(&mut inner, CallState::Offering);
            match self.run_caller(&mut inner).await {
                Ok(sdp) => sdp,
                Err(err) => {
                    warn!(call_id = %self.call_id, "call: failed to place call: {err}");
                    self.teardown(&mut inner, EndReason::Error(err.to_string()));
                    return Err(err);
                }
            }
        };
        // Unlocked: hang_up must not wait on the hub round trip.
        let offer = CallSignal::Offer {
            call_id: self.call_id.clone(),
            sdp,
            video: self.video,
        };
        self.send_or_end(offer, "place call").await?;
        info!(call_id = %self.call_id, to = %self.peer_user, "call: offer sent");
        Ok(())
    }

    async fn run_caller(self: &Arc<Self>, inner: &mut CallInner) -> Result<String, CallError> {
        let peer = self.prepare_peer(inner).await?;
        let offer = peer.create_offer().await.map_err(peer_error("create offer"))?;
        peer.set_local_description(offer.clone())
            .await
            .map_err(peer_error("set local description"))?;
        Ok(offer.sdp)
    }

    /// Callee path for an inbound offer.
    pub async fn accept(self: &Arc<Self>, offer_sdp: String) -> Result<(), CallError> {
        let sdp = {
            let mut inner = self.inner.lock().await;
            if inner.state != CallState::Idle || self.role != CallRole::Callee {
                return Err(CallError::InvalidState {
                    operation: "accept call",
                    state: inner.state,
                });
            }
            self.set_state(&mut inner, CallState::Answering);
            match self.run_callee(&mut inner, offer_sdp).await {
                Ok(sdp) => sdp,
                Err(err) => {
                    warn!(call_id = %self.call_id, "call: failed to answer call: {err}");
                    self.teardown(&mut inner, EndReason::Error(err.to_string()));
                    return Err(err);
                }
            }
        };
        let answer = CallSignal::Answer {
            call_id: self.call_id.clone(),
            sdp,
        };
        self.send_or_end(answer, "answer call").await?;
        info!(call_id = %self.call_id, to = %self.peer_user, "call: answer sent");
        Ok(())
    }

    async fn run_callee(
        self: &Arc<Self>,
        inner: &mut CallInner,
        offer_sdp: String,
    ) -> Result<String, CallError> {
        let peer = self.prepare_peer(inner).await?;
        peer.set_remote_description(SessionDescription::offer(offer_sdp))
            .await
            .map_err(peer_error("set remote description"))?;
        inner.remote_description_set = true;
        self.set_state(inner, CallState::DescriptionExchanged);
        self.flush_if_ready(inner).await;

        let answer = peer.create_answer().await.map_err(peer_error("create answer"))?;
        peer.set_local_description(answer.clone())
            .await
            .map_err(peer_error("set local description"))?;
        Ok(answer.sdp)
    }

    /// Ends the call when the description cannot be delivered.
    async fn send_or_end(&self, signal: CallSignal, operation: &str) -> Result<(), CallError> {
        let Err(err) = self.deps.signaling.send_signal(&self.peer_user, signal).await else {
            return Ok(());
        };
        let err = CallError::from(err);
        warn!(call_id = %self.call_id, "call: failed to {operation}: {err}");
        let mut inner = self.inner.lock().await;
        self.teardown(&mut inner, EndReason::Error(err.to_string()));
        Err(err)
    }

    /// Acquires local media, creates the peer connection and attaches tracks.
    async fn prepare_peer(
        self: &Arc<Self>,
        inner: &mut CallInner,
    ) -> Result<Arc<dyn PeerConnection>, CallError> {
        let constraints = if self.video {
            MediaConstraints::video()
        } else {
            MediaConstraints::voice()
        };
        let local = self.deps.media.get_user_media(constraints).await?;
        // Stored first so teardown releases the devices if anything below fails.
        inner.local_stream = Some(local.clone());

        let peer = self
            .deps
            .peers
            .create(self.deps.rtc.clone())
            .await
            .map_err(peer_error("create peer connection"))?;
        inner.peer = Some(Arc::clone(&peer));
        inner.peer_events = Some(tokio::spawn(pump_peer_events(
            Arc::downgrade(self),
            peer.subscribe_events(),
        )));

        for track in local.tracks() {
            peer.add_track(Arc::clone(track))
                .map_err(peer_error("add local track"))?;
        }
        Ok(peer)
    }

    /// Routes one inbound signal for this call.
    pub async fn handle_signal(self: &Arc<Self>, signal: CallSignal) -> Result<(), CallError> {
        if signal.call_id() != &self.call_id {
            debug!(call_id = %signal.call_id(), "call: ignoring signal for another call");
            return Ok(());
        }
        match signal {
            CallSignal::Offer { sdp, .. } => self.accept(sdp).await,
            CallSignal::Answer { sdp, .. } => self.apply_answer(sdp).await,
            CallSignal::IceCandidate {
                candidate,
                sdp_mid,
                sdp_m_line_index,
                ..
            } => {
                self.add_remote_candidate(IceCandidate {
                    candidate,
                    sdp_mid,
                    sdp_m_line_index,
                })
                .await;
                Ok(())
            }
            CallSignal::Hangup { .. } => {
                self.end(EndReason::RemoteHangup).await;
                Ok(())
            }
        }
    }

    async fn apply_answer(&self, sdp: String) -> Result<(), CallError> {
        let mut inner = self.inner.lock().await;
        if inner.state != CallState::Offering {
            return Err(CallError::InvalidState {
                operation: "apply answer",
                state: inner.state,
            });
        }
        let Some(peer) = inner.peer.clone() else {
            return Err(CallError::InvalidState {
                operation: "apply answer",
                state: inner.state,
            });
        };
        if let Err(err) = peer.set_remote_description(SessionDescription::answer(sdp)).await {
            let err = peer_error("set remote description")(err);
            self.teardown(&mut inner, EndReason::Error(err.to_string()));
            return Err(err);
        }
        inner.remote_description_set = true;
        self.set_state(&mut inner, CallState::DescriptionExchanged);
        self.flush_if_ready(&mut inner).await;
        Ok(())
    }

    /// Queues the candidate, then applies the queue if a remote description exists.
    pub async fn add_remote_candidate(&self, candidate: IceCandidate) {
        let mut inner = self.inner.lock().await;
        if inner.state == CallState::Ended {
            debug!(call_id = %self.call_id, "call: dropping candidate for ended call");
            return;
        }
        inner.pending_candidates.push_back(candidate);
        self.flush_if_ready(&mut inner).await;
    }

    async fn flush_if_ready(&self, inner: &mut CallInner) {
        if !inner.remote_description_set {
            return;
        }
        let Some(peer) = inner.peer.clone() else {
            return;
        };
        while let Some(candidate) = inner.pending_candidates.pop_front() {
            if let Err(err) = peer.add_ice_candidate(candidate).await {
                warn!(call_id = %self.call_id, "call: skipping rejected candidate: {err:#}");
            }
        }
    }

    pub async fn toggle_mute(&self) -> Result<bool, CallError> {
        let mut inner = self.inner.lock().await;
        let muted = !inner.muted;
        let Some(local) = inner.local_stream.as_ref() else {
            return Err(CallError::InvalidState {
                operation: "toggle mute",
                state: inner.state,
            });
        };
        for track in local.tracks_of(TrackKind::Audio) {
            track.set_enabled(!muted);
        }
        inner.muted = muted;
        Ok(muted)
    }

    pub async fn set_video_enabled(&self, enabled: bool) -> Result<(), CallError> {
        let mut inner = self.inner.lock().await;
        let Some(local) = inner.local_stream.as_ref() else {
            return Err(CallError::InvalidState {
                operation: "toggle video",
                state: inner.state,
            });
        };
        for track in local.tracks_of(TrackKind::Video) {
            track.set_enabled(enabled);
        }
        inner.video_enabled = enabled;
        Ok(())
    }

    pub async fn switch_camera(&self) -> Result<CameraFacing, CallError> {
        let mut inner = self.inner.lock().await;
        let track = inner
            .local_stream
            .as_ref()
            .and_then(|local| local.tracks_of(TrackKind::Video).next().cloned());
        let Some(track) = track else {
            return Err(CallError::InvalidState {
                operation: "switch camera",
                state: inner.state,
            });
        };
        let facing = inner.facing.flipped();
        self.deps.media.switch_camera(&track, facing).await?;
        inner.facing = facing;
        Ok(facing)
    }

    /// Local hang-up: tears down and tells the other side.
    pub async fn hang_up(&self) {
        self.hang_up_with(EndReason::LocalHangup).await;
    }

    /// The app moving to the background ends the call.
    pub async fn on_app_background(&self) {
        self.hang_up_with(EndReason::Backgrounded).await;
    }

    async fn hang_up_with(&self, reason: EndReason) {
        let was_active = {
            let mut inner = self.inner.lock().await;
            let was_active = inner.state != CallState::Ended;
            self.teardown(&mut inner, reason);
            was_active
        };
        if !was_active {
            return;
        }
        let hangup = CallSignal::Hangup {
            call_id: self.call_id.clone(),
        };
        if let Err(err) = self.deps.signaling.send_signal(&self.peer_user, hangup).await {
            warn!(call_id = %self.call_id, "call: failed to send hangup: {err}");
        }
    }

    async fn end(&self, reason: EndReason) {
        let mut inner = self.inner.lock().await;
        self.teardown(&mut inner, reason);
    }

    async fn on_peer_event(&self, event: PeerEvent) {
        match event {
            PeerEvent::LocalIceCandidate(candidate) => {
                let signal = CallSignal::IceCandidate {
                    call_id: self.call_id.clone(),
                    candidate: candidate.candidate,
                    sdp_mid: candidate.sdp_mid,
                    sdp_m_line_index: candidate.sdp_m_line_index,
                };
                if let Err(err) = self.deps.signaling.send_signal(&self.peer_user, signal).await {
                    warn!(call_id = %self.call_id, "call: failed to send local candidate: {err}");
                }
            }
            PeerEvent::RemoteTrack(track) => {
                let mut inner = self.inner.lock().await;
                if inner.state == CallState::Ended {
                    track.stop();
                    return;
                }
                let (track_id, kind) = (track.id().to_string(), track.kind());
                let stream = inner.remote_stream.get_or_insert_with(MediaStream::default);
                if stream.add_track(Arc::clone(&track)) {
                    let _ = self
                        .events
                        .send(CallEvent::RemoteTrackAdded { track_id, kind });
                } else if !stream.tracks().iter().any(|kept| same_track(kept, &track)) {
                    debug!(
                        call_id = %self.call_id,
                        track_id = %track_id,
                        "call: stopping duplicate remote track"
                    );
                    track.stop();
                }
            }
            PeerEvent::StateChanged(PeerConnectionState::Connected) => {
                let mut inner = self.inner.lock().await;
                if inner.state == CallState::DescriptionExchanged {
                    self.set_state(&mut inner, CallState::Connected);
                } else {
                    debug!(call_id = %self.call_id, state = ?inner.state, "call: early peer connected");
                }
            }
            PeerEvent::StateChanged(PeerConnectionState::Failed) => {
                self.end(EndReason::PeerFailed).await
            }
            PeerEvent::StateChanged(PeerConnectionState::Closed) => {
                self.end(EndReason::PeerClosed).await
            }
            PeerEvent::StateChanged(state) => {
                debug!(call_id = %self.call_id, ?state, "call: peer state");
            }
        }
    }

    fn set_state(&self, inner: &mut CallInner, state: CallState) {
        if inner.state == state {
            return;
        }
        debug!(call_id = %self.call_id, from = ?inner.state, to = ?state, "call: state changed");
        inner.state = state;
        let _ = self.events.send(CallEvent::StateChanged(state));
    }

    /// Releases media, closes the peer and drops queued candidates. Idempotent.
    fn teardown(&self, inner: &mut CallInner, reason: EndReason) {
        if inner.state == CallState::Ended {
            return;
        }
        info!(call_id = %self.call_id, ?reason, "call: ended");
        release(inner);
        self.set_state(inner, CallState::Ended);
        let _ = self.events.send(CallEvent::Ended(reason));
    }
}

impl Drop for CallSession {
    fn drop(&mut self) {
        release(self.inner.get_mut());
    }
}

fn same_track(a: &Arc<dyn MediaTrack>, b: &Arc<dyn MediaTrack>) -> bool {
    Arc::as_ptr(a).cast::<()>() == Arc::as_ptr(b).cast::<()>()
}

fn release(inner: &mut CallInner) {
    if let Some(task) = inner.peer_events.take() {
        task.abort();
    }
    if let Some(local) = inner.local_stream.take() {
        local.stop_all();
    }
    if let Some(remote) = inner.remote_stream.take() {
        remote.stop_all();
    }
    if let Some(peer) = inner.peer.take() {
        peer.close();
    }
    inner.pending_candidates.clear();
    inner.remote_description_set = false;
}

fn peer_error(operation: &'static str) -> impl Fn(anyhow::Error) -> CallError {
    move |err| CallError::Peer(format!("{operation}: {err:#}"))
}

async fn pump_peer_events(call: Weak<CallSession>, mut events: broadcast::Receiver<PeerEvent>) {
    loop {
        match events.recv().await {
            Ok(event) => {
                let Some(call) = call.upgrade() else {
                    return;
                };
                call.on_peer_event(event).await;
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(skipped, "call: peer event pump lagged");
            }
            Err(broadcast::error::RecvError::Closed) => return,
        }
    }
}

/// Keeps at most one call alive and routes inbound signals to it in order.
pub struct CallController {
    deps: CallDependencies,
    current: StdMutex<Option<Arc<CallSession>>>,
    /// Candidates that overtook their offer on the hub.
    early_candidates: StdMutex<VecDeque<(UserId, CallSignal)>>,
    incoming: broadcast::Sender<Arc<CallSession>>,
}

impl CallController {
    pub fn new(deps: CallDependencies) -> Arc<Self> {
        let (incoming, _) = broadcast::channel(8);
        Arc::new(Self {
            deps,
            current: StdMutex::new(None),
            early_candidates: StdMutex::new(VecDeque::new()),
            incoming,
        })
    }

    /// Newly created callee sessions, announced before the offer is answered.
    pub fn subscribe_incoming(&self) -> broadcast::Receiver<Arc<CallSession>> {
        self.incoming.subscribe()
    }

    pub fn current(&self) -> Option<Arc<CallSession>> {
        lock(&self.current).clone()
    }

    pub async fn place_call(&self, to: UserId, video: bool) -> Result<Arc<CallSession>, CallError> {
        if let Some(active) = self.active_call().await {
            return Err(CallError::InvalidState {
                operation: "place call",
                state: active.state().await,
            });
        }
        let call = CallSession::outgoing(self.deps.clone(), to, video);
        *lock(&self.current) = Some(Arc::clone(&call));
        call.start().await?;
        Ok(call)
    }

    pub async fn handle_signal(&self, from: UserId, signal: CallSignal) {
        let call = match self.active_call().await {
            Some(call) if call.call_id() == signal.call_id() => {
                if call.peer_user() != &from {
                    warn!(from = %from, "call: signal from unexpected user ignored");
                    return;
                }
                call
            }
            Some(_) => {
                if let CallSignal::Offer { call_id, .. } = &signal {
                    info!(from = %from, "call: busy, rejecting incoming call");
                    let busy = CallSignal::Hangup {
                        call_id: call_id.clone(),
                    };
                    if let Err(err) = self.deps.signaling.send_signal(&from, busy).await {
                        warn!("call: failed to reject incoming call: {err}");
                    }
                }
                return;
            }
            None => match &signal {
                CallSignal::Offer { call_id, video, .. } => {
                    let call = CallSession::incoming(
                        self.deps.clone(),
                        from.clone(),
                        call_id.clone(),
                        *video,
                    );
                    *lock(&self.current) = Some(Arc::clone(&call));
                    let _ = self.incoming.send(Arc::clone(&call));
                    for early in self.take_early_candidates(&from, call_id) {
                        if let Err(err) = call.handle_signal(early).await {
                            warn!(call_id = %call_id, "call: early candidate failed: {err}");
                        }
                    }
                    call
                }
                CallSignal::IceCandidate { .. } => {
                    self.hold_early_candidate(from, signal.clone());
                    return;
                }
                _ => {
                    debug!(call_id = %signal.call_id(), "call: signal without an active call");
                    return;
                }
            },
        };
        if let Err(err) = call.handle_signal(signal).await {
            warn!(call_id = %call.call_id(), "call: signal handling failed: {err}");
        }
    }

    pub async fn hang_up(&self) {
        let call = lock(&self.current).take();
        if let Some(call) = call {
            call.hang_up().await;
        }
    }

    pub async fn on_app_background(&self) {
        let call = lock(&self.current).take();
        if let Some(call) = call {
            call.on_app_background().await;
        }
    }

    /// Subscribes to inbound call signals on `chat`; signals are handled one
    /// at a time in arrival order.
    pub fn attach(self: &Arc<Self>, chat: &ChatApi) -> CallRouting {
        let (tx, mut rx) = mpsc::unbounded_channel::<(UserId, CallSignal)>();
        let subscription = chat.on_call_signal(move |from, signal| {
            let _ = tx.send((from, signal));
        });
        let controller = Arc::downgrade(self);
        let worker = tokio::spawn(async move {
            while let Some((from, signal)) = rx.recv().await {
                let Some(controller) = controller.upgrade() else {
                    return;
                };
                controller.handle_signal(from, signal).await;
            }
        });
        CallRouting {
            _subscription: subscription,
            worker,
        }
    }

    fn hold_early_candidate(&self, from: UserId, signal: CallSignal) {
        let mut early = lock(&self.early_candidates);
        if early.len() == MAX_EARLY_CANDIDATES {
            early.pop_front();
        }
        early.push_back((from, signal));
    }

    fn take_early_candidates(&self, from: &UserId, call_id: &CallId) -> Vec<CallSignal> {
        let mut early = lock(&self.early_candidates);
        let (matching, rest): (VecDeque<_>, VecDeque<_>) = early
            .drain(..)
            .partition(|(sender, signal)| sender == from && signal.call_id() == call_id);
        *early = rest;
        matching.into_iter().map(|(_, signal)| signal).collect()
    }

    async fn active_call(&self) -> Option<Arc<CallSession>> {
        let call = self.current()?;
        if call.state().await == CallState::Ended {
            let mut current = lock(&self.current);
            if current
                .as_ref()
                .is_some_and(|c| Arc::ptr_eq(c, &call))
            {
                *current = None;
            }
            return None;
        }
        Some(call)
    }
}

/// Inbound signal routing installed by [`CallController::attach`].
pub struct CallRouting {
    _subscription: Subscription,
    worker: JoinHandle<()>,
}

impl Drop for CallRouting {
    fn drop(&mut self) {
        self.worker.abort();
    }
}

fn lock<T>(mutex: &StdMutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
#[path = "tests/call_tests.rs"]
mod tests;
