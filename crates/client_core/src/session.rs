use std::{
    collections::BTreeSet,
    sync::{Arc, Weak},
    time::Duration,
};

use serde::de::DeserializeOwned;
use serde_json::Value;
use shared::{
    domain::{ConversationId, UserId},
    protocol::methods,
};
use tokio::{
    sync::{broadcast, watch, Mutex},
    task::JoinHandle,
};
use tracing::{debug, error, info, warn};
use url::Url;

use crate::{
    auth::Credentials,
    config::Settings,
    error::{ConfigurationError, ConnectError, InvokeError, TransportError},
    handlers::{HandlerRegistry, Subscription},
    heartbeat::spawn_heartbeat,
    reconnect::ReconnectPolicy,
    transport::{
        negotiate, plan_attempts, ConnectRequest, HubClient, HubConnection, HubConnector,
        HubEndpoint, InboundInvocation, Platform, TransportKind,
    },
};

const SESSION_EVENT_CAPACITY: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    /// Terminal until the next explicit `connect`.
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    StateChanged(ConnectionState),
    ReconnectScheduled { attempt: u32, delay: Duration },
    Connected { transport: TransportKind, url: Url },
    Fatal(ConfigurationError),
}

#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub endpoint: HubEndpoint,
    pub platform: Platform,
    pub reconnect: ReconnectPolicy,
    pub heartbeat_interval: Duration,
    pub heartbeat_method: String,
    /// Registers the user with `AddUser` after every (re)connect.
    pub announce_user: bool,
}

impl From<&Settings> for SessionSettings {
    fn from(settings: &Settings) -> Self {
        Self {
            endpoint: HubEndpoint::new(
                settings.hub_base_url.clone(),
                settings.hub_path.clone(),
                settings.alternate_hub_paths.clone(),
            ),
            platform: settings.platform,
            reconnect: settings.reconnect_policy(),
            heartbeat_interval: settings.heartbeat_interval(),
            heartbeat_method: settings.heartbeat_method.clone(),
            announce_user: true,
        }
    }
}

struct ActiveConnection {
    connection: Arc<dyn HubConnection>,
    generation: u64,
    pump: JoinHandle<()>,
}

#[derive(Default)]
struct SessionInner {
    credentials: Option<Credentials>,
    active: Option<ActiveConnection>,
    connecting: bool,
    /// Bumped by `disconnect` and fresh `connect`; stale attempts compare against it.
    epoch: u64,
    next_generation: u64,
    reconnect_attempts: u32,
    heartbeat: Option<JoinHandle<()>>,
    reconnect: Option<JoinHandle<()>>,
    conversations: BTreeSet<ConversationId>,
}

/// Owns the single hub connection of a signed-in user: negotiation,
/// reconnection with backoff, heartbeat and inbound event dispatch.
pub struct HubSession {
    settings: SessionSettings,
    connector: Arc<dyn HubConnector>,
    handlers: HandlerRegistry,
    state: watch::Sender<ConnectionState>,
    events: broadcast::Sender<SessionEvent>,
    inner: Mutex<SessionInner>,
}

impl HubSession {
    pub fn new(settings: SessionSettings, connector: Arc<dyn HubConnector>) -> Arc<Self> {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        let (events, _) = broadcast::channel(SESSION_EVENT_CAPACITY);
        Arc::new(Self {
            settings,
            connector,
            handlers: HandlerRegistry::new(),
            state,
            events,
            inner: Mutex::new(SessionInner::default()),
        })
    }

    /// Session over the real WebSocket / long-polling transports.
    pub fn from_settings(settings: &Settings) -> Arc<Self> {
        Self::new(
            SessionSettings::from(settings),
            Arc::new(HubClient::new(settings.invoke_timeout())),
        )
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    pub fn settings(&self) -> &SessionSettings {
        &self.settings
    }

    pub async fn reconnect_attempts(&self) -> u32 {
        self.inner.lock().await.reconnect_attempts
    }

    pub async fn user_id(&self) -> Option<UserId> {
        self.inner
            .lock()
            .await
            .credentials
            .as_ref()
            .map(|c| c.user_id.clone())
    }

    /// Registers a handler for an inbound hub event. Handlers live on the
    /// session and keep working across reconnects.
    pub fn on<F>(&self, event: &str, handler: F) -> Subscription
    where
        F: Fn(&[Value]) + Send + Sync + 'static,
    {
        self.handlers.register(event, Arc::new(handler))
    }

    pub fn handlers(&self) -> &HandlerRegistry {
        &self.handlers
    }

    /// Starts the hub connection. A no-op while connected or while another
    /// attempt is in flight.
    pub async fn connect(
        self: &Arc<Self>,
        user_id: UserId,
        access_token: impl Into<String>,
    ) -> Result<(), ConnectError> {
        let access_token = access_token.into();
        if user_id.as_str().trim().is_empty() || access_token.trim().is_empty() {
            return Err(ConfigurationError::MissingCredentials.into());
        }

        let (epoch, requests) = {
            let mut inner = self.inner.lock().await;
            if inner.connecting {
                debug!("hub: connect ignored, attempt already in flight");
                return Ok(());
            }
            if inner.active.is_some() && self.state() == ConnectionState::Connected {
                debug!("hub: connect ignored, already connected");
                return Ok(());
            }
            if let Some(pending) = inner.reconnect.take() {
                pending.abort();
            }
            inner.epoch += 1;
            inner.reconnect_attempts = 0;
            inner.credentials = Some(Credentials {
                user_id: user_id.clone(),
                access_token: access_token.clone(),
            });

            let requests = match plan_attempts(
                &self.settings.endpoint,
                self.settings.platform,
                &user_id,
                &access_token,
            ) {
                Ok(requests) => requests,
                Err(err) => {
                    error!("hub: invalid endpoint configuration: {err}");
                    self.set_state(ConnectionState::Failed);
                    let _ = self.events.send(SessionEvent::Fatal(err.clone()));
                    return Err(err.into());
                }
            };
            inner.connecting = true;
            self.set_state(ConnectionState::Connecting);
            (inner.epoch, requests)
        };

        // Detached, so a dropped caller cannot strand the `connecting` flag.
        let attempt = tokio::spawn(Arc::clone(self).finish_connect(epoch, requests));
        attempt.await.unwrap_or_else(|err| {
            error!("hub: connect attempt aborted: {err}");
            Err(ConnectError::Cancelled)
        })
    }

    async fn finish_connect(
        self: Arc<Self>,
        epoch: u64,
        requests: Vec<ConnectRequest>,
    ) -> Result<(), ConnectError> {
        let outcome = negotiate(self.connector.as_ref(), &requests).await;

        let mut inner = self.inner.lock().await;
        if inner.epoch != epoch {
            drop(inner);
            if let Ok((connection, _)) = outcome {
                connection.close().await;
            }
            debug!("hub: connect attempt superseded");
            return Err(ConnectError::Cancelled);
        }
        inner.connecting = false;

        match outcome {
            Ok((connection, request)) => {
                self.install(&mut inner, connection, &request);
                drop(inner);
                self.after_connect().await;
                Ok(())
            }
            Err(err) if err.is_fatal() => {
                self.fail_fatally(&err);
                Err(ConnectError::from_transport(err))
            }
            Err(err) => {
                warn!(state = ?self.state(), "hub: connect failed: {err}");
                self.set_state(ConnectionState::Disconnected);
                self.schedule_reconnect(&mut inner);
                Err(ConnectError::Transport(err))
            }
        }
    }

    /// Stops everything: pending reconnect, heartbeat, pump and transport.
    pub async fn disconnect(&self) {
        let released = {
            let mut inner = self.inner.lock().await;
            inner.epoch += 1;
            inner.connecting = false;
            inner.reconnect_attempts = 0;
            if let Some(pending) = inner.reconnect.take() {
                pending.abort();
            }
            if let Some(heartbeat) = inner.heartbeat.take() {
                heartbeat.abort();
            }
            let released = inner.active.take().map(|active| {
                active.pump.abort();
                active.connection
            });
            self.set_state(ConnectionState::Disconnected);
            released
        };
        if let Some(connection) = released {
            connection.close().await;
            info!("hub: disconnected");
        }
    }

    /// Invokes a hub method. Rejected without any network traffic unless the
    /// session is connected.
    pub async fn invoke(&self, method: &str, arguments: Vec<Value>) -> Result<Value, InvokeError> {
        let connection = {
            let inner = self.inner.lock().await;
            let state = self.state();
            match (&inner.active, state) {
                (Some(active), ConnectionState::Connected) => Arc::clone(&active.connection),
                _ => {
                    warn!(method, ?state, "hub: invoke while not connected");
                    return Err(InvokeError::NotConnected {
                        method: method.to_string(),
                        state,
                    });
                }
            }
        };
        connection.invoke(method, arguments).await.inspect_err(|err| {
            warn!(method, state = ?self.state(), "hub: invoke failed: {err}");
        })
    }

    pub async fn invoke_as<T: DeserializeOwned>(
        &self,
        method: &str,
        arguments: Vec<Value>,
    ) -> Result<T, InvokeError> {
        let value = self.invoke(method, arguments).await?;
        serde_json::from_value(value).map_err(|err| InvokeError::Codec {
            method: method.to_string(),
            reason: err.to_string(),
        })
    }

    /// Conversations recorded here are rejoined after every reconnect.
    pub(crate) async fn track_conversation(&self, conversation_id: &ConversationId, joined: bool) {
        let mut inner = self.inner.lock().await;
        if joined {
            inner.conversations.insert(conversation_id.clone());
        } else {
            inner.conversations.remove(conversation_id);
        }
    }

    pub async fn joined_conversations(&self) -> Vec<ConversationId> {
        self.inner
            .lock()
            .await
            .conversations
            .iter()
            .cloned()
            .collect()
    }

    fn set_state(&self, next: ConnectionState) {
        let mut previous = next;
        let changed = self.state.send_if_modified(|state| {
            previous = *state;
            if *state == next {
                false
            } else {
                *state = next;
                true
            }
        });
        if changed {
            info!(from = ?previous, to = ?next, "hub: state changed");
            let _ = self.events.send(SessionEvent::StateChanged(next));
        }
    }

    fn fail_fatally(&self, err: &TransportError) {
        let reason = match ConnectError::from_transport(err.clone()) {
            ConnectError::Configuration(config) => config,
            _ => ConfigurationError::InvalidHubUrl {
                url: String::new(),
                reason: err.to_string(),
            },
        };
        error!("hub: giving up, {reason}");
        self.set_state(ConnectionState::Failed);
        let _ = self.events.send(SessionEvent::Fatal(reason));
    }

    fn install(
        self: &Arc<Self>,
        inner: &mut SessionInner,
        connection: Arc<dyn HubConnection>,
        request: &ConnectRequest,
    ) {
        inner.next_generation += 1;
        let generation = inner.next_generation;
        inner.reconnect_attempts = 0;

        let pump = tokio::spawn(pump_events(
            Arc::downgrade(self),
            Arc::clone(&connection),
            connection.subscribe(),
            generation,
        ));
        if let Some(previous) = inner.active.replace(ActiveConnection {
            connection,
            generation,
            pump,
        }) {
            previous.pump.abort();
            tokio::spawn(async move { previous.connection.close().await });
        }

        if let Some(heartbeat) = inner.heartbeat.take() {
            heartbeat.abort();
        }
        inner.heartbeat = self.start_heartbeat(generation);

        self.set_state(ConnectionState::Connected);
        let _ = self.events.send(SessionEvent::Connected {
            transport: request.transport,
            url: request.url.clone(),
        });
    }

    fn start_heartbeat(self: &Arc<Self>, generation: u64) -> Option<JoinHandle<()>> {
        if self.settings.heartbeat_interval.is_zero() {
            debug!("hub: heartbeat disabled");
            return None;
        }
        let probe_session = Arc::downgrade(self);
        let failed_session = Arc::downgrade(self);
        let method = self.settings.heartbeat_method.clone();
        Some(spawn_heartbeat(
            self.settings.heartbeat_interval,
            move || {
                let session = probe_session.clone();
                let method = method.clone();
                async move {
                    let Some(session) = session.upgrade() else {
                        return Ok(());
                    };
                    let connection = session.connection_for(generation).await;
                    match connection {
                        Some(connection) => connection.invoke(&method, Vec::new()).await.map(|_| ()),
                        None => Ok(()),
                    }
                }
            },
            move |err| async move {
                if let Some(session) = failed_session.upgrade() {
                    session.heartbeat_failed(generation, err).await;
                }
            },
        ))
    }

    async fn connection_for(&self, generation: u64) -> Option<Arc<dyn HubConnection>> {
        let inner = self.inner.lock().await;
        inner
            .active
            .as_ref()
            .filter(|active| active.generation == generation)
            .map(|active| Arc::clone(&active.connection))
    }

    /// Runs inside the heartbeat task, so its own handle is detached, not aborted.
    async fn heartbeat_failed(self: &Arc<Self>, generation: u64, err: InvokeError) {
        let released = {
            let mut inner = self.inner.lock().await;
            match &inner.active {
                Some(active) if active.generation == generation => {}
                _ => return,
            }
            inner.heartbeat = None;
            let released = inner.active.take().map(|active| {
                active.pump.abort();
                active.connection
            });
            warn!(state = ?self.state(), "hub: heartbeat lost the hub: {err}");
            self.schedule_reconnect(&mut inner);
            released
        };
        if let Some(connection) = released {
            connection.close().await;
        }
    }

    /// Called from the pump task when the transport goes away on its own.
    async fn connection_lost(self: &Arc<Self>, generation: u64, reason: Option<TransportError>) {
        let mut inner = self.inner.lock().await;
        match &inner.active {
            Some(active) if active.generation == generation => {}
            _ => return,
        }
        // The pump is the current task; dropping the handle detaches it.
        inner.active = None;
        if let Some(heartbeat) = inner.heartbeat.take() {
            heartbeat.abort();
        }

        match reason {
            Some(err) if err.is_fatal() => self.fail_fatally(&err),
            reason => {
                match &reason {
                    Some(err) => warn!("hub: connection lost: {err}"),
                    None => warn!("hub: connection closed"),
                }
                self.set_state(ConnectionState::Disconnected);
                self.schedule_reconnect(&mut inner);
            }
        }
    }

    fn schedule_reconnect(self: &Arc<Self>, inner: &mut SessionInner) {
        if let Some(pending) = inner.reconnect.take() {
            pending.abort();
        }
        if !self.settings.reconnect.allows(inner.reconnect_attempts) {
            error!(
                attempts = inner.reconnect_attempts,
                "hub: reconnect attempts exhausted"
            );
            self.set_state(ConnectionState::Failed);
            return;
        }
        self.set_state(ConnectionState::Reconnecting);
        inner.reconnect = Some(tokio::spawn(reconnect_loop(
            Arc::downgrade(self),
            inner.epoch,
        )));
    }

    /// Registers the user and rejoins tracked conversations. Failures are only logged.
    async fn after_connect(&self) {
        let (connection, user_id, conversations) = {
            let inner = self.inner.lock().await;
            let Some(active) = inner.active.as_ref() else {
                return;
            };
            (
                Arc::clone(&active.connection),
                inner.credentials.as_ref().map(|c| c.user_id.clone()),
                inner.conversations.iter().cloned().collect::<Vec<_>>(),
            )
        };

        if self.settings.announce_user {
            if let Some(user_id) = user_id {
                if let Err(err) = connection
                    .invoke(methods::ADD_USER, vec![Value::from(user_id.as_str())])
                    .await
                {
                    warn!(user_id = %user_id, "hub: AddUser failed: {err}");
                }
            }
        }
        for conversation_id in conversations {
            if let Err(err) = connection
                .invoke(
                    methods::JOIN_CONVERSATION,
                    vec![Value::from(conversation_id.as_str())],
                )
                .await
            {
                warn!(conversation_id = %conversation_id, "hub: rejoin failed: {err}");
            }
        }
    }
}

impl Drop for HubSession {
    fn drop(&mut self) {
        let inner = self.inner.get_mut();
        if let Some(task) = inner.reconnect.take() {
            task.abort();
        }
        if let Some(task) = inner.heartbeat.take() {
            task.abort();
        }
        if let Some(active) = inner.active.take() {
            active.pump.abort();
            active.connection.abort();
        }
    }
}

async fn pump_events(
    session: Weak<HubSession>,
    connection: Arc<dyn HubConnection>,
    mut inbound: broadcast::Receiver<InboundInvocation>,
    generation: u64,
) {
    let reason = loop {
        tokio::select! {
            received = inbound.recv() => match received {
                Ok(invocation) => {
                    let Some(session) = session.upgrade() else { return };
                    session.handlers.dispatch(&invocation.target, &invocation.arguments);
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "hub: event pump lagged");
                }
                Err(broadcast::error::RecvError::Closed) => break connection.closed().await,
            },
            reason = connection.closed() => break reason,
        }
    };
    if let Some(session) = session.upgrade() {
        session.connection_lost(generation, reason).await;
    }
}

/// Backoff loop: waits, retries every planned endpoint, and repeats until it
/// connects, exhausts the policy or is superseded.
async fn reconnect_loop(session: Weak<HubSession>, epoch: u64) {
    loop {
        let Some(this) = session.upgrade() else {
            return;
        };
        let (attempt, delay, requests) = {
            let mut inner = this.inner.lock().await;
            if inner.epoch != epoch {
                return;
            }
            let attempt = inner.reconnect_attempts;
            if !this.settings.reconnect.allows(attempt) {
                error!(attempts = attempt, "hub: reconnect attempts exhausted");
                inner.reconnect = None;
                this.set_state(ConnectionState::Failed);
                return;
            }
            let Some(credentials) = inner.credentials.clone() else {
                inner.reconnect = None;
                this.set_state(ConnectionState::Disconnected);
                return;
            };
            let requests = match plan_attempts(
                &this.settings.endpoint,
                this.settings.platform,
                &credentials.user_id,
                &credentials.access_token,
            ) {
                Ok(requests) => requests,
                Err(err) => {
                    inner.reconnect = None;
                    error!("hub: invalid endpoint configuration: {err}");
                    this.set_state(ConnectionState::Failed);
                    let _ = this.events.send(SessionEvent::Fatal(err));
                    return;
                }
            };
            (attempt, this.settings.reconnect.delay_for(attempt), requests)
        };

        info!(attempt = attempt + 1, delay_ms = delay.as_millis() as u64, "hub: reconnect scheduled");
        let _ = this.events.send(SessionEvent::ReconnectScheduled { attempt, delay });
        let connector = Arc::clone(&this.connector);
        drop(this);

        tokio::time::sleep(delay).await;
        if session
            .upgrade()
            .map_or(true, |this| *this.state.borrow() != ConnectionState::Reconnecting)
        {
            return;
        }

        let outcome = negotiate(connector.as_ref(), &requests).await;

        let Some(this) = session.upgrade() else {
            return;
        };
        let mut inner = this.inner.lock().await;
        if inner.epoch != epoch {
            drop(inner);
            if let Ok((connection, _)) = outcome {
                connection.close().await;
            }
            return;
        }
        match outcome {
            Ok((connection, request)) => {
                inner.reconnect = None;
                this.install(&mut inner, connection, &request);
                drop(inner);
                info!(attempt = attempt + 1, "hub: reconnected");
                this.after_connect().await;
                return;
            }
            Err(err) if err.is_fatal() => {
                inner.reconnect = None;
                this.fail_fatally(&err);
                return;
            }
            Err(err) => {
                inner.reconnect_attempts += 1;
                warn!(
                    attempt = attempt + 1,
                    state = ?this.state(),
                    "hub: reconnect attempt failed: {err}"
                );
            }
        }
    }
}

#[cfg(test)]
#[path = "tests/session_tests.rs"]
mod tests;
