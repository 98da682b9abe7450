use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, MutexGuard, PoisonError,
    },
    time::Duration,
};

use async_trait::async_trait;
use serde_json::Value;
use shared::protocol::{decode_records, HubMessage};
use tokio::{
    sync::{broadcast, mpsc, oneshot, watch},
    task::JoinHandle,
};
use tracing::{debug, trace, warn};

use super::{HubConnection, InboundInvocation, TransportKind};
use crate::error::{InvokeError, TransportError};

const INBOUND_CAPACITY: usize = 256;

pub(crate) enum Outbound {
    Record(String),
    Close,
}

#[derive(Debug, Clone)]
enum LinkState {
    Open,
    Closed(Option<TransportError>),
}

type PendingInvocation = (String, oneshot::Sender<Result<Value, InvokeError>>);

/// Invocation bookkeeping shared by every transport: outbound records go to
/// the transport's writer, inbound text is fed back through `handle_text`.
pub(crate) struct HubChannel {
    kind: TransportKind,
    outbound: mpsc::UnboundedSender<Outbound>,
    pending: Mutex<HashMap<String, PendingInvocation>>,
    next_invocation: AtomicU64,
    inbound: broadcast::Sender<InboundInvocation>,
    link: watch::Sender<LinkState>,
    invoke_timeout: Duration,
    readers: Mutex<Vec<JoinHandle<()>>>,
}

impl HubChannel {
    pub(crate) fn new(
        kind: TransportKind,
        outbound: mpsc::UnboundedSender<Outbound>,
        invoke_timeout: Duration,
    ) -> Arc<Self> {
        let (inbound, _) = broadcast::channel(INBOUND_CAPACITY);
        let (link, _) = watch::channel(LinkState::Open);
        Arc::new(Self {
            kind,
            outbound,
            pending: Mutex::new(HashMap::new()),
            next_invocation: AtomicU64::new(1),
            inbound,
            link,
            invoke_timeout,
            readers: Mutex::new(Vec::new()),
        })
    }

    /// Reader tasks are aborted when the channel is closed locally.
    pub(crate) fn attach_reader(&self, task: JoinHandle<()>) {
        lock(&self.readers).push(task);
    }

    pub(crate) fn is_open(&self) -> bool {
        matches!(*self.link.borrow(), LinkState::Open)
    }

    pub(crate) fn handle_text(&self, text: &str) {
        match decode_records(text) {
            Ok(messages) => {
                for message in messages {
                    self.handle_message(message);
                }
            }
            Err(err) => {
                warn!(transport = %self.kind, "hub: dropping malformed frame: {err}");
                self.finish(Some(TransportError::Protocol(err.to_string())));
            }
        }
    }

    fn handle_message(&self, message: HubMessage) {
        match message {
            HubMessage::Invocation {
                target, arguments, ..
            } => {
                // No receivers just means nobody is listening yet.
                let _ = self.inbound.send(InboundInvocation { target, arguments });
            }
            HubMessage::Completion {
                invocation_id,
                result,
                error,
            } => {
                let Some((method, tx)) = lock(&self.pending).remove(&invocation_id) else {
                    debug!(invocation_id = %invocation_id, "hub: completion for unknown invocation");
                    return;
                };
                let outcome = match error {
                    Some(message) => Err(InvokeError::Rejected { method, message }),
                    None => Ok(result.unwrap_or(Value::Null)),
                };
                let _ = tx.send(outcome);
            }
            HubMessage::Ping => trace!(transport = %self.kind, "hub: ping"),
            HubMessage::Close {
                error,
                allow_reconnect,
            } => {
                debug!(allow_reconnect, "hub: close record received");
                let reason = error.unwrap_or_else(|| "closed by hub".to_string());
                self.finish(Some(if allow_reconnect {
                    TransportError::Closed(reason)
                } else {
                    TransportError::Terminated(reason)
                }));
            }
            HubMessage::Unsupported(kind) => {
                debug!(kind, "hub: ignoring unsupported record type");
            }
        }
    }

    /// Marks the link closed once and fails every outstanding invocation.
    pub(crate) fn finish(&self, error: Option<TransportError>) {
        let changed = self.link.send_if_modified(|state| match state {
            LinkState::Open => {
                *state = LinkState::Closed(error.clone());
                true
            }
            LinkState::Closed(_) => false,
        });
        if !changed {
            return;
        }

        let drained: Vec<PendingInvocation> = lock(&self.pending).drain().map(|(_, v)| v).collect();
        for (method, tx) in drained {
            let _ = tx.send(Err(InvokeError::ConnectionClosed { method }));
        }
    }

    fn forget(&self, invocation_id: &str) {
        lock(&self.pending).remove(invocation_id);
    }
}

#[async_trait]
impl HubConnection for HubChannel {
    fn transport(&self) -> TransportKind {
        self.kind
    }

    async fn invoke(&self, method: &str, arguments: Vec<Value>) -> Result<Value, InvokeError> {
        let closed = || InvokeError::ConnectionClosed {
            method: method.to_string(),
        };
        if !self.is_open() {
            return Err(closed());
        }

        let invocation_id = self
            .next_invocation
            .fetch_add(1, Ordering::Relaxed)
            .to_string();
        let record = HubMessage::invocation(invocation_id.clone(), method, arguments)
            .encode()
            .map_err(|err| InvokeError::Codec {
                method: method.to_string(),
                reason: err.to_string(),
            })?;

        let (tx, rx) = oneshot::channel();
        lock(&self.pending).insert(invocation_id.clone(), (method.to_string(), tx));
        // finish() may have drained the table before the insert above.
        if !self.is_open() || self.outbound.send(Outbound::Record(record)).is_err() {
            self.forget(&invocation_id);
            return Err(closed());
        }

        match tokio::time::timeout(self.invoke_timeout, rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(closed()),
            Err(_) => {
                self.forget(&invocation_id);
                Err(InvokeError::Timeout {
                    method: method.to_string(),
                    after: self.invoke_timeout,
                })
            }
        }
    }

    fn subscribe(&self) -> broadcast::Receiver<InboundInvocation> {
        self.inbound.subscribe()
    }

    async fn closed(&self) -> Option<TransportError> {
        let mut rx = self.link.subscribe();
        let reason = match rx
            .wait_for(|state| matches!(state, LinkState::Closed(_)))
            .await
        {
            Ok(state) => match &*state {
                LinkState::Closed(error) => error.clone(),
                LinkState::Open => None,
            },
            Err(_) => None,
        };
        reason
    }

    async fn close(&self) {
        self.abort();
    }

    fn abort(&self) {
        let _ = self.outbound.send(Outbound::Close);
        self.finish(None);
        for task in lock(&self.readers).drain(..) {
            task.abort();
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
