use std::future::Future;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::Serialize;
use strum_macros::{Display, EnumIter};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::config::SessionConfig;
use crate::error::{LinkError, TransportError, UsageError};
use crate::manager::SessionTable;
use crate::notification::{NotificationReceiver, notification_channel};
use crate::observer::SessionObserver;
use crate::registry::DeviceRecord;
use crate::transport::{ConnectionHandle, Transport};

/// Lifecycle states of one device session.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Display, EnumIter, Serialize)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// Created, nothing held yet.
    Idle,
    /// Transport connection attempt in flight.
    Connecting,
    /// Transport connected; subscribing to the notify characteristic.
    HandshakeInProgress,
    /// Subscribed; writes and notifications both flow.
    Ready,
    /// A connect step failed. Terminal.
    Faulted,
    /// All resources released. Terminal.
    Disconnected,
}

impl SessionState {
    /// Returns whether no further transition is possible.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Faulted | Self::Disconnected)
    }

    /// Returns whether moving from `self` to `next` is a legal transition.
    ///
    /// ```
    /// use blelink::SessionState;
    ///
    /// assert!(SessionState::Ready.can_transition_to(SessionState::Disconnected));
    /// assert!(!SessionState::Disconnected.can_transition_to(SessionState::Connecting));
    /// ```
    #[must_use]
    pub fn can_transition_to(self, next: Self) -> bool {
        use SessionState::{
            Connecting, Disconnected, Faulted, HandshakeInProgress, Idle, Ready,
        };

        matches!(
            (self, next),
            (Idle, Connecting | Disconnected)
                | (Connecting, HandshakeInProgress | Faulted | Disconnected)
                | (HandshakeInProgress, Ready | Faulted | Disconnected)
                | (Ready, Faulted | Disconnected)
        )
    }
}

/// Process-unique identifier of a session.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, derive_more::Display)]
#[display("session#{_0}")]
pub struct SessionId(u64);

impl SessionId {
    fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

/// Why a ready session stopped.
#[derive(Debug, Clone, Copy, Eq, PartialEq, derive_more::Display)]
pub(crate) enum DisconnectCause {
    #[display("disconnect requested")]
    Requested,
    #[display("link lost")]
    LinkLost,
}

/// Collaborators a session needs while it runs.
#[derive(Clone)]
pub(crate) struct SessionContext {
    pub(crate) transport: Arc<dyn Transport>,
    pub(crate) config: SessionConfig,
    pub(crate) sessions: Arc<SessionTable>,
}

#[derive(Debug)]
struct WriteRequest {
    payload: Vec<u8>,
    reply: oneshot::Sender<Result<(), LinkError>>,
}

/// Pending outcome of one queued write.
#[derive(Debug)]
pub struct WriteReceipt {
    address: String,
    reply: oneshot::Receiver<Result<(), LinkError>>,
}

impl WriteReceipt {
    /// Returns the address the write was queued for.
    #[must_use]
    pub fn address(&self) -> &str {
        &self.address
    }

    /// Waits until the transport accepted or rejected the write.
    ///
    /// # Errors
    ///
    /// Returns [`LinkError::Write`] when the transport rejected the payload or
    /// timed out, and [`UsageError::SessionClosed`] when the session closed
    /// before the write was issued.
    pub async fn outcome(self) -> Result<(), LinkError> {
        let address = self.address;
        self.reply.await.unwrap_or_else(|_closed| {
            Err(UsageError::SessionClosed { address }.into())
        })
    }
}

/// One logical connection to one peripheral address.
#[derive(Debug)]
pub(crate) struct Session {
    id: SessionId,
    device: DeviceRecord,
    state: watch::Sender<SessionState>,
    last_error: Mutex<Option<LinkError>>,
    connection: Mutex<Option<ConnectionHandle>>,
    writer: Mutex<Option<mpsc::UnboundedSender<WriteRequest>>>,
    writer_task: Mutex<Option<JoinHandle<()>>>,
    pending_writes: Arc<AtomicUsize>,
    cancel: CancellationToken,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Session {
    pub(crate) fn new(device: DeviceRecord) -> Arc<Self> {
        let (state, _receiver) = watch::channel(SessionState::Idle);
        Arc::new(Self {
            id: SessionId::next(),
            device,
            state,
            last_error: Mutex::new(None),
            connection: Mutex::new(None),
            writer: Mutex::new(None),
            writer_task: Mutex::new(None),
            pending_writes: Arc::new(AtomicUsize::new(0)),
            cancel: CancellationToken::new(),
        })
    }

    pub(crate) fn id(&self) -> SessionId {
        self.id
    }

    pub(crate) fn device(&self) -> &DeviceRecord {
        &self.device
    }

    pub(crate) fn address(&self) -> &str {
        self.device.address()
    }

    pub(crate) fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    #[cfg(test)]
    pub(crate) fn force_state(&self, state: SessionState) {
        self.state.send_replace(state);
    }

    pub(crate) fn pending_writes(&self) -> usize {
        self.pending_writes.load(Ordering::Acquire)
    }

    /// Moves to `next`, rejecting anything the state machine does not allow.
    pub(crate) fn transition(&self, next: SessionState) -> Result<(), UsageError> {
        let mut rejected_from = None;
        self.state.send_if_modified(|current| {
            if current.can_transition_to(next) {
                debug!(from = %current, to = %next, "session state changed");
                *current = next;
                true
            } else {
                rejected_from = Some(*current);
                false
            }
        });

        match rejected_from {
            None => {
                if next != SessionState::Faulted {
                    lock(&self.last_error).take();
                }
                Ok(())
            }
            Some(from) if from.is_terminal() => Err(UsageError::SessionClosed {
                address: self.address().to_string(),
            }),
            Some(from) => Err(UsageError::IllegalTransition {
                address: self.address().to_string(),
                from,
                to: next,
            }),
        }
    }

    fn fault(&self, error: &LinkError) {
        *lock(&self.last_error) = Some(error.clone());
        if let Err(rejected) = self.transition(SessionState::Faulted) {
            debug!(%rejected, "session already closed when faulting");
        }
    }

    fn cancelled_error(&self) -> LinkError {
        LinkError::connection(self.address(), "cancelled by disconnect")
    }

    /// Queues one payload behind any writes already waiting.
    pub(crate) fn submit(&self, payload: Vec<u8>) -> Result<WriteReceipt, LinkError> {
        let state = self.state();
        if state.is_terminal() {
            return Err(UsageError::SessionClosed {
                address: self.address().to_string(),
            }
            .into());
        }
        let not_ready = || UsageError::NotReady {
            address: self.address().to_string(),
            state,
        };
        if state != SessionState::Ready {
            return Err(not_ready().into());
        }
        let writer = lock(&self.writer).clone().ok_or_else(not_ready)?;

        let (reply, receipt) = oneshot::channel();
        self.pending_writes.fetch_add(1, Ordering::AcqRel);
        if writer.send(WriteRequest { payload, reply }).is_err() {
            self.pending_writes.fetch_sub(1, Ordering::AcqRel);
            return Err(UsageError::SessionClosed {
                address: self.address().to_string(),
            }
            .into());
        }

        Ok(WriteReceipt {
            address: self.address().to_string(),
            reply: receipt,
        })
    }

    /// Requests disconnect and waits until the session reaches a terminal state.
    pub(crate) async fn shutdown(&self) {
        self.cancel.cancel();
        let mut states = self.state.subscribe();
        if states.wait_for(|state| state.is_terminal()).await.is_err() {
            debug!("session state channel closed during shutdown");
        }
    }

    /// Drives the session from `Idle` until it ends, reporting through `observer`.
    pub(crate) async fn run(
        self: Arc<Self>,
        context: SessionContext,
        observer: Arc<dyn SessionObserver>,
        outcome: oneshot::Sender<Result<DeviceRecord, LinkError>>,
    ) {
        let (connection, mut notifications) = match self.handshake(&context).await {
            Ok(established) => established,
            Err(error) => {
                context.sessions.remove(self.address(), self.id);
                warn!(%error, "connect failed");
                observer.on_connect_failed(&error);
                if outcome.send(Err(error)).is_err() {
                    debug!("connect outcome receiver dropped");
                }
                return;
            }
        };

        self.start_writer(&context, connection);
        if let Err(error) = self.transition(SessionState::Ready) {
            debug!(%error, "session closed before it became ready");
        }
        info!("session ready");
        observer.on_connected(&self.device);
        if outcome.send(Ok(self.device.clone())).is_err() {
            debug!("connect outcome receiver dropped");
        }

        let cause = self.dispatch(&*observer, &mut notifications).await;
        let dropped = notifications.close();
        if dropped > 0 {
            debug!(dropped, "discarded notifications after disconnect");
        }
        self.teardown(&context, cause).await;
        observer.on_disconnected(self.address());
    }

    #[instrument(skip_all, level = "debug")]
    async fn handshake(
        &self,
        context: &SessionContext,
    ) -> Result<(ConnectionHandle, NotificationReceiver), LinkError> {
        let address = self.address();
        if self.cancel.is_cancelled() {
            self.transition(SessionState::Disconnected)?;
            return Err(self.cancelled_error());
        }
        self.transition(SessionState::Connecting)?;

        let opened = bounded(
            "connect",
            context.config.connect_timeout(),
            context.transport.open_connection(address),
        )
        .await;
        if self.cancel.is_cancelled() {
            if let Ok(connection) = opened {
                close_quietly(context, connection).await;
            }
            self.transition(SessionState::Disconnected)?;
            return Err(self.cancelled_error());
        }
        let connection = match opened {
            Ok(connection) => connection,
            Err(source) => {
                let error = LinkError::connection(address, source);
                self.fault(&error);
                return Err(error);
            }
        };

        self.transition(SessionState::HandshakeInProgress)?;
        let (sender, receiver) =
            notification_channel(address, context.config.notification_capacity());
        let subscribed = bounded(
            "subscribe",
            context.config.subscribe_timeout(),
            context.transport.subscribe(
                &connection,
                context.config.notify_characteristic(),
                sender,
            ),
        )
        .await;
        if self.cancel.is_cancelled() {
            close_quietly(context, connection).await;
            self.transition(SessionState::Disconnected)?;
            return Err(self.cancelled_error());
        }
        if let Err(source) = subscribed {
            close_quietly(context, connection).await;
            let error = LinkError::subscription(address, source);
            self.fault(&error);
            return Err(error);
        }

        *lock(&self.connection) = Some(connection.clone());
        Ok((connection, receiver))
    }

    fn start_writer(&self, context: &SessionContext, connection: ConnectionHandle) {
        let (sender, requests) = mpsc::unbounded_channel();
        let writer = Writer {
            address: self.address().to_string(),
            transport: Arc::clone(&context.transport),
            connection,
            characteristic: context.config.write_characteristic(),
            timeout: context.config.write_timeout(),
            pending: Arc::clone(&self.pending_writes),
            cancel: self.cancel.clone(),
        };
        *lock(&self.writer) = Some(sender);
        *lock(&self.writer_task) = Some(tokio::spawn(writer.run(requests)));
    }

    async fn dispatch(
        &self,
        observer: &dyn SessionObserver,
        notifications: &mut NotificationReceiver,
    ) -> DisconnectCause {
        loop {
            let message = tokio::select! {
                biased;
                () = self.cancel.cancelled() => return DisconnectCause::Requested,
                maybe_message = notifications.recv() => match maybe_message {
                    Some(message) => message,
                    None => return DisconnectCause::LinkLost,
                },
            };

            let state = self.state();
            if state != SessionState::Ready {
                debug!(%state, "dropping notification outside ready state");
                continue;
            }
            match message.decode_text() {
                Ok(text) => observer.on_data(self.address(), &text),
                Err(error) => {
                    warn!(%error, "dropping undecodable notification");
                    observer.on_data_error(&error);
                }
            }
        }
    }

    #[instrument(skip_all, level = "debug", fields(%cause))]
    async fn teardown(&self, context: &SessionContext, cause: DisconnectCause) {
        self.cancel.cancel();
        lock(&self.writer).take();
        let writer_task = lock(&self.writer_task).take();
        if let Some(writer_task) = writer_task
            && let Err(error) = writer_task.await
        {
            warn!(%error, "writer task ended abnormally");
        }

        let connection = lock(&self.connection).take();
        if let Some(connection) = connection {
            close_quietly(context, connection).await;
        }

        context.sessions.remove(self.address(), self.id);
        if let Err(error) = self.transition(SessionState::Disconnected) {
            debug!(%error, "session was already closed");
        }
        info!("session disconnected");
    }
}

/// Issues queued writes one at a time, in submission order.
struct Writer {
    address: String,
    transport: Arc<dyn Transport>,
    connection: ConnectionHandle,
    characteristic: Uuid,
    timeout: Duration,
    pending: Arc<AtomicUsize>,
    cancel: CancellationToken,
}

impl Writer {
    async fn run(self, mut requests: mpsc::UnboundedReceiver<WriteRequest>) {
        loop {
            let request = tokio::select! {
                biased;
                () = self.cancel.cancelled() => break,
                maybe_request = requests.recv() => match maybe_request {
                    Some(request) => request,
                    None => break,
                },
            };

            let outcome = bounded(
                "write",
                self.timeout,
                self.transport
                    .write(&self.connection, self.characteristic, &request.payload),
            )
            .await
            .map_err(|source| LinkError::write(&self.address, source));
            self.pending.fetch_sub(1, Ordering::AcqRel);

            match &outcome {
                Ok(()) => debug!(payload_len = request.payload.len(), "write completed"),
                Err(error) => warn!(%error, "write failed"),
            }
            if request.reply.send(outcome).is_err() {
                debug!("write receipt dropped before completion");
            }
        }

        requests.close();
        while let Ok(request) = requests.try_recv() {
            self.pending.fetch_sub(1, Ordering::AcqRel);
            let closed = UsageError::SessionClosed {
                address: self.address.clone(),
            };
            if request.reply.send(Err(closed.into())).is_err() {
                debug!("write receipt dropped before session closed");
            }
        }
    }
}

/// Bounds a transport call so an unresponsive radio fails instead of hanging.
async fn bounded<T>(
    operation: &'static str,
    limit: Duration,
    call: impl Future<Output = Result<T, TransportError>>,
) -> Result<T, TransportError> {
    tokio::time::timeout(limit, call)
        .await
        .unwrap_or_else(|_elapsed| Err(TransportError::TimedOut { operation, limit }))
}

async fn close_quietly(context: &SessionContext, connection: ConnectionHandle) {
    if let Err(error) = context.transport.close(connection).await {
        warn!(%error, "failed to close transport connection");
    }
}
