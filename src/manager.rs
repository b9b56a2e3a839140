use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::oneshot;
use tokio::task::JoinSet;
use tracing::{Instrument, debug, info, info_span, instrument, warn};

use crate::config::SessionConfig;
use crate::error::{LinkError, UsageError};
use crate::observer::SessionObserver;
use crate::registry::{DeviceRecord, DeviceRegistry};
use crate::session::{Session, SessionContext, SessionId, SessionState, WriteReceipt};
use crate::transport::Transport;

/// The address to session table; the only structure shared between sessions.
#[derive(Debug, Default)]
pub(crate) struct SessionTable {
    sessions: Mutex<HashMap<String, Arc<Session>>>,
}

impl SessionTable {
    fn lock(&self) -> MutexGuard<'_, HashMap<String, Arc<Session>>> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Inserts `session` unless a live session already owns its address.
    pub(crate) fn reserve(&self, session: Arc<Session>) -> Result<(), UsageError> {
        let mut sessions = self.lock();
        if let Some(existing) = sessions.get(session.address())
            && !existing.state().is_terminal()
        {
            return Err(UsageError::AlreadyConnected {
                address: session.address().to_string(),
            });
        }
        sessions.insert(session.address().to_string(), session);
        Ok(())
    }

    /// Removes the entry for `address` only if it still belongs to session `id`.
    pub(crate) fn remove(&self, address: &str, id: SessionId) -> Option<Arc<Session>> {
        let mut sessions = self.lock();
        if sessions.get(address).is_some_and(|session| session.id() == id) {
            return sessions.remove(address);
        }
        None
    }

    pub(crate) fn get(&self, address: &str) -> Option<Arc<Session>> {
        self.lock().get(address).cloned()
    }

    pub(crate) fn all(&self) -> Vec<Arc<Session>> {
        self.lock().values().cloned().collect()
    }

    pub(crate) fn len(&self) -> usize {
        self.lock().len()
    }

    /// Picks the session a send goes to.
    ///
    /// Without an explicit target the single ready session is used; zero or
    /// several ready sessions make the target ambiguous.
    pub(crate) fn resolve(&self, target: Option<&str>) -> Result<Arc<Session>, UsageError> {
        let sessions = self.lock();
        if let Some(address) = target {
            return sessions
                .get(address)
                .cloned()
                .ok_or_else(|| UsageError::UnknownSession {
                    address: address.to_string(),
                });
        }

        let mut ready = sessions
            .values()
            .filter(|session| session.state() == SessionState::Ready);
        match (ready.next(), ready.count()) {
            (None, _) => Err(UsageError::NoTarget),
            (Some(session), 0) => Ok(Arc::clone(session)),
            (Some(_), others) => Err(UsageError::AmbiguousTarget { count: others + 1 }),
        }
    }
}

/// One outbound payload, optionally addressed to a specific device.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct OutboundRequest {
    target_address: Option<String>,
    payload: Vec<u8>,
}

impl OutboundRequest {
    /// Creates a request for the single ready session.
    #[must_use]
    pub fn new(payload: impl Into<Vec<u8>>) -> Self {
        Self {
            target_address: None,
            payload: payload.into(),
        }
    }

    /// Addresses the request to the session for `address`.
    #[must_use]
    pub fn to(mut self, address: impl Into<String>) -> Self {
        self.target_address = Some(address.into());
        self
    }

    #[must_use]
    pub fn target_address(&self) -> Option<&str> {
        self.target_address.as_deref()
    }

    #[must_use]
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }
}

impl From<&str> for OutboundRequest {
    fn from(text: &str) -> Self {
        Self::new(text)
    }
}

/// Outcome of a connect that is still running its handshake.
#[derive(Debug)]
pub struct PendingConnect {
    address: String,
    outcome: oneshot::Receiver<Result<DeviceRecord, LinkError>>,
}

impl PendingConnect {
    #[must_use]
    pub fn address(&self) -> &str {
        &self.address
    }

    /// Waits for the handshake to finish.
    ///
    /// Resolves to the same result the observer was told about.
    ///
    /// # Errors
    ///
    /// Returns the [`LinkError`] that faulted or cancelled the connect.
    pub async fn outcome(self) -> Result<DeviceRecord, LinkError> {
        let address = self.address;
        self.outcome
            .await
            .unwrap_or_else(|_closed| Err(LinkError::connection(&address, "session task ended")))
    }
}

/// Owns every session and routes caller requests to them.
///
/// Cheap to clone; clones share the same sessions and registry.
#[derive(Clone)]
pub struct SessionManager {
    transport: Arc<dyn Transport>,
    config: SessionConfig,
    registry: DeviceRegistry,
    sessions: Arc<SessionTable>,
}

impl std::fmt::Debug for SessionManager {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("SessionManager")
            .field("config", &self.config)
            .field("registry", &self.registry)
            .field("sessions", &self.sessions)
            .finish_non_exhaustive()
    }
}

impl SessionManager {
    #[must_use]
    pub fn new(transport: Arc<dyn Transport>, config: SessionConfig) -> Self {
        Self {
            transport,
            config,
            registry: DeviceRegistry::new(),
            sessions: Arc::new(SessionTable::default()),
        }
    }

    #[must_use]
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Starts a scan window and calls `on_complete` once when it closes.
    ///
    /// `on_complete` runs even when nothing was found.
    ///
    /// # Errors
    ///
    /// Returns [`UsageError::ScanInProgress`] while a window is already open
    /// and [`LinkError::Discovery`] when the radio cannot scan.
    pub async fn scan<F>(&self, on_complete: F) -> Result<(), LinkError>
    where
        F: FnOnce(Vec<DeviceRecord>) + Send + 'static,
    {
        let completion = self
            .registry
            .start_scan(Arc::clone(&self.transport), self.config.scan_window())
            .await?;
        tokio::spawn(async move { on_complete(completion.devices().await) });
        Ok(())
    }

    /// Runs a full scan window and returns the devices it found.
    ///
    /// # Errors
    ///
    /// See [`SessionManager::scan`].
    pub async fn scan_devices(&self) -> Result<Vec<DeviceRecord>, LinkError> {
        let completion = self
            .registry
            .start_scan(Arc::clone(&self.transport), self.config.scan_window())
            .await?;
        Ok(completion.devices().await)
    }

    /// Returns the devices seen so far in the current or latest scan.
    #[must_use]
    pub fn discovered_devices(&self) -> Vec<DeviceRecord> {
        self.registry.snapshot()
    }

    #[must_use]
    pub fn is_scanning(&self) -> bool {
        self.registry.is_scanning()
    }

    /// Creates a session for `address` and starts its handshake.
    ///
    /// The session reports to `observer`; the returned [`PendingConnect`]
    /// resolves to the same outcome.
    ///
    /// # Errors
    ///
    /// Returns [`UsageError::AlreadyConnected`] when a live session for
    /// `address` already exists.
    #[instrument(skip(self, observer), level = "debug")]
    pub fn connect(
        &self,
        address: &str,
        observer: Arc<dyn SessionObserver>,
    ) -> Result<PendingConnect, LinkError> {
        let device = self
            .registry
            .get(address)
            .unwrap_or_else(|| DeviceRecord::new(address, None, None));
        let session = Session::new(device);
        self.sessions.reserve(Arc::clone(&session))?;

        let span = info_span!("session", address, id = %session.id());
        let context = SessionContext {
            transport: Arc::clone(&self.transport),
            config: self.config.clone(),
            sessions: Arc::clone(&self.sessions),
        };
        let (outcome_sender, outcome) = oneshot::channel();
        tokio::spawn(
            session
                .run(context, observer, outcome_sender)
                .instrument(span),
        );
        info!("connect started");

        Ok(PendingConnect {
            address: address.to_string(),
            outcome,
        })
    }

    /// Resolves the target and queues the payload without waiting for it.
    ///
    /// Requests submitted back to back reach the radio in submission order.
    ///
    /// # Errors
    ///
    /// Fails before any I/O when the target cannot be resolved or is not ready.
    pub fn submit(&self, request: OutboundRequest) -> Result<WriteReceipt, LinkError> {
        let session = self.sessions.resolve(request.target_address())?;
        session.submit(request.payload)
    }

    /// Sends one payload and waits until the radio accepted it.
    ///
    /// # Errors
    ///
    /// See [`SessionManager::submit`] and [`WriteReceipt::outcome`].
    pub async fn send(&self, request: impl Into<OutboundRequest>) -> Result<(), LinkError> {
        self.submit(request.into())?.outcome().await
    }

    /// Disconnects the session for `address`, if there is one.
    ///
    /// Returns `false` without doing anything when no session exists. A
    /// connect still in flight is cancelled once its current step settles.
    ///
    /// Resolves once the session state is terminal. The observer's
    /// `on_disconnected` is emitted from the session task and may arrive
    /// after this returns.
    #[instrument(skip(self), level = "debug")]
    pub async fn disconnect(&self, address: &str) -> bool {
        let Some(session) = self.sessions.get(address) else {
            debug!("no session to disconnect");
            return false;
        };
        session.shutdown().await;
        self.sessions.remove(address, session.id());
        true
    }

    /// Disconnects every session concurrently; safe to call with none.
    #[instrument(skip(self), level = "debug")]
    pub async fn disconnect_all(&self) {
        let sessions = self.sessions.all();
        if sessions.is_empty() {
            return;
        }

        let mut shutdowns = JoinSet::new();
        for session in sessions {
            let table = Arc::clone(&self.sessions);
            shutdowns.spawn(async move {
                session.shutdown().await;
                table.remove(session.address(), session.id());
            });
        }
        while let Some(joined) = shutdowns.join_next().await {
            if let Err(error) = joined {
                warn!(%error, "session shutdown task failed");
            }
        }
        info!("all sessions disconnected");
    }

    /// Returns the devices whose session is ready.
    #[must_use]
    pub fn connected_devices(&self) -> Vec<DeviceRecord> {
        self.sessions
            .all()
            .into_iter()
            .filter(|session| session.state() == SessionState::Ready)
            .map(|session| session.device().clone())
            .collect()
    }

    #[must_use]
    pub fn is_connected(&self, address: &str) -> bool {
        self.session_state(address) == Some(SessionState::Ready)
    }

    /// Returns the session's device, or the latest scan record for `address`.
    #[must_use]
    pub fn device(&self, address: &str) -> Option<DeviceRecord> {
        self.sessions
            .get(address)
            .map(|session| session.device().clone())
            .or_else(|| self.registry.get(address))
    }

    #[must_use]
    pub fn session_state(&self, address: &str) -> Option<SessionState> {
        self.sessions.get(address).map(|session| session.state())
    }

    /// Returns how many writes are queued or in flight for `address`.
    #[must_use]
    pub fn pending_writes(&self, address: &str) -> Option<usize> {
        self.sessions
            .get(address)
            .map(|session| session.pending_writes())
    }

    #[must_use]
    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }
}
