//! Connection manager and sessions
//!
//! `ConnectionManager::resolve` turns a saved profile into a live `Session`:
//! secret lookup, optional SSH tunnel, physical connect, then a validation
//! round-trip. Connect and validation run on the worker pool. Anything that
//! fails after the tunnel came up tears it down again before the error is
//! returned.

use crate::config::{ConnectionProfile, Endpoint, TunnelAuth};
use crate::credentials::{CredentialStore, Secret};
use crate::db::{CapabilityDescriptor, ConnectTarget, Connection, ProviderRegistry};
use crate::error::{
    ConnectionError, ConnectionFailure, Result, TunnelError, TunnelFailure, VizdbError,
};
use crate::sql::TransactionControl;
use crate::tunnel::{Tunnel, TunnelManager};
use crate::workers::WorkerPool;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use uuid::Uuid;

/// Which secret a prompt is for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SecretPurpose {
    Database,
    Tunnel,
}

/// A secret typed in by the user
#[derive(Debug)]
pub struct PromptAnswer {
    pub secret: Secret,
    /// Persist the answer in the credential store
    pub save: bool,
}

/// Asks the presentation layer for a secret that is not stored
#[async_trait]
pub trait SecretPrompt: Send + Sync {
    async fn ask(
        &self,
        profile: &ConnectionProfile,
        purpose: SecretPurpose,
    ) -> Option<PromptAnswer>;
}

/// Never answers; connecting proceeds without the secret
pub struct DeclinePrompt;

#[async_trait]
impl SecretPrompt for DeclinePrompt {
    async fn ask(&self, _: &ConnectionProfile, _: SecretPurpose) -> Option<PromptAnswer> {
        None
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum SessionState {
    Open,
    Invalid(String),
    Closed,
}

/// One physical connection plus the tunnel in front of it
pub struct Session {
    id: Uuid,
    profile: ConnectionProfile,
    descriptor: CapabilityDescriptor,
    conn: Arc<dyn Connection>,
    tunnel: Mutex<Option<Box<dyn Tunnel>>>,
    state: Mutex<SessionState>,
    busy: AtomicBool,
    /// An explicit transaction block is open on the connection
    in_transaction: AtomicBool,
    /// Serializes use of the physical handle (statements and page re-queries)
    exec_lock: Arc<tokio::sync::Mutex<()>>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("profile", &self.profile.name)
            .field("kind", &self.descriptor.kind)
            .field("state", &*self.state.lock())
            .finish()
    }
}

impl Session {
    pub fn new(
        profile: ConnectionProfile,
        descriptor: CapabilityDescriptor,
        conn: Arc<dyn Connection>,
        tunnel: Option<Box<dyn Tunnel>>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            profile,
            descriptor,
            conn,
            tunnel: Mutex::new(tunnel),
            state: Mutex::new(SessionState::Open),
            busy: AtomicBool::new(false),
            in_transaction: AtomicBool::new(false),
            exec_lock: Arc::new(tokio::sync::Mutex::new(())),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn profile(&self) -> &ConnectionProfile {
        &self.profile
    }

    pub fn descriptor(&self) -> &CapabilityDescriptor {
        &self.descriptor
    }

    pub fn connection(&self) -> Arc<dyn Connection> {
        self.conn.clone()
    }

    pub fn exec_lock(&self) -> Arc<tokio::sync::Mutex<()>> {
        self.exec_lock.clone()
    }

    /// Schema unqualified names resolve against
    pub fn default_schema(&self) -> Option<&str> {
        self.descriptor
            .default_schema
            .or(self.profile.database.as_deref())
    }

    /// Local port of the tunnel, if one is open
    pub fn tunnel_port(&self) -> Option<u16> {
        self.tunnel.lock().as_ref().map(|t| t.local_port())
    }

    pub fn is_usable(&self) -> bool {
        *self.state.lock() == SessionState::Open
    }

    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::SeqCst)
    }

    pub fn in_transaction(&self) -> bool {
        self.in_transaction.load(Ordering::SeqCst)
    }

    /// Track BEGIN / COMMIT / ROLLBACK that completed on this session
    pub fn record_transaction(&self, control: TransactionControl) {
        let open = control == TransactionControl::Begin;
        if self.in_transaction.swap(open, Ordering::SeqCst) != open {
            tracing::debug!(session = %self.id, open, "transaction state changed");
        }
    }

    /// Fails when the session lost connectivity or was closed
    pub fn check_usable(&self) -> Result<()> {
        match &*self.state.lock() {
            SessionState::Open => Ok(()),
            SessionState::Invalid(reason) => Err(VizdbError::SessionInvalid(reason.clone())),
            SessionState::Closed => Err(VizdbError::SessionInvalid("session is closed".into())),
        }
    }

    /// Mark the session unusable after connectivity loss
    pub fn invalidate(&self, reason: impl Into<String>) {
        let mut state = self.state.lock();
        if *state == SessionState::Open {
            let reason = reason.into();
            tracing::warn!(session = %self.id, %reason, "session invalidated");
            *state = SessionState::Invalid(reason);
            self.in_transaction.store(false, Ordering::SeqCst);
        }
    }

    /// Claim the single statement slot
    pub fn begin_statement(self: &Arc<Self>) -> Result<StatementSlot> {
        self.check_usable()?;
        if self
            .busy
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(VizdbError::SessionBusy);
        }
        Ok(StatementSlot {
            session: self.clone(),
        })
    }

    /// Release the connection, then the tunnel. Later calls do nothing.
    pub async fn close(&self) {
        {
            let mut state = self.state.lock();
            if *state == SessionState::Closed {
                return;
            }
            *state = SessionState::Closed;
        }
        self.in_transaction.store(false, Ordering::SeqCst);
        tracing::info!(session = %self.id, profile = %self.profile.name, "closing session");
        self.conn.close().await;
        let tunnel = self.tunnel.lock().take();
        if let Some(tunnel) = tunnel {
            tunnel.close().await;
        }
    }
}

/// Held while a statement is non-terminal; dropping it frees the session
#[derive(Debug)]
pub struct StatementSlot {
    session: Arc<Session>,
}

impl Drop for StatementSlot {
    fn drop(&mut self) {
        self.session.busy.store(false, Ordering::SeqCst);
    }
}

/// Resolves profiles into sessions
pub struct ConnectionManager {
    registry: Arc<ProviderRegistry>,
    credentials: Arc<CredentialStore>,
    tunnels: Arc<dyn TunnelManager>,
    prompt: Arc<dyn SecretPrompt>,
    pool: WorkerPool,
    connect_timeout: Duration,
}

impl ConnectionManager {
    pub fn new(
        registry: Arc<ProviderRegistry>,
        credentials: Arc<CredentialStore>,
        tunnels: Arc<dyn TunnelManager>,
    ) -> Self {
        Self {
            registry,
            credentials,
            tunnels,
            prompt: Arc::new(DeclinePrompt),
            pool: WorkerPool::default(),
            connect_timeout: Duration::from_secs(10),
        }
    }

    pub fn with_prompt(mut self, prompt: Arc<dyn SecretPrompt>) -> Self {
        self.prompt = prompt;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Pool the connect and validation round-trips run on
    pub fn with_pool(mut self, pool: WorkerPool) -> Self {
        self.pool = pool;
        self
    }

    pub fn registry(&self) -> &Arc<ProviderRegistry> {
        &self.registry
    }

    pub async fn resolve(&self, profile: &ConnectionProfile) -> Result<Arc<Session>> {
        self.resolve_with_secret(profile, None).await
    }

    /// Like `resolve`, but an ad-hoc secret (e.g. from a URL) takes the
    /// place of the stored one
    pub async fn resolve_with_secret(
        &self,
        profile: &ConnectionProfile,
        secret: Option<Secret>,
    ) -> Result<Arc<Session>> {
        let descriptor = self.registry.describe(profile.kind)?.clone();
        let adapter = self.registry.adapter(profile.kind)?;
        tracing::info!(profile = %profile.name, kind = %profile.kind, "resolving session");

        let secret = match secret {
            Some(secret) => Some(secret),
            None => {
                let required = descriptor.requires_auth && profile.username.is_some();
                self.secret_for(profile, &profile.secret_key(), SecretPurpose::Database, required)
                    .await?
            }
        };

        let tunnel = match &profile.tunnel {
            Some(_) => Some(self.open_tunnel(profile, &descriptor).await?),
            None => None,
        };

        let endpoint = match (&tunnel, &profile.endpoint) {
            (Some(tunnel), Endpoint::Tcp { .. }) => Endpoint::Tcp {
                host: "127.0.0.1".into(),
                port: tunnel.local_port(),
            },
            (_, endpoint) => endpoint.clone(),
        };
        let target = ConnectTarget {
            kind: profile.kind,
            endpoint,
            database: profile.database.clone(),
            username: profile.username.clone(),
            secret,
            options: profile.options.clone(),
        };

        let timeout = self.connect_timeout;
        let connected = self
            .pool
            .run(async move { bounded(timeout, "connect", adapter.connect(&target)).await })
            .await;
        let conn = match connected {
            Ok(conn) => conn,
            Err(e) => {
                tracing::warn!(profile = %profile.name, error = %e, "connect failed");
                if let Some(tunnel) = tunnel {
                    tunnel.close().await;
                }
                return Err(e);
            }
        };

        let ping_conn = conn.clone();
        let validated = self
            .pool
            .run(async move {
                bounded(timeout, "connection validation", async {
                    ping_conn.ping().await.map_err(|e| {
                        VizdbError::from(ConnectionError::with_source(
                            ConnectionFailure::HandshakeFailed,
                            e,
                        ))
                    })
                })
                .await
            })
            .await;
        if let Err(e) = validated {
            tracing::warn!(profile = %profile.name, error = %e, "validation failed");
            conn.close().await;
            if let Some(tunnel) = tunnel {
                tunnel.close().await;
            }
            return Err(e);
        }

        let session = Session::new(profile.clone(), descriptor, conn, tunnel);
        tracing::info!(session = %session.id(), profile = %profile.name, "session open");
        Ok(Arc::new(session))
    }

    /// Release a session; same as `Session::close`
    pub async fn close(&self, session: &Session) {
        session.close().await;
    }

    async fn secret_for(
        &self,
        profile: &ConnectionProfile,
        key: &str,
        purpose: SecretPurpose,
        required: bool,
    ) -> Result<Option<Secret>> {
        if let Some(secret) = self.credentials.get(key)? {
            return Ok(Some(secret));
        }
        if !required {
            return Ok(None);
        }
        let Some(answer) = self.prompt.ask(profile, purpose).await else {
            tracing::debug!(profile = %profile.name, ?purpose, "no secret available");
            return Ok(None);
        };
        if answer.save {
            self.credentials.set(key, &answer.secret)?;
        }
        Ok(Some(answer.secret))
    }

    async fn open_tunnel(
        &self,
        profile: &ConnectionProfile,
        descriptor: &CapabilityDescriptor,
    ) -> Result<Box<dyn Tunnel>> {
        let Some(spec) = &profile.tunnel else {
            return Err(TunnelError::new(TunnelFailure::Unsupported, "no tunnel configured").into());
        };
        if !descriptor.supports_tunnel {
            return Err(TunnelError::new(
                TunnelFailure::Unsupported,
                format!("{} connections cannot be tunneled", descriptor.display_name),
            )
            .into());
        }
        let Some((host, port)) = profile.endpoint.host_port() else {
            return Err(TunnelError::new(
                TunnelFailure::Unsupported,
                "only host/port endpoints can be tunneled",
            )
            .into());
        };

        // Key auth without a passphrase is fine; password auth needs one
        let required = matches!(spec.auth, TunnelAuth::Password);
        let secret = self
            .secret_for(profile, &profile.tunnel_secret_key(), SecretPurpose::Tunnel, required)
            .await?;
        if required && secret.is_none() {
            return Err(TunnelError::new(
                TunnelFailure::AuthFailed,
                format!("no SSH password available for {}@{}", spec.username, spec.host),
            )
            .into());
        }

        tracing::info!(ssh_host = %spec.host, remote = %host, remote_port = port, "opening tunnel");
        bounded(self.connect_timeout, "tunnel", async {
            self.tunnels
                .open(spec, secret, host, port)
                .await
                .map_err(VizdbError::from)
        })
        .await
    }
}

/// Run `work` with a deadline, mapping expiry to `VizdbError::Timeout`
async fn bounded<T>(
    after: Duration,
    operation: &'static str,
    work: impl Future<Output = Result<T>>,
) -> Result<T> {
    match tokio::time::timeout(after, work).await {
        Ok(result) => result,
        Err(_) => Err(VizdbError::Timeout { operation, after }),
    }
}
