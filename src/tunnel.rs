//! SSH tunnels
//!
//! A `TunnelManager` opens a local port that forwards to a backend endpoint
//! through an SSH bastion. The session owning the tunnel closes it exactly
//! once, after the database connection has been released.

use crate::config::connections::{TunnelAuth, TunnelSpec};
use crate::credentials::Secret;
use crate::error::{TunnelError, TunnelFailure};
use async_trait::async_trait;
use std::sync::Arc;

/// Opens tunnels in front of backend endpoints
#[async_trait]
pub trait TunnelManager: Send + Sync {
    /// Forward a local port to `remote_host:remote_port` as seen from the
    /// SSH server. `secret` is the SSH password or key passphrase.
    async fn open(
        &self,
        spec: &TunnelSpec,
        secret: Option<Secret>,
        remote_host: &str,
        remote_port: u16,
    ) -> Result<Box<dyn Tunnel>, TunnelError>;
}

/// An established tunnel
#[async_trait]
pub trait Tunnel: Send + Sync {
    /// Local port to connect to instead of the backend endpoint
    fn local_port(&self) -> u16;

    /// Tear the tunnel down. Calling it again is a no-op.
    async fn close(&self);
}

/// Tunnel manager for this build
pub fn default_manager() -> Arc<dyn TunnelManager> {
    #[cfg(feature = "ssh")]
    {
        Arc::new(ssh::SshTunnelManager)
    }
    #[cfg(not(feature = "ssh"))]
    {
        Arc::new(Unsupported)
    }
}

/// Used when the crate is built without SSH support
pub struct Unsupported;

#[async_trait]
impl TunnelManager for Unsupported {
    async fn open(
        &self,
        _spec: &TunnelSpec,
        _secret: Option<Secret>,
        _remote_host: &str,
        _remote_port: u16,
    ) -> Result<Box<dyn Tunnel>, TunnelError> {
        Err(TunnelError::new(
            TunnelFailure::Unsupported,
            "built without the `ssh` feature; rebuild with `--features ssh`",
        ))
    }
}

#[cfg(feature = "ssh")]
pub use ssh::SshTunnelManager;

#[cfg(feature = "ssh")]
mod ssh {
    use super::*;
    use parking_lot::Mutex;
    use ssh2::Session;
    use std::io::{Read, Write};
    use std::net::{TcpListener, TcpStream, ToSocketAddrs};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::thread;
    use std::time::Duration;
    use tracing::{debug, info, warn};

    const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
    const KEEPALIVE_SECS: u32 = 30;

    /// libssh2-backed tunnels, one forwarding thread per tunnel
    pub struct SshTunnelManager;

    #[async_trait]
    impl TunnelManager for SshTunnelManager {
        async fn open(
            &self,
            spec: &TunnelSpec,
            secret: Option<Secret>,
            remote_host: &str,
            remote_port: u16,
        ) -> Result<Box<dyn Tunnel>, TunnelError> {
            let spec = spec.clone();
            let remote_host = remote_host.to_string();
            let tunnel = tokio::task::spawn_blocking(move || {
                SshTunnel::establish(&spec, secret, remote_host, remote_port)
            })
            .await
            .map_err(|e| {
                TunnelError::new(TunnelFailure::ForwardingFailed, format!("tunnel task: {}", e))
            })??;
            Ok(Box::new(tunnel))
        }
    }

    struct Running {
        session: Session,
        is_running: Arc<AtomicBool>,
        forward_thread: Option<thread::JoinHandle<()>>,
    }

    impl Running {
        fn shutdown(mut self, local_port: u16) {
            info!(local_port, "closing SSH tunnel");
            self.is_running.store(false, Ordering::SeqCst);
            if let Some(handle) = self.forward_thread.take() {
                let _ = handle.join();
            }
            if let Err(e) = self.session.disconnect(None, "Tunnel closed", None) {
                warn!("error disconnecting SSH session: {}", e);
            }
            debug!("SSH tunnel closed");
        }
    }

    struct SshTunnel {
        local_port: u16,
        running: Mutex<Option<Running>>,
    }

    impl SshTunnel {
        fn establish(
            spec: &TunnelSpec,
            secret: Option<Secret>,
            remote_host: String,
            remote_port: u16,
        ) -> Result<Self, TunnelError> {
            info!(
                ssh_host = %spec.host,
                ssh_port = spec.port,
                remote_host = %remote_host,
                remote_port,
                "establishing SSH tunnel"
            );

            let unreachable = |e: std::io::Error| {
                TunnelError::with_source(
                    TunnelFailure::Unreachable,
                    format!("cannot reach {}:{}", spec.host, spec.port),
                    e,
                )
            };
            let addr = (spec.host.as_str(), spec.port)
                .to_socket_addrs()
                .map_err(unreachable)?
                .next()
                .ok_or_else(|| {
                    TunnelError::new(
                        TunnelFailure::Unreachable,
                        format!("{} did not resolve", spec.host),
                    )
                })?;
            let tcp = TcpStream::connect_timeout(&addr, CONNECT_TIMEOUT).map_err(unreachable)?;
            tcp.set_read_timeout(Some(CONNECT_TIMEOUT)).map_err(unreachable)?;
            tcp.set_write_timeout(Some(CONNECT_TIMEOUT)).map_err(unreachable)?;

            let handshake = |e: ssh2::Error| {
                TunnelError::with_source(TunnelFailure::HandshakeFailed, "SSH handshake failed", e)
            };
            let mut session = Session::new().map_err(handshake)?;
            session.set_tcp_stream(tcp);
            session.handshake().map_err(handshake)?;

            authenticate(&session, spec, secret.as_ref())?;
            session.set_keepalive(true, KEEPALIVE_SECS);

            let listener = TcpListener::bind(("127.0.0.1", spec.local_port)).map_err(|e| {
                TunnelError::with_source(
                    TunnelFailure::ForwardingFailed,
                    format!("cannot bind local port {}", spec.local_port),
                    e,
                )
            })?;
            let local_port = listener
                .local_addr()
                .map_err(|e| {
                    TunnelError::with_source(TunnelFailure::ForwardingFailed, "local address", e)
                })?
                .port();

            let is_running = Arc::new(AtomicBool::new(true));
            let forward_thread = start_forwarding_thread(
                listener,
                session.clone(),
                remote_host.clone(),
                remote_port,
                is_running.clone(),
            );

            info!(
                local_port,
                remote = format!("{}:{}", remote_host, remote_port),
                "SSH tunnel established"
            );

            Ok(Self {
                local_port,
                running: Mutex::new(Some(Running {
                    session,
                    is_running,
                    forward_thread: Some(forward_thread),
                })),
            })
        }
    }

    #[async_trait]
    impl Tunnel for SshTunnel {
        fn local_port(&self) -> u16 {
            self.local_port
        }

        async fn close(&self) {
            let Some(running) = self.running.lock().take() else {
                return;
            };
            let local_port = self.local_port;
            let _ = tokio::task::spawn_blocking(move || running.shutdown(local_port)).await;
        }
    }

    impl Drop for SshTunnel {
        fn drop(&mut self) {
            if let Some(running) = self.running.get_mut().take() {
                running.shutdown(self.local_port);
            }
        }
    }

    fn authenticate(
        session: &Session,
        spec: &TunnelSpec,
        secret: Option<&Secret>,
    ) -> Result<(), TunnelError> {
        let auth_failed = |e: ssh2::Error| {
            TunnelError::with_source(
                TunnelFailure::AuthFailed,
                format!("SSH authentication as {} failed", spec.username),
                e,
            )
        };
        match &spec.auth {
            TunnelAuth::Password => {
                debug!("authenticating with password");
                let password = secret.map(Secret::expose).unwrap_or_default();
                session
                    .userauth_password(&spec.username, password)
                    .map_err(auth_failed)?;
            }
            TunnelAuth::Key { key_path } => {
                debug!(path = %key_path.display(), "authenticating with private key");
                if !key_path.exists() {
                    return Err(TunnelError::new(
                        TunnelFailure::AuthFailed,
                        format!("private key not found: {}", key_path.display()),
                    ));
                }
                session
                    .userauth_pubkey_file(
                        &spec.username,
                        None,
                        key_path,
                        secret.map(Secret::expose),
                    )
                    .map_err(auth_failed)?;
            }
        }

        if !session.authenticated() {
            return Err(TunnelError::new(
                TunnelFailure::AuthFailed,
                "authentication not confirmed",
            ));
        }
        Ok(())
    }

    fn start_forwarding_thread(
        listener: TcpListener,
        session: Session,
        remote_host: String,
        remote_port: u16,
        is_running: Arc<AtomicBool>,
    ) -> thread::JoinHandle<()> {
        thread::spawn(move || {
            if let Err(e) = listener.set_nonblocking(true) {
                warn!("cannot make tunnel listener non-blocking: {}", e);
                return;
            }

            while is_running.load(Ordering::SeqCst) {
                match listener.accept() {
                    Ok((local_stream, _)) => {
                        let session = session.clone();
                        let remote_host = remote_host.clone();
                        let is_running = is_running.clone();
                        thread::spawn(move || {
                            if let Err(e) = forward(
                                local_stream,
                                &session,
                                &remote_host,
                                remote_port,
                                &is_running,
                            ) {
                                debug!("tunnel connection ended: {}", e);
                            }
                        });
                    }
                    Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                        thread::sleep(Duration::from_millis(10));
                    }
                    Err(e) => {
                        if is_running.load(Ordering::SeqCst) {
                            warn!("error accepting tunnel connection: {}", e);
                        }
                        break;
                    }
                }
            }
            debug!("port forwarding thread exiting");
        })
    }

    /// Pump bytes between one local client and a direct-tcpip channel
    fn forward(
        mut local_stream: TcpStream,
        session: &Session,
        remote_host: &str,
        remote_port: u16,
        is_running: &AtomicBool,
    ) -> std::io::Result<()> {
        local_stream.set_nonblocking(false)?;
        local_stream.set_read_timeout(Some(Duration::from_millis(100)))?;

        let mut channel = session
            .channel_direct_tcpip(remote_host, remote_port, None)
            .map_err(std::io::Error::other)?;
        session.set_blocking(false);

        let mut local_buf = [0u8; 8192];
        let mut remote_buf = [0u8; 8192];

        while is_running.load(Ordering::SeqCst) {
            let mut activity = false;

            match local_stream.read(&mut local_buf) {
                Ok(0) => break,
                Ok(n) => {
                    session.set_blocking(true);
                    channel.write_all(&local_buf[..n])?;
                    session.set_blocking(false);
                    activity = true;
                }
                Err(ref e)
                    if matches!(
                        e.kind(),
                        std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
                    ) => {}
                Err(e) => return Err(e),
            }

            match channel.read(&mut remote_buf) {
                Ok(0) => {
                    if channel.eof() {
                        break;
                    }
                }
                Ok(n) => {
                    local_stream.write_all(&remote_buf[..n])?;
                    activity = true;
                }
                Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => {}
                Err(e) => return Err(e),
            }

            if !activity {
                thread::sleep(Duration::from_millis(1));
            }
        }

        session.set_blocking(true);
        let _ = channel.send_eof();
        let _ = channel.wait_close();
        Ok(())
    }
}
