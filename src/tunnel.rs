//! SSH tunnel to the remote broker host.
//!
//! A [`SshTunnel`] authenticates with a private key, trusts the host key on
//! first use (recording it in a `known_hosts` file), and forwards a local TCP
//! port to a service on the remote host's loopback interface. Every accepted
//! local connection gets its own `direct-tcpip` channel.
//!
//! ```text
//! 127.0.0.1:<local> ──▶ ssh session ──▶ <target_host>:<target_port> (remote)
//! ```
//!
//! Nothing here retries. Failures surface to the caller, which owns the
//! reconnect policy.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use russh::client::{self, Handle};
use russh::Disconnect;
use russh_keys::key::PublicKey;
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum TunnelError {
    #[error("failed to load private key {path}: {source}")]
    Key {
        path: PathBuf,
        #[source]
        source: russh_keys::Error,
    },

    #[error("host key for {host} does not match known_hosts line {line}")]
    HostKeyChanged { host: String, line: usize },

    #[error("known_hosts check failed: {0}")]
    KnownHosts(#[source] russh_keys::Error),

    #[error("cannot create {path}: {source}")]
    KnownHostsDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("ssh: {0}")]
    Ssh(#[from] russh::Error),

    #[error("authentication rejected for {username}@{host}")]
    AuthRejected { username: String, host: String },

    #[error("cannot forward local port {port}: {source}")]
    Forward {
        port: u16,
        #[source]
        source: std::io::Error,
    },

    #[error("tunnel is not open")]
    NotOpen,

    #[error("tunnel transport dropped")]
    Dropped,
}

/// Where to connect and who to authenticate as.
#[derive(Debug, Clone)]
pub struct TunnelTarget {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub key_file: PathBuf,
    pub known_hosts: PathBuf,
}

/// A live tunnel as seen by the ingestion loop.
#[async_trait]
pub trait Tunnel: Send {
    /// Local port that proxies to the remote service, once forwarding is up.
    fn local_port(&self) -> Option<u16>;

    /// Whether the underlying transport is still alive.
    fn is_active(&self) -> bool;

    /// Release the transport and all forwarded channels. Safe to repeat.
    async fn close(&mut self);
}

/// Host key verification: trust on first use.
struct HostTrust {
    host: String,
    port: u16,
    known_hosts: PathBuf,
}

#[async_trait]
impl client::Handler for HostTrust {
    type Error = TunnelError;

    async fn check_server_key(
        &mut self,
        server_public_key: &PublicKey,
    ) -> Result<bool, Self::Error> {
        match russh_keys::check_known_hosts_path(
            &self.host,
            self.port,
            server_public_key,
            &self.known_hosts,
        ) {
            Ok(true) => Ok(true),
            Ok(false) => {
                info!(
                    host = %self.host,
                    known_hosts = %self.known_hosts.display(),
                    "learning new host key"
                );
                if let Some(parent) = self.known_hosts.parent() {
                    std::fs::create_dir_all(parent).map_err(|source| {
                        TunnelError::KnownHostsDir {
                            path: parent.to_path_buf(),
                            source,
                        }
                    })?;
                }
                russh_keys::learn_known_hosts_path(
                    &self.host,
                    self.port,
                    server_public_key,
                    &self.known_hosts,
                )
                .map_err(TunnelError::KnownHosts)?;
                Ok(true)
            }
            Err(russh_keys::Error::KeyChanged { line }) => Err(TunnelError::HostKeyChanged {
                host: self.host.clone(),
                line,
            }),
            Err(e) => Err(TunnelError::KnownHosts(e)),
        }
    }
}

/// An authenticated SSH session with at most one local port forward.
pub struct SshTunnel {
    target: TunnelTarget,
    session: Option<Arc<Handle<HostTrust>>>,
    forwarder: Option<JoinHandle<()>>,
    local_port: Option<u16>,
}

impl SshTunnel {
    /// Connect and authenticate to the remote host.
    pub async fn open(target: TunnelTarget) -> Result<Self, TunnelError> {
        let key = russh_keys::load_secret_key(&target.key_file, None).map_err(|source| {
            TunnelError::Key {
                path: target.key_file.clone(),
                source,
            }
        })?;

        let config = Arc::new(client::Config::default());
        let handler = HostTrust {
            host: target.host.clone(),
            port: target.port,
            known_hosts: target.known_hosts.clone(),
        };

        info!(
            "Connecting to {}@{}:{}",
            target.username, target.host, target.port
        );
        let mut session =
            client::connect(config, (target.host.as_str(), target.port), handler).await?;

        let authenticated = session
            .authenticate_publickey(target.username.clone(), Arc::new(key))
            .await?;
        if !authenticated {
            return Err(TunnelError::AuthRejected {
                username: target.username.clone(),
                host: target.host.clone(),
            });
        }
        info!("Connected to {}", target.host);

        Ok(Self {
            target,
            session: Some(Arc::new(session)),
            forwarder: None,
            local_port: None,
        })
    }

    /// Forward `127.0.0.1:<local_port>` to `target_host:target_port` as seen
    /// from the remote host. Pass 0 to let the OS pick a free port. Returns
    /// the bound local port.
    pub async fn forward_local_port(
        &mut self,
        local_port: u16,
        target_host: &str,
        target_port: u16,
    ) -> Result<u16, TunnelError> {
        let session = self.session.clone().ok_or(TunnelError::NotOpen)?;

        let listener = TcpListener::bind(("127.0.0.1", local_port))
            .await
            .map_err(|source| TunnelError::Forward {
                port: local_port,
                source,
            })?;
        let bound = listener
            .local_addr()
            .map_err(|source| TunnelError::Forward {
                port: local_port,
                source,
            })?
            .port();

        if let Some(previous) = self.forwarder.take() {
            previous.abort();
        }

        let target_host = target_host.to_string();
        info!(
            "Forwarding 127.0.0.1:{} -> {}:{} via {}",
            bound, target_host, target_port, self.target.host
        );
        self.forwarder = Some(tokio::spawn(accept_loop(
            listener,
            session,
            target_host,
            target_port,
        )));
        self.local_port = Some(bound);
        Ok(bound)
    }
}

async fn accept_loop(
    listener: TcpListener,
    session: Arc<Handle<HostTrust>>,
    target_host: String,
    target_port: u16,
) {
    // Dropping the set (task abort or exit) aborts every proxied connection.
    let mut proxies = JoinSet::new();
    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                warn!("port forward accept failed: {}", e);
                break;
            }
        };
        if session.is_closed() {
            break;
        }
        while proxies.try_join_next().is_some() {}
        proxies.spawn(proxy(
            stream,
            peer,
            session.clone(),
            target_host.clone(),
            target_port,
        ));
    }
}

async fn proxy(
    mut local: TcpStream,
    peer: SocketAddr,
    session: Arc<Handle<HostTrust>>,
    target_host: String,
    target_port: u16,
) {
    let channel = match session
        .channel_open_direct_tcpip(
            target_host.clone(),
            u32::from(target_port),
            peer.ip().to_string(),
            u32::from(peer.port()),
        )
        .await
    {
        Ok(channel) => channel,
        Err(e) => {
            warn!(
                "cannot open channel to {}:{}: {}",
                target_host, target_port, e
            );
            return;
        }
    };

    let mut remote = channel.into_stream();
    match tokio::io::copy_bidirectional(&mut local, &mut remote).await {
        Ok((up, down)) => debug!(%peer, up, down, "forwarded connection closed"),
        Err(e) => debug!(%peer, "forwarded connection ended: {}", e),
    }
}

#[async_trait]
impl Tunnel for SshTunnel {
    fn local_port(&self) -> Option<u16> {
        self.local_port
    }

    fn is_active(&self) -> bool {
        let transport_up = self.session.as_ref().is_some_and(|s| !s.is_closed());
        let forwarding_up = self.forwarder.as_ref().map_or(true, |f| !f.is_finished());
        transport_up && forwarding_up
    }

    async fn close(&mut self) {
        if let Some(forwarder) = self.forwarder.take() {
            forwarder.abort();
        }
        self.local_port = None;
        if let Some(session) = self.session.take() {
            if let Err(e) = session
                .disconnect(Disconnect::ByApplication, "", "English")
                .await
            {
                debug!("ssh disconnect: {}", e);
            }
            info!("Shutdown ssh connection to {}", self.target.host);
        }
    }
}
