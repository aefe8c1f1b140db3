//! The Waypost node: listeners, shared state and the accept loops.

use crate::connection::run_connection;
use crate::directory::ProfileDirectory;
use crate::error::{KernelError, KernelResult};
use crate::supervisor::Supervisor;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, info, warn};
use waypost_relay::{ConnectionId, RelayEngine, RelayLimits};
use waypost_types::config::{NodeConfig, ServerRole};
use waypost_types::identity::NodeKeys;
use waypost_wire::message::RoleInfo;

/// State shared by every connection of a node.
pub struct NodeState {
    pub config: NodeConfig,
    pub keys: NodeKeys,
    pub relay: RelayEngine,
    pub directory: ProfileDirectory,
    pub supervisor: Supervisor,
    /// Roles as reported by `ListRoles`, with the ports actually bound.
    pub roles: Vec<RoleInfo>,
    next_conn: AtomicU64,
}

impl NodeState {
    fn next_connection_id(&self) -> ConnectionId {
        ConnectionId(self.next_conn.fetch_add(1, Ordering::Relaxed) + 1)
    }
}

struct BoundListener {
    listener: TcpListener,
    roles: Arc<[ServerRole]>,
    addr: SocketAddr,
}

/// A running node.
pub struct Node {
    state: Arc<NodeState>,
    addrs: Vec<(Arc<[ServerRole]>, SocketAddr)>,
    accept_tasks: Vec<JoinHandle<()>>,
}

impl Node {
    /// Bind every configured listener and start accepting.
    ///
    /// `tls` is required as soon as one listener carries an encrypted role.
    pub async fn start(
        config: NodeConfig,
        keys: NodeKeys,
        tls: Option<TlsAcceptor>,
    ) -> KernelResult<Self> {
        config
            .validate_listeners()
            .map_err(|e| KernelError::BootFailed(e.to_string()))?;
        if config.needs_tls() && tls.is_none() {
            return Err(KernelError::BootFailed(
                "encrypted roles are configured but no TLS certificate is set. \
                 Set [tls] cert_path and key_path in config.toml"
                    .into(),
            ));
        }

        let mut bound = Vec::with_capacity(config.listeners.len());
        for listener_config in &config.listeners {
            let bind_addr = format!("{}:{}", config.listen_host, listener_config.port);
            let listener = TcpListener::bind(&bind_addr).await.map_err(|e| {
                KernelError::BootFailed(format!("cannot listen on {bind_addr}: {e}"))
            })?;
            let addr = listener.local_addr()?;
            let roles: Arc<[ServerRole]> = listener_config.roles.clone().into();
            info!(%addr, roles = ?roles, "Listening");
            bound.push(BoundListener {
                listener,
                roles,
                addr,
            });
        }

        let mut roles: Vec<RoleInfo> = bound
            .iter()
            .flat_map(|b| {
                b.roles.iter().map(|role| RoleInfo {
                    role: *role,
                    port: b.addr.port(),
                    is_tcp: true,
                    is_tls: role.is_encrypted(),
                })
            })
            .collect();
        roles.sort_by_key(|r| r.role);

        let state = Arc::new(NodeState {
            relay: RelayEngine::new(RelayLimits::from(&config.limits)),
            directory: ProfileDirectory::new(config.hosting.max_hosted_identities),
            supervisor: Supervisor::new(),
            roles,
            next_conn: AtomicU64::new(0),
            keys,
            config,
        });
        info!(identity = %state.keys.identity_id(), "Node started");

        let addrs = bound.iter().map(|b| (b.roles.clone(), b.addr)).collect();
        let accept_tasks = bound
            .into_iter()
            .map(|b| {
                let acceptor = b
                    .roles
                    .first()
                    .is_some_and(|r| r.is_encrypted())
                    .then(|| tls.clone())
                    .flatten();
                tokio::spawn(accept_loop(b.listener, b.roles, acceptor, state.clone()))
            })
            .collect();

        Ok(Self {
            state,
            addrs,
            accept_tasks,
        })
    }

    /// Address of the listener serving `role`.
    pub fn local_addr(&self, role: ServerRole) -> Option<SocketAddr> {
        self.addrs
            .iter()
            .find(|(roles, _)| roles.contains(&role))
            .map(|(_, addr)| *addr)
    }

    /// Shared node state.
    pub fn state(&self) -> &Arc<NodeState> {
        &self.state
    }

    /// The profile directory.
    pub fn directory(&self) -> &ProfileDirectory {
        &self.state.directory
    }

    /// Ask listeners and connections to stop.
    pub fn shutdown(&self) {
        self.state.supervisor.shutdown();
    }

    /// Wait until every accept loop has stopped.
    pub async fn wait(self) {
        for task in self.accept_tasks {
            let _ = task.await;
        }
        info!("Node stopped");
    }
}

async fn accept_loop(
    listener: TcpListener,
    roles: Arc<[ServerRole]>,
    tls: Option<TlsAcceptor>,
    state: Arc<NodeState>,
) {
    let mut shutdown = state.supervisor.subscribe();
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    let conn = state.next_connection_id();
                    debug!(%conn, %peer, "Accepted connection");
                    tokio::spawn(serve(
                        stream,
                        peer,
                        conn,
                        roles.clone(),
                        tls.clone(),
                        state.clone(),
                    ));
                }
                Err(e) => {
                    warn!(error = %e, "Accept failed");
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            },
        }
    }
    debug!(roles = ?roles, "Accept loop stopped");
}

async fn serve(
    stream: TcpStream,
    peer: SocketAddr,
    conn: ConnectionId,
    roles: Arc<[ServerRole]>,
    tls: Option<TlsAcceptor>,
    state: Arc<NodeState>,
) {
    let _ticket = state.supervisor.connection_opened();
    let _ = stream.set_nodelay(true);

    let Some(acceptor) = tls else {
        run_connection(stream, conn, peer, roles, state).await;
        return;
    };

    // A handshake that stalls counts as an idle connection.
    let idle = Duration::from_secs(state.config.limits.idle_timeout_secs);
    match tokio::time::timeout(idle, acceptor.accept(stream)).await {
        Ok(Ok(tls_stream)) => run_connection(tls_stream, conn, peer, roles, state).await,
        Ok(Err(e)) => debug!(%conn, %peer, error = %e, "TLS handshake failed"),
        Err(_) => debug!(%conn, %peer, "TLS handshake timed out"),
    }
}
