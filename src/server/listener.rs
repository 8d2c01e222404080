//! Listener and supervisor.
//!
//! Accepts TLS connections and spawns one session task per stream. Also
//! owns the TUN device and router tasks, runs the periodic stale-session
//! sweeper, and coordinates orderly shutdown on SIGINT/SIGTERM: stop
//! accepting, broadcast disconnect to every session, wait a bounded grace
//! period, then stop the router and release the TUN interface.

use super::router::{tun_reader_task, tun_writer_task};
use super::session::Session;
use super::{ServerState, SHUTDOWN_GRACE, STALE_SESSION_MINUTES, SWEEP_INTERVAL, TO_TUN_CHANNEL_DEPTH};
use crate::auth::AuthService;
use crate::config::Config;
use crate::store::Store;
use crate::tun::{self, RoutingState, TunIf};
use anyhow::{Context, Result};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc};
use tokio::time::{sleep, Duration};
use tracing::{debug, error, info, warn};

/// The assembled VPN server
pub struct VpnServer {
    state: Arc<ServerState>,
    shutdown_tx: broadcast::Sender<()>,
}

impl VpnServer {
    /// Wire up shared state over the given repository.
    ///
    /// Returns the server plus the receiving end of the session-to-TUN
    /// channel, which `run` hands to the router.
    pub fn new(
        config: Arc<Config>,
        store: Arc<dyn Store>,
    ) -> (Self, mpsc::Receiver<super::OutboundPacket>) {
        let (to_tun_tx, to_tun_rx) = mpsc::channel(TO_TUN_CHANNEL_DEPTH);
        let auth = AuthService::new(store, &config.jwt_secret);
        let state = Arc::new(ServerState::new(config, auth, to_tun_tx));
        let (shutdown_tx, _) = broadcast::channel(1);
        (Self { state, shutdown_tx }, to_tun_rx)
    }

    pub fn state(&self) -> Arc<ServerState> {
        self.state.clone()
    }

    /// Request orderly shutdown from outside the signal handlers
    pub fn shutdown_handle(&self) -> broadcast::Sender<()> {
        self.shutdown_tx.clone()
    }

    /// Run until a termination signal arrives.
    ///
    /// Process-scope failures (cannot bind, cannot open the TUN device,
    /// unreadable TLS material) abort startup.
    pub async fn run(self, to_tun_rx: mpsc::Receiver<super::OutboundPacket>) -> Result<()> {
        let config = self.state.config.clone();

        // TLS material
        let certs = super::tls::load_certs(&config.tls_cert)?;
        let key = super::tls::load_key(&config.tls_key)?;
        let acceptor = super::tls::build_acceptor(certs, key)?;

        // TUN device with egress plumbing
        let mut routing = RoutingState::new();
        let mut tun = TunIf::kernel(&config.tun_name, config.mtu).context("opening TUN device")?;
        tun.assign_ip(
            config.gateway,
            config.netmask,
            config.outbound_iface.as_deref(),
            &mut routing,
        )?;
        let (tun_reader, tun_writer) = tun.split();

        // Router tasks
        let reader_task = tokio::spawn(tun_reader_task(
            tun_reader,
            self.state.registry.clone(),
        ));
        let writer_task = tokio::spawn(tun_writer_task(
            tun_writer,
            to_tun_rx,
            config.anti_spoof,
        ));

        // Stale-session sweeper
        let sweeper_state = self.state.clone();
        let mut sweeper_shutdown = self.shutdown_tx.subscribe();
        let sweeper_task = tokio::spawn(async move {
            let mut tick = tokio::time::interval(SWEEP_INTERVAL);
            tick.tick().await; // skip the immediate first fire
            loop {
                tokio::select! {
                    _ = tick.tick() => {
                        match sweeper_state
                            .auth
                            .cleanup_stale_sessions(STALE_SESSION_MINUTES)
                            .await
                        {
                            Ok(0) => {}
                            Ok(removed) => info!(removed, "stale sessions swept"),
                            Err(e) => warn!(%e, "stale-session sweep failed"),
                        }
                        let stats = sweeper_state.pool.lock().await.stats();
                        let live_sessions = sweeper_state.registry.len().await;
                        debug!(
                            pool_used = stats.used,
                            pool_capacity = stats.capacity,
                            live_sessions,
                            "sweep pass"
                        );
                    }
                    _ = sweeper_shutdown.recv() => break,
                }
            }
        });

        // Accept loop
        let listener = TcpListener::bind(config.listen_addr())
            .await
            .with_context(|| format!("binding {}", config.listen_addr()))?;
        info!(addr = %config.listen_addr(), tun = %config.tun_name, "VPN server listening");

        let shutdown = shutdown_signal();
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    let (tcp, peer) = match accepted {
                        Ok(pair) => pair,
                        Err(e) => {
                            warn!(%e, "accept failed");
                            continue;
                        }
                    };
                    tcp.set_nodelay(true).ok();

                    let acceptor = acceptor.clone();
                    let state = self.state.clone();
                    let shutdown_rx = self.shutdown_tx.subscribe();
                    tokio::spawn(async move {
                        match acceptor.accept(tcp).await {
                            Ok(stream) => {
                                let session =
                                    Session::new(stream, peer.to_string(), state.clone(), shutdown_rx);
                                state.registry.register(session.handle()).await;
                                session.run().await;
                            }
                            Err(e) => debug!(%peer, %e, "TLS handshake failed"),
                        }
                    });
                }

                _ = &mut shutdown => {
                    info!("shutdown signal received");
                    break;
                }
            }
        }

        // Orderly shutdown: no new accepts past this point
        drop(listener);
        let _ = self.shutdown_tx.send(());

        let deadline = tokio::time::Instant::now() + SHUTDOWN_GRACE;
        while !self.state.registry.is_empty().await && tokio::time::Instant::now() < deadline {
            sleep(Duration::from_millis(50)).await;
        }

        // Hard-close stragglers: flush their stats and release their leases
        for handle in self.state.registry.all().await {
            warn!(session = %handle.id, "session did not drain, hard-closing");
            if let Some(ip) = handle.assigned_ip() {
                self.state.pool.lock().await.release(ip);
            }
            if let Some(record_id) = handle.record_id() {
                let _ = self
                    .state
                    .auth
                    .update_session_stats(
                        &record_id,
                        handle.stats.bytes_sent(),
                        handle.stats.bytes_received(),
                    )
                    .await;
                let _ = self.state.auth.end_session(&record_id).await;
            }
            self.state.registry.unregister(&handle.id).await;
        }

        sweeper_task.abort();
        reader_task.abort();
        writer_task.abort();
        tun::destroy(&mut routing);

        info!("VPN server stopped");
        Ok(())
    }
}

/// Resolve on SIGINT or SIGTERM
async fn shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let ctrl_c = tokio::signal::ctrl_c();
    let mut term = match signal(SignalKind::terminate()) {
        Ok(term) => term,
        Err(e) => {
            error!(%e, "cannot install SIGTERM handler");
            let _ = ctrl_c.await;
            return;
        }
    };

    tokio::select! {
        _ = ctrl_c => {}
        _ = term.recv() => {}
    }
}
