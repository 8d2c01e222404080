//! Per-connection session: the tunnel protocol state machine.
//!
//! A session owns its TLS stream and a streaming frame buffer. It moves
//! through Connected → Authenticating → Authenticated → Active, then
//! Disconnecting → Disconnected on any exit path. All stream writes go
//! through the session so the sent counter covers full wire bytes; every
//! read increments the received counter by the segment length.
//!
//! Generic over the stream type: production hands in a TLS stream, tests
//! an in-memory duplex pipe.

use super::registry::{SessionHandle, SessionState};
use super::{
    generate_session_id, ServerState, IDLE_TIMEOUT, KEEPALIVE_CHECK_INTERVAL,
    KEEPALIVE_PROBE_AFTER, SESSION_CHANNEL_DEPTH,
};
use crate::protocol::{
    self, encode, AuthRequest, AuthResponse, ConfigPush, ErrorPayload, FrameBuffer, Message,
    MessageType, MAX_PAYLOAD,
};
use crate::server::router::IPV4_HEADER_LEN;
use anyhow::{bail, Context, Result};
use bytes::Bytes;
use serde::Serialize;
use std::net::Ipv4Addr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{broadcast, mpsc};
use tokio::time::{interval, timeout, Duration, MissedTickBehavior};
use tracing::{debug, info, trace, warn};

/// Read buffer size for the session input loop
const READ_BUF_LEN: usize = 8 * 1024;

/// Bound on the final DISCONNECT/close exchange during teardown
const CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

/// One client connection from TLS accept to teardown
pub struct Session<S> {
    stream: S,
    state: SessionState,
    handle: Arc<SessionHandle>,
    server: Arc<ServerState>,
    frames: FrameBuffer,
    data_rx: Option<mpsc::Receiver<Bytes>>,
    shutdown: Option<broadcast::Receiver<()>>,
    assigned_ip: Option<Ipv4Addr>,
    user_id: Option<i64>,
    record_id: Option<String>,
}

impl<S> Session<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    pub fn new(
        stream: S,
        peer_addr: String,
        server: Arc<ServerState>,
        shutdown: broadcast::Receiver<()>,
    ) -> Self {
        let (data_tx, data_rx) = mpsc::channel(SESSION_CHANNEL_DEPTH);
        let handle = Arc::new(SessionHandle::new(
            generate_session_id(),
            peer_addr,
            data_tx,
        ));
        Self {
            stream,
            state: SessionState::Connected,
            handle,
            server,
            frames: FrameBuffer::new(MAX_PAYLOAD),
            data_rx: Some(data_rx),
            shutdown: Some(shutdown),
            assigned_ip: None,
            user_id: None,
            record_id: None,
        }
    }

    /// Shared handle for registry indexing and router delivery
    pub fn handle(&self) -> Arc<SessionHandle> {
        self.handle.clone()
    }

    /// Drive the session to completion, then release everything it held.
    ///
    /// Cleanup runs on every exit path: client disconnect, idle timeout,
    /// framing errors, transport errors, and supervisor shutdown.
    pub async fn run(mut self) {
        debug!(session = %self.handle.id, peer = %self.handle.peer_addr, "session started");

        if let Err(e) = self.drive().await {
            warn!(session = %self.handle.id, %e, "session closing on error");
        }

        self.teardown().await;
    }

    async fn drive(&mut self) -> Result<()> {
        let mut data_rx = self.data_rx.take().expect("session driven once");
        let mut shutdown = self.shutdown.take().expect("session driven once");
        let mut read_buf = vec![0u8; READ_BUF_LEN];
        let mut idle_check = interval(KEEPALIVE_CHECK_INTERVAL);
        idle_check.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                read = self.stream.read(&mut read_buf) => {
                    match read.context("reading TLS stream")? {
                        0 => {
                            debug!(session = %self.handle.id, "peer closed the stream");
                            return Ok(());
                        }
                        n => {
                            self.handle.stats.add_received(n);
                            self.handle.stats.touch();
                            self.frames.extend(&read_buf[..n]);
                            let messages = self.frames.drain()?;
                            for message in messages {
                                self.handle_message(message).await?;
                                if self.state == SessionState::Disconnecting {
                                    return Ok(());
                                }
                            }
                        }
                    }
                }

                packet = data_rx.recv() => {
                    let Some(packet) = packet else {
                        bail!("session packet channel closed");
                    };
                    self.send_frame(MessageType::DataPacket, &packet).await?;
                }

                _ = idle_check.tick() => {
                    let idle = self.handle.stats.idle();
                    if idle >= IDLE_TIMEOUT {
                        info!(session = %self.handle.id, idle_secs = idle.as_secs(), "idle timeout");
                        self.send_json(
                            MessageType::Error,
                            &ErrorPayload {
                                code: protocol::error_code::SESSION_TIMEOUT,
                                message: "Session timed out".into(),
                            },
                        )
                        .await
                        .ok();
                        return Ok(());
                    }
                    if idle >= KEEPALIVE_PROBE_AFTER && self.state == SessionState::Active {
                        self.send_frame(MessageType::Keepalive, &[]).await?;
                    }
                }

                _ = shutdown.recv() => {
                    debug!(session = %self.handle.id, "supervisor shutdown");
                    return Ok(());
                }
            }
        }
    }

    async fn handle_message(&mut self, message: Message) -> Result<()> {
        let Some(kind) = message.kind() else {
            if MessageType::is_control_tag(message.tag) {
                warn!(session = %self.handle.id, tag = message.tag, "unknown control message ignored");
            } else {
                debug!(session = %self.handle.id, tag = message.tag, "unknown data frame dropped");
            }
            return Ok(());
        };

        match (self.state, kind) {
            (SessionState::Connected, MessageType::AuthRequest) => {
                self.handle_auth_request(&message.payload).await
            }
            // Data before authentication is dropped without comment
            (SessionState::Connected, MessageType::DataPacket) => Ok(()),
            (SessionState::Connected, other) => {
                warn!(session = %self.handle.id, ?other, "control message before authentication dropped");
                Ok(())
            }

            (SessionState::Active, MessageType::DataPacket) => {
                self.forward_packet(message.payload).await;
                Ok(())
            }
            (SessionState::Active, MessageType::Keepalive) => {
                self.send_frame(MessageType::KeepaliveAck, &[]).await?;
                if let Some(record_id) = &self.record_id {
                    if let Err(e) = self.server.auth.update_session_activity(record_id).await {
                        warn!(session = %self.handle.id, %e, "activity update failed");
                    }
                }
                Ok(())
            }
            // Ack for a server-initiated probe; the read path already
            // reset the idle clock
            (SessionState::Active, MessageType::KeepaliveAck) => Ok(()),
            (SessionState::Active, MessageType::Disconnect) => {
                info!(session = %self.handle.id, "client disconnect");
                self.state = SessionState::Disconnecting;
                Ok(())
            }
            (SessionState::Active, MessageType::AuthRequest) => {
                bail!("AUTH_REQUEST on an authenticated session")
            }
            (state, other) => {
                warn!(session = %self.handle.id, ?state, ?other, "unexpected message ignored");
                Ok(())
            }
        }
    }

    /// Authenticate, lease an address, persist the session, and push the
    /// tunnel configuration.
    async fn handle_auth_request(&mut self, payload: &[u8]) -> Result<()> {
        self.state = SessionState::Authenticating;
        self.handle.set_state(SessionState::Authenticating);

        let request: AuthRequest =
            serde_json::from_slice(payload).context("parsing AUTH_REQUEST payload")?;

        let peer = self.handle.peer_addr.clone();
        let grant = match self
            .server
            .auth
            .authenticate(&request.username, &request.password, &request.platform, &peer)
            .await
        {
            Ok(grant) => grant,
            Err(e) => {
                info!(session = %self.handle.id, username = %request.username, %e, "authentication rejected");
                self.send_json(MessageType::AuthResponse, &AuthResponse::denied(e.to_string()))
                    .await?;
                self.state = SessionState::Disconnecting;
                return Ok(());
            }
        };

        let assigned = { self.server.pool.lock().await.allocate() };
        let Some(ip) = assigned else {
            warn!(session = %self.handle.id, username = %request.username, "IP pool exhausted");
            self.server
                .auth
                .record_error(
                    Some(grant.user_id),
                    &peer,
                    Some(&request.platform),
                    "IP pool exhausted",
                )
                .await;
            self.send_json(
                MessageType::AuthResponse,
                &AuthResponse::denied("No available IP addresses"),
            )
            .await?;
            self.state = SessionState::Disconnecting;
            return Ok(());
        };

        let record_id = match self
            .server
            .auth
            .create_session(
                grant.user_id,
                ip,
                &request.platform,
                &peer,
                &request.client_version,
            )
            .await
        {
            Ok(record_id) => record_id,
            Err(e) => {
                warn!(session = %self.handle.id, %e, "session persistence failed");
                self.server.pool.lock().await.release(ip);
                self.send_json(
                    MessageType::AuthResponse,
                    &AuthResponse::denied("Internal server error"),
                )
                .await?;
                self.state = SessionState::Disconnecting;
                return Ok(());
            }
        };

        self.assigned_ip = Some(ip);
        self.user_id = Some(grant.user_id);
        self.record_id = Some(record_id.clone());
        self.handle.set_record_id(Some(record_id));
        self.state = SessionState::Authenticated;
        self.handle.set_state(SessionState::Authenticated);

        self.send_json(MessageType::AuthResponse, &AuthResponse::granted(grant.token))
            .await?;

        let push = {
            let config = &self.server.config;
            ConfigPush {
                assigned_ip: ip,
                subnet_mask: config.netmask,
                gateway: config.gateway,
                dns: config.dns.clone(),
                mtu: config.mtu,
                keepalive_interval: config.keepalive_interval,
            }
        };
        self.send_json(MessageType::ConfigPush, &push).await?;

        // Entering Active: from here the router can deliver inbound packets
        self.server
            .registry
            .bind_ip(&self.handle.id, ip)
            .await
            .context("binding assigned address")?;
        self.state = SessionState::Active;

        info!(
            session = %self.handle.id,
            username = %request.username,
            assigned_ip = %ip,
            platform = %request.platform,
            "session active"
        );
        Ok(())
    }

    /// Hand a client datagram to the router (client → internet direction)
    async fn forward_packet(&mut self, packet: Bytes) {
        if packet.len() < IPV4_HEADER_LEN {
            trace!(session = %self.handle.id, len = packet.len(), "runt data packet dropped");
            return;
        }
        let Some(ip) = self.assigned_ip else {
            return;
        };
        if self.server.to_tun.send((ip, packet)).await.is_err() {
            warn!(session = %self.handle.id, "router channel closed, packet dropped");
        }
    }

    /// Write one frame; the sent counter covers header plus payload
    async fn send_frame(&mut self, kind: MessageType, payload: &[u8]) -> Result<()> {
        let wire = encode(kind, payload)?;
        self.stream
            .write_all(&wire)
            .await
            .context("writing TLS stream")?;
        self.stream.flush().await.context("flushing TLS stream")?;
        self.handle.stats.add_sent(wire.len());
        Ok(())
    }

    async fn send_json<T: Serialize>(&mut self, kind: MessageType, payload: &T) -> Result<()> {
        let body = serde_json::to_vec(payload).context("encoding control payload")?;
        self.send_frame(kind, &body).await
    }

    /// Orderly release: DISCONNECT if the stream still writes, close the
    /// stream, release the address lease, flush counters to the store,
    /// and leave the registry.
    async fn teardown(&mut self) {
        self.state = SessionState::Disconnecting;
        self.handle.set_state(SessionState::Disconnecting);

        let _ = timeout(CLOSE_TIMEOUT, async {
            let _ = self.send_frame(MessageType::Disconnect, &[]).await;
            let _ = self.stream.shutdown().await;
        })
        .await;

        if let Some(ip) = self.assigned_ip.take() {
            self.server.pool.lock().await.release(ip);
        }

        if let Some(record_id) = self.record_id.take() {
            let sent = self.handle.stats.bytes_sent();
            let received = self.handle.stats.bytes_received();
            if let Err(e) = self
                .server
                .auth
                .update_session_stats(&record_id, sent, received)
                .await
            {
                warn!(session = %self.handle.id, %e, "final stats flush failed");
            }
            if let Err(e) = self.server.auth.end_session(&record_id).await {
                warn!(session = %self.handle.id, %e, "session row removal failed");
            }
        }

        self.server.registry.unregister(&self.handle.id).await;
        self.handle.set_state(SessionState::Disconnected);

        info!(
            session = %self.handle.id,
            peer = %self.handle.peer_addr,
            user_id = self.user_id,
            bytes_sent = self.handle.stats.bytes_sent(),
            bytes_received = self.handle.stats.bytes_received(),
            "session closed"
        );
    }
}
