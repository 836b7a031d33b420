//! Per-socket handler: framer, state machine, ACK policy, and the one-shot
//! command/reply correlator (component C).

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::{Buf, BytesMut};
use chrono::Utc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::broadcaster::{Broadcaster, DeviceEvent};
use crate::codec::{self, AlarmKind, Packet, START};
use crate::config::Config;
use crate::error::GatewayError;
use crate::identity::DeviceIdentity;
use crate::metrics::Metrics;
use crate::persistence::{DeviceOnlineStatus, Persistence};
use crate::registry::Registry;

const READ_CHUNK: usize = 1024;
const EVENT_QUEUE_DEPTH: usize = 8;
const INITIAL_SERVER_FLAG: u32 = 0xA000;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Result of a command round-trip, returned to the HTTP dispatcher.
#[derive(Debug, Clone)]
pub struct CommandOutcome {
    pub reply: Option<String>,
    pub server_flag: u32,
    pub note: Option<String>,
}

enum ConnectionEvent {
    SendCommand {
        content: String,
        reply: oneshot::Sender<Result<CommandOutcome, GatewayError>>,
    },
    ClearPending,
    Supersede,
    Shutdown,
}

/// Cheap, cloneable reference to a live connection's event queue. This is
/// what the registry stores and what the dispatcher calls into — never the
/// socket itself (§9: "the registry holds a weak/back reference").
#[derive(Clone)]
pub struct ConnectionHandle {
    pub id: u64,
    pub identity: DeviceIdentity,
    pub peer_addr: SocketAddr,
    tx: mpsc::Sender<ConnectionEvent>,
}

impl ConnectionHandle {
    pub async fn send_command(
        &self,
        content: String,
        timeout: Duration,
    ) -> Result<CommandOutcome, GatewayError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(ConnectionEvent::SendCommand {
                content,
                reply: reply_tx,
            })
            .await
            .map_err(|_| GatewayError::NotConnected)?;

        match tokio::time::timeout(timeout, reply_rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(GatewayError::Shutdown),
            Err(_) => {
                let _ = self.tx.try_send(ConnectionEvent::ClearPending);
                Ok(CommandOutcome {
                    reply: None,
                    server_flag: 0,
                    note: Some("no reply within timeout".to_string()),
                })
            }
        }
    }

    /// Evicts this connection. Best-effort: if the event queue is full the
    /// connection is already on its way out.
    pub fn supersede(&self) {
        let _ = self.tx.try_send(ConnectionEvent::Supersede);
    }

    pub fn shutdown(&self) {
        let _ = self.tx.try_send(ConnectionEvent::Shutdown);
    }
}

struct PendingCommand {
    reply_tx: oneshot::Sender<Result<CommandOutcome, GatewayError>>,
    server_flag: u32,
}

pub struct Connection<P: Persistence> {
    id: u64,
    peer_addr: SocketAddr,
    self_handle: ConnectionHandle,
    read_half: OwnedReadHalf,
    write_half: OwnedWriteHalf,
    read_buffer: BytesMut,
    identity: Option<DeviceIdentity>,
    device_row_id: Option<i64>,
    next_frame_serial: u16,
    next_server_flag: u32,
    pending: Option<PendingCommand>,
    events_rx: mpsc::Receiver<ConnectionEvent>,
    persistence: Arc<P>,
    registry: Registry,
    broadcaster: Broadcaster,
    config: Arc<Config>,
    metrics: Arc<Metrics>,
}

impl<P: Persistence + 'static> Connection<P> {
    #[allow(clippy::too_many_arguments)]
    pub fn spawn(
        socket: TcpStream,
        peer_addr: SocketAddr,
        persistence: Arc<P>,
        registry: Registry,
        broadcaster: Broadcaster,
        config: Arc<Config>,
        metrics: Arc<Metrics>,
    ) {
        let (read_half, write_half) = socket.into_split();
        let (tx, events_rx) = mpsc::channel(EVENT_QUEUE_DEPTH);
        let id = NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed);

        // identity is unknown until Login; the registry never sees this
        // handle until then. A placeholder identity is fine here because
        // only an authenticated handle is ever inserted into the registry.
        let placeholder = DeviceIdentity::from_bytes([0; 8]);
        let handle = ConnectionHandle {
            id,
            identity: placeholder,
            peer_addr,
            tx,
        };

        let connection = Connection {
            id,
            peer_addr,
            self_handle: handle,
            read_half,
            write_half,
            read_buffer: BytesMut::with_capacity(READ_CHUNK * 2),
            identity: None,
            device_row_id: None,
            next_frame_serial: 0,
            next_server_flag: INITIAL_SERVER_FLAG,
            pending: None,
            events_rx,
            persistence,
            registry,
            broadcaster,
            config,
            metrics,
        };

        tokio::spawn(connection.run());
    }

    async fn run(mut self) {
        let mut read_buf = vec![0u8; READ_CHUNK];
        loop {
            tokio::select! {
                biased;

                event = self.events_rx.recv() => {
                    match event {
                        Some(ConnectionEvent::SendCommand { content, reply }) => {
                            self.handle_send_command(content, reply).await;
                        }
                        Some(ConnectionEvent::ClearPending) => {
                            self.pending = None;
                        }
                        Some(ConnectionEvent::Supersede) => {
                            self.metrics.record_supersede();
                            self.fail_pending(GatewayError::Superseded);
                            break;
                        }
                        Some(ConnectionEvent::Shutdown) | None => {
                            self.fail_pending(GatewayError::Shutdown);
                            break;
                        }
                    }
                }

                read_result = self.read_half.read(&mut read_buf) => {
                    match read_result {
                        Ok(0) => {
                            debug!(peer = %self.peer_addr, "connection closed by peer");
                            break;
                        }
                        Ok(n) => {
                            self.read_buffer.extend_from_slice(&read_buf[..n]);
                            if let Err(err) = self.drain_frames().await {
                                warn!(peer = %self.peer_addr, error = %err, "write failed, closing connection");
                                self.fail_pending(err);
                                break;
                            }
                        }
                        Err(err) => {
                            warn!(peer = %self.peer_addr, error = %err, "read failed, closing connection");
                            self.fail_pending(GatewayError::Io(err));
                            break;
                        }
                    }
                }
            }
        }

        self.unregister_self();
        if let Some(identity) = self.identity {
            if let Err(err) = self.persistence.mark_offline(identity) {
                warn!(peer = %self.peer_addr, error = %err, "failed to mark device offline");
            }
        }
    }

    fn unregister_self(&self) {
        if let Some(identity) = self.identity {
            self.registry.unregister(identity, self.id);
        }
    }

    fn fail_pending(&mut self, err: GatewayError) {
        if let Some(pending) = self.pending.take() {
            let _ = pending.reply_tx.send(Err(err));
        }
    }

    async fn handle_send_command(
        &mut self,
        content: String,
        reply: oneshot::Sender<Result<CommandOutcome, GatewayError>>,
    ) {
        self.next_server_flag = self.next_server_flag.wrapping_add(1);
        let server_flag = self.next_server_flag;
        let serial = self.next_frame_serial;
        self.next_frame_serial = self.next_frame_serial.wrapping_add(1);

        let frame = codec::encode_server_command(&content, serial, server_flag);
        if let Err(err) = self.write_half.write_all(&frame).await {
            let _ = reply.send(Err(GatewayError::Io(err)));
            return;
        }
        if let Err(err) = self.write_half.flush().await {
            let _ = reply.send(Err(GatewayError::Io(err)));
            return;
        }

        // Only one command in flight per connection (§4.3): a fresh send
        // replaces any unresolved previous waiter, which never happens in
        // practice since the dispatcher awaits before issuing another.
        if let Some(previous) = self.pending.take() {
            let _ = previous.reply_tx.send(Err(GatewayError::Superseded));
        }
        self.pending = Some(PendingCommand {
            reply_tx: reply,
            server_flag,
        });
    }

    async fn drain_frames(&mut self) -> Result<(), GatewayError> {
        for frame in extract_frames(&mut self.read_buffer) {
            self.handle_frame(&frame).await?;
        }
        Ok(())
    }

    async fn handle_frame(&mut self, frame: &[u8]) -> Result<(), GatewayError> {
        let decoded = match codec::decode(frame) {
            Ok(decoded) => decoded,
            Err(err) => {
                warn!(peer = %self.peer_addr, error = %err, "malformed frame, skipping");
                self.metrics.record_malformed();
                return Ok(());
            }
        };
        if !decoded.crc_ok {
            warn!(peer = %self.peer_addr, proto = decoded.packet.proto(), "CRC mismatch, processing anyway");
            self.metrics.record_crc_mismatch();
        }

        if self.identity.is_none() {
            return match decoded.packet {
                Packet::Login(login) => self.handle_login(login).await,
                other => {
                    debug!(peer = %self.peer_addr, proto = other.proto(), "dropping packet before authentication");
                    self.metrics.record_unauthenticated_dropped();
                    Ok(())
                }
            };
        }

        match decoded.packet {
            Packet::Login(login) => {
                // A re-login on an already-authenticated socket: treat like
                // the first login (re-upsert, re-ack), identity is stable.
                self.handle_login(login).await
            }
            Packet::Location(loc) => {
                self.metrics.record_location();
                self.store_fix(&loc.fix, false, None);
                self.ack(codec::PROTO_LOCATION, loc.serial).await
            }
            Packet::Heartbeat(hb) => {
                self.metrics.record_heartbeat();
                self.store_heartbeat(&hb);
                self.ack(codec::PROTO_HEARTBEAT, hb.serial).await
            }
            Packet::Alarm(alarm) => {
                self.metrics.record_alarm();
                self.store_fix(&alarm.fix, true, Some(alarm.alarm_kind));
                self.broadcast_alarm(alarm.alarm_kind);
                self.ack(codec::PROTO_ALARM, alarm.serial).await
            }
            Packet::CommandReply(reply) => {
                self.metrics.record_command_reply();
                if let Some(pending) = self.pending.take() {
                    let _ = pending.reply_tx.send(Ok(CommandOutcome {
                        reply: Some(reply.content),
                        server_flag: pending.server_flag,
                        note: None,
                    }));
                } else {
                    debug!(peer = %self.peer_addr, content = %reply.content, "command reply with no waiter, discarding");
                }
                Ok(())
            }
            Packet::Unknown { proto, .. } => {
                debug!(peer = %self.peer_addr, proto, "unknown protocol, no ack");
                self.metrics.record_unknown_proto();
                Ok(())
            }
        }
    }

    async fn handle_login(&mut self, login: crate::codec::LoginPacket) -> Result<(), GatewayError> {
        let identity = login.identity;
        self.metrics.record_login();
        match self.persistence.upsert_on_login(identity) {
            Ok(row) => self.device_row_id = Some(row.id),
            Err(err) => {
                warn!(peer = %self.peer_addr, error = %err, "store failed on login");
                self.metrics.record_store_failure();
            }
        }
        self.identity = Some(identity);

        let mut handle = self.self_handle.clone();
        handle.identity = identity;
        self.registry.register(identity, handle);

        info!(peer = %self.peer_addr, identity = %identity, "device authenticated");
        self.ack(codec::PROTO_LOGIN, login.serial).await
    }

    /// Applies `force_southern_hemisphere` once, before any consumer sees the
    /// fix, so the locations row, the device row, and the broadcast all
    /// agree on latitude.
    fn store_fix(&self, fix: &crate::codec::GpsFix, is_alarm: bool, alarm_kind: Option<AlarmKind>) {
        let Some(device_row_id) = self.device_row_id else {
            return;
        };
        let fix = apply_hemisphere_override(*fix, self.config.force_southern_hemisphere);

        if let Err(err) = self
            .persistence
            .insert_location(device_row_id, &fix, is_alarm, alarm_kind)
        {
            warn!(error = %err, "failed to insert location");
        }
        if let Some(identity) = self.identity {
            let ts = Utc::now();
            if let Err(err) = self
                .persistence
                .touch_location(identity, fix.latitude, fix.longitude, ts)
            {
                warn!(error = %err, "failed to touch device location");
            }
            self.broadcaster.publish(DeviceEvent::Position {
                identity,
                lat: fix.latitude,
                lon: fix.longitude,
                is_alarm,
            });
        }
    }

    fn store_heartbeat(&self, hb: &crate::codec::HeartbeatPacket) {
        let Some(identity) = self.identity else { return };
        let status = DeviceOnlineStatus::Online;
        if let Err(err) =
            self.persistence
                .touch_heartbeat(identity, hb.battery_percent(), hb.gsm_bars, status)
        {
            warn!(error = %err, "failed to touch heartbeat");
        }
    }

    fn broadcast_alarm(&self, kind: AlarmKind) {
        if let Some(identity) = self.identity {
            self.broadcaster.publish(DeviceEvent::Alarm { identity, kind });
        }
    }

    async fn ack(&mut self, proto: u8, serial: u16) -> Result<(), GatewayError> {
        let frame = codec::encode_ack(proto, serial);
        self.write_half.write_all(&frame).await.map_err(GatewayError::Io)?;
        self.write_half.flush().await.map_err(GatewayError::Io)?;
        Ok(())
    }
}

fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

/// Applies the `force_southern_hemisphere` override to a decoded fix,
/// once, before any consumer (locations row, device row, broadcast) sees
/// it — so none of them can disagree on latitude.
fn apply_hemisphere_override(mut fix: crate::codec::GpsFix, force_southern_hemisphere: bool) -> crate::codec::GpsFix {
    if force_southern_hemisphere && fix.latitude > 0.0 {
        fix.latitude = -fix.latitude;
    }
    fix
}

/// Pulls every complete frame out of `buf`, discarding any garbage before
/// the first start marker and leaving a partial trailing frame in place for
/// the next read (spec.md §8 scenarios 1-2: resync after garbage, and a
/// frame split across reads yields nothing until it's whole).
fn extract_frames(buf: &mut BytesMut) -> Vec<Vec<u8>> {
    let mut frames = Vec::new();
    loop {
        match find_subslice(buf, &START) {
            None => {
                if buf.len() > 1 {
                    let keep_from = buf.len() - 1;
                    buf.advance(keep_from);
                }
                return frames;
            }
            Some(0) => {}
            Some(pos) => buf.advance(pos),
        }

        if buf.len() < 3 {
            return frames;
        }
        let len = buf[2] as usize;
        let total = len + 5;
        if buf.len() < total {
            return frames;
        }

        frames.push(buf.split_to(total).to_vec());
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;

    pub enum Observed {
        SendCommand { content: String },
        ClearPending,
        Supersede,
        Shutdown,
    }

    /// Builds a detached `ConnectionHandle` for registry/dispatcher unit
    /// tests, backed by a channel the test drains directly instead of a
    /// running `Connection`.
    pub fn test_handle(id: u64, identity: DeviceIdentity) -> (ConnectionHandle, mpsc::Receiver<Observed>) {
        let (tx, mut raw_rx) = mpsc::channel::<ConnectionEvent>(EVENT_QUEUE_DEPTH);
        let (observed_tx, observed_rx) = mpsc::channel(EVENT_QUEUE_DEPTH);
        tokio::spawn(async move {
            while let Some(event) = raw_rx.recv().await {
                let observed = match event {
                    ConnectionEvent::SendCommand { content, reply } => {
                        let _ = reply.send(Ok(CommandOutcome {
                            reply: Some("test-reply".to_string()),
                            server_flag: 0xA001,
                            note: None,
                        }));
                        Observed::SendCommand { content }
                    }
                    ConnectionEvent::ClearPending => Observed::ClearPending,
                    ConnectionEvent::Supersede => Observed::Supersede,
                    ConnectionEvent::Shutdown => Observed::Shutdown,
                };
                if observed_tx.send(observed).await.is_err() {
                    break;
                }
            }
        });
        let handle = ConnectionHandle {
            id,
            identity,
            peer_addr: "127.0.0.1:0".parse().unwrap(),
            tx,
        };
        (handle, observed_rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn find_subslice_finds_marker_after_garbage() {
        let buf = [0xAA, 0xBB, 0x78, 0x78, 0x01];
        assert_eq!(find_subslice(&buf, &START), Some(2));
    }

    #[test]
    fn find_subslice_none_when_absent() {
        let buf = [0x01, 0x02, 0x03];
        assert_eq!(find_subslice(&buf, &START), None);
    }

    fn sample_fix(latitude: f64) -> crate::codec::GpsFix {
        use crate::codec::DeviceTimestamp;
        crate::codec::GpsFix {
            timestamp: DeviceTimestamp {
                year: 2026,
                month: 1,
                day: 1,
                hour: 0,
                minute: 0,
                second: 0,
                valid: true,
            },
            latitude,
            longitude: 29.0,
            speed_kmh: 0,
            course_deg: 0,
            satellites: 6,
            gps_valid: true,
        }
    }

    #[test]
    fn hemisphere_override_flips_north_to_south() {
        let fix = apply_hemisphere_override(sample_fix(41.0), true);
        assert_eq!(fix.latitude, -41.0);
    }

    #[test]
    fn hemisphere_override_leaves_south_alone() {
        let fix = apply_hemisphere_override(sample_fix(-41.0), true);
        assert_eq!(fix.latitude, -41.0);
    }

    #[test]
    fn hemisphere_override_is_noop_when_disabled() {
        let fix = apply_hemisphere_override(sample_fix(41.0), false);
        assert_eq!(fix.latitude, 41.0);
    }

    fn login_frame() -> Vec<u8> {
        let mut body = vec![0x01, 0x23, 0x45, 0x67, 0x89, 0x01, 0x23, 0x45];
        body.extend_from_slice(&1u16.to_be_bytes());
        let len = 1 + body.len() + 2; // proto + body + crc
        let mut crc_input = vec![len as u8, codec::PROTO_LOGIN];
        crc_input.extend_from_slice(&body);
        let crc = crate::crc::crc16_itu(&crc_input);
        let mut frame = Vec::new();
        frame.extend_from_slice(&START);
        frame.extend_from_slice(&crc_input);
        frame.extend_from_slice(&crc.to_be_bytes());
        frame.extend_from_slice(&codec::STOP);
        frame
    }

    #[test]
    fn framing_resync_skips_leading_garbage() {
        let frame = login_frame();
        let mut buf = BytesMut::from(&[0xAA, 0xBB][..]);
        buf.extend_from_slice(&frame);

        let frames = extract_frames(&mut buf);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0], frame);
        assert!(buf.is_empty());
    }

    #[test]
    fn split_packet_across_reads_yields_nothing_until_whole() {
        let frame = login_frame();
        let mut buf = BytesMut::from(&frame[..10]);
        assert!(extract_frames(&mut buf).is_empty());

        buf.extend_from_slice(&frame[10..]);
        let frames = extract_frames(&mut buf);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0], frame);
    }
}
