//! Reliable stream transport over a single UDP socket
//!
//! [`ReliableTransport`] turns one non-blocking datagram socket into an
//! ordered, reliable, flow-controlled channel to exactly one peer:
//! - SYN / SYN|ACK handshake, FIN / FIN|ACK teardown, RST abort
//! - per-packet sequence numbers with cumulative acknowledgments
//! - sliding window bounded by the peer's advertised receive space, with
//!   timed retransmission and zero-window queries
//! - out-of-order reassembly with duplicate suppression
//!
//! The transport never spawns anything. Callers drive it by invoking
//! [`ReliableTransport::recv`] (or [`ReliableTransport::service`]) from their
//! own loop; only [`ReliableTransport::send`] waits, and only while the window
//! is full.

use std::collections::HashMap;
use std::net::{SocketAddr, UdpSocket};
use std::time::{Duration, Instant};

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use socket2::{Domain, Protocol, Socket, Type};
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::endpoint::Endpoint;
use crate::error::{NetworkError, NetworkResult};
use crate::packet::{Packet, PacketFlags, PacketHeader, MAX_PACKET_SIZE, MAX_PAYLOAD};

/// Transport tuning
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Maximum unacknowledged packets in flight, and payloads buffered on receive
    pub window_size: u16,

    /// Largest chunk placed in one packet
    pub max_payload: usize,

    /// Age after which an unacknowledged packet is resent
    pub retransmit_timeout: Duration,

    /// Resends allowed before a packet is declared lost
    pub max_retries: u32,

    /// Pause between service passes while `send` waits for window space
    pub send_poll_interval: Duration,

    /// Fixed initial send sequence (random when unset)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub initial_sequence: Option<u32>,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            window_size: 64,
            max_payload: MAX_PAYLOAD,
            retransmit_timeout: Duration::from_millis(500),
            max_retries: 5,
            send_poll_interval: Duration::from_millis(1),
            initial_sequence: None,
        }
    }
}

impl TransportConfig {
    /// Validate configuration
    pub fn validate(&self) -> NetworkResult<()> {
        if self.window_size == 0 {
            return Err(NetworkError::ConfigError("window_size must be at least 1".into()));
        }
        if self.max_payload == 0 || self.max_payload > MAX_PAYLOAD {
            return Err(NetworkError::ConfigError(format!(
                "max_payload must be between 1 and {}",
                MAX_PAYLOAD
            )));
        }
        if self.retransmit_timeout.is_zero() {
            return Err(NetworkError::ConfigError("retransmit_timeout must be non-zero".into()));
        }
        Ok(())
    }
}

/// Connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No peer, or connection torn down
    Closed,
    /// SYN sent, waiting for the peer
    Connecting,
    /// Handshake complete
    Connected,
    /// FIN exchanged, waiting for the other half
    Closing,
}

/// Transport counters
#[derive(Debug, Clone, Default)]
pub struct TransportStats {
    pub packets_sent: u64,
    pub packets_received: u64,
    /// Payload bytes handed to the socket (first transmission only)
    pub bytes_sent: u64,
    /// Payload bytes accepted into reassembly
    pub bytes_received: u64,
    pub retransmissions: u64,
    pub packets_lost: u64,
    pub checksum_failures: u64,
    pub duplicates: u64,
    /// Smoothed round-trip time (microseconds)
    rtt_us: u64,
}

impl TransportStats {
    /// Smoothed RTT, if any packet has been acknowledged yet
    pub fn rtt(&self) -> Option<Duration> {
        (self.rtt_us > 0).then(|| Duration::from_micros(self.rtt_us))
    }

    fn update_rtt(&mut self, sample: Duration) {
        let rtt_us = sample.as_micros().max(1) as u64;
        // Exponential moving average
        if self.rtt_us == 0 {
            self.rtt_us = rtt_us;
        } else {
            self.rtt_us = (self.rtt_us * 7 + rtt_us) / 8;
        }
    }
}

/// Sent packet awaiting acknowledgment
struct PendingPacket {
    raw: Bytes,
    sequence: u32,
    sent_at: Instant,
    retry_count: u32,
}

/// Ordered, reliable stream to a single peer
pub struct ReliableTransport {
    socket: UdpSocket,
    local_addr: SocketAddr,
    config: TransportConfig,
    state: ConnectionState,
    remote: Option<Endpoint>,

    /// Sequence assigned to the next data packet
    send_next: u32,
    /// Sequence our side of the stream started at
    send_start: u32,
    /// Next sequence to hand to the caller
    recv_next: u32,
    /// Sequence the peer's side of the stream started at
    recv_start: u32,
    /// First sequence the peer has no room for
    peer_edge: u32,
    /// First sequence we last told the peer we have no room for
    advertised_edge: u32,
    last_window_query: Option<Instant>,
    /// Peer FIN seen before all data ahead of it arrived
    peer_fin: Option<u32>,

    pending: HashMap<u32, PendingPacket>,
    reassembly: HashMap<u32, Bytes>,

    fin_sent: bool,
    fin_received: bool,

    stats: TransportStats,
}

impl ReliableTransport {
    /// Bind a new transport to the given local address
    pub fn bind(addr: SocketAddr, config: TransportConfig) -> NetworkResult<Self> {
        let domain = if addr.is_ipv6() { Domain::IPV6 } else { Domain::IPV4 };
        let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;
        socket.bind(&addr.into())?;
        Self::from_socket(socket.into(), config)
    }

    /// Wrap an existing socket; it is switched to non-blocking mode
    pub fn from_socket(socket: UdpSocket, config: TransportConfig) -> NetworkResult<Self> {
        config.validate()?;
        socket.set_nonblocking(true)?;
        let local_addr = socket.local_addr()?;
        let initial = config.initial_sequence.unwrap_or_else(rand::random);

        debug!("Reliable transport bound to {} (initial seq {})", local_addr, initial);

        Ok(Self {
            socket,
            local_addr,
            config,
            state: ConnectionState::Closed,
            remote: None,
            send_next: initial,
            send_start: initial,
            recv_next: 0,
            recv_start: 0,
            peer_edge: initial,
            advertised_edge: 0,
            last_window_query: None,
            peer_fin: None,
            pending: HashMap::new(),
            reassembly: HashMap::new(),
            fin_sent: false,
            fin_received: false,
            stats: TransportStats::default(),
        })
    }

    /// Local socket address
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Local address as an endpoint (fails for IPv6 sockets)
    pub fn local_endpoint(&self) -> NetworkResult<Endpoint> {
        Endpoint::try_from(self.local_addr)
    }

    /// Get connection state
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Check if the handshake has completed
    pub fn is_connected(&self) -> bool {
        self.state == ConnectionState::Connected
    }

    /// Peer this transport talks to
    pub fn remote(&self) -> Option<Endpoint> {
        self.remote
    }

    /// Number of sent packets not yet acknowledged
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Counters
    pub fn stats(&self) -> &TransportStats {
        &self.stats
    }

    /// Configuration in use
    pub fn config(&self) -> &TransportConfig {
        &self.config
    }

    /// Duplicate the underlying socket handle (e.g. to run STUN from the same port)
    pub fn try_clone_socket(&self) -> NetworkResult<UdpSocket> {
        Ok(self.socket.try_clone()?)
    }

    /// Start (or restart) the handshake with `remote`.
    ///
    /// Each call sends a fresh SYN at the current send sequence; the SYN does
    /// not consume a sequence number.
    pub fn connect(&mut self, remote: Endpoint) -> NetworkResult<()> {
        self.remote = Some(remote);
        if self.state == ConnectionState::Closed {
            self.fin_sent = false;
            self.fin_received = false;
            self.peer_fin = None;
            self.send_start = self.send_next;
            self.set_state(ConnectionState::Connecting);
        }

        trace!("SYN -> {} (seq {})", remote, self.send_next);
        self.send_control(PacketFlags::SYN)
    }

    /// Send bytes to the peer, waiting for window space as needed.
    ///
    /// This may wait indefinitely if the peer stops acknowledging; wrap it in
    /// a timeout or use [`ReliableTransport::send_with_cancel`].
    pub async fn send(&mut self, data: &[u8]) -> NetworkResult<()> {
        self.send_inner(data, None).await
    }

    /// Like [`ReliableTransport::send`], giving up with `Cancelled` when `cancel` fires
    pub async fn send_with_cancel(
        &mut self,
        data: &[u8],
        cancel: &CancellationToken,
    ) -> NetworkResult<()> {
        self.send_inner(data, Some(cancel)).await
    }

    async fn send_inner(
        &mut self,
        data: &[u8],
        cancel: Option<&CancellationToken>,
    ) -> NetworkResult<()> {
        if self.state != ConnectionState::Connected {
            return Err(NetworkError::NotConnected);
        }

        for chunk in data.chunks(self.config.max_payload) {
            while !self.window_open() {
                if cancel.is_some_and(|c| c.is_cancelled()) {
                    return Err(NetworkError::Cancelled);
                }

                self.service()?;
                if self.state != ConnectionState::Connected {
                    return Err(NetworkError::NotConnected);
                }
                if self.window_open() {
                    break;
                }
                self.query_window()?;

                match cancel {
                    Some(token) => {
                        tokio::select! {
                            _ = token.cancelled() => return Err(NetworkError::Cancelled),
                            _ = sleep(self.config.send_poll_interval) => {}
                        }
                    }
                    None => sleep(self.config.send_poll_interval).await,
                }
            }

            self.transmit_data(Bytes::copy_from_slice(chunk))?;
        }

        Ok(())
    }

    /// Receive the next in-order payload, if one is ready.
    ///
    /// Drains every waiting datagram and runs retransmission first.
    /// `Ok(None)` means nothing is deliverable yet.
    pub fn recv(&mut self) -> NetworkResult<Option<Bytes>> {
        self.service()?;
        let payload = self.take_ready();
        if payload.is_some() {
            self.update_window()?;
        }
        Ok(payload)
    }

    /// Drain the socket and retransmit expired packets without delivering data
    pub fn service(&mut self) -> NetworkResult<()> {
        let mut buf = [0u8; MAX_PACKET_SIZE];

        loop {
            match self.socket.recv_from(&mut buf) {
                Ok((len, from)) => self.handle_datagram(&buf[..len], from)?,
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                // ICMP unreachable from an earlier punch on some platforms
                Err(e) if e.kind() == std::io::ErrorKind::ConnectionReset => {
                    trace!("Ignoring connection reset on UDP socket");
                    continue;
                }
                Err(e) => return Err(e.into()),
            }
        }

        self.poll_retransmit()
    }

    /// Resend packets older than the retransmit timeout.
    ///
    /// A packet that already used all of its retries is dropped, counted as
    /// lost, and the stream is closed with `PacketLost`.
    pub fn poll_retransmit(&mut self) -> NetworkResult<()> {
        if self.state == ConnectionState::Closed {
            self.pending.clear();
            return Ok(());
        }

        let now = Instant::now();
        let timeout = self.config.retransmit_timeout;
        let max_retries = self.config.max_retries;

        let mut lost: Vec<u32> = Vec::new();
        let mut resend: Vec<Bytes> = Vec::new();

        for packet in self.pending.values_mut() {
            if now.duration_since(packet.sent_at) < timeout {
                continue;
            }
            if packet.retry_count >= max_retries {
                lost.push(packet.sequence);
            } else {
                packet.retry_count += 1;
                packet.sent_at = now;
                trace!("Retransmit seq {} (retry {})", packet.sequence, packet.retry_count);
                resend.push(packet.raw.clone());
            }
        }

        for raw in resend {
            self.stats.retransmissions += 1;
            self.send_raw(&raw)?;
        }

        if lost.is_empty() {
            return Ok(());
        }

        // Report the oldest one
        let send_next = self.send_next;
        lost.sort_unstable_by_key(|seq| std::cmp::Reverse(send_next.wrapping_sub(*seq)));
        for sequence in &lost {
            self.pending.remove(sequence);
            self.stats.packets_lost += 1;
            warn!(
                "Packet {} to {:?} lost after {} retries",
                sequence, self.remote, max_retries
            );
        }

        self.set_state(ConnectionState::Closed);
        Err(NetworkError::PacketLost { sequence: lost[0] })
    }

    /// Send FIN and stop accepting new sends. Does not wait for the peer.
    pub fn close(&mut self) -> NetworkResult<()> {
        if self.state != ConnectionState::Connected {
            return Ok(());
        }

        self.send_control(PacketFlags::FIN)?;
        self.fin_sent = true;
        self.set_state(ConnectionState::Closing);
        Ok(())
    }

    fn set_state(&mut self, state: ConnectionState) {
        if self.state != state {
            debug!(
                "Transport {} -> {:?} state: {:?} -> {:?}",
                self.local_addr, self.remote, self.state, state
            );
            self.state = state;
        }
    }

    /// Room for one more data packet, both in flight and at the peer
    fn window_open(&self) -> bool {
        self.pending.len() < usize::from(self.config.window_size)
            && (self.peer_edge.wrapping_sub(self.send_next) as i32) > 0
    }

    /// Receive space left: the window minus payloads held but not yet taken
    fn advertised_window(&self) -> u16 {
        let held = self.ack_point().wrapping_sub(self.recv_next);
        u32::from(self.config.window_size).saturating_sub(held) as u16
    }

    fn update_peer_edge(&mut self, ack: u32, window: u16) {
        let edge = ack.wrapping_add(u32::from(window));
        if (edge.wrapping_sub(self.peer_edge) as i32) > 0 {
            self.peer_edge = edge;
        }
    }

    /// Ask a peer with a closed window to re-advertise, at most once per
    /// retransmit timeout. Only needed when nothing is in flight to draw ACKs.
    fn query_window(&mut self) -> NetworkResult<()> {
        if !self.pending.is_empty() {
            return Ok(());
        }
        let now = Instant::now();
        if self
            .last_window_query
            .is_some_and(|at| now.duration_since(at) < self.config.retransmit_timeout)
        {
            return Ok(());
        }

        self.last_window_query = Some(now);
        trace!("Window query -> {:?} (peer edge {})", self.remote, self.peer_edge);
        self.send_control(PacketFlags::DATA | PacketFlags::ACK)
    }

    /// Tell the peer about space freed by the reader once half a window opened up
    fn update_window(&mut self) -> NetworkResult<()> {
        if !matches!(self.state, ConnectionState::Connected | ConnectionState::Closing) {
            return Ok(());
        }
        let window = u32::from(self.config.window_size);
        let edge = self.recv_next.wrapping_add(window);
        if edge.wrapping_sub(self.advertised_edge) >= (window / 2).max(1) {
            trace!("Window update -> {:?} (edge {})", self.remote, edge);
            self.send_control(PacketFlags::ACK)?;
        }
        Ok(())
    }

    /// First sequence not yet received contiguously
    fn ack_point(&self) -> u32 {
        let mut next = self.recv_next;
        while self.reassembly.contains_key(&next) {
            next = next.wrapping_add(1);
        }
        next
    }

    fn take_ready(&mut self) -> Option<Bytes> {
        let payload = self.reassembly.remove(&self.recv_next)?;
        self.recv_next = self.recv_next.wrapping_add(1);
        Some(payload)
    }

    fn transmit_data(&mut self, payload: Bytes) -> NetworkResult<()> {
        let sequence = self.send_next;
        self.send_next = self.send_next.wrapping_add(1);

        let len = payload.len() as u64;
        let (ack, window) = self.advertise();
        let packet = Packet::new(
            PacketHeader::new(sequence, ack, PacketFlags::DATA | PacketFlags::ACK, window),
            payload,
        );
        let raw = packet.to_bytes();

        self.send_raw(&raw)?;
        self.stats.bytes_sent += len;
        self.pending.insert(
            sequence,
            PendingPacket {
                raw,
                sequence,
                sent_at: Instant::now(),
                retry_count: 0,
            },
        );
        Ok(())
    }

    fn send_control(&mut self, flags: PacketFlags) -> NetworkResult<()> {
        // SYNs always name the start of our stream
        let sequence = if flags.contains(PacketFlags::SYN) {
            self.send_start
        } else {
            self.send_next
        };
        let (ack, window) = self.advertise();
        let packet = Packet::control(sequence, ack, flags, window);
        self.send_raw(&packet.to_bytes())
    }

    /// Acknowledgment and window for an outgoing header
    fn advertise(&mut self) -> (u32, u16) {
        let ack = self.ack_point();
        let window = self.advertised_window();
        self.advertised_edge = ack.wrapping_add(u32::from(window));
        (ack, window)
    }

    fn send_raw(&mut self, raw: &[u8]) -> NetworkResult<()> {
        let remote = self.remote.ok_or(NetworkError::NotConnected)?;
        match self.socket.send_to(raw, remote.to_socket_addr()) {
            Ok(_) => {
                self.stats.packets_sent += 1;
                Ok(())
            }
            // Kernel buffer full: retransmission covers it
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                trace!("Send to {} would block, leaving it to retransmission", remote);
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    fn handle_datagram(&mut self, data: &[u8], from: SocketAddr) -> NetworkResult<()> {
        let Ok(from) = Endpoint::try_from(from) else {
            return Ok(());
        };
        if self.remote.is_some_and(|remote| remote != from) {
            trace!("Ignoring {} bytes from stranger {}", data.len(), from);
            return Ok(());
        }

        let packet = match Packet::from_bytes(data) {
            Ok(packet) => packet,
            Err(e) => {
                debug!("Dropping datagram from {}: {}", from, e);
                return Ok(());
            }
        };
        if !packet.verify_checksum() {
            self.stats.checksum_failures += 1;
            debug!("Dropping packet from {} with bad checksum", from);
            return Ok(());
        }

        self.stats.packets_received += 1;
        let header = packet.header;
        let flags = header.flags;
        trace!(
            "{:?} <- {} seq={} ack={} len={}",
            flags, from, header.sequence, header.acknowledgment, header.payload_length
        );

        if flags.contains(PacketFlags::RST) {
            debug!("Connection reset by {}", from);
            self.pending.clear();
            self.reassembly.clear();
            self.set_state(ConnectionState::Closed);
            return Ok(());
        }

        if flags.contains(PacketFlags::SYN) {
            return self.handle_syn(flags, &header, from);
        }

        if flags.contains(PacketFlags::ACK) {
            if self.state == ConnectionState::Connecting {
                self.open(header.sequence, header.window);
            }
            self.handle_ack(header.acknowledgment);
            if matches!(self.state, ConnectionState::Connected | ConnectionState::Closing) {
                self.update_peer_edge(header.acknowledgment, header.window);
            }
        }

        if flags.contains(PacketFlags::DATA) {
            if !packet.payload.is_empty() {
                self.handle_data(header.sequence, packet.payload)?;
            } else if matches!(self.state, ConnectionState::Connected | ConnectionState::Closing) {
                // Window query
                self.send_control(PacketFlags::ACK)?;
            }
        }

        if flags.contains(PacketFlags::FIN) {
            self.handle_fin(header.sequence)?;
        } else if flags == PacketFlags::ACK
            && self.state == ConnectionState::Closing
            && self.fin_received
            && self.pending.is_empty()
        {
            self.set_state(ConnectionState::Closed);
        }

        Ok(())
    }

    /// Handshake complete: the peer's stream starts at `sequence`
    fn open(&mut self, sequence: u32, window: u16) {
        if self.state == ConnectionState::Closed {
            self.send_start = self.send_next;
        }
        self.recv_start = sequence;
        self.recv_next = sequence;
        self.peer_edge = self.send_next.wrapping_add(u32::from(window));
        self.reassembly.clear();
        self.fin_sent = false;
        self.fin_received = false;
        self.peer_fin = None;
        self.set_state(ConnectionState::Connected);
    }

    fn handle_syn(&mut self, flags: PacketFlags, header: &PacketHeader, from: Endpoint) -> NetworkResult<()> {
        match self.state {
            ConnectionState::Closed | ConnectionState::Connecting => {
                self.remote = Some(from);
                self.open(header.sequence, header.window);
            }
            ConnectionState::Connected | ConnectionState::Closing => {
                if header.sequence != self.recv_start {
                    // Peer restarted; the old stream cannot continue
                    debug!(
                        "SYN from {} starts at {}, stream started at {}; resetting",
                        from, header.sequence, self.recv_start
                    );
                    self.send_control(PacketFlags::RST)?;
                    self.pending.clear();
                    self.reassembly.clear();
                    self.set_state(ConnectionState::Closed);
                    return Ok(());
                }
            }
        }

        // A bare SYN gets SYN|ACK so the peer learns our sequence; SYN|ACK gets ACK
        let reply = if flags.contains(PacketFlags::ACK) {
            PacketFlags::ACK
        } else {
            PacketFlags::SYN | PacketFlags::ACK
        };
        self.send_control(reply)
    }

    fn handle_ack(&mut self, ack: u32) {
        let window = u32::from(self.config.window_size);
        let before = self.pending.len();
        let mut rtt_sample = None;

        self.pending.retain(|&sequence, packet| {
            let distance = ack.wrapping_sub(sequence);
            let covered = distance >= 1 && distance <= window;
            if covered && packet.retry_count == 0 {
                rtt_sample = Some(packet.sent_at.elapsed());
            }
            !covered
        });

        if let Some(sample) = rtt_sample {
            self.stats.update_rtt(sample);
        }
        let released = before - self.pending.len();
        if released > 0 {
            trace!("ACK {} released {} packets", ack, released);
        }
    }

    fn handle_data(&mut self, sequence: u32, payload: Bytes) -> NetworkResult<()> {
        if !matches!(self.state, ConnectionState::Connected | ConnectionState::Closing) {
            return Ok(());
        }

        let offset = sequence.wrapping_sub(self.recv_next);
        if (offset as i32) < 0 {
            // Already delivered; our ACK was probably lost
            self.stats.duplicates += 1;
        } else if offset < u32::from(self.config.window_size) {
            if self.reassembly.contains_key(&sequence) {
                self.stats.duplicates += 1;
            } else {
                self.stats.bytes_received += payload.len() as u64;
                self.reassembly.insert(sequence, payload);
            }
        } else {
            debug!("Dropping seq {} beyond receive window (expecting {})", sequence, self.recv_next);
        }

        self.send_control(PacketFlags::ACK)?;

        if self.peer_fin.is_some_and(|fin| !self.fin_received && fin == self.ack_point()) {
            self.accept_fin()?;
        }
        Ok(())
    }

    /// The peer's FIN carries the sequence after its last data packet
    fn handle_fin(&mut self, sequence: u32) -> NetworkResult<()> {
        if !matches!(self.state, ConnectionState::Connected | ConnectionState::Closing) {
            return Ok(());
        }
        if self.fin_received {
            // Our FIN|ACK was lost
            return self.send_control(PacketFlags::FIN | PacketFlags::ACK);
        }
        if self.ack_point() != sequence {
            debug!(
                "FIN from {:?} at {} while data up to {} is missing",
                self.remote, sequence, self.ack_point()
            );
            self.peer_fin = Some(sequence);
            return self.send_control(PacketFlags::ACK);
        }
        self.accept_fin()
    }

    fn accept_fin(&mut self) -> NetworkResult<()> {
        self.peer_fin = None;
        self.fin_received = true;
        match self.state {
            ConnectionState::Connected => {
                self.fin_sent = true;
                self.set_state(ConnectionState::Closing);
                self.send_control(PacketFlags::FIN | PacketFlags::ACK)
            }
            ConnectionState::Closing => {
                // Answer to our own FIN
                self.send_control(PacketFlags::ACK)?;
                self.set_state(ConnectionState::Closed);
                Ok(())
            }
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::seq::SliceRandom;

    fn loopback_config() -> TransportConfig {
        TransportConfig {
            retransmit_timeout: Duration::from_secs(10),
            initial_sequence: Some(1000),
            ..Default::default()
        }
    }

    fn bind(config: TransportConfig) -> ReliableTransport {
        ReliableTransport::bind("127.0.0.1:0".parse().unwrap(), config).unwrap()
    }

    /// Raw socket playing the far side of the protocol by hand
    struct RawPeer {
        socket: UdpSocket,
    }

    impl RawPeer {
        fn new() -> Self {
            let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
            socket.set_read_timeout(Some(Duration::from_millis(500))).unwrap();
            Self { socket }
        }

        fn endpoint(&self) -> Endpoint {
            Endpoint::try_from(self.socket.local_addr().unwrap()).unwrap()
        }

        fn send(&self, to: &ReliableTransport, packet: &Packet) {
            self.socket.send_to(&packet.to_bytes(), to.local_addr()).unwrap();
        }

        fn send_raw(&self, to: &ReliableTransport, raw: &[u8]) {
            self.socket.send_to(raw, to.local_addr()).unwrap();
        }

        fn recv(&self) -> Packet {
            let mut buf = [0u8; MAX_PACKET_SIZE];
            let (len, _) = self.socket.recv_from(&mut buf).unwrap();
            Packet::from_bytes(&buf[..len]).unwrap()
        }

        fn try_recv(&self) -> Option<Packet> {
            self.socket.set_nonblocking(true).unwrap();
            let mut buf = [0u8; MAX_PACKET_SIZE];
            let result = self.socket.recv_from(&mut buf);
            self.socket.set_nonblocking(false).unwrap();
            result.ok().map(|(len, _)| Packet::from_bytes(&buf[..len]).unwrap())
        }

        fn data(sequence: u32, payload: &[u8]) -> Packet {
            Packet::new(
                PacketHeader::new(sequence, 0, PacketFlags::DATA | PacketFlags::ACK, 64),
                payload.to_vec(),
            )
        }

        /// Open a connection to `transport` with our sequence space starting at `start`
        fn open(&self, transport: &mut ReliableTransport, start: u32) -> Packet {
            self.send(transport, &Packet::control(start, 0, PacketFlags::SYN, 64));
            poll_until(transport, |t| t.is_connected());
            self.recv()
        }
    }

    fn poll_until(transport: &mut ReliableTransport, mut done: impl FnMut(&ReliableTransport) -> bool) {
        let deadline = Instant::now() + Duration::from_secs(2);
        while !done(&*transport) {
            assert!(Instant::now() < deadline, "condition not reached in time");
            transport.service().unwrap();
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    fn collect(transport: &mut ReliableTransport, count: usize) -> Vec<Bytes> {
        let deadline = Instant::now() + Duration::from_secs(2);
        let mut out = Vec::new();
        while out.len() < count {
            assert!(Instant::now() < deadline, "only {} of {} payloads arrived", out.len(), count);
            match transport.recv().unwrap() {
                Some(payload) => out.push(payload),
                None => std::thread::sleep(Duration::from_millis(1)),
            }
        }
        out
    }

    #[test]
    fn test_connect_sends_syn() {
        let peer = RawPeer::new();
        let mut transport = bind(loopback_config());

        transport.connect(peer.endpoint()).unwrap();
        assert_eq!(transport.state(), ConnectionState::Connecting);

        let syn = peer.recv();
        assert_eq!(syn.header.flags, PacketFlags::SYN);
        assert_eq!(syn.header.sequence, 1000);
        assert!(syn.payload.is_empty());
        assert!(syn.verify_checksum());

        // Repeated connects resend the same sequence
        transport.connect(peer.endpoint()).unwrap();
        assert_eq!(peer.recv().header.sequence, 1000);
    }

    #[tokio::test]
    async fn test_send_requires_connection() {
        let mut transport = bind(loopback_config());
        assert!(matches!(transport.send(b"x").await, Err(NetworkError::NotConnected)));
        assert!(transport.recv().unwrap().is_none());
        transport.close().unwrap();
        assert_eq!(transport.state(), ConnectionState::Closed);
    }

    #[test]
    fn test_passive_open_replies_syn_ack() {
        let peer = RawPeer::new();
        let mut transport = bind(loopback_config());

        let reply = peer.open(&mut transport, 77);
        assert_eq!(transport.remote(), Some(peer.endpoint()));
        assert_eq!(reply.header.flags, PacketFlags::SYN | PacketFlags::ACK);
        assert_eq!(reply.header.acknowledgment, 77);
        assert_eq!(reply.header.sequence, 1000);
    }

    #[test]
    fn test_active_open_completes_on_syn_ack() {
        let peer = RawPeer::new();
        let mut transport = bind(loopback_config());

        transport.connect(peer.endpoint()).unwrap();
        peer.recv();
        peer.send(&transport, &Packet::control(500, 1000, PacketFlags::SYN | PacketFlags::ACK, 64));
        poll_until(&mut transport, |t| t.is_connected());

        // Final ACK of the handshake
        let ack = peer.recv();
        assert_eq!(ack.header.flags, PacketFlags::ACK);
        assert_eq!(ack.header.acknowledgment, 500);
    }

    #[test]
    fn test_out_of_order_delivery_with_duplicates() {
        let peer = RawPeer::new();
        let mut transport = bind(loopback_config());
        let start = u32::MAX - 5; // crosses the wrap point
        peer.open(&mut transport, start);

        const N: u32 = 24;
        let mut order: Vec<u32> = (0..N).collect();
        order.extend([3, 7, 7, 19]);
        order.shuffle(&mut rand::thread_rng());

        for i in order {
            peer.send(&transport, &RawPeer::data(start.wrapping_add(i), &i.to_be_bytes()));
        }

        let delivered = collect(&mut transport, N as usize);
        for (i, payload) in delivered.iter().enumerate() {
            assert_eq!(payload.as_ref(), &(i as u32).to_be_bytes());
        }

        // Duplicates never surface
        std::thread::sleep(Duration::from_millis(20));
        assert!(transport.recv().unwrap().is_none());
        assert_eq!(transport.stats().duplicates, 4);
    }

    #[test]
    fn test_ack_names_next_expected() {
        let peer = RawPeer::new();
        let mut transport = bind(loopback_config());
        peer.open(&mut transport, 10);

        peer.send(&transport, &RawPeer::data(11, b"b"));
        poll_until(&mut transport, |t| t.reassembly.len() == 1);
        assert_eq!(peer.recv().header.acknowledgment, 10);

        peer.send(&transport, &RawPeer::data(10, b"a"));
        poll_until(&mut transport, |t| t.reassembly.len() == 2);
        let ack = peer.recv();
        assert_eq!(ack.header.flags, PacketFlags::ACK);
        assert_eq!(ack.header.acknowledgment, 12);
    }

    #[test]
    fn test_corrupt_packet_dropped_silently() {
        let peer = RawPeer::new();
        let mut transport = bind(loopback_config());
        peer.open(&mut transport, 0);

        let good = RawPeer::data(0, b"payload").to_bytes();
        let mut bad = good.to_vec();
        bad[20] ^= 0x01;

        peer.send_raw(&transport, &bad);
        poll_until(&mut transport, |t| t.stats().checksum_failures == 1);
        assert!(transport.recv().unwrap().is_none());
        assert!(peer.try_recv().is_none(), "corrupt packet must not be acknowledged");

        peer.send_raw(&transport, &good);
        assert_eq!(collect(&mut transport, 1)[0].as_ref(), b"payload");
    }

    #[test]
    fn test_stranger_ignored() {
        let peer = RawPeer::new();
        let stranger = RawPeer::new();
        let mut transport = bind(loopback_config());
        peer.open(&mut transport, 0);

        stranger.send(&transport, &RawPeer::data(0, b"intrusion"));
        std::thread::sleep(Duration::from_millis(20));
        assert!(transport.recv().unwrap().is_none());
        assert_eq!(transport.remote(), Some(peer.endpoint()));
    }

    #[tokio::test]
    async fn test_window_limits_outstanding_packets() {
        let peer = RawPeer::new();
        let mut transport = bind(TransportConfig {
            initial_sequence: Some(u32::MAX - 20),
            ..loopback_config()
        });
        peer.open(&mut transport, 0);

        let data = vec![0xabu8; MAX_PAYLOAD * 70];
        let blocked = tokio::time::timeout(Duration::from_millis(100), transport.send(&data)).await;
        assert!(blocked.is_err(), "send must wait for window space");
        assert_eq!(transport.pending_count(), 64);

        let mut first = None;
        for _ in 0..64 {
            let packet = peer.recv();
            assert_eq!(packet.header.flags, PacketFlags::DATA | PacketFlags::ACK);
            first.get_or_insert(packet.header.sequence);
        }
        assert!(peer.try_recv().is_none());
        let first = first.unwrap();
        assert_eq!(first, u32::MAX - 20);

        // Cumulative ACK covering 30 packets, past the u32 wrap
        let ack = first.wrapping_add(30);
        peer.send(&transport, &Packet::control(0, ack, PacketFlags::ACK, 64));
        poll_until(&mut transport, |t| t.pending_count() == 34);
        assert!(transport.pending.keys().all(|seq| seq.wrapping_sub(ack) < 34));
        assert!(transport.stats().rtt().is_some());
    }

    #[tokio::test]
    async fn test_send_cancellation() {
        let peer = RawPeer::new();
        let mut transport = bind(TransportConfig {
            window_size: 2,
            ..loopback_config()
        });
        peer.open(&mut transport, 0);

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            sleep(Duration::from_millis(30)).await;
            trigger.cancel();
        });

        let result = transport.send_with_cancel(&vec![1u8; MAX_PAYLOAD * 3], &cancel).await;
        assert!(matches!(result, Err(NetworkError::Cancelled)));
        assert_eq!(transport.pending_count(), 2);
    }

    #[tokio::test]
    async fn test_retransmit_then_loss() {
        let peer = RawPeer::new();
        let mut transport = bind(TransportConfig {
            retransmit_timeout: Duration::from_millis(20),
            ..loopback_config()
        });
        peer.open(&mut transport, 0);

        transport.send(b"x").await.unwrap();
        let original = peer.recv();

        sleep(Duration::from_millis(30)).await;
        transport.service().unwrap();
        let resent = peer.recv();
        assert_eq!(resent, original);
        assert_eq!(transport.pending[&original.header.sequence].retry_count, 1);
        assert_eq!(transport.stats().retransmissions, 1);

        let deadline = Instant::now() + Duration::from_secs(2);
        let err = loop {
            assert!(Instant::now() < deadline);
            match transport.service() {
                Ok(()) => sleep(Duration::from_millis(5)).await,
                Err(e) => break e,
            }
        };
        assert!(matches!(err, NetworkError::PacketLost { sequence } if sequence == original.header.sequence));
        assert_eq!(transport.stats().packets_lost, 1);
        assert_eq!(transport.stats().retransmissions, 5);
        assert_eq!(transport.pending_count(), 0);
        assert_eq!(transport.state(), ConnectionState::Closed);
    }

    #[test]
    fn test_local_close_handshake() {
        let peer = RawPeer::new();
        let mut transport = bind(loopback_config());
        peer.open(&mut transport, 0);

        transport.close().unwrap();
        assert_eq!(transport.state(), ConnectionState::Closing);
        assert_eq!(peer.recv().header.flags, PacketFlags::FIN);

        peer.send(&transport, &Packet::control(0, 1000, PacketFlags::FIN | PacketFlags::ACK, 64));
        poll_until(&mut transport, |t| t.state() == ConnectionState::Closed);
        assert_eq!(peer.recv().header.flags, PacketFlags::ACK);
    }

    #[test]
    fn test_peer_close_handshake() {
        let peer = RawPeer::new();
        let mut transport = bind(loopback_config());
        peer.open(&mut transport, 0);

        peer.send(&transport, &Packet::control(0, 1000, PacketFlags::FIN, 64));
        poll_until(&mut transport, |t| t.state() == ConnectionState::Closing);
        assert_eq!(peer.recv().header.flags, PacketFlags::FIN | PacketFlags::ACK);

        peer.send(&transport, &Packet::control(0, 1000, PacketFlags::ACK, 64));
        poll_until(&mut transport, |t| t.state() == ConnectionState::Closed);
    }

    #[test]
    fn test_fin_waits_for_missing_data() {
        let peer = RawPeer::new();
        let mut transport = bind(loopback_config());
        peer.open(&mut transport, 0);

        // Data 0 never arrived; the FIN after it did
        peer.send(&transport, &Packet::control(1, 1000, PacketFlags::FIN, 64));
        poll_until(&mut transport, |t| t.peer_fin.is_some());
        assert_eq!(transport.state(), ConnectionState::Connected);
        let ack = peer.recv();
        assert_eq!(ack.header.flags, PacketFlags::ACK);
        assert_eq!(ack.header.acknowledgment, 0);

        peer.send(&transport, &RawPeer::data(0, b"tail"));
        assert_eq!(collect(&mut transport, 1)[0].as_ref(), b"tail");
        assert_eq!(transport.state(), ConnectionState::Closing);
        assert_eq!(peer.recv().header.acknowledgment, 1);
        assert_eq!(peer.recv().header.flags, PacketFlags::FIN | PacketFlags::ACK);

        peer.send(&transport, &Packet::control(1, 1000, PacketFlags::ACK, 64));
        poll_until(&mut transport, |t| t.state() == ConnectionState::Closed);
    }

    #[test]
    fn test_advertised_window_tracks_unread_payloads() {
        let peer = RawPeer::new();
        let mut transport = bind(TransportConfig {
            window_size: 4,
            ..loopback_config()
        });
        let reply = peer.open(&mut transport, 0);
        assert_eq!(reply.header.window, 4);

        for i in 0..4u32 {
            peer.send(&transport, &RawPeer::data(i, b"x"));
        }
        poll_until(&mut transport, |t| t.reassembly.len() == 4);
        let windows: Vec<u16> = (0..4).map(|_| peer.recv().header.window).collect();
        assert_eq!(windows, vec![3, 2, 1, 0]);

        // One payload read is not worth an update, half a window is
        assert!(transport.recv().unwrap().is_some());
        assert!(peer.try_recv().is_none());
        assert!(transport.recv().unwrap().is_some());
        let update = peer.recv();
        assert_eq!(update.header.flags, PacketFlags::ACK);
        assert_eq!(update.header.acknowledgment, 4);
        assert_eq!(update.header.window, 2);
    }

    #[tokio::test]
    async fn test_sender_honours_advertised_window() {
        let peer = RawPeer::new();
        let mut transport = bind(loopback_config());
        peer.send(&transport, &Packet::control(0, 0, PacketFlags::SYN, 1));
        poll_until(&mut transport, |t| t.is_connected());
        peer.recv();

        let blocked =
            tokio::time::timeout(Duration::from_millis(50), transport.send(&[5u8; MAX_PAYLOAD * 2])).await;
        assert!(blocked.is_err());
        assert_eq!(peer.recv().header.sequence, 1000);
        assert!(peer.try_recv().is_none());

        // Acknowledged, but the reader has not made room yet
        peer.send(&transport, &Packet::control(0, 1001, PacketFlags::ACK, 0));
        let blocked = tokio::time::timeout(Duration::from_millis(50), transport.send(b"more")).await;
        assert!(blocked.is_err());
        assert_eq!(transport.pending_count(), 0);
        let query = peer.recv();
        assert_eq!(query.header.flags, PacketFlags::DATA | PacketFlags::ACK);
        assert_eq!(query.header.sequence, 1001);
        assert!(query.payload.is_empty());
        assert!(peer.try_recv().is_none());

        peer.send(&transport, &Packet::control(0, 1001, PacketFlags::ACK, 1));
        tokio::time::timeout(Duration::from_secs(1), transport.send(b"more"))
            .await
            .expect("window reopened")
            .unwrap();
        let data = peer.recv();
        assert_eq!(data.header.sequence, 1001);
        assert_eq!(data.payload.as_ref(), b"more");
    }

    #[test]
    fn test_window_query_answered() {
        let peer = RawPeer::new();
        let mut transport = bind(loopback_config());
        peer.open(&mut transport, 0);

        peer.send(&transport, &Packet::control(0, 1000, PacketFlags::DATA | PacketFlags::ACK, 64));
        poll_until(&mut transport, |t| t.stats().packets_received == 2);
        let reply = peer.recv();
        assert_eq!(reply.header.flags, PacketFlags::ACK);
        assert_eq!(reply.header.window, 64);
        assert!(transport.recv().unwrap().is_none());
    }

    #[test]
    fn test_syn_from_restarted_peer_resets() {
        let peer = RawPeer::new();
        let mut transport = bind(loopback_config());
        peer.open(&mut transport, 0);

        // Same stream start is only re-answered
        peer.send(&transport, &Packet::control(0, 0, PacketFlags::SYN, 64));
        poll_until(&mut transport, |t| t.stats().packets_received == 2);
        let reply = peer.recv();
        assert_eq!(reply.header.flags, PacketFlags::SYN | PacketFlags::ACK);
        assert_eq!(reply.header.sequence, 1000);
        assert!(transport.is_connected());

        peer.send(&transport, &Packet::control(900, 0, PacketFlags::SYN, 64));
        poll_until(&mut transport, |t| t.state() == ConnectionState::Closed);
        assert_eq!(peer.recv().header.flags, PacketFlags::RST);

        // Its next SYN opens a fresh stream
        peer.send(&transport, &Packet::control(900, 0, PacketFlags::SYN, 64));
        poll_until(&mut transport, |t| t.is_connected());
        assert_eq!(peer.recv().header.flags, PacketFlags::SYN | PacketFlags::ACK);
        assert_eq!(transport.recv_next, 900);
    }

    #[test]
    fn test_reset_closes_immediately() {
        let peer = RawPeer::new();
        let mut transport = bind(loopback_config());
        peer.open(&mut transport, 0);

        peer.send(&transport, &Packet::control(0, 0, PacketFlags::RST, 0));
        poll_until(&mut transport, |t| t.state() == ConnectionState::Closed);
    }

    #[test]
    fn test_config_validation() {
        assert!(TransportConfig::default().validate().is_ok());
        let bad = TransportConfig {
            max_payload: MAX_PAYLOAD + 1,
            ..Default::default()
        };
        assert!(bad.validate().is_err());
        let bad = TransportConfig {
            window_size: 0,
            ..Default::default()
        };
        assert!(ReliableTransport::bind("127.0.0.1:0".parse().unwrap(), bad).is_err());
    }
}
