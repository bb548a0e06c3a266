//! The Gattlink protocol engine: a sliding-window ARQ session layered over
//! an unreliable, fragment-limited transport.
//!
//! `rips::tx_internal`/`rips::ipv4::ipv4_rx` show the teacher's house style
//! for a stateful protocol object driven by discrete inbound events
//! (`EthernetListener::recv`, `Ipv4Listener::recv`) with a small owned state
//! machine. `GattlinkProtocol` follows the same shape — one object, driven by
//! `handle_incoming_raw_data`/`notify_outgoing_data_available`, delegating
//! actual I/O to a `GattlinkClient` implementor — generalized with a timer
//! scheduler because, unlike `rips`'s purely reactive Ethernet/IP layers,
//! this protocol must additionally retransmit, coalesce acks and detect
//! stalls on its own initiative (its own retransmit/stall timers).
//!
//! To keep this an explicit state machine on one loop thread rather than a
//! chain of nested callbacks, timers close over a `Weak` reference to the
//! protocol (held behind `Arc<Mutex<_>>`, matching `rips::lib::EthernetChannel`'s
//! own `Arc<Mutex<_>>` sharing), so a torn-down protocol simply lets its
//! pending timers become no-ops.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

use log::{debug, trace, warn};

use crate::buffer::RingBuffer;
use crate::errors::{GgError, GgResult};
use crate::gattlink::header::{psn_distance, psn_next, ControlOpcode, ControlPacket, Frame};
use crate::loop_::{EventLoop, TimerId};

const RETRANSMIT_BASE_DELAY: Duration = Duration::from_millis(2000);
const RETRANSMIT_MAX_DELAY: Duration = Duration::from_millis(8000);
const DELAYED_ACK_DELAY: Duration = Duration::from_millis(300);
const STALL_INTERVAL: Duration = Duration::from_millis(1000);

/// Maximum size of a single Gattlink fragment, matching
/// `GG_GATTLINK_MAX_PACKET_SIZE` in the original implementation.
pub const MAX_PACKET_SIZE: usize = 512;

/// Negotiated window sizes for a Gattlink session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GattlinkSessionConfig {
    pub max_tx_window: u8,
    pub max_rx_window: u8,
}

impl GattlinkSessionConfig {
    pub fn new(max_tx_window: u8, max_rx_window: u8) -> GgResult<GattlinkSessionConfig> {
        if !(1..=31).contains(&max_tx_window) || !(1..=31).contains(&max_rx_window) {
            return Err(GgError::InvalidParameters(
                "gattlink windows must be in 1..=31".to_owned(),
            ));
        }
        Ok(GattlinkSessionConfig {
            max_tx_window,
            max_rx_window,
        })
    }
}

impl Default for GattlinkSessionConfig {
    /// Matches `GG_GENERIC_GATTLINK_CLIENT_DEFAULT_MAX_{TX,RX}_WINDOW_SIZE` (8/8).
    fn default() -> Self {
        GattlinkSessionConfig {
            max_tx_window: 8,
            max_rx_window: 8,
        }
    }
}

/// The collaborator interface the protocol drives: owns the outgoing byte
/// buffer, the raw transport, and the session lifecycle notifications.
/// Implemented by `gattlink::client::GattlinkGenericClient`.
pub trait GattlinkClient: Send {
    fn get_outgoing_data_available(&mut self) -> usize;
    fn get_outgoing_data(&mut self, offset: usize, buf: &mut [u8]) -> GgResult<()>;
    fn consume_outgoing_data(&mut self, size: usize);
    fn notify_incoming_data_available(&mut self);
    fn get_transport_max_packet_size(&mut self) -> usize;
    fn send_raw_data(&mut self, data: &[u8]) -> GgResult<()>;
    fn notify_session_ready(&mut self);
    fn notify_session_reset(&mut self);
    fn notify_session_stalled(&mut self, stalled_time_ms: u32);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolState {
    Init,
    ResetSent,
    Ready,
    Error,
}

#[derive(Debug, Clone, Copy)]
struct OutstandingFrame {
    psn: u8,
    len: usize,
}

/// The Gattlink protocol engine, generic over its client implementation.
///
/// Lives behind `Arc<Mutex<_>>` (see [`ProtocolHandle`]) because its own
/// timers need to reach back into it from the event loop, possibly from a
/// different call stack than the one that armed them.
pub struct GattlinkProtocol<C: GattlinkClient> {
    client: C,
    config: GattlinkSessionConfig,
    loop_: Arc<EventLoop>,

    state: ProtocolState,

    next_psn_to_send: u8,
    oldest_unacked_psn: u8,
    outstanding: VecDeque<OutstandingFrame>,
    negotiated_tx_window: u8,

    next_psn_expected: u8,
    pending_delayed_ack: Option<u8>,
    negotiated_rx_window: u8,
    incoming: RingBuffer,

    retransmit_timer: Option<TimerId>,
    retransmit_delay: Duration,
    delayed_ack_timer: Option<TimerId>,
    stall_timer: Option<TimerId>,
    stall_since: Option<Instant>,
}

/// Shared handle to a protocol instance, used so timer closures can hold a
/// `Weak` back-reference instead of the protocol owning itself.
pub type ProtocolHandle<C> = Arc<Mutex<GattlinkProtocol<C>>>;

impl<C: GattlinkClient + 'static> GattlinkProtocol<C> {
    pub fn new(
        client: C,
        config: GattlinkSessionConfig,
        loop_: Arc<EventLoop>,
        incoming_buffer_size: usize,
    ) -> ProtocolHandle<C> {
        Arc::new(Mutex::new(GattlinkProtocol {
            client,
            config,
            loop_,
            state: ProtocolState::Init,
            next_psn_to_send: 0,
            oldest_unacked_psn: 0,
            outstanding: VecDeque::new(),
            negotiated_tx_window: 0,
            next_psn_expected: 0,
            pending_delayed_ack: None,
            negotiated_rx_window: 0,
            incoming: RingBuffer::new(incoming_buffer_size),
            retransmit_timer: None,
            retransmit_delay: RETRANSMIT_BASE_DELAY,
            delayed_ack_timer: None,
            stall_timer: None,
            stall_since: None,
        }))
    }

    pub fn state(&self) -> ProtocolState {
        self.state
    }

    pub fn outstanding_count(&self) -> usize {
        self.outstanding.len()
    }

    pub fn client(&self) -> &C {
        &self.client
    }

    pub fn client_mut(&mut self) -> &mut C {
        &mut self.client
    }

    // ---- public contract -------------------------------

    pub fn start(handle: &ProtocolHandle<C>) -> GgResult<()> {
        let mut this = handle.lock().expect("gattlink protocol lock poisoned");
        if this.state != ProtocolState::Init {
            return Err(GgError::InvalidState);
        }
        this.enter_reset_sent();
        drop(this);
        Self::arm_handshake_retry(handle);
        Ok(())
    }

    pub fn reset(handle: &ProtocolHandle<C>) -> GgResult<()> {
        let mut this = handle.lock().expect("gattlink protocol lock poisoned");
        this.cancel_all_timers();
        this.enter_reset_sent();
        drop(this);
        Self::arm_handshake_retry(handle);
        Ok(())
    }

    pub fn notify_outgoing_data_available(handle: &ProtocolHandle<C>) {
        Self::try_send(handle);
    }

    pub fn get_incoming_data_available(&self) -> usize {
        self.incoming.available()
    }

    pub fn get_incoming_data(&self, offset: usize, buf: &mut [u8]) -> GgResult<()> {
        self.incoming.peek(offset, buf).map_err(|_| GgError::OutOfRange)
    }

    pub fn consume_incoming_data(&mut self, size: usize) -> GgResult<()> {
        self.incoming
            .consume(size)
            .map_err(|_| GgError::InvalidParameters("consume exceeds available data".to_owned()))
    }

    pub fn handle_incoming_raw_data(handle: &ProtocolHandle<C>, bytes: &[u8]) -> GgResult<()> {
        let frame = match Frame::parse(bytes) {
            Some(f) => f,
            None => {
                trace!("gattlink: dropping {} malformed raw byte(s)", bytes.len());
                return Ok(()); // malformed: silently ignored
            }
        };
        match frame {
            Frame::Control(pkt) => Self::handle_control(handle, pkt),
            Frame::NakedAck { acked_psn } => {
                {
                    let mut this = handle.lock().expect("gattlink protocol lock poisoned");
                    if this.state == ProtocolState::Ready {
                        this.process_ack(acked_psn);
                    }
                }
                Self::try_send(handle);
                Ok(())
            }
            Frame::Data {
                piggyback_ack,
                psn,
                payload,
            } => Self::handle_data(handle, piggyback_ack, psn, payload),
        }
    }

    // ---- control / handshake -------------------------------------------

    fn handle_control(handle: &ProtocolHandle<C>, pkt: ControlPacket) -> GgResult<()> {
        match pkt.opcode {
            ControlOpcode::ResetReq => {
                let mut this = handle.lock().expect("gattlink protocol lock poisoned");
                let was_ready = this.state == ProtocolState::Ready;
                this.cancel_all_timers();
                this.negotiated_tx_window = this.config.max_tx_window.min(pkt.rx_window);
                this.negotiated_rx_window = this.config.max_rx_window.min(pkt.tx_window);
                this.flush_send_state();
                this.next_psn_expected = 0;
                this.incoming = RingBuffer::new(this.incoming.capacity());
                this.send_control(ControlOpcode::ResetConf);
                this.state = ProtocolState::Ready;
                debug!("gattlink: peer-initiated reset, session ready (tx_window={}, rx_window={})",
                    this.negotiated_tx_window, this.negotiated_rx_window);
                if was_ready {
                    this.client.notify_session_reset();
                }
                this.client.notify_session_ready();
                Ok(())
            }
            ControlOpcode::ResetConf => {
                {
                    let mut this = handle.lock().expect("gattlink protocol lock poisoned");
                    if this.state != ProtocolState::ResetSent {
                        return Ok(()); // duplicate/unexpected, ignore
                    }
                    if pkt.rx_window == 0 || pkt.tx_window == 0 {
                        // Incompatible handshake: stay in ResetSent, the
                        // handshake retry timer will resend RESET_REQ.
                        return Ok(());
                    }
                    this.cancel_all_timers();
                    this.negotiated_tx_window = this.config.max_tx_window.min(pkt.rx_window);
                    this.negotiated_rx_window = this.config.max_rx_window.min(pkt.tx_window);
                    this.state = ProtocolState::Ready;
                    debug!("gattlink: self-initiated handshake complete, session ready (tx_window={}, rx_window={})",
                        this.negotiated_tx_window, this.negotiated_rx_window);
                    this.client.notify_session_ready();
                }
                Self::try_send(handle);
                Ok(())
            }
        }
    }

    fn enter_reset_sent(&mut self) {
        self.flush_send_state();
        self.next_psn_expected = 0;
        self.pending_delayed_ack = None;
        self.negotiated_tx_window = 0;
        self.negotiated_rx_window = 0;
        self.incoming = RingBuffer::new(self.incoming.capacity());
        self.state = ProtocolState::ResetSent;
        self.retransmit_delay = RETRANSMIT_BASE_DELAY;
        self.send_control(ControlOpcode::ResetReq);
    }

    fn send_control(&mut self, opcode: ControlOpcode) {
        let pkt = ControlPacket {
            opcode,
            rx_window: self.config.max_rx_window,
            tx_window: self.config.max_tx_window,
        };
        let mut out = [0u8; ControlPacket::WIRE_SIZE];
        pkt.encode(&mut out);
        let _ = self.client.send_raw_data(&out);
    }

    fn arm_handshake_retry(handle: &ProtocolHandle<C>) {
        Self::arm_retransmit_timer(handle, RETRANSMIT_BASE_DELAY);
    }

    // ---- sending ---------------------------------------------------------

    fn try_send(handle: &ProtocolHandle<C>) {
        loop {
            let mut this = handle.lock().expect("gattlink protocol lock poisoned");
            if this.state != ProtocolState::Ready {
                return;
            }
            let budget = this
                .negotiated_tx_window
                .saturating_sub(this.outstanding.len() as u8);
            if budget == 0 {
                return;
            }
            let outstanding_bytes: usize = this.outstanding.iter().map(|f| f.len).sum();
            let available = this.client.get_outgoing_data_available();
            let unsent = available.saturating_sub(outstanding_bytes);
            let piggyback = this.pending_delayed_ack;
            let mtu = this.client.get_transport_max_packet_size();
            let header_len = Frame::header_len(piggyback.is_some());
            if mtu <= header_len {
                return;
            }
            let max_payload = mtu - header_len;
            let payload_len = unsent.min(max_payload);
            if payload_len == 0 {
                if let Some(acked) = piggyback {
                    this.pending_delayed_ack = None;
                    this.cancel_delayed_ack_timer();
                    let mut out = [0u8; 1];
                    Frame::write_naked_ack(acked, &mut out);
                    let _ = this.client.send_raw_data(&out);
                }
                return;
            }
            let mut payload_buf = vec![0u8; payload_len];
            if this
                .client
                .get_outgoing_data(outstanding_bytes, &mut payload_buf)
                .is_err()
            {
                return;
            }
            let psn = this.next_psn_to_send;
            let mut out = vec![0u8; header_len + payload_len];
            Frame::write_data(piggyback, psn, &payload_buf, &mut out);
            match this.client.send_raw_data(&out) {
                Ok(()) => {
                    this.pending_delayed_ack = None;
                    this.cancel_delayed_ack_timer();
                    this.next_psn_to_send = psn_next(psn);
                    let was_idle = this.outstanding.is_empty();
                    this.outstanding.push_back(OutstandingFrame {
                        psn,
                        len: payload_len,
                    });
                    if was_idle {
                        this.stall_since = Some(Instant::now());
                        drop(this);
                        Self::arm_stall_timer(handle);
                        Self::arm_retransmit_timer(handle, RETRANSMIT_BASE_DELAY);
                        continue;
                    }
                }
                Err(_) => return, // caller will retry via the retransmit timer
            }
        }
    }

    // ---- receiving ---------------------------------------------------------

    fn handle_data(
        handle: &ProtocolHandle<C>,
        piggyback_ack: Option<u8>,
        psn: u8,
        payload: &[u8],
    ) -> GgResult<()> {
        {
            let mut this = handle.lock().expect("gattlink protocol lock poisoned");
            if let Some(acked) = piggyback_ack {
                if this.state == ProtocolState::Ready {
                    this.process_ack(acked);
                }
            }
        }
        let armed;
        {
            let mut this = handle.lock().expect("gattlink protocol lock poisoned");
            if this.state != ProtocolState::Ready {
                return Ok(());
            }
            if psn != this.next_psn_expected {
                let last_in_order_psn = this.next_psn_expected.wrapping_sub(1) & 0x1F;
                let mut out = [0u8; 1];
                Frame::write_naked_ack(last_in_order_psn, &mut out);
                let _ = this.client.send_raw_data(&out);
                this.pending_delayed_ack = None;
                this.cancel_delayed_ack_timer();
                warn!(
                    "gattlink: unexpected psn {} (expected {}), re-acking {}",
                    psn, this.next_psn_expected, last_in_order_psn
                );
                return Err(GgError::GattlinkUnexpectedPsn);
            }
            if this.incoming.write(payload).is_err() {
                // No room yet; drop this delivery attempt, the peer will
                // retransmit once its own retransmit timer fires.
                return Ok(());
            }
            this.next_psn_expected = psn_next(psn);
            this.pending_delayed_ack = Some(psn);
            armed = this.delayed_ack_timer.is_some();
        }
        if !armed {
            Self::arm_delayed_ack_timer(handle);
        }
        handle
            .lock()
            .expect("gattlink protocol lock poisoned")
            .client
            .notify_incoming_data_available();
        Ok(())
    }

    fn process_ack(&mut self, acked_psn: u8) {
        if self.outstanding.is_empty() {
            return;
        }
        let dist = psn_distance(acked_psn, self.oldest_unacked_psn);
        if dist as usize >= self.outstanding.len() {
            return; // outside outstanding range: ignored
        }
        let acked_count = dist as usize + 1;
        let mut freed_bytes = 0usize;
        for _ in 0..acked_count {
            freed_bytes += self.outstanding.pop_front().expect("checked above").len;
        }
        self.client.consume_outgoing_data(freed_bytes);
        self.oldest_unacked_psn = psn_next(acked_psn);

        self.cancel_stall_timer();
        self.cancel_retransmit_timer();
        if self.outstanding.is_empty() {
            self.stall_since = None;
        } else {
            self.stall_since = Some(Instant::now());
            self.retransmit_delay = RETRANSMIT_BASE_DELAY;
        }
    }

    // ---- timers ---------------------------------------------------------

    fn arm_retransmit_timer(handle: &ProtocolHandle<C>, delay: Duration) {
        let weak = Arc::downgrade(handle);
        let loop_ = Arc::clone(&handle.lock().expect("gattlink protocol lock poisoned").loop_);
        let timer = loop_
            .post_timer(delay, move || Self::on_retransmit_timer(&weak))
            .ok();
        handle.lock().expect("gattlink protocol lock poisoned").retransmit_timer = timer;
    }

    fn arm_stall_timer(handle: &ProtocolHandle<C>) {
        let weak = Arc::downgrade(handle);
        let loop_ = Arc::clone(&handle.lock().expect("gattlink protocol lock poisoned").loop_);
        let timer = loop_
            .post_timer(STALL_INTERVAL, move || Self::on_stall_timer(&weak))
            .ok();
        handle.lock().expect("gattlink protocol lock poisoned").stall_timer = timer;
    }

    fn arm_delayed_ack_timer(handle: &ProtocolHandle<C>) {
        let weak = Arc::downgrade(handle);
        let loop_ = Arc::clone(&handle.lock().expect("gattlink protocol lock poisoned").loop_);
        let timer = loop_
            .post_timer(DELAYED_ACK_DELAY, move || Self::on_delayed_ack_timer(&weak))
            .ok();
        handle.lock().expect("gattlink protocol lock poisoned").delayed_ack_timer = timer;
    }

    fn on_retransmit_timer(weak: &Weak<Mutex<Self>>) {
        let handle = match weak.upgrade() {
            Some(h) => h,
            None => return,
        };
        let next_delay;
        {
            let mut this = handle.lock().expect("gattlink protocol lock poisoned");
            this.retransmit_timer = None;
            match this.state {
                ProtocolState::ResetSent => {
                    trace!("gattlink: handshake retry, next delay {:?}", double_capped(this.retransmit_delay));
                    this.send_control(ControlOpcode::ResetReq);
                    next_delay = double_capped(this.retransmit_delay);
                    this.retransmit_delay = next_delay;
                }
                ProtocolState::Ready if !this.outstanding.is_empty() => {
                    debug!("gattlink: retransmitting {} outstanding frame(s)", this.outstanding.len());
                    let mut offset = 0usize;
                    let frames: Vec<OutstandingFrame> = this.outstanding.iter().copied().collect();
                    for frame in frames {
                        let mut payload = vec![0u8; frame.len];
                        if this.client.get_outgoing_data(offset, &mut payload).is_ok() {
                            let mut out = vec![0u8; 1 + frame.len];
                            Frame::write_data(None, frame.psn, &payload, &mut out);
                            let _ = this.client.send_raw_data(&out);
                        }
                        offset += frame.len;
                    }
                    next_delay = double_capped(this.retransmit_delay);
                    this.retransmit_delay = next_delay;
                }
                _ => return,
            }
        }
        Self::arm_retransmit_timer(&handle, next_delay);
    }

    fn on_stall_timer(weak: &Weak<Mutex<Self>>) {
        let handle = match weak.upgrade() {
            Some(h) => h,
            None => return,
        };
        {
            let mut this = handle.lock().expect("gattlink protocol lock poisoned");
            this.stall_timer = None;
            if this.outstanding.is_empty() {
                this.stall_since = None;
                return;
            }
            let elapsed_ms = this
                .stall_since
                .map(|t| t.elapsed().as_millis() as u32)
                .unwrap_or(0);
            warn!("gattlink: session stalled for {} ms with outstanding frames unacked", elapsed_ms);
            this.client.notify_session_stalled(elapsed_ms);
        }
        Self::arm_stall_timer(&handle);
    }

    fn on_delayed_ack_timer(weak: &Weak<Mutex<Self>>) {
        let handle = match weak.upgrade() {
            Some(h) => h,
            None => return,
        };
        let mut this = handle.lock().expect("gattlink protocol lock poisoned");
        this.delayed_ack_timer = None;
        if let Some(acked) = this.pending_delayed_ack.take() {
            let mut out = [0u8; 1];
            Frame::write_naked_ack(acked, &mut out);
            let _ = this.client.send_raw_data(&out);
        }
    }

    fn cancel_retransmit_timer(&mut self) {
        if let Some(id) = self.retransmit_timer.take() {
            let _ = self.loop_.unschedule(id);
        }
    }

    fn cancel_stall_timer(&mut self) {
        if let Some(id) = self.stall_timer.take() {
            let _ = self.loop_.unschedule(id);
        }
    }

    fn cancel_delayed_ack_timer(&mut self) {
        if let Some(id) = self.delayed_ack_timer.take() {
            let _ = self.loop_.unschedule(id);
        }
    }

    fn cancel_all_timers(&mut self) {
        self.cancel_retransmit_timer();
        self.cancel_stall_timer();
        self.cancel_delayed_ack_timer();
        self.stall_since = None;
    }

    fn flush_send_state(&mut self) {
        self.cancel_all_timers();
        self.outstanding.clear();
        self.next_psn_to_send = 0;
        self.oldest_unacked_psn = 0;
    }
}

fn double_capped(delay: Duration) -> Duration {
    let doubled = delay * 2;
    if doubled > RETRANSMIT_MAX_DELAY {
        RETRANSMIT_MAX_DELAY
    } else {
        doubled
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc as StdArc, Mutex as StdMutex};

    #[derive(Default)]
    struct RecordingClient {
        sent: Vec<Vec<u8>>,
        outgoing: Vec<u8>,
        consumed: usize,
        ready_count: usize,
        reset_count: usize,
        stalled: Vec<u32>,
        max_packet_size: usize,
        incoming_notified: usize,
    }

    struct SharedClient(StdArc<StdMutex<RecordingClient>>);

    impl GattlinkClient for SharedClient {
        fn get_outgoing_data_available(&mut self) -> usize {
            let c = self.0.lock().unwrap();
            c.outgoing.len() - c.consumed
        }
        fn get_outgoing_data(&mut self, offset: usize, buf: &mut [u8]) -> GgResult<()> {
            let c = self.0.lock().unwrap();
            let start = c.consumed + offset;
            if start + buf.len() > c.outgoing.len() {
                return Err(GgError::OutOfRange);
            }
            buf.copy_from_slice(&c.outgoing[start..start + buf.len()]);
            Ok(())
        }
        fn consume_outgoing_data(&mut self, size: usize) {
            self.0.lock().unwrap().consumed += size;
        }
        fn notify_incoming_data_available(&mut self) {
            self.0.lock().unwrap().incoming_notified += 1;
        }
        fn get_transport_max_packet_size(&mut self) -> usize {
            self.0.lock().unwrap().max_packet_size
        }
        fn send_raw_data(&mut self, data: &[u8]) -> GgResult<()> {
            self.0.lock().unwrap().sent.push(data.to_vec());
            Ok(())
        }
        fn notify_session_ready(&mut self) {
            self.0.lock().unwrap().ready_count += 1;
        }
        fn notify_session_reset(&mut self) {
            self.0.lock().unwrap().reset_count += 1;
        }
        fn notify_session_stalled(&mut self, stalled_time_ms: u32) {
            self.0.lock().unwrap().stalled.push(stalled_time_ms);
        }
    }

    fn make_protocol(
        mtu: usize,
    ) -> (ProtocolHandle<SharedClient>, StdArc<StdMutex<RecordingClient>>) {
        let state = StdArc::new(StdMutex::new(RecordingClient {
            max_packet_size: mtu,
            ..Default::default()
        }));
        let client = SharedClient(StdArc::clone(&state));
        let loop_ = Arc::new(EventLoop::new());
        let protocol = GattlinkProtocol::new(client, GattlinkSessionConfig::default(), loop_, 4096);
        (protocol, state)
    }

    #[test]
    fn e1_self_initiated_open() {
        let (proto, state) = make_protocol(128);
        GattlinkProtocol::start(&proto).unwrap();
        assert_eq!(state.lock().unwrap().sent[0], vec![0x80, 0x00, 0x00, 0x08, 0x08]);
        assert_eq!(proto.lock().unwrap().state(), ProtocolState::ResetSent);

        let conf = [0x81, 0x00, 0x00, 0x08, 0x08];
        GattlinkProtocol::handle_incoming_raw_data(&proto, &conf).unwrap();
        assert_eq!(proto.lock().unwrap().state(), ProtocolState::Ready);
        assert_eq!(state.lock().unwrap().ready_count, 1);
    }

    #[test]
    fn e2_send_and_ack_round_trip() {
        let (proto, state) = make_protocol(5);
        GattlinkProtocol::start(&proto).unwrap();
        let conf = [0x81, 0x00, 0x00, 0x08, 0x08];
        GattlinkProtocol::handle_incoming_raw_data(&proto, &conf).unwrap();

        state.lock().unwrap().outgoing = vec![0x01, 0x02, 0x03, 0x04];
        GattlinkProtocol::notify_outgoing_data_available(&proto);
        let sent = state.lock().unwrap().sent.last().cloned().unwrap();
        assert_eq!(sent, vec![0x00, 0x01, 0x02, 0x03, 0x04]);
        assert_eq!(proto.lock().unwrap().outstanding_count(), 1);

        GattlinkProtocol::handle_incoming_raw_data(&proto, &[0x40]).unwrap();
        assert_eq!(proto.lock().unwrap().outstanding_count(), 0);
    }

    #[test]
    fn e3_gap_detection_sends_immediate_ack() {
        let (proto, _state) = make_protocol(128);
        GattlinkProtocol::start(&proto).unwrap();
        let conf = [0x81, 0x00, 0x00, 0x08, 0x08];
        GattlinkProtocol::handle_incoming_raw_data(&proto, &conf).unwrap();

        let mut frame = vec![0x02]; // psn = 2, expected 0
        frame.extend_from_slice(&[1, 2, 3]);
        let err = GattlinkProtocol::handle_incoming_raw_data(&proto, &frame).unwrap_err();
        assert!(matches!(err, GgError::GattlinkUnexpectedPsn));
        assert_eq!(proto.lock().unwrap().get_incoming_data_available(), 0);
    }

    #[test]
    fn e6_peer_reset_flushes_outstanding() {
        let (proto, state) = make_protocol(5);
        GattlinkProtocol::start(&proto).unwrap();
        let conf = [0x81, 0x00, 0x00, 0x08, 0x08];
        GattlinkProtocol::handle_incoming_raw_data(&proto, &conf).unwrap();

        state.lock().unwrap().outgoing = vec![9, 9, 9, 9, 9, 9];
        GattlinkProtocol::notify_outgoing_data_available(&proto);
        assert!(proto.lock().unwrap().outstanding_count() > 0);

        let req = [0x80, 0x00, 0x00, 0x08, 0x08];
        GattlinkProtocol::handle_incoming_raw_data(&proto, &req).unwrap();
        assert_eq!(proto.lock().unwrap().outstanding_count(), 0);
        assert_eq!(state.lock().unwrap().reset_count, 1);
        assert!(state.lock().unwrap().ready_count >= 1);
    }
}
