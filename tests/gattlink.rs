//! Property tests against the bare `GattlinkProtocol` engine, using a
//! minimal `GattlinkClient` that loops two protocol instances' raw frames
//! into each other through the owning `EventLoop` — the same deferred
//! dispatch `gattlink::client::TransportSideSink` uses for real transport
//! data, needed here for the same reason: one side's `send_raw_data` can
//! be called while that side's own protocol mutex is still held a few
//! frames up the stack, so delivery to the peer has to be posted rather
//! than called in-line.

use std::sync::{Arc, Mutex, Weak};

use golden_gate::gattlink::protocol::{GattlinkClient, GattlinkProtocol, GattlinkSessionConfig, ProtocolHandle, ProtocolState};
use golden_gate::loop_::EventLoop;
use golden_gate::{GgError, GgResult};

struct LinkedClient {
    outgoing: golden_gate::buffer::RingBuffer,
    loop_: Arc<EventLoop>,
    peer: Weak<Mutex<GattlinkProtocol<LinkedClient>>>,
    resets_seen: usize,
    ready_seen: usize,
}

impl LinkedClient {
    fn new(loop_: &Arc<EventLoop>, outgoing_capacity: usize) -> LinkedClient {
        LinkedClient {
            outgoing: golden_gate::buffer::RingBuffer::new(outgoing_capacity),
            loop_: Arc::clone(loop_),
            peer: Weak::new(),
            resets_seen: 0,
            ready_seen: 0,
        }
    }
}

impl GattlinkClient for LinkedClient {
    fn get_outgoing_data_available(&mut self) -> usize {
        self.outgoing.available()
    }

    fn get_outgoing_data(&mut self, offset: usize, buf: &mut [u8]) -> GgResult<()> {
        self.outgoing.peek(offset, buf).map_err(|_| GgError::OutOfRange)
    }

    fn consume_outgoing_data(&mut self, size: usize) {
        let _ = self.outgoing.consume(size);
    }

    fn notify_incoming_data_available(&mut self) {}

    fn get_transport_max_packet_size(&mut self) -> usize {
        32
    }

    fn send_raw_data(&mut self, data: &[u8]) -> GgResult<()> {
        let peer = match self.peer.upgrade() {
            Some(p) => p,
            None => return Err(GgError::InvalidState),
        };
        let bytes = data.to_vec();
        self.loop_.invoke_async(move || {
            let _ = GattlinkProtocol::handle_incoming_raw_data(&peer, &bytes);
        });
        Ok(())
    }

    fn notify_session_ready(&mut self) {
        self.ready_seen += 1;
    }

    fn notify_session_reset(&mut self) {
        self.resets_seen += 1;
    }

    fn notify_session_stalled(&mut self, _stalled_time_ms: u32) {}
}

fn linked_pair(
    loop_: &Arc<EventLoop>,
    config: GattlinkSessionConfig,
) -> (ProtocolHandle<LinkedClient>, ProtocolHandle<LinkedClient>) {
    let a = GattlinkProtocol::new(LinkedClient::new(loop_, 4096), config, Arc::clone(loop_), 4096);
    let b = GattlinkProtocol::new(LinkedClient::new(loop_, 4096), config, Arc::clone(loop_), 4096);
    a.lock().unwrap().client_mut().peer = Arc::downgrade(&b);
    b.lock().unwrap().client_mut().peer = Arc::downgrade(&a);
    (a, b)
}

fn handshake(loop_: &Arc<EventLoop>, a: &ProtocolHandle<LinkedClient>, b: &ProtocolHandle<LinkedClient>) {
    GattlinkProtocol::start(a).unwrap();
    GattlinkProtocol::start(b).unwrap();
    loop_.run_until_idle(64).unwrap();
    assert_eq!(a.lock().unwrap().state(), ProtocolState::Ready);
    assert_eq!(b.lock().unwrap().state(), ProtocolState::Ready);
}

fn queue_outgoing(protocol: &ProtocolHandle<LinkedClient>, data: &[u8]) {
    let mut this = protocol.lock().unwrap();
    this.client_mut().outgoing.write(data).expect("room in test outgoing buffer");
    drop(this);
    GattlinkProtocol::notify_outgoing_data_available(protocol);
}

/// PSNs only ever increase (mod 256) while sending, never reset mid-session.
#[test]
fn psn_does_not_move_backwards_absent_a_reset() {
    let loop_ = Arc::new(EventLoop::new());
    let (a, b) = linked_pair(&loop_, GattlinkSessionConfig::default());
    handshake(&loop_, &a, &b);

    let mut last_outstanding = a.lock().unwrap().outstanding_count();
    for chunk in 0..20u8 {
        queue_outgoing(&a, &[chunk; 3]);
        loop_.run_until_idle(64).unwrap();
        let outstanding = a.lock().unwrap().outstanding_count();
        assert!(outstanding <= last_outstanding + 1 || outstanding == 0);
        last_outstanding = outstanding;
    }
    assert_eq!(a.lock().unwrap().outstanding_count(), 0);
}

/// `outstanding_count()` must never exceed the negotiated tx window, even
/// when the sender has much more data queued than the window allows.
#[test]
fn outstanding_frames_never_exceed_negotiated_window() {
    let loop_ = Arc::new(EventLoop::new());
    let config = GattlinkSessionConfig::new(4, 4).unwrap();
    let (a, b) = linked_pair(&loop_, config);
    handshake(&loop_, &a, &b);

    for i in 0..40u8 {
        queue_outgoing(&a, &[i]);
        let outstanding = a.lock().unwrap().outstanding_count();
        assert!(
            outstanding <= config.max_tx_window as usize,
            "outstanding {} exceeded window {}",
            outstanding,
            config.max_tx_window
        );
    }
    loop_.run_until_idle(256).unwrap();
    assert_eq!(a.lock().unwrap().outstanding_count(), 0);
}

/// Resetting one side is idempotent and flushes its outstanding frames.
#[test]
fn reset_is_idempotent_and_flushes_outstanding() {
    let loop_ = Arc::new(EventLoop::new());
    let (a, b) = linked_pair(&loop_, GattlinkSessionConfig::default());
    handshake(&loop_, &a, &b);

    queue_outgoing(&a, &[1, 2, 3]);
    queue_outgoing(&a, &[4, 5, 6]);
    assert!(a.lock().unwrap().outstanding_count() > 0);

    GattlinkProtocol::reset(&a).unwrap();
    assert_eq!(a.lock().unwrap().outstanding_count(), 0);
    assert_eq!(a.lock().unwrap().state(), ProtocolState::Init);

    // A second reset from the same state changes nothing further.
    GattlinkProtocol::reset(&a).unwrap();
    assert_eq!(a.lock().unwrap().outstanding_count(), 0);
    assert_eq!(a.lock().unwrap().state(), ProtocolState::Init);
}

/// Delivered bytes arrive in the order they were sent, even across many
/// independently queued writes.
#[test]
fn delivers_data_in_order_across_many_writes() {
    let loop_ = Arc::new(EventLoop::new());
    let (a, b) = linked_pair(&loop_, GattlinkSessionConfig::default());
    handshake(&loop_, &a, &b);

    let mut expected = Vec::new();
    for i in 0..30u8 {
        let chunk = vec![i; 2];
        queue_outgoing(&a, &chunk);
        expected.extend_from_slice(&chunk);
    }
    loop_.run_until_idle(512).unwrap();

    let this = b.lock().unwrap();
    let avail = this.get_incoming_data_available();
    let mut received = vec![0u8; avail];
    this.get_incoming_data(0, &mut received).unwrap();
    assert_eq!(received, expected);
}
