//! Minimal, explicitly-opaque stand-ins for the external collaborators a
//! stack descriptor can name (`D`/`S`/`N`) but whose real protocol
//! internals — a DTLS record layer, real socket demultiplexing, a real
//! link/IP stack — sit outside this crate. Each is just enough of an
//! `Element`/`StackElement` to compose and exercise the stack builder and
//! Gattlink end-to-end.

use std::net::Ipv4Addr;
use std::sync::{Arc, Mutex};

use log::{debug, trace, warn};
use pnet::packet::ipv4::Ipv4Packet;
use pnet::packet::udp::UdpPacket;
use pnet::packet::Packet;
use rand::Rng;

use crate::buffer::{Buffer, BufferMetadata, BufferWithMetadata};
use crate::element::{DataSink, DataSource, Element, NullSource, StackElement};
use crate::errors::{GgError, GgResult};
use crate::event::EventEmitter;
use crate::ipv4_frame::assembler::build_datagram;
use crate::ipv4_frame::{Ipv4FrameAssembler, Ipv4FrameSerializer};

/// Matches `rips::stack::NetworkStack`'s ephemeral port range.
pub const LOCAL_PORT_RANGE_START: u16 = 32768;
pub const LOCAL_PORT_RANGE_END: u16 = 61000;

fn pick_ephemeral_port() -> u16 {
    rand::thread_rng().gen_range(LOCAL_PORT_RANGE_START, LOCAL_PORT_RANGE_END)
}

struct Wiring {
    up: Option<Arc<Mutex<dyn DataSink>>>,
    down: Option<Arc<Mutex<dyn DataSink>>>,
}

impl Wiring {
    fn new() -> Wiring {
        Wiring { up: None, down: None }
    }
}

/// Session-state notifications a real DTLS record layer would emit on
/// handshake progress. Record-layer codec and cipher negotiation are out of
/// scope here; this element only tracks whether one has been told to start.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TlsStateChange {
    Handshaking,
    Idle,
}

/// Pass-through placeholder for the DTLS record layer. Forwards bytes
/// unchanged in both directions and emits `TlsStateChange` on start/reset so
/// a stack composed with a `D` element still has something to observe.
pub struct DtlsElement {
    wiring: Arc<Mutex<Wiring>>,
    events: Arc<EventEmitter<TlsStateChange>>,
}

struct DtlsSink {
    wiring: Arc<Mutex<Wiring>>,
    forward_down: bool,
}

impl DataSink for DtlsSink {
    fn put_data(&mut self, data: BufferWithMetadata) -> GgResult<()> {
        let wiring = self.wiring.lock().expect("dtls wiring lock poisoned");
        let target = if self.forward_down { &wiring.down } else { &wiring.up };
        match target {
            Some(sink) => sink.lock().expect("dtls neighbor sink poisoned").put_data(data),
            None => Err(GgError::InvalidState),
        }
    }
}

impl DtlsElement {
    pub fn new() -> DtlsElement {
        DtlsElement {
            wiring: Arc::new(Mutex::new(Wiring::new())),
            events: Arc::new(EventEmitter::new()),
        }
    }

    pub fn events(&self) -> Arc<EventEmitter<TlsStateChange>> {
        Arc::clone(&self.events)
    }
}

impl Default for DtlsElement {
    fn default() -> Self {
        DtlsElement::new()
    }
}

impl Element for DtlsElement {
    fn start(&mut self) -> GgResult<()> {
        debug!("dtls placeholder: starting (pass-through, no real handshake)");
        self.events.emit(TlsStateChange::Handshaking);
        Ok(())
    }

    fn reset(&mut self) -> GgResult<()> {
        debug!("dtls placeholder: reset");
        self.events.emit(TlsStateChange::Idle);
        Ok(())
    }
}

impl StackElement for DtlsElement {
    fn top_sink(&self) -> Arc<Mutex<dyn DataSink>> {
        Arc::new(Mutex::new(DtlsSink {
            wiring: Arc::clone(&self.wiring),
            forward_down: true,
        }))
    }

    fn top_source(&self) -> Box<dyn DataSource> {
        Box::new(NullSource)
    }

    fn bottom_sink(&self) -> Arc<Mutex<dyn DataSink>> {
        Arc::new(Mutex::new(DtlsSink {
            wiring: Arc::clone(&self.wiring),
            forward_down: false,
        }))
    }

    fn bottom_source(&self) -> Box<dyn DataSource> {
        Box::new(NullSource)
    }

    fn connect_up(&self, sink: Arc<Mutex<dyn DataSink>>, _source: Box<dyn DataSource>) {
        self.wiring.lock().expect("dtls wiring lock poisoned").up = Some(sink);
    }

    fn connect_down(&self, sink: Arc<Mutex<dyn DataSink>>, _source: Box<dyn DataSource>) {
        self.wiring.lock().expect("dtls wiring lock poisoned").down = Some(sink);
    }
}

/// Addressing for a `DatagramSocketElement`. A `local_port` of `0` means
/// "assign an ephemeral port at construction time", mirroring
/// `rips::stack::NetworkStack::get_random_port`.
#[derive(Debug, Clone, Copy)]
pub struct DatagramSocketParameters {
    pub local_address: Ipv4Addr,
    pub local_port: u16,
    pub remote_address: Ipv4Addr,
    pub remote_port: u16,
}

struct SocketState {
    params: DatagramSocketParameters,
    next_identification: u16,
    wiring: Wiring,
}

/// Builds/parses full IPv4+UDP datagrams around a raw UDP payload, attaching
/// `BufferMetadata::SourceSocketAddress`/`DestinationSocketAddress` sidecars
/// so the application layer above sees addresses without seeing headers.
pub struct DatagramSocketElement {
    state: Arc<Mutex<SocketState>>,
}

struct SocketTopSink {
    state: Arc<Mutex<SocketState>>,
}

impl DataSink for SocketTopSink {
    fn put_data(&mut self, data: BufferWithMetadata) -> GgResult<()> {
        let mut this = self.state.lock().expect("datagram socket lock poisoned");
        let (src, dst) = match data.metadata {
            BufferMetadata::DestinationSocketAddress(addr, port) => (
                (this.params.local_address, this.params.local_port),
                (addr, port),
            ),
            _ => (
                (this.params.local_address, this.params.local_port),
                (this.params.remote_address, this.params.remote_port),
            ),
        };
        let datagram = build_datagram(
            src.0,
            dst.0,
            src.1,
            dst.1,
            &data.buffer,
            &mut this.next_identification,
        )?;
        let down = this.wiring.down.clone();
        drop(this);
        match down {
            Some(sink) => sink.lock().expect("datagram socket downstream poisoned").put_data(
                BufferWithMetadata::new(Buffer::from_vec(datagram)),
            ),
            None => Err(GgError::InvalidState),
        }
    }
}

struct SocketBottomSink {
    state: Arc<Mutex<SocketState>>,
}

impl DataSink for SocketBottomSink {
    fn put_data(&mut self, data: BufferWithMetadata) -> GgResult<()> {
        let ip_packet = Ipv4Packet::new(&data.buffer).ok_or_else(|| {
            warn!("datagram socket: dropping datagram with malformed IPv4 header");
            GgError::InvalidParameters("malformed IPv4 header".to_owned())
        })?;
        let udp_packet = UdpPacket::new(ip_packet.payload()).ok_or_else(|| {
            warn!("datagram socket: dropping datagram with malformed UDP header");
            GgError::InvalidParameters("malformed UDP header".to_owned())
        })?;
        let source = ip_packet.get_source();
        let sport = udp_packet.get_source();
        let payload = udp_packet.payload().to_vec();

        let up = self
            .state
            .lock()
            .expect("datagram socket lock poisoned")
            .wiring
            .up
            .clone();
        let bwm = BufferWithMetadata::with_metadata(
            Buffer::from_vec(payload),
            BufferMetadata::SourceSocketAddress(source, sport),
        );
        match up {
            Some(sink) => sink.lock().expect("datagram socket upstream poisoned").put_data(bwm),
            None => Err(GgError::InvalidState),
        }
    }
}

impl DatagramSocketElement {
    pub fn new(mut params: DatagramSocketParameters) -> DatagramSocketElement {
        if params.local_port == 0 {
            params.local_port = pick_ephemeral_port();
            debug!("datagram socket: assigned ephemeral local port {}", params.local_port);
        }
        DatagramSocketElement {
            state: Arc::new(Mutex::new(SocketState {
                params,
                next_identification: 0,
                wiring: Wiring::new(),
            })),
        }
    }

    pub fn local_port(&self) -> u16 {
        self.state.lock().expect("datagram socket lock poisoned").params.local_port
    }
}

impl Element for DatagramSocketElement {}

impl StackElement for DatagramSocketElement {
    fn top_sink(&self) -> Arc<Mutex<dyn DataSink>> {
        Arc::new(Mutex::new(SocketTopSink {
            state: Arc::clone(&self.state),
        }))
    }

    fn top_source(&self) -> Box<dyn DataSource> {
        Box::new(NullSource)
    }

    fn bottom_sink(&self) -> Arc<Mutex<dyn DataSink>> {
        Arc::new(Mutex::new(SocketBottomSink {
            state: Arc::clone(&self.state),
        }))
    }

    fn bottom_source(&self) -> Box<dyn DataSource> {
        Box::new(NullSource)
    }

    fn connect_up(&self, sink: Arc<Mutex<dyn DataSink>>, _source: Box<dyn DataSource>) {
        self.state.lock().expect("datagram socket lock poisoned").wiring.up = Some(sink);
    }

    fn connect_down(&self, sink: Arc<Mutex<dyn DataSink>>, _source: Box<dyn DataSource>) {
        self.state.lock().expect("datagram socket lock poisoned").wiring.down = Some(sink);
    }
}

/// The stack's link-facing element. The original diagrams show an IP layer
/// sitting directly above the network interface but never exposed as its
/// own stack element; `NetworkInterfaceElement` is where that layer lives,
/// housing the `Ipv4FrameSerializer`/`Ipv4FrameAssembler` pair that
/// compresses outgoing datagrams before handing them to Gattlink and
/// reconstructs incoming ones coming back up.
pub struct NetworkInterfaceElement {
    serializer: Arc<Mutex<Ipv4FrameSerializer>>,
    assembler: Arc<Mutex<Ipv4FrameAssembler>>,
    mtu: usize,
    wiring: Arc<Mutex<Wiring>>,
}

struct InterfaceTopSink {
    serializer: Arc<Mutex<Ipv4FrameSerializer>>,
    wiring: Arc<Mutex<Wiring>>,
}

impl DataSink for InterfaceTopSink {
    fn put_data(&mut self, data: BufferWithMetadata) -> GgResult<()> {
        let frame = self
            .serializer
            .lock()
            .expect("ipv4 frame serializer lock poisoned")
            .serialize(&data.buffer)?;
        trace!("network interface: compressed {} bytes to {} bytes", data.buffer.len(), frame.len());
        let down = self.wiring.lock().expect("network interface wiring poisoned").down.clone();
        match down {
            Some(sink) => sink
                .lock()
                .expect("network interface downstream poisoned")
                .put_data(BufferWithMetadata::new(Buffer::from_vec(frame))),
            None => Err(GgError::InvalidState),
        }
    }
}

struct InterfaceBottomSink {
    assembler: Arc<Mutex<Ipv4FrameAssembler>>,
    wiring: Arc<Mutex<Wiring>>,
}

impl DataSink for InterfaceBottomSink {
    /// Gattlink's incoming byte stream carries no message boundaries of its
    /// own, and may hand bytes up in any chunking (one `put_data` per
    /// arrived fragment, or the whole backlog at once). `feed` accumulates
    /// across calls and yields every datagram that has fully arrived since
    /// the last one, so each is pushed upstream individually regardless of
    /// how many tunnel frames this particular call's bytes happened to
    /// contain.
    fn put_data(&mut self, data: BufferWithMetadata) -> GgResult<()> {
        let datagrams = self
            .assembler
            .lock()
            .expect("ipv4 frame assembler lock poisoned")
            .feed(&data.buffer)?;
        let up = self.wiring.lock().expect("network interface wiring poisoned").up.clone();
        let up = up.ok_or(GgError::InvalidState)?;
        for datagram in datagrams {
            up.lock()
                .expect("network interface upstream poisoned")
                .put_data(BufferWithMetadata::new(Buffer::from_vec(datagram)))?;
        }
        Ok(())
    }
}

impl NetworkInterfaceElement {
    pub fn new(
        serializer: Ipv4FrameSerializer,
        assembler: Ipv4FrameAssembler,
        mtu: usize,
    ) -> NetworkInterfaceElement {
        NetworkInterfaceElement {
            serializer: Arc::new(Mutex::new(serializer)),
            assembler: Arc::new(Mutex::new(assembler)),
            mtu,
            wiring: Arc::new(Mutex::new(Wiring::new())),
        }
    }

    pub fn mtu(&self) -> usize {
        self.mtu
    }
}

impl Element for NetworkInterfaceElement {}

impl StackElement for NetworkInterfaceElement {
    fn top_sink(&self) -> Arc<Mutex<dyn DataSink>> {
        Arc::new(Mutex::new(InterfaceTopSink {
            serializer: Arc::clone(&self.serializer),
            wiring: Arc::clone(&self.wiring),
        }))
    }

    fn top_source(&self) -> Box<dyn DataSource> {
        Box::new(NullSource)
    }

    fn bottom_sink(&self) -> Arc<Mutex<dyn DataSink>> {
        Arc::new(Mutex::new(InterfaceBottomSink {
            assembler: Arc::clone(&self.assembler),
            wiring: Arc::clone(&self.wiring),
        }))
    }

    fn bottom_source(&self) -> Box<dyn DataSource> {
        Box::new(NullSource)
    }

    fn connect_up(&self, sink: Arc<Mutex<dyn DataSink>>, _source: Box<dyn DataSource>) {
        self.wiring.lock().expect("network interface wiring poisoned").up = Some(sink);
    }

    fn connect_down(&self, sink: Arc<Mutex<dyn DataSink>>, _source: Box<dyn DataSource>) {
        self.wiring.lock().expect("network interface wiring poisoned").down = Some(sink);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::element::CollectingSink;
    use crate::ipv4_frame::IpConfig;

    fn ip_config() -> IpConfig {
        IpConfig {
            default_src_address: Ipv4Addr::new(10, 0, 0, 1),
            default_dst_address: Ipv4Addr::new(10, 0, 0, 2),
            udp_src_ports: [5683, 0, 0],
            udp_dst_ports: [5684, 0, 0],
        }
    }

    #[test]
    fn network_interface_compresses_then_reconstructs() {
        let up_net = NetworkInterfaceElement::new(
            Ipv4FrameSerializer::new(ip_config()),
            Ipv4FrameAssembler::new(ip_config(), 1280),
            1280,
        );
        let collecting_down: Arc<Mutex<CollectingSink>> = Arc::new(Mutex::new(CollectingSink::default()));
        up_net.connect_down(collecting_down.clone(), Box::new(NullSource));

        let mut id = 0u16;
        let datagram = build_datagram(
            Ipv4Addr::new(10, 0, 0, 1),
            Ipv4Addr::new(10, 0, 0, 2),
            5683,
            5684,
            &[9, 9],
            &mut id,
        )
        .unwrap();
        up_net
            .top_sink()
            .lock()
            .unwrap()
            .put_data(BufferWithMetadata::new(Buffer::from_vec(datagram.clone())))
            .unwrap();
        let compressed = collecting_down.lock().unwrap().received[0].buffer.clone();
        assert!(compressed.len() < datagram.len());

        let collecting_up: Arc<Mutex<CollectingSink>> = Arc::new(Mutex::new(CollectingSink::default()));
        up_net.connect_up(collecting_up.clone(), Box::new(NullSource));
        up_net
            .bottom_sink()
            .lock()
            .unwrap()
            .put_data(BufferWithMetadata::new(Buffer::from_slice(&compressed)))
            .unwrap();
        assert_eq!(collecting_up.lock().unwrap().received.len(), 1);
    }

    #[test]
    fn datagram_socket_assigns_ephemeral_port_when_zero() {
        let socket = DatagramSocketElement::new(DatagramSocketParameters {
            local_address: Ipv4Addr::new(10, 0, 0, 1),
            local_port: 0,
            remote_address: Ipv4Addr::new(10, 0, 0, 2),
            remote_port: 5684,
        });
        assert!(socket.local_port() >= LOCAL_PORT_RANGE_START);
        assert!(socket.local_port() < LOCAL_PORT_RANGE_END);
    }

    #[test]
    fn datagram_socket_round_trips_payload_with_source_metadata() {
        let socket = DatagramSocketElement::new(DatagramSocketParameters {
            local_address: Ipv4Addr::new(10, 0, 0, 1),
            local_port: 5683,
            remote_address: Ipv4Addr::new(10, 0, 0, 2),
            remote_port: 5684,
        });
        let collecting_down: Arc<Mutex<CollectingSink>> = Arc::new(Mutex::new(CollectingSink::default()));
        socket.connect_down(collecting_down.clone(), Box::new(NullSource));
        socket
            .top_sink()
            .lock()
            .unwrap()
            .put_data(BufferWithMetadata::new(Buffer::from_slice(&[1, 2, 3])))
            .unwrap();
        let datagram = collecting_down.lock().unwrap().received[0].buffer.clone();

        let collecting_up: Arc<Mutex<CollectingSink>> = Arc::new(Mutex::new(CollectingSink::default()));
        socket.connect_up(collecting_up.clone(), Box::new(NullSource));
        socket
            .bottom_sink()
            .lock()
            .unwrap()
            .put_data(BufferWithMetadata::new(Buffer::from_slice(&datagram)))
            .unwrap();
        let received = &collecting_up.lock().unwrap().received[0];
        assert_eq!(received.buffer.as_slice(), &[1, 2, 3]);
        assert!(matches!(
            received.metadata,
            BufferMetadata::SourceSocketAddress(addr, port) if addr == Ipv4Addr::new(10, 0, 0, 1) && port == 5683
        ));
    }
}
