//! Ports, sources and sinks: the connective tissue of a stack.
//!
//! `rips` builds its pipeline out of concrete `*Tx`/`*Rx` pairs glued
//! together by direct Rust calls (`Ipv4Tx` owns an `EthernetTx`, `UdpRx`
//! is fed by `Ipv4Rx`). Golden Gate elements are instead wired generically
//! by the stack builder from a descriptor string, so the connection points
//! need to be trait objects: `DataSource`/`DataSink` generalize `rips::Tx`'s
//! "accept or hand back an error" contract (`rips::tx::Tx::send` either
//! sends or returns `TxError::InvalidTx` for the caller to retry), with
//! `GgError::WouldBlock` standing in for the retry signal and an explicit
//! `OnCanPut` listener replacing "just construct a new Tx and try again".

use std::sync::{Arc, Mutex};

use crate::buffer::BufferWithMetadata;
use crate::errors::{GgError, GgResult};

/// A callback invoked once a sink that previously returned `WouldBlock` can
/// accept a buffer again. Registered via `DataSource::set_can_put_listener`
/// (source side) or directly on a sink, depending on which side backed up.
pub type OnCanPut = Box<dyn FnMut() + Send>;

/// The receiving end of a port: something buffers can be pushed into.
pub trait DataSink: Send {
    /// Accepts `data`, or returns `GgError::WouldBlock` if the sink is
    /// temporarily full. On `WouldBlock` the caller must arrange to be
    /// notified via the matching `DataSource::set_can_put_listener` before
    /// trying again.
    fn put_data(&mut self, data: BufferWithMetadata) -> GgResult<()>;
}

/// The emitting end of a port: where a sink registers interest in resumed
/// capacity.
pub trait DataSource: Send {
    /// Registers (replacing any previous registration) the closure invoked
    /// the next time this source's downstream sink can accept data again.
    fn set_can_put_listener(&mut self, listener: OnCanPut);
}

/// A source/sink pair in one direction, the unit `Element`s expose at each
/// of their (up to two) ports.
pub struct Port {
    pub source: Box<dyn DataSource>,
    pub sink: Arc<Mutex<dyn DataSink>>,
}

/// A no-op source for ports that never need to signal resumed capacity
/// (e.g. a synchronous pass-through with no internal buffering).
pub struct NullSource;

impl DataSource for NullSource {
    fn set_can_put_listener(&mut self, _listener: OnCanPut) {}
}

/// A sink that stores pushed buffers in an unbounded `Vec`, used by tests and
/// by the "top"/"bottom" ends of a `Stack` that the application drives
/// directly (see `gg::testing`).
#[derive(Default)]
pub struct CollectingSink {
    pub received: Vec<BufferWithMetadata>,
}

impl DataSink for CollectingSink {
    fn put_data(&mut self, data: BufferWithMetadata) -> GgResult<()> {
        self.received.push(data);
        Ok(())
    }
}

/// Common lifecycle every stack element implements. The stack builder calls
/// `start` top-down, and `reset`/`destroy` bottom-up.
pub trait Element: Send {
    /// Begins operation (e.g. kicks off a Gattlink handshake).
    fn start(&mut self) -> GgResult<()> {
        Ok(())
    }

    /// Returns the element to a freshly-started state, discarding any
    /// buffered/in-flight state.
    fn reset(&mut self) -> GgResult<()> {
        Ok(())
    }

    /// Releases resources. After this call the element must not be used.
    fn destroy(&mut self) {}
}

/// A stack element with two ports — "top" (application side) and "bottom"
/// (transport side) — that can be wired to its neighbors independently of
/// construction. Generalizes the `connect_up`/`connect_down` pattern
/// `GattlinkGenericClient` implements, itself grounded in
/// `GG_ActivityDataMonitor_SetDataSink` (a sink settable after the fact
/// rather than required at construction). This is what lets the stack
/// builder assemble elements bottom-up: the element above doesn't exist yet
/// when the element below is constructed, so neither side can require the
/// other as a constructor argument.
pub trait StackElement: Element {
    /// This element's sink for its top port — what the element above pushes
    /// into.
    fn top_sink(&self) -> Arc<Mutex<dyn DataSink>>;
    /// This element's source for its top port — what the element above
    /// registers a resumed-capacity listener on.
    fn top_source(&self) -> Box<dyn DataSource>;
    /// This element's sink for its bottom port — what the element below
    /// pushes into.
    fn bottom_sink(&self) -> Arc<Mutex<dyn DataSink>>;
    /// This element's source for its bottom port — what the element below
    /// registers a resumed-capacity listener on.
    fn bottom_source(&self) -> Box<dyn DataSource>;

    /// Wires the neighbor above: `sink`/`source` are that neighbor's bottom
    /// port.
    fn connect_up(&self, sink: Arc<Mutex<dyn DataSink>>, source: Box<dyn DataSource>);
    /// Wires the neighbor below: `sink`/`source` are that neighbor's top
    /// port.
    fn connect_down(&self, sink: Arc<Mutex<dyn DataSink>>, source: Box<dyn DataSource>);
}

/// Errors specific to composing elements into a stack. Kept distinct from
/// `GgError` because they are all caller-contract violations discovered at
/// build time, not runtime conditions.
pub fn unknown_element_char(c: char) -> GgError {
    GgError::InvalidParameters(format!("unknown stack element character '{}'", c))
}
