//! The Gattlink reliable-transport session: wire format, protocol engine,
//! buffer-fullness probe and the generic client that wires them to a port
//! pair.

pub mod client;
pub mod header;
pub mod probe;
pub mod protocol;

pub use client::{GattlinkEvent, GattlinkGenericClient};
pub use probe::{DataProbe, DataProbeConfig, DataProbeEvent};
pub use protocol::{GattlinkProtocol, GattlinkSessionConfig, ProtocolHandle, ProtocolState};
