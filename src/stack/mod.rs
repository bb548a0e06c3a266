//! The composed pipeline: wiring elements built from a descriptor string
//! into a `Stack` handle, grounded in `gg_stack_builder.h`'s
//! `GG_StackBuilder_BuildStack`/`GG_Stack` API.
//!
//! `rips::stack::NetworkStack` owns a fixed set of concrete per-interface
//! layers (`StackInterface`, each with its own ethernet/arp/ipv4/icmp/udp
//! stage) built once at `add_interface` time. A Golden Gate `Stack` is the
//! same idea generalized to a caller-chosen, variable-length chain of
//! heterogeneous `StackElement`s, built from a descriptor string instead of
//! being hard-coded.

pub mod activity_monitor;
pub mod builder;
pub mod collaborators;

pub use activity_monitor::{ActivityMonitorChange, ActivityMonitorConfig, ActivityMonitorElement, Direction};
pub use builder::{build_stack, ElementParameters};
pub use collaborators::{
    DatagramSocketElement, DatagramSocketParameters, DtlsElement, NetworkInterfaceElement, TlsStateChange,
};

use std::any::Any;
use std::net::Ipv4Addr;
use std::sync::{Arc, Mutex};

use log::debug;

use crate::element::{DataSink, DataSource, StackElement};
use crate::errors::{GgError, GgResult};
use crate::event::EventEmitter;
use crate::gattlink::GattlinkEvent;

/// Which side of the tunnel this stack is: selects which of a configured
/// address pair is "local" and which is "remote". Mirrors `GG_StackRole`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StackRole {
    Hub,
    Node,
}

/// Mirrors `GG_StackIpConfiguration`'s `header_compression` field.
#[derive(Debug, Clone, Copy)]
pub struct HeaderCompression {
    pub enabled: bool,
    pub default_udp_port: u16,
}

/// Mirrors `GG_StackIpConfiguration`'s `inbound_address_remapping` field.
#[derive(Debug, Clone, Copy)]
pub struct InboundAddressRemapping {
    pub enabled: bool,
    pub source_address: Ipv4Addr,
    pub destination_address: Ipv4Addr,
}

/// Mirrors `GG_StackIpConfiguration`.
#[derive(Debug, Clone, Copy)]
pub struct IpStackConfig {
    pub local_address: Ipv4Addr,
    pub remote_address: Ipv4Addr,
    pub if_netmask: Ipv4Addr,
    pub ip_mtu: usize,
    pub header_compression: HeaderCompression,
    pub inbound_address_remapping: InboundAddressRemapping,
}

/// Stand-ins for `GG_STACK_BUILDER_DEFAULT_*`: a private /30 point-to-point
/// link between a hub and a single node, with header compression on and
/// the well-known CoAP port as the elided default.
pub const DEFAULT_HUB_ADDRESS: Ipv4Addr = Ipv4Addr::new(192, 168, 7, 1);
pub const DEFAULT_NODE_ADDRESS: Ipv4Addr = Ipv4Addr::new(192, 168, 7, 2);
pub const DEFAULT_NETMASK: Ipv4Addr = Ipv4Addr::new(255, 255, 255, 252);
pub const DEFAULT_IP_MTU: usize = 1280;
pub const DEFAULT_UDP_PORT: u16 = 5683;

impl IpStackConfig {
    /// Derives the default configuration for `role`: the hub/node address
    /// pair is fixed, but which one is "local" depends on which side this
    /// stack is standing on.
    pub fn defaults_for_role(role: StackRole) -> IpStackConfig {
        let (local_address, remote_address) = match role {
            StackRole::Hub => (DEFAULT_HUB_ADDRESS, DEFAULT_NODE_ADDRESS),
            StackRole::Node => (DEFAULT_NODE_ADDRESS, DEFAULT_HUB_ADDRESS),
        };
        IpStackConfig {
            local_address,
            remote_address,
            if_netmask: DEFAULT_NETMASK,
            ip_mtu: DEFAULT_IP_MTU,
            header_compression: HeaderCompression {
                enabled: true,
                default_udp_port: DEFAULT_UDP_PORT,
            },
            inbound_address_remapping: InboundAddressRemapping {
                enabled: false,
                source_address: Ipv4Addr::UNSPECIFIED,
                destination_address: Ipv4Addr::UNSPECIFIED,
            },
        }
    }
}

/// Which element (or virtual endpoint) a port query targets. `Top`/`Bottom`
/// mirror `GG_STACK_ELEMENT_ID_TOP`/`_BOTTOM`; `Index` mirrors
/// `GG_Stack_GetElementByIndex` — an explicit enum instead of the original's
/// integer sentinels, since index `0` is both a valid real index and the
/// `TOP` sentinel in the C API and would be ambiguous as a bare `u32` here.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElementRef {
    Top,
    Bottom,
    Index(usize),
}

/// Which of an element's two ports a query targets. Mirrors
/// `GG_STACK_PORT_ID_TOP`/`_BOTTOM`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortRef {
    Top,
    Bottom,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StackElementType {
    Dtls,
    DatagramSocket,
    NetworkInterface,
    Gattlink,
    ActivityMonitor,
}

/// Events from any element in the stack, labeled by source, delivered
/// through one composite `EventEmitter` as `gg_stack_builder.h`'s
/// `GG_Stack_AsEventEmitter` does for its single `GG_Event` type.
#[derive(Debug, Clone)]
pub enum StackEvent {
    Gattlink(GattlinkEvent),
    Activity(ActivityMonitorChange),
    Tls(TlsStateChange),
}

/// A fully wired, composed pipeline built from a descriptor string, owning
/// every element and routing lifecycle calls and events across all of them.
pub struct Stack {
    elements: Vec<(StackElementType, Box<dyn StackElement>)>,
    ip_config: IpStackConfig,
    events: Arc<EventEmitter<StackEvent>>,
    // Keeps the forwarding closures subscribed to each element's own typed
    // emitter alive for the lifetime of the stack; never read back.
    _forwarders: Vec<Box<dyn Any + Send + Sync>>,
}

impl Stack {
    pub(crate) fn new(
        elements: Vec<(StackElementType, Box<dyn StackElement>)>,
        ip_config: IpStackConfig,
        events: Arc<EventEmitter<StackEvent>>,
        forwarders: Vec<Box<dyn Any + Send + Sync>>,
    ) -> Stack {
        Stack {
            elements,
            ip_config,
            events,
            _forwarders: forwarders,
        }
    }

    pub fn ip_configuration(&self) -> &IpStackConfig {
        &self.ip_config
    }

    pub fn events(&self) -> Arc<EventEmitter<StackEvent>> {
        Arc::clone(&self.events)
    }

    pub fn element_count(&self) -> usize {
        self.elements.len()
    }

    /// The element type at `index`, ordered top to bottom (index `0` is the
    /// topmost element), mirroring `GG_Stack_GetElementByIndex`.
    pub fn element_type_at(&self, index: usize) -> GgResult<StackElementType> {
        self.elements.get(index).map(|(t, _)| *t).ok_or(GgError::OutOfRange)
    }

    fn resolve_index(&self, element: ElementRef) -> GgResult<usize> {
        match element {
            ElementRef::Top => Ok(0),
            ElementRef::Bottom => Ok(self.elements.len().saturating_sub(1)),
            ElementRef::Index(i) if i < self.elements.len() => Ok(i),
            ElementRef::Index(_) => Err(GgError::OutOfRange),
        }
    }

    /// Returns the (source, sink) pair for one port of one element, or of
    /// the stack's own top-most/bottom-most element via `ElementRef::Top`/
    /// `Bottom`. Mirrors `GG_Stack_GetPortById`.
    pub fn get_port(
        &self,
        element: ElementRef,
        port: PortRef,
    ) -> GgResult<(Box<dyn DataSource>, Arc<Mutex<dyn DataSink>>)> {
        let idx = self.resolve_index(element)?;
        let (_, el) = &self.elements[idx];
        Ok(match port {
            PortRef::Top => (el.top_source(), el.top_sink()),
            PortRef::Bottom => (el.bottom_source(), el.bottom_sink()),
        })
    }

    /// Starts every element, top-down.
    pub fn start(&mut self) -> GgResult<()> {
        debug!("stack: starting {} element(s)", self.elements.len());
        for (_, element) in self.elements.iter_mut() {
            element.start()?;
        }
        Ok(())
    }

    /// Resets every element, bottom-up.
    pub fn reset(&mut self) -> GgResult<()> {
        debug!("stack: resetting {} element(s)", self.elements.len());
        for (_, element) in self.elements.iter_mut().rev() {
            element.reset()?;
        }
        Ok(())
    }

    /// Destroys every element, bottom-up. The stack must not be used after
    /// this call.
    pub fn destroy(&mut self) {
        debug!("stack: destroying {} element(s)", self.elements.len());
        for (_, element) in self.elements.iter_mut().rev() {
            element.destroy();
        }
    }

    /// Wires the application-facing neighbor above the whole stack (the
    /// topmost element's top port). Equivalent to the `source`/`sink`
    /// arguments the original passes directly to `BuildStack`.
    pub fn connect_top(&self, sink: Arc<Mutex<dyn DataSink>>, source: Box<dyn DataSource>) {
        self.elements[0].1.connect_up(sink, source);
    }

    /// Wires the transport-facing neighbor below the whole stack (the
    /// bottommost element's bottom port) — the raw BLE/L2CAP link.
    pub fn connect_bottom(&self, sink: Arc<Mutex<dyn DataSink>>, source: Box<dyn DataSource>) {
        self.elements
            .last()
            .expect("a built stack always has at least one element")
            .1
            .connect_down(sink, source);
    }
}
