//! Descriptor-driven stack construction, grounded in
//! `GG_StackBuilder_BuildStack`: parses a top-to-bottom descriptor string,
//! looks up per-type parameters from a caller-supplied list (falling back to
//! IP-configuration-derived defaults), builds every element, then wires each
//! adjacent pair.
//!
//! Construction order doesn't actually need to be bottom-up the way the
//! original requires it (each layer's sink must exist before the layer
//! above can be constructed with it as an argument): `StackElement`'s
//! settable `connect_up`/`connect_down` means every element's ports exist
//! as soon as the element itself does, independent of wiring. This builder
//! still constructs bottom-up, to mirror the original's order and because a
//! real DTLS/socket implementation dropped in later may reintroduce that
//! constraint.

use std::any::Any;
use std::sync::{Arc, Weak};

use log::debug;

use crate::element::{unknown_element_char, StackElement};
use crate::errors::{GgError, GgResult};
use crate::event::{EventEmitter, Listener};
use crate::gattlink::{GattlinkEvent, GattlinkGenericClient, GattlinkSessionConfig};
use crate::ipv4_frame::{IpConfig, IpMap, Ipv4FrameAssembler, Ipv4FrameSerializer};
use crate::loop_::EventLoop;

use super::activity_monitor::{ActivityMonitorChange, ActivityMonitorConfig, ActivityMonitorElement};
use super::collaborators::{
    DatagramSocketElement, DatagramSocketParameters, DtlsElement, NetworkInterfaceElement,
};
use super::{IpStackConfig, Stack, StackElementType, StackEvent, StackRole};

/// Default Gattlink transport fragment cap when the descriptor doesn't
/// supply an explicit `GattlinkSessionConfig`/MTU, within the 20-244 byte
/// range a BLE ATT MTU negotiation typically yields.
pub const DEFAULT_TRANSPORT_MTU: usize = 244;
const DEFAULT_GATTLINK_BUFFER_CAPACITY: usize = 4096;

/// Per-element-type construction parameters, looked up by type from the
/// list the caller passes to `build_stack`. Mirrors
/// `GG_StackBuilderParameters`'s tagged-union shape, minus the element types
/// that take no parameters of their own (`D`, `N`, which are configured
/// entirely from `IpStackConfig`).
#[derive(Debug, Clone)]
pub enum ElementParameters {
    Gattlink(GattlinkSessionConfig),
    DatagramSocket(DatagramSocketParameters),
    ActivityMonitor(ActivityMonitorConfig),
}

fn find_gattlink_config(parameters: &[ElementParameters]) -> GattlinkSessionConfig {
    parameters
        .iter()
        .find_map(|p| match p {
            ElementParameters::Gattlink(c) => Some(*c),
            _ => None,
        })
        .unwrap_or_default()
}

fn find_datagram_socket_params(
    parameters: &[ElementParameters],
    ip_config: &IpStackConfig,
) -> DatagramSocketParameters {
    parameters
        .iter()
        .find_map(|p| match p {
            ElementParameters::DatagramSocket(c) => Some(*c),
            _ => None,
        })
        .unwrap_or(DatagramSocketParameters {
            local_address: ip_config.local_address,
            local_port: 0,
            remote_address: ip_config.remote_address,
            remote_port: ip_config.header_compression.default_udp_port,
        })
}

fn find_activity_monitor_config(parameters: &[ElementParameters]) -> ActivityMonitorConfig {
    parameters
        .iter()
        .find_map(|p| match p {
            ElementParameters::ActivityMonitor(c) => Some(*c),
            _ => None,
        })
        .unwrap_or_default()
}

/// Builds the frame (de)compression config shared by the serializer and
/// assembler. The default addresses are the fixed hub/node pair regardless
/// of which side this stack is (derived from `role`, not from
/// `local_address`/`remote_address`, which swap per side): both ends must
/// agree on the same default pair for elision bits to mean the same thing
/// on either side of the tunnel. This compresses hub-to-node traffic (the
/// common direction for this link); node-to-hub traffic still round-trips
/// correctly, just with literal (uncompressed) addresses.
fn ip_frame_config(ip_config: &IpStackConfig, role: StackRole) -> IpConfig {
    if ip_config.header_compression.enabled {
        let (hub_address, node_address) = match role {
            StackRole::Hub => (ip_config.local_address, ip_config.remote_address),
            StackRole::Node => (ip_config.remote_address, ip_config.local_address),
        };
        IpConfig {
            default_src_address: hub_address,
            default_dst_address: node_address,
            udp_src_ports: [ip_config.header_compression.default_udp_port, 0, 0],
            udp_dst_ports: [ip_config.header_compression.default_udp_port, 0, 0],
        }
    } else {
        // An address/port table that nothing will ever match in practice,
        // so every frame keeps its literal fields uncompressed.
        IpConfig {
            default_src_address: std::net::Ipv4Addr::UNSPECIFIED,
            default_dst_address: std::net::Ipv4Addr::UNSPECIFIED,
            udp_src_ports: [0, 0, 0],
            udp_dst_ports: [0, 0, 0],
        }
    }
}

/// Subscribes `emitter`'s events onto `composite`, translated by `wrap`, and
/// returns the keep-alive handle the caller must retain for as long as the
/// subscription should stay live.
fn forward<E, F>(
    emitter: &Arc<EventEmitter<E>>,
    composite: &Arc<EventEmitter<StackEvent>>,
    wrap: F,
) -> Box<dyn Any + Send + Sync>
where
    E: Clone + Send + Sync + 'static,
    F: Fn(E) -> StackEvent + Send + Sync + 'static,
{
    let composite = Arc::clone(composite);
    let forwarder: Arc<dyn Listener<E>> = Arc::new(move |event: &E| {
        composite.emit(wrap(event.clone()));
    });
    let weak: Weak<dyn Listener<E>> = Arc::downgrade(&forwarder);
    emitter.subscribe(weak);
    Box::new(forwarder)
}

/// Builds and wires a `Stack` from a top-to-bottom descriptor string.
/// `D`=DTLS, `S`=datagram socket, `N`=network interface, `G`=Gattlink,
/// `A`=activity monitor. Unknown characters are rejected with
/// `GgError::InvalidParameters`.
pub fn build_stack(
    descriptor: &str,
    parameters: &[ElementParameters],
    role: StackRole,
    ip_config: Option<IpStackConfig>,
    loop_: Arc<EventLoop>,
) -> GgResult<Stack> {
    const SUPPORTED: &[&str] = &["G", "NG", "SNG", "DSNG", "DSNGA", "DS", "N"];
    if !SUPPORTED.contains(&descriptor) {
        return Err(GgError::InvalidParameters(format!(
            "unsupported stack descriptor '{}'",
            descriptor
        )));
    }

    let ip_config = ip_config.unwrap_or_else(|| IpStackConfig::defaults_for_role(role));
    debug!("stack builder: building '{}' descriptor as {:?}", descriptor, role);
    let composite_events = Arc::new(EventEmitter::new());
    let mut forwarders: Vec<Box<dyn Any + Send + Sync>> = Vec::new();

    // Built bottom-up: walk the descriptor in reverse, then reverse the
    // result back to top-to-bottom order for storage.
    let mut built: Vec<(StackElementType, Box<dyn StackElement>)> = Vec::new();
    for c in descriptor.chars().rev() {
        let (kind, element): (StackElementType, Box<dyn StackElement>) = match c {
            'D' => {
                let dtls = DtlsElement::new();
                forwarders.push(forward(&dtls.events(), &composite_events, StackEvent::Tls));
                (StackElementType::Dtls, Box::new(dtls))
            }
            'S' => {
                let params = find_datagram_socket_params(parameters, &ip_config);
                (StackElementType::DatagramSocket, Box::new(DatagramSocketElement::new(params)))
            }
            'N' => {
                let frame_config = ip_frame_config(&ip_config, role);
                let serializer = Ipv4FrameSerializer::new(frame_config.clone());
                let remap = ip_config.inbound_address_remapping;
                let assembler = if remap.enabled {
                    // Peer-advertised addresses come back out as this
                    // stack's own locally-stable pair: an arriving source
                    // matching `remap.source_address` becomes
                    // `remote_address`, and a destination matching
                    // `remap.destination_address` becomes `local_address`.
                    let ip_map = IpMap {
                        src_address: ip_config.remote_address,
                        remapped_src_address: remap.source_address,
                        dst_address: ip_config.local_address,
                        remapped_dst_address: remap.destination_address,
                    };
                    Ipv4FrameAssembler::with_ip_map(frame_config, ip_map, ip_config.ip_mtu)
                } else {
                    Ipv4FrameAssembler::new(frame_config, ip_config.ip_mtu)
                };
                (
                    StackElementType::NetworkInterface,
                    Box::new(NetworkInterfaceElement::new(serializer, assembler, ip_config.ip_mtu)),
                )
            }
            'G' => {
                let config = find_gattlink_config(parameters);
                let client = GattlinkGenericClient::new(
                    config,
                    Arc::clone(&loop_),
                    DEFAULT_TRANSPORT_MTU,
                    DEFAULT_GATTLINK_BUFFER_CAPACITY,
                    DEFAULT_GATTLINK_BUFFER_CAPACITY,
                );
                forwarders.push(forward(&client.events(), &composite_events, |e: GattlinkEvent| {
                    StackEvent::Gattlink(e)
                }));
                (StackElementType::Gattlink, Box::new(client))
            }
            'A' => {
                let config = find_activity_monitor_config(parameters);
                let monitor = ActivityMonitorElement::new(config, Arc::clone(&loop_));
                forwarders.push(forward(
                    &monitor.events(),
                    &composite_events,
                    |e: ActivityMonitorChange| StackEvent::Activity(e),
                ));
                (StackElementType::ActivityMonitor, Box::new(monitor))
            }
            other => return Err(unknown_element_char(other)),
        };
        built.push((kind, element));
    }
    built.reverse();

    for i in 0..built.len().saturating_sub(1) {
        let (upper, lower) = (&built[i].1, &built[i + 1].1);
        upper.connect_down(lower.top_sink(), lower.top_source());
        lower.connect_up(upper.bottom_sink(), upper.bottom_source());
    }

    debug!("stack builder: wired {} element(s) for '{}'", built.len(), descriptor);
    Ok(Stack::new(built, ip_config, composite_events, forwarders))
}
