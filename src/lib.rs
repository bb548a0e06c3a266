// Copyright (c) 2016 Linus Färnstrand <faern@faern.net>
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! # Golden Gate
//!
//! A composable IP-over-BLE tunnel. A constrained peripheral and a phone or
//! hub exchange IPv4/UDP/DTLS/CoAP traffic over an unreliable, fragment-
//! limited BLE/L2CAP link by layering three pieces on top of it:
//!
//! - [`gattlink`] — `GattlinkProtocol`/`GattlinkGenericClient`, a sliding-
//!   window ARQ session that turns the lossy underlying transport into an
//!   ordered, reliable byte-fragment pipe.
//! - [`ipv4_frame`] — `Ipv4FrameSerializer`/`Ipv4FrameAssembler`, which elide
//!   redundant IPv4/UDP header fields against a small set of configured
//!   defaults so a full header doesn't dominate every fragment.
//! - [`stack`] — [`stack::build_stack`], which wires any of the above
//!   (plus a pass-through DTLS placeholder, a datagram socket adapter and a
//!   traffic activity monitor) into a single pipeline from a descriptor
//!   string, the way a concrete deployment picks which layers it needs.
//!
//! ## Architecture and terminology
//!
//! Every layer in the pipeline is an [`element::Element`] with up to two
//! ports, "top" (towards the application) and "bottom" (towards the
//! transport). Each port is a [`element::DataSink`]/[`element::DataSource`]
//! pair: pushing data in can return [`errors::GgError::WouldBlock`], and the
//! pushing side registers an [`element::OnCanPut`] listener to be notified
//! when the sink can accept data again, instead of the caller busy-polling.
//! [`element::StackElement`] generalizes this into a pair of ports that can
//! be wired to a neighbor *after* construction (`connect_up`/
//! `connect_down`), which is what lets [`stack::build_stack`] assemble an
//! arbitrary chain from a descriptor string: the element above doesn't
//! exist yet when the element below it is built.
//!
//! Timers (retransmit, stall detection, activity inactivity, buffer-fullness
//! sampling) are all driven from one [`loop_::EventLoop`] per stack, so a
//! whole pipeline advances from a single `poll_once`/`run_until_idle` call
//! on the thread that owns it rather than each layer managing its own
//! thread or timer.
//!
//! Events (connection state changes, activity transitions, TLS state) are
//! exposed per-element through an [`event::EventEmitter`], and the stack
//! builder additionally forwards all of them onto one composite
//! [`stack::StackEvent`] emitter for a caller that just wants one place to
//! subscribe.
//!
//! ### Tests
//!
//! Unit tests live alongside the code they test in `#[cfg(test)] mod tests`
//! blocks, following exactly this pattern throughout the crate. Timer-driven
//! behavior (activity monitors, probes, retransmits) is tested against the
//! real system clock with short configured durations and `thread::sleep`
//! rather than a virtual clock, since [`loop_::EventLoop`] is itself built
//! on `std::time::Instant`.

pub mod buffer;
pub mod element;
pub mod errors;
pub mod event;
pub mod gattlink;
pub mod ipv4_frame;
pub mod loop_;
pub mod stack;

#[cfg(any(test, feature = "unit-tests", feature = "integration-tests"))]
pub mod testing;

pub use errors::{GgError, GgResult};
pub use event::{EventEmitter, Listener};
pub use loop_::EventLoop;
pub use stack::{build_stack, Stack, StackRole};
