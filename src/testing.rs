//! Test-only harness transports, grounded in `rips::testing::{ethernet,
//! ipv4}`'s mock `Tx` types: those hand a test an mpsc channel standing in
//! for the real wire so it can assert on exactly what would have been sent.
//! `LoopbackTransport` generalizes the idea to Golden Gate's port model: it
//! wires two stacks' bottom (transport-facing) ports directly to each other,
//! optionally dropping a configurable fraction of fragments, standing in
//! for the real unreliable BLE/L2CAP link for the drop-resilience and
//! round-trip property tests in spec.md §8.
//!
//! Deliberately does not attempt a `VirtualClock`/driven timer: every timer
//! in this crate (`EventLoop::post_timer`) is keyed off `std::time::Instant`,
//! and the same real-clock-plus-short-duration approach already used by
//! `gattlink::probe`/`stack::activity_monitor`'s own tests is used here too,
//! rather than introducing a second, virtual notion of time the rest of the
//! crate doesn't share.

use std::sync::{Arc, Mutex};

use log::trace;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::buffer::BufferWithMetadata;
use crate::element::DataSink;
use crate::errors::GgResult;
use crate::stack::{ElementRef, PortRef, Stack};

/// Parameters for a [`wire_lossy`] link.
#[derive(Debug, Clone, Copy)]
pub struct LoopbackConfig {
    /// Fraction of fragments dropped in each direction, in `0.0..=1.0`.
    pub drop_probability: f64,
    /// Seeds the two directions' independent PRNGs (the second direction
    /// uses `seed.wrapping_add(1)`, so the two links don't drop in lockstep).
    pub seed: u64,
}

impl Default for LoopbackConfig {
    fn default() -> Self {
        LoopbackConfig {
            drop_probability: 0.0,
            seed: 0,
        }
    }
}

struct LossySink {
    inner: Arc<Mutex<dyn DataSink>>,
    rng: StdRng,
    drop_probability: f64,
}

impl DataSink for LossySink {
    fn put_data(&mut self, data: BufferWithMetadata) -> GgResult<()> {
        if self.drop_probability > 0.0 && self.rng.gen::<f64>() < self.drop_probability {
            trace!("loopback transport: dropped {} byte fragment", data.buffer.len());
            return Ok(());
        }
        self.inner.lock().expect("loopback transport downstream sink poisoned").put_data(data)
    }
}

/// Wires `a`'s and `b`'s bottom ports directly to each other, standing in
/// for the raw transport, with each direction independently dropping
/// fragments at `config.drop_probability`.
pub fn wire_lossy(a: &Stack, b: &Stack, config: LoopbackConfig) -> GgResult<()> {
    let (a_source, a_sink) = a.get_port(ElementRef::Bottom, PortRef::Bottom)?;
    let (b_source, b_sink) = b.get_port(ElementRef::Bottom, PortRef::Bottom)?;

    let a_to_b: Arc<Mutex<dyn DataSink>> = Arc::new(Mutex::new(LossySink {
        inner: b_sink,
        rng: StdRng::seed_from_u64(config.seed),
        drop_probability: config.drop_probability,
    }));
    let b_to_a: Arc<Mutex<dyn DataSink>> = Arc::new(Mutex::new(LossySink {
        inner: a_sink,
        rng: StdRng::seed_from_u64(config.seed.wrapping_add(1)),
        drop_probability: config.drop_probability,
    }));

    a.connect_bottom(a_to_b, b_source);
    b.connect_bottom(b_to_a, a_source);
    Ok(())
}
