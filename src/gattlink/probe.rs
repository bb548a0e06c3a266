//! Buffer-fullness sampling, grounded in `GG_GattlinkProbeConfig` /
//! `GG_GENERIC_GATTLINK_CLIENT_DEFAULT_OUTPUT_BUFFER_MONITOR_TIMEOUT` from
//! the original implementation. Samples a caller-supplied
//! occupancy function on a fixed cadence and emits edge-triggered
//! over/under-threshold events, the same edge-trigger shape
//! `stack::activity_monitor::ActivityMonitor` uses for its own inactivity
//! detection.

use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use log::trace;

use crate::errors::GgResult;
use crate::event::EventEmitter;
use crate::loop_::{EventLoop, TimerId};

/// Matches `GG_GENERIC_GATTLINK_CLIENT_DEFAULT_OUTPUT_BUFFER_MONITOR_TIMEOUT`.
pub const DEFAULT_WINDOW_SIZE_MS: u32 = 5000;
const DEFAULT_SAMPLE_COUNT: u32 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataProbeEvent {
    OutputBufferOverThreshold,
    OutputBufferUnderThreshold,
}

/// Mirrors `GG_GattlinkProbeConfig`.
#[derive(Debug, Clone, Copy)]
pub struct DataProbeConfig {
    pub window_size_ms: u32,
    pub buffer_sample_count: u32,
    pub buffer_threshold: usize,
}

impl DataProbeConfig {
    pub fn new(buffer_threshold: usize) -> DataProbeConfig {
        DataProbeConfig {
            window_size_ms: DEFAULT_WINDOW_SIZE_MS,
            buffer_sample_count: DEFAULT_SAMPLE_COUNT,
            buffer_threshold,
        }
    }

    fn sample_interval(&self) -> Duration {
        let count = self.buffer_sample_count.max(1);
        Duration::from_millis((self.window_size_ms / count) as u64)
    }
}

/// Periodically samples an output buffer's occupancy and reports
/// threshold crossings through an [`EventEmitter`].
pub struct DataProbe {
    config: DataProbeConfig,
    loop_: Arc<EventLoop>,
    emitter: Arc<EventEmitter<DataProbeEvent>>,
    sample: Box<dyn FnMut() -> usize + Send>,
    timer: Option<TimerId>,
    over_threshold: bool,
}

pub type DataProbeHandle = Arc<Mutex<DataProbe>>;

impl DataProbe {
    pub fn new<F>(config: DataProbeConfig, loop_: Arc<EventLoop>, sample: F) -> DataProbeHandle
    where
        F: FnMut() -> usize + Send + 'static,
    {
        Arc::new(Mutex::new(DataProbe {
            config,
            loop_,
            emitter: Arc::new(EventEmitter::new()),
            sample: Box::new(sample),
            timer: None,
            over_threshold: false,
        }))
    }

    pub fn events(handle: &DataProbeHandle) -> Arc<EventEmitter<DataProbeEvent>> {
        Arc::clone(&handle.lock().expect("data probe lock poisoned").emitter)
    }

    pub fn start(handle: &DataProbeHandle) -> GgResult<()> {
        Self::arm(handle);
        Ok(())
    }

    pub fn stop(handle: &DataProbeHandle) {
        let mut this = handle.lock().expect("data probe lock poisoned");
        if let Some(id) = this.timer.take() {
            let _ = this.loop_.unschedule(id);
        }
    }

    fn arm(handle: &DataProbeHandle) {
        let weak = Arc::downgrade(handle);
        let (loop_, interval) = {
            let this = handle.lock().expect("data probe lock poisoned");
            (Arc::clone(&this.loop_), this.config.sample_interval())
        };
        let timer = loop_.post_timer(interval, move || Self::on_tick(&weak)).ok();
        handle.lock().expect("data probe lock poisoned").timer = timer;
    }

    fn on_tick(weak: &Weak<Mutex<DataProbe>>) {
        let handle = match weak.upgrade() {
            Some(h) => h,
            None => return,
        };
        let (occupancy, threshold, was_over, emitter);
        {
            let mut this = handle.lock().expect("data probe lock poisoned");
            this.timer = None;
            occupancy = (this.sample)();
            threshold = this.config.buffer_threshold;
            was_over = this.over_threshold;
            emitter = Arc::clone(&this.emitter);
        }
        let is_over = occupancy >= threshold;
        if is_over != was_over {
            trace!("data probe: occupancy {} crossed threshold {} ({})", occupancy, threshold, is_over);
            handle.lock().expect("data probe lock poisoned").over_threshold = is_over;
            emitter.emit(if is_over {
                DataProbeEvent::OutputBufferOverThreshold
            } else {
                DataProbeEvent::OutputBufferUnderThreshold
            });
        }
        Self::arm(&handle);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    struct Recorder(AtomicUsize);

    impl crate::event::Listener<DataProbeEvent> for Recorder {
        fn on_event(&self, event: &DataProbeEvent) {
            match event {
                DataProbeEvent::OutputBufferOverThreshold => {
                    self.0.fetch_add(1, Ordering::SeqCst);
                }
                DataProbeEvent::OutputBufferUnderThreshold => {
                    self.0.fetch_add(100, Ordering::SeqCst);
                }
            }
        }
    }

    #[test]
    fn emits_only_on_threshold_crossing() {
        let loop_ = Arc::new(EventLoop::new());
        let occupancy = Arc::new(AtomicUsize::new(0));
        let occ = Arc::clone(&occupancy);
        let mut config = DataProbeConfig::new(10);
        config.window_size_ms = 20;
        config.buffer_sample_count = 1;
        let probe = DataProbe::new(config, Arc::clone(&loop_), move || occ.load(Ordering::SeqCst));
        let recorder = Arc::new(Recorder(AtomicUsize::new(0)));
        let listener: Weak<dyn crate::event::Listener<DataProbeEvent>> =
            Arc::downgrade(&recorder) as Weak<dyn crate::event::Listener<DataProbeEvent>>;
        DataProbe::events(&probe).subscribe(listener);
        DataProbe::start(&probe).unwrap();

        occupancy.store(20, Ordering::SeqCst);
        thread::sleep(Duration::from_millis(30));
        loop_.poll_once().unwrap();
        assert_eq!(recorder.0.load(Ordering::SeqCst), 1);

        occupancy.store(0, Ordering::SeqCst);
        thread::sleep(Duration::from_millis(30));
        loop_.poll_once().unwrap();
        assert_eq!(recorder.0.load(Ordering::SeqCst), 101);
    }
}
