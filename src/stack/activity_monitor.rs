//! Pass-through element that reports whether traffic has recently crossed
//! it in each direction, grounded in `gg_activity_data_monitor.c`'s
//! `GG_ActivityDataMonitor`: one inactivity timer per direction, (re)armed
//! on every `PutData`, firing an edge event only when the active/inactive
//! state actually changes.
//!
//! The original tracks a single direction per instance (`direction` is only
//! used to label the emitted event) and is composed in pairs by whatever
//! wires the stack together. The `A` descriptor character names one stack
//! element, so `ActivityMonitorElement` wraps two of those single-direction
//! monitors — one watching top-to-bottom traffic, one watching
//! bottom-to-top — sharing one `EventEmitter`.

use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

use log::debug;

use crate::buffer::BufferWithMetadata;
use crate::element::{DataSink, DataSource, Element, NullSource, StackElement};
use crate::errors::{GgError, GgResult};
use crate::event::EventEmitter;
use crate::loop_::{EventLoop, TimerId};

/// Matches `GG_STACK_ELEMENT_ACTIVITY_MONITOR_DEFAULT_TIMEOUT`.
pub const DEFAULT_INACTIVITY_TIMEOUT_MS: u32 = 30_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    TopToBottom,
    BottomToTop,
}

#[derive(Debug, Clone, Copy)]
pub struct ActivityMonitorConfig {
    pub inactivity_timeout_ms: u32,
}

impl Default for ActivityMonitorConfig {
    fn default() -> Self {
        ActivityMonitorConfig {
            inactivity_timeout_ms: DEFAULT_INACTIVITY_TIMEOUT_MS,
        }
    }
}

/// An edge transition in one direction's activity state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ActivityMonitorChange {
    pub direction: Direction,
    pub active: bool,
    pub detected_time: Instant,
}

struct DirectionMonitor {
    direction: Direction,
    timeout: Duration,
    loop_: Arc<EventLoop>,
    events: Arc<EventEmitter<ActivityMonitorChange>>,
    sink: Option<Arc<Mutex<dyn DataSink>>>,
    active: bool,
    timer: Option<TimerId>,
    self_ref: Weak<Mutex<DirectionMonitor>>,
}

type DirectionHandle = Arc<Mutex<DirectionMonitor>>;

impl DirectionMonitor {
    fn new(
        direction: Direction,
        timeout: Duration,
        loop_: Arc<EventLoop>,
        events: Arc<EventEmitter<ActivityMonitorChange>>,
    ) -> DirectionHandle {
        let handle = Arc::new(Mutex::new(DirectionMonitor {
            direction,
            timeout,
            loop_,
            events,
            sink: None,
            active: false,
            timer: None,
            self_ref: Weak::new(),
        }));
        handle.lock().expect("direction monitor lock poisoned").self_ref = Arc::downgrade(&handle);
        handle
    }

    fn put_data(handle: &DirectionHandle, data: BufferWithMetadata) -> GgResult<()> {
        let (sink, became_active, weak, loop_, timeout, events, direction) = {
            let mut this = handle.lock().expect("direction monitor lock poisoned");
            let sink = match &this.sink {
                Some(sink) => Arc::clone(sink),
                None => return Err(GgError::InvalidState),
            };
            let became_active = !this.active;
            this.active = true;
            (
                sink,
                became_active,
                this.self_ref.clone(),
                Arc::clone(&this.loop_),
                this.timeout,
                Arc::clone(&this.events),
                this.direction,
            )
        };
        sink.lock().expect("activity monitor downstream sink poisoned").put_data(data)?;
        if became_active {
            debug!("activity monitor: {:?} became active", direction);
            events.emit(ActivityMonitorChange {
                direction,
                active: true,
                detected_time: Instant::now(),
            });
        }
        if let Some(id) = handle.lock().expect("direction monitor lock poisoned").timer.take() {
            let _ = loop_.unschedule(id);
        }
        let timer = loop_.post_timer(timeout, move || Self::on_timeout(&weak)).ok();
        handle.lock().expect("direction monitor lock poisoned").timer = timer;
        Ok(())
    }

    fn on_timeout(weak: &Weak<Mutex<DirectionMonitor>>) {
        let handle = match weak.upgrade() {
            Some(h) => h,
            None => return,
        };
        let (events, direction, timeout, was_active);
        {
            let mut this = handle.lock().expect("direction monitor lock poisoned");
            this.timer = None;
            was_active = this.active;
            this.active = false;
            events = Arc::clone(&this.events);
            direction = this.direction;
            timeout = this.timeout;
        }
        if was_active {
            debug!("activity monitor: {:?} went inactive after {:?}", direction, timeout);
            events.emit(ActivityMonitorChange {
                direction,
                active: false,
                detected_time: Instant::now() - timeout,
            });
        }
    }
}

struct ForwardingSink {
    direction: DirectionHandle,
}

impl DataSink for ForwardingSink {
    fn put_data(&mut self, data: BufferWithMetadata) -> GgResult<()> {
        DirectionMonitor::put_data(&self.direction, data)
    }
}

/// A pass-through stack element that tracks top-to-bottom and bottom-to-top
/// traffic independently, emitting `ActivityMonitorChange` on every edge.
pub struct ActivityMonitorElement {
    events: Arc<EventEmitter<ActivityMonitorChange>>,
    top_to_bottom: DirectionHandle,
    bottom_to_top: DirectionHandle,
}

impl ActivityMonitorElement {
    pub fn new(config: ActivityMonitorConfig, loop_: Arc<EventLoop>) -> ActivityMonitorElement {
        let events = Arc::new(EventEmitter::new());
        let timeout = Duration::from_millis(config.inactivity_timeout_ms as u64);
        let top_to_bottom = DirectionMonitor::new(
            Direction::TopToBottom,
            timeout,
            Arc::clone(&loop_),
            Arc::clone(&events),
        );
        let bottom_to_top = DirectionMonitor::new(Direction::BottomToTop, timeout, loop_, Arc::clone(&events));
        ActivityMonitorElement {
            events,
            top_to_bottom,
            bottom_to_top,
        }
    }

    pub fn events(&self) -> Arc<EventEmitter<ActivityMonitorChange>> {
        Arc::clone(&self.events)
    }
}

impl Element for ActivityMonitorElement {
    fn start(&mut self) -> GgResult<()> {
        Ok(())
    }

    fn reset(&mut self) -> GgResult<()> {
        for handle in [&self.top_to_bottom, &self.bottom_to_top] {
            let mut this = handle.lock().expect("direction monitor lock poisoned");
            this.active = false;
            if let Some(id) = this.timer.take() {
                let _ = this.loop_.unschedule(id);
            }
        }
        Ok(())
    }

    fn destroy(&mut self) {
        let _ = self.reset();
    }
}

impl StackElement for ActivityMonitorElement {
    fn top_sink(&self) -> Arc<Mutex<dyn DataSink>> {
        Arc::new(Mutex::new(ForwardingSink {
            direction: Arc::clone(&self.top_to_bottom),
        }))
    }

    fn top_source(&self) -> Box<dyn DataSource> {
        Box::new(NullSource)
    }

    fn bottom_sink(&self) -> Arc<Mutex<dyn DataSink>> {
        Arc::new(Mutex::new(ForwardingSink {
            direction: Arc::clone(&self.bottom_to_top),
        }))
    }

    fn bottom_source(&self) -> Box<dyn DataSource> {
        Box::new(NullSource)
    }

    fn connect_up(&self, sink: Arc<Mutex<dyn DataSink>>, _source: Box<dyn DataSource>) {
        self.bottom_to_top.lock().expect("direction monitor lock poisoned").sink = Some(sink);
    }

    fn connect_down(&self, sink: Arc<Mutex<dyn DataSink>>, _source: Box<dyn DataSource>) {
        self.top_to_bottom.lock().expect("direction monitor lock poisoned").sink = Some(sink);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::Buffer;
    use crate::element::CollectingSink;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    struct Recorder(AtomicUsize);

    impl crate::event::Listener<ActivityMonitorChange> for Recorder {
        fn on_event(&self, event: &ActivityMonitorChange) {
            if event.active {
                self.0.fetch_add(1, Ordering::SeqCst);
            } else {
                self.0.fetch_add(100, Ordering::SeqCst);
            }
        }
    }

    #[test]
    fn marks_active_then_inactive_after_timeout() {
        let loop_ = Arc::new(EventLoop::new());
        let config = ActivityMonitorConfig {
            inactivity_timeout_ms: 20,
        };
        let monitor = ActivityMonitorElement::new(config, Arc::clone(&loop_));
        let downstream: Arc<Mutex<CollectingSink>> = Arc::new(Mutex::new(CollectingSink::default()));
        monitor.connect_down(downstream.clone(), Box::new(NullSource));

        let recorder = Arc::new(Recorder(AtomicUsize::new(0)));
        let listener: Weak<dyn crate::event::Listener<ActivityMonitorChange>> =
            Arc::downgrade(&recorder) as Weak<dyn crate::event::Listener<ActivityMonitorChange>>;
        monitor.events().subscribe(listener);

        monitor
            .top_sink()
            .lock()
            .unwrap()
            .put_data(BufferWithMetadata::new(Buffer::from_slice(&[1])))
            .unwrap();
        loop_.poll_once().unwrap();
        assert_eq!(recorder.0.load(Ordering::SeqCst), 1);
        assert_eq!(downstream.lock().unwrap().received.len(), 1);

        thread::sleep(Duration::from_millis(40));
        loop_.poll_once().unwrap();
        assert_eq!(recorder.0.load(Ordering::SeqCst), 101);
    }

    #[test]
    fn repeated_traffic_does_not_refire_active_event() {
        let loop_ = Arc::new(EventLoop::new());
        let config = ActivityMonitorConfig {
            inactivity_timeout_ms: 1000,
        };
        let monitor = ActivityMonitorElement::new(config, Arc::clone(&loop_));
        let downstream: Arc<Mutex<CollectingSink>> = Arc::new(Mutex::new(CollectingSink::default()));
        monitor.connect_down(downstream.clone(), Box::new(NullSource));
        let recorder = Arc::new(Recorder(AtomicUsize::new(0)));
        let listener: Weak<dyn crate::event::Listener<ActivityMonitorChange>> =
            Arc::downgrade(&recorder) as Weak<dyn crate::event::Listener<ActivityMonitorChange>>;
        monitor.events().subscribe(listener);

        for _ in 0..3 {
            monitor
                .top_sink()
                .lock()
                .unwrap()
                .put_data(BufferWithMetadata::new(Buffer::from_slice(&[1])))
                .unwrap();
        }
        assert_eq!(recorder.0.load(Ordering::SeqCst), 1);
        assert_eq!(downstream.lock().unwrap().received.len(), 3);
    }
}
