//! Debug tracing for stack walks
//!
//! This module records:
//! - Walk starts and the resolved first frame
//! - Every physical frame produced by the engine
//! - Anchor skips and anchor resumptions at entry points
//! - Continuation rebases, unknown frames and exhaustion
//!
//! Enable with FRAMEWALK_TRACE=1 environment variable.
//!
//! Recording happens on the walk path, so events are plain `Copy` values kept
//! in a fixed-size thread-local ring. Nothing is formatted or allocated until
//! `drain` / `write_events` is called from outside the walk.

use std::cell::RefCell;
use std::fmt;
use std::io::Write;
use std::sync::OnceLock;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Instant;

use crate::code_info::FrameKind;

/// Global flag to enable/disable tracing
static TRACING_ENABLED: AtomicBool = AtomicBool::new(false);
/// Global event counter for ordering across threads
static EVENT_COUNTER: AtomicU64 = AtomicU64::new(0);
/// Start time for relative timestamps
static START_TIME: OnceLock<Instant> = OnceLock::new();

pub const RING_CAPACITY: usize = 256;

thread_local! {
    static LOCAL_EVENTS: RefCell<EventRing> = const { RefCell::new(EventRing::new()) };
}

/// Initialize tracing based on environment variable
pub fn init() {
    if std::env::var("FRAMEWALK_TRACE").is_ok() {
        enable();
        eprintln!("[WALK_TRACE] Tracing enabled");
    }
}

pub fn enable() {
    let _ = START_TIME.get_or_init(Instant::now);
    TRACING_ENABLED.store(true, Ordering::SeqCst);
}

pub fn disable() {
    TRACING_ENABLED.store(false, Ordering::SeqCst);
}

/// Check if tracing is enabled
#[inline]
pub fn is_enabled() -> bool {
    TRACING_ENABLED.load(Ordering::Relaxed)
}

fn timestamp_us() -> u64 {
    match START_TIME.get() {
        Some(start) => start.elapsed().as_micros() as u64,
        None => 0,
    }
}

/// A single trace event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TraceEvent {
    pub seq: u64,
    pub timestamp_us: u64,
    pub event: EventKind,
}

impl TraceEvent {
    const EMPTY: TraceEvent = TraceEvent {
        seq: 0,
        timestamp_us: 0,
        event: EventKind::Empty,
    };
}

/// Types of events we track
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Empty,
    WalkStarted { sp: usize, ip: usize },
    Frame { sp: usize, ip: usize, kind: FrameKind },
    DeoptimizedFrame { sp: usize, virtual_frames: usize },
    AnchorSkipped { anchor_sp: usize, caller_sp: usize },
    AnchorResumed { sp: usize, ip: usize },
    UnknownFrame { sp: usize, ip: usize },
    Rebased { delta: isize },
    Exhausted { last_sp: usize },
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventKind::Empty => write!(f, "EMPTY"),
            EventKind::WalkStarted { sp, ip } => {
                write!(f, "START      sp={:#x} ip={:#x}", sp, ip)
            }
            EventKind::Frame { sp, ip, kind } => {
                write!(f, "FRAME      sp={:#x} ip={:#x} kind={}", sp, ip, kind)
            }
            EventKind::DeoptimizedFrame { sp, virtual_frames } => {
                write!(f, "DEOPT      sp={:#x} virtual_frames={}", sp, virtual_frames)
            }
            EventKind::AnchorSkipped {
                anchor_sp,
                caller_sp,
            } => write!(
                f,
                "ANCHOR_SKIP anchor_sp={:#x} caller_sp={:#x}",
                anchor_sp, caller_sp
            ),
            EventKind::AnchorResumed { sp, ip } => {
                write!(f, "ANCHOR     sp={:#x} ip={:#x}", sp, ip)
            }
            EventKind::UnknownFrame { sp, ip } => {
                write!(f, "UNKNOWN    sp={:#x} ip={:#x}", sp, ip)
            }
            EventKind::Rebased { delta } => write!(f, "REBASE     delta={}", delta),
            EventKind::Exhausted { last_sp } => write!(f, "EXHAUSTED  last_sp={:#x}", last_sp),
        }
    }
}

/// Fixed-capacity ring of the most recent events on one thread.
struct EventRing {
    events: [TraceEvent; RING_CAPACITY],
    next: usize,
    len: usize,
}

impl EventRing {
    const fn new() -> Self {
        EventRing {
            events: [TraceEvent::EMPTY; RING_CAPACITY],
            next: 0,
            len: 0,
        }
    }

    fn push(&mut self, event: TraceEvent) {
        self.events[self.next] = event;
        self.next = (self.next + 1) % RING_CAPACITY;
        if self.len < RING_CAPACITY {
            self.len += 1;
        }
    }

    fn oldest(&self) -> usize {
        (self.next + RING_CAPACITY - self.len) % RING_CAPACITY
    }
}

/// Record an event
#[inline]
pub fn record(event: EventKind) {
    if !is_enabled() {
        return;
    }
    let trace_event = TraceEvent {
        seq: EVENT_COUNTER.fetch_add(1, Ordering::SeqCst),
        timestamp_us: timestamp_us(),
        event,
    };
    // A re-entrant record (a visitor tracing from inside a trace call) is dropped.
    let _ = LOCAL_EVENTS.try_with(|ring| {
        if let Ok(mut ring) = ring.try_borrow_mut() {
            ring.push(trace_event);
        }
    });
}

/// Take every buffered event of the current thread, oldest first.
pub fn drain() -> Vec<TraceEvent> {
    crate::visitor::assert_allocation_allowed("trace::drain");
    LOCAL_EVENTS.with(|ring| {
        let mut ring = ring.borrow_mut();
        let start = ring.oldest();
        let events = (0..ring.len)
            .map(|i| ring.events[(start + i) % RING_CAPACITY])
            .collect();
        ring.len = 0;
        ring.next = 0;
        events
    })
}

/// Drain the current thread's events and write them as text lines.
pub fn write_events<W: Write>(out: &mut W) -> std::io::Result<usize> {
    let thread_str = format!("{:?}", std::thread::current().id());
    let thread_short = thread_str
        .trim_start_matches("ThreadId(")
        .trim_end_matches(')')
        .to_string();
    let events = drain();
    for event in &events {
        writeln!(
            out,
            "{:08} {:012} T{:>3} {}",
            event.seq, event.timestamp_us, thread_short, event.event
        )?;
    }
    Ok(events.len())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ring_keeps_most_recent_events() {
        let mut ring = EventRing::new();
        for i in 0..(RING_CAPACITY + 10) {
            ring.push(TraceEvent {
                seq: i as u64,
                timestamp_us: 0,
                event: EventKind::Exhausted { last_sp: i },
            });
        }
        assert_eq!(ring.len, RING_CAPACITY);
        assert_eq!(ring.events[ring.oldest()].seq, 10);
    }

    #[test]
    fn test_display_formats_addresses_in_hex() {
        let line = EventKind::AnchorResumed { sp: 0x100, ip: 0x2a }.to_string();
        assert_eq!(line, "ANCHOR     sp=0x100 ip=0x2a");
    }
}
