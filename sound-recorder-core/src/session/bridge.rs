//! Real-time to control-thread notification bridge.
//!
//! Two lanes:
//!
//! ```text
//! render thread ──SamplePoster──▶ [SPSC ring, fixed capacity] ──┐
//!                                                               ├─▶ NotificationBridge::pump ─▶ delegate
//! any thread ──LifecyclePoster──▶ [unbounded channel] ──────────┘
//! ```
//!
//! Position samples (duration, amplitude) may be dropped when the ring is
//! full. Lifecycle events (started, stopped) are never dropped. Every event
//! carries a session number so the pump can deliver a session's position
//! samples strictly between its start and its stop.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crossbeam_channel::{unbounded, Receiver, Sender};
use ringbuf::{traits::*, HeapCons, HeapProd, HeapRb};

use crate::models::error::RecorderError;
use crate::traits::recorder_delegate::RecorderDelegate;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Position {
    Duration(f64),
    Amplitude(f32),
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PositionSample {
    pub session: u64,
    pub position: Position,
}

#[derive(Debug, Clone, PartialEq)]
pub enum LifecycleEvent {
    Started { session: u64 },
    Stopped { session: u64, error: Option<RecorderError> },
}

impl LifecycleEvent {
    pub fn session(&self) -> u64 {
        match self {
            Self::Started { session } | Self::Stopped { session, .. } => *session,
        }
    }
}

/// Counters shared by both posting ends.
#[derive(Debug, Default)]
pub struct BridgeStats {
    posted: AtomicU64,
    dropped: AtomicU64,
}

impl BridgeStats {
    /// Position samples accepted into the ring.
    pub fn posted(&self) -> u64 {
        self.posted.load(Ordering::Relaxed)
    }

    /// Position samples discarded because the ring was full.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// Producer end for position samples. Owned by the render thread.
pub struct SamplePoster {
    producer: HeapProd<PositionSample>,
    stats: Arc<BridgeStats>,
}

impl SamplePoster {
    /// Never blocks or allocates. Returns false if the sample was dropped.
    pub fn post(&mut self, sample: PositionSample) -> bool {
        match self.producer.try_push(sample) {
            Ok(()) => {
                self.stats.posted.fetch_add(1, Ordering::Relaxed);
                true
            }
            Err(_) => {
                self.stats.dropped.fetch_add(1, Ordering::Relaxed);
                false
            }
        }
    }
}

/// Sender for start/stop events. Cheap to clone.
#[derive(Clone)]
pub struct LifecyclePoster {
    sender: Sender<LifecycleEvent>,
}

impl LifecyclePoster {
    pub fn post(&self, event: LifecycleEvent) {
        // The bridge owns the receiver; once it is gone nobody is listening.
        let _ = self.sender.send(event);
    }
}

/// Consumer side: delivers queued events to a delegate on the caller's thread.
pub struct NotificationBridge {
    consumer: HeapCons<PositionSample>,
    receiver: Receiver<LifecycleEvent>,
    sender: Sender<LifecycleEvent>,
    stats: Arc<BridgeStats>,
    held: Option<PositionSample>,
    active: Option<u64>,
    completed: u64,
}

impl NotificationBridge {
    pub fn new(capacity: usize) -> (Self, SamplePoster) {
        let (producer, consumer) = HeapRb::<PositionSample>::new(capacity.max(1)).split();
        let (sender, receiver) = unbounded();
        let stats = Arc::new(BridgeStats::default());
        let bridge = Self {
            consumer,
            receiver,
            sender,
            stats: Arc::clone(&stats),
            held: None,
            active: None,
            completed: 0,
        };
        (bridge, SamplePoster { producer, stats })
    }

    pub fn lifecycle_poster(&self) -> LifecyclePoster {
        LifecyclePoster {
            sender: self.sender.clone(),
        }
    }

    pub fn stats(&self) -> &BridgeStats {
        &self.stats
    }

    /// Session whose start has been delivered and whose stop has not.
    pub fn active_session(&self) -> Option<u64> {
        self.active
    }

    /// Deliver everything currently queued. Returns the number of delegate
    /// notifications made (events for a missing delegate still count as
    /// consumed, but not as delivered).
    pub fn pump(&mut self, delegate: Option<&dyn RecorderDelegate>) -> usize {
        let mut delivered = 0;
        while let Ok(event) = self.receiver.try_recv() {
            match event {
                LifecycleEvent::Started { session } => {
                    delivered += self.drain_positions(delegate);
                    self.active = Some(session);
                    if let Some(d) = delegate {
                        d.on_started();
                        delivered += 1;
                    }
                }
                LifecycleEvent::Stopped { session, error } => {
                    if self.active == Some(session) {
                        delivered += self.drain_positions(delegate);
                    }
                    self.active = None;
                    self.completed = self.completed.max(session);
                    if let Some(d) = delegate {
                        d.on_stopped(error.as_ref());
                        delivered += 1;
                    }
                }
            }
        }
        delivered + self.drain_positions(delegate)
    }

    /// Forget a session that never started: its queued lifecycle events are
    /// dropped and its position samples will be discarded. Only valid once
    /// nothing can post for that session any more.
    pub fn retract(&mut self, session: u64) {
        let others: Vec<LifecycleEvent> = self
            .receiver
            .try_iter()
            .filter(|event| event.session() != session)
            .collect();
        for event in others {
            let _ = self.sender.send(event);
        }
        if self.active == Some(session) {
            self.active = None;
        }
        self.completed = self.completed.max(session);
    }

    fn next_sample(&mut self) -> Option<PositionSample> {
        self.held.take().or_else(|| self.consumer.try_pop())
    }

    /// Deliver samples of the active session and discard stale ones, stopping
    /// at the first sample that belongs to a session not yet started.
    fn drain_positions(&mut self, delegate: Option<&dyn RecorderDelegate>) -> usize {
        let mut delivered = 0;
        while let Some(sample) = self.next_sample() {
            if Some(sample.session) == self.active {
                if let Some(d) = delegate {
                    match sample.position {
                        Position::Duration(seconds) => d.on_duration_reached(seconds),
                        Position::Amplitude(level) => d.on_amplitude(level),
                    }
                    delivered += 1;
                }
            } else if sample.session <= self.completed
                || self.active.is_some_and(|active| sample.session < active)
            {
                continue;
            } else {
                self.held = Some(sample);
                break;
            }
        }
        delivered
    }
}
