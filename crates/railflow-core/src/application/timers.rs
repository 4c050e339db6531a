//! Engine-owned timers
//!
//! A timer is fire-and-forget: when it expires the service pushes a
//! `timer-fired` event onto the completion channel, exactly like an action
//! result. Cancelled timers never fire.

use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedSender;
use tokio::task::AbortHandle;
use tracing::{debug, warn};

use super::dispatcher::spawn_tracked;
use crate::domain::event::Event;
use crate::types::TimerId;

/// Schedules timer-fired events
pub trait TimerService: Send + Sync {
    /// Fire `timer-fired` for `timer_id` after `delay`
    fn schedule(&self, timer_id: &TimerId, delay: Duration);

    /// Forget a timer that has not fired yet
    fn cancel(&self, timer_id: &TimerId);
}

/// Timer service on tokio's clock
pub struct TokioTimerService {
    completions: UnboundedSender<Event>,
    timers: Arc<DashMap<TimerId, AbortHandle>>,
}

impl TokioTimerService {
    /// Service sending fired timers on `completions`
    pub fn new(completions: UnboundedSender<Event>) -> Self {
        Self {
            completions,
            timers: Arc::new(DashMap::new()),
        }
    }

    /// Number of timers still waiting
    pub fn scheduled(&self) -> usize {
        self.timers.len()
    }
}

impl TimerService for TokioTimerService {
    fn schedule(&self, timer_id: &TimerId, delay: Duration) {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!(%timer_id, "No async runtime, timer dropped");
            return;
        };
        let id = timer_id.clone();
        spawn_tracked(
            &runtime,
            &self.timers,
            timer_id.clone(),
            self.completions.clone(),
            async move {
                tokio::time::sleep(delay).await;
                Event::timer_fired(&id)
            },
        );
    }

    fn cancel(&self, timer_id: &TimerId) {
        if let Some((_, handle)) = self.timers.remove(timer_id) {
            debug!(%timer_id, "Timer cancelled");
            handle.abort();
        }
    }
}

/// Timer service that only records requests
#[cfg(any(test, feature = "testing"))]
#[derive(Debug, Default)]
pub struct RecordingTimers {
    scheduled: std::sync::Mutex<Vec<(TimerId, Duration)>>,
    cancelled: std::sync::Mutex<Vec<TimerId>>,
}

#[cfg(any(test, feature = "testing"))]
impl RecordingTimers {
    /// Empty recorder
    pub fn new() -> Self {
        Self::default()
    }

    /// Scheduled timers in request order
    pub fn scheduled(&self) -> Vec<(TimerId, Duration)> {
        self.scheduled.lock().map(|s| s.clone()).unwrap_or_default()
    }

    /// Cancelled timers in request order
    pub fn cancelled(&self) -> Vec<TimerId> {
        self.cancelled.lock().map(|c| c.clone()).unwrap_or_default()
    }
}

#[cfg(any(test, feature = "testing"))]
impl TimerService for RecordingTimers {
    fn schedule(&self, timer_id: &TimerId, delay: Duration) {
        if let Ok(mut scheduled) = self.scheduled.lock() {
            scheduled.push((timer_id.clone(), delay));
        }
    }

    fn cancel(&self, timer_id: &TimerId) {
        if let Ok(mut cancelled) = self.cancelled.lock() {
            cancelled.push(timer_id.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    #[tokio::test(start_paused = true)]
    async fn test_timer_fires_once() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let timers = TokioTimerService::new(tx);

        timers.schedule(&TimerId::from("t1"), Duration::from_millis(500));
        assert_eq!(timers.scheduled(), 1);

        let event = rx.recv().await.unwrap();
        assert_eq!(event.timer_id(), Some(TimerId::from("t1")));
        assert_eq!(event.id.as_str(), "t1:fired");
        assert_eq!(timers.scheduled(), 0);
    }

    #[tokio::test]
    async fn test_expired_timers_are_forgotten() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let timers = TokioTimerService::new(tx);

        for i in 0..10 {
            timers.schedule(&TimerId(format!("t{}", i)), Duration::ZERO);
        }
        for _ in 0..10 {
            rx.recv().await.unwrap();
        }

        assert_eq!(timers.scheduled(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_timer_never_fires() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let timers = TokioTimerService::new(tx);

        timers.schedule(&TimerId::from("t1"), Duration::from_millis(500));
        timers.schedule(&TimerId::from("t2"), Duration::from_millis(800));
        timers.cancel(&TimerId::from("t1"));

        let event = rx.recv().await.unwrap();
        assert_eq!(event.timer_id(), Some(TimerId::from("t2")));
    }

    #[test]
    fn test_recording_timers() {
        let timers = RecordingTimers::new();
        timers.schedule(&TimerId::from("t"), Duration::from_secs(1));
        timers.cancel(&TimerId::from("t"));
        assert_eq!(timers.scheduled(), vec![(TimerId::from("t"), Duration::from_secs(1))]);
        assert_eq!(timers.cancelled(), vec![TimerId::from("t")]);
    }
}
