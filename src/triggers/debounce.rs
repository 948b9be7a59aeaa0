//! Coalescing of bursts of change events into single callback invocations.

use super::TriggerCallback;
use crate::server::metrics;
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum DebounceAction {
    /// Invoke the callback now and close any open window.
    FireNow,
    /// (Re)arm the quiet timer for this deadline.
    Arm(Instant),
}

/// Debounce window state.
///
/// Without `wait_min` every event fires immediately. Otherwise the first event opens a window
/// and each event re-arms a `wait_min` quiet timer, until an event arrives `wait_max` or more
/// after the window opened, which forces a fire.
#[derive(Debug, Clone)]
pub(crate) struct Debouncer {
    wait_min: Option<Duration>,
    wait_max: Option<Duration>,
    window_start: Option<Instant>,
}

impl Debouncer {
    pub(crate) fn new(wait_min: Option<Duration>, wait_max: Option<Duration>) -> Self {
        Self {
            wait_min,
            wait_max,
            window_start: None,
        }
    }

    pub(crate) fn on_event(&mut self, now: Instant) -> DebounceAction {
        let Some(wait_min) = self.wait_min else {
            return DebounceAction::FireNow;
        };

        match (self.window_start, self.wait_max) {
            (None, _) => {
                self.window_start = Some(now);
                DebounceAction::Arm(now + wait_min)
            }
            (Some(start), Some(wait_max)) if now.duration_since(start) >= wait_max => {
                self.window_start = None;
                DebounceAction::FireNow
            }
            (Some(_), _) => DebounceAction::Arm(now + wait_min),
        }
    }

    /// The quiet timer elapsed: the window closes and the callback fires.
    pub(crate) fn on_timer(&mut self) {
        self.window_start = None;
    }

    pub(crate) fn is_open(&self) -> bool {
        self.window_start.is_some()
    }
}

/// Drives a [`Debouncer`] from a stream of change notifications until `token` is cancelled
/// or the sender side goes away.
pub(crate) async fn debounce_loop(
    name: String,
    mut events: mpsc::UnboundedReceiver<()>,
    mut debouncer: Debouncer,
    callback: TriggerCallback,
    token: CancellationToken,
) {
    let mut armed: Option<Instant> = None;

    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            event = events.recv() => {
                if event.is_none() {
                    break;
                }
                match debouncer.on_event(Instant::now()) {
                    DebounceAction::FireNow => {
                        armed = None;
                        fire(&name, &callback).await;
                    }
                    DebounceAction::Arm(deadline) => armed = Some(deadline),
                }
            }
            _ = tokio::time::sleep_until(armed.unwrap_or_else(Instant::now)), if armed.is_some() => {
                armed = None;
                debouncer.on_timer();
                fire(&name, &callback).await;
            }
        }
    }

    debug!(watcher = %name, pending = debouncer.is_open(), "debounce loop exited");
}

async fn fire(name: &str, callback: &TriggerCallback) {
    debug!(watcher = %name, "filesystem changes settled, firing");
    metrics::record_trigger_fire("fswatcher");
    match AssertUnwindSafe(callback()).catch_unwind().await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!(watcher = %name, "watch callback failed: {:#}", e),
        Err(_) => error!(watcher = %name, "watch callback panicked"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn secs(s: f64) -> Duration {
        Duration::from_secs_f64(s)
    }

    #[test]
    fn test_no_wait_min_fires_every_event() {
        let mut debouncer = Debouncer::new(None, Some(secs(3.0)));
        let now = Instant::now();
        assert_eq!(debouncer.on_event(now), DebounceAction::FireNow);
        assert_eq!(debouncer.on_event(now), DebounceAction::FireNow);
        assert!(!debouncer.is_open());
    }

    #[test]
    fn test_window_extends_then_forces() {
        let mut debouncer = Debouncer::new(Some(secs(1.0)), Some(secs(3.0)));
        let start = Instant::now();

        assert_eq!(
            debouncer.on_event(start),
            DebounceAction::Arm(start + secs(1.0))
        );
        assert_eq!(
            debouncer.on_event(start + secs(2.5)),
            DebounceAction::Arm(start + secs(3.5))
        );
        assert_eq!(
            debouncer.on_event(start + secs(3.0)),
            DebounceAction::FireNow
        );
        assert!(!debouncer.is_open());

        // A new burst opens a new window
        assert_eq!(
            debouncer.on_event(start + secs(3.2)),
            DebounceAction::Arm(start + secs(4.2))
        );
        debouncer.on_timer();
        assert!(!debouncer.is_open());
    }

    #[test]
    fn test_without_wait_max_never_forces() {
        let mut debouncer = Debouncer::new(Some(secs(1.0)), None);
        let start = Instant::now();
        debouncer.on_event(start);
        assert_eq!(
            debouncer.on_event(start + secs(100.0)),
            DebounceAction::Arm(start + secs(101.0))
        );
    }

    fn spawn_counting_loop(
        wait_min: Option<Duration>,
        wait_max: Option<Duration>,
    ) -> (
        mpsc::UnboundedSender<()>,
        Arc<AtomicUsize>,
        CancellationToken,
    ) {
        let (tx, rx) = mpsc::unbounded_channel();
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&fired);
        let callback: TriggerCallback = Arc::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            async { Ok(()) }.boxed()
        });
        let token = CancellationToken::new();
        tokio::spawn(debounce_loop(
            "test".to_string(),
            rx,
            Debouncer::new(wait_min, wait_max),
            callback,
            token.clone(),
        ));
        (tx, fired, token)
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_event_fires_after_quiet_period() {
        let (tx, fired, _token) = spawn_counting_loop(Some(secs(1.0)), Some(secs(3.0)));

        tx.send(()).unwrap();
        tokio::time::sleep(secs(0.9)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);

        tokio::time::sleep(secs(0.2)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);

        tokio::time::sleep(secs(10.0)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_continuous_stream_is_forced_by_wait_max() {
        let (tx, fired, _token) = spawn_counting_loop(Some(secs(1.0)), Some(secs(3.0)));

        // An event every 0.5s from t=0 to t=3.0
        for i in 0..=6 {
            tx.send(()).unwrap();
            if i < 6 {
                tokio::time::sleep(secs(0.5)).await;
            }
        }
        tokio::time::sleep(secs(0.05)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);

        tokio::time::sleep(secs(5.0)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_every_event_fires_without_wait_min() {
        let (tx, fired, _token) = spawn_counting_loop(None, None);
        for _ in 0..3 {
            tx.send(()).unwrap();
        }
        tokio::time::sleep(secs(0.01)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_drops_pending_window() {
        let (tx, fired, token) = spawn_counting_loop(Some(secs(1.0)), None);
        tx.send(()).unwrap();
        tokio::time::sleep(secs(0.5)).await;
        token.cancel();
        tokio::time::sleep(secs(5.0)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }
}
