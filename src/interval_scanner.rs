//! Reusable periodic scan task (§4.6), grounded on
//! `peer_manager/trust_metric.rs`'s `HeartBeat`: an `impl Future` driven by
//! a `futures_timer::Delay`, reset every tick, that performs its work and
//! then re-arms itself.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use futures_timer::Delay;
use log::debug;

/// Drives `scan` once per `interval`. Before each call, if a `keys_fn` was
/// given via `with_keys`, logs a `run_begin({keys})` event with the current
/// collection's keys (§4.6: "emits `run_begin({keys})` before iteration").
/// `set_interval(0)` disables further ticks — mirrors the teacher's
/// `HeartBeat` being droppable/replaceable to change cadence. The interval
/// is `Arc`-shared so a `Dispatcher` can hold the same handle and retune a
/// scanner's cadence from a polled remote-config snapshot.
pub struct IntervalScanner<F>
where
    F: FnMut(u64) + Send,
{
    name: &'static str,
    interval_ms: Arc<AtomicU64>,
    delay: Delay,
    keys_fn: Option<Box<dyn FnMut() -> Vec<String> + Send>>,
    scan: F,
}

impl<F> IntervalScanner<F>
where
    F: FnMut(u64) + Send,
{
    pub fn new(name: &'static str, interval: Duration, scan: F) -> Self {
        Self::with_shared_interval(name, Arc::new(AtomicU64::new(interval.as_millis() as u64)), scan)
    }

    /// Build a scanner whose interval is a handle shared with some other
    /// owner (typically a `Dispatcher` field updated by `apply_remote_config`).
    pub fn with_shared_interval(name: &'static str, interval_ms: Arc<AtomicU64>, scan: F) -> Self {
        IntervalScanner {
            name,
            interval_ms: interval_ms.clone(),
            delay: Delay::new(Duration::from_millis(interval_ms.load(Ordering::Acquire))),
            keys_fn: None,
            scan,
        }
    }

    pub fn with_keys(mut self, keys_fn: impl FnMut() -> Vec<String> + Send + 'static) -> Self {
        self.keys_fn = Some(Box::new(keys_fn));
        self
    }

    pub fn set_interval(&self, interval: Duration) {
        self.interval_ms.store(interval.as_millis() as u64, Ordering::Release);
    }

    fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms.load(Ordering::Acquire))
    }
}

impl<F> Future for IntervalScanner<F>
where
    F: FnMut(u64) + Send + Unpin,
{
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        let this = self.get_mut();

        loop {
            let interval = this.interval();
            if interval.is_zero() {
                debug!("{} interval scanner disabled", this.name);
                return Poll::Pending;
            }

            match Pin::new(&mut this.delay).poll(cx) {
                Poll::Pending => return Poll::Pending,
                Poll::Ready(()) => {
                    let now = crate::common::now_ms();
                    if let Some(keys_fn) = this.keys_fn.as_mut() {
                        let keys = keys_fn();
                        debug!("{} run_begin keys={:?}", this.name, keys);
                    }
                    (this.scan)(now);
                    this.delay.reset(this.interval());
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[tokio::test]
    async fn fires_and_invokes_scan() {
        let count = Arc::new(AtomicUsize::new(0));
        let count2 = count.clone();
        let scanner = IntervalScanner::new("test", Duration::from_millis(5), move |_now| {
            count2.fetch_add(1, Ordering::SeqCst);
        });

        let handle = tokio::spawn(scanner);
        tokio::time::delay_for(Duration::from_millis(25)).await;
        handle.abort();

        assert!(count.load(Ordering::SeqCst) >= 1);
    }

    #[tokio::test]
    async fn zero_interval_disables_future_ticks() {
        let count = Arc::new(AtomicUsize::new(0));
        let count2 = count.clone();
        let scanner = IntervalScanner::new("test", Duration::from_millis(1_000_000), move |_now| {
            count2.fetch_add(1, Ordering::SeqCst);
        });
        scanner.set_interval(Duration::from_millis(0));

        let handle = tokio::spawn(scanner);
        tokio::time::delay_for(Duration::from_millis(20)).await;
        handle.abort();

        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn keys_fn_is_consulted_each_tick_without_affecting_scan() {
        let keys_seen = Arc::new(AtomicUsize::new(0));
        let keys_seen2 = keys_seen.clone();
        let scan_count = Arc::new(AtomicUsize::new(0));
        let scan_count2 = scan_count.clone();

        let scanner = IntervalScanner::new("test", Duration::from_millis(5), move |_now| {
            scan_count2.fetch_add(1, Ordering::SeqCst);
        })
        .with_keys(move || {
            keys_seen2.fetch_add(1, Ordering::SeqCst);
            vec!["a".to_owned(), "b".to_owned()]
        });

        let handle = tokio::spawn(scanner);
        tokio::time::delay_for(Duration::from_millis(25)).await;
        handle.abort();

        assert!(keys_seen.load(Ordering::SeqCst) >= 1);
        assert_eq!(keys_seen.load(Ordering::SeqCst), scan_count.load(Ordering::SeqCst));
    }
}
