//! Periodic timer utility: runs a function on its own worker every
//! interval until stopped, cooperating with a stop flag the next
//! interval-wait observes rather than forcibly cancelling anything.
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

pub struct LoopTimer {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl LoopTimer {
    /// Starts a timer firing `function` every `interval`. If `immediate`
    /// is true, fires once immediately before the first wait.
    pub fn start(
        interval: Duration,
        immediate: bool,
        mut function: impl FnMut() + Send + 'static,
    ) -> Self {
        let stop = Arc::new(AtomicBool::new(false));
        let stop_loop = Arc::clone(&stop);

        let handle = thread::spawn(move || {
            if immediate {
                function();
            }
            loop {
                let woke_early = wait_for_stop(&stop_loop, interval);
                if woke_early || stop_loop.load(Ordering::SeqCst) {
                    break;
                }
                function();
            }
        });

        LoopTimer {
            stop,
            handle: Some(handle),
        }
    }

    /// Signals the timer to stop; takes effect at the next interval wait.
    pub fn stop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for LoopTimer {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

/// Sleeps in short slices so a stop request is observed promptly instead
/// of only at the end of a long interval.
fn wait_for_stop(stop: &AtomicBool, interval: Duration) -> bool {
    const SLICE: Duration = Duration::from_millis(100);
    let mut waited = Duration::ZERO;
    while waited < interval {
        if stop.load(Ordering::SeqCst) {
            return true;
        }
        let remaining = interval - waited;
        thread::sleep(remaining.min(SLICE));
        waited += SLICE;
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    #[test]
    fn fires_immediately_when_requested() {
        let count = Arc::new(AtomicUsize::new(0));
        let count_clone = Arc::clone(&count);
        let mut timer = LoopTimer::start(Duration::from_secs(60), true, move || {
            count_clone.fetch_add(1, Ordering::SeqCst);
        });
        thread::sleep(Duration::from_millis(50));
        timer.stop();
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn stops_within_one_interval() {
        let count = Arc::new(AtomicUsize::new(0));
        let count_clone = Arc::clone(&count);
        let mut timer = LoopTimer::start(Duration::from_millis(50), false, move || {
            count_clone.fetch_add(1, Ordering::SeqCst);
        });
        thread::sleep(Duration::from_millis(120));
        timer.stop();
        let fired = count.load(Ordering::SeqCst);
        assert!(fired >= 1 && fired <= 4);
    }
}
