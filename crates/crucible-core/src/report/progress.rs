//! Run progress. The dispatcher emits done/total in resolution order; the
//! console layer consumes it through a sink.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// One progress update: how many units resolved and how many there are.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProgressEvent {
    pub done: usize,
    pub total: usize,
}

/// Called once per resolved unit. Implementations may throttle.
pub type ProgressSink = Arc<dyn Fn(ProgressEvent) + Send + Sync>;

const PROGRESS_MIN_INTERVAL_MS: u64 = 200;

#[must_use]
pub fn format_progress_line(done: usize, total: usize) -> String {
    format!("Resolved {}/{} test cases", done, total)
}

/// For large runs, emit at most every this many units.
pub(crate) fn progress_step(total: usize) -> usize {
    if total <= 10 {
        1
    } else {
        std::cmp::max(1, total / 10)
    }
}

/// Returns true when `ev` should be shown given the last emit time.
fn should_emit(ev: ProgressEvent, step: usize, last_emit: Option<Instant>, now: Instant) -> bool {
    if ev.done == ev.total {
        return true;
    }
    let on_step = ev.done % step == 0 || ev.done == 1;
    let interval_ok = last_emit
        .map(|t| now.saturating_duration_since(t) >= Duration::from_millis(PROGRESS_MIN_INTERVAL_MS))
        .unwrap_or(true);
    on_step && interval_ok
}

/// Throttled sink printing to stderr. None for single-unit runs.
pub fn default_progress_sink(total: usize) -> Option<ProgressSink> {
    if total <= 1 {
        return None;
    }
    let step = progress_step(total);
    let last_emit: Arc<Mutex<Option<Instant>>> = Arc::new(Mutex::new(None));
    Some(Arc::new(move |ev: ProgressEvent| {
        if ev.total == 0 {
            return;
        }
        let now = Instant::now();
        let emit = {
            let mut last = last_emit.lock().expect("progress throttle lock");
            let ok = should_emit(ev, step, *last, now);
            if ok {
                *last = Some(now);
            }
            ok
        };
        if emit {
            eprintln!("{}", format_progress_line(ev.done, ev.total));
        }
    }))
}
