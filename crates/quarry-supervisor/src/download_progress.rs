//! Transfer state for one download attempt.
//!
//! The downloader records byte counts as chunks arrive; the published
//! snapshot is refreshed at a bounded rate so a polling UI sees a steady
//! figure instead of per-chunk churn. Total size may be unknown
//! (indeterminate progress).

use std::{
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};

const PUBLISH_INTERVAL: Duration = Duration::from_millis(250);

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct DownloadSnapshot {
    pub bytes_downloaded: u64,
    pub total_bytes: Option<u64>,
    pub elapsed: Duration,
    pub bytes_per_sec: f64,
    pub finished: bool,
}

#[derive(Default)]
struct TrackerState {
    snapshot: DownloadSnapshot,
    bytes: u64,
    total: Option<u64>,
    started: Option<Instant>,
    last_publish: Option<Instant>,
    window_started: Option<Instant>,
    window_bytes: u64,
}

/// Cloneable progress handle shared between the updater and its host.
#[derive(Clone, Default)]
pub struct ProgressHandle {
    inner: Arc<Mutex<TrackerState>>,
}

impl ProgressHandle {
    pub fn snapshot(&self) -> DownloadSnapshot {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).snapshot
    }

    pub(crate) fn begin(&self, total: Option<u64>) {
        let now = Instant::now();
        let mut s = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        *s = TrackerState {
            snapshot: DownloadSnapshot {
                total_bytes: total,
                ..DownloadSnapshot::default()
            },
            total,
            started: Some(now),
            window_started: Some(now),
            ..TrackerState::default()
        };
    }

    pub(crate) fn record(&self, chunk_len: u64) {
        self.record_at(chunk_len, Instant::now());
    }

    fn record_at(&self, chunk_len: u64, now: Instant) {
        let mut s = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        s.bytes = s.bytes.saturating_add(chunk_len);
        s.window_bytes = s.window_bytes.saturating_add(chunk_len);

        let due = match s.last_publish {
            None => true,
            Some(prev) => now.duration_since(prev) >= PUBLISH_INTERVAL,
        };
        if !due {
            return;
        }

        let window = s
            .window_started
            .map(|w| now.duration_since(w))
            .unwrap_or_default();
        let rate = if window > Duration::ZERO {
            s.window_bytes as f64 / window.as_secs_f64()
        } else {
            0.0
        };

        s.snapshot = DownloadSnapshot {
            bytes_downloaded: s.bytes,
            total_bytes: s.total,
            elapsed: s.started.map(|t| now.duration_since(t)).unwrap_or_default(),
            bytes_per_sec: rate,
            finished: false,
        };
        s.last_publish = Some(now);
        s.window_started = Some(now);
        s.window_bytes = 0;
    }

    pub(crate) fn finish(&self) {
        let now = Instant::now();
        let mut s = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let elapsed = s.started.map(|t| now.duration_since(t)).unwrap_or_default();
        let rate = if elapsed > Duration::ZERO {
            s.bytes as f64 / elapsed.as_secs_f64()
        } else {
            0.0
        };
        s.snapshot = DownloadSnapshot {
            bytes_downloaded: s.bytes,
            total_bytes: s.total,
            elapsed,
            bytes_per_sec: rate,
            finished: true,
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_chunk_publishes_immediately() {
        let handle = ProgressHandle::default();
        handle.begin(Some(1000));
        let now = Instant::now();
        handle.record_at(100, now + Duration::from_millis(10));

        let snap = handle.snapshot();
        assert_eq!(snap.bytes_downloaded, 100);
        assert_eq!(snap.total_bytes, Some(1000));
        assert!(!snap.finished);
    }

    #[test]
    fn republish_is_rate_limited() {
        let handle = ProgressHandle::default();
        handle.begin(None);
        let now = Instant::now();

        handle.record_at(100, now + Duration::from_millis(10));
        // Too soon after the last publish; counted but not republished.
        handle.record_at(100, now + Duration::from_millis(20));
        assert_eq!(handle.snapshot().bytes_downloaded, 100);

        handle.record_at(100, now + Duration::from_millis(400));
        assert_eq!(handle.snapshot().bytes_downloaded, 300);
    }

    #[test]
    fn throughput_is_computed_over_the_publish_window() {
        let handle = ProgressHandle::default();
        handle.begin(Some(4096));
        let now = Instant::now();

        handle.record_at(512, now + Duration::from_millis(10));
        handle.record_at(1024, now + Duration::from_millis(510));

        let snap = handle.snapshot();
        assert_eq!(snap.bytes_downloaded, 1536);
        // 1024 bytes over the ~500ms window.
        assert!(snap.bytes_per_sec > 1500.0 && snap.bytes_per_sec < 2600.0);
    }

    #[test]
    fn finish_publishes_final_totals() {
        let handle = ProgressHandle::default();
        handle.begin(Some(300));
        let now = Instant::now();
        handle.record_at(100, now);
        handle.record_at(200, now + Duration::from_millis(1));
        handle.finish();

        let snap = handle.snapshot();
        assert!(snap.finished);
        assert_eq!(snap.bytes_downloaded, 300);
    }
}
