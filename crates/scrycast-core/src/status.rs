// crates/scrycast-core/src/status.rs
//
// Live counters for the running pipeline, replacing the upstream reference
// implementation's periodic eprintln-style buffer/frame counter logging with
// queryable atomics the CLI can print on keypress and tests can assert on.

use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Default)]
pub struct PipelineStatus {
    pub frames_captured: AtomicU64,
    pub frames_dropped: AtomicU64,
    pub frames_encoded: AtomicU64,
    pub audio_buffers_captured: AtomicU64,
    pub audio_buffers_dropped: AtomicU64,
    pub samples_encoded: AtomicU64,
}

impl PipelineStatus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_frame_captured(&self) {
        self.frames_captured.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_frame_dropped(&self) {
        self.frames_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_frame_encoded(&self) {
        self.frames_encoded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_audio_captured(&self) {
        self.audio_buffers_captured.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_audio_dropped(&self) {
        self.audio_buffers_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_samples_encoded(&self, n: u64) {
        self.samples_encoded.fetch_add(n, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatusSnapshot {
        StatusSnapshot {
            frames_captured: self.frames_captured.load(Ordering::Relaxed),
            frames_dropped: self.frames_dropped.load(Ordering::Relaxed),
            frames_encoded: self.frames_encoded.load(Ordering::Relaxed),
            audio_buffers_captured: self.audio_buffers_captured.load(Ordering::Relaxed),
            audio_buffers_dropped: self.audio_buffers_dropped.load(Ordering::Relaxed),
            samples_encoded: self.samples_encoded.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct StatusSnapshot {
    pub frames_captured: u64,
    pub frames_dropped: u64,
    pub frames_encoded: u64,
    pub audio_buffers_captured: u64,
    pub audio_buffers_dropped: u64,
    pub samples_encoded: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate() {
        let status = PipelineStatus::new();
        status.record_frame_captured();
        status.record_frame_captured();
        status.record_frame_dropped();
        let snap = status.snapshot();
        assert_eq!(snap.frames_captured, 2);
        assert_eq!(snap.frames_dropped, 1);
    }
}
