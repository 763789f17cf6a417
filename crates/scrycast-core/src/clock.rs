// crates/scrycast-core/src/clock.rs
//
// Presentation clock shared by the capture threads and the encode thread.
//
// Video PTS is derived from a frame index and the configured frame rate;
// audio PTS is derived from a running sample count. Both are independent of
// wall-clock arrival time by design — capture hiccups shouldn't warp the
// encoded timeline — but wall-clock is used as a backstop to catch the case
// where one track's ideal PTS has drifted far behind where it should be.

use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::time::Instant;

/// Resync threshold for audio PTS: if the ideal sample-count-based PTS drifts
/// more than this far from wall-clock elapsed time, the clock snaps forward.
pub const RESYNC_THRESHOLD_US: i64 = 50_000;

pub struct Clock {
    start: std::sync::Mutex<Option<Instant>>,
    recording: AtomicBool,
    last_video_pts_us: AtomicI64,
    last_audio_pts_us: AtomicI64,
}

impl Default for Clock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock {
    pub fn new() -> Self {
        Self {
            start: std::sync::Mutex::new(None),
            recording: AtomicBool::new(false),
            last_video_pts_us: AtomicI64::new(0),
            last_audio_pts_us: AtomicI64::new(0),
        }
    }

    pub fn start_recording(&self) {
        let mut start = self.start.lock().unwrap();
        if !self.recording.load(Ordering::SeqCst) {
            self.last_video_pts_us.store(0, Ordering::SeqCst);
            self.last_audio_pts_us.store(0, Ordering::SeqCst);
            *start = Some(Instant::now());
            self.recording.store(true, Ordering::SeqCst);
        }
    }

    pub fn stop_recording(&self) {
        self.recording.store(false, Ordering::SeqCst);
    }

    pub fn is_recording(&self) -> bool {
        self.recording.load(Ordering::SeqCst)
    }

    /// Microseconds elapsed since `start_recording`, or 0 if not recording.
    pub fn now_us(&self) -> i64 {
        if !self.is_recording() {
            return 0;
        }
        let start = self.start.lock().unwrap();
        match *start {
            Some(t) => t.elapsed().as_micros() as i64,
            None => 0,
        }
    }

    /// Ideal video PTS (microseconds) for `frame_index` at `frame_rate` fps.
    pub fn video_pts(&self, frame_index: i64, frame_rate: u32) -> i64 {
        if !self.is_recording() || frame_rate == 0 {
            return 0;
        }
        frame_index * 1_000_000 / frame_rate as i64
    }

    /// Ideal audio PTS (microseconds) for `samples_encoded` at `sample_rate` Hz.
    pub fn audio_pts(&self, samples_encoded: i64, sample_rate: u32) -> i64 {
        if !self.is_recording() || sample_rate == 0 {
            return 0;
        }
        samples_encoded * 1_000_000 / sample_rate as i64
    }

    pub fn update_last_video_pts(&self, pts: i64) {
        self.last_video_pts_us.fetch_max(pts, Ordering::SeqCst);
    }

    pub fn update_last_audio_pts(&self, pts: i64) {
        self.last_audio_pts_us.fetch_max(pts, Ordering::SeqCst);
    }

    /// Video PTS clamped to never regress behind the last value handed out —
    /// a stalled capture thread can't make the encoded timeline run backwards.
    pub fn synced_video_pts(&self, frame_index: i64, frame_rate: u32) -> i64 {
        if !self.is_recording() {
            return 0;
        }
        let ideal = self.video_pts(frame_index, frame_rate);
        let last = self.last_video_pts_us.load(Ordering::SeqCst);
        if ideal < last {
            last
        } else {
            ideal
        }
    }

    /// Audio PTS resynced against wall-clock elapsed time when the
    /// sample-count-derived ideal value has drifted more than
    /// [`RESYNC_THRESHOLD_US`] away from it.
    pub fn synced_audio_pts(&self, samples_encoded: i64, sample_rate: u32) -> i64 {
        if !self.is_recording() || sample_rate == 0 {
            return 0;
        }
        let current = self.now_us();
        let ideal = self.audio_pts(samples_encoded, sample_rate);

        if (current - ideal).abs() > RESYNC_THRESHOLD_US {
            let last = self.last_audio_pts_us.load(Ordering::SeqCst);
            let resynced = current.max(last);
            self.last_audio_pts_us.store(resynced, Ordering::SeqCst);
            return resynced;
        }

        ideal
    }
}

/// Duration of one video frame in microseconds at `frame_rate` fps.
pub fn frame_duration_us(frame_rate: u32) -> i64 {
    if frame_rate == 0 {
        return 0;
    }
    1_000_000 / frame_rate as i64
}

/// Duration of `samples` audio samples in microseconds at `sample_rate` Hz.
pub fn audio_duration_us(samples: i64, sample_rate: u32) -> i64 {
    if sample_rate == 0 {
        return 0;
    }
    samples * 1_000_000 / sample_rate as i64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn video_pts_is_frame_rate_based() {
        let clock = Clock::new();
        clock.start_recording();
        assert_eq!(clock.video_pts(0, 30), 0);
        assert_eq!(clock.video_pts(30, 30), 1_000_000);
        assert_eq!(clock.video_pts(15, 30), 500_000);
    }

    #[test]
    fn pts_is_zero_when_not_recording() {
        let clock = Clock::new();
        assert_eq!(clock.video_pts(100, 30), 0);
        assert_eq!(clock.audio_pts(44_100, 44_100), 0);
    }

    #[test]
    fn synced_video_pts_never_regresses() {
        let clock = Clock::new();
        clock.start_recording();
        clock.update_last_video_pts(2_000_000);
        // ideal for frame 10 @ 30fps is ~333_333us, well behind last
        assert_eq!(clock.synced_video_pts(10, 30), 2_000_000);
    }

    #[test]
    fn synced_audio_pts_reanchors_to_wall_clock_on_drift() {
        let clock = Clock::new();
        clock.start_recording();
        // samples_encoded=0 => ideal is 0us, far behind whatever wall-clock
        // elapsed time has ticked past by the time this runs; §4.1 says the
        // resync re-anchors to now_us, not some sample-count-scaled guess.
        std::thread::sleep(std::time::Duration::from_millis(60));
        let resynced = clock.synced_audio_pts(0, 44_100);
        let now = clock.now_us();
        assert!(resynced > RESYNC_THRESHOLD_US);
        assert!((now - resynced).abs() < 5_000);
    }

    #[test]
    fn synced_audio_pts_never_regresses_behind_last_value() {
        let clock = Clock::new();
        clock.start_recording();
        clock.update_last_audio_pts(5_000_000);
        // ideal for 0 samples is 0us, and now_us() is near-zero right after
        // start_recording, so both are far below last -> clamp to last.
        assert_eq!(clock.synced_audio_pts(0, 44_100), 5_000_000);
    }

    #[test]
    fn frame_duration_matches_rate() {
        assert_eq!(frame_duration_us(30), 33_333);
        assert_eq!(frame_duration_us(0), 0);
    }

    #[test]
    fn audio_duration_matches_sample_rate() {
        assert_eq!(audio_duration_us(44_100, 44_100), 1_000_000);
    }
}
