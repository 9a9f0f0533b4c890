// SPDX-License-Identifier: CEPL-1.0
#![deny(unsafe_op_in_unsafe_fn)]
use std::time::{Duration, Instant};

pub fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};
    let _ = fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .compact()
        .try_init();
}

/// Measures the time between ticks and counts frames for a once-per-second FPS log.
pub struct FrameClock {
    last_tick: Instant,
    window_start: Instant,
    frames_in_window: u32,
}

impl FrameClock {
    pub fn new(now: Instant) -> Self {
        Self {
            last_tick: now,
            window_start: now,
            frames_in_window: 0,
        }
    }

    /// Seconds elapsed since the previous tick.
    pub fn tick(&mut self, now: Instant) -> f32 {
        let dt = now.saturating_duration_since(self.last_tick).as_secs_f32();
        self.last_tick = now;
        dt
    }

    pub fn count_frame(&mut self) {
        self.frames_in_window = self.frames_in_window.saturating_add(1);
    }

    /// Returns the frame count of the last full second once one has elapsed.
    pub fn take_fps(&mut self, now: Instant) -> Option<u32> {
        if now.saturating_duration_since(self.window_start) < Duration::from_secs(1) {
            return None;
        }
        let fps = self.frames_in_window;
        self.frames_in_window = 0;
        self.window_start = now;
        Some(fps)
    }

    /// Drops the partial count, e.g. while paused.
    pub fn reset(&mut self, now: Instant) {
        self.frames_in_window = 0;
        self.window_start = now;
        self.last_tick = now;
    }
}
