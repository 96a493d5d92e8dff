use serde::Serialize;
use std::collections::VecDeque;
use std::time::Duration;

/// Timings for one submitted frame, in milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize)]
pub struct FrameSample {
    pub frame_index: u64,
    pub wait_ms: f32,
    pub render_ms: f32,
    pub submit_ms: f32,
    pub eyes_rendered: u32,
}

impl FrameSample {
    pub fn total_ms(&self) -> f32 {
        self.wait_ms + self.render_ms + self.submit_ms
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct TelemetryStats {
    pub wait_p50: f32,
    pub render_p50: f32,
    pub render_p99: f32,
    pub submit_p50: f32,
    pub total_p50: f32,
    pub total_p95: f32,
    pub total_p99: f32,
    pub missed_pct: f32,
    pub total_frames: u64,
    pub missed_frames: u64,
    pub skipped_eyes: u64,
    pub time_to_first_frame_ms: Option<f32>,
}

/// Rolling per-frame timings plus the one-off time to first frame.
#[derive(Debug, Clone)]
pub struct FrameTelemetry {
    samples: VecDeque<FrameSample>,
    window: usize,
    budget_ms: f32,
    total_frames: u64,
    missed_frames: u64,
    skipped_eyes: u64,
    time_to_first_frame: Option<Duration>,
}

impl Default for FrameTelemetry {
    fn default() -> Self {
        Self::new(1000, 11.1)
    }
}

impl FrameTelemetry {
    pub fn new(window: usize, budget_ms: f32) -> Self {
        let window = window.max(1);
        Self {
            samples: VecDeque::with_capacity(window),
            window,
            budget_ms,
            total_frames: 0,
            missed_frames: 0,
            skipped_eyes: 0,
            time_to_first_frame: None,
        }
    }

    pub fn record(&mut self, sample: FrameSample, expected_eyes: u32) {
        if self.samples.len() == self.window {
            self.samples.pop_front();
        }
        self.total_frames += 1;
        if sample.total_ms() > self.budget_ms {
            self.missed_frames += 1;
        }
        self.skipped_eyes += u64::from(expected_eyes.saturating_sub(sample.eyes_rendered));
        self.samples.push_back(sample);
    }

    /// Keeps the first value only; later activations do not overwrite it.
    pub fn mark_first_frame(&mut self, elapsed: Duration) -> bool {
        if self.time_to_first_frame.is_some() {
            return false;
        }
        self.time_to_first_frame = Some(elapsed);
        true
    }

    pub fn time_to_first_frame(&self) -> Option<Duration> {
        self.time_to_first_frame
    }

    pub fn latest(&self) -> Option<&FrameSample> {
        self.samples.back()
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn stats(&self) -> TelemetryStats {
        let sorted = |pick: fn(&FrameSample) -> f32| {
            let mut values: Vec<f32> = self.samples.iter().map(pick).collect();
            values.sort_by(f32::total_cmp);
            values
        };
        let wait = sorted(|sample| sample.wait_ms);
        let render = sorted(|sample| sample.render_ms);
        let submit = sorted(|sample| sample.submit_ms);
        let total = sorted(FrameSample::total_ms);

        TelemetryStats {
            wait_p50: percentile(&wait, 50.0),
            render_p50: percentile(&render, 50.0),
            render_p99: percentile(&render, 99.0),
            submit_p50: percentile(&submit, 50.0),
            total_p50: percentile(&total, 50.0),
            total_p95: percentile(&total, 95.0),
            total_p99: percentile(&total, 99.0),
            missed_pct: if self.total_frames > 0 {
                self.missed_frames as f32 / self.total_frames as f32 * 100.0
            } else {
                0.0
            },
            total_frames: self.total_frames,
            missed_frames: self.missed_frames,
            skipped_eyes: self.skipped_eyes,
            time_to_first_frame_ms: self
                .time_to_first_frame
                .map(|elapsed| elapsed.as_micros() as f32 / 1000.0),
        }
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(&self.stats())
    }
}

fn percentile(sorted: &[f32], p: f32) -> f32 {
    if sorted.is_empty() {
        return 0.0;
    }
    let index = ((sorted.len() as f32 - 1.0) * p / 100.0).round() as usize;
    sorted[index.min(sorted.len() - 1)]
}
