//! Correlates the gaze stream with the video stream.
//!
//! The two streams run on different clocks: video frames carry a
//! presentation time in milliseconds (90kHz ticks on the wire), gaze samples
//! carry a telemetry timestamp in microseconds. Every so often the glasses
//! send a [`SyncMarker`] stating which telemetry time a given video tick
//! corresponds to. [`StreamSync`] queues both kinds of packets and, for the
//! current frame, hands back the freshest gaze sample that is not from the
//! future.

use crate::telemetry::{GazeSample, SyncMarker, TelemetryEvent};
use log::{trace, warn};
use std::collections::VecDeque;

/// Fixed ratio between the two device clocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClockRatio {
    /// Video-domain ticks per millisecond of presentation time.
    pub video_ticks_per_ms: i64,
    /// Telemetry-domain ticks per millisecond.
    pub telemetry_ticks_per_ms: i64,
}

impl Default for ClockRatio {
    fn default() -> Self {
        Self {
            video_ticks_per_ms: 90,
            telemetry_ticks_per_ms: 1000,
        }
    }
}

impl ClockRatio {
    fn video_ticks(&self, pts_ms: f64) -> i64 {
        (pts_ms * self.video_ticks_per_ms as f64) as i64
    }

    /// `None` when the result does not fit, which only happens for garbage
    /// timestamps.
    fn video_to_telemetry(&self, video_ticks: i64) -> Option<i64> {
        video_ticks
            .checked_mul(self.telemetry_ticks_per_ms)?
            .checked_div(self.video_ticks_per_ms)
    }
}

/// Bounds on how far the streams may drift apart before we give up on them.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SyncLimits {
    /// How far the current frame may run past the newest marker before the
    /// telemetry side is considered stalled.
    pub max_video_lead_ms: f64,
    pub max_pending_samples: usize,
    pub max_pending_markers: usize,
}

impl Default for SyncLimits {
    fn default() -> Self {
        Self {
            max_video_lead_ms: 1000.0,
            max_pending_samples: 1024,
            max_pending_markers: 64,
        }
    }
}

/// Counters, mostly for the dashboard.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncStats {
    pub pending_samples: usize,
    pub pending_markers: usize,
    pub matched: u64,
    pub video_ahead: u64,
    pub evicted_stale: u64,
}

/// The correlation engine. Owned by the control loop; not shared.
#[derive(Debug)]
pub struct StreamSync {
    clock: ClockRatio,
    limits: SyncLimits,
    markers: VecDeque<SyncMarker>,
    samples: VecDeque<GazeSample>,
    frame_pts_ms: f64,
    newest_marker_pts: Option<i64>,
    // Most recently consumed marker; later frames are measured from it.
    anchor: Option<SyncMarker>,
    last_target: Option<i64>,
    stats: SyncStats,
}

impl Default for StreamSync {
    fn default() -> Self {
        Self::new(ClockRatio::default(), SyncLimits::default())
    }
}

impl StreamSync {
    pub fn new(clock: ClockRatio, limits: SyncLimits) -> Self {
        Self {
            clock,
            limits,
            markers: VecDeque::new(),
            samples: VecDeque::new(),
            frame_pts_ms: 0.0,
            newest_marker_pts: None,
            anchor: None,
            last_target: None,
            stats: SyncStats::default(),
        }
    }

    /// Queue a decoded telemetry packet. Packets that are neither gaze nor
    /// sync are ignored.
    pub fn add_telemetry(&mut self, event: TelemetryEvent) {
        match event {
            TelemetryEvent::Gaze(sample) => self.add_sample(sample),
            TelemetryEvent::Sync(marker) => self.add_marker(marker),
            TelemetryEvent::Other(_) => {}
        }
    }

    pub fn add_sample(&mut self, sample: GazeSample) {
        self.samples.push_back(sample);
        if self.samples.len() > self.limits.max_pending_samples {
            self.samples.pop_front();
            self.stats.evicted_stale += 1;
        }
    }

    pub fn add_marker(&mut self, marker: SyncMarker) {
        self.newest_marker_pts = Some(marker.pts);
        self.markers.push_back(marker);
        if self.markers.len() > self.limits.max_pending_markers {
            self.markers.pop_front();
            self.stats.evicted_stale += 1;
        }
    }

    /// Record the presentation time of the frame the caller is about to use.
    pub fn add_frame_pts(&mut self, pts_ms: f64) {
        self.frame_pts_ms = pts_ms;
    }

    /// Find the gaze sample that goes with the current frame.
    ///
    /// Returns `None` while no marker has been consumed yet, when the video
    /// has run further than `max_video_lead_ms` past the newest marker, or
    /// when nothing queued is old enough. Only the first two leave the
    /// queues untouched. A returned sample, and everything older than it, is
    /// evicted and never returned again.
    pub fn sync(&mut self) -> Option<GazeSample> {
        let newest = self.newest_marker_pts?;
        let frame = self.clock.video_ticks(self.frame_pts_ms);

        let max_lead = self.clock.video_ticks(self.limits.max_video_lead_ms);
        let Some(lead) = frame.checked_sub(newest) else {
            warn!("StreamSync : newest marker pts {} is out of range", newest);
            return None;
        };
        if lead > max_lead {
            warn!("StreamSync : video is ahead of data stream ({} > {})", frame, newest);
            self.stats.video_ahead += 1;
            return None;
        }

        let mut consumed = None;
        self.markers.retain(|m| {
            if m.pts <= frame {
                consumed = Some(*m);
                false
            } else {
                true
            }
        });
        if consumed.is_some() {
            self.anchor = consumed;
        }
        let anchor = self.anchor?;

        let target = frame
            .checked_sub(anchor.pts)
            .and_then(|ticks| self.clock.video_to_telemetry(ticks))
            .and_then(|offset| anchor.ts.checked_add(offset));
        let Some(target) = target else {
            warn!("StreamSync : marker {:?} is out of range, dropping it", anchor);
            self.anchor = None;
            return None;
        };
        self.last_target = Some(target);

        let mut found: Option<GazeSample> = None;
        self.samples.retain(|s| {
            if s.ts <= target {
                if found.map_or(true, |f| s.ts >= f.ts) {
                    found = Some(*s);
                }
                false
            } else {
                true
            }
        });

        match found {
            Some(sample) => {
                trace!("StreamSync : frame {} -> target {} -> gaze {}", frame, target, sample.ts);
                self.stats.matched += 1;
            }
            None => trace!("StreamSync : no gaze sample at or before {}", target),
        }
        found
    }

    /// The telemetry time the most recent correlation aimed for.
    pub fn last_target(&self) -> Option<i64> {
        self.last_target
    }

    pub fn stats(&self) -> SyncStats {
        SyncStats {
            pending_samples: self.samples.len(),
            pending_markers: self.markers.len(),
            ..self.stats
        }
    }
}
