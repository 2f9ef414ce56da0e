//! Debounces per-frame marker detections into a dwell decision.

use crate::detector::MarkerId;
use std::collections::VecDeque;

/// Sliding-window majority vote over the last `window_len` detections.
///
/// Each frame contributes one entry: the marker the gaze fell on, or `None`.
/// A candidate is ratified only when it is the most frequent entry in the
/// window and occurs at least `threshold` times. Equal counts go to the entry
/// that has been in the window longest.
#[derive(Debug, Clone)]
pub struct DwellFilter {
    window: VecDeque<Option<MarkerId>>,
    threshold: usize,
}

impl DwellFilter {
    /// A window of `window_len` frames (at least one), initially all `None`.
    pub fn new(window_len: usize, threshold: usize) -> Self {
        let window_len = window_len.max(1);
        Self {
            window: VecDeque::from(vec![None; window_len]),
            threshold,
        }
    }

    pub fn set_threshold(&mut self, threshold: usize) {
        self.threshold = threshold;
    }

    pub fn threshold(&self) -> usize {
        self.threshold
    }

    /// Change the temporal horizon. Growing pads the old end with `None`,
    /// shrinking drops the oldest entries.
    pub fn set_window(&mut self, window_len: usize) {
        let window_len = window_len.max(1);
        while self.window.len() > window_len {
            self.window.pop_front();
        }
        while self.window.len() < window_len {
            self.window.push_front(None);
        }
    }

    pub fn window_len(&self) -> usize {
        self.window.len()
    }

    /// Push this frame's detection and return it if it is ratified.
    pub fn process(&mut self, candidate: Option<MarkerId>) -> Option<MarkerId> {
        self.window.pop_front();
        self.window.push_back(candidate);

        let (leader, count) = self.leader();
        if count >= self.threshold && candidate == leader {
            candidate
        } else {
            None
        }
    }

    /// The most frequent entry in the window and its count.
    pub fn leader(&self) -> (Option<MarkerId>, usize) {
        // tallies stay in order of first occurrence, so a strict `>` below
        // keeps the oldest entry on ties
        let mut tally: Vec<(Option<MarkerId>, usize)> = Vec::new();
        for &entry in &self.window {
            match tally.iter_mut().find(|(v, _)| *v == entry) {
                Some((_, n)) => *n += 1,
                None => tally.push((entry, 1)),
            }
        }

        tally
            .into_iter()
            .fold((None, 0), |best, cur| if cur.1 > best.1 { cur } else { best })
    }
}
