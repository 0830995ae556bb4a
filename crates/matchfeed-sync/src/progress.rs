//! The worker's stdout progress protocol and the classifier that turns a
//! streamed line back into an in-source percentage.
//!
//! Inference is best effort: unknown lines never move progress, and progress
//! within one source never goes down.

use std::fmt;

use regex::Regex;

use crate::reconcile::SyncSummary;

pub const BASELINE: u8 = 5;
pub const HIGH_WATER: u8 = 90;
pub const FINAL_SYNC: u8 = 92;
pub const PERSISTED: u8 = 95;
pub const COMPLETE: u8 = 100;

/// Lines the worker prints; `Display` is the wire format.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProgressLine {
    Found { total: usize },
    Item { index: usize, total: usize },
    FinalSync { records: usize },
    Persisted(SyncSummary),
}

impl fmt::Display for ProgressLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProgressLine::Found { total } => write!(f, "Found {total} matches."),
            ProgressLine::Item { index, total } => write!(f, "Match {index}/{total}"),
            ProgressLine::FinalSync { records } => write!(f, "Final sync: {records} records"),
            ProgressLine::Persisted(summary) => write!(
                f,
                "Sync complete: inserted={} updated={} unchanged={} failed={}",
                summary.inserted, summary.updated, summary.unchanged, summary.failed
            ),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgressEvent {
    Found(usize),
    Item { index: usize, total: usize },
    FinalSync,
    Persisted,
}

#[derive(Debug, Clone)]
pub struct ProgressClassifier {
    found: Regex,
    item: Regex,
    final_sync: Regex,
    persisted: Regex,
}

impl ProgressClassifier {
    pub fn new() -> Result<Self, regex::Error> {
        Ok(Self {
            found: Regex::new(r"(?i)^found\s+(\d+)\s+match(?:es)?\b")?,
            item: Regex::new(r"(?i)^match\s+(\d+)\s*/\s*(\d+)\b")?,
            final_sync: Regex::new(r"(?i)^final\s+sync\b")?,
            persisted: Regex::new(r"(?i)^sync\s+complete\b")?,
        })
    }

    pub fn classify(&self, line: &str) -> Option<ProgressEvent> {
        let line = line.trim();
        if let Some(caps) = self.found.captures(line) {
            return caps[1].parse().ok().map(ProgressEvent::Found);
        }
        if let Some(caps) = self.item.captures(line) {
            let index = caps[1].parse().ok()?;
            let total = caps[2].parse().ok()?;
            return Some(ProgressEvent::Item { index, total });
        }
        if self.final_sync.is_match(line) {
            return Some(ProgressEvent::FinalSync);
        }
        if self.persisted.is_match(line) {
            return Some(ProgressEvent::Persisted);
        }
        None
    }
}

/// In-source progress for one subprocess run.
#[derive(Debug, Clone)]
pub struct ProgressTracker {
    classifier: ProgressClassifier,
    total: Option<usize>,
    progress: u8,
}

impl ProgressTracker {
    pub fn new(classifier: ProgressClassifier) -> Self {
        Self {
            classifier,
            total: None,
            progress: 0,
        }
    }

    pub fn progress(&self) -> u8 {
        self.progress
    }

    /// Feeds one output line; returns the new value when progress moved.
    pub fn observe(&mut self, line: &str) -> Option<u8> {
        let target = match self.classifier.classify(line)? {
            ProgressEvent::Found(total) => {
                self.total = Some(total);
                BASELINE
            }
            ProgressEvent::Item { index, total } => {
                let total = if total > 0 { total } else { self.total.unwrap_or(0) };
                if total == 0 {
                    return None;
                }
                let span = usize::from(HIGH_WATER - BASELINE);
                let scaled = index.min(total) * span / total;
                BASELINE + scaled as u8
            }
            ProgressEvent::FinalSync => FINAL_SYNC,
            ProgressEvent::Persisted => PERSISTED,
        };
        self.advance(target)
    }

    /// Marks the run finished; a clean exit completes the source.
    pub fn finish(&mut self, success: bool) -> Option<u8> {
        if success {
            self.advance(COMPLETE)
        } else {
            None
        }
    }

    fn advance(&mut self, target: u8) -> Option<u8> {
        let target = target.min(COMPLETE);
        if target > self.progress {
            self.progress = target;
            Some(target)
        } else {
            None
        }
    }
}

/// Share of the whole job: `(completed_steps * 100 + current) / steps`.
pub fn overall_progress(completed_steps: usize, current: u8, steps: usize) -> u8 {
    if steps == 0 {
        return COMPLETE;
    }
    let done = completed_steps.min(steps) * 100 + usize::from(current.min(COMPLETE));
    (done / steps).min(100) as u8
}
