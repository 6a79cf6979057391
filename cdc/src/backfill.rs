//! Detection of the end of the initial load.
//!
//! The replication log does not tell apart rows written by the initial bulk load from rows
//! written afterwards. The detector holds rows back until a configured number of them was
//! seen, or until a row of the marker table arrives, and then releases them all at once.

use std::fmt;

use crate::concurrency::queue::QueueItem;
use crate::types::ChangeEvent;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadPhase {
    Loading,
    Live,
}

impl fmt::Display for LoadPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LoadPhase::Loading => f.write_str("loading"),
            LoadPhase::Live => f.write_str("live"),
        }
    }
}

/// What caused the transition to [`LoadPhase::Live`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionTrigger {
    RowThreshold,
    Marker,
}

/// Outcome of feeding one queue item to the detector.
#[derive(Debug)]
pub enum Step {
    /// The row was buffered. Carries the load percentage when a progress milestone was hit.
    Buffered { progress: Option<u64> },
    /// The initial load just completed. Buffered rows must be published in order.
    Transition {
        trigger: TransitionTrigger,
        replay: Vec<ChangeEvent>,
    },
    /// The row must be published right away.
    Publish(ChangeEvent),
    /// Nothing to do.
    Ignore,
}

#[derive(Debug)]
pub struct BackfillDetector {
    phase: LoadPhase,
    threshold: u64,
    rows_seen: u64,
    progress_step: u64,
    buffer: Vec<ChangeEvent>,
}

impl BackfillDetector {
    /// Creates a detector in [`LoadPhase::Loading`].
    pub fn new(threshold: u64) -> Self {
        Self {
            phase: LoadPhase::Loading,
            threshold,
            rows_seen: 0,
            progress_step: (threshold / 10).max(1),
            buffer: Vec::new(),
        }
    }

    /// Creates a detector that starts in [`LoadPhase::Live`], for a load completed earlier.
    pub fn live(threshold: u64) -> Self {
        Self {
            phase: LoadPhase::Live,
            ..Self::new(threshold)
        }
    }

    pub fn phase(&self) -> LoadPhase {
        self.phase
    }

    /// Number of rows seen while loading.
    pub fn rows_seen(&self) -> u64 {
        self.rows_seen
    }

    pub fn threshold(&self) -> u64 {
        self.threshold
    }

    pub fn observe(&mut self, item: QueueItem) -> Step {
        match (self.phase, item) {
            (LoadPhase::Live, QueueItem::Change(event)) => Step::Publish(event),
            (LoadPhase::Live, QueueItem::BackfillMarker) => Step::Ignore,
            (LoadPhase::Loading, QueueItem::BackfillMarker) => {
                self.transition(TransitionTrigger::Marker)
            }
            (LoadPhase::Loading, QueueItem::Change(event)) => {
                self.buffer.push(event);
                self.rows_seen += 1;

                if self.rows_seen >= self.threshold {
                    return self.transition(TransitionTrigger::RowThreshold);
                }

                let progress = (self.rows_seen % self.progress_step == 0)
                    .then(|| self.rows_seen * 100 / self.threshold);

                Step::Buffered { progress }
            }
        }
    }

    fn transition(&mut self, trigger: TransitionTrigger) -> Step {
        self.phase = LoadPhase::Live;

        Step::Transition {
            trigger,
            replay: std::mem::take(&mut self.buffer),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ChangeType, RowValues};

    fn change(table: &str) -> QueueItem {
        QueueItem::Change(ChangeEvent::new(table, RowValues::new(), ChangeType::Insert))
    }

    fn tables(events: &[ChangeEvent]) -> Vec<&str> {
        events.iter().map(|event| event.table.as_str()).collect()
    }

    #[test]
    fn threshold_releases_buffer_in_order_then_goes_live() {
        let mut detector = BackfillDetector::new(3);

        assert!(matches!(detector.observe(change("a")), Step::Buffered { .. }));
        assert!(matches!(detector.observe(change("b")), Step::Buffered { .. }));

        match detector.observe(change("c")) {
            Step::Transition { trigger, replay } => {
                assert_eq!(trigger, TransitionTrigger::RowThreshold);
                assert_eq!(tables(&replay), vec!["a", "b", "c"]);
            }
            other => panic!("expected a transition, got {other:?}"),
        }
        assert_eq!(detector.phase(), LoadPhase::Live);

        match detector.observe(change("d")) {
            Step::Publish(event) => assert_eq!(event.table, "d"),
            other => panic!("expected a publish, got {other:?}"),
        }
    }

    #[test]
    fn transition_happens_once() {
        let mut detector = BackfillDetector::new(1);

        let transitions = (0..10)
            .map(|_| detector.observe(change("a")))
            .filter(|step| matches!(step, Step::Transition { .. }))
            .count();

        assert_eq!(transitions, 1);
        assert!(matches!(
            detector.observe(QueueItem::BackfillMarker),
            Step::Ignore
        ));
    }

    #[test]
    fn below_threshold_never_transitions() {
        let mut detector = BackfillDetector::new(100);

        for _ in 0..99 {
            assert!(matches!(detector.observe(change("a")), Step::Buffered { .. }));
        }
        assert_eq!(detector.phase(), LoadPhase::Loading);
        assert_eq!(detector.rows_seen(), 99);
    }

    #[test]
    fn marker_transitions_before_threshold() {
        let mut detector = BackfillDetector::new(1000);
        detector.observe(change("a"));

        match detector.observe(QueueItem::BackfillMarker) {
            Step::Transition { trigger, replay } => {
                assert_eq!(trigger, TransitionTrigger::Marker);
                assert_eq!(tables(&replay), vec!["a"]);
            }
            other => panic!("expected a transition, got {other:?}"),
        }
    }

    #[test]
    fn progress_is_reported_every_tenth() {
        let mut detector = BackfillDetector::new(50);

        let milestones: Vec<u64> = (0..49)
            .filter_map(|_| match detector.observe(change("a")) {
                Step::Buffered { progress } => progress,
                _ => None,
            })
            .collect();

        assert_eq!(milestones, vec![10, 20, 30, 40, 50, 60, 70, 80, 90]);
    }

    #[test]
    fn live_detector_publishes_immediately() {
        let mut detector = BackfillDetector::live(3);
        assert!(matches!(detector.observe(change("a")), Step::Publish(_)));
        assert_eq!(detector.rows_seen(), 0);
    }
}
