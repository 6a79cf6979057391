use serde::Deserialize;

use crate::shared::{TableReference, ValidationError};

/// Controls how the dispatcher decides that the historical backfill is over.
#[derive(Debug, Clone, Deserialize)]
pub struct BackfillConfig {
    /// Number of rows expected in the pre-existing dataset.
    ///
    /// The dispatcher stays in loading mode until this many rows were seen.
    /// If the table holds fewer rows the transition never happens.
    #[serde(default = "default_row_threshold")]
    pub row_threshold: u64,
    /// Capacity of the queue between the reader thread and the dispatcher.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    /// Table whose rows mark the end of the backfill explicitly.
    ///
    /// A row on this table seen while loading triggers the transition early.
    /// Marker rows are never published.
    #[serde(default)]
    pub marker_table: Option<TableReference>,
    /// Start directly in live mode when the readiness flag is already set.
    #[serde(default = "default_resume_when_ready")]
    pub resume_when_ready: bool,
}

impl BackfillConfig {
    pub const DEFAULT_ROW_THRESHOLD: u64 = 34_400;

    pub const DEFAULT_QUEUE_CAPACITY: usize = 1024;

    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.row_threshold == 0 {
            return Err(ValidationError::invalid_field(
                "backfill.row_threshold",
                "must be greater than 0",
            ));
        }
        if self.queue_capacity == 0 {
            return Err(ValidationError::invalid_field(
                "backfill.queue_capacity",
                "must be greater than 0",
            ));
        }

        Ok(())
    }
}

impl Default for BackfillConfig {
    fn default() -> Self {
        Self {
            row_threshold: default_row_threshold(),
            queue_capacity: default_queue_capacity(),
            marker_table: None,
            resume_when_ready: default_resume_when_ready(),
        }
    }
}

fn default_row_threshold() -> u64 {
    BackfillConfig::DEFAULT_ROW_THRESHOLD
}

fn default_queue_capacity() -> usize {
    BackfillConfig::DEFAULT_QUEUE_CAPACITY
}

fn default_resume_when_ready() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_threshold_is_rejected() {
        let config = BackfillConfig {
            row_threshold: 0,
            ..BackfillConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ValidationError::InvalidFieldValue { ref field, .. }) if field == "backfill.row_threshold"
        ));
    }

    #[test]
    fn zero_queue_capacity_is_rejected() {
        let config = BackfillConfig {
            queue_capacity: 0,
            ..BackfillConfig::default()
        };
        assert!(config.validate().is_err());
    }
}
