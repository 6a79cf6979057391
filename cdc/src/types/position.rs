use std::fmt;

/// Cursor into the replication log.
///
/// Ordered by `log_file` first and `log_offset` second. Sources encode their native
/// position so that this ordering matches log order.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ReplicationPosition {
    pub log_file: String,
    pub log_offset: u64,
}

impl ReplicationPosition {
    pub fn new(log_file: impl Into<String>, log_offset: u64) -> Self {
        Self {
            log_file: log_file.into(),
            log_offset,
        }
    }
}

impl fmt::Display for ReplicationPosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.log_file, self.log_offset)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn orders_by_file_then_offset() {
        let first = ReplicationPosition::new("000001", 900);
        let second = ReplicationPosition::new("000002", 4);
        let third = ReplicationPosition::new("000002", 5);

        assert!(first < second);
        assert!(second < third);
        assert_eq!(third.to_string(), "000002:5");
    }
}
