/// Local, monotonically increasing job number within one run.
pub type JobSeq = u64;

/// All timestamps are UTC.
pub type Timestamp = chrono::DateTime<chrono::Utc>;
