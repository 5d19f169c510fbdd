/// Job and workflow identifiers. PostgreSQL BIGSERIAL when persisted.
pub type DbId = i64;

/// All timestamps are UTC.
pub type Timestamp = chrono::DateTime<chrono::Utc>;
