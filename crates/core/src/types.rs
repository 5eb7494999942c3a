/// Workflow node identifiers are opaque strings (`"3"`, `"12"`, ...).
pub type NodeId = String;

/// Sampler seed. `-1` is reserved for "caller must supply a fresh seed".
pub type Seed = i64;

/// All timestamps are UTC.
pub type Timestamp = chrono::DateTime<chrono::Utc>;
