/// All timestamps are UTC.
pub type Timestamp = chrono::DateTime<chrono::Utc>;

/// Key identifying an image in the annotation store (its path as given
/// by the operator).
pub type ImageKey = String;
