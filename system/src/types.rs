pub type ConnectionId = u32;
pub type BoardId = uuid::Uuid;
pub type ObjectId = uuid::Uuid;
pub type UserId = String;

/// Per-board action sequence number. 0 means nothing has been applied yet.
pub type Seq = u64;
pub type SnapshotVersion = u64;
