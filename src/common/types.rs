/// Strongly typed identifiers.
pub type ServerId = u64;
pub type ChannelId = u64;
pub type UserId = u64;
pub type SessionId = String;
