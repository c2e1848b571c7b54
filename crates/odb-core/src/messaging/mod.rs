//! Cross-transport abstractions (Discord-style groups today; anything with
//! groups, destinations and members fits behind the same port).

pub mod port;
pub mod throttled;
pub mod types;
