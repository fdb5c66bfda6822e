//! Redis as the link directory.
//!
//! Declarations are plain string values, written with a time-to-live. The change feed is made
//! of keyevent notifications: `__keyevent@<db>__:<event>` channels carrying the affected key.

mod client;
pub use client::{RedisDirectory, RedisOptions};

pub mod codec;

mod feed;
pub use feed::RedisFeed;
