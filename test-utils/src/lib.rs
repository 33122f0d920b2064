//! Test utilities for nzbfs
//!
//! An in-process NNTP server speaking just enough of RFC 3977 for the data
//! plane (greeting, AUTHINFO, BODY, STAT, HEAD, QUIT over real TCP), plus
//! deterministic fixture generators. Articles are stored yEnc-encoded,
//! exactly as a provider would serve them; per-article 430s, artificial
//! latency, and connection counters make failover, admission, and
//! cancellation scenarios scriptable.

mod fixtures;
mod server;

pub use fixtures::{segment_msg_id, segment_payload, yenc_article};
pub use server::MockNntpServer;
