//! Scripted conversation with the bridge bot.
//!
//! The link flow sends a login command into the 1:1 bot room, watches the
//! live timeline for the bot's replies, and turns them into domain events:
//! a login URL to present to the user, a success confirmation, and newly
//! bridged rooms appearing after the link completes.

pub mod matcher;
pub mod watcher;

pub use matcher::LoginMatcher;
pub use watcher::{WatchContext, WatchHandle};
