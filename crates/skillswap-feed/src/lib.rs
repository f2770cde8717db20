//! Live message feed for SkillSwap chat
//!
//! The backend exposes a STOMP broker behind a WebSocket endpoint. Every
//! chat message published system-wide is broadcast on a shared topic;
//! clients filter for the conversations they display.

pub mod client;
pub mod frame;

pub use client::{FeedOptions, StompFeed};
pub use frame::{Command, Frame};
