//! Conversation synchronization for SkillSwap chat
//!
//! [`ConversationSync`] keeps one ordered message list per conversation,
//! filled once from the message store and then extended by the live feed.

pub mod controller;
pub mod log;

pub use controller::{
    ConversationSync, DeliveryStatus, HistoryLoad, RejectReason, SendOutcome, SendReceipt,
    SyncSettings,
};
pub use log::{ConversationLog, LiveDisposition};
