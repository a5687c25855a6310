//! Per-channel state reconciliation.

mod creation;
mod logic;
pub mod reconcile;

pub use creation::ChannelCreationService;
pub use logic::ChannelLogic;
