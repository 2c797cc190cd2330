//! Channel bridge: connects group workspaces to external chat providers.

pub mod channels;
pub mod config;
pub mod delivery;
pub mod error;
pub mod http;
pub mod staging;
pub mod store;
pub mod telegram;
