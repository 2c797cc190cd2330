//! Persistence layer: libSQL-backed storage for channels, threads,
//! messages, and the delivery queue.

pub mod libsql_backend;
pub mod migrations;
pub mod traits;

pub use libsql_backend::LibSqlBackend;
pub use traits::{
    ChannelPatch, Database, DeliveryReceipt, DeliveryTask, InboundMessage, LastMessage,
    NewDeliveryTask, OutboundMessage, TaskStatus, ThreadUpsert,
};
