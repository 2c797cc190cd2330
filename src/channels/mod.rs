//! Channels: registry, inbound polling, outbound sends, and file retrieval.

pub mod dispatcher;
pub mod files;
pub mod model;
pub mod poller;
pub mod registry;

pub use dispatcher::{OutboundDispatcher, OutgoingFile, SendOutcome};
pub use files::{FileProxy, RetrievedFile};
pub use model::{Channel, ChannelStatus, Direction, Message, Page, PageRequest, Provider, Thread};
pub use poller::{PollOutcome, Poller, spawn_poller};
pub use registry::{ChannelRegistry, ChannelUpdate};
