pub mod adapters;
pub mod channel;
pub mod collaborators;
pub mod config;
pub mod conversation;
pub mod directory;
pub mod dispatcher;
pub mod escalation;
pub mod flow;
pub mod ingest;
pub mod messages;
pub mod pipeline;
pub mod routing;
pub mod service;
pub mod store;
pub mod sweeps;

pub use channel::{AdapterError, ChannelAdapter, NormalizedEvent, Platform, SendOutcome};
pub use config::{ChannelSettings, ConfigError, RouterConfig};
pub use conversation::{
    AiMode, Conversation, ConversationComment, ConversationStatus, DeliveryStatus, Message,
    MessageDirection, NewMessage,
};
pub use dispatcher::{Dispatcher, DispatcherControl, Job};
pub use ingest::{IngestError, IngestService, WebhookAck};
pub use pipeline::{JobOutcome, Pipeline};
pub use store::{Database, StoreError};
