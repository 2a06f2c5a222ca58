//! Realtime delivery: change-feed subscriptions, the event pipeline that
//! invalidates and fans out, and the per-user connection registry.

pub mod connections;
pub mod feed;
pub mod pipeline;
pub mod ws;

pub use connections::{
    BroadcastReport, Connection, ConnectionInfo, ConnectionRegistry, PushTransport, RegistryError,
    RegistryStats, TransportError,
};
pub use feed::{
    CallbackError, ChangeCallback, ChangeFeedManager, ErrorHook, SubscriptionError,
    SubscriptionHandlers, SubscriptionId, SubscriptionInfo, SubscriptionState,
};
pub use pipeline::{CHANGE_EVENT, ChangeNotification, ChangePipeline, FeedMessage, PipelineOutcome};
pub use ws::{RealtimeHub, ServerFrame, ws_handler};
