//! OPC UA stack seam
//!
//! The reconcile core talks to these traits only; the production
//! implementation in [`opcua`] drives async-opcua, tests substitute
//! in-memory doubles. Notification and keep-alive callbacks run on the
//! stack's side and must stay short and non-blocking.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::model::{EventSpec, ResolvedNode};
use crate::vault::Credential;

pub mod opcua;

#[derive(Error, Debug)]
pub enum StackError {
    #[error("connect failed: {0}")]
    Connect(String),

    #[error("service call failed with status {0:#010x}")]
    Service(u32),

    #[error("operation timed out")]
    Timeout,

    #[error("session closed")]
    Closed,
}

impl StackError {
    pub fn status(&self) -> Option<u32> {
        match self {
            StackError::Service(code) => Some(*code),
            _ => None,
        }
    }
}

/// Connection settings for one session.
#[derive(Clone)]
pub struct SessionSettings {
    pub endpoint_url: String,
    pub use_security: bool,
    pub credentials: Option<Credential>,
    pub operation_timeout: Duration,
}

/// One data-change notification as delivered by the stack.
#[derive(Clone, Debug)]
pub struct DataChangeValue {
    pub value: serde_json::Value,
    pub status: u32,
    pub source_timestamp: Option<DateTime<Utc>>,
}

/// Callbacks invoked from the stack's notification path. Implementations
/// must not block and must not panic across the boundary.
pub trait SessionObserver: Send + Sync + 'static {
    fn on_data_change(&self, client_handle: u32, value: DataChangeValue);
    fn on_event(&self, client_handle: u32, fields: Vec<serde_json::Value>);
    /// Called for every keep-alive result; `status` is `0` when good.
    fn on_keep_alive(&self, status: u32);
    fn on_connection_lost(&self, status: u32);
}

#[derive(Clone, Debug)]
pub struct CreatedSubscription {
    pub id: u32,
    pub revised_publishing_interval_ms: f64,
}

/// Everything needed to create one monitored item.
#[derive(Clone, Debug)]
pub struct ItemCreateSpec {
    pub client_handle: u32,
    pub node: ResolvedNode,
    pub sampling_interval_ms: f64,
    pub queue_size: u32,
    pub discard_oldest: bool,
    /// Present for event items; the item then monitors the EventNotifier
    /// attribute with this filter.
    pub event_filter: Option<EventSpec>,
}

#[derive(Clone, Debug)]
pub struct ItemCreateOutcome {
    pub status: u32,
    pub server_id: u32,
    pub revised_sampling_interval_ms: f64,
}

/// A connected session. All calls may suspend; failures carry the service
/// status code where the stack reports one.
#[async_trait]
pub trait StackSession: Send + Sync {
    /// The server's namespace table, index → URI.
    async fn namespace_array(&self) -> Result<Vec<String>, StackError>;

    /// The server's application URI.
    async fn application_uri(&self) -> Result<String, StackError>;

    async fn create_subscription(
        &self,
        publishing_interval_ms: f64,
    ) -> Result<CreatedSubscription, StackError>;

    async fn delete_subscription(&self, subscription_id: u32) -> Result<(), StackError>;

    async fn create_monitored_items(
        &self,
        subscription_id: u32,
        items: Vec<ItemCreateSpec>,
    ) -> Result<Vec<ItemCreateOutcome>, StackError>;

    async fn delete_monitored_items(
        &self,
        subscription_id: u32,
        server_ids: &[u32],
    ) -> Result<(), StackError>;

    /// Enable publishing and apply pending changes on the given
    /// subscriptions.
    async fn apply_publishing(&self, subscription_ids: &[u32]) -> Result<(), StackError>;

    /// Read DisplayName attributes; `None` where the read failed.
    async fn read_display_names(
        &self,
        nodes: &[ResolvedNode],
    ) -> Result<Vec<Option<String>>, StackError>;

    async fn disconnect(&self);
}

/// Factory producing connected sessions; one per bridge instance.
#[async_trait]
pub trait SessionFactory: Send + Sync {
    async fn connect(
        &self,
        settings: &SessionSettings,
        observer: Arc<dyn SessionObserver>,
    ) -> Result<Arc<dyn StackSession>, StackError>;
}
