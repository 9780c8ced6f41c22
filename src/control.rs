//! In-process control façade used by RPC adapters
//!
//! Wraps the bridge's publish/unpublish/list operations behind a uniform
//! status taxonomy. List responses are paginated so a serialised page always
//! fits the hub's response limit.

use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;
use tracing::error;

use crate::errors::BridgeError;
use crate::model::{endpoint_key, ItemKind, ItemState};
use crate::reconciler::{Bridge, PublishNodeSpec, PublishOutcome, UnpublishOutcome};

/// Maximum serialised size of one list page: the hub response limit minus
/// headroom for the response envelope.
pub const MAX_RESPONSE_SIZE: usize = 128 * 1024 - 256;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ControlStatus {
    /// Already in the desired state
    Ok,
    /// Change queued for the reconcile loop
    Accepted,
    /// Owning session no longer exists or shutdown in progress
    Gone,
    /// Parse/validation error in the caller's input
    NotAcceptable,
    InternalServerError,
}

#[derive(Clone, Debug)]
pub struct ControlResponse {
    pub status: ControlStatus,
    pub message: String,
}

impl ControlResponse {
    fn new(status: ControlStatus, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct EndpointListing {
    #[serde(rename = "EndpointUrl")]
    pub endpoint_url: String,
    #[serde(rename = "UseSecurity")]
    pub use_security: bool,
    #[serde(rename = "NodeCount")]
    pub node_count: usize,
}

#[derive(Clone, Debug, Serialize)]
pub struct NodeListing {
    #[serde(rename = "Id")]
    pub id: String,
    #[serde(rename = "ExpandedNodeId", skip_serializing_if = "Option::is_none")]
    pub expanded_node_id: Option<String>,
    #[serde(rename = "OpcSamplingInterval")]
    pub sampling_interval: i32,
    #[serde(rename = "OpcPublishingInterval")]
    pub publishing_interval: i32,
    #[serde(rename = "DisplayName", skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(rename = "HeartbeatInterval", skip_serializing_if = "Option::is_none")]
    pub heartbeat_interval: Option<u32>,
    #[serde(rename = "SkipFirst", skip_serializing_if = "Option::is_none")]
    pub skip_first: Option<bool>,
    #[serde(rename = "IsEvent")]
    pub is_event: bool,
    #[serde(rename = "State")]
    pub state: String,
}

#[derive(Clone, Debug)]
pub struct ListResponse<T> {
    pub status: ControlStatus,
    pub page: Vec<T>,
    pub continuation: Option<String>,
}

pub struct ControlApi {
    bridge: Arc<Bridge>,
}

impl ControlApi {
    pub fn new(bridge: Arc<Bridge>) -> Self {
        Self { bridge }
    }

    pub async fn publish_node(
        &self,
        endpoint_url: &str,
        spec: PublishNodeSpec,
    ) -> ControlResponse {
        if let Err(e) = url::Url::parse(endpoint_url) {
            return ControlResponse::new(
                ControlStatus::NotAcceptable,
                format!("invalid endpoint URL: {e}"),
            );
        }
        match self.bridge.publish_node(endpoint_url, spec).await {
            Ok(PublishOutcome::AlreadyPublished) => {
                ControlResponse::new(ControlStatus::Ok, "node already published")
            }
            Ok(PublishOutcome::Accepted) => {
                ControlResponse::new(ControlStatus::Accepted, "publish queued")
            }
            Err(e) => self.map_error(e),
        }
    }

    pub async fn unpublish_node(&self, endpoint_url: &str, node: &str) -> ControlResponse {
        match self.bridge.unpublish_node(endpoint_url, node).await {
            Ok(UnpublishOutcome::Accepted(count)) => ControlResponse::new(
                ControlStatus::Accepted,
                format!("{count} item(s) marked for removal"),
            ),
            Ok(UnpublishOutcome::UnknownEndpoint) => {
                ControlResponse::new(ControlStatus::Gone, "endpoint is not published")
            }
            Ok(UnpublishOutcome::UnknownNode) => {
                ControlResponse::new(ControlStatus::NotAcceptable, "node is not published")
            }
            Err(e) => self.map_error(e),
        }
    }

    pub async fn unpublish_all(&self, endpoint_url: Option<&str>) -> ControlResponse {
        match self.bridge.unpublish_all(endpoint_url).await {
            Ok(count) => ControlResponse::new(
                ControlStatus::Accepted,
                format!("{count} item(s) marked for removal"),
            ),
            Err(e) => self.map_error(e),
        }
    }

    pub async fn list_endpoints(&self, cursor: Option<&str>) -> ListResponse<EndpointListing> {
        let start = match parse_cursor(cursor) {
            Ok(start) => start,
            Err(response) => {
                return ListResponse {
                    status: response.status,
                    page: Vec::new(),
                    continuation: None,
                }
            }
        };

        let listings: Vec<EndpointListing> = self
            .bridge
            .snapshot()
            .await
            .iter()
            .map(|e| EndpointListing {
                endpoint_url: e.url.clone(),
                use_security: e.use_security,
                node_count: e
                    .items
                    .iter()
                    .filter(|i| i.state != ItemState::RemovalRequested)
                    .count(),
            })
            .collect();

        let (page, continuation) = paginate(listings, start, MAX_RESPONSE_SIZE);
        ListResponse {
            status: ControlStatus::Ok,
            page,
            continuation,
        }
    }

    pub async fn list_nodes_on(
        &self,
        endpoint_url: &str,
        cursor: Option<&str>,
    ) -> ListResponse<NodeListing> {
        let start = match parse_cursor(cursor) {
            Ok(start) => start,
            Err(response) => {
                return ListResponse {
                    status: response.status,
                    page: Vec::new(),
                    continuation: None,
                }
            }
        };

        let key = endpoint_key(endpoint_url);
        let snapshot = self.bridge.snapshot().await;
        let Some(endpoint) = snapshot
            .iter()
            .find(|e| endpoint_key(&e.url) == key)
        else {
            return ListResponse {
                status: ControlStatus::Gone,
                page: Vec::new(),
                continuation: None,
            };
        };

        let listings: Vec<NodeListing> = endpoint
            .items
            .iter()
            .filter(|i| i.state != ItemState::RemovalRequested)
            .map(|i| NodeListing {
                id: i.node.original(),
                expanded_node_id: i.expanded_string(),
                sampling_interval: i.settings.sampling_interval_ms,
                publishing_interval: i.settings.publishing_interval_ms,
                display_name: i.settings.display_name.clone(),
                heartbeat_interval: (i.settings.heartbeat_interval_secs > 0)
                    .then_some(i.settings.heartbeat_interval_secs),
                skip_first: i.settings.skip_first.then_some(true),
                is_event: matches!(i.kind, ItemKind::Event(_)),
                state: format!("{:?}", i.state),
            })
            .collect();

        let (page, continuation) = paginate(listings, start, MAX_RESPONSE_SIZE);
        ListResponse {
            status: ControlStatus::Ok,
            page,
            continuation,
        }
    }

    fn map_error(&self, error: BridgeError) -> ControlResponse {
        match error {
            BridgeError::NodeIdFormat(e) => ControlResponse::new(
                ControlStatus::NotAcceptable,
                format!("invalid node id: {e}"),
            ),
            BridgeError::UnknownEndpoint(e) => {
                ControlResponse::new(ControlStatus::Gone, format!("unknown endpoint: {e}"))
            }
            BridgeError::ShuttingDown => {
                ControlResponse::new(ControlStatus::Gone, "shutdown in progress")
            }
            other => {
                error!(error = %other, "control operation failed");
                ControlResponse::new(ControlStatus::InternalServerError, other.to_string())
            }
        }
    }
}

fn parse_cursor(cursor: Option<&str>) -> Result<usize, ControlResponse> {
    match cursor {
        None => Ok(0),
        Some(text) => text.parse::<usize>().map_err(|_| {
            ControlResponse::new(ControlStatus::NotAcceptable, "invalid continuation token")
        }),
    }
}

/// Take entries from `start` until the serialised page would exceed
/// `max_size`; returns the page plus the next cursor when entries remain. A
/// page always advances by at least one entry.
fn paginate<T: Serialize>(entries: Vec<T>, start: usize, max_size: usize) -> (Vec<T>, Option<String>) {
    let mut page = Vec::new();
    // array brackets
    let mut used = 2;

    for (index, entry) in entries.into_iter().enumerate().skip(start) {
        let entry_size = serde_json::to_value(&entry)
            .map(|v: Value| v.to_string().len())
            .unwrap_or(0);
        let separator = usize::from(!page.is_empty());
        if !page.is_empty() && used + entry_size + separator > max_size {
            return (page, Some(index.to_string()));
        }
        used += entry_size + separator;
        page.push(entry);
    }

    (page, None)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Serialize)]
    struct Row {
        name: String,
    }

    fn rows(count: usize, name_len: usize) -> Vec<Row> {
        (0..count)
            .map(|i| Row {
                name: format!("{i:06}{}", "x".repeat(name_len)),
            })
            .collect()
    }

    #[test]
    fn test_paginate_all_fit() {
        let (page, next) = paginate(rows(10, 4), 0, MAX_RESPONSE_SIZE);
        assert_eq!(page.len(), 10);
        assert!(next.is_none());
    }

    #[test]
    fn test_paginate_splits_and_resumes() {
        // each row serialises to ~120 bytes; cap the page at ~1 KiB
        let (page, next) = paginate(rows(100, 100), 0, 1024);
        assert!(page.len() < 100);
        let cursor: usize = next.as_deref().unwrap().parse().unwrap();
        assert_eq!(cursor, page.len());

        let (rest, next2) = paginate(rows(100, 100), cursor, 1024);
        assert!(!rest.is_empty());
        assert!(next2.is_some() || cursor + rest.len() == 100);
    }

    #[test]
    fn test_paginate_page_size_bound() {
        let max = 2048;
        let (page, _) = paginate(rows(100, 100), 0, max);
        let serialised = serde_json::to_string(&page).unwrap();
        assert!(serialised.len() <= max);
    }

    #[test]
    fn test_paginate_cursor_past_end() {
        let (page, next) = paginate(rows(5, 4), 99, 1024);
        assert!(page.is_empty());
        assert!(next.is_none());
    }

    #[test]
    fn test_parse_cursor() {
        assert_eq!(parse_cursor(None).unwrap(), 0);
        assert_eq!(parse_cursor(Some("42")).unwrap(), 42);
        assert!(parse_cursor(Some("abc")).is_err());
    }
}
