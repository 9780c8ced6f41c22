//! async-opcua implementation of the stack seam
//!
//! Session creation follows the builder → connect_to_matching_endpoint →
//! event-loop pattern; the event loop is driven by a background task that
//! surfaces keep-alive results and connection loss to the observer.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use opcua::client::{
    ClientBuilder, IdentityToken, Password, Session, SessionActivity, SessionPollResult,
    SubscriptionCallbacks,
};
use opcua::types::{
    AttributeId, AttributeOperand, ByteString, ContentFilter, ContentFilterElement, DataValue,
    ElementOperand, EndpointDescription, EventFilter, ExtensionObject, FilterOperator, Guid,
    LiteralOperand, MessageSecurityMode, MonitoredItemCreateRequest, NodeId, QualifiedName,
    ReadValueId, SimpleAttributeOperand, StatusCode, TimestampsToReturn, UAString, UserTokenPolicy,
    UserTokenType, VariableId, Variant,
};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{
    CreatedSubscription, ItemCreateOutcome, ItemCreateSpec, SessionFactory, SessionObserver,
    SessionSettings, StackError, StackSession,
};
use crate::model::{
    status, EventSpec, FilterOperand, FilterOperatorKind, Identifier, ResolvedNode,
};
use crate::stack::DataChangeValue;

pub struct OpcUaSessionFactory {
    pub application_name: String,
    pub application_uri: String,
    pub product_uri: String,
    pub pki_dir: PathBuf,
    pub auto_accept_certs: bool,
    pub session_timeout_ms: u32,
}

#[async_trait]
impl SessionFactory for OpcUaSessionFactory {
    async fn connect(
        &self,
        settings: &SessionSettings,
        observer: Arc<dyn SessionObserver>,
    ) -> Result<Arc<dyn StackSession>, StackError> {
        info!(endpoint = %settings.endpoint_url, "connecting OPC UA session");

        let mut client = ClientBuilder::new()
            .application_name(self.application_name.as_str())
            .application_uri(self.application_uri.as_str())
            .product_uri(self.product_uri.as_str())
            .pki_dir(self.pki_dir.clone())
            .create_sample_keypair(true)
            .trust_server_certs(self.auto_accept_certs)
            .session_retry_limit(1)
            .session_timeout(self.session_timeout_ms)
            .client()
            .map_err(|e| StackError::Connect(format!("client build failed: {e:?}")))?;

        let (policy, mode) = if settings.use_security {
            ("Basic256Sha256", MessageSecurityMode::SignAndEncrypt)
        } else {
            ("None", MessageSecurityMode::None)
        };

        let (identity, token_policy) = match &settings.credentials {
            Some(cred) => (
                IdentityToken::UserName(
                    cred.username.clone(),
                    Password::from(cred.password.clone()),
                ),
                UserTokenPolicy {
                    policy_id: "username_password".into(),
                    token_type: UserTokenType::UserName,
                    issued_token_type: Default::default(),
                    issuer_endpoint_url: Default::default(),
                    security_policy_uri: Default::default(),
                },
            ),
            None => (IdentityToken::Anonymous, UserTokenPolicy::anonymous()),
        };

        let endpoint: EndpointDescription =
            (settings.endpoint_url.as_str(), policy, mode, token_policy).into();

        let (session, event_loop) = client
            .connect_to_matching_endpoint(endpoint, identity)
            .await
            .map_err(|e| StackError::Connect(e.to_string()))?;

        let driver = {
            let observer = observer.clone();
            let url = settings.endpoint_url.clone();
            tokio::spawn(async move {
                let mut stream = Box::pin(event_loop.enter());
                while let Some(result) = stream.next().await {
                    match result {
                        Ok(SessionPollResult::SessionActivity(activity)) => match activity {
                            SessionActivity::KeepAliveSucceeded => {
                                observer.on_keep_alive(status::GOOD)
                            }
                            SessionActivity::KeepAliveFailed(code) => {
                                observer.on_keep_alive(code.bits())
                            }
                            _ => {}
                        },
                        Ok(SessionPollResult::ConnectionLost(code)) => {
                            observer.on_connection_lost(code.bits())
                        }
                        Ok(_) => {}
                        Err(code) => {
                            observer.on_connection_lost(code.bits());
                            break;
                        }
                    }
                }
                debug!(endpoint = %url, "session event loop finished");
            })
        };

        let _ = session.wait_for_connection().await;
        info!(endpoint = %settings.endpoint_url, "OPC UA session established");

        Ok(Arc::new(OpcUaSession {
            session,
            observer,
            driver,
            operation_timeout: settings.operation_timeout,
        }))
    }
}

pub struct OpcUaSession {
    session: Arc<Session>,
    observer: Arc<dyn SessionObserver>,
    driver: JoinHandle<()>,
    operation_timeout: Duration,
}

impl OpcUaSession {
    async fn timed<T, F>(&self, fut: F) -> Result<T, StackError>
    where
        F: std::future::Future<Output = Result<T, StatusCode>>,
    {
        match tokio::time::timeout(self.operation_timeout, fut).await {
            Err(_) => Err(StackError::Timeout),
            Ok(Ok(value)) => Ok(value),
            Ok(Err(code)) => Err(StackError::Service(code.bits())),
        }
    }

    async fn read_values(&self, reads: Vec<ReadValueId>) -> Result<Vec<DataValue>, StackError> {
        self.timed(self.session.read(&reads, TimestampsToReturn::Source, 0.0))
            .await
    }
}

#[async_trait]
impl StackSession for OpcUaSession {
    async fn namespace_array(&self) -> Result<Vec<String>, StackError> {
        let values = self
            .read_values(vec![ReadValueId {
                node_id: VariableId::Server_NamespaceArray.into(),
                attribute_id: AttributeId::Value as u32,
                index_range: Default::default(),
                data_encoding: QualifiedName::null(),
            }])
            .await?;

        let Some(Variant::Array(array)) = values.into_iter().next().and_then(|dv| dv.value) else {
            return Err(StackError::Service(status::BAD_NODE_ID_UNKNOWN));
        };
        Ok(array
            .values
            .iter()
            .map(|v| match v {
                Variant::String(s) => s.to_string(),
                other => other.to_string(),
            })
            .collect())
    }

    async fn application_uri(&self) -> Result<String, StackError> {
        let values = self
            .read_values(vec![ReadValueId {
                node_id: VariableId::Server_ServerArray.into(),
                attribute_id: AttributeId::Value as u32,
                index_range: Default::default(),
                data_encoding: QualifiedName::null(),
            }])
            .await?;

        if let Some(Variant::Array(array)) = values.into_iter().next().and_then(|dv| dv.value) {
            if let Some(Variant::String(uri)) = array.values.first() {
                return Ok(uri.to_string());
            }
        }
        Ok(String::new())
    }

    async fn create_subscription(
        &self,
        publishing_interval_ms: f64,
    ) -> Result<CreatedSubscription, StackError> {
        let observer = self.observer.clone();
        let data_observer = observer.clone();
        let event_observer = observer.clone();

        let callbacks = SubscriptionCallbacks::new(
            move |status| {
                debug!(?status, "subscription status change");
            },
            move |value: DataValue, item: &opcua::client::MonitoredItem| {
                data_observer.on_data_change(item.client_handle(), convert_data_value(value));
            },
            move |fields: Option<Vec<Variant>>, item: &opcua::client::MonitoredItem| {
                let fields = fields
                    .unwrap_or_default()
                    .iter()
                    .map(variant_to_json)
                    .collect();
                event_observer.on_event(item.client_handle(), fields);
            },
        );

        let id = self
            .timed(self.session.create_subscription(
                Duration::from_millis(publishing_interval_ms.max(0.0) as u64),
                60,
                20,
                0,
                0,
                true,
                callbacks,
            ))
            .await?;

        debug!(subscription = id, requested_ms = publishing_interval_ms, "created subscription");

        // the client API does not surface the server-revised interval;
        // report the requested value
        Ok(CreatedSubscription {
            id,
            revised_publishing_interval_ms: publishing_interval_ms,
        })
    }

    async fn delete_subscription(&self, subscription_id: u32) -> Result<(), StackError> {
        let results = self
            .timed(self.session.delete_subscriptions(&[subscription_id]))
            .await?;
        if let Some(code) = results.first() {
            if !code.is_good() {
                warn!(subscription = subscription_id, status = %code, "delete subscription failed");
            }
        }
        Ok(())
    }

    async fn create_monitored_items(
        &self,
        subscription_id: u32,
        items: Vec<ItemCreateSpec>,
    ) -> Result<Vec<ItemCreateOutcome>, StackError> {
        if items.is_empty() {
            return Ok(Vec::new());
        }

        let requests: Vec<MonitoredItemCreateRequest> = items
            .iter()
            .map(|spec| {
                let mut request: MonitoredItemCreateRequest =
                    resolved_to_node_id(&spec.node).into();
                request.requested_parameters.client_handle = spec.client_handle;
                request.requested_parameters.sampling_interval = spec.sampling_interval_ms;
                request.requested_parameters.queue_size = spec.queue_size;
                request.requested_parameters.discard_oldest = spec.discard_oldest;
                if let Some(event) = &spec.event_filter {
                    request.item_to_monitor.attribute_id = AttributeId::EventNotifier as u32;
                    request.requested_parameters.filter =
                        ExtensionObject::from_message(build_event_filter(event));
                }
                request
            })
            .collect();

        let results = self
            .timed(self.session.create_monitored_items(
                subscription_id,
                TimestampsToReturn::Source,
                requests,
            ))
            .await?;

        Ok(results
            .iter()
            .map(|res| ItemCreateOutcome {
                status: res.result.status_code.bits(),
                server_id: res.result.monitored_item_id,
                revised_sampling_interval_ms: res.result.revised_sampling_interval,
            })
            .collect())
    }

    async fn delete_monitored_items(
        &self,
        subscription_id: u32,
        server_ids: &[u32],
    ) -> Result<(), StackError> {
        if server_ids.is_empty() {
            return Ok(());
        }
        let results = self
            .timed(self.session.delete_monitored_items(subscription_id, server_ids))
            .await?;
        for (id, code) in server_ids.iter().zip(results.iter()) {
            if !code.is_good() {
                warn!(item = id, status = %code, "delete monitored item failed");
            }
        }
        Ok(())
    }

    async fn apply_publishing(&self, subscription_ids: &[u32]) -> Result<(), StackError> {
        if subscription_ids.is_empty() {
            return Ok(());
        }
        let results = self
            .timed(self.session.set_publishing_mode(subscription_ids, true))
            .await?;
        for (id, code) in subscription_ids.iter().zip(results.iter()) {
            if !code.is_good() {
                return Err(StackError::Service(code.bits()));
            }
            debug!(subscription = id, "publishing enabled");
        }
        Ok(())
    }

    async fn read_display_names(
        &self,
        nodes: &[ResolvedNode],
    ) -> Result<Vec<Option<String>>, StackError> {
        if nodes.is_empty() {
            return Ok(Vec::new());
        }
        let reads = nodes
            .iter()
            .map(|node| ReadValueId {
                node_id: resolved_to_node_id(node),
                attribute_id: AttributeId::DisplayName as u32,
                index_range: Default::default(),
                data_encoding: QualifiedName::null(),
            })
            .collect();

        let values = self.read_values(reads).await?;
        Ok(values
            .into_iter()
            .map(|dv| match dv.value {
                Some(Variant::LocalizedText(text)) => Some(text.text.to_string()),
                _ => None,
            })
            .collect())
    }

    async fn disconnect(&self) {
        if let Err(code) = self.session.disconnect().await {
            debug!(status = %code, "session disconnect reported an error");
        }
        self.driver.abort();
    }
}

fn resolved_to_node_id(node: &ResolvedNode) -> NodeId {
    match &node.id {
        Identifier::Numeric(v) => NodeId::new(node.namespace, *v),
        Identifier::Text(v) => NodeId::new(node.namespace, v.clone()),
        Identifier::Guid(v) => match v.parse::<Guid>() {
            Ok(guid) => NodeId::new(node.namespace, guid),
            Err(_) => NodeId::new(node.namespace, v.clone()),
        },
        Identifier::Opaque(v) => match ByteString::from_base64(v) {
            Some(bytes) => NodeId::new(node.namespace, bytes),
            None => NodeId::new(node.namespace, v.clone()),
        },
    }
}

fn parse_node_id(text: &str) -> NodeId {
    // event type ids default to BaseEventType when unparseable
    text.parse::<NodeId>().unwrap_or_else(|_| NodeId::new(0, 2041u32))
}

fn operator_to_stack(op: FilterOperatorKind) -> FilterOperator {
    match op {
        FilterOperatorKind::Equals => FilterOperator::Equals,
        FilterOperatorKind::IsNull => FilterOperator::IsNull,
        FilterOperatorKind::GreaterThan => FilterOperator::GreaterThan,
        FilterOperatorKind::LessThan => FilterOperator::LessThan,
        FilterOperatorKind::GreaterThanOrEqual => FilterOperator::GreaterThanOrEqual,
        FilterOperatorKind::LessThanOrEqual => FilterOperator::LessThanOrEqual,
        FilterOperatorKind::Like => FilterOperator::Like,
        FilterOperatorKind::Not => FilterOperator::Not,
        FilterOperatorKind::Between => FilterOperator::Between,
        FilterOperatorKind::InList => FilterOperator::InList,
        FilterOperatorKind::And => FilterOperator::And,
        FilterOperatorKind::Or => FilterOperator::Or,
        FilterOperatorKind::Cast => FilterOperator::Cast,
        FilterOperatorKind::InView => FilterOperator::InView,
        FilterOperatorKind::OfType => FilterOperator::OfType,
        FilterOperatorKind::RelatedTo => FilterOperator::RelatedTo,
        FilterOperatorKind::BitwiseAnd => FilterOperator::BitwiseAnd,
        FilterOperatorKind::BitwiseOr => FilterOperator::BitwiseOr,
    }
}

fn json_to_variant(value: &serde_json::Value) -> Variant {
    match value {
        serde_json::Value::Bool(b) => Variant::Boolean(*b),
        serde_json::Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Variant::Int64(i)
            } else {
                Variant::Double(n.as_f64().unwrap_or_default())
            }
        }
        serde_json::Value::String(s) => Variant::String(UAString::from(s.as_str())),
        other => Variant::String(UAString::from(other.to_string())),
    }
}

fn operand_to_extension_object(operand: &FilterOperand) -> ExtensionObject {
    match operand {
        FilterOperand::Element(index) => {
            ExtensionObject::from_message(ElementOperand { index: *index })
        }
        FilterOperand::Literal(value) => ExtensionObject::from_message(LiteralOperand {
            value: json_to_variant(value),
        }),
        FilterOperand::Attribute(spec) => ExtensionObject::from_message(AttributeOperand {
            node_id: parse_node_id(&spec.node_id),
            alias: spec
                .alias
                .as_deref()
                .map(UAString::from)
                .unwrap_or_default(),
            attribute_id: spec.attribute_id,
            index_range: spec
                .index_range
                .as_deref()
                .and_then(|s| s.parse().ok())
                .unwrap_or_default(),
            ..Default::default()
        }),
        FilterOperand::SimpleAttribute(spec) => {
            ExtensionObject::from_message(simple_attribute_operand(
                &spec.type_id,
                &spec.browse_paths,
                spec.attribute_id.unwrap_or(AttributeId::Value as u32),
            ))
        }
    }
}

fn simple_attribute_operand(
    type_id: &str,
    browse_paths: &[String],
    attribute_id: u32,
) -> SimpleAttributeOperand {
    SimpleAttributeOperand {
        type_definition_id: parse_node_id(type_id),
        browse_path: Some(
            browse_paths
                .iter()
                .map(|p| QualifiedName::new(0, p.as_str()))
                .collect(),
        ),
        attribute_id,
        ..Default::default()
    }
}

fn build_event_filter(spec: &EventSpec) -> EventFilter {
    EventFilter {
        select_clauses: Some(
            spec.select_clauses
                .iter()
                .map(|c| {
                    simple_attribute_operand(&c.type_id, &c.browse_paths, AttributeId::Value as u32)
                })
                .collect(),
        ),
        where_clause: ContentFilter {
            elements: (!spec.where_clauses.is_empty()).then(|| {
                spec.where_clauses
                    .iter()
                    .map(|w| ContentFilterElement {
                        filter_operator: operator_to_stack(w.operator),
                        filter_operands: Some(
                            w.operands.iter().map(operand_to_extension_object).collect(),
                        ),
                    })
                    .collect()
            }),
        },
    }
}

fn convert_data_value(value: DataValue) -> DataChangeValue {
    DataChangeValue {
        status: value.status.map(|s| s.bits()).unwrap_or(status::GOOD),
        source_timestamp: value.source_timestamp.map(|ts| ts.as_chrono()),
        value: value
            .value
            .as_ref()
            .map(variant_to_json)
            .unwrap_or(serde_json::Value::Null),
    }
}

/// JSON rendering of a variant, mirroring what the hub expects for the
/// pre-serialised value in a [`MessageRecord`].
pub fn variant_to_json(variant: &Variant) -> serde_json::Value {
    use serde_json::Value;
    match variant {
        Variant::Empty => Value::Null,
        Variant::Boolean(v) => Value::from(*v),
        Variant::SByte(v) => Value::from(*v),
        Variant::Byte(v) => Value::from(*v),
        Variant::Int16(v) => Value::from(*v),
        Variant::UInt16(v) => Value::from(*v),
        Variant::Int32(v) => Value::from(*v),
        Variant::UInt32(v) => Value::from(*v),
        Variant::Int64(v) => Value::from(*v),
        Variant::UInt64(v) => Value::from(*v),
        Variant::Float(v) => Value::from(*v),
        Variant::Double(v) => Value::from(*v),
        Variant::String(v) => Value::from(v.to_string()),
        Variant::DateTime(v) => Value::from(
            v.as_chrono()
                .to_rfc3339_opts(chrono::SecondsFormat::Millis, true),
        ),
        Variant::Guid(v) => Value::from(v.to_string()),
        Variant::StatusCode(v) => Value::from(v.bits()),
        Variant::ByteString(v) => Value::from(v.as_base64()),
        Variant::QualifiedName(v) => Value::from(v.name.to_string()),
        Variant::LocalizedText(v) => Value::from(v.text.to_string()),
        Variant::NodeId(v) => Value::from(v.to_string()),
        Variant::ExpandedNodeId(v) => Value::from(v.to_string()),
        Variant::Array(array) => {
            Value::Array(array.values.iter().map(variant_to_json).collect())
        }
        other => Value::from(format!("{other:?}")),
    }
}
