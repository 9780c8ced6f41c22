//! Published-nodes configuration: file model, desired-state store, versioning
//!
//! The on-disk format is a JSON array of endpoint entries. Legacy entries
//! with a single top-level `NodeId` are accepted and treated as a one-element
//! `OpcNodes` list with default intervals. Saving writes the running
//! configuration and is skipped unless the in-memory version advanced past
//! the last persisted one.

use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{info, warn};

use crate::errors::{BridgeError, BridgeResult};
use crate::model::{
    AttributeOperandSpec, DesiredEndpoint, DesiredItem, EndpointAuth, EventSpec, FilterOperand,
    FilterOperatorKind, ItemKind, ItemSettings, ItemState, NodeRef, SelectClause,
    SimpleAttributeOperandSpec, WhereClauseElement,
};
use crate::vault::EncryptedCredential;

#[derive(Clone, Copy, Debug)]
pub struct NodeDefaults {
    pub sampling_interval_ms: i32,
    pub publishing_interval_ms: i32,
    pub heartbeat_interval_secs: u32,
    pub skip_first: bool,
}

impl Default for NodeDefaults {
    fn default() -> Self {
        Self {
            sampling_interval_ms: 1000,
            publishing_interval_ms: 0,
            heartbeat_interval_secs: 0,
            skip_first: false,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum AuthenticationMode {
    #[default]
    Anonymous,
    UsernamePassword,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct PublishedNodesEntry {
    #[serde(rename = "EndpointUrl")]
    pub endpoint_url: String,

    #[serde(rename = "UseSecurity", skip_serializing_if = "Option::is_none")]
    pub use_security: Option<bool>,

    #[serde(rename = "OpcAuthenticationMode", default, skip_serializing_if = "is_anonymous")]
    pub auth_mode: AuthenticationMode,

    #[serde(rename = "EncryptedAuthUsername", skip_serializing_if = "Option::is_none")]
    pub encrypted_auth_username: Option<String>,

    #[serde(rename = "EncryptedAuthPassword", skip_serializing_if = "Option::is_none")]
    pub encrypted_auth_password: Option<String>,

    /// Legacy form: a single node id at the top of the entry
    #[serde(rename = "NodeId", skip_serializing_if = "Option::is_none")]
    pub legacy_node_id: Option<String>,

    #[serde(rename = "OpcNodes", skip_serializing_if = "Option::is_none")]
    pub opc_nodes: Option<Vec<OpcNodeEntry>>,

    #[serde(rename = "OpcEvents", skip_serializing_if = "Option::is_none")]
    pub opc_events: Option<Vec<OpcEventEntry>>,
}

fn is_anonymous(mode: &AuthenticationMode) -> bool {
    *mode == AuthenticationMode::Anonymous
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct OpcNodeEntry {
    #[serde(rename = "Id")]
    pub id: String,
    #[serde(rename = "ExpandedNodeId", skip_serializing_if = "Option::is_none")]
    pub expanded_node_id: Option<String>,
    #[serde(rename = "OpcSamplingInterval", skip_serializing_if = "Option::is_none")]
    pub sampling_interval: Option<i32>,
    #[serde(rename = "OpcPublishingInterval", skip_serializing_if = "Option::is_none")]
    pub publishing_interval: Option<i32>,
    #[serde(rename = "DisplayName", skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(rename = "HeartbeatInterval", skip_serializing_if = "Option::is_none")]
    pub heartbeat_interval: Option<u32>,
    #[serde(rename = "SkipFirst", skip_serializing_if = "Option::is_none")]
    pub skip_first: Option<bool>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct OpcEventEntry {
    #[serde(rename = "Id")]
    pub id: String,
    #[serde(rename = "DisplayName", skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(rename = "SelectClauses")]
    pub select_clauses: Vec<SelectClauseEntry>,
    #[serde(rename = "WhereClauses")]
    pub where_clauses: Vec<WhereClauseEntry>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct SelectClauseEntry {
    #[serde(rename = "TypeId")]
    pub type_id: String,
    #[serde(rename = "BrowsePaths")]
    pub browse_paths: Vec<String>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct WhereClauseEntry {
    #[serde(rename = "Operator")]
    pub operator: String,
    #[serde(rename = "Operands", default)]
    pub operands: Vec<OperandEntry>,
}

/// Exactly one of the fields must be set.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct OperandEntry {
    #[serde(rename = "Element", skip_serializing_if = "Option::is_none")]
    pub element: Option<u32>,
    #[serde(rename = "Literal", skip_serializing_if = "Option::is_none")]
    pub literal: Option<Value>,
    #[serde(rename = "Attribute", skip_serializing_if = "Option::is_none")]
    pub attribute: Option<AttributeOperandEntry>,
    #[serde(rename = "SimpleAttribute", skip_serializing_if = "Option::is_none")]
    pub simple_attribute: Option<SimpleAttributeOperandEntry>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct AttributeOperandEntry {
    #[serde(rename = "NodeId")]
    pub node_id: String,
    #[serde(rename = "Alias", skip_serializing_if = "Option::is_none")]
    pub alias: Option<String>,
    #[serde(rename = "BrowsePath", skip_serializing_if = "Option::is_none")]
    pub browse_path: Option<String>,
    #[serde(rename = "AttributeId", skip_serializing_if = "Option::is_none")]
    pub attribute_id: Option<u32>,
    #[serde(rename = "IndexRange", skip_serializing_if = "Option::is_none")]
    pub index_range: Option<String>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct SimpleAttributeOperandEntry {
    #[serde(rename = "TypeId")]
    pub type_id: String,
    #[serde(rename = "BrowsePaths", default)]
    pub browse_paths: Vec<String>,
    #[serde(rename = "AttributeId", skip_serializing_if = "Option::is_none")]
    pub attribute_id: Option<u32>,
    #[serde(rename = "IndexRange", skip_serializing_if = "Option::is_none")]
    pub index_range: Option<String>,
}

// ---------------------------------------------------------------------------
// entry ↔ model conversion

fn entry_auth(entry: &PublishedNodesEntry) -> BridgeResult<EndpointAuth> {
    match entry.auth_mode {
        AuthenticationMode::Anonymous => Ok(EndpointAuth::Anonymous),
        AuthenticationMode::UsernamePassword => {
            let username = entry.encrypted_auth_username.clone().ok_or_else(|| {
                BridgeError::Configuration(format!(
                    "{}: UsernamePassword mode without EncryptedAuthUsername",
                    entry.endpoint_url
                ))
            })?;
            let password = entry.encrypted_auth_password.clone().ok_or_else(|| {
                BridgeError::Configuration(format!(
                    "{}: UsernamePassword mode without EncryptedAuthPassword",
                    entry.endpoint_url
                ))
            })?;
            Ok(EndpointAuth::UsernamePassword(EncryptedCredential {
                username,
                password,
            }))
        }
    }
}

fn node_entry_to_item(entry: &OpcNodeEntry, defaults: &NodeDefaults) -> BridgeResult<DesiredItem> {
    let node = NodeRef::parse(&entry.id)?;
    let mut item = DesiredItem::new(
        node,
        ItemKind::Value,
        ItemSettings {
            sampling_interval_ms: entry.sampling_interval.unwrap_or(defaults.sampling_interval_ms),
            publishing_interval_ms: entry
                .publishing_interval
                .unwrap_or(defaults.publishing_interval_ms),
            display_name: entry.display_name.clone(),
            heartbeat_interval_secs: entry
                .heartbeat_interval
                .unwrap_or(defaults.heartbeat_interval_secs),
            skip_first: entry.skip_first.unwrap_or(defaults.skip_first),
            queue_size: 1,
            discard_oldest: true,
        },
    );
    if let Some(expanded) = &entry.expanded_node_id {
        item.counterpart = Some(NodeRef::parse(expanded)?);
    }
    Ok(item)
}

fn operand_entry_to_model(entry: &OperandEntry) -> BridgeResult<FilterOperand> {
    let set = [
        entry.element.is_some(),
        entry.literal.is_some(),
        entry.attribute.is_some(),
        entry.simple_attribute.is_some(),
    ]
    .iter()
    .filter(|b| **b)
    .count();
    if set != 1 {
        return Err(BridgeError::Configuration(
            "a where-clause operand must set exactly one of Element, Literal, Attribute, SimpleAttribute"
                .to_string(),
        ));
    }
    if let Some(element) = entry.element {
        return Ok(FilterOperand::Element(element));
    }
    if let Some(literal) = &entry.literal {
        return Ok(FilterOperand::Literal(literal.clone()));
    }
    if let Some(attr) = &entry.attribute {
        return Ok(FilterOperand::Attribute(AttributeOperandSpec {
            node_id: attr.node_id.clone(),
            alias: attr.alias.clone(),
            browse_path: attr.browse_path.clone(),
            attribute_id: attr.attribute_id.unwrap_or(13),
            index_range: attr.index_range.clone(),
        }));
    }
    let simple = entry.simple_attribute.as_ref().unwrap();
    Ok(FilterOperand::SimpleAttribute(SimpleAttributeOperandSpec {
        type_id: simple.type_id.clone(),
        browse_paths: simple.browse_paths.clone(),
        attribute_id: simple.attribute_id,
        index_range: simple.index_range.clone(),
    }))
}

fn event_entry_to_item(entry: &OpcEventEntry, defaults: &NodeDefaults) -> BridgeResult<DesiredItem> {
    let node = NodeRef::parse(&entry.id)?;
    let select_clauses = entry
        .select_clauses
        .iter()
        .map(|c| SelectClause {
            type_id: c.type_id.clone(),
            browse_paths: c.browse_paths.clone(),
        })
        .collect();
    let where_clauses = entry
        .where_clauses
        .iter()
        .map(|w| {
            Ok(WhereClauseElement {
                operator: FilterOperatorKind::parse(&w.operator)?,
                operands: w
                    .operands
                    .iter()
                    .map(operand_entry_to_model)
                    .collect::<BridgeResult<Vec<_>>>()?,
            })
        })
        .collect::<BridgeResult<Vec<_>>>()?;

    Ok(DesiredItem::new(
        node,
        ItemKind::Event(EventSpec {
            select_clauses,
            where_clauses,
        }),
        ItemSettings {
            sampling_interval_ms: 0,
            publishing_interval_ms: defaults.publishing_interval_ms,
            display_name: entry.display_name.clone(),
            heartbeat_interval_secs: 0,
            skip_first: false,
            queue_size: 0,
            discard_oldest: true,
        },
    ))
}

pub fn entry_to_endpoint(
    entry: &PublishedNodesEntry,
    defaults: &NodeDefaults,
) -> BridgeResult<DesiredEndpoint> {
    let mut endpoint = DesiredEndpoint::new(
        &entry.endpoint_url,
        entry.use_security.unwrap_or(true),
        entry_auth(entry)?,
    );

    if let Some(legacy) = &entry.legacy_node_id {
        let legacy_entry = OpcNodeEntry {
            id: legacy.clone(),
            ..Default::default()
        };
        endpoint.items.push(node_entry_to_item(&legacy_entry, defaults)?);
    }
    for node in entry.opc_nodes.as_deref().unwrap_or_default() {
        endpoint.items.push(node_entry_to_item(node, defaults)?);
    }
    for event in entry.opc_events.as_deref().unwrap_or_default() {
        endpoint.items.push(event_entry_to_item(event, defaults)?);
    }

    if endpoint.items.is_empty() {
        return Err(BridgeError::Configuration(format!(
            "{}: entry has neither NodeId, OpcNodes nor OpcEvents",
            entry.endpoint_url
        )));
    }
    Ok(endpoint)
}

fn operand_to_entry(operand: &FilterOperand) -> OperandEntry {
    match operand {
        FilterOperand::Element(e) => OperandEntry {
            element: Some(*e),
            ..Default::default()
        },
        FilterOperand::Literal(v) => OperandEntry {
            literal: Some(v.clone()),
            ..Default::default()
        },
        FilterOperand::Attribute(a) => OperandEntry {
            attribute: Some(AttributeOperandEntry {
                node_id: a.node_id.clone(),
                alias: a.alias.clone(),
                browse_path: a.browse_path.clone(),
                attribute_id: Some(a.attribute_id),
                index_range: a.index_range.clone(),
            }),
            ..Default::default()
        },
        FilterOperand::SimpleAttribute(s) => OperandEntry {
            simple_attribute: Some(SimpleAttributeOperandEntry {
                type_id: s.type_id.clone(),
                browse_paths: s.browse_paths.clone(),
                attribute_id: s.attribute_id,
                index_range: s.index_range.clone(),
            }),
            ..Default::default()
        },
    }
}

pub fn endpoint_to_entry(endpoint: &DesiredEndpoint) -> PublishedNodesEntry {
    let mut nodes = Vec::new();
    let mut events = Vec::new();

    for item in &endpoint.items {
        if item.state == ItemState::RemovalRequested {
            continue;
        }
        match &item.kind {
            ItemKind::Value => nodes.push(OpcNodeEntry {
                id: item.node.original(),
                expanded_node_id: match &item.node {
                    NodeRef::Indexed { .. } => item.expanded_string(),
                    NodeRef::Expanded { .. } => None,
                },
                sampling_interval: Some(item.settings.sampling_interval_ms),
                publishing_interval: Some(item.settings.publishing_interval_ms),
                display_name: item.settings.display_name.clone(),
                heartbeat_interval: (item.settings.heartbeat_interval_secs > 0)
                    .then_some(item.settings.heartbeat_interval_secs),
                skip_first: item.settings.skip_first.then_some(true),
            }),
            ItemKind::Event(spec) => events.push(OpcEventEntry {
                id: item.node.original(),
                display_name: item.settings.display_name.clone(),
                select_clauses: spec
                    .select_clauses
                    .iter()
                    .map(|c| SelectClauseEntry {
                        type_id: c.type_id.clone(),
                        browse_paths: c.browse_paths.clone(),
                    })
                    .collect(),
                where_clauses: spec
                    .where_clauses
                    .iter()
                    .map(|w| WhereClauseEntry {
                        operator: w.operator.as_str().to_string(),
                        operands: w.operands.iter().map(operand_to_entry).collect(),
                    })
                    .collect(),
            }),
        }
    }

    let (auth_mode, username, password) = match &endpoint.auth {
        EndpointAuth::Anonymous => (AuthenticationMode::Anonymous, None, None),
        EndpointAuth::UsernamePassword(cred) => (
            AuthenticationMode::UsernamePassword,
            Some(cred.username.clone()),
            Some(cred.password.clone()),
        ),
    };

    PublishedNodesEntry {
        endpoint_url: endpoint.url.clone(),
        use_security: Some(endpoint.use_security),
        auth_mode,
        encrypted_auth_username: username,
        encrypted_auth_password: password,
        legacy_node_id: None,
        opc_nodes: (!nodes.is_empty()).then_some(nodes),
        opc_events: (!events.is_empty()).then_some(events),
    }
}

// ---------------------------------------------------------------------------
// store

/// Desired-state repository plus the monotonically increasing configuration
/// version. Persistence only happens when the version advanced.
#[derive(Debug)]
pub struct NodeConfigStore {
    pub endpoints: Vec<DesiredEndpoint>,
    version: u64,
    last_persisted: u64,
}

impl NodeConfigStore {
    pub fn empty() -> Self {
        Self {
            endpoints: Vec::new(),
            version: 0,
            last_persisted: 0,
        }
    }

    pub fn from_json(json: &str, defaults: &NodeDefaults) -> BridgeResult<Self> {
        let entries: Vec<PublishedNodesEntry> = serde_json::from_str(json)?;
        // entries for the same endpoint URL (case-insensitive) merge into one
        let mut endpoints: Vec<DesiredEndpoint> = Vec::new();
        for entry in &entries {
            let endpoint = entry_to_endpoint(entry, defaults)?;
            let key = crate::model::endpoint_key(&endpoint.url);
            match endpoints
                .iter_mut()
                .find(|e| crate::model::endpoint_key(&e.url) == key)
            {
                Some(existing) => existing.items.extend(endpoint.items),
                None => endpoints.push(endpoint),
            }
        }
        Ok(Self {
            endpoints,
            version: 1,
            last_persisted: 1,
        })
    }

    pub fn load_from_file(path: &Path, defaults: &NodeDefaults) -> BridgeResult<Self> {
        if !path.exists() {
            warn!(path = %path.display(), "published-nodes file not found, starting empty");
            return Ok(Self::empty());
        }
        let json = std::fs::read_to_string(path)?;
        let store = Self::from_json(&json, defaults)?;
        info!(
            path = %path.display(),
            endpoints = store.endpoints.len(),
            "loaded published-nodes configuration"
        );
        Ok(store)
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    /// Bump on every structural change to the desired model.
    pub fn bump(&mut self) -> u64 {
        self.version += 1;
        self.version
    }

    pub fn find(&self, key: &str) -> Option<&DesiredEndpoint> {
        self.endpoints
            .iter()
            .find(|e| crate::model::endpoint_key(&e.url) == key)
    }

    pub fn find_mut(&mut self, key: &str) -> Option<&mut DesiredEndpoint> {
        self.endpoints
            .iter_mut()
            .find(|e| crate::model::endpoint_key(&e.url) == key)
    }

    pub fn remove_endpoint(&mut self, key: &str) {
        self.endpoints
            .retain(|e| crate::model::endpoint_key(&e.url) != key);
    }

    pub fn to_entries(&self) -> Vec<PublishedNodesEntry> {
        self.endpoints.iter().map(endpoint_to_entry).collect()
    }

    pub fn to_json(&self) -> BridgeResult<String> {
        Ok(serde_json::to_string_pretty(&self.to_entries())?)
    }

    /// Write the running configuration if the version advanced. Returns
    /// whether a write happened.
    pub fn save_to_file(&mut self, path: &Path) -> BridgeResult<bool> {
        if self.version <= self.last_persisted {
            return Ok(false);
        }
        let version = self.version;
        let json = self.to_json()?;
        std::fs::write(path, json)?;
        self.last_persisted = version;
        info!(path = %path.display(), version, "persisted published-nodes configuration");
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Identifier;

    fn defaults() -> NodeDefaults {
        NodeDefaults::default()
    }

    #[test]
    fn test_load_modern_entry() {
        let json = r#"[
            {
                "EndpointUrl": "opc.tcp://plc:4840",
                "UseSecurity": false,
                "OpcNodes": [
                    { "Id": "ns=2;s=Pump", "OpcSamplingInterval": 500, "OpcPublishingInterval": 1000,
                      "DisplayName": "Pump", "HeartbeatInterval": 30, "SkipFirst": true },
                    { "Id": "nsu=urn:x;i=42" }
                ]
            }
        ]"#;
        let store = NodeConfigStore::from_json(json, &defaults()).unwrap();
        assert_eq!(store.endpoints.len(), 1);
        let ep = &store.endpoints[0];
        assert_eq!(ep.url, "opc.tcp://plc:4840");
        assert!(!ep.use_security);
        assert_eq!(ep.items.len(), 2);

        let pump = &ep.items[0];
        assert_eq!(pump.settings.sampling_interval_ms, 500);
        assert_eq!(pump.settings.publishing_interval_ms, 1000);
        assert_eq!(pump.settings.heartbeat_interval_secs, 30);
        assert!(pump.settings.skip_first);
        assert_eq!(pump.state, ItemState::UnmonitoredNamespaceUpdateRequested);

        let second = &ep.items[1];
        assert_eq!(
            second.node,
            NodeRef::Expanded {
                namespace_uri: "urn:x".to_string(),
                id: Identifier::Numeric(42)
            }
        );
    }

    #[test]
    fn test_load_legacy_entry() {
        let json = r#"[ { "EndpointUrl": "opc.tcp://plc:4840", "NodeId": "ns=2;s=Old" } ]"#;
        let store = NodeConfigStore::from_json(json, &defaults()).unwrap();
        let ep = &store.endpoints[0];
        assert_eq!(ep.items.len(), 1);
        assert_eq!(ep.items[0].node.original(), "ns=2;s=Old");
        assert_eq!(ep.items[0].settings.sampling_interval_ms, 1000);
        assert!(ep.use_security);
    }

    #[test]
    fn test_load_event_entry() {
        let json = r#"[
            {
                "EndpointUrl": "opc.tcp://plc:4840",
                "OpcEvents": [
                    {
                        "Id": "i=2253",
                        "SelectClauses": [
                            { "TypeId": "i=2041", "BrowsePaths": ["Severity"] },
                            { "TypeId": "i=2041", "BrowsePaths": ["Message"] }
                        ],
                        "WhereClauses": [
                            {
                                "Operator": "GreaterThan",
                                "Operands": [
                                    { "SimpleAttribute": { "TypeId": "i=2041", "BrowsePaths": ["Severity"] } },
                                    { "Literal": 500 }
                                ]
                            }
                        ]
                    }
                ]
            }
        ]"#;
        let store = NodeConfigStore::from_json(json, &defaults()).unwrap();
        let item = &store.endpoints[0].items[0];
        let ItemKind::Event(spec) = &item.kind else {
            panic!("expected an event item");
        };
        assert_eq!(spec.select_clauses.len(), 2);
        assert_eq!(spec.select_clauses[0].field_name(), "Severity");
        assert_eq!(spec.where_clauses[0].operator, FilterOperatorKind::GreaterThan);
        assert_eq!(spec.where_clauses[0].operands.len(), 2);
    }

    #[test]
    fn test_operand_must_set_exactly_one_variant() {
        let json = r#"[
            {
                "EndpointUrl": "opc.tcp://plc:4840",
                "OpcEvents": [
                    {
                        "Id": "i=2253",
                        "SelectClauses": [{ "TypeId": "i=2041", "BrowsePaths": ["Severity"] }],
                        "WhereClauses": [
                            { "Operator": "Equals", "Operands": [ { "Element": 1, "Literal": 2 } ] }
                        ]
                    }
                ]
            }
        ]"#;
        assert!(NodeConfigStore::from_json(json, &defaults()).is_err());
    }

    #[test]
    fn test_username_mode_requires_credentials() {
        let json = r#"[
            {
                "EndpointUrl": "opc.tcp://plc:4840",
                "OpcAuthenticationMode": "UsernamePassword",
                "NodeId": "i=2258"
            }
        ]"#;
        assert!(NodeConfigStore::from_json(json, &defaults()).is_err());
    }

    #[test]
    fn test_round_trip_preserves_semantics() {
        let json = r#"[
            {
                "EndpointUrl": "opc.tcp://plc:4840",
                "UseSecurity": false,
                "OpcAuthenticationMode": "UsernamePassword",
                "EncryptedAuthUsername": "AAEC",
                "EncryptedAuthPassword": "AwQF",
                "OpcNodes": [
                    { "Id": "ns=2;s=Pump", "OpcSamplingInterval": 500, "OpcPublishingInterval": 1000,
                      "HeartbeatInterval": 30, "SkipFirst": true },
                    { "Id": "nsu=urn:x;i=42", "OpcSamplingInterval": 1000, "OpcPublishingInterval": 0 }
                ]
            }
        ]"#;
        let mut store = NodeConfigStore::from_json(json, &defaults()).unwrap();
        let saved = store.to_json().unwrap();
        let reloaded = NodeConfigStore::from_json(&saved, &defaults()).unwrap();

        assert_eq!(store.endpoints.len(), reloaded.endpoints.len());
        let (a, b) = (&store.endpoints[0], &reloaded.endpoints[0]);
        assert_eq!(a.url, b.url);
        assert_eq!(a.use_security, b.use_security);
        assert_eq!(a.auth, b.auth);
        assert_eq!(a.items.len(), b.items.len());
        for (x, y) in a.items.iter().zip(&b.items) {
            assert_eq!(x.node, y.node);
            assert_eq!(x.settings, y.settings);
        }

        // legacy entries converge to the modern form on save
        store.endpoints[0].items[0].state = ItemState::Monitored;
        assert!(store.to_json().unwrap().contains("OpcNodes"));
    }

    #[test]
    fn test_save_skipped_without_version_advance() {
        let mut store = NodeConfigStore::empty();
        let path = std::env::temp_dir().join(format!(
            "bridge-nodes-{}-{}.json",
            std::process::id(),
            line!()
        ));
        // version == last_persisted, nothing to do
        assert!(!store.save_to_file(&path).unwrap());

        store.bump();
        assert!(store.save_to_file(&path).unwrap());
        // a second save without changes is idempotent
        assert!(!store.save_to_file(&path).unwrap());
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn test_entries_for_same_endpoint_merge() {
        let json = r#"[
            { "EndpointUrl": "opc.tcp://plc:4840", "NodeId": "i=1" },
            { "EndpointUrl": "OPC.TCP://PLC:4840", "OpcNodes": [ { "Id": "i=2" } ] }
        ]"#;
        let store = NodeConfigStore::from_json(json, &defaults()).unwrap();
        assert_eq!(store.endpoints.len(), 1);
        assert_eq!(store.endpoints[0].items.len(), 2);
    }

    #[test]
    fn test_removal_requested_items_not_persisted() {
        let json = r#"[ { "EndpointUrl": "opc.tcp://plc:4840", "OpcNodes": [ { "Id": "i=1" }, { "Id": "i=2" } ] } ]"#;
        let mut store = NodeConfigStore::from_json(json, &defaults()).unwrap();
        store.endpoints[0].items[0].state = ItemState::RemovalRequested;
        let entries = store.to_entries();
        let nodes = entries[0].opc_nodes.as_ref().unwrap();
        assert_eq!(nodes.len(), 1);
        assert_eq!(nodes[0].id, "i=2");
    }
}
