//! Monitored-item model and OPC UA node identity
//!
//! A published node is addressed either by NodeId (`ns=<index>;<id>`) or by
//! ExpandedNodeId (`nsu=<namespace-uri>;<id>`). Both forms of the same
//! logical node compare equal once the owning session's namespace table is
//! known; before that only string equality applies.

use std::collections::HashSet;
use std::fmt;

use crate::errors::{BridgeError, BridgeResult};
use crate::vault::EncryptedCredential;

pub mod status {
    //! OPC UA status codes the bridge cares about, by numeric value.

    pub const GOOD: u32 = 0x0000_0000;
    pub const UNCERTAIN: u32 = 0x4000_0000;
    pub const BAD: u32 = 0x8000_0000;

    pub const BAD_TIMEOUT: u32 = 0x800A_0000;
    pub const BAD_SESSION_ID_INVALID: u32 = 0x8025_0000;
    pub const BAD_SESSION_CLOSED: u32 = 0x8026_0000;
    pub const BAD_SUBSCRIPTION_ID_INVALID: u32 = 0x8028_0000;
    pub const BAD_NO_COMMUNICATION: u32 = 0x8031_0000;
    pub const BAD_WAITING_FOR_INITIAL_DATA: u32 = 0x8032_0000;
    pub const BAD_NODE_ID_INVALID: u32 = 0x8033_0000;
    pub const BAD_NODE_ID_UNKNOWN: u32 = 0x8034_0000;
    pub const BAD_ATTRIBUTE_ID_INVALID: u32 = 0x8035_0000;
    pub const BAD_MONITORED_ITEM_ID_INVALID: u32 = 0x8042_0000;

    /// Severity is encoded in the two top bits.
    pub fn is_good(code: u32) -> bool {
        code >> 30 == 0
    }

    pub fn is_bad(code: u32) -> bool {
        code & BAD != 0
    }

    /// Errors that invalidate the whole session or subscription and require
    /// an internal disconnect with a clean reset.
    pub fn invalidates_session(code: u32) -> bool {
        matches!(
            code,
            BAD_SESSION_ID_INVALID | BAD_SESSION_CLOSED | BAD_SUBSCRIPTION_ID_INVALID
        )
    }

    /// Errors that mean the node itself is unusable; the item is left alone
    /// until the next reconfiguration.
    pub fn is_permanent_node_error(code: u32) -> bool {
        matches!(code, BAD_NODE_ID_INVALID | BAD_NODE_ID_UNKNOWN | BAD_ATTRIBUTE_ID_INVALID)
    }

    const NAMES: &[(u32, &str)] = &[
        (GOOD, "Good"),
        (UNCERTAIN, "Uncertain"),
        (BAD, "Bad"),
        (0x8001_0000, "BadUnexpectedError"),
        (0x8002_0000, "BadInternalError"),
        (0x8003_0000, "BadOutOfMemory"),
        (0x8004_0000, "BadResourceUnavailable"),
        (0x8005_0000, "BadCommunicationError"),
        (0x8006_0000, "BadEncodingError"),
        (0x8007_0000, "BadDecodingError"),
        (0x8008_0000, "BadEncodingLimitsExceeded"),
        (BAD_TIMEOUT, "BadTimeout"),
        (0x800B_0000, "BadServiceUnsupported"),
        (0x800C_0000, "BadShutdown"),
        (0x800D_0000, "BadServerNotConnected"),
        (0x800E_0000, "BadServerHalted"),
        (0x800F_0000, "BadNothingToDo"),
        (0x8010_0000, "BadTooManyOperations"),
        (BAD_SESSION_ID_INVALID, "BadSessionIdInvalid"),
        (BAD_SESSION_CLOSED, "BadSessionClosed"),
        (0x8027_0000, "BadSessionNotActivated"),
        (BAD_SUBSCRIPTION_ID_INVALID, "BadSubscriptionIdInvalid"),
        (BAD_NO_COMMUNICATION, "BadNoCommunication"),
        (BAD_WAITING_FOR_INITIAL_DATA, "BadWaitingForInitialData"),
        (BAD_NODE_ID_INVALID, "BadNodeIdInvalid"),
        (BAD_NODE_ID_UNKNOWN, "BadNodeIdUnknown"),
        (BAD_ATTRIBUTE_ID_INVALID, "BadAttributeIdInvalid"),
        (0x8036_0000, "BadIndexRangeInvalid"),
        (0x803A_0000, "BadNotReadable"),
        (0x803B_0000, "BadNotWritable"),
        (0x803C_0000, "BadOutOfRange"),
        (0x803D_0000, "BadNotSupported"),
        (0x803E_0000, "BadNotFound"),
        (BAD_MONITORED_ITEM_ID_INVALID, "BadMonitoredItemIdInvalid"),
        (0x8043_0000, "BadMonitoredItemFilterInvalid"),
        (0x8044_0000, "BadMonitoredItemFilterUnsupported"),
        (0x8045_0000, "BadFilterNotAllowed"),
        (0x408F_0000, "UncertainNoCommunicationLastUsableValue"),
        (0x4090_0000, "UncertainLastUsableValue"),
        (0x4091_0000, "UncertainSubstituteValue"),
        (0x4092_0000, "UncertainInitialValue"),
        (0x4093_0000, "UncertainSensorNotAccurate"),
        (0x4094_0000, "UncertainEngineeringUnitsExceeded"),
        (0x4095_0000, "UncertainSubNormal"),
    ];

    pub fn name(code: u32) -> Option<&'static str> {
        NAMES.iter().find(|(c, _)| *c == code).map(|(_, n)| *n)
    }

    pub fn from_name(name: &str) -> Option<u32> {
        NAMES
            .iter()
            .find(|(_, n)| n.eq_ignore_ascii_case(name))
            .map(|(c, _)| *c)
    }

    /// Symbolic name where known, hex rendering otherwise.
    pub fn symbol(code: u32) -> String {
        match name(code) {
            Some(n) => n.to_string(),
            None => format!("{code:#010x}"),
        }
    }
}

/// The identifier part of a node address.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum Identifier {
    /// `i=<u32>`
    Numeric(u32),
    /// `s=<string>`
    Text(String),
    /// `g=<guid>`
    Guid(String),
    /// `b=<base64>`
    Opaque(String),
}

impl fmt::Display for Identifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Identifier::Numeric(v) => write!(f, "i={v}"),
            Identifier::Text(v) => write!(f, "s={v}"),
            Identifier::Guid(v) => write!(f, "g={v}"),
            Identifier::Opaque(v) => write!(f, "b={v}"),
        }
    }
}

impl Identifier {
    fn parse(s: &str) -> BridgeResult<Self> {
        let (kind, rest) = s
            .split_once('=')
            .ok_or_else(|| BridgeError::NodeIdFormat(s.to_string()))?;
        match kind {
            "i" => rest
                .parse::<u32>()
                .map(Identifier::Numeric)
                .map_err(|_| BridgeError::NodeIdFormat(s.to_string())),
            "s" => Ok(Identifier::Text(rest.to_string())),
            "g" => Ok(Identifier::Guid(rest.to_ascii_lowercase())),
            "b" => Ok(Identifier::Opaque(rest.to_string())),
            _ => Err(BridgeError::NodeIdFormat(s.to_string())),
        }
    }
}

/// A node address in one of its two forms.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum NodeRef {
    /// `ns=<index>;<id>` — index is only meaningful within one session
    Indexed { namespace: u16, id: Identifier },
    /// `nsu=<namespace-uri>;<id>` — stable across sessions
    Expanded { namespace_uri: String, id: Identifier },
}

impl NodeRef {
    /// Parse a node identifier string. Strings containing `nsu=` parse as
    /// ExpandedNodeId, everything else as NodeId (namespace 0 when absent).
    pub fn parse(s: &str) -> BridgeResult<Self> {
        let s = s.trim();
        if s.is_empty() {
            return Err(BridgeError::NodeIdFormat("empty node id".to_string()));
        }
        if let Some(rest) = s.strip_prefix("nsu=") {
            let (uri, id) = rest
                .split_once(';')
                .ok_or_else(|| BridgeError::NodeIdFormat(s.to_string()))?;
            if uri.is_empty() {
                return Err(BridgeError::NodeIdFormat(s.to_string()));
            }
            return Ok(NodeRef::Expanded {
                namespace_uri: uri.to_string(),
                id: Identifier::parse(id)?,
            });
        }
        if let Some(rest) = s.strip_prefix("ns=") {
            let (ns, id) = rest
                .split_once(';')
                .ok_or_else(|| BridgeError::NodeIdFormat(s.to_string()))?;
            let namespace = ns
                .parse::<u16>()
                .map_err(|_| BridgeError::NodeIdFormat(s.to_string()))?;
            return Ok(NodeRef::Indexed {
                namespace,
                id: Identifier::parse(id)?,
            });
        }
        Ok(NodeRef::Indexed {
            namespace: 0,
            id: Identifier::parse(s)?,
        })
    }

    /// The textual NodeId form, if this is an indexed reference.
    pub fn node_id_string(&self) -> Option<String> {
        match self {
            NodeRef::Indexed { namespace: 0, id } => Some(id.to_string()),
            NodeRef::Indexed { namespace, id } => Some(format!("ns={namespace};{id}")),
            NodeRef::Expanded { .. } => None,
        }
    }

    /// The textual ExpandedNodeId form, if this is a URI reference.
    pub fn expanded_string(&self) -> Option<String> {
        match self {
            NodeRef::Indexed { .. } => None,
            NodeRef::Expanded { namespace_uri, id } => Some(format!("nsu={namespace_uri};{id}")),
        }
    }

    /// The original textual form, whichever it is.
    pub fn original(&self) -> String {
        self.node_id_string()
            .or_else(|| self.expanded_string())
            .unwrap_or_default()
    }

    pub fn identifier(&self) -> &Identifier {
        match self {
            NodeRef::Indexed { id, .. } | NodeRef::Expanded { id, .. } => id,
        }
    }

    /// Whether this reference still needs the namespace table to be usable
    /// for duplicate detection and stack addressing.
    pub fn needs_namespace_table(&self) -> bool {
        matches!(self, NodeRef::Indexed { namespace, .. } if *namespace > 0)
            || matches!(self, NodeRef::Expanded { .. })
    }

    /// Resolve to a session-local namespace index for the stack.
    pub fn resolve(&self, namespaces: &[String]) -> Option<ResolvedNode> {
        match self {
            NodeRef::Indexed { namespace, id } => {
                if (*namespace as usize) < namespaces.len().max(1) {
                    Some(ResolvedNode {
                        namespace: *namespace,
                        id: id.clone(),
                    })
                } else {
                    None
                }
            }
            NodeRef::Expanded { namespace_uri, id } => namespaces
                .iter()
                .position(|uri| uri == namespace_uri)
                .map(|idx| ResolvedNode {
                    namespace: idx as u16,
                    id: id.clone(),
                }),
        }
    }

    /// Canonical (namespace URI, identifier) form once a namespace table is
    /// available.
    pub fn canonical(&self, namespaces: &[String]) -> Option<CanonicalNodeId> {
        match self {
            NodeRef::Indexed { namespace, id } => {
                namespaces
                    .get(*namespace as usize)
                    .map(|uri| CanonicalNodeId {
                        namespace_uri: uri.clone(),
                        id: id.clone(),
                    })
            }
            NodeRef::Expanded { namespace_uri, id } => Some(CanonicalNodeId {
                namespace_uri: namespace_uri.clone(),
                id: id.clone(),
            }),
        }
    }

    /// The counterpart form derived from the namespace table: an indexed
    /// reference gains its `nsu=` form, an expanded reference gains `ns=`.
    pub fn counterpart(&self, namespaces: &[String]) -> Option<NodeRef> {
        match self {
            NodeRef::Indexed { namespace, id } => {
                namespaces.get(*namespace as usize).map(|uri| NodeRef::Expanded {
                    namespace_uri: uri.clone(),
                    id: id.clone(),
                })
            }
            NodeRef::Expanded { namespace_uri, id } => namespaces
                .iter()
                .position(|uri| uri == namespace_uri)
                .map(|idx| NodeRef::Indexed {
                    namespace: idx as u16,
                    id: id.clone(),
                }),
        }
    }

    /// Identity string used in item keys: canonical when the namespace table
    /// allows it, the original text otherwise.
    pub fn identity(&self, namespaces: Option<&[String]>) -> String {
        namespaces
            .and_then(|ns| self.canonical(ns))
            .map(|c| c.to_string())
            .unwrap_or_else(|| self.original())
    }
}

/// Canonical node identity: namespace URI plus identifier.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct CanonicalNodeId {
    pub namespace_uri: String,
    pub id: Identifier,
}

impl fmt::Display for CanonicalNodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "nsu={};{}", self.namespace_uri, self.id)
    }
}

/// Session-local node address handed to the stack.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResolvedNode {
    pub namespace: u16,
    pub id: Identifier,
}

/// Lifecycle of one published node.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ItemState {
    Unmonitored,
    UnmonitoredNamespaceUpdateRequested,
    Monitored,
    RemovalRequested,
}

/// Select clause of an event item: which field to extract from events of the
/// given type.
#[derive(Clone, Debug, PartialEq)]
pub struct SelectClause {
    pub type_id: String,
    pub browse_paths: Vec<String>,
}

impl SelectClause {
    /// Field name used in the emitted event record.
    pub fn field_name(&self) -> String {
        self.browse_paths.join("/")
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FilterOperatorKind {
    Equals,
    IsNull,
    GreaterThan,
    LessThan,
    GreaterThanOrEqual,
    LessThanOrEqual,
    Like,
    Not,
    Between,
    InList,
    And,
    Or,
    Cast,
    InView,
    OfType,
    RelatedTo,
    BitwiseAnd,
    BitwiseOr,
}

impl FilterOperatorKind {
    pub fn parse(s: &str) -> BridgeResult<Self> {
        let op = match s.to_ascii_lowercase().as_str() {
            "equals" | "eq" => Self::Equals,
            "isnull" | "null" => Self::IsNull,
            "greaterthan" | "gt" => Self::GreaterThan,
            "lessthan" | "lt" => Self::LessThan,
            "greaterthanorequal" | "ge" => Self::GreaterThanOrEqual,
            "lessthanorequal" | "le" => Self::LessThanOrEqual,
            "like" => Self::Like,
            "not" => Self::Not,
            "between" => Self::Between,
            "inlist" => Self::InList,
            "and" => Self::And,
            "or" => Self::Or,
            "cast" => Self::Cast,
            "inview" => Self::InView,
            "oftype" => Self::OfType,
            "relatedto" => Self::RelatedTo,
            "bitwiseand" => Self::BitwiseAnd,
            "bitwiseor" => Self::BitwiseOr,
            _ => {
                return Err(BridgeError::Configuration(format!(
                    "unknown where-clause operator '{s}'"
                )))
            }
        };
        Ok(op)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Equals => "Equals",
            Self::IsNull => "IsNull",
            Self::GreaterThan => "GreaterThan",
            Self::LessThan => "LessThan",
            Self::GreaterThanOrEqual => "GreaterThanOrEqual",
            Self::LessThanOrEqual => "LessThanOrEqual",
            Self::Like => "Like",
            Self::Not => "Not",
            Self::Between => "Between",
            Self::InList => "InList",
            Self::And => "And",
            Self::Or => "Or",
            Self::Cast => "Cast",
            Self::InView => "InView",
            Self::OfType => "OfType",
            Self::RelatedTo => "RelatedTo",
            Self::BitwiseAnd => "BitwiseAnd",
            Self::BitwiseOr => "BitwiseOr",
        }
    }
}

/// One operand of a where-clause element.
#[derive(Clone, Debug, PartialEq)]
pub enum FilterOperand {
    /// Index of another element in the filter
    Element(u32),
    /// Literal value
    Literal(serde_json::Value),
    /// Full attribute operand
    Attribute(AttributeOperandSpec),
    /// Simple attribute operand (type + browse path)
    SimpleAttribute(SimpleAttributeOperandSpec),
}

#[derive(Clone, Debug, PartialEq)]
pub struct AttributeOperandSpec {
    pub node_id: String,
    pub alias: Option<String>,
    pub browse_path: Option<String>,
    pub attribute_id: u32,
    pub index_range: Option<String>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct SimpleAttributeOperandSpec {
    pub type_id: String,
    pub browse_paths: Vec<String>,
    pub attribute_id: Option<u32>,
    pub index_range: Option<String>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct WhereClauseElement {
    pub operator: FilterOperatorKind,
    pub operands: Vec<FilterOperand>,
}

/// Event specification of an event monitored item.
#[derive(Clone, Debug, PartialEq)]
pub struct EventSpec {
    pub select_clauses: Vec<SelectClause>,
    pub where_clauses: Vec<WhereClauseElement>,
}

/// Value vs event item.
#[derive(Clone, Debug, PartialEq)]
pub enum ItemKind {
    Value,
    Event(EventSpec),
}

/// Per-item settings, desired side.
#[derive(Clone, Debug, PartialEq)]
pub struct ItemSettings {
    pub sampling_interval_ms: i32,
    pub publishing_interval_ms: i32,
    pub display_name: Option<String>,
    /// 0 disables the heartbeat
    pub heartbeat_interval_secs: u32,
    pub skip_first: bool,
    pub queue_size: u32,
    pub discard_oldest: bool,
}

/// Identity of a monitored item: canonical node form plus the two intervals.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ItemKey {
    pub node: String,
    pub sampling_interval_ms: i32,
    pub publishing_interval_ms: i32,
}

/// Desired state of one published node.
#[derive(Clone, Debug)]
pub struct DesiredItem {
    pub node: NodeRef,
    /// The other form of the same node, filled in once resolved.
    pub counterpart: Option<NodeRef>,
    pub kind: ItemKind,
    pub settings: ItemSettings,
    pub state: ItemState,
    /// Permanent node error recorded by the reconciler; cleared on
    /// reconfiguration.
    pub last_error: Option<u32>,
}

impl DesiredItem {
    pub fn new(node: NodeRef, kind: ItemKind, settings: ItemSettings) -> Self {
        let state = if node.needs_namespace_table() {
            ItemState::UnmonitoredNamespaceUpdateRequested
        } else {
            ItemState::Unmonitored
        };
        Self {
            node,
            counterpart: None,
            kind,
            settings,
            state,
            last_error: None,
        }
    }

    pub fn key(&self, namespaces: Option<&[String]>) -> ItemKey {
        ItemKey {
            node: self.node.identity(namespaces),
            sampling_interval_ms: self.settings.sampling_interval_ms,
            publishing_interval_ms: self.settings.publishing_interval_ms,
        }
    }

    /// The NodeId form, from either the original reference or the resolved
    /// counterpart.
    pub fn node_id_string(&self) -> Option<String> {
        self.node
            .node_id_string()
            .or_else(|| self.counterpart.as_ref().and_then(|c| c.node_id_string()))
    }

    /// The ExpandedNodeId form, from either side.
    pub fn expanded_string(&self) -> Option<String> {
        self.node
            .expanded_string()
            .or_else(|| self.counterpart.as_ref().and_then(|c| c.expanded_string()))
    }
}

/// Authentication of one endpoint.
#[derive(Clone, Debug, PartialEq)]
pub enum EndpointAuth {
    Anonymous,
    UsernamePassword(EncryptedCredential),
}

/// Desired state of one endpoint.
#[derive(Clone, Debug)]
pub struct DesiredEndpoint {
    pub url: String,
    pub use_security: bool,
    pub auth: EndpointAuth,
    pub items: Vec<DesiredItem>,
}

impl DesiredEndpoint {
    pub fn new(url: &str, use_security: bool, auth: EndpointAuth) -> Self {
        Self {
            url: url.to_string(),
            use_security,
            auth,
            items: Vec::new(),
        }
    }
}

/// Endpoint URLs compare case-insensitively.
pub fn endpoint_key(url: &str) -> String {
    url.to_ascii_lowercase()
}

/// Globally suppressed OPC UA status codes; matching notifications are
/// dropped before shaping.
#[derive(Clone, Debug, Default)]
pub struct SuppressedStatusCodes {
    codes: HashSet<u32>,
}

impl SuppressedStatusCodes {
    /// Parse a comma-separated list of symbolic names, decimal integers or
    /// hex (`0x…`) values. Entries may be surrounded by quotes.
    pub fn parse(input: &str) -> BridgeResult<Self> {
        let mut codes = HashSet::new();
        for raw in input.split(',') {
            let entry = raw.trim().trim_matches('"').trim_matches('\'').trim();
            if entry.is_empty() {
                continue;
            }
            let code = if let Some(hex) = entry.strip_prefix("0x").or_else(|| entry.strip_prefix("0X")) {
                u32::from_str_radix(hex, 16).map_err(|_| {
                    BridgeError::Configuration(format!("invalid status code '{entry}'"))
                })?
            } else if entry.chars().all(|c| c.is_ascii_digit()) {
                entry.parse::<u32>().map_err(|_| {
                    BridgeError::Configuration(format!("invalid status code '{entry}'"))
                })?
            } else {
                status::from_name(entry).ok_or_else(|| {
                    BridgeError::Configuration(format!("unknown status code name '{entry}'"))
                })?
            };
            codes.insert(code);
        }
        Ok(Self { codes })
    }

    pub fn contains(&self, code: u32) -> bool {
        self.codes.contains(&code)
    }

    pub fn is_empty(&self) -> bool {
        self.codes.is_empty()
    }
}
