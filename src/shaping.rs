//! Telemetry shaping: per-endpoint field rules applied to notifications
//!
//! Every recognised record field carries publish/name/pattern settings plus
//! two flatten flags controlling whether the MonitoredItem and Value blocks
//! are inlined. Endpoint-specific entries overlay only the fields they set;
//! everything else inherits from the defaults.

use std::collections::HashMap;

use chrono::{DateTime, SecondsFormat, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::warn;

use crate::errors::{BridgeError, BridgeResult};
use crate::model::{endpoint_key, status};

/// One value notification after assembly, before shaping.
#[derive(Clone, Debug)]
pub struct MessageRecord {
    pub endpoint_url: String,
    pub node_id: Option<String>,
    pub expanded_node_id: Option<String>,
    pub application_uri: String,
    pub display_name: Option<String>,
    /// Pre-serialised value
    pub value: String,
    /// Whether the value was a string and keeps its JSON quoting
    pub preserve_quotes: bool,
    pub source_timestamp: Option<DateTime<Utc>>,
    pub status_code: Option<u32>,
    pub status: Option<String>,
}

impl MessageRecord {
    /// Pre-serialise a JSON value the way the hub expects it: strings keep
    /// their content raw with the quote flag set, everything else is emitted
    /// as its JSON token.
    pub fn serialise_value(value: &Value) -> (String, bool) {
        match value {
            Value::String(s) => (s.clone(), true),
            other => (other.to_string(), false),
        }
    }
}

/// One event notification after assembly.
#[derive(Clone, Debug)]
pub struct EventRecord {
    pub endpoint_url: String,
    pub node_id: Option<String>,
    pub expanded_node_id: Option<String>,
    pub application_uri: String,
    pub display_name: Option<String>,
    /// Select-clause field name → extracted value
    pub fields: Vec<(String, Value)>,
    pub receive_time: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// file model

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct TelemetryConfigFile {
    #[serde(rename = "Defaults", skip_serializing_if = "Option::is_none")]
    pub defaults: Option<EndpointTelemetryEntry>,
    #[serde(rename = "EndpointSpecific", skip_serializing_if = "Option::is_none")]
    pub endpoint_specific: Option<Vec<EndpointTelemetryEntry>>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct EndpointTelemetryEntry {
    #[serde(rename = "ForEndpointUrl", skip_serializing_if = "Option::is_none")]
    pub for_endpoint_url: Option<String>,
    #[serde(rename = "EndpointUrl", skip_serializing_if = "Option::is_none")]
    pub endpoint_url: Option<FieldSettingEntry>,
    #[serde(rename = "NodeId", skip_serializing_if = "Option::is_none")]
    pub node_id: Option<FieldSettingEntry>,
    #[serde(rename = "ExpandedNodeId", skip_serializing_if = "Option::is_none")]
    pub expanded_node_id: Option<FieldSettingEntry>,
    #[serde(rename = "MonitoredItem", skip_serializing_if = "Option::is_none")]
    pub monitored_item: Option<MonitoredItemTelemetryEntry>,
    #[serde(rename = "Value", skip_serializing_if = "Option::is_none")]
    pub value: Option<ValueTelemetryEntry>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct MonitoredItemTelemetryEntry {
    #[serde(rename = "Flat", skip_serializing_if = "Option::is_none")]
    pub flat: Option<bool>,
    #[serde(rename = "ApplicationUri", skip_serializing_if = "Option::is_none")]
    pub application_uri: Option<FieldSettingEntry>,
    #[serde(rename = "DisplayName", skip_serializing_if = "Option::is_none")]
    pub display_name: Option<FieldSettingEntry>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ValueTelemetryEntry {
    #[serde(rename = "Flat", skip_serializing_if = "Option::is_none")]
    pub flat: Option<bool>,
    #[serde(rename = "Value", skip_serializing_if = "Option::is_none")]
    pub value: Option<FieldSettingEntry>,
    #[serde(rename = "SourceTimestamp", skip_serializing_if = "Option::is_none")]
    pub source_timestamp: Option<FieldSettingEntry>,
    #[serde(rename = "StatusCode", skip_serializing_if = "Option::is_none")]
    pub status_code: Option<FieldSettingEntry>,
    #[serde(rename = "Status", skip_serializing_if = "Option::is_none")]
    pub status: Option<FieldSettingEntry>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct FieldSettingEntry {
    #[serde(rename = "Publish", skip_serializing_if = "Option::is_none")]
    pub publish: Option<bool>,
    #[serde(rename = "Name", skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(rename = "Pattern", skip_serializing_if = "Option::is_none")]
    pub pattern: Option<String>,
}

// ---------------------------------------------------------------------------
// compiled rules

#[derive(Clone, Debug)]
struct FieldRule {
    publish: bool,
    name: String,
    pattern: Option<Regex>,
}

impl FieldRule {
    fn new(publish: bool, name: &str) -> Self {
        Self {
            publish,
            name: name.to_string(),
            pattern: None,
        }
    }

    /// Apply the pattern: capture groups 1..N of the first match are
    /// concatenated. A non-matching pattern leaves the value unchanged.
    fn apply(&self, raw: &str) -> Option<String> {
        let pattern = self.pattern.as_ref()?;
        let caps = pattern.captures(raw)?;
        let mut out = String::new();
        for group in caps.iter().skip(1).flatten() {
            out.push_str(group.as_str());
        }
        Some(out)
    }
}

#[derive(Clone, Debug)]
struct EndpointRules {
    endpoint_url: FieldRule,
    node_id: FieldRule,
    expanded_node_id: FieldRule,
    application_uri: FieldRule,
    display_name: FieldRule,
    value: FieldRule,
    source_timestamp: FieldRule,
    status_code: FieldRule,
    status: FieldRule,
    monitored_item_flat: bool,
    value_flat: bool,
}

impl EndpointRules {
    /// Built-in defaults compatible with the legacy downstream consumer.
    fn builtin() -> Self {
        Self {
            endpoint_url: FieldRule::new(false, "EndpointUrl"),
            node_id: FieldRule::new(true, "NodeId"),
            expanded_node_id: FieldRule::new(false, "ExpandedNodeId"),
            application_uri: FieldRule::new(true, "ApplicationUri"),
            display_name: FieldRule::new(true, "DisplayName"),
            value: FieldRule::new(true, "Value"),
            source_timestamp: FieldRule::new(true, "SourceTimestamp"),
            status_code: FieldRule::new(false, "StatusCode"),
            status: FieldRule::new(false, "Status"),
            monitored_item_flat: true,
            value_flat: false,
        }
    }
}

fn overlay_field(
    rule: &mut FieldRule,
    entry: Option<&FieldSettingEntry>,
    field: &str,
    allow_rename: bool,
    allow_pattern: bool,
) -> BridgeResult<()> {
    let Some(entry) = entry else { return Ok(()) };
    if let Some(publish) = entry.publish {
        rule.publish = publish;
    }
    if let Some(name) = &entry.name {
        if !allow_rename {
            return Err(BridgeError::Configuration(format!(
                "'Name' on field {field} may only be set in Defaults"
            )));
        }
        rule.name = name.clone();
    }
    if let Some(pattern) = &entry.pattern {
        if !allow_pattern {
            warn!(field, "a Pattern on a numeric field is ignored");
        } else {
            rule.pattern = Some(Regex::new(pattern).map_err(|e| {
                BridgeError::Configuration(format!("invalid pattern on {field}: {e}"))
            })?);
        }
    }
    Ok(())
}

fn overlay(base: &EndpointRules, entry: &EndpointTelemetryEntry, is_defaults: bool) -> BridgeResult<EndpointRules> {
    let mut rules = base.clone();
    overlay_field(&mut rules.endpoint_url, entry.endpoint_url.as_ref(), "EndpointUrl", is_defaults, true)?;
    overlay_field(&mut rules.node_id, entry.node_id.as_ref(), "NodeId", is_defaults, true)?;
    overlay_field(
        &mut rules.expanded_node_id,
        entry.expanded_node_id.as_ref(),
        "ExpandedNodeId",
        is_defaults,
        true,
    )?;
    if let Some(mi) = &entry.monitored_item {
        if let Some(flat) = mi.flat {
            if !is_defaults {
                return Err(BridgeError::Configuration(
                    "'MonitoredItem.Flat' may only be set in Defaults".to_string(),
                ));
            }
            rules.monitored_item_flat = flat;
        }
        overlay_field(
            &mut rules.application_uri,
            mi.application_uri.as_ref(),
            "MonitoredItem.ApplicationUri",
            is_defaults,
            true,
        )?;
        overlay_field(
            &mut rules.display_name,
            mi.display_name.as_ref(),
            "MonitoredItem.DisplayName",
            is_defaults,
            true,
        )?;
    }
    if let Some(v) = &entry.value {
        if let Some(flat) = v.flat {
            if !is_defaults {
                return Err(BridgeError::Configuration(
                    "'Value.Flat' may only be set in Defaults".to_string(),
                ));
            }
            rules.value_flat = flat;
        }
        overlay_field(&mut rules.value, v.value.as_ref(), "Value.Value", is_defaults, true)?;
        overlay_field(
            &mut rules.source_timestamp,
            v.source_timestamp.as_ref(),
            "Value.SourceTimestamp",
            is_defaults,
            true,
        )?;
        overlay_field(
            &mut rules.status_code,
            v.status_code.as_ref(),
            "Value.StatusCode",
            is_defaults,
            false,
        )?;
        overlay_field(&mut rules.status, v.status.as_ref(), "Value.Status", is_defaults, true)?;
    }
    Ok(rules)
}

/// Compiled telemetry shaper.
#[derive(Clone, Debug)]
pub struct TelemetryShaper {
    defaults: EndpointRules,
    per_endpoint: HashMap<String, EndpointRules>,
}

impl Default for TelemetryShaper {
    fn default() -> Self {
        Self {
            defaults: EndpointRules::builtin(),
            per_endpoint: HashMap::new(),
        }
    }
}

impl TelemetryShaper {
    pub fn from_json(json: &str) -> BridgeResult<Self> {
        let file: TelemetryConfigFile = serde_json::from_str(json)?;
        Self::from_file_model(file)
    }

    pub fn from_file_model(file: TelemetryConfigFile) -> BridgeResult<Self> {
        let mut defaults = EndpointRules::builtin();
        if let Some(entry) = &file.defaults {
            defaults = overlay(&defaults, entry, true)?;
        }

        let mut per_endpoint = HashMap::new();
        for entry in file.endpoint_specific.unwrap_or_default() {
            let url = entry.for_endpoint_url.as_deref().ok_or_else(|| {
                BridgeError::Configuration(
                    "endpoint-specific telemetry entry without ForEndpointUrl".to_string(),
                )
            })?;
            let key = endpoint_key(url);
            if per_endpoint.contains_key(&key) {
                return Err(BridgeError::Configuration(format!(
                    "duplicate endpoint-specific telemetry entry for {url}"
                )));
            }
            per_endpoint.insert(key, overlay(&defaults, &entry, false)?);
        }

        Ok(Self {
            defaults,
            per_endpoint,
        })
    }

    fn rules_for(&self, endpoint_url: &str) -> &EndpointRules {
        self.per_endpoint
            .get(&endpoint_key(endpoint_url))
            .unwrap_or(&self.defaults)
    }

    /// Shape a value record into its hub JSON form.
    pub fn shape(&self, record: &MessageRecord) -> String {
        let rules = self.rules_for(&record.endpoint_url);
        let mut top = Map::new();

        emit_string(&mut top, &rules.endpoint_url, Some(record.endpoint_url.as_str()));
        // the NodeId field falls back to the expanded form when only that is
        // known, the ExpandedNodeId field never falls back
        emit_string(
            &mut top,
            &rules.node_id,
            record
                .node_id
                .as_deref()
                .or(record.expanded_node_id.as_deref()),
        );
        emit_string(&mut top, &rules.expanded_node_id, record.expanded_node_id.as_deref());

        let mut monitored = Map::new();
        {
            let target = if rules.monitored_item_flat { &mut top } else { &mut monitored };
            emit_string(target, &rules.application_uri, Some(record.application_uri.as_str()));
            emit_string(target, &rules.display_name, record.display_name.as_deref());
        }
        if !rules.monitored_item_flat && !monitored.is_empty() {
            top.insert("MonitoredItem".to_string(), Value::Object(monitored));
        }

        let mut value_block = Map::new();
        {
            let target = if rules.value_flat { &mut top } else { &mut value_block };
            if rules.value.publish {
                let shaped = match rules.value.apply(&record.value) {
                    Some(s) => Value::String(s),
                    None => raw_value(&record.value, record.preserve_quotes),
                };
                target.insert(rules.value.name.clone(), shaped);
            }
            if rules.source_timestamp.publish {
                if let Some(ts) = &record.source_timestamp {
                    let rendered = ts.to_rfc3339_opts(SecondsFormat::Millis, true);
                    let shaped = rules
                        .source_timestamp
                        .apply(&rendered)
                        .unwrap_or(rendered);
                    target.insert(rules.source_timestamp.name.clone(), Value::String(shaped));
                }
            }
            if rules.status_code.publish {
                if let Some(code) = record.status_code {
                    target.insert(rules.status_code.name.clone(), Value::from(code));
                }
            }
            if rules.status.publish {
                if let Some(s) = &record.status {
                    let shaped = rules.status.apply(s).unwrap_or_else(|| s.clone());
                    target.insert(rules.status.name.clone(), Value::String(shaped));
                }
            }
        }
        if !rules.value_flat && !value_block.is_empty() {
            top.insert("Value".to_string(), Value::Object(value_block));
        }

        Value::Object(top).to_string()
    }

    /// Shape an event record. Event fields are emitted under their
    /// select-clause names; the shared fields follow the same rules as value
    /// records.
    pub fn shape_event(&self, record: &EventRecord) -> String {
        let rules = self.rules_for(&record.endpoint_url);
        let mut top = Map::new();

        emit_string(&mut top, &rules.endpoint_url, Some(record.endpoint_url.as_str()));
        emit_string(
            &mut top,
            &rules.node_id,
            record
                .node_id
                .as_deref()
                .or(record.expanded_node_id.as_deref()),
        );
        emit_string(&mut top, &rules.expanded_node_id, record.expanded_node_id.as_deref());
        emit_string(&mut top, &rules.application_uri, Some(record.application_uri.as_str()));
        emit_string(&mut top, &rules.display_name, record.display_name.as_deref());

        if rules.source_timestamp.publish {
            top.insert(
                "ReceiveTime".to_string(),
                Value::String(record.receive_time.to_rfc3339_opts(SecondsFormat::Millis, true)),
            );
        }

        let mut fields = Map::new();
        for (name, value) in &record.fields {
            fields.insert(name.clone(), value.clone());
        }
        top.insert("EventFields".to_string(), Value::Object(fields));

        Value::Object(top).to_string()
    }

    /// Record a MessageRecord ready for emission from its pieces.
    #[allow(clippy::too_many_arguments)]
    pub fn build_record(
        endpoint_url: &str,
        node_id: Option<String>,
        expanded_node_id: Option<String>,
        application_uri: &str,
        display_name: Option<String>,
        value: &Value,
        source_timestamp: Option<DateTime<Utc>>,
        status_code: u32,
    ) -> MessageRecord {
        let (value, preserve_quotes) = MessageRecord::serialise_value(value);
        MessageRecord {
            endpoint_url: endpoint_url.to_string(),
            node_id,
            expanded_node_id,
            application_uri: application_uri.to_string(),
            display_name,
            value,
            preserve_quotes,
            source_timestamp,
            status_code: Some(status_code),
            status: Some(status::symbol(status_code)),
        }
    }
}

fn emit_string(target: &mut Map<String, Value>, rule: &FieldRule, raw: Option<&str>) {
    if !rule.publish {
        return;
    }
    let Some(raw) = raw else { return };
    let shaped = rule.apply(raw).unwrap_or_else(|| raw.to_string());
    target.insert(rule.name.clone(), Value::String(shaped));
}

fn raw_value(raw: &str, preserve_quotes: bool) -> Value {
    if preserve_quotes {
        Value::String(raw.to_string())
    } else {
        serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
    }
}
