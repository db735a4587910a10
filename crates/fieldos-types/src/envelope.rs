//! Message envelope and payload kinds.
//!
//! An [`Envelope`] is created by the sender's messaging client at publish
//! time and is immutable afterwards.  Its [`Payload`] is a closed tagged
//! union: decoding rejects unknown `kind` tags instead of guessing.
//!
//! On the wire the envelope is JSON:
//!
//! ```json
//! {
//!   "id": "6f1c…",
//!   "topic": "sensors/tof/data",
//!   "timestamp": "2026-10-18T09:30:00.125Z",
//!   "sender": "hardware",
//!   "schema_version": 1,
//!   "payload": { "kind": "sensor_data", "data": { … } },
//!   "qos_hint": 1
//! }
//! ```
//!
//! `timestamp` is written as RFC 3339 and accepted either as RFC 3339 or as
//! integer epoch milliseconds.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::FieldError;
use crate::state::ServiceState;

/// Envelope schema version produced by this build.
pub const SCHEMA_VERSION: u32 = 1;

// ────────────────────────────────────────────────────────────────────────────
// QoS and priority
// ────────────────────────────────────────────────────────────────────────────

/// Delivery guarantee requested for a message.
///
/// Serialised as the integers `0`, `1` and `2`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum QoS {
    /// Best effort.
    AtMostOnce,
    /// At least once.
    AtLeastOnce,
    /// Exactly-once intent.
    ExactlyOnce,
}

impl TryFrom<u8> for QoS {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(QoS::AtMostOnce),
            1 => Ok(QoS::AtLeastOnce),
            2 => Ok(QoS::ExactlyOnce),
            other => Err(format!("invalid qos level {other}, expected 0, 1 or 2")),
        }
    }
}

impl From<QoS> for u8 {
    fn from(qos: QoS) -> Self {
        match qos {
            QoS::AtMostOnce => 0,
            QoS::AtLeastOnce => 1,
            QoS::ExactlyOnce => 2,
        }
    }
}

/// Priority class of a topic.
///
/// `Telemetry` and `Standard` traffic is *low priority* and may be dropped
/// when the outbound queue overflows.  `Command` and `Safety` traffic is
/// flushed first and is never dropped without raising an alert.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "snake_case")]
pub enum MessagePriority {
    /// High-rate sensor data.
    Telemetry,
    /// Status, events and everything else.
    #[default]
    Standard,
    /// Commands and their responses.
    Command,
    /// Safety alerts, emergency stop and global state broadcasts.
    Safety,
}

impl MessagePriority {
    /// All classes, lowest first.
    pub const ALL: [MessagePriority; 4] = [
        MessagePriority::Telemetry,
        MessagePriority::Standard,
        MessagePriority::Command,
        MessagePriority::Safety,
    ];

    /// `true` for classes that may be evicted from a full queue.
    pub fn is_droppable(self) -> bool {
        matches!(self, MessagePriority::Telemetry | MessagePriority::Standard)
    }

    /// Dense index, lowest priority first.
    pub fn index(self) -> usize {
        match self {
            MessagePriority::Telemetry => 0,
            MessagePriority::Standard => 1,
            MessagePriority::Command => 2,
            MessagePriority::Safety => 3,
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Envelope
// ────────────────────────────────────────────────────────────────────────────

/// The unit of exchange on the message bus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Unique message id (UUID v4).
    pub id: String,
    /// Topic the message was published on.
    pub topic: String,
    /// Creation time; non-decreasing per sender.
    #[serde(with = "wire_time")]
    pub timestamp: DateTime<Utc>,
    /// Service id of the publisher.
    pub sender: String,
    /// Envelope schema version.
    pub schema_version: u32,
    /// Kind-specific body.
    pub payload: Payload,
    /// Delivery guarantee the sender asked for.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub qos_hint: Option<QoS>,
}

impl Envelope {
    /// Build an envelope stamped with a fresh id and the current time.
    pub fn new(topic: impl Into<String>, sender: impl Into<String>, payload: Payload) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            topic: topic.into(),
            timestamp: Utc::now(),
            sender: sender.into(),
            schema_version: SCHEMA_VERSION,
            payload,
            qos_hint: None,
        }
    }

    /// Set the QoS hint.
    pub fn with_qos(mut self, qos: QoS) -> Self {
        self.qos_hint = Some(qos);
        self
    }

    /// Serialise to JSON bytes.
    pub fn to_json(&self) -> Result<Vec<u8>, FieldError> {
        serde_json::to_vec(self).map_err(|e| FieldError::Serialization(e.to_string()))
    }

    /// Decode and validate an envelope from JSON bytes.
    ///
    /// Malformed JSON, unknown payload kinds and envelopes that fail
    /// [`Envelope::validate`] all map to [`FieldError::SchemaValidation`].
    pub fn from_json(bytes: &[u8]) -> Result<Self, FieldError> {
        let envelope: Envelope = serde_json::from_slice(bytes)
            .map_err(|e| FieldError::SchemaValidation(e.to_string()))?;
        envelope.validate()?;
        Ok(envelope)
    }

    /// Structural checks that serde cannot express.
    pub fn validate(&self) -> Result<(), FieldError> {
        if self.id.is_empty() {
            return Err(FieldError::SchemaValidation("empty message id".into()));
        }
        if self.topic.is_empty() {
            return Err(FieldError::SchemaValidation("empty topic".into()));
        }
        if self.sender.is_empty() {
            return Err(FieldError::SchemaValidation("empty sender".into()));
        }
        if self.schema_version == 0 || self.schema_version > SCHEMA_VERSION {
            return Err(FieldError::SchemaValidation(format!(
                "unsupported schema_version {} (supported: 1..={SCHEMA_VERSION})",
                self.schema_version
            )));
        }
        Ok(())
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Payload kinds
// ────────────────────────────────────────────────────────────────────────────

/// The closed set of envelope kinds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "data", rename_all = "snake_case")]
pub enum Payload {
    SensorData(SensorData),
    Command(Command),
    Response(Response),
    Status(ServiceStatus),
    Event(SystemEvent),
    Alert(Alert),
}

impl Payload {
    /// Wire tag of this payload kind.
    pub fn kind(&self) -> &'static str {
        match self {
            Payload::SensorData(_) => "sensor_data",
            Payload::Command(_) => "command",
            Payload::Response(_) => "response",
            Payload::Status(_) => "status",
            Payload::Event(_) => "event",
            Payload::Alert(_) => "alert",
        }
    }
}

/// A sensor reading.  The shape of `values` belongs to the producer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensorData {
    pub sensor_id: String,
    pub sensor_type: String,
    #[serde(default)]
    pub values: Value,
}

/// An instruction addressed to a service.
#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct Command {
    /// Verb, e.g. `"restart_service"`.
    pub action: String,
    #[serde(default)]
    pub args: Value,
    /// Correlates the eventual [`Response`].
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    /// Topic the reply should be published on.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<String>,
    /// Operator credential for privileged actions such as a manual reset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth_token: Option<String>,
}

impl Command {
    pub fn new(action: impl Into<String>) -> Self {
        Self {
            action: action.into(),
            args: Value::Null,
            correlation_id: None,
            reply_to: None,
            auth_token: None,
        }
    }

    pub fn with_args(mut self, args: Value) -> Self {
        self.args = args;
        self
    }

    /// String argument `key`, if present.
    pub fn arg_str(&self, key: &str) -> Option<&str> {
        self.args.get(key).and_then(Value::as_str)
    }
}

impl fmt::Debug for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Command")
            .field("action", &self.action)
            .field("args", &self.args)
            .field("correlation_id", &self.correlation_id)
            .field("reply_to", &self.reply_to)
            .field(
                "auth_token",
                if self.auth_token.is_some() { &"<redacted>" } else { &"<not set>" },
            )
            .finish()
    }
}

/// Reply to a [`Command`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    pub success: bool,
    pub message: String,
    #[serde(default)]
    pub data: Value,
}

/// Resource usage reported alongside a heartbeat.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceUsage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu_percent: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_mb: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature_c: Option<f64>,
}

/// Service status, also used as the heartbeat body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceStatus {
    pub service_id: String,
    pub state: ServiceState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_type: Option<String>,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<ResourceUsage>,
}

impl ServiceStatus {
    pub fn new(service_id: impl Into<String>, state: ServiceState) -> Self {
        Self {
            service_id: service_id.into(),
            state,
            service_type: None,
            metadata: BTreeMap::new(),
            resources: None,
        }
    }
}

/// A notable occurrence, e.g. a state transition or a config change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemEvent {
    pub event_type: String,
    pub message: String,
    #[serde(default)]
    pub data: Value,
}

// ────────────────────────────────────────────────────────────────────────────
// Alerts
// ────────────────────────────────────────────────────────────────────────────

/// Alert severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Critical,
    Emergency,
}

/// What an alert is about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertKind {
    QueueOverflow,
    BrokerUnavailable,
    ConfigRejected,
    ServiceFailed,
    StartupFailed,
    CircuitOpen,
    ResourceThreshold,
    EmergencyStop,
    SafetyFault,
    #[serde(other)]
    Other,
}

impl AlertKind {
    pub fn as_str(self) -> &'static str {
        match self {
            AlertKind::QueueOverflow => "queue_overflow",
            AlertKind::BrokerUnavailable => "broker_unavailable",
            AlertKind::ConfigRejected => "config_rejected",
            AlertKind::ServiceFailed => "service_failed",
            AlertKind::StartupFailed => "startup_failed",
            AlertKind::CircuitOpen => "circuit_open",
            AlertKind::ResourceThreshold => "resource_threshold",
            AlertKind::EmergencyStop => "emergency_stop",
            AlertKind::SafetyFault => "safety_fault",
            AlertKind::Other => "other",
        }
    }
}

/// An operator-facing alert.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    pub alert_id: String,
    pub severity: Severity,
    pub kind: AlertKind,
    /// Component or service that raised the alert.
    pub source: String,
    pub message: String,
    #[serde(default)]
    pub data: Value,
}

impl Alert {
    pub fn new(
        severity: Severity,
        kind: AlertKind,
        source: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            alert_id: Uuid::new_v4().to_string(),
            severity,
            kind,
            source: source.into(),
            message: message.into(),
            data: Value::Null,
        }
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = data;
        self
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Timestamp wire format
// ────────────────────────────────────────────────────────────────────────────

mod wire_time {
    use chrono::{DateTime, SecondsFormat, Utc};
    use serde::{Deserialize, Deserializer, Serializer, de::Error};

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum WireTime {
        Millis(i64),
        Text(String),
    }

    pub fn serialize<S: Serializer>(ts: &DateTime<Utc>, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&ts.to_rfc3339_opts(SecondsFormat::AutoSi, true))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<DateTime<Utc>, D::Error> {
        match WireTime::deserialize(d)? {
            WireTime::Millis(ms) => DateTime::from_timestamp_millis(ms)
                .ok_or_else(|| D::Error::custom(format!("epoch millis {ms} out of range"))),
            WireTime::Text(text) => DateTime::parse_from_rfc3339(&text)
                .map(|ts| ts.with_timezone(&Utc))
                .map_err(D::Error::custom),
        }
    }
}
