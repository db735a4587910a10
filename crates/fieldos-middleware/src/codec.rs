//! Wire frames exchanged between clients and the broker.
//!
//! Every frame is one JSON text message.  Envelopes travel inside a
//! [`Body`], which records whether the sender compressed them:
//!
//! ```json
//! { "op": "publish", "topic": "vision/frame", "qos": 0, "retain": false,
//!   "body": { "encoding": "gzip", "data": "H4sIAAAA…" } }
//! ```
//!
//! Receivers always look at `encoding`, so a sender's compression choice
//! never needs to be negotiated.

use std::io::{Read, Write};

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use fieldos_types::{Envelope, FieldError, QoS};
use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use serde::{Deserialize, Serialize};

/// Default size above which envelopes are compressed.
pub const DEFAULT_COMPRESSION_THRESHOLD: usize = 1024;

/// An encoded envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "encoding", content = "data", rename_all = "snake_case")]
pub enum Body {
    /// Envelope JSON as-is.
    Json(String),
    /// Gzip-compressed envelope JSON, base64 encoded.
    Gzip(String),
}

impl Body {
    /// Encode `envelope`, compressing when the JSON exceeds `threshold` bytes.
    pub fn encode(envelope: &Envelope, threshold: usize) -> Result<Self, FieldError> {
        let json = serde_json::to_string(envelope)?;
        if json.len() <= threshold {
            return Ok(Body::Json(json));
        }
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(json.as_bytes())?;
        let compressed = encoder.finish()?;
        Ok(Body::Gzip(STANDARD.encode(compressed)))
    }

    /// Decode and validate the envelope carried by this body.
    pub fn decode(&self) -> Result<Envelope, FieldError> {
        match self {
            Body::Json(json) => Envelope::from_json(json.as_bytes()),
            Body::Gzip(data) => {
                let compressed = STANDARD
                    .decode(data)
                    .map_err(|e| FieldError::SchemaValidation(format!("bad base64 body: {e}")))?;
                let mut json = Vec::new();
                GzDecoder::new(compressed.as_slice())
                    .read_to_end(&mut json)
                    .map_err(|e| FieldError::SchemaValidation(format!("bad gzip body: {e}")))?;
                Envelope::from_json(&json)
            }
        }
    }

    pub fn is_compressed(&self) -> bool {
        matches!(self, Body::Gzip(_))
    }

    /// Encoded size in bytes.
    pub fn len(&self) -> usize {
        match self {
            Body::Json(s) | Body::Gzip(s) => s.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Frames sent by a client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum ClientFrame {
    /// First frame of every session.
    Connect {
        client_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        token: Option<String>,
    },
    Subscribe { filter: String },
    Unsubscribe { filter: String },
    Publish {
        topic: String,
        qos: QoS,
        #[serde(default)]
        retain: bool,
        body: Body,
    },
    Ping,
}

/// Frames sent by the broker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum BrokerFrame {
    /// Accepts a `connect`; `session` identifies this attachment.
    ConnAck { session: u64 },
    Deliver {
        topic: String,
        #[serde(default)]
        retained: bool,
        body: Body,
    },
    Pong,
    Error { message: String },
}

impl ClientFrame {
    pub fn to_text(&self) -> Result<String, FieldError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_text(text: &str) -> Result<Self, FieldError> {
        serde_json::from_str(text).map_err(|e| FieldError::SchemaValidation(e.to_string()))
    }
}

impl BrokerFrame {
    pub fn to_text(&self) -> Result<String, FieldError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_text(text: &str) -> Result<Self, FieldError> {
        serde_json::from_str(text).map_err(|e| FieldError::SchemaValidation(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fieldos_types::{Payload, SensorData};
    use serde_json::json;

    fn envelope(bytes: usize) -> Envelope {
        Envelope::new(
            "vision/frame",
            "vision",
            Payload::SensorData(SensorData {
                sensor_id: "cam0".into(),
                sensor_type: "camera".into(),
                values: json!({ "blob": "x".repeat(bytes) }),
            }),
        )
    }

    #[test]
    fn small_envelopes_stay_plain() {
        let env = envelope(10);
        let body = Body::encode(&env, DEFAULT_COMPRESSION_THRESHOLD).unwrap();
        assert!(!body.is_compressed());
        assert_eq!(body.decode().unwrap(), env);
    }

    #[test]
    fn large_envelopes_are_compressed_and_restored() {
        let env = envelope(8 * 1024);
        let body = Body::encode(&env, DEFAULT_COMPRESSION_THRESHOLD).unwrap();
        assert!(body.is_compressed());
        assert!(body.len() < 8 * 1024);
        assert_eq!(body.decode().unwrap(), env);
    }

    #[test]
    fn receiver_honours_flag_regardless_of_threshold() {
        // Sender compressed everything; receiver uses a different threshold.
        let env = envelope(4);
        let body = Body::encode(&env, 0).unwrap();
        assert!(body.is_compressed());
        let text = serde_json::to_string(&body).unwrap();
        assert!(text.contains("\"encoding\":\"gzip\""));
        let back: Body = serde_json::from_str(&text).unwrap();
        assert_eq!(back.decode().unwrap(), env);
    }

    #[test]
    fn corrupt_gzip_is_a_schema_error() {
        let body = Body::Gzip(STANDARD.encode(b"definitely not gzip"));
        assert!(matches!(body.decode(), Err(FieldError::SchemaValidation(_))));
    }

    #[test]
    fn frame_wire_shape() {
        let frame = ClientFrame::Publish {
            topic: "commands/vision".into(),
            qos: QoS::ExactlyOnce,
            retain: false,
            body: Body::Json("{}".into()),
        };
        let text = frame.to_text().unwrap();
        assert!(text.contains("\"op\":\"publish\""));
        assert!(text.contains("\"qos\":2"));
        assert_eq!(ClientFrame::from_text(&text).unwrap(), frame);
        assert!(BrokerFrame::from_text("{\"op\":\"teleport\"}").is_err());
    }
}
