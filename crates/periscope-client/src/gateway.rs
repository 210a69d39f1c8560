//! Robot telemetry consumer.
//!
//! The robot-side forwarder relays bus messages as self-describing UDP
//! datagrams: a binary header (timestamp, compressed flag, NUL-terminated
//! topic and type) followed by a JSON payload. Schema messages teach the
//! registry the shape of each type; data messages are then parsed into
//! [`ParsedMessage`] values with dotted-path field access.

use std::collections::HashMap;
use std::net::UdpSocket;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use serde_json::Value;
use tracing::{debug, error, info, warn};

use periscope_core::{Error, Result};

/// Maximum UDP datagram.
const BUFFER_SIZE: usize = 65_535;

const RECV_TIMEOUT: Duration = Duration::from_secs(1);

/// One decoded datagram header plus its raw payload.
#[derive(Debug, Clone, PartialEq)]
pub struct GatewayMessage {
    pub timestamp: f64,
    pub compressed: bool,
    pub topic: String,
    pub msg_type: String,
    pub payload: Vec<u8>,
}

/// Split a datagram into `[f64 LE timestamp][u8 compressed][topic\0]
/// [type\0][payload]`.
pub fn parse_datagram(buffer: &[u8]) -> Result<GatewayMessage> {
    // Header floor: timestamp, flag, two empty NUL-terminated strings.
    if buffer.len() < 8 + 1 + 2 {
        return Err(Error::protocol(format!(
            "datagram too short: {} bytes",
            buffer.len()
        )));
    }

    let timestamp = f64::from_le_bytes(
        buffer[..8]
            .try_into()
            .map_err(|_| Error::protocol("bad timestamp field"))?,
    );
    let compressed = buffer[8] != 0;
    let mut pos = 9;

    let topic_end = buffer[pos..]
        .iter()
        .position(|b| *b == 0)
        .ok_or_else(|| Error::protocol("unterminated topic"))?
        + pos;
    let topic = String::from_utf8_lossy(&buffer[pos..topic_end]).into_owned();
    pos = topic_end + 1;

    let type_end = buffer[pos..]
        .iter()
        .position(|b| *b == 0)
        .ok_or_else(|| Error::protocol("unterminated type"))?
        + pos;
    let msg_type = String::from_utf8_lossy(&buffer[pos..type_end]).into_owned();
    pos = type_end + 1;

    Ok(GatewayMessage {
        timestamp,
        compressed,
        topic,
        msg_type,
        payload: buffer[pos..].to_vec(),
    })
}

/// Schema definition for a message type, learned from the wire.
#[derive(Debug, Clone)]
pub struct MessageSchema {
    pub msg_type: String,
    pub definition: Value,
}

/// A parsed data message with typed field access.
///
/// Field access uses dotted paths (`"clock.sec"`). Single-element arrays
/// are unwrapped at every step, including the final one; this is policy,
/// not inference, so a schema change from scalar to length-1 array is
/// invisible to callers.
#[derive(Debug, Clone)]
pub struct ParsedMessage {
    msg_type: String,
    topic: String,
    schema: Value,
    data: Value,
}

impl ParsedMessage {
    pub fn msg_type(&self) -> &str {
        &self.msg_type
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn schema(&self) -> &Value {
        &self.schema
    }

    pub fn data(&self) -> &Value {
        &self.data
    }

    /// Typed lookup along a dotted path.
    pub fn get<T: serde::de::DeserializeOwned>(&self, field: &str) -> Result<T> {
        let mut cursor = &self.data;
        for part in field.split('.') {
            cursor = cursor
                .get(part)
                .ok_or_else(|| Error::field(format!("field '{part}' not found in '{field}'")))?;
            // Unwrap single-element arrays while walking.
            if let Some(items) = cursor.as_array() {
                if items.len() == 1 {
                    cursor = &items[0];
                }
            }
        }
        if let Some(items) = cursor.as_array() {
            if items.is_empty() {
                return Err(Error::field(format!("field '{field}' is an empty array")));
            }
            if items.len() == 1 {
                cursor = &items[0];
            }
        }
        serde_json::from_value(cursor.clone())
            .map_err(|e| Error::field(format!("type mismatch for field '{field}': {e}")))
    }
}

/// Registry of learned message schemas. Single writer (the listener),
/// any number of readers.
#[derive(Debug, Default)]
pub struct SchemaRegistry {
    schemas: Mutex<HashMap<String, MessageSchema>>,
}

impl SchemaRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// If the payload is a schema definition (carries `fields`,
    /// `namespace`, and `name`), register it and return true.
    pub fn register_if_schema(&self, msg_type: &str, payload: &[u8]) -> Result<bool> {
        let value: Value =
            serde_json::from_slice(payload).map_err(|e| Error::serialization(e.to_string()))?;
        let is_schema =
            value.get("fields").is_some() && value.get("namespace").is_some() && value.get("name").is_some();
        if !is_schema {
            return Ok(false);
        }

        info!("registered schema for type {msg_type}");
        let mut schemas = match self.schemas.lock() {
            Ok(s) => s,
            Err(poisoned) => poisoned.into_inner(),
        };
        schemas.insert(
            msg_type.to_string(),
            MessageSchema {
                msg_type: msg_type.to_string(),
                definition: value,
            },
        );
        Ok(true)
    }

    pub fn has_schema(&self, msg_type: &str) -> bool {
        match self.schemas.lock() {
            Ok(s) => s.contains_key(msg_type),
            Err(poisoned) => poisoned.into_inner().contains_key(msg_type),
        }
    }

    /// Parse a data payload of a known type into a [`ParsedMessage`].
    /// Top-level single-element arrays are unwrapped eagerly.
    pub fn build_parsed_message(
        &self,
        msg_type: &str,
        topic: &str,
        payload: &[u8],
    ) -> Result<ParsedMessage> {
        let schema = {
            let schemas = match self.schemas.lock() {
                Ok(s) => s,
                Err(poisoned) => poisoned.into_inner(),
            };
            schemas
                .get(msg_type)
                .map(|s| s.definition.clone())
                .ok_or_else(|| Error::protocol(format!("no schema known for type {msg_type}")))?
        };

        let mut data: Value =
            serde_json::from_slice(payload).map_err(|e| Error::serialization(e.to_string()))?;

        if let Some(fields) = schema.get("fields").and_then(Value::as_array) {
            for field in fields {
                if let Some(name) = field.get("name").and_then(Value::as_str) {
                    if data.get(name).is_none() {
                        warn!("payload of type {msg_type} is missing field {name}");
                    }
                }
            }
        }

        if let Some(map) = data.as_object_mut() {
            for (_key, value) in map.iter_mut() {
                let unwrapped = match value.as_array() {
                    Some(items) if items.len() == 1 => Some(items[0].clone()),
                    _ => None,
                };
                if let Some(inner) = unwrapped {
                    *value = inner;
                }
            }
        }

        Ok(ParsedMessage {
            msg_type: msg_type.to_string(),
            topic: topic.to_string(),
            schema,
            data,
        })
    }
}

/// UDP listener consuming the telemetry stream until dropped.
pub struct GatewayConsumer {
    registry: Arc<SchemaRegistry>,
    running: Arc<AtomicBool>,
    messages_seen: Arc<AtomicU64>,
    last_message_us: Arc<AtomicU64>,
    port: u16,
    listener: Option<JoinHandle<()>>,
}

impl GatewayConsumer {
    /// Bind the gateway port and start the listener thread. A bind
    /// failure is fatal for this subsystem only; the caller decides how
    /// loudly to report it.
    pub fn bind(port: u16) -> Result<Self> {
        let socket = UdpSocket::bind(("0.0.0.0", port))?;
        socket.set_read_timeout(Some(RECV_TIMEOUT))?;
        let port = socket.local_addr()?.port();
        info!("listening for telemetry on port {port}");

        let registry = Arc::new(SchemaRegistry::new());
        let running = Arc::new(AtomicBool::new(true));
        let messages_seen = Arc::new(AtomicU64::new(0));
        let last_message_us = Arc::new(AtomicU64::new(0));

        let thread = ListenerShared {
            registry: Arc::clone(&registry),
            running: Arc::clone(&running),
            messages_seen: Arc::clone(&messages_seen),
            last_message_us: Arc::clone(&last_message_us),
        };
        let listener = std::thread::Builder::new()
            .name("telemetry-gateway".into())
            .spawn(move || listen_loop(socket, thread))
            .map_err(Error::Io)?;

        Ok(Self {
            registry,
            running,
            messages_seen,
            last_message_us,
            port,
            listener: Some(listener),
        })
    }

    pub fn registry(&self) -> Arc<SchemaRegistry> {
        Arc::clone(&self.registry)
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn messages_seen(&self) -> u64 {
        self.messages_seen.load(Ordering::Relaxed)
    }

    /// Microseconds since the last datagram, `None` before the first one.
    pub fn idle_us(&self) -> Option<u64> {
        let last = self.last_message_us.load(Ordering::Relaxed);
        if last == 0 {
            return None;
        }
        Some(periscope_core::local_now_us().saturating_sub(last))
    }
}

impl Drop for GatewayConsumer {
    fn drop(&mut self) {
        self.running.store(false, Ordering::Relaxed);
        if let Some(listener) = self.listener.take() {
            let _ = listener.join();
        }
    }
}

struct ListenerShared {
    registry: Arc<SchemaRegistry>,
    running: Arc<AtomicBool>,
    messages_seen: Arc<AtomicU64>,
    last_message_us: Arc<AtomicU64>,
}

fn listen_loop(socket: UdpSocket, shared: ListenerShared) {
    let ListenerShared {
        registry,
        running,
        messages_seen,
        last_message_us,
    } = shared;
    let mut buffer = vec![0u8; BUFFER_SIZE];
    let mut warned_compressed = false;

    while running.load(Ordering::Relaxed) {
        let received = match socket.recv_from(&mut buffer) {
            Ok((len, _peer)) => len,
            Err(_) => continue,
        };
        messages_seen.fetch_add(1, Ordering::Relaxed);
        last_message_us.store(periscope_core::local_now_us(), Ordering::Relaxed);

        let message = match parse_datagram(&buffer[..received]) {
            Ok(message) => message,
            Err(err) => {
                error!("failed to parse telemetry header: {err}");
                continue;
            }
        };

        if message.compressed {
            if !warned_compressed {
                warn!("compressed telemetry is not supported; dropping such messages");
                warned_compressed = true;
            }
            continue;
        }

        debug!(
            "telemetry: {} ({}) at {:.3}",
            message.topic, message.msg_type, message.timestamp
        );

        match registry.register_if_schema(&message.msg_type, &message.payload) {
            Ok(true) => continue,
            Ok(false) => {}
            Err(err) => {
                error!("failed to parse telemetry payload: {err}");
                continue;
            }
        }
        if !registry.has_schema(&message.msg_type) {
            continue;
        }
        if let Err(err) =
            registry.build_parsed_message(&message.msg_type, &message.topic, &message.payload)
        {
            error!("failed to parse telemetry message: {err}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn datagram(timestamp: f64, compressed: u8, topic: &str, msg_type: &str, payload: &str) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&timestamp.to_le_bytes());
        out.push(compressed);
        out.extend_from_slice(topic.as_bytes());
        out.push(0);
        out.extend_from_slice(msg_type.as_bytes());
        out.push(0);
        out.extend_from_slice(payload.as_bytes());
        out
    }

    const BATTERY_SCHEMA: &str = r#"{
        "name": "BatteryState",
        "namespace": "sensor_msgs",
        "fields": [{"name": "voltage", "type": "float32"}]
    }"#;

    #[test]
    fn datagram_framing_round_trips() {
        let wire = datagram(123.456, 0, "/robot/battery", "sensor_msgs/BatteryState", "{}");
        let message = parse_datagram(&wire).unwrap();
        assert!((message.timestamp - 123.456).abs() < 1e-9);
        assert!(!message.compressed);
        assert_eq!(message.topic, "/robot/battery");
        assert_eq!(message.msg_type, "sensor_msgs/BatteryState");
        assert_eq!(message.payload, b"{}");
    }

    #[test]
    fn truncated_datagrams_are_rejected() {
        assert!(parse_datagram(&[0u8; 5]).is_err());
        // Missing the type terminator.
        let mut wire = Vec::new();
        wire.extend_from_slice(&1.0f64.to_le_bytes());
        wire.push(0);
        wire.extend_from_slice(b"topic\0type-without-nul");
        assert!(parse_datagram(&wire).is_err());
    }

    #[test]
    fn schema_payloads_are_recognized_and_registered() {
        let registry = SchemaRegistry::new();
        assert!(!registry.has_schema("sensor_msgs/BatteryState"));
        assert!(registry
            .register_if_schema("sensor_msgs/BatteryState", BATTERY_SCHEMA.as_bytes())
            .unwrap());
        assert!(registry.has_schema("sensor_msgs/BatteryState"));

        // A data payload is not a schema.
        assert!(!registry
            .register_if_schema("sensor_msgs/BatteryState", br#"{"voltage": [12.6]}"#)
            .unwrap());
    }

    #[test]
    fn data_before_schema_is_not_parseable() {
        let registry = SchemaRegistry::new();
        assert!(registry
            .build_parsed_message("sensor_msgs/BatteryState", "/robot/battery", b"{}")
            .is_err());
    }

    #[test]
    fn single_element_arrays_unwrap_on_access() {
        let registry = SchemaRegistry::new();
        registry
            .register_if_schema("sensor_msgs/BatteryState", BATTERY_SCHEMA.as_bytes())
            .unwrap();
        let parsed = registry
            .build_parsed_message(
                "sensor_msgs/BatteryState",
                "/robot/battery",
                br#"{"voltage": [12.6]}"#,
            )
            .unwrap();

        assert_eq!(parsed.topic(), "/robot/battery");
        let voltage: f32 = parsed.get("voltage").unwrap();
        assert!((voltage - 12.6).abs() < 1e-6);
    }

    #[test]
    fn dotted_paths_descend_through_nested_arrays() {
        let registry = SchemaRegistry::new();
        registry
            .register_if_schema(
                "rosgraph_msgs/Clock",
                br#"{"name": "Clock", "namespace": "rosgraph_msgs", "fields": [{"name": "clock"}]}"#,
            )
            .unwrap();
        let parsed = registry
            .build_parsed_message(
                "rosgraph_msgs/Clock",
                "/robot/clock",
                br#"{"clock": [{"sec": [1700000000], "nanosec": 250}]}"#,
            )
            .unwrap();

        let sec: i64 = parsed.get("clock.sec").unwrap();
        assert_eq!(sec, 1_700_000_000);
        let nanosec: i64 = parsed.get("clock.nanosec").unwrap();
        assert_eq!(nanosec, 250);
    }

    #[test]
    fn missing_fields_and_type_mismatches_are_descriptive() {
        let registry = SchemaRegistry::new();
        registry
            .register_if_schema("sensor_msgs/BatteryState", BATTERY_SCHEMA.as_bytes())
            .unwrap();
        let parsed = registry
            .build_parsed_message(
                "sensor_msgs/BatteryState",
                "/robot/battery",
                br#"{"voltage": "not-a-number"}"#,
            )
            .unwrap();

        let missing = parsed.get::<f32>("charge").unwrap_err();
        assert!(missing.to_string().contains("charge"));
        let mismatch = parsed.get::<f32>("voltage").unwrap_err();
        assert!(mismatch.to_string().contains("voltage"));
    }

    #[test]
    fn listener_learns_schema_then_parses_data() {
        let consumer = GatewayConsumer::bind(0).expect("bind gateway");
        let registry = consumer.registry();

        let sender = UdpSocket::bind("127.0.0.1:0").unwrap();
        let target = ("127.0.0.1", consumer.port());

        sender
            .send_to(
                &datagram(1.0, 0, "/schemas", "sensor_msgs/BatteryState", BATTERY_SCHEMA),
                target,
            )
            .unwrap();
        sender
            .send_to(
                &datagram(
                    2.0,
                    0,
                    "/robot/battery",
                    "sensor_msgs/BatteryState",
                    r#"{"voltage": [12.6]}"#,
                ),
                target,
            )
            .unwrap();

        // The listener thread needs a moment to drain both datagrams.
        let deadline = std::time::Instant::now() + Duration::from_secs(3);
        while !registry.has_schema("sensor_msgs/BatteryState")
            && std::time::Instant::now() < deadline
        {
            std::thread::sleep(Duration::from_millis(20));
        }
        assert!(registry.has_schema("sensor_msgs/BatteryState"));

        let parsed = registry
            .build_parsed_message(
                "sensor_msgs/BatteryState",
                "/robot/battery",
                br#"{"voltage": [12.6]}"#,
            )
            .unwrap();
        assert_eq!(parsed.get::<f32>("voltage").unwrap(), 12.6);
    }
}
