//! Messages the device sends upstream
//!
//! Inbound messages stay untyped JSON until the dispatcher normalizes them,
//! see [`crate::job::InboundJob`].

use serde::Serialize;

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutboundMessage {
    DeviceHello(DeviceHello),
    PrintStatus(PrintStatus),
    Pong,
}

/// First message on every new connection
///
/// The device secret travels in the connection headers only.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct DeviceHello {
    pub device_code: String,
    pub firmware_version: String,
    pub local_ip: String,
    pub printer_status: PrinterStatus,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct PrinterStatus {
    pub connected: bool,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct PrintStatus {
    pub message_id: String,
    pub status: PrintState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub printed_at: Option<String>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PrintState {
    Printing,
    Printed,
    Failed,
}

impl OutboundMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::DeviceHello(_) => "device_hello",
            Self::PrintStatus(_) => "print_status",
            Self::Pong => "pong",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn hello_wire_format() {
        let hello = OutboundMessage::DeviceHello(DeviceHello {
            device_code: "ABCD1234".to_string(),
            firmware_version: "1.0.0".to_string(),
            local_ip: "10.0.0.23".to_string(),
            printer_status: PrinterStatus { connected: true },
        });

        assert_eq!(
            serde_json::to_value(&hello).expect("should serialize"),
            json!({
                "type": "device_hello",
                "device_code": "ABCD1234",
                "firmware_version": "1.0.0",
                "local_ip": "10.0.0.23",
                "printer_status": {"connected": true}
            })
        );
    }

    #[test]
    fn print_status_omits_absent_fields() {
        let status = OutboundMessage::PrintStatus(PrintStatus {
            message_id: "42".to_string(),
            status: PrintState::Printing,
            error: None,
            printed_at: None,
        });

        assert_eq!(
            serde_json::to_value(&status).expect("should serialize"),
            json!({"type": "print_status", "message_id": "42", "status": "printing"})
        );
        assert_eq!(
            serde_json::to_value(OutboundMessage::Pong).expect("should serialize"),
            json!({"type": "pong"})
        );
    }
}
