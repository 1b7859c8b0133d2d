use crate::device::{Device, DeviceLog};
use crate::mac::MacAddr;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Frames a subscribed operator client may send over `/ws`.
///
/// `device_id` is a MAC, or `"all"` for the log subscriptions.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum ClientFrame {
    SubscribeLogs {
        device_id: String,
    },
    UnsubscribeLogs {
        device_id: String,
    },
    SubscribeConsole {
        device_id: String,
    },
    UnsubscribeConsole {
        device_id: String,
    },
    SendCommand {
        device_id: String,
        command: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        payload: Option<serde_json::Value>,
    },
    Ping,
}

/// Frames the hub pushes to subscribed operator clients.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum ServerEvent {
    DeviceUpdate {
        device: Device,
    },
    DevicesList {
        devices: Vec<Device>,
    },
    UpdateProgress {
        device_id: MacAddr,
        progress: u8,
        #[serde(skip_serializing_if = "Option::is_none")]
        bytes_received: Option<u64>,
        #[serde(skip_serializing_if = "Option::is_none")]
        total_bytes: Option<u64>,
    },
    DeviceLog {
        device_id: MacAddr,
        entry: DeviceLog,
    },
    ConsoleOutput {
        device_id: MacAddr,
        line: String,
        timestamp: DateTime<Utc>,
    },
    CommandAck {
        device_id: MacAddr,
        command_id: i64,
        status: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        response: Option<String>,
    },
    AtRiskAlert {
        device: Device,
    },
    Pong,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_frame_wire_format() {
        let frame: ClientFrame =
            serde_json::from_str(r#"{"type":"subscribe-logs","deviceId":"all"}"#).unwrap();
        assert_eq!(
            frame,
            ClientFrame::SubscribeLogs {
                device_id: "all".into()
            }
        );

        let ping: ClientFrame = serde_json::from_str(r#"{"type":"ping"}"#).unwrap();
        assert_eq!(ping, ClientFrame::Ping);
    }

    #[test]
    fn test_server_event_discriminator() {
        let event = ServerEvent::UpdateProgress {
            device_id: MacAddr::parse("AABBCCDDEEFF").unwrap(),
            progress: 42,
            bytes_received: Some(1024),
            total_bytes: None,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "update-progress");
        assert_eq!(json["deviceId"], "AABBCCDDEEFF");
        assert_eq!(json["progress"], 42);
        assert!(json.get("totalBytes").is_none());
    }
}
