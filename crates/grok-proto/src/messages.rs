//! Protocol message types

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Tunnel protocol kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TunnelType {
    Http,
    Https,
    Tcp,
    Tls,
}

impl TunnelType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TunnelType::Http => "http",
            TunnelType::Https => "https",
            TunnelType::Tcp => "tcp",
            TunnelType::Tls => "tls",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "http" => Some(TunnelType::Http),
            "https" => Some(TunnelType::Https),
            "tcp" => Some(TunnelType::Tcp),
            "tls" => Some(TunnelType::Tls),
            _ => None,
        }
    }

    /// HTTP-like tunnels are routed by subdomain; TCP tunnels by port.
    pub fn is_http_like(&self) -> bool {
        !matches!(self, TunnelType::Tcp)
    }
}

/// Tunnel lifecycle status
///
/// `Offline` is only reachable for persistent tunnels; everything else
/// transitions to `Disconnected` when the channel closes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TunnelStatus {
    Active,
    Offline,
    Disconnected,
}

impl TunnelStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TunnelStatus::Active => "active",
            TunnelStatus::Offline => "offline",
            TunnelStatus::Disconnected => "disconnected",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "active" => Some(TunnelStatus::Active),
            "offline" => Some(TunnelStatus::Offline),
            "disconnected" => Some(TunnelStatus::Disconnected),
            _ => None,
        }
    }
}

/// What the client asks to expose
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum EndpointRequest {
    /// HTTP tunnel routed by subdomain
    Http { subdomain: String },
    /// HTTPS tunnel routed by subdomain
    Https { subdomain: String },
    /// TLS passthrough routed by SNI subdomain
    Tls { subdomain: String },
    /// Raw TCP tunnel; port 0 or None lets the server allocate one
    Tcp { remote_port: Option<u16> },
}

impl EndpointRequest {
    pub fn tunnel_type(&self) -> TunnelType {
        match self {
            EndpointRequest::Http { .. } => TunnelType::Http,
            EndpointRequest::Https { .. } => TunnelType::Https,
            EndpointRequest::Tls { .. } => TunnelType::Tls,
            EndpointRequest::Tcp { .. } => TunnelType::Tcp,
        }
    }

    pub fn subdomain(&self) -> Option<&str> {
        match self {
            EndpointRequest::Http { subdomain }
            | EndpointRequest::Https { subdomain }
            | EndpointRequest::Tls { subdomain } => Some(subdomain),
            EndpointRequest::Tcp { .. } => None,
        }
    }
}

/// Per-registration options carried alongside the endpoint request
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct RegisterOptions {
    /// Address of the local service the client forwards to ("localhost:3000")
    pub local_addr: String,
    /// Stable name for reconnecting to the same tunnel row
    pub saved_name: Option<String>,
    /// Persistent tunnels keep their row and port reservation across disconnects
    pub persistent: bool,
}

/// Main control-channel message enum
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ControlMessage {
    // Registration handshake
    Register {
        client_id: String,
        auth_token: String,
        endpoint: EndpointRequest,
        options: RegisterOptions,
    },
    RegisterAck {
        tunnel_id: Uuid,
        public_url: String,
        remote_port: Option<u16>,
    },
    RegisterError {
        code: String,
        message: String,
    },

    // Liveness
    Heartbeat {
        timestamp: u64,
    },

    // HTTP proxying (server -> client request, client -> server response)
    HttpRequest {
        request_id: Uuid,
        method: String,
        uri: String,
        headers: Vec<(String, String)>,
    },
    HttpRequestBody {
        request_id: Uuid,
        #[serde(with = "serde_bytes")]
        data: Vec<u8>,
        is_final: bool,
    },
    HttpResponse {
        request_id: Uuid,
        status: u16,
        headers: Vec<(String, String)>,
    },
    HttpResponseBody {
        request_id: Uuid,
        #[serde(with = "serde_bytes")]
        data: Vec<u8>,
        is_final: bool,
    },
    /// Public request went away (client disconnect, timeout); drop the slot
    Cancel {
        request_id: Uuid,
    },

    // Raw TCP bridging
    TcpOpen {
        stream_id: u32,
    },
    TcpData {
        stream_id: u32,
        #[serde(with = "serde_bytes")]
        data: Vec<u8>,
    },
    TcpClose {
        stream_id: u32,
    },

    // Teardown
    Close {
        reason: String,
    },
}

impl ControlMessage {
    /// Short name for logging
    pub fn kind(&self) -> &'static str {
        match self {
            ControlMessage::Register { .. } => "register",
            ControlMessage::RegisterAck { .. } => "register_ack",
            ControlMessage::RegisterError { .. } => "register_error",
            ControlMessage::Heartbeat { .. } => "heartbeat",
            ControlMessage::HttpRequest { .. } => "http_request",
            ControlMessage::HttpRequestBody { .. } => "http_request_body",
            ControlMessage::HttpResponse { .. } => "http_response",
            ControlMessage::HttpResponseBody { .. } => "http_response_body",
            ControlMessage::Cancel { .. } => "cancel",
            ControlMessage::TcpOpen { .. } => "tcp_open",
            ControlMessage::TcpData { .. } => "tcp_data",
            ControlMessage::TcpClose { .. } => "tcp_close",
            ControlMessage::Close { .. } => "close",
        }
    }
}

// Compact byte-array encoding for payload fields
mod serde_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(data: &[u8], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_bytes(data)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        Vec::<u8>::deserialize(deserializer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_roundtrip() {
        let msg = ControlMessage::Heartbeat { timestamp: 12345 };
        let serialized = bincode::serialize(&msg).unwrap();
        let deserialized: ControlMessage = bincode::deserialize(&serialized).unwrap();
        assert_eq!(msg, deserialized);
    }

    #[test]
    fn test_register_roundtrip() {
        let msg = ControlMessage::Register {
            client_id: "client-1".to_string(),
            auth_token: "tok_abc".to_string(),
            endpoint: EndpointRequest::Http {
                subdomain: "api".to_string(),
            },
            options: RegisterOptions {
                local_addr: "localhost:3000".to_string(),
                saved_name: Some("api".to_string()),
                persistent: true,
            },
        };
        let bytes = bincode::serialize(&msg).unwrap();
        let back: ControlMessage = bincode::deserialize(&bytes).unwrap();
        assert_eq!(msg, back);
    }

    #[test]
    fn test_body_frame_roundtrip() {
        let request_id = Uuid::new_v4();
        let msg = ControlMessage::HttpResponseBody {
            request_id,
            data: vec![0, 1, 2, 3, 255],
            is_final: true,
        };

        let bytes = bincode::serialize(&msg).unwrap();
        let back: ControlMessage = bincode::deserialize(&bytes).unwrap();

        if let ControlMessage::HttpResponseBody {
            request_id: rid,
            data,
            is_final,
        } = back
        {
            assert_eq!(rid, request_id);
            assert_eq!(data, vec![0, 1, 2, 3, 255]);
            assert!(is_final);
        } else {
            panic!("Expected HttpResponseBody");
        }
    }

    #[test]
    fn test_tunnel_type_strings() {
        for ty in [
            TunnelType::Http,
            TunnelType::Https,
            TunnelType::Tcp,
            TunnelType::Tls,
        ] {
            assert_eq!(TunnelType::parse(ty.as_str()), Some(ty));
        }
        assert_eq!(TunnelType::parse("smtp"), None);
        assert!(TunnelType::Https.is_http_like());
        assert!(!TunnelType::Tcp.is_http_like());
    }

    #[test]
    fn test_status_strings() {
        assert_eq!(TunnelStatus::parse("active"), Some(TunnelStatus::Active));
        assert_eq!(TunnelStatus::parse("offline"), Some(TunnelStatus::Offline));
        assert_eq!(
            TunnelStatus::parse("disconnected"),
            Some(TunnelStatus::Disconnected)
        );
        assert_eq!(TunnelStatus::parse("zombie"), None);
    }

    #[test]
    fn test_endpoint_accessors() {
        let ep = EndpointRequest::Tcp { remote_port: None };
        assert_eq!(ep.tunnel_type(), TunnelType::Tcp);
        assert_eq!(ep.subdomain(), None);

        let ep = EndpointRequest::Https {
            subdomain: "dash".to_string(),
        };
        assert_eq!(ep.tunnel_type(), TunnelType::Https);
        assert_eq!(ep.subdomain(), Some("dash"));
    }
}
