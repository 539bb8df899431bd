//! MQTT v3.1.1 CONNACK return codes

use std::fmt;

/// Connect return code carried in CONNACK
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(u8)]
pub enum ConnectReturnCode {
    /// Connection accepted
    #[default]
    Accepted = 0x00,
    /// The server does not support the requested protocol level
    UnacceptableProtocolVersion = 0x01,
    /// The client identifier is not allowed by the server
    IdentifierRejected = 0x02,
    /// The MQTT service is unavailable
    ServerUnavailable = 0x03,
    /// Malformed user name or password
    BadUserNameOrPassword = 0x04,
    /// The client is not authorized to connect
    NotAuthorized = 0x05,
}

impl ConnectReturnCode {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0x00 => Some(Self::Accepted),
            0x01 => Some(Self::UnacceptableProtocolVersion),
            0x02 => Some(Self::IdentifierRejected),
            0x03 => Some(Self::ServerUnavailable),
            0x04 => Some(Self::BadUserNameOrPassword),
            0x05 => Some(Self::NotAuthorized),
            _ => None,
        }
    }

    /// Whether the refusal points at the credentials we presented
    pub fn is_auth_failure(self) -> bool {
        matches!(self, Self::BadUserNameOrPassword | Self::NotAuthorized)
    }
}

impl fmt::Display for ConnectReturnCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Self::Accepted => "connection accepted",
            Self::UnacceptableProtocolVersion => "unacceptable protocol version",
            Self::IdentifierRejected => "identifier rejected",
            Self::ServerUnavailable => "server unavailable",
            Self::BadUserNameOrPassword => "bad user name or password",
            Self::NotAuthorized => "not authorized",
        };
        f.write_str(text)
    }
}
