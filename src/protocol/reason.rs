//! MQTT v3.1.1 CONNACK return codes

use std::fmt;

/// CONNACK return code
///
/// The broker only ever emits the first three; the rest exist so that
/// decoded CONNACKs from other brokers can be represented.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(u8)]
pub enum ConnectReturnCode {
    /// Connection accepted
    #[default]
    Accepted = 0x00,
    /// The server does not support the requested protocol level
    UnacceptableProtocolLevel = 0x01,
    /// Client identifier is empty or already in use
    IdentifierRejected = 0x02,
    /// Server unavailable
    ServerUnavailable = 0x03,
    /// Bad user name or password
    BadUserNameOrPassword = 0x04,
    /// Not authorized
    NotAuthorized = 0x05,
}

impl ConnectReturnCode {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0x00 => Some(ConnectReturnCode::Accepted),
            0x01 => Some(ConnectReturnCode::UnacceptableProtocolLevel),
            0x02 => Some(ConnectReturnCode::IdentifierRejected),
            0x03 => Some(ConnectReturnCode::ServerUnavailable),
            0x04 => Some(ConnectReturnCode::BadUserNameOrPassword),
            0x05 => Some(ConnectReturnCode::NotAuthorized),
            _ => None,
        }
    }

    #[inline]
    pub fn is_accepted(self) -> bool {
        self == ConnectReturnCode::Accepted
    }
}

impl fmt::Display for ConnectReturnCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectReturnCode::Accepted => write!(f, "Connection accepted"),
            ConnectReturnCode::UnacceptableProtocolLevel => {
                write!(f, "Unacceptable protocol level")
            }
            ConnectReturnCode::IdentifierRejected => write!(f, "Identifier rejected"),
            ConnectReturnCode::ServerUnavailable => write!(f, "Server unavailable"),
            ConnectReturnCode::BadUserNameOrPassword => write!(f, "Bad user name or password"),
            ConnectReturnCode::NotAuthorized => write!(f, "Not authorized"),
        }
    }
}
