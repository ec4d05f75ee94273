//! MQTT v5.0 protocol types used by the remote backend
//!
//! Only the packets a client exchanges with a broker are modelled; there is
//! no v3.1.1 support and no QoS 2 flow.

mod error;
mod packet;
mod properties;
mod reason;

pub use error::{DecodeError, EncodeError};
pub use packet::*;
pub use properties::{Properties, PropertyId};
pub use reason::ReasonCode;

/// Protocol level byte sent in CONNECT for MQTT v5.0
pub const PROTOCOL_LEVEL_V5: u8 = 5;

/// Quality of Service levels
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(u8)]
pub enum QoS {
    /// At most once delivery
    #[default]
    AtMostOnce = 0,
    /// At least once delivery
    AtLeastOnce = 1,
    /// Exactly once delivery
    ExactlyOnce = 2,
}

impl QoS {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(QoS::AtMostOnce),
            1 => Some(QoS::AtLeastOnce),
            2 => Some(QoS::ExactlyOnce),
            _ => None,
        }
    }
}

/// Subscription options byte (MQTT v5.0)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SubscriptionOptions {
    pub qos: QoS,
    pub no_local: bool,
}

impl SubscriptionOptions {
    pub fn from_byte(byte: u8) -> Option<Self> {
        // Retain-as-published and retain handling are accepted but not modelled
        if (byte & 0xC0) != 0 {
            return None;
        }
        Some(Self {
            qos: QoS::from_u8(byte & 0x03)?,
            no_local: (byte & 0x04) != 0,
        })
    }

    pub fn to_byte(self) -> u8 {
        (self.qos as u8) | ((self.no_local as u8) << 2)
    }
}
