//! MQTT v5.0 Properties
//!
//! Only the properties the client acts on are kept. Every other property
//! defined by v5.0 is still parsed by width so it can be skipped safely.

use bytes::{BufMut, Bytes, BytesMut};

use crate::codec::{
    read_binary, read_string, read_variable_int, variable_int_len, write_binary, write_string,
    write_variable_int,
};
use crate::protocol::{DecodeError, EncodeError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PropertyId {
    PayloadFormatIndicator = 0x01,
    MessageExpiryInterval = 0x02,
    ContentType = 0x03,
    ResponseTopic = 0x08,
    CorrelationData = 0x09,
    SubscriptionIdentifier = 0x0B,
    SessionExpiryInterval = 0x11,
    AssignedClientIdentifier = 0x12,
    ServerKeepAlive = 0x13,
    AuthenticationMethod = 0x15,
    AuthenticationData = 0x16,
    RequestProblemInformation = 0x17,
    WillDelayInterval = 0x18,
    RequestResponseInformation = 0x19,
    ResponseInformation = 0x1A,
    ServerReference = 0x1C,
    ReasonString = 0x1F,
    ReceiveMaximum = 0x21,
    TopicAliasMaximum = 0x22,
    TopicAlias = 0x23,
    MaximumQoS = 0x24,
    RetainAvailable = 0x25,
    UserProperty = 0x26,
    MaximumPacketSize = 0x27,
    WildcardSubscriptionAvailable = 0x28,
    SubscriptionIdentifierAvailable = 0x29,
    SharedSubscriptionAvailable = 0x2A,
}

/// Wire shape of a property value
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ValueKind {
    Byte,
    TwoByte,
    FourByte,
    VarInt,
    Utf8,
    Binary,
    Utf8Pair,
}

impl PropertyId {
    pub fn from_u8(v: u8) -> Option<Self> {
        use PropertyId::*;
        let id = match v {
            0x01 => PayloadFormatIndicator,
            0x02 => MessageExpiryInterval,
            0x03 => ContentType,
            0x08 => ResponseTopic,
            0x09 => CorrelationData,
            0x0B => SubscriptionIdentifier,
            0x11 => SessionExpiryInterval,
            0x12 => AssignedClientIdentifier,
            0x13 => ServerKeepAlive,
            0x15 => AuthenticationMethod,
            0x16 => AuthenticationData,
            0x17 => RequestProblemInformation,
            0x18 => WillDelayInterval,
            0x19 => RequestResponseInformation,
            0x1A => ResponseInformation,
            0x1C => ServerReference,
            0x1F => ReasonString,
            0x21 => ReceiveMaximum,
            0x22 => TopicAliasMaximum,
            0x23 => TopicAlias,
            0x24 => MaximumQoS,
            0x25 => RetainAvailable,
            0x26 => UserProperty,
            0x27 => MaximumPacketSize,
            0x28 => WildcardSubscriptionAvailable,
            0x29 => SubscriptionIdentifierAvailable,
            0x2A => SharedSubscriptionAvailable,
            _ => return None,
        };
        Some(id)
    }

    fn kind(self) -> ValueKind {
        use PropertyId::*;
        match self {
            PayloadFormatIndicator
            | RequestProblemInformation
            | RequestResponseInformation
            | MaximumQoS
            | RetainAvailable
            | WildcardSubscriptionAvailable
            | SubscriptionIdentifierAvailable
            | SharedSubscriptionAvailable => ValueKind::Byte,
            ServerKeepAlive | ReceiveMaximum | TopicAliasMaximum | TopicAlias => {
                ValueKind::TwoByte
            }
            MessageExpiryInterval | SessionExpiryInterval | WillDelayInterval
            | MaximumPacketSize => ValueKind::FourByte,
            SubscriptionIdentifier => ValueKind::VarInt,
            ContentType | ResponseTopic | AssignedClientIdentifier | AuthenticationMethod
            | ResponseInformation | ServerReference | ReasonString => ValueKind::Utf8,
            CorrelationData | AuthenticationData => ValueKind::Binary,
            UserProperty => ValueKind::Utf8Pair,
        }
    }
}

/// Properties attached to a packet
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Properties {
    pub payload_format_indicator: Option<u8>,
    pub content_type: Option<String>,
    pub correlation_data: Option<Bytes>,
    pub session_expiry_interval: Option<u32>,
    pub assigned_client_identifier: Option<String>,
    pub server_keep_alive: Option<u16>,
    pub reason_string: Option<String>,
    pub receive_maximum: Option<u16>,
    pub maximum_packet_size: Option<u32>,
    pub user_properties: Vec<(String, String)>,
}

impl Properties {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.encoded_size() == 0
    }

    /// Look up the first user property with the given key
    pub fn user_property(&self, key: &str) -> Option<&str> {
        self.user_properties
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Encoded size of the properties, excluding the length prefix
    pub fn encoded_size(&self) -> usize {
        let mut size = 0;

        if self.payload_format_indicator.is_some() {
            size += 2;
        }
        if let Some(ref s) = self.content_type {
            size += 1 + 2 + s.len();
        }
        if let Some(ref d) = self.correlation_data {
            size += 1 + 2 + d.len();
        }
        if self.session_expiry_interval.is_some() {
            size += 5;
        }
        if let Some(ref s) = self.assigned_client_identifier {
            size += 1 + 2 + s.len();
        }
        if self.server_keep_alive.is_some() {
            size += 3;
        }
        if let Some(ref s) = self.reason_string {
            size += 1 + 2 + s.len();
        }
        if self.receive_maximum.is_some() {
            size += 3;
        }
        if self.maximum_packet_size.is_some() {
            size += 5;
        }
        for (k, v) in &self.user_properties {
            size += 1 + 2 + k.len() + 2 + v.len();
        }

        size
    }

    /// Decode properties from buffer, returning bytes consumed including the
    /// length prefix
    pub fn decode(buf: &[u8]) -> Result<(Self, usize), DecodeError> {
        let (prop_len, len_bytes) = read_variable_int(buf)?;
        let end = len_bytes + prop_len as usize;
        if buf.len() < end {
            return Err(DecodeError::InsufficientData);
        }

        let mut props = Properties::new();
        let body = &buf[..end];
        let mut pos = len_bytes;

        while pos < end {
            let raw_id = body[pos];
            pos += 1;
            let id = PropertyId::from_u8(raw_id).ok_or(DecodeError::InvalidPropertyId(raw_id))?;

            match id.kind() {
                ValueKind::Byte => {
                    let v = *body.get(pos).ok_or(DecodeError::InsufficientData)?;
                    pos += 1;
                    if id == PropertyId::PayloadFormatIndicator {
                        props.payload_format_indicator = Some(v);
                    }
                }
                ValueKind::TwoByte => {
                    let bytes = body.get(pos..pos + 2).ok_or(DecodeError::InsufficientData)?;
                    let v = u16::from_be_bytes([bytes[0], bytes[1]]);
                    pos += 2;
                    match id {
                        PropertyId::ServerKeepAlive => props.server_keep_alive = Some(v),
                        PropertyId::ReceiveMaximum => props.receive_maximum = Some(v),
                        _ => {}
                    }
                }
                ValueKind::FourByte => {
                    let bytes = body.get(pos..pos + 4).ok_or(DecodeError::InsufficientData)?;
                    let v = u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
                    pos += 4;
                    match id {
                        PropertyId::SessionExpiryInterval => {
                            props.session_expiry_interval = Some(v)
                        }
                        PropertyId::MaximumPacketSize => props.maximum_packet_size = Some(v),
                        _ => {}
                    }
                }
                ValueKind::VarInt => {
                    let (_, len) = read_variable_int(&body[pos..])?;
                    pos += len;
                }
                ValueKind::Utf8 => {
                    let (s, len) = read_string(&body[pos..])?;
                    pos += len;
                    match id {
                        PropertyId::ContentType => props.content_type = Some(s.to_string()),
                        PropertyId::AssignedClientIdentifier => {
                            props.assigned_client_identifier = Some(s.to_string())
                        }
                        PropertyId::ReasonString => props.reason_string = Some(s.to_string()),
                        _ => {}
                    }
                }
                ValueKind::Binary => {
                    let (d, len) = read_binary(&body[pos..])?;
                    pos += len;
                    if id == PropertyId::CorrelationData {
                        props.correlation_data = Some(Bytes::copy_from_slice(d));
                    }
                }
                ValueKind::Utf8Pair => {
                    let (k, klen) = read_string(&body[pos..])?;
                    pos += klen;
                    let (v, vlen) = read_string(&body[pos..])?;
                    pos += vlen;
                    props.user_properties.push((k.to_string(), v.to_string()));
                }
            }
        }

        if pos != end {
            return Err(DecodeError::MalformedPacket("property length mismatch"));
        }

        Ok((props, end))
    }

    /// Encode properties with their length prefix
    pub fn encode(&self, buf: &mut BytesMut) -> Result<(), EncodeError> {
        write_variable_int(buf, self.encoded_size() as u32)?;

        if let Some(v) = self.payload_format_indicator {
            buf.put_u8(PropertyId::PayloadFormatIndicator as u8);
            buf.put_u8(v);
        }
        if let Some(ref s) = self.content_type {
            buf.put_u8(PropertyId::ContentType as u8);
            write_string(buf, s)?;
        }
        if let Some(ref d) = self.correlation_data {
            buf.put_u8(PropertyId::CorrelationData as u8);
            write_binary(buf, d)?;
        }
        if let Some(v) = self.session_expiry_interval {
            buf.put_u8(PropertyId::SessionExpiryInterval as u8);
            buf.put_u32(v);
        }
        if let Some(ref s) = self.assigned_client_identifier {
            buf.put_u8(PropertyId::AssignedClientIdentifier as u8);
            write_string(buf, s)?;
        }
        if let Some(v) = self.server_keep_alive {
            buf.put_u8(PropertyId::ServerKeepAlive as u8);
            buf.put_u16(v);
        }
        if let Some(ref s) = self.reason_string {
            buf.put_u8(PropertyId::ReasonString as u8);
            write_string(buf, s)?;
        }
        if let Some(v) = self.receive_maximum {
            buf.put_u8(PropertyId::ReceiveMaximum as u8);
            buf.put_u16(v);
        }
        if let Some(v) = self.maximum_packet_size {
            buf.put_u8(PropertyId::MaximumPacketSize as u8);
            buf.put_u32(v);
        }
        for (k, v) in &self.user_properties {
            buf.put_u8(PropertyId::UserProperty as u8);
            write_string(buf, k)?;
            write_string(buf, v)?;
        }

        Ok(())
    }

    /// Total bytes including the variable-length prefix
    pub fn wire_len(&self) -> usize {
        let size = self.encoded_size();
        variable_int_len(size as u32) + size
    }
}
