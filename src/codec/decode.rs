//! MQTT v5.0 Packet Decoder

use bytes::Bytes;

use super::{read_binary, read_string, read_u16, read_variable_int, DEFAULT_MAX_PACKET_SIZE};
use crate::protocol::{
    ConnAck, Connect, DecodeError, Disconnect, Packet, Properties, PubAck, Publish, QoS,
    ReasonCode, SubAck, Subscribe, Subscription, SubscriptionOptions, UnsubAck, Unsubscribe,
    PROTOCOL_LEVEL_V5,
};

/// MQTT v5.0 packet decoder
pub struct Decoder {
    max_packet_size: usize,
}

impl Decoder {
    pub fn new() -> Self {
        Self {
            max_packet_size: DEFAULT_MAX_PACKET_SIZE,
        }
    }

    pub fn with_max_packet_size(mut self, size: usize) -> Self {
        self.max_packet_size = size;
        self
    }

    /// Decode one packet from the front of `buf`
    ///
    /// Returns `Ok(None)` when the buffer does not yet hold a complete packet,
    /// otherwise the packet and the number of bytes it occupied.
    pub fn decode(&self, buf: &[u8]) -> Result<Option<(Packet, usize)>, DecodeError> {
        if buf.len() < 2 {
            return Ok(None);
        }

        let first_byte = buf[0];
        let packet_type = first_byte >> 4;
        let flags = first_byte & 0x0F;

        let (remaining_length, len_bytes) = match read_variable_int(&buf[1..]) {
            Ok(r) => r,
            Err(DecodeError::InsufficientData) => return Ok(None),
            Err(e) => return Err(e),
        };

        if remaining_length as usize > self.max_packet_size {
            return Err(DecodeError::PacketTooLarge);
        }

        let total_len = 1 + len_bytes + remaining_length as usize;
        if buf.len() < total_len {
            return Ok(None);
        }

        let body = &buf[1 + len_bytes..total_len];

        let packet = match packet_type {
            1 => self.decode_connect(body)?,
            2 => self.decode_connack(flags, body)?,
            3 => self.decode_publish(flags, body)?,
            4 => self.decode_puback(flags, body)?,
            8 => self.decode_subscribe(flags, body)?,
            9 => self.decode_suback(flags, body)?,
            10 => self.decode_unsubscribe(flags, body)?,
            11 => self.decode_unsuback(flags, body)?,
            12 | 13 => {
                if flags != 0 {
                    return Err(DecodeError::InvalidFlags);
                }
                if packet_type == 12 {
                    Packet::PingReq
                } else {
                    Packet::PingResp
                }
            }
            14 => self.decode_disconnect(flags, body)?,
            _ => return Err(DecodeError::InvalidPacketType(packet_type)),
        };

        Ok(Some((packet, total_len)))
    }

    fn decode_connect(&self, body: &[u8]) -> Result<Packet, DecodeError> {
        let mut pos = 0;

        let (protocol_name, len) = read_string(body)?;
        pos += len;
        if protocol_name != "MQTT" {
            return Err(DecodeError::InvalidProtocol);
        }

        let level = *body.get(pos).ok_or(DecodeError::InsufficientData)?;
        pos += 1;
        if level != PROTOCOL_LEVEL_V5 {
            return Err(DecodeError::InvalidProtocol);
        }

        let connect_flags = *body.get(pos).ok_or(DecodeError::InsufficientData)?;
        pos += 1;
        if (connect_flags & 0x01) != 0 {
            return Err(DecodeError::InvalidFlags);
        }
        if (connect_flags & 0x04) != 0 {
            return Err(DecodeError::MalformedPacket("will messages are not supported"));
        }

        let keep_alive = read_u16(&body[pos..])?;
        pos += 2;

        let (properties, len) = Properties::decode(&body[pos..])?;
        pos += len;

        let (client_id, len) = read_string(&body[pos..])?;
        pos += len;

        let username = if (connect_flags & 0x80) != 0 {
            let (u, len) = read_string(&body[pos..])?;
            pos += len;
            Some(u.to_string())
        } else {
            None
        };

        let password = if (connect_flags & 0x40) != 0 {
            let (p, _) = read_binary(&body[pos..])?;
            Some(Bytes::copy_from_slice(p))
        } else {
            None
        };

        Ok(Packet::Connect(Box::new(Connect {
            client_id: client_id.to_string(),
            clean_start: (connect_flags & 0x02) != 0,
            keep_alive,
            username,
            password,
            properties,
        })))
    }

    fn decode_connack(&self, flags: u8, body: &[u8]) -> Result<Packet, DecodeError> {
        if flags != 0 {
            return Err(DecodeError::InvalidFlags);
        }
        if body.len() < 2 {
            return Err(DecodeError::InsufficientData);
        }
        if (body[0] & 0xFE) != 0 {
            return Err(DecodeError::InvalidFlags);
        }

        let reason_code =
            ReasonCode::from_u8(body[1]).ok_or(DecodeError::InvalidReasonCode(body[1]))?;
        let properties = if body.len() > 2 {
            Properties::decode(&body[2..])?.0
        } else {
            Properties::default()
        };

        Ok(Packet::ConnAck(ConnAck {
            session_present: (body[0] & 0x01) != 0,
            reason_code,
            properties,
        }))
    }

    fn decode_publish(&self, flags: u8, body: &[u8]) -> Result<Packet, DecodeError> {
        let dup = (flags & 0x08) != 0;
        let qos_bits = (flags >> 1) & 0x03;
        let retain = (flags & 0x01) != 0;
        let qos = QoS::from_u8(qos_bits).ok_or(DecodeError::InvalidQoS(qos_bits))?;

        if qos == QoS::AtMostOnce && dup {
            return Err(DecodeError::MalformedPacket("DUP must be 0 for QoS 0"));
        }

        let (topic, mut pos) = read_string(body)?;
        if topic.contains('+') || topic.contains('#') {
            return Err(DecodeError::MalformedPacket("topic contains wildcard"));
        }

        let packet_id = if qos != QoS::AtMostOnce {
            let id = read_u16(&body[pos..])?;
            if id == 0 {
                return Err(DecodeError::MalformedPacket("packet id cannot be 0"));
            }
            pos += 2;
            Some(id)
        } else {
            None
        };

        let (properties, len) = Properties::decode(&body[pos..])?;
        pos += len;

        Ok(Packet::Publish(Publish {
            dup,
            qos,
            retain,
            topic: topic.to_string(),
            packet_id,
            payload: Bytes::copy_from_slice(&body[pos..]),
            properties,
        }))
    }

    fn decode_puback(&self, flags: u8, body: &[u8]) -> Result<Packet, DecodeError> {
        if flags != 0 {
            return Err(DecodeError::InvalidFlags);
        }
        let packet_id = read_u16(body)?;
        let reason_code = match body.get(2) {
            Some(&b) => ReasonCode::from_u8(b).ok_or(DecodeError::InvalidReasonCode(b))?,
            None => ReasonCode::Success,
        };
        Ok(Packet::PubAck(PubAck {
            packet_id,
            reason_code,
        }))
    }

    fn decode_subscribe(&self, flags: u8, body: &[u8]) -> Result<Packet, DecodeError> {
        if flags != 0x02 {
            return Err(DecodeError::InvalidFlags);
        }
        let packet_id = read_u16(body)?;
        let mut pos = 2;
        let (properties, len) = Properties::decode(&body[pos..])?;
        pos += len;

        let mut subscriptions = Vec::new();
        while pos < body.len() {
            let (filter, len) = read_string(&body[pos..])?;
            pos += len;
            let byte = *body.get(pos).ok_or(DecodeError::InsufficientData)?;
            pos += 1;
            let options = SubscriptionOptions::from_byte(byte)
                .ok_or(DecodeError::MalformedPacket("invalid subscription options"))?;
            subscriptions.push(Subscription {
                filter: filter.to_string(),
                options,
            });
        }

        if subscriptions.is_empty() {
            return Err(DecodeError::MalformedPacket(
                "SUBSCRIBE must have at least one topic",
            ));
        }

        Ok(Packet::Subscribe(Subscribe {
            packet_id,
            subscriptions,
            properties,
        }))
    }

    fn decode_suback(&self, flags: u8, body: &[u8]) -> Result<Packet, DecodeError> {
        if flags != 0 {
            return Err(DecodeError::InvalidFlags);
        }
        let packet_id = read_u16(body)?;
        let (properties, len) = Properties::decode(&body[2..])?;
        let reason_codes = Self::decode_reason_codes(&body[2 + len..])?;

        Ok(Packet::SubAck(SubAck {
            packet_id,
            reason_codes,
            properties,
        }))
    }

    fn decode_unsubscribe(&self, flags: u8, body: &[u8]) -> Result<Packet, DecodeError> {
        if flags != 0x02 {
            return Err(DecodeError::InvalidFlags);
        }
        let packet_id = read_u16(body)?;
        let mut pos = 2;
        let (properties, len) = Properties::decode(&body[pos..])?;
        pos += len;

        let mut filters = Vec::new();
        while pos < body.len() {
            let (filter, len) = read_string(&body[pos..])?;
            pos += len;
            filters.push(filter.to_string());
        }

        if filters.is_empty() {
            return Err(DecodeError::MalformedPacket(
                "UNSUBSCRIBE must have at least one topic",
            ));
        }

        Ok(Packet::Unsubscribe(Unsubscribe {
            packet_id,
            filters,
            properties,
        }))
    }

    fn decode_unsuback(&self, flags: u8, body: &[u8]) -> Result<Packet, DecodeError> {
        if flags != 0 {
            return Err(DecodeError::InvalidFlags);
        }
        let packet_id = read_u16(body)?;
        let (properties, len) = Properties::decode(&body[2..])?;
        let reason_codes = Self::decode_reason_codes(&body[2 + len..])?;

        Ok(Packet::UnsubAck(UnsubAck {
            packet_id,
            reason_codes,
            properties,
        }))
    }

    fn decode_disconnect(&self, flags: u8, body: &[u8]) -> Result<Packet, DecodeError> {
        if flags != 0 {
            return Err(DecodeError::InvalidFlags);
        }
        if body.is_empty() {
            return Ok(Packet::Disconnect(Disconnect::default()));
        }

        let reason_code =
            ReasonCode::from_u8(body[0]).ok_or(DecodeError::InvalidReasonCode(body[0]))?;
        let properties = if body.len() > 1 {
            Properties::decode(&body[1..])?.0
        } else {
            Properties::default()
        };

        Ok(Packet::Disconnect(Disconnect {
            reason_code,
            properties,
        }))
    }

    fn decode_reason_codes(buf: &[u8]) -> Result<Vec<ReasonCode>, DecodeError> {
        buf.iter()
            .map(|&b| ReasonCode::from_u8(b).ok_or(DecodeError::InvalidReasonCode(b)))
            .collect()
    }
}

impl Default for Decoder {
    fn default() -> Self {
        Self::new()
    }
}
