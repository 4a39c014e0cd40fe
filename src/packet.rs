//! MQTT 3.1.1 packet types and codec.
//!
//! `decode_packet` works on a raw byte buffer and distinguishes three
//! outcomes: a complete packet (with the number of bytes consumed), "need
//! more bytes", and a protocol violation. `encode_packet` produces bit-exact
//! MQTT 3.1.1 frames for every control packet type, including the
//! client-side ones, so tests can drive a broker with the same codec.

use bytes::Bytes;

use crate::error::ProtocolError;

/// Largest value representable by the 4-byte remaining-length encoding.
pub const MAX_REMAINING_LENGTH: usize = 268_435_455;

type Result<T> = std::result::Result<T, ProtocolError>;

/// MQTT control packet types (high nibble of the fixed header).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PacketType {
    Connect = 1,
    Connack = 2,
    Publish = 3,
    Puback = 4,
    Pubrec = 5,
    Pubrel = 6,
    Pubcomp = 7,
    Subscribe = 8,
    Suback = 9,
    Unsubscribe = 10,
    Unsuback = 11,
    Pingreq = 12,
    Pingresp = 13,
    Disconnect = 14,
}

impl TryFrom<u8> for PacketType {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            1 => Ok(PacketType::Connect),
            2 => Ok(PacketType::Connack),
            3 => Ok(PacketType::Publish),
            4 => Ok(PacketType::Puback),
            5 => Ok(PacketType::Pubrec),
            6 => Ok(PacketType::Pubrel),
            7 => Ok(PacketType::Pubcomp),
            8 => Ok(PacketType::Subscribe),
            9 => Ok(PacketType::Suback),
            10 => Ok(PacketType::Unsubscribe),
            11 => Ok(PacketType::Unsuback),
            12 => Ok(PacketType::Pingreq),
            13 => Ok(PacketType::Pingresp),
            14 => Ok(PacketType::Disconnect),
            _ => Err(ProtocolError::InvalidPacketType(value)),
        }
    }
}

/// Quality of Service levels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
#[repr(u8)]
#[allow(clippy::enum_variant_names)] // MQTT spec names
pub enum QoS {
    #[default]
    AtMostOnce = 0,
    AtLeastOnce = 1,
    ExactlyOnce = 2,
}

impl TryFrom<u8> for QoS {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(QoS::AtMostOnce),
            1 => Ok(QoS::AtLeastOnce),
            2 => Ok(QoS::ExactlyOnce),
            _ => Err(ProtocolError::MalformedPacket(format!(
                "Invalid QoS: {}",
                value
            ))),
        }
    }
}

/// CONNACK return codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnackCode {
    Accepted = 0,
    UnacceptableProtocolVersion = 1,
    IdentifierRejected = 2,
    ServerUnavailable = 3,
    BadUsernamePassword = 4,
    NotAuthorized = 5,
}

impl TryFrom<u8> for ConnackCode {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(ConnackCode::Accepted),
            1 => Ok(ConnackCode::UnacceptableProtocolVersion),
            2 => Ok(ConnackCode::IdentifierRejected),
            3 => Ok(ConnackCode::ServerUnavailable),
            4 => Ok(ConnackCode::BadUsernamePassword),
            5 => Ok(ConnackCode::NotAuthorized),
            _ => Err(ProtocolError::MalformedPacket(format!(
                "Invalid CONNACK return code: {}",
                value
            ))),
        }
    }
}

/// SUBACK failure return code.
pub const SUBACK_FAILURE: u8 = 0x80;

/// MQTT packets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    Connect(Connect),
    Connack(Connack),
    Publish(Publish),
    Puback { packet_id: u16 },
    Pubrec { packet_id: u16 },
    Pubrel { packet_id: u16 },
    Pubcomp { packet_id: u16 },
    Subscribe(Subscribe),
    Suback(Suback),
    Unsubscribe(Unsubscribe),
    Unsuback { packet_id: u16 },
    Pingreq,
    Pingresp,
    Disconnect,
}

/// CONNECT packet data.
///
/// Protocol name and level are validated during decode (`MQTT`, level 4)
/// and never stored.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Connect {
    pub clean_session: bool,
    pub keep_alive: u16,
    pub client_id: String,
    pub will: Option<Will>,
    pub username: Option<String>,
    pub password: Option<Vec<u8>>,
}

/// Will message carried in CONNECT.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Will {
    pub topic: String,
    pub payload: Bytes,
    pub qos: QoS,
    pub retain: bool,
}

/// CONNACK packet data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Connack {
    pub session_present: bool,
    pub code: ConnackCode,
}

/// PUBLISH packet data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Publish {
    pub dup: bool,
    pub qos: QoS,
    pub retain: bool,
    pub topic: String,
    pub packet_id: Option<u16>,
    pub payload: Bytes,
}

/// SUBSCRIBE packet data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscribe {
    pub packet_id: u16,
    pub filters: Vec<(String, QoS)>,
}

/// SUBACK packet data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Suback {
    pub packet_id: u16,
    pub return_codes: Vec<u8>,
}

/// UNSUBSCRIBE packet data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Unsubscribe {
    pub packet_id: u16,
    pub filters: Vec<String>,
}

/// Cursor over a packet's variable header + payload bytes.
struct Decoder<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Decoder<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn read_u8(&mut self) -> Result<u8> {
        if self.pos >= self.buf.len() {
            return Err(ProtocolError::IncompletePacket { needed: 1, have: 0 });
        }
        let b = self.buf[self.pos];
        self.pos += 1;
        Ok(b)
    }

    fn read_u16(&mut self) -> Result<u16> {
        if self.remaining() < 2 {
            return Err(ProtocolError::IncompletePacket {
                needed: 2,
                have: self.remaining(),
            });
        }
        let val = u16::from_be_bytes([self.buf[self.pos], self.buf[self.pos + 1]]);
        self.pos += 2;
        Ok(val)
    }

    fn read_bytes(&mut self, len: usize) -> Result<&'a [u8]> {
        if self.remaining() < len {
            return Err(ProtocolError::IncompletePacket {
                needed: len,
                have: self.remaining(),
            });
        }
        let bytes = &self.buf[self.pos..self.pos + len];
        self.pos += len;
        Ok(bytes)
    }

    fn read_string(&mut self) -> Result<String> {
        let len = self.read_u16()? as usize;
        let bytes = self.read_bytes(len)?;
        // MQTT-1.5.3-2: UTF-8 string MUST NOT contain U+0000
        if bytes.contains(&0u8) {
            return Err(ProtocolError::MalformedPacket(
                "UTF-8 string must not contain null character".into(),
            ));
        }
        String::from_utf8(bytes.to_vec()).map_err(|_| ProtocolError::InvalidUtf8)
    }

    fn read_binary(&mut self) -> Result<Vec<u8>> {
        let len = self.read_u16()? as usize;
        Ok(self.read_bytes(len)?.to_vec())
    }
}

/// Decode the remaining-length field (variable length encoding, 1-4 bytes).
/// Returns `(length, bytes_consumed)` or `None` if more bytes are needed.
pub fn decode_remaining_length(buf: &[u8]) -> Result<Option<(usize, usize)>> {
    let mut multiplier = 1usize;
    let mut value = 0usize;

    for (i, &byte) in buf.iter().enumerate() {
        value += ((byte & 0x7F) as usize) * multiplier;

        if multiplier > 128 * 128 * 128 {
            return Err(ProtocolError::InvalidRemainingLength);
        }

        if (byte & 0x80) == 0 {
            return Ok(Some((value, i + 1)));
        }

        multiplier *= 128;
    }

    Ok(None)
}

/// Encode a remaining-length value into `buf`. Returns bytes written.
pub fn encode_remaining_length(mut len: usize, buf: &mut [u8]) -> usize {
    let mut i = 0;
    loop {
        let mut byte = (len % 128) as u8;
        len /= 128;
        if len > 0 {
            byte |= 0x80;
        }
        buf[i] = byte;
        i += 1;
        if len == 0 {
            break;
        }
    }
    i
}

/// Try to decode one complete packet from the front of `buf`.
///
/// Returns `Ok(Some((packet, consumed)))` on success, `Ok(None)` when the
/// buffer holds only a partial frame, or `Err` on a protocol violation.
/// A frame whose declared size exceeds `max_packet_size` is rejected
/// before its body is buffered.
pub fn decode_packet(buf: &[u8], max_packet_size: usize) -> Result<Option<(Packet, usize)>> {
    if buf.is_empty() {
        return Ok(None);
    }

    let fixed_header = buf[0];
    let packet_type_raw = fixed_header >> 4;
    let flags = fixed_header & 0x0F;

    let Some((remaining_len, len_bytes)) = decode_remaining_length(&buf[1..])? else {
        return Ok(None);
    };

    let header_len = 1 + len_bytes;
    let total_len = header_len + remaining_len;

    if total_len > max_packet_size {
        return Err(ProtocolError::PacketTooLarge {
            size: total_len,
            max: max_packet_size,
        });
    }

    if buf.len() < total_len {
        return Ok(None);
    }

    let packet_type = PacketType::try_from(packet_type_raw)?;
    let body = &buf[header_len..total_len];

    // MQTT-3.6.1-1, MQTT-3.8.1-1, MQTT-3.10.1-1: these carry fixed flags 0010
    match packet_type {
        PacketType::Subscribe | PacketType::Unsubscribe | PacketType::Pubrel => {
            if flags != 0x02 {
                return Err(ProtocolError::MalformedPacket(format!(
                    "{:?} fixed header flags must be 0x02, got {:#04x}",
                    packet_type, flags
                )));
            }
        }
        _ => {}
    }

    let packet = match packet_type {
        PacketType::Connect => decode_connect(body)?,
        PacketType::Connack => decode_connack(body)?,
        PacketType::Publish => decode_publish(flags, body)?,
        PacketType::Puback => Packet::Puback {
            packet_id: decode_packet_id(body)?,
        },
        PacketType::Pubrec => Packet::Pubrec {
            packet_id: decode_packet_id(body)?,
        },
        PacketType::Pubrel => Packet::Pubrel {
            packet_id: decode_packet_id(body)?,
        },
        PacketType::Pubcomp => Packet::Pubcomp {
            packet_id: decode_packet_id(body)?,
        },
        PacketType::Subscribe => decode_subscribe(body)?,
        PacketType::Suback => decode_suback(body)?,
        PacketType::Unsubscribe => decode_unsubscribe(body)?,
        PacketType::Unsuback => Packet::Unsuback {
            packet_id: decode_packet_id(body)?,
        },
        PacketType::Pingreq => decode_empty(body, Packet::Pingreq)?,
        PacketType::Pingresp => decode_empty(body, Packet::Pingresp)?,
        PacketType::Disconnect => decode_empty(body, Packet::Disconnect)?,
    };

    Ok(Some((packet, total_len)))
}

fn decode_packet_id(body: &[u8]) -> Result<u16> {
    let mut dec = Decoder::new(body);
    dec.read_u16()
}

fn decode_empty(body: &[u8], packet: Packet) -> Result<Packet> {
    if !body.is_empty() {
        return Err(ProtocolError::MalformedPacket(
            "Unexpected payload in zero-length packet".into(),
        ));
    }
    Ok(packet)
}

fn decode_connect(body: &[u8]) -> Result<Packet> {
    let mut dec = Decoder::new(body);

    let protocol_name = dec.read_string()?;
    if protocol_name != "MQTT" {
        return Err(ProtocolError::InvalidProtocolName(protocol_name));
    }

    let protocol_level = dec.read_u8()?;
    if protocol_level != 4 {
        return Err(ProtocolError::UnsupportedProtocolLevel(protocol_level));
    }

    let flags = dec.read_u8()?;
    let clean_session = (flags & 0x02) != 0;
    let will_flag = (flags & 0x04) != 0;
    let will_qos = QoS::try_from((flags >> 3) & 0x03)?;
    let will_retain = (flags & 0x20) != 0;
    let password_flag = (flags & 0x40) != 0;
    let username_flag = (flags & 0x80) != 0;

    // MQTT-3.1.2-3: reserved bit must be 0
    if (flags & 0x01) != 0 {
        return Err(ProtocolError::InvalidConnectFlags(flags));
    }

    // MQTT-3.1.2-11/13: Will QoS must be 0 when Will Flag is 0
    if !will_flag && will_qos != QoS::AtMostOnce {
        return Err(ProtocolError::MalformedPacket(
            "Will QoS must be 0 when Will Flag is 0".into(),
        ));
    }

    // MQTT-3.1.2-15: Will Retain must be 0 when Will Flag is 0
    if !will_flag && will_retain {
        return Err(ProtocolError::MalformedPacket(
            "Will Retain must be 0 when Will Flag is 0".into(),
        ));
    }

    // MQTT-3.1.2-22: Password Flag requires Username Flag
    if !username_flag && password_flag {
        return Err(ProtocolError::MalformedPacket(
            "Password Flag must be 0 when Username Flag is 0".into(),
        ));
    }

    let keep_alive = dec.read_u16()?;
    let client_id = dec.read_string()?;

    let will = if will_flag {
        let topic = dec.read_string()?;
        check_topic_name(&topic)?;
        let payload = dec.read_binary()?;
        Some(Will {
            topic,
            payload: Bytes::from(payload),
            qos: will_qos,
            retain: will_retain,
        })
    } else {
        None
    };

    let username = if username_flag {
        Some(dec.read_string()?)
    } else {
        None
    };

    let password = if password_flag {
        Some(dec.read_binary()?)
    } else {
        None
    };

    Ok(Packet::Connect(Connect {
        clean_session,
        keep_alive,
        client_id,
        will,
        username,
        password,
    }))
}

fn decode_connack(body: &[u8]) -> Result<Packet> {
    let mut dec = Decoder::new(body);
    let ack_flags = dec.read_u8()?;
    // MQTT-3.2.2.1: bits 7-1 of the acknowledge flags are reserved
    if ack_flags & 0xFE != 0 {
        return Err(ProtocolError::MalformedPacket(
            "Reserved CONNACK flags must be 0".into(),
        ));
    }
    let code = ConnackCode::try_from(dec.read_u8()?)?;
    Ok(Packet::Connack(Connack {
        session_present: ack_flags & 0x01 != 0,
        code,
    }))
}

fn decode_publish(flags: u8, body: &[u8]) -> Result<Packet> {
    let dup = (flags & 0x08) != 0;
    let qos = QoS::try_from((flags >> 1) & 0x03)?;
    let retain = (flags & 0x01) != 0;

    // MQTT-3.3.1-2: DUP must be 0 for QoS 0 messages
    if dup && qos == QoS::AtMostOnce {
        return Err(ProtocolError::MalformedPacket(
            "DUP must be 0 for QoS 0 PUBLISH".into(),
        ));
    }

    let mut dec = Decoder::new(body);

    let topic = dec.read_string()?;
    check_topic_name(&topic)?;

    let packet_id = if qos != QoS::AtMostOnce {
        Some(dec.read_u16()?)
    } else {
        None
    };

    let payload = dec.read_bytes(dec.remaining())?;

    Ok(Packet::Publish(Publish {
        dup,
        qos,
        retain,
        topic,
        packet_id,
        payload: Bytes::copy_from_slice(payload),
    }))
}

fn decode_subscribe(body: &[u8]) -> Result<Packet> {
    let mut dec = Decoder::new(body);
    let packet_id = dec.read_u16()?;

    let mut filters = Vec::new();
    while dec.remaining() > 0 {
        let filter = dec.read_string()?;

        // MQTT-4.7.3-1: topic filters are at least one character long
        if filter.is_empty() {
            return Err(ProtocolError::MalformedPacket(
                "Topic filter must be at least 1 character".into(),
            ));
        }

        let qos = QoS::try_from(dec.read_u8()?)?;
        filters.push((filter, qos));
    }

    // MQTT-3.8.3-3: at least one filter/QoS pair is required
    if filters.is_empty() {
        return Err(ProtocolError::MalformedPacket(
            "SUBSCRIBE with no topic filters".into(),
        ));
    }

    Ok(Packet::Subscribe(Subscribe { packet_id, filters }))
}

fn decode_suback(body: &[u8]) -> Result<Packet> {
    let mut dec = Decoder::new(body);
    let packet_id = dec.read_u16()?;

    let mut return_codes = Vec::with_capacity(dec.remaining());
    while dec.remaining() > 0 {
        let code = dec.read_u8()?;
        if code > 2 && code != SUBACK_FAILURE {
            return Err(ProtocolError::MalformedPacket(format!(
                "Invalid SUBACK return code: {:#04x}",
                code
            )));
        }
        return_codes.push(code);
    }

    if return_codes.is_empty() {
        return Err(ProtocolError::MalformedPacket(
            "SUBACK with no return codes".into(),
        ));
    }

    Ok(Packet::Suback(Suback {
        packet_id,
        return_codes,
    }))
}

fn decode_unsubscribe(body: &[u8]) -> Result<Packet> {
    let mut dec = Decoder::new(body);
    let packet_id = dec.read_u16()?;

    let mut filters = Vec::new();
    while dec.remaining() > 0 {
        let filter = dec.read_string()?;
        if filter.is_empty() {
            return Err(ProtocolError::MalformedPacket(
                "Topic filter must be at least 1 character".into(),
            ));
        }
        filters.push(filter);
    }

    // MQTT-3.10.3-2: at least one filter is required
    if filters.is_empty() {
        return Err(ProtocolError::MalformedPacket(
            "UNSUBSCRIBE with no topic filters".into(),
        ));
    }

    Ok(Packet::Unsubscribe(Unsubscribe { packet_id, filters }))
}

/// Encode a packet onto the end of `buf`.
pub fn encode_packet(packet: &Packet, buf: &mut Vec<u8>) {
    match packet {
        Packet::Connect(connect) => encode_connect(connect, buf),
        Packet::Connack(connack) => encode_connack(connack, buf),
        Packet::Publish(publish) => encode_publish(publish, buf),
        Packet::Puback { packet_id } => encode_simple_ack(PacketType::Puback, 0, *packet_id, buf),
        Packet::Pubrec { packet_id } => encode_simple_ack(PacketType::Pubrec, 0, *packet_id, buf),
        // PUBREL carries fixed header flags 0010
        Packet::Pubrel { packet_id } => encode_simple_ack(PacketType::Pubrel, 0x02, *packet_id, buf),
        Packet::Pubcomp { packet_id } => encode_simple_ack(PacketType::Pubcomp, 0, *packet_id, buf),
        Packet::Subscribe(subscribe) => encode_subscribe(subscribe, buf),
        Packet::Suback(suback) => encode_suback(suback, buf),
        Packet::Unsubscribe(unsub) => encode_unsubscribe(unsub, buf),
        Packet::Unsuback { packet_id } => {
            encode_simple_ack(PacketType::Unsuback, 0, *packet_id, buf)
        }
        Packet::Pingreq => encode_empty(PacketType::Pingreq, buf),
        Packet::Pingresp => encode_empty(PacketType::Pingresp, buf),
        Packet::Disconnect => encode_empty(PacketType::Disconnect, buf),
    }
}

fn write_remaining_length(len: usize, buf: &mut Vec<u8>) {
    let mut len_buf = [0u8; 4];
    let n = encode_remaining_length(len, &mut len_buf);
    buf.extend_from_slice(&len_buf[..n]);
}

fn write_string(s: &str, buf: &mut Vec<u8>) {
    buf.extend_from_slice(&(s.len() as u16).to_be_bytes());
    buf.extend_from_slice(s.as_bytes());
}

fn write_binary(b: &[u8], buf: &mut Vec<u8>) {
    buf.extend_from_slice(&(b.len() as u16).to_be_bytes());
    buf.extend_from_slice(b);
}

fn encode_connect(connect: &Connect, buf: &mut Vec<u8>) {
    buf.push((PacketType::Connect as u8) << 4);

    let mut flags = 0u8;
    if connect.clean_session {
        flags |= 0x02;
    }
    if let Some(ref will) = connect.will {
        flags |= 0x04;
        flags |= (will.qos as u8) << 3;
        if will.retain {
            flags |= 0x20;
        }
    }
    if connect.password.is_some() {
        flags |= 0x40;
    }
    if connect.username.is_some() {
        flags |= 0x80;
    }

    let mut remaining = 2 + 4 + 1 + 1 + 2 + 2 + connect.client_id.len();
    if let Some(ref will) = connect.will {
        remaining += 2 + will.topic.len() + 2 + will.payload.len();
    }
    if let Some(ref username) = connect.username {
        remaining += 2 + username.len();
    }
    if let Some(ref password) = connect.password {
        remaining += 2 + password.len();
    }
    write_remaining_length(remaining, buf);

    write_string("MQTT", buf);
    buf.push(4); // protocol level
    buf.push(flags);
    buf.extend_from_slice(&connect.keep_alive.to_be_bytes());
    write_string(&connect.client_id, buf);
    if let Some(ref will) = connect.will {
        write_string(&will.topic, buf);
        write_binary(&will.payload, buf);
    }
    if let Some(ref username) = connect.username {
        write_string(username, buf);
    }
    if let Some(ref password) = connect.password {
        write_binary(password, buf);
    }
}

fn encode_connack(connack: &Connack, buf: &mut Vec<u8>) {
    buf.push((PacketType::Connack as u8) << 4);
    buf.push(2);
    buf.push(connack.session_present as u8);
    buf.push(connack.code as u8);
}

fn encode_publish(publish: &Publish, buf: &mut Vec<u8>) {
    let mut fixed_header = (PacketType::Publish as u8) << 4;
    if publish.dup {
        fixed_header |= 0x08;
    }
    fixed_header |= (publish.qos as u8) << 1;
    if publish.retain {
        fixed_header |= 0x01;
    }
    buf.push(fixed_header);

    let packet_id_len = if publish.qos != QoS::AtMostOnce { 2 } else { 0 };
    let remaining = 2 + publish.topic.len() + packet_id_len + publish.payload.len();
    write_remaining_length(remaining, buf);

    write_string(&publish.topic, buf);
    if publish.qos != QoS::AtMostOnce {
        if let Some(id) = publish.packet_id {
            buf.extend_from_slice(&id.to_be_bytes());
        }
    }
    buf.extend_from_slice(&publish.payload);
}

fn encode_simple_ack(packet_type: PacketType, flags: u8, packet_id: u16, buf: &mut Vec<u8>) {
    buf.push(((packet_type as u8) << 4) | flags);
    buf.push(2);
    buf.extend_from_slice(&packet_id.to_be_bytes());
}

fn encode_subscribe(subscribe: &Subscribe, buf: &mut Vec<u8>) {
    buf.push(((PacketType::Subscribe as u8) << 4) | 0x02);

    let remaining = 2 + subscribe
        .filters
        .iter()
        .map(|(f, _)| 2 + f.len() + 1)
        .sum::<usize>();
    write_remaining_length(remaining, buf);

    buf.extend_from_slice(&subscribe.packet_id.to_be_bytes());
    for (filter, qos) in &subscribe.filters {
        write_string(filter, buf);
        buf.push(*qos as u8);
    }
}

fn encode_suback(suback: &Suback, buf: &mut Vec<u8>) {
    buf.push((PacketType::Suback as u8) << 4);
    write_remaining_length(2 + suback.return_codes.len(), buf);
    buf.extend_from_slice(&suback.packet_id.to_be_bytes());
    buf.extend_from_slice(&suback.return_codes);
}

fn encode_unsubscribe(unsub: &Unsubscribe, buf: &mut Vec<u8>) {
    buf.push(((PacketType::Unsubscribe as u8) << 4) | 0x02);

    let remaining = 2 + unsub.filters.iter().map(|f| 2 + f.len()).sum::<usize>();
    write_remaining_length(remaining, buf);

    buf.extend_from_slice(&unsub.packet_id.to_be_bytes());
    for filter in &unsub.filters {
        write_string(filter, buf);
    }
}

fn encode_empty(packet_type: PacketType, buf: &mut Vec<u8>) {
    buf.push((packet_type as u8) << 4);
    buf.push(0);
}

/// Wire-level topic name check: no wildcards, not empty.
/// NUL bytes are already rejected by string decoding.
fn check_topic_name(topic: &str) -> Result<()> {
    if topic.is_empty() {
        return Err(ProtocolError::InvalidTopic(
            "Topic name must be at least 1 character".into(),
        ));
    }
    // MQTT-3.3.2-2: topic names must not contain wildcard characters
    if topic.contains('+') || topic.contains('#') {
        return Err(ProtocolError::InvalidTopic(format!(
            "Topic name '{}' must not contain wildcards",
            topic
        )));
    }
    Ok(())
}

/// Validate a concrete topic name against the configured limits.
pub fn validate_topic_name(
    topic: &str,
    max_length: usize,
    max_levels: usize,
) -> Result<()> {
    check_topic_name(topic)?;
    if topic.len() > max_length {
        return Err(ProtocolError::InvalidTopic(format!(
            "Topic exceeds {} bytes",
            max_length
        )));
    }
    if topic.split('/').count() > max_levels {
        return Err(ProtocolError::InvalidTopic(format!(
            "Topic exceeds {} levels",
            max_levels
        )));
    }
    Ok(())
}

/// Validate a topic filter against the configured limits and the MQTT
/// wildcard placement rules: `+` occupies a whole level, `#` occupies the
/// final level.
pub fn validate_topic_filter(
    filter: &str,
    max_length: usize,
    max_levels: usize,
) -> Result<()> {
    if filter.is_empty() {
        return Err(ProtocolError::InvalidTopic(
            "Topic filter must be at least 1 character".into(),
        ));
    }
    if filter.len() > max_length {
        return Err(ProtocolError::InvalidTopic(format!(
            "Topic filter exceeds {} bytes",
            max_length
        )));
    }

    let levels: Vec<&str> = filter.split('/').collect();
    if levels.len() > max_levels {
        return Err(ProtocolError::InvalidTopic(format!(
            "Topic filter exceeds {} levels",
            max_levels
        )));
    }

    for (i, level) in levels.iter().enumerate() {
        // MQTT-4.7.1-2: '#' must be the last level and stand alone
        if level.contains('#') && (*level != "#" || i != levels.len() - 1) {
            return Err(ProtocolError::InvalidTopic(format!(
                "'#' must be the final level in '{}'",
                filter
            )));
        }
        // MQTT-4.7.1-3: '+' must occupy an entire level
        if level.contains('+') && *level != "+" {
            return Err(ProtocolError::InvalidTopic(format!(
                "'+' must occupy an entire level in '{}'",
                filter
            )));
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const MAX: usize = 1024 * 1024;

    fn roundtrip(packet: Packet) {
        let mut buf = Vec::new();
        encode_packet(&packet, &mut buf);
        let (decoded, consumed) = decode_packet(&buf, MAX).unwrap().unwrap();
        assert_eq!(consumed, buf.len());
        assert_eq!(decoded, packet);
    }

    #[test]
    fn test_remaining_length_boundaries() {
        for len in [0, 127, 128, 16_383, 16_384, 2_097_151, 2_097_152, MAX_REMAINING_LENGTH] {
            let mut buf = [0u8; 4];
            let n = encode_remaining_length(len, &mut buf);
            let (decoded, consumed) = decode_remaining_length(&buf[..n]).unwrap().unwrap();
            assert_eq!(decoded, len);
            assert_eq!(consumed, n);
        }
    }

    #[test]
    fn test_remaining_length_incomplete() {
        // Continuation bit set on every byte so far
        assert!(decode_remaining_length(&[0x80]).unwrap().is_none());
        assert!(decode_remaining_length(&[0xFF, 0xFF, 0xFF]).unwrap().is_none());
    }

    #[test]
    fn test_remaining_length_overflow() {
        // A fifth length byte is never valid
        assert!(decode_remaining_length(&[0xFF, 0xFF, 0xFF, 0xFF, 0x01]).is_err());
    }

    #[test]
    fn test_connect_roundtrip() {
        roundtrip(Packet::Connect(Connect {
            clean_session: true,
            keep_alive: 60,
            client_id: "sensor-1".into(),
            will: None,
            username: None,
            password: None,
        }));
    }

    #[test]
    fn test_connect_with_will_and_credentials() {
        roundtrip(Packet::Connect(Connect {
            clean_session: false,
            keep_alive: 30,
            client_id: "gateway".into(),
            will: Some(Will {
                topic: "devices/gateway/status".into(),
                payload: Bytes::from_static(b"offline"),
                qos: QoS::AtLeastOnce,
                retain: true,
            }),
            username: Some("admin".into()),
            password: Some(b"secret".to_vec()),
        }));
    }

    #[test]
    fn test_connect_rejects_wrong_protocol_name() {
        let mut buf = Vec::new();
        encode_packet(
            &Packet::Connect(Connect {
                client_id: "c".into(),
                ..Default::default()
            }),
            &mut buf,
        );
        // Corrupt the protocol name: "MQTT" -> "MQTX"
        buf[7] = b'X';
        assert!(matches!(
            decode_packet(&buf, MAX),
            Err(ProtocolError::InvalidProtocolName(_))
        ));
    }

    #[test]
    fn test_connect_rejects_wrong_protocol_level() {
        let mut buf = Vec::new();
        encode_packet(
            &Packet::Connect(Connect {
                client_id: "c".into(),
                ..Default::default()
            }),
            &mut buf,
        );
        buf[8] = 3; // MQTT 3.1
        assert!(matches!(
            decode_packet(&buf, MAX),
            Err(ProtocolError::UnsupportedProtocolLevel(3))
        ));
    }

    #[test]
    fn test_connect_rejects_reserved_flag() {
        let mut buf = Vec::new();
        encode_packet(
            &Packet::Connect(Connect {
                client_id: "c".into(),
                ..Default::default()
            }),
            &mut buf,
        );
        buf[9] |= 0x01;
        assert!(matches!(
            decode_packet(&buf, MAX),
            Err(ProtocolError::InvalidConnectFlags(_))
        ));
    }

    #[test]
    fn test_connack_roundtrip() {
        roundtrip(Packet::Connack(Connack {
            session_present: true,
            code: ConnackCode::Accepted,
        }));
        roundtrip(Packet::Connack(Connack {
            session_present: false,
            code: ConnackCode::NotAuthorized,
        }));
    }

    #[test]
    fn test_publish_roundtrip_all_qos() {
        for (qos, packet_id) in [
            (QoS::AtMostOnce, None),
            (QoS::AtLeastOnce, Some(7)),
            (QoS::ExactlyOnce, Some(65535)),
        ] {
            roundtrip(Packet::Publish(Publish {
                dup: false,
                qos,
                retain: qos == QoS::AtLeastOnce,
                topic: "sensors/room1/temp".into(),
                packet_id,
                payload: Bytes::from_static(b"22.5"),
            }));
        }
    }

    #[test]
    fn test_publish_empty_payload() {
        roundtrip(Packet::Publish(Publish {
            dup: false,
            qos: QoS::AtMostOnce,
            retain: true,
            topic: "status/device1".into(),
            packet_id: None,
            payload: Bytes::new(),
        }));
    }

    #[test]
    fn test_publish_rejects_qos3() {
        // fixed header 0011 0110 = PUBLISH, QoS bits 11
        let buf = [0x36, 0x05, 0x00, 0x01, b'a', 0x00, 0x01];
        assert!(decode_packet(&buf, MAX).is_err());
    }

    #[test]
    fn test_publish_rejects_dup_at_qos0() {
        // fixed header 0011 1000 = PUBLISH, DUP set, QoS 0
        let buf = [0x38, 0x03, 0x00, 0x01, b'a'];
        assert!(decode_packet(&buf, MAX).is_err());
    }

    #[test]
    fn test_publish_rejects_wildcard_topic() {
        let mut buf = Vec::new();
        encode_packet(
            &Packet::Publish(Publish {
                dup: false,
                qos: QoS::AtMostOnce,
                retain: false,
                topic: "sensors/+/temp".into(),
                packet_id: None,
                payload: Bytes::new(),
            }),
            &mut buf,
        );
        assert!(matches!(
            decode_packet(&buf, MAX),
            Err(ProtocolError::InvalidTopic(_))
        ));
    }

    #[test]
    fn test_publish_rejects_nul_in_topic() {
        let mut buf = Vec::new();
        buf.push(0x30);
        let body: &[u8] = &[0x00, 0x03, b'a', 0x00, b'b'];
        buf.push(body.len() as u8);
        buf.extend_from_slice(body);
        assert!(decode_packet(&buf, MAX).is_err());
    }

    #[test]
    fn test_acks_roundtrip() {
        roundtrip(Packet::Puback { packet_id: 1 });
        roundtrip(Packet::Pubrec { packet_id: 2 });
        roundtrip(Packet::Pubrel { packet_id: 3 });
        roundtrip(Packet::Pubcomp { packet_id: 4 });
        roundtrip(Packet::Unsuback { packet_id: 5 });
    }

    #[test]
    fn test_pubrel_requires_flags_02() {
        // PUBREL with flags 0000 instead of 0010
        let buf = [0x60, 0x02, 0x00, 0x03];
        assert!(decode_packet(&buf, MAX).is_err());
    }

    #[test]
    fn test_subscribe_roundtrip() {
        roundtrip(Packet::Subscribe(Subscribe {
            packet_id: 10,
            filters: vec![
                ("sensors/+/temp".into(), QoS::AtLeastOnce),
                ("alerts/#".into(), QoS::ExactlyOnce),
            ],
        }));
    }

    #[test]
    fn test_subscribe_rejects_empty() {
        // SUBSCRIBE with a packet id but no filters
        let buf = [0x82, 0x02, 0x00, 0x01];
        assert!(decode_packet(&buf, MAX).is_err());
    }

    #[test]
    fn test_suback_roundtrip() {
        roundtrip(Packet::Suback(Suback {
            packet_id: 10,
            return_codes: vec![0x01, 0x80, 0x02],
        }));
    }

    #[test]
    fn test_unsubscribe_roundtrip() {
        roundtrip(Packet::Unsubscribe(Unsubscribe {
            packet_id: 11,
            filters: vec!["sensors/+/temp".into(), "alerts/#".into()],
        }));
    }

    #[test]
    fn test_ping_and_disconnect_roundtrip() {
        roundtrip(Packet::Pingreq);
        roundtrip(Packet::Pingresp);
        roundtrip(Packet::Disconnect);
    }

    #[test]
    fn test_partial_packet_needs_more() {
        let mut buf = Vec::new();
        encode_packet(
            &Packet::Publish(Publish {
                dup: false,
                qos: QoS::AtMostOnce,
                retain: false,
                topic: "a/b".into(),
                packet_id: None,
                payload: Bytes::from_static(b"hello"),
            }),
            &mut buf,
        );
        for end in 0..buf.len() {
            assert!(decode_packet(&buf[..end], MAX).unwrap().is_none());
        }
        assert!(decode_packet(&buf, MAX).unwrap().is_some());
    }

    #[test]
    fn test_two_packets_in_buffer() {
        let mut buf = Vec::new();
        encode_packet(&Packet::Pingreq, &mut buf);
        encode_packet(&Packet::Disconnect, &mut buf);
        let (first, consumed) = decode_packet(&buf, MAX).unwrap().unwrap();
        assert_eq!(first, Packet::Pingreq);
        let (second, _) = decode_packet(&buf[consumed..], MAX).unwrap().unwrap();
        assert_eq!(second, Packet::Disconnect);
    }

    #[test]
    fn test_oversized_packet_rejected_before_body() {
        // Header declares 1000 bytes but only the header has arrived;
        // the size check fires without waiting for the body.
        let mut buf = Vec::new();
        buf.push(0x30);
        write_remaining_length(1000, &mut buf);
        assert!(matches!(
            decode_packet(&buf, 512),
            Err(ProtocolError::PacketTooLarge { size: _, max: 512 })
        ));
    }

    #[test]
    fn test_invalid_packet_type() {
        let buf = [0x00, 0x00];
        assert!(matches!(
            decode_packet(&buf, MAX),
            Err(ProtocolError::InvalidPacketType(0))
        ));
        let buf = [0xF0, 0x00];
        assert!(matches!(
            decode_packet(&buf, MAX),
            Err(ProtocolError::InvalidPacketType(15))
        ));
    }

    #[test]
    fn test_validate_topic_name() {
        assert!(validate_topic_name("a/b/c", 256, 8).is_ok());
        assert!(validate_topic_name("", 256, 8).is_err());
        assert!(validate_topic_name("a/+/c", 256, 8).is_err());
        assert!(validate_topic_name("a/#", 256, 8).is_err());
        assert!(validate_topic_name("a/b/c/d", 256, 3).is_err());
        assert!(validate_topic_name("toolong", 3, 8).is_err());
    }

    #[test]
    fn test_validate_topic_filter() {
        assert!(validate_topic_filter("a/b/c", 256, 8).is_ok());
        assert!(validate_topic_filter("a/+/c", 256, 8).is_ok());
        assert!(validate_topic_filter("a/#", 256, 8).is_ok());
        assert!(validate_topic_filter("#", 256, 8).is_ok());
        assert!(validate_topic_filter("+", 256, 8).is_ok());
        assert!(validate_topic_filter("", 256, 8).is_err());
        // '#' not final or not alone
        assert!(validate_topic_filter("a/#/b", 256, 8).is_err());
        assert!(validate_topic_filter("a/b#", 256, 8).is_err());
        // '+' not alone in its level
        assert!(validate_topic_filter("a/b+", 256, 8).is_err());
        assert!(validate_topic_filter("a/b/c/d", 256, 3).is_err());
    }
}
