//! Matter message framing and interaction model read messages.

use anyhow::{Context, Result};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use core::fmt;
use std::io::{Read, Write};

use crate::{
    im::{AttributePath, EventPath, ReadParams},
    tlv::{self, TlvItem},
};

/// Interaction model revision announced in every request.
pub const IM_REVISION: u8 = 11;

#[derive(Debug, Clone)]
pub struct MessageHeader {
    pub flags: u8,
    pub security_flags: u8,
    pub session_id: u16,
    pub message_counter: u32,
    pub source_node_id: Option<Vec<u8>>,
    pub destination_node_id: Option<Vec<u8>>,
}

impl MessageHeader {
    const FLAG_SRC_PRESENT: u8 = 4;
    const DSIZ_64: u8 = 1;
    const DSIZ_16: u8 = 2;

    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut flags: u8 = 0;
        if self.source_node_id.as_ref().is_some_and(|x| x.len() == 8) {
            flags |= Self::FLAG_SRC_PRESENT;
        }
        match self.destination_node_id.as_ref().map(|d| d.len()) {
            Some(2) => flags |= Self::DSIZ_16,
            Some(8) => flags |= Self::DSIZ_64,
            _ => {}
        }
        let mut out = Vec::with_capacity(64);
        out.write_u8(flags)?;
        out.write_u16::<LittleEndian>(self.session_id)?;
        out.write_u8(self.security_flags)?;
        out.write_u32::<LittleEndian>(self.message_counter)?;
        if let Some(sn) = self.source_node_id.as_ref().filter(|s| s.len() == 8) {
            out.write_all(sn)?;
        }
        if let Some(dn) = &self.destination_node_id {
            out.write_all(dn)?;
        }
        Ok(out)
    }

    pub fn decode(data: &[u8]) -> Result<(Self, Vec<u8>)> {
        let mut cursor = std::io::Cursor::new(data);
        let flags = cursor.read_u8()?;
        let session_id = cursor.read_u16::<LittleEndian>()?;
        let security_flags = cursor.read_u8()?;
        let message_counter = cursor.read_u32::<LittleEndian>()?;
        let source_node_id = if (flags & Self::FLAG_SRC_PRESENT) != 0 {
            let mut sn = vec![0; 8];
            cursor.read_exact(&mut sn).context("source node id truncated")?;
            Some(sn)
        } else {
            None
        };
        let dst_size = match flags & 3 {
            Self::DSIZ_64 => 8,
            Self::DSIZ_16 => 2,
            _ => 0,
        };
        let destination_node_id = if dst_size > 0 {
            let mut dn = vec![0; dst_size];
            cursor.read_exact(&mut dn).context("destination node id truncated")?;
            Some(dn)
        } else {
            None
        };
        let mut rest = Vec::new();
        cursor.read_to_end(&mut rest)?;
        Ok((
            Self {
                flags,
                security_flags,
                session_id,
                message_counter,
                source_node_id,
                destination_node_id,
            },
            rest,
        ))
    }
}

#[derive(Debug, Clone)]
pub struct ProtocolMessageHeader {
    exchange_flags: u8,
    pub opcode: u8,
    pub exchange_id: u16,
    pub protocol_id: u16,
    pub ack_counter: u32,
}

impl ProtocolMessageHeader {
    pub const FLAG_INITIATOR: u8 = 1;
    pub const FLAG_ACK: u8 = 2;
    pub const FLAG_RELIABILITY: u8 = 4;

    pub const INTERACTION_OPCODE_STATUS_RESP: u8 = 0x1;
    pub const INTERACTION_OPCODE_READ_REQ: u8 = 0x2;
    pub const INTERACTION_OPCODE_REPORT_DATA: u8 = 0x5;

    pub const PROTOCOL_ID_SECURE_CHANNEL: u16 = 0;
    pub const PROTOCOL_ID_INTERACTION: u16 = 1;

    /// Header of initiator message on interaction model exchange.
    pub fn interaction(opcode: u8, exchange_id: u16) -> Self {
        Self {
            exchange_flags: Self::FLAG_INITIATOR | Self::FLAG_RELIABILITY,
            opcode,
            exchange_id,
            protocol_id: Self::PROTOCOL_ID_INTERACTION,
            ack_counter: 0,
        }
    }

    pub fn is_interaction(&self, opcode: u8) -> bool {
        self.protocol_id == Self::PROTOCOL_ID_INTERACTION && self.opcode == opcode
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(16);
        out.write_u8(self.exchange_flags)?;
        out.write_u8(self.opcode)?;
        out.write_u16::<LittleEndian>(self.exchange_id)?;
        out.write_u16::<LittleEndian>(self.protocol_id)?;
        if (self.exchange_flags & Self::FLAG_ACK) != 0 {
            out.write_u32::<LittleEndian>(self.ack_counter)?;
        }
        Ok(out)
    }

    pub fn decode(data: &[u8]) -> Result<(Self, Vec<u8>)> {
        let mut cursor = std::io::Cursor::new(data);
        let exchange_flags = cursor.read_u8()?;
        let opcode = cursor.read_u8()?;
        let exchange_id = cursor.read_u16::<LittleEndian>()?;
        let protocol_id = cursor.read_u16::<LittleEndian>()?;
        let mut ack_counter = 0;
        if (exchange_flags & Self::FLAG_ACK) != 0 {
            ack_counter = cursor.read_u32::<LittleEndian>()?;
        }
        let mut rest = Vec::new();
        cursor.read_to_end(&mut rest)?;
        Ok((
            Self {
                exchange_flags,
                opcode,
                exchange_id,
                protocol_id,
                ack_counter,
            },
            rest,
        ))
    }
}

/// Decrypted message as handed over by transport.
pub struct Message {
    pub message_header: MessageHeader,
    pub protocol_header: ProtocolMessageHeader,
    pub payload: Vec<u8>,
    pub tlv: TlvItem,
}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Message")
            .field("message_header", &self.message_header)
            .field("protocol_header", &self.protocol_header)
            .field("payload", &hex::encode(&self.payload))
            .field("tlv", &self.tlv)
            .finish()
    }
}

impl Message {
    pub fn decode(data: &[u8]) -> Result<Self> {
        let (message_header, rest) = MessageHeader::decode(data)?;
        let (protocol_header, rest) = ProtocolMessageHeader::decode(&rest)?;
        let tlv = if protocol_header.protocol_id == ProtocolMessageHeader::PROTOCOL_ID_INTERACTION {
            tlv::decode_tlv(&rest).context("interaction model payload is not valid tlv")?
        } else {
            // secure channel payloads are not tlv (status report is fixed layout)
            TlvItem {
                tag: 0,
                value: tlv::TlvItemValue::Invalid(),
            }
        };
        Ok(Self {
            message_header,
            protocol_header,
            payload: rest,
            tlv,
        })
    }
}

fn write_attribute_path(tlv: &mut tlv::TlvBuffer, path: &AttributePath) -> Result<()> {
    tlv.write_anon_list()?;
    if let Some(endpoint) = path.endpoint_filter() {
        tlv.write_uint16(2, endpoint)?;
    }
    if let Some(cluster) = path.cluster_filter() {
        tlv.write_uint32(3, cluster)?;
    }
    if let Some(attribute) = path.attribute_filter() {
        tlv.write_uint32(4, attribute)?;
    }
    tlv.write_struct_end()?;
    Ok(())
}

fn write_event_path(tlv: &mut tlv::TlvBuffer, path: &EventPath) -> Result<()> {
    tlv.write_anon_list()?;
    if let Some(endpoint) = path.endpoint_filter() {
        tlv.write_uint16(1, endpoint)?;
    }
    if let Some(cluster) = path.cluster_filter() {
        tlv.write_uint32(2, cluster)?;
    }
    if let Some(event) = path.event_filter() {
        tlv.write_uint32(3, event)?;
    }
    if path.is_urgent {
        tlv.write_bool(4, true)?;
    }
    tlv.write_struct_end()?;
    Ok(())
}

/// Encode ReadRequest message (protocol header + tlv) for all paths in params.
pub fn im_read_request(exchange: u16, params: &ReadParams) -> Result<Vec<u8>> {
    let b = ProtocolMessageHeader::interaction(
        ProtocolMessageHeader::INTERACTION_OPCODE_READ_REQ,
        exchange,
    )
    .encode()?;

    let mut tlv = tlv::TlvBuffer::from_vec(b);
    tlv.write_anon_struct()?;
    if !params.attributes.is_empty() {
        tlv.write_array(0)?;
        for path in &params.attributes {
            write_attribute_path(&mut tlv, path)?;
        }
        tlv.write_struct_end()?;
    }
    if !params.events.is_empty() {
        tlv.write_array(1)?;
        for path in &params.events {
            write_event_path(&mut tlv, path)?;
        }
        tlv.write_struct_end()?;
    }
    tlv.write_bool(3, params.fabric_filtered)?;
    tlv.write_uint8(0xff, IM_REVISION)?;
    tlv.write_struct_end()?;
    Ok(tlv.data)
}

/// Encode StatusResponse message, used to request next report chunk.
pub fn im_status_response(exchange: u16, status: u8) -> Result<Vec<u8>> {
    let b = ProtocolMessageHeader::interaction(
        ProtocolMessageHeader::INTERACTION_OPCODE_STATUS_RESP,
        exchange,
    )
    .encode()?;
    let mut tlv = tlv::TlvBuffer::from_vec(b);
    tlv.write_anon_struct()?;
    tlv.write_uint8(0, status)?;
    tlv.write_uint8(0xff, IM_REVISION)?;
    tlv.write_struct_end()?;
    Ok(tlv.data)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::im::{AttributePath, EventPath, ReadParams, WILDCARD_ENDPOINT};

    #[test]
    fn read_request_layout() {
        let params = ReadParams {
            attributes: vec![
                AttributePath::new(1, 0x0006, 0x0000),
                AttributePath::new(WILDCARD_ENDPOINT, 0x0028, 0x0001),
            ],
            events: vec![EventPath::new(0, 0x0028, 0x0000)],
            fabric_filtered: true,
        };
        let data = im_read_request(0x4321, &params).unwrap();
        let (ph, rest) = ProtocolMessageHeader::decode(&data).unwrap();
        assert!(ph.is_interaction(ProtocolMessageHeader::INTERACTION_OPCODE_READ_REQ));
        assert_eq!(ph.exchange_id, 0x4321);

        let t = tlv::decode_tlv(&rest).unwrap();
        let attrs = t.get_item(&[0]).unwrap().children();
        assert_eq!(attrs.len(), 2);
        assert_eq!(attrs[0].get_u16(&[2]), Some(1));
        assert_eq!(attrs[0].get_u32(&[3]), Some(0x0006));
        assert_eq!(attrs[0].get_u32(&[4]), Some(0));
        // wildcard endpoint is omitted
        assert!(attrs[1].get(&[2]).is_none());
        assert_eq!(attrs[1].get_u32(&[3]), Some(0x0028));

        let events = t.get_item(&[1]).unwrap().children();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].get_u16(&[1]), Some(0));
        assert_eq!(events[0].get_u32(&[3]), Some(0));
        assert_eq!(t.get_bool(&[3]), Some(true));
        assert_eq!(t.get_u8(&[0xff]), Some(IM_REVISION));
    }

    #[test]
    fn event_only_read_has_no_attribute_requests() {
        let params = ReadParams {
            events: vec![EventPath::new(1, 0x003b, 0x0001)],
            ..Default::default()
        };
        let data = im_read_request(1, &params).unwrap();
        let (_, rest) = ProtocolMessageHeader::decode(&data).unwrap();
        let t = tlv::decode_tlv(&rest).unwrap();
        assert!(t.get(&[0]).is_none());
        assert_eq!(t.get_item(&[1]).unwrap().children().len(), 1);
    }

    #[test]
    fn message_decode() {
        let mh = MessageHeader {
            flags: 0,
            security_flags: 0,
            session_id: 0x55,
            message_counter: 1000,
            source_node_id: Some(vec![1, 2, 3, 4, 5, 6, 7, 8]),
            destination_node_id: None,
        };
        let mut data = mh.encode().unwrap();
        data.extend_from_slice(&im_status_response(7, 0).unwrap());
        let m = Message::decode(&data).unwrap();
        assert_eq!(m.message_header.session_id, 0x55);
        assert_eq!(m.message_header.message_counter, 1000);
        assert_eq!(m.message_header.source_node_id.as_deref(), Some(&[1u8, 2, 3, 4, 5, 6, 7, 8][..]));
        assert!(m
            .protocol_header
            .is_interaction(ProtocolMessageHeader::INTERACTION_OPCODE_STATUS_RESP));
        assert_eq!(m.tlv.get_u8(&[0]), Some(0));
    }
}
