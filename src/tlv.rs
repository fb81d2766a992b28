//! Matter TLV encoder and decoder
//!
//! Only context-specific (1 byte) and anonymous tags are supported; that is everything
//! the interaction model messages handled by this crate use.

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Cursor, Error, ErrorKind, Read, Result, Write};

const TYPE_INT_1: u8 = 0x0;
const TYPE_INT_2: u8 = 0x1;
const TYPE_INT_4: u8 = 0x2;
const TYPE_INT_8: u8 = 0x3;
const TYPE_UINT_1: u8 = 0x4;
const TYPE_UINT_2: u8 = 0x5;
const TYPE_UINT_4: u8 = 0x6;
const TYPE_UINT_8: u8 = 0x7;
const TYPE_BOOL_FALSE: u8 = 0x8;
const TYPE_BOOL_TRUE: u8 = 0x9;
const TYPE_UTF8_L1: u8 = 0xc;
const TYPE_UTF8_L2: u8 = 0xd;
const TYPE_OCTET_STRING_L1: u8 = 0x10;
const TYPE_OCTET_STRING_L2: u8 = 0x11;
const TYPE_NULL: u8 = 0x14;
const TYPE_STRUCT: u8 = 0x15;
const TYPE_ARRAY: u8 = 0x16;
const TYPE_LIST: u8 = 0x17;
const TYPE_END_CONTAINER: u8 = 0x18;

const TAG_ANONYMOUS: u8 = 0;
const TAG_CONTEXT: u8 = 1;
const CTRL_CTX_L1: u8 = TAG_CONTEXT << 5;

/// Buffer to encode matter tlv. Write elements, then take `data`.
/// ```
/// # use matc_groups::tlv;
/// # use anyhow::Result;
/// # fn main() -> Result<()> {
/// let mut tlv = tlv::TlvBuffer::new();
/// tlv.write_anon_struct()?;
/// tlv.write_uint16(2, 1)?;
/// tlv.write_string(3, "kitchen")?;
/// tlv.write_struct_end()?;
/// let decoded = tlv::decode_tlv(&tlv.data)?;
/// assert_eq!(decoded.get_u16(&[2]), Some(1));
/// # Ok(())
/// # }
/// ```
pub struct TlvBuffer {
    pub data: Vec<u8>,
}

impl TlvBuffer {
    pub fn new() -> Self {
        Self {
            data: Vec::with_capacity(256),
        }
    }
    pub fn from_vec(v: Vec<u8>) -> Self {
        Self { data: v }
    }
    fn write_ctrl(&mut self, tag: Option<u8>, typ: u8) -> Result<()> {
        match tag {
            Some(tag) => {
                self.data.write_u8(CTRL_CTX_L1 | typ)?;
                self.data.write_u8(tag)
            }
            None => self.data.write_u8(typ),
        }
    }
    pub fn write_raw(&mut self, data: &[u8]) -> Result<()> {
        self.data.write_all(data)
    }
    pub fn write_anon_struct(&mut self) -> Result<()> {
        self.write_ctrl(None, TYPE_STRUCT)
    }
    pub fn write_anon_list(&mut self) -> Result<()> {
        self.write_ctrl(None, TYPE_LIST)
    }
    pub fn write_struct(&mut self, tag: u8) -> Result<()> {
        self.write_ctrl(Some(tag), TYPE_STRUCT)
    }
    pub fn write_array(&mut self, tag: u8) -> Result<()> {
        self.write_ctrl(Some(tag), TYPE_ARRAY)
    }
    pub fn write_list(&mut self, tag: u8) -> Result<()> {
        self.write_ctrl(Some(tag), TYPE_LIST)
    }
    pub fn write_struct_end(&mut self) -> Result<()> {
        self.data.write_u8(TYPE_END_CONTAINER)
    }
    pub fn write_string(&mut self, tag: u8, data: &str) -> Result<()> {
        let bytes = data.as_bytes();
        if bytes.len() > 0xff {
            self.write_ctrl(Some(tag), TYPE_UTF8_L2)?;
            self.data.write_u16::<LittleEndian>(bytes.len() as u16)?;
        } else {
            self.write_ctrl(Some(tag), TYPE_UTF8_L1)?;
            self.data.write_u8(bytes.len() as u8)?;
        }
        self.data.write_all(bytes)
    }
    pub fn write_octetstring(&mut self, tag: u8, data: &[u8]) -> Result<()> {
        if data.len() > 0xff {
            self.write_ctrl(Some(tag), TYPE_OCTET_STRING_L2)?;
            self.data.write_u16::<LittleEndian>(data.len() as u16)?;
        } else {
            self.write_ctrl(Some(tag), TYPE_OCTET_STRING_L1)?;
            self.data.write_u8(data.len() as u8)?;
        }
        self.data.write_all(data)
    }
    pub fn write_int8(&mut self, tag: u8, value: i8) -> Result<()> {
        self.write_ctrl(Some(tag), TYPE_INT_1)?;
        self.data.write_i8(value)
    }
    pub fn write_uint8(&mut self, tag: u8, value: u8) -> Result<()> {
        self.write_ctrl(Some(tag), TYPE_UINT_1)?;
        self.data.write_u8(value)
    }
    pub fn write_uint16(&mut self, tag: u8, value: u16) -> Result<()> {
        self.write_ctrl(Some(tag), TYPE_UINT_2)?;
        self.data.write_u16::<LittleEndian>(value)
    }
    pub fn write_uint32(&mut self, tag: u8, value: u32) -> Result<()> {
        self.write_ctrl(Some(tag), TYPE_UINT_4)?;
        self.data.write_u32::<LittleEndian>(value)
    }
    pub fn write_uint64(&mut self, tag: u8, value: u64) -> Result<()> {
        self.write_ctrl(Some(tag), TYPE_UINT_8)?;
        self.data.write_u64::<LittleEndian>(value)
    }
    pub fn write_bool(&mut self, tag: u8, value: bool) -> Result<()> {
        let typ = if value { TYPE_BOOL_TRUE } else { TYPE_BOOL_FALSE };
        self.write_ctrl(Some(tag), typ)
    }
    pub fn write_null(&mut self, tag: u8) -> Result<()> {
        self.write_ctrl(Some(tag), TYPE_NULL)
    }
}

impl Default for TlvBuffer {
    fn default() -> Self {
        Self::new()
    }
}

/// Decoded value of tlv element. Signed integers are sign extended into the u64.
#[derive(Debug, Clone, PartialEq)]
pub enum TlvItemValue {
    Int(u64),
    Bool(bool),
    String(String),
    OctetString(Vec<u8>),
    List(Vec<TlvItem>),
    Nil(),
    Invalid(),
}

/// Decoded tlv element returned by [decode_tlv]
#[derive(Debug, Clone, PartialEq)]
pub struct TlvItem {
    pub tag: u8,
    pub value: TlvItemValue,
}

impl TlvItem {
    /// Follow path of context tags; first element with matching tag wins at every level.
    pub fn get(&self, tag: &[u8]) -> Option<&TlvItemValue> {
        self.get_item(tag).map(|i| &i.value)
    }
    pub fn get_item(&self, tag: &[u8]) -> Option<&TlvItem> {
        let Some((first, rest)) = tag.split_first() else {
            return Some(self);
        };
        match &self.value {
            TlvItemValue::List(lst) => lst.iter().find(|l| l.tag == *first)?.get_item(rest),
            _ => None,
        }
    }
    /// Children of container element, empty for scalars.
    pub fn children(&self) -> &[TlvItem] {
        match &self.value {
            TlvItemValue::List(lst) => lst,
            _ => &[],
        }
    }
    pub fn get_int(&self, tag: &[u8]) -> Option<u64> {
        match self.get(tag) {
            Some(TlvItemValue::Int(i)) => Some(*i),
            _ => None,
        }
    }
    pub fn get_bool(&self, tag: &[u8]) -> Option<bool> {
        match self.get(tag) {
            Some(TlvItemValue::Bool(b)) => Some(*b),
            _ => None,
        }
    }
    pub fn get_u8(&self, tag: &[u8]) -> Option<u8> {
        self.get_int(tag).and_then(|i| u8::try_from(i).ok())
    }
    pub fn get_u16(&self, tag: &[u8]) -> Option<u16> {
        self.get_int(tag).and_then(|i| u16::try_from(i).ok())
    }
    pub fn get_u32(&self, tag: &[u8]) -> Option<u32> {
        self.get_int(tag).and_then(|i| u32::try_from(i).ok())
    }
    pub fn get_u64(&self, tag: &[u8]) -> Option<u64> {
        self.get_int(tag)
    }
    pub fn get_octet_string(&self, tag: &[u8]) -> Option<&[u8]> {
        match self.get(tag) {
            Some(TlvItemValue::OctetString(o)) => Some(o),
            _ => None,
        }
    }
    pub fn get_string_owned(&self, tag: &[u8]) -> Option<String> {
        match self.get(tag) {
            Some(TlvItemValue::String(s)) => Some(s.clone()),
            _ => None,
        }
    }
    /// Write element tree to log at info level.
    pub fn log_dump(&self, indent: usize) {
        let pad = " ".repeat(indent);
        match &self.value {
            TlvItemValue::List(vec) => {
                log::info!("{}{}:", pad, self.tag);
                for v in vec {
                    v.log_dump(indent + 2);
                }
            }
            TlvItemValue::OctetString(o) => log::info!("{}{}: hex:{}", pad, self.tag, hex::encode(o)),
            v => log::info!("{}{}: {:?}", pad, self.tag, v),
        }
    }
}

fn read_tag(tagctrl: u8, cursor: &mut Cursor<&[u8]>) -> Result<u8> {
    match tagctrl {
        TAG_ANONYMOUS => Ok(0),
        TAG_CONTEXT => cursor.read_u8(),
        _ => Err(Error::new(
            ErrorKind::InvalidData,
            format!("unsupported tlv tag control {}", tagctrl),
        )),
    }
}

fn read_bytes(cursor: &mut Cursor<&[u8]>, size: usize) -> Result<Vec<u8>> {
    let remaining = cursor.get_ref().len() as u64 - cursor.position();
    if size as u64 > remaining {
        return Err(Error::new(ErrorKind::UnexpectedEof, "tlv string exceeds buffer"));
    }
    let mut value = vec![0; size];
    cursor.read_exact(&mut value)?;
    Ok(value)
}

/// Decode elements into container until end-of-container or end of data.
fn decode(cursor: &mut Cursor<&[u8]>, container: &mut Vec<TlvItem>) -> Result<()> {
    while cursor.position() < cursor.get_ref().len() as u64 {
        let fb = cursor.read_u8()?;
        let tp = fb & 0x1f;
        if tp == TYPE_END_CONTAINER {
            return Ok(());
        }
        let tag = read_tag(fb >> 5, cursor)?;
        let value = match tp {
            TYPE_INT_1 => TlvItemValue::Int(cursor.read_i8()? as i64 as u64),
            TYPE_INT_2 => TlvItemValue::Int(cursor.read_i16::<LittleEndian>()? as i64 as u64),
            TYPE_INT_4 => TlvItemValue::Int(cursor.read_i32::<LittleEndian>()? as i64 as u64),
            TYPE_INT_8 => TlvItemValue::Int(cursor.read_i64::<LittleEndian>()? as u64),
            TYPE_UINT_1 => TlvItemValue::Int(cursor.read_u8()? as u64),
            TYPE_UINT_2 => TlvItemValue::Int(cursor.read_u16::<LittleEndian>()? as u64),
            TYPE_UINT_4 => TlvItemValue::Int(cursor.read_u32::<LittleEndian>()? as u64),
            TYPE_UINT_8 => TlvItemValue::Int(cursor.read_u64::<LittleEndian>()?),
            TYPE_BOOL_FALSE => TlvItemValue::Bool(false),
            TYPE_BOOL_TRUE => TlvItemValue::Bool(true),
            TYPE_UTF8_L1 | TYPE_UTF8_L2 => {
                let size = if tp == TYPE_UTF8_L1 {
                    cursor.read_u8()? as usize
                } else {
                    cursor.read_u16::<LittleEndian>()? as usize
                };
                match String::from_utf8(read_bytes(cursor, size)?) {
                    Ok(s) => TlvItemValue::String(s),
                    Err(_) => TlvItemValue::Invalid(),
                }
            }
            TYPE_OCTET_STRING_L1 => {
                let size = cursor.read_u8()? as usize;
                TlvItemValue::OctetString(read_bytes(cursor, size)?)
            }
            TYPE_OCTET_STRING_L2 => {
                let size = cursor.read_u16::<LittleEndian>()? as usize;
                TlvItemValue::OctetString(read_bytes(cursor, size)?)
            }
            TYPE_NULL => TlvItemValue::Nil(),
            TYPE_STRUCT | TYPE_ARRAY | TYPE_LIST => {
                let mut inner = Vec::new();
                decode(cursor, &mut inner)?;
                TlvItemValue::List(inner)
            }
            _ => {
                return Err(Error::new(
                    ErrorKind::InvalidData,
                    format!("unknown tlv type 0x{:x}", tp),
                ))
            }
        };
        container.push(TlvItem { tag, value });
    }
    Ok(())
}

/// decode raw buffer with tlv data
pub fn decode_tlv(data: &[u8]) -> Result<TlvItem> {
    let mut container = Vec::new();
    let mut cursor = Cursor::new(data);
    decode(&mut cursor, &mut container)?;
    match container.len() {
        0 => Err(Error::new(ErrorKind::InvalidData, "no data found")),
        1 => container
            .pop()
            .ok_or_else(|| Error::new(ErrorKind::InvalidData, "no data found")),
        _ => Ok(TlvItem {
            tag: 0,
            value: TlvItemValue::List(container),
        }),
    }
}
