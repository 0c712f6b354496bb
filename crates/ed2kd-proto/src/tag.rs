//! Self-describing typed tags.
//!
//! Two header encodings exist on the wire:
//!
//! - legacy: `[u8 type][u16 name_len][name]`, where a one byte name is a
//!   compact numeric name and anything longer is a string name;
//! - extended: `[u8 type | 0x80][u8 name]`, always a compact name. Short
//!   strings use the `STR1..STR16` types with the length folded into the type.
//!
//! Client login and offer payloads must use the legacy form. The extended form
//! only shows up in peer greetings.

use std::fmt;

use bytes::BufMut;
use strum::FromRepr;

use crate::{constants::HASH_LEN, cursor::Cursor, error::ProtoError};

/// High bit of the type byte, set on extended tags.
pub const EXTENDED_FLAG: u8 = 0x80;

/// `STR1`; `STR1 + n - 1` is an inline string of `n` bytes (extended tags only).
pub const TAG_STR1: u8 = 0x11;
pub const TAG_STR16: u8 = 0x20;

/// Well-known tag names.
pub mod names {
    pub const NAME: u8 = 0x01;
    pub const PORT: u8 = 0x0F;
    pub const VERSION: u8 = 0x11;
    pub const SERVER_FLAGS: u8 = 0x20;
    pub const EMULE_VERSION: u8 = 0xFB;

    pub const FILENAME: u8 = 0x01;
    pub const FILESIZE: u8 = 0x02;
    pub const FILETYPE: u8 = 0x03;
    pub const FILESIZE_HI: u8 = 0x3A;
    pub const FILERATING: u8 = 0xF7;

    pub const MEDIA_LENGTH: &[u8] = b"length";
    pub const MEDIA_BITRATE: &[u8] = b"bitrate";
    pub const MEDIA_CODEC: &[u8] = b"codec";
}

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromRepr)]
pub enum TagType {
    Hash = 0x01,
    String = 0x02,
    UInt32 = 0x03,
    Float32 = 0x04,
    Bool = 0x05,
    BoolArray = 0x06,
    Blob = 0x07,
    UInt16 = 0x08,
    UInt8 = 0x09,
    Bsob = 0x0A,
    UInt64 = 0x0B,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TagName<'a> {
    Compact(u8),
    Named(&'a [u8]),
}

impl fmt::Display for TagName<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TagName::Compact(code) => write!(f, "{code:#04x}"),
            TagName::Named(name) => write!(f, "{:?}", String::from_utf8_lossy(name)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TagValue<'a> {
    Hash([u8; HASH_LEN]),
    String(&'a [u8]),
    UInt8(u8),
    UInt16(u16),
    UInt32(u32),
    UInt64(u64),
    Float(f32),
    Bool(bool),
    /// Raw bytes of bool arrays, blobs and bsobs. Nothing here interprets them.
    Blob(&'a [u8]),
}

impl TagValue<'_> {
    /// Type byte used when encoding this value as a legacy tag.
    fn legacy_type(&self) -> u8 {
        let ty = match self {
            TagValue::Hash(_) => TagType::Hash,
            TagValue::String(_) => TagType::String,
            TagValue::UInt8(_) => TagType::UInt8,
            TagValue::UInt16(_) => TagType::UInt16,
            TagValue::UInt32(_) => TagType::UInt32,
            TagValue::UInt64(_) => TagType::UInt64,
            TagValue::Float(_) => TagType::Float32,
            TagValue::Bool(_) => TagType::Bool,
            TagValue::Blob(_) => TagType::Blob,
        };
        ty as u8
    }
}

/// One decoded tag. String and blob values borrow from the payload.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Tag<'a> {
    /// Type byte as found on the wire, extended flag cleared.
    pub tag_type: u8,
    pub name: TagName<'a>,
    pub value: TagValue<'a>,
}

impl<'a> Tag<'a> {
    pub fn new(name: TagName<'a>, value: TagValue<'a>) -> Self {
        Self {
            tag_type: value.legacy_type(),
            name,
            value,
        }
    }

    pub fn compact(name: u8, value: TagValue<'a>) -> Self {
        Self::new(TagName::Compact(name), value)
    }

    /// Error for a known name carrying a value of the wrong type.
    pub fn unexpected_type(&self) -> ProtoError {
        ProtoError::UnexpectedTagType {
            name: self.name.to_string(),
            tag_type: self.tag_type,
        }
    }

    pub fn unknown_name(&self) -> ProtoError {
        ProtoError::UnknownTagName(self.name.to_string())
    }

    /// Decode a single tag, consuming its header and its whole value.
    pub fn read(cur: &mut Cursor<'a>, allow_extended: bool) -> Result<Self, ProtoError> {
        let raw_type = cur.read_u8()?;

        let (tag_type, name) = if raw_type & EXTENDED_FLAG != 0 {
            if !allow_extended {
                return Err(ProtoError::ExtendedTag(raw_type));
            }
            (raw_type & !EXTENDED_FLAG, TagName::Compact(cur.read_u8()?))
        } else {
            let name_len = cur.read_u16()? as usize;
            let name = cur.read_bytes(name_len)?;
            let name = match name {
                [code] => TagName::Compact(*code),
                _ => TagName::Named(name),
            };
            (raw_type, name)
        };

        let value = read_value(cur, tag_type, raw_type & EXTENDED_FLAG != 0)?;
        Ok(Self {
            tag_type,
            name,
            value,
        })
    }

    /// Append this tag in legacy form.
    pub fn encode_legacy(&self, out: &mut impl BufMut) {
        out.put_u8(self.value.legacy_type());
        match self.name {
            TagName::Compact(code) => {
                out.put_u16_le(1);
                out.put_u8(code);
            }
            TagName::Named(name) => {
                let name = &name[..name.len().min(u16::MAX as usize)];
                out.put_u16_le(name.len() as u16);
                out.put_slice(name);
            }
        }
        put_value(out, &self.value);
    }

    /// Append this tag in extended form. String-named tags have no extended
    /// form and are written in legacy form instead.
    pub fn encode_extended(&self, out: &mut impl BufMut) {
        let TagName::Compact(code) = self.name else {
            self.encode_legacy(out);
            return;
        };

        match self.value {
            TagValue::String(s) if (1..=16).contains(&s.len()) => {
                out.put_u8((TAG_STR1 + s.len() as u8 - 1) | EXTENDED_FLAG);
                out.put_u8(code);
                out.put_slice(s);
            }
            _ => {
                out.put_u8(self.value.legacy_type() | EXTENDED_FLAG);
                out.put_u8(code);
                put_value(out, &self.value);
            }
        }
    }
}

/// `STR1..STR16` only exist behind an extended header; a legacy header with
/// one of those types is unknown.
fn read_value<'a>(
    cur: &mut Cursor<'a>,
    tag_type: u8,
    extended: bool,
) -> Result<TagValue<'a>, ProtoError> {
    if extended && (TAG_STR1..=TAG_STR16).contains(&tag_type) {
        let len = (tag_type - TAG_STR1 + 1) as usize;
        return Ok(TagValue::String(cur.read_bytes(len)?));
    }

    let ty = TagType::from_repr(tag_type).ok_or(ProtoError::UnknownTagType(tag_type))?;
    let value = match ty {
        TagType::Hash => TagValue::Hash(cur.read_hash()?),
        TagType::String => {
            let len = cur.read_u16()? as usize;
            TagValue::String(cur.read_bytes(len)?)
        }
        TagType::UInt32 => TagValue::UInt32(cur.read_u32()?),
        TagType::Float32 => TagValue::Float(cur.read_f32()?),
        TagType::Bool => TagValue::Bool(cur.read_u8()? != 0),
        TagType::BoolArray => {
            let bits = cur.read_u16()? as usize;
            TagValue::Blob(cur.read_bytes(bits.div_ceil(8))?)
        }
        TagType::Blob => {
            let len = cur.read_u32()? as usize;
            TagValue::Blob(cur.read_bytes(len)?)
        }
        TagType::UInt16 => TagValue::UInt16(cur.read_u16()?),
        TagType::UInt8 => TagValue::UInt8(cur.read_u8()?),
        TagType::Bsob => {
            let len = cur.read_u8()? as usize;
            TagValue::Blob(cur.read_bytes(len)?)
        }
        TagType::UInt64 => TagValue::UInt64(cur.read_u64()?),
    };
    Ok(value)
}

fn put_value(out: &mut impl BufMut, value: &TagValue<'_>) {
    match *value {
        TagValue::Hash(h) => out.put_slice(&h),
        TagValue::String(s) => {
            let s = &s[..s.len().min(u16::MAX as usize)];
            out.put_u16_le(s.len() as u16);
            out.put_slice(s);
        }
        TagValue::UInt8(v) => out.put_u8(v),
        TagValue::UInt16(v) => out.put_u16_le(v),
        TagValue::UInt32(v) => out.put_u32_le(v),
        TagValue::UInt64(v) => out.put_u64_le(v),
        TagValue::Float(v) => out.put_f32_le(v),
        TagValue::Bool(v) => out.put_u8(v as u8),
        TagValue::Blob(b) => {
            let b = &b[..b.len().min(u32::MAX as usize)];
            out.put_u32_le(b.len() as u32);
            out.put_slice(b);
        }
    }
}

/// Lazily walks a tag list of a declared length.
///
/// Yields exactly `count` tags unless one fails to decode; after the first
/// error the iterator is fused. Callers that need the whole list must treat
/// any `Err` as fatal for the list.
pub struct TagList<'c, 'a> {
    cur: &'c mut Cursor<'a>,
    remaining: u32,
    allow_extended: bool,
}

impl<'c, 'a> TagList<'c, 'a> {
    /// Tag list of legacy tags only.
    pub fn new(cur: &'c mut Cursor<'a>, count: u32) -> Self {
        Self {
            cur,
            remaining: count,
            allow_extended: false,
        }
    }

    /// Tag list that also accepts extended tags.
    pub fn extended(cur: &'c mut Cursor<'a>, count: u32) -> Self {
        Self {
            cur,
            remaining: count,
            allow_extended: true,
        }
    }

    /// Read the `u32` tag count from the cursor, then walk that many legacy tags.
    pub fn read_counted(cur: &'c mut Cursor<'a>) -> Result<Self, ProtoError> {
        let count = cur.read_u32()?;
        Ok(Self::new(cur, count))
    }
}

impl<'a> Iterator for TagList<'_, 'a> {
    type Item = Result<Tag<'a>, ProtoError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining == 0 {
            return None;
        }
        match Tag::read(self.cur, self.allow_extended) {
            Ok(tag) => {
                self.remaining -= 1;
                Some(Ok(tag))
            }
            Err(e) => {
                self.remaining = 0;
                Some(Err(e))
            }
        }
    }
}

/// Keep at most `max` bytes of a string value. The wire bytes were already
/// consumed in full when the tag was read.
pub fn truncated_string(bytes: &[u8], max: usize) -> String {
    String::from_utf8_lossy(&bytes[..bytes.len().min(max)]).into_owned()
}
