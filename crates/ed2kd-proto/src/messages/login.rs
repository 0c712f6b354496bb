use bytes::{BufMut, BytesMut};

use crate::{
    constants::{EDONKEY_VERSION, HASH_LEN, MAX_NICK_LEN},
    cursor::Cursor,
    error::ProtoError,
    messages::Message,
    opcode::ClientOpcode,
    tag::{Tag, TagList, TagName, TagValue, names, truncated_string},
};

/// Client login.
///
/// Payload: `[hash 16][u32 legacy id][u16 port][u32 tag_count][tags...]`.
/// Only compact-named legacy tags are allowed in the list. The port tag, when
/// present, overrides the port field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoginRequest {
    pub user_hash: [u8; HASH_LEN],
    pub port: u16,
    /// At most [`MAX_NICK_LEN`] bytes of the announced name.
    pub nick: String,
    pub server_flags: u32,
    pub emule_version: u32,
}

impl LoginRequest {
    pub fn decode(payload: &[u8]) -> Result<Self, ProtoError> {
        let mut cur = Cursor::new(payload);

        let user_hash = cur.read_hash()?;
        cur.skip(4)?;
        let mut login = Self {
            user_hash,
            port: cur.read_u16()?,
            nick: String::new(),
            server_flags: 0,
            emule_version: 0,
        };

        for tag in TagList::read_counted(&mut cur)? {
            let tag = tag?;
            let TagName::Compact(code) = tag.name else {
                return Err(tag.unknown_name());
            };

            match (code, tag.value) {
                (names::NAME, TagValue::String(s)) => login.nick = truncated_string(s, MAX_NICK_LEN),
                (names::PORT, TagValue::UInt16(port)) => login.port = port,
                (names::VERSION, TagValue::UInt32(v)) => {
                    if v != EDONKEY_VERSION {
                        return Err(ProtoError::UnsupportedVersion(v));
                    }
                }
                (names::SERVER_FLAGS, TagValue::UInt32(v)) => login.server_flags = v,
                (names::EMULE_VERSION, TagValue::UInt32(v)) => login.emule_version = v,
                (
                    names::NAME
                    | names::PORT
                    | names::VERSION
                    | names::SERVER_FLAGS
                    | names::EMULE_VERSION,
                    _,
                ) => return Err(tag.unexpected_type()),
                _ => return Err(tag.unknown_name()),
            }
        }

        Ok(login)
    }
}

impl Message for LoginRequest {
    fn opcode() -> u8 {
        ClientOpcode::LoginRequest as u8
    }

    fn encode_payload(&self, out: &mut BytesMut) {
        out.put_slice(&self.user_hash);
        out.put_u32_le(0);
        out.put_u16_le(self.port);

        let tags = [
            Tag::compact(names::NAME, TagValue::String(self.nick.as_bytes())),
            Tag::compact(names::VERSION, TagValue::UInt32(EDONKEY_VERSION)),
            Tag::compact(names::PORT, TagValue::UInt16(self.port)),
            Tag::compact(names::SERVER_FLAGS, TagValue::UInt32(self.server_flags)),
            Tag::compact(names::EMULE_VERSION, TagValue::UInt32(self.emule_version)),
        ];
        out.put_u32_le(tags.len() as u32);
        for tag in &tags {
            tag.encode_legacy(out);
        }
    }
}
