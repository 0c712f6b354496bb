use bytes::{BufMut, BytesMut};

use crate::{
    constants::{EDONKEY_VERSION, HASH_LEN},
    cursor::Cursor,
    error::ProtoError,
    messages::Message,
    opcode::PeerOpcode,
    tag::{Tag, TagList, TagName, TagValue, names},
};

/// Greeting the server sends when it connects back to a client.
///
/// Payload:
/// `[u8 hash_size=16][hash 16][u32 client_id][u16 port][u32 tag_count][tags...][u32 server_ip][u16 server_port]`.
/// The server writes its two tags (name, version) in extended form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Hello {
    pub hash: [u8; HASH_LEN],
    pub client_id: u32,
    pub port: u16,
    pub name: String,
    pub version: u32,
    pub server_ip: u32,
    pub server_port: u16,
}

impl Hello {
    pub fn decode(payload: &[u8]) -> Result<Self, ProtoError> {
        let mut cur = Cursor::new(payload);

        let hash_size = cur.read_u8()?;
        if hash_size as usize != HASH_LEN {
            return Err(ProtoError::BadHashSize(hash_size));
        }

        let mut hello = Self {
            hash: cur.read_hash()?,
            client_id: cur.read_u32()?,
            port: cur.read_u16()?,
            name: String::new(),
            version: 0,
            server_ip: 0,
            server_port: 0,
        };

        let tag_count = cur.read_u32()?;
        for tag in TagList::extended(&mut cur, tag_count) {
            let tag = tag?;
            match (tag.name, tag.value) {
                (TagName::Compact(names::NAME), TagValue::String(s)) => {
                    hello.name = String::from_utf8_lossy(s).into_owned();
                }
                (TagName::Compact(names::VERSION), TagValue::UInt8(v)) => hello.version = v.into(),
                (TagName::Compact(names::VERSION), TagValue::UInt16(v)) => hello.version = v.into(),
                (TagName::Compact(names::VERSION), TagValue::UInt32(v)) => hello.version = v,
                // Clients announce plenty of capability tags nobody here needs.
                _ => {}
            }
        }

        hello.server_ip = cur.read_u32()?;
        hello.server_port = cur.read_u16()?;
        Ok(hello)
    }
}

impl Message for Hello {
    fn opcode() -> u8 {
        PeerOpcode::Hello as u8
    }

    fn encode_payload(&self, out: &mut BytesMut) {
        out.put_u8(HASH_LEN as u8);
        out.put_slice(&self.hash);
        out.put_u32_le(self.client_id);
        out.put_u16_le(self.port);

        out.put_u32_le(2);
        Tag::compact(names::NAME, TagValue::String(self.name.as_bytes())).encode_extended(out);
        let version = u8::try_from(self.version)
            .map(TagValue::UInt8)
            .unwrap_or(TagValue::UInt32(self.version));
        Tag::compact(names::VERSION, version).encode_extended(out);

        out.put_u32_le(self.server_ip);
        out.put_u16_le(self.server_port);
    }
}

/// A client's answer to [`Hello`]. Only the leading hash matters to the
/// port-check; the rest of the payload is not inspected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HelloAnswer {
    pub hash: [u8; HASH_LEN],
}

impl HelloAnswer {
    pub fn decode(payload: &[u8]) -> Result<Self, ProtoError> {
        let mut cur = Cursor::new(payload);
        Ok(Self {
            hash: cur.read_hash()?,
        })
    }
}

impl Message for HelloAnswer {
    fn opcode() -> u8 {
        PeerOpcode::HelloAnswer as u8
    }

    /// Minimal answer: hash, zero id/port, no tags, no server address.
    fn encode_payload(&self, out: &mut BytesMut) {
        out.put_slice(&self.hash);
        out.put_u32_le(0);
        out.put_u16_le(0);
        out.put_u32_le(0);
        out.put_u32_le(0);
        out.put_u16_le(0);
    }
}

/// The server's own greeting for a port-check.
pub fn server_hello(hash: [u8; HASH_LEN], local_ip: u32, advertised_port: u16, name: &str) -> Hello {
    Hello {
        hash,
        client_id: local_ip,
        port: advertised_port,
        name: name.to_owned(),
        version: EDONKEY_VERSION,
        server_ip: 0,
        server_port: 0,
    }
}
