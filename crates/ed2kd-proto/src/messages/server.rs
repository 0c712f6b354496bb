use bytes::{BufMut, BytesMut};

use crate::{
    constants::{HASH_LEN, MAX_FOUND_SOURCES},
    cursor::Cursor,
    error::ProtoError,
    messages::Message,
    opcode::ServerOpcode,
};

/// Tells a client which id it got after the port-check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IdChange {
    pub client_id: u32,
}

impl IdChange {
    pub fn decode(payload: &[u8]) -> Result<Self, ProtoError> {
        Ok(Self {
            client_id: Cursor::new(payload).read_u32()?,
        })
    }
}

impl Message for IdChange {
    fn opcode() -> u8 {
        ServerOpcode::IdChange as u8
    }

    fn encode_payload(&self, out: &mut BytesMut) {
        out.put_u32_le(self.client_id);
    }
}

/// One source of a file: the owner's client id and listening port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Source {
    pub client_id: u32,
    pub port: u16,
}

/// Answer to `GetSources`: `[hash 16][u8 count][count * (u32 id, u16 port)]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FoundSources {
    pub hash: [u8; HASH_LEN],
    pub sources: Vec<Source>,
}

impl FoundSources {
    pub fn decode(payload: &[u8]) -> Result<Self, ProtoError> {
        let mut cur = Cursor::new(payload);
        let hash = cur.read_hash()?;
        let count = cur.read_u8()?;

        let sources = (0..count)
            .map(|_| {
                Ok(Source {
                    client_id: cur.read_u32()?,
                    port: cur.read_u16()?,
                })
            })
            .collect::<Result<Vec<_>, ProtoError>>()?;
        Ok(Self { hash, sources })
    }
}

impl Message for FoundSources {
    fn opcode() -> u8 {
        ServerOpcode::FoundSources as u8
    }

    /// Writes at most [`MAX_FOUND_SOURCES`] sources.
    fn encode_payload(&self, out: &mut BytesMut) {
        let sources = &self.sources[..self.sources.len().min(MAX_FOUND_SOURCES)];
        out.put_slice(&self.hash);
        out.put_u8(sources.len() as u8);
        for src in sources {
            out.put_u32_le(src.client_id);
            out.put_u16_le(src.port);
        }
    }
}
