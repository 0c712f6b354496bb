use bytes::{Bytes, BytesMut};

use crate::{
    codec::encode_frame,
    error::ProtoError,
    opcode::{ClientOpcode, PeerOpcode},
};

pub mod login;
pub mod offer;
pub mod peer;
pub mod server;

pub use login::LoginRequest;
pub use offer::{OfferFiles, OfferedFile};
pub use peer::{Hello, HelloAnswer};
pub use server::{FoundSources, IdChange, Source};

/// A message with a fixed opcode and a hand-written payload layout.
pub trait Message {
    /// Opcode byte written right after the frame header.
    fn opcode() -> u8;

    /// Append the payload (everything after the opcode) to `out`.
    fn encode_payload(&self, out: &mut BytesMut);
}

/// Encode a message into a plain frame.
pub fn encode_message<T: Message>(msg: &T) -> Bytes {
    let mut payload = BytesMut::new();
    msg.encode_payload(&mut payload);
    encode_frame(T::opcode(), &payload)
}

/// A request received on a client's primary connection.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientRequest {
    Login(LoginRequest),
    OfferFiles(OfferFiles),
    /// Raw query, handed to the found-sources responder as is.
    GetSources(Bytes),
    GetServerList,
    Search,
}

/// Decode a primary-connection packet. Unknown opcodes are malformed.
pub fn decode_client_request(opcode: u8, payload: &Bytes) -> Result<ClientRequest, ProtoError> {
    let op = ClientOpcode::from_repr(opcode).ok_or(ProtoError::UnknownOpcode(opcode))?;
    let req = match op {
        ClientOpcode::LoginRequest => ClientRequest::Login(LoginRequest::decode(payload)?),
        ClientOpcode::OfferFiles => ClientRequest::OfferFiles(OfferFiles::decode(payload)?),
        ClientOpcode::GetSources => ClientRequest::GetSources(payload.clone()),
        ClientOpcode::GetServerList => ClientRequest::GetServerList,
        ClientOpcode::SearchRequest => ClientRequest::Search,
    };
    Ok(req)
}

/// A packet received on the port-check link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerMessage {
    HelloAnswer(HelloAnswer),
    /// Any other opcode. The port-check skips these.
    Ignored(u8),
}

pub fn decode_peer_message(opcode: u8, payload: &[u8]) -> Result<PeerMessage, ProtoError> {
    match PeerOpcode::from_repr(opcode) {
        Some(PeerOpcode::HelloAnswer) => Ok(PeerMessage::HelloAnswer(HelloAnswer::decode(payload)?)),
        _ => Ok(PeerMessage::Ignored(opcode)),
    }
}
