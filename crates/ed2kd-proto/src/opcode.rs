use strum::FromRepr;

/// Opcodes a client sends to the server on its primary connection.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromRepr)]
pub enum ClientOpcode {
    LoginRequest = 0x01,
    GetServerList = 0x14,
    OfferFiles = 0x15,
    SearchRequest = 0x16,
    GetSources = 0x19,
}

/// Opcodes the server sends back on a client's primary connection.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromRepr)]
pub enum ServerOpcode {
    IdChange = 0x40,
    FoundSources = 0x42,
}

/// Opcodes exchanged on the port-check link, where the server acts as a peer.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromRepr)]
pub enum PeerOpcode {
    Hello = 0x01,
    HelloAnswer = 0x4C,
}
