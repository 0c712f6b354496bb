/// Protocol marker of a plain eDonkey frame.
pub const PROTO_EDONKEY: u8 = 0xE3;

/// Protocol marker of a zlib-packed frame.
/// Everything after the opcode byte is compressed.
pub const PROTO_PACKED: u8 = 0xD4;

/// Fixed frame header length in bytes: `[u8 protocol][u32 length_le]`.
///
/// `length` counts the opcode byte plus the payload, never the header itself.
pub const HEADER_LEN: usize = 5;

/// Protocol version a client must announce in its login tags.
pub const EDONKEY_VERSION: u32 = 0x3C;

/// Size of user and file hashes.
pub const HASH_LEN: usize = 16;

/// Longest nickname kept from a login. Longer values are truncated.
pub const MAX_NICK_LEN: usize = 255;

/// Longest file name kept from an offer. Longer values are truncated.
pub const MAX_FILENAME_LEN: usize = 255;

/// Upper bound of files accepted in a single `OfferFiles` request.
pub const MAX_OFFER_FILES: u32 = 200;

/// Port the server advertises to peers in its port-check greeting.
pub const DEFAULT_ADVERTISED_PORT: u16 = 4662;

/// Client id/port pair marking an offered file as a complete source.
pub const COMPLETE_SOURCE_ID: u32 = 0xFBFB_FBFB;
pub const COMPLETE_SOURCE_PORT: u16 = 0xFBFB;

/// Low ids are below this bound; anything at or above it is an IPv4 address.
pub const LOW_ID_LIMIT: u32 = 0x0100_0000;

/// Most sources listed in a single `FoundSources` answer.
pub const MAX_FOUND_SOURCES: usize = 255;
