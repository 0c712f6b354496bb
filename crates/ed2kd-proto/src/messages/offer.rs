use bytes::{BufMut, BytesMut};

use crate::{
    constants::{COMPLETE_SOURCE_ID, COMPLETE_SOURCE_PORT, HASH_LEN, MAX_FILENAME_LEN, MAX_OFFER_FILES},
    cursor::Cursor,
    error::ProtoError,
    messages::Message,
    opcode::ClientOpcode,
    tag::{Tag, TagList, TagName, TagValue, names, truncated_string},
};

/// One entry of an `OfferFiles` request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OfferedFile {
    pub hash: [u8; HASH_LEN],
    pub client_id: u32,
    pub port: u16,
    /// At most [`MAX_FILENAME_LEN`] bytes of the announced name.
    pub name: String,
    pub size: u64,
    pub rating: u8,
    pub file_type: u8,
}

impl OfferedFile {
    /// The client marked itself as holding the whole file.
    pub fn is_complete_source(&self) -> bool {
        self.client_id == COMPLETE_SOURCE_ID && self.port == COMPLETE_SOURCE_PORT
    }

    fn decode(cur: &mut Cursor<'_>) -> Result<Self, ProtoError> {
        let mut file = Self {
            hash: cur.read_hash()?,
            client_id: cur.read_u32()?,
            port: cur.read_u16()?,
            ..Self::default()
        };

        for tag in TagList::read_counted(cur)? {
            let tag = tag?;
            match tag.name {
                TagName::Named(name) => check_media_tag(name, &tag)?,
                TagName::Compact(code) => file.apply_tag(code, &tag)?,
            }
        }

        Ok(file)
    }

    fn apply_tag(&mut self, code: u8, tag: &Tag<'_>) -> Result<(), ProtoError> {
        match (code, tag.value) {
            (names::FILENAME, TagValue::String(s)) => self.name = truncated_string(s, MAX_FILENAME_LEN),
            (names::FILESIZE, TagValue::UInt32(lo)) => {
                self.size = (self.size & !0xFFFF_FFFF) | u64::from(lo);
            }
            (names::FILESIZE_HI, TagValue::UInt32(hi)) => {
                self.size = (self.size & 0xFFFF_FFFF) | (u64::from(hi) << 32);
            }
            (names::FILERATING, TagValue::UInt32(v)) => self.rating = v as u8,
            (names::FILETYPE, TagValue::UInt32(v)) => self.file_type = v as u8,
            // Named file types ("Audio", "Video", ...) are accepted but not mapped.
            (names::FILETYPE, TagValue::String(_)) => {}
            (
                names::FILENAME
                | names::FILESIZE
                | names::FILESIZE_HI
                | names::FILERATING
                | names::FILETYPE,
                _,
            ) => return Err(tag.unexpected_type()),
            _ => return Err(tag.unknown_name()),
        }
        Ok(())
    }
}

/// Media tags are validated and dropped.
fn check_media_tag(name: &[u8], tag: &Tag<'_>) -> Result<(), ProtoError> {
    let ok = match name {
        names::MEDIA_LENGTH => matches!(tag.value, TagValue::UInt32(_) | TagValue::String(_)),
        names::MEDIA_BITRATE => matches!(tag.value, TagValue::UInt32(_)),
        names::MEDIA_CODEC => matches!(tag.value, TagValue::String(_)),
        _ => return Err(tag.unknown_name()),
    };
    if ok { Ok(()) } else { Err(tag.unexpected_type()) }
}

/// Files published by a client.
///
/// Payload: `[u32 count]` then `count` entries of
/// `[hash 16][u32 client_id][u16 port][u32 tag_count][tags...]`.
/// At most [`MAX_OFFER_FILES`] entries. Decoding is all or nothing.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OfferFiles {
    pub files: Vec<OfferedFile>,
}

impl OfferFiles {
    pub fn decode(payload: &[u8]) -> Result<Self, ProtoError> {
        let mut cur = Cursor::new(payload);

        let count = cur.read_u32()?;
        if count > MAX_OFFER_FILES {
            return Err(ProtoError::TooManyFiles(count));
        }

        let files = (0..count)
            .map(|_| OfferedFile::decode(&mut cur))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { files })
    }
}

impl Message for OfferFiles {
    fn opcode() -> u8 {
        ClientOpcode::OfferFiles as u8
    }

    fn encode_payload(&self, out: &mut BytesMut) {
        out.put_u32_le(self.files.len() as u32);
        for file in &self.files {
            out.put_slice(&file.hash);
            out.put_u32_le(file.client_id);
            out.put_u16_le(file.port);

            let mut tags = vec![
                Tag::compact(names::FILENAME, TagValue::String(file.name.as_bytes())),
                Tag::compact(names::FILESIZE, TagValue::UInt32(file.size as u32)),
            ];
            if file.size > u64::from(u32::MAX) {
                tags.push(Tag::compact(
                    names::FILESIZE_HI,
                    TagValue::UInt32((file.size >> 32) as u32),
                ));
            }
            if file.rating != 0 {
                tags.push(Tag::compact(names::FILERATING, TagValue::UInt32(file.rating.into())));
            }
            if file.file_type != 0 {
                tags.push(Tag::compact(names::FILETYPE, TagValue::UInt32(file.file_type.into())));
            }

            out.put_u32_le(tags.len() as u32);
            for tag in &tags {
                tag.encode_legacy(out);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    fn entry(hash: u8, tags: &[Tag<'_>]) -> Vec<u8> {
        let mut buf = vec![hash; HASH_LEN];
        buf.extend_from_slice(&0x0100_007Fu32.to_le_bytes());
        buf.extend_from_slice(&4662u16.to_le_bytes());
        buf.extend_from_slice(&(tags.len() as u32).to_le_bytes());
        for tag in tags {
            tag.encode_legacy(&mut buf);
        }
        buf
    }

    fn offer(entries: &[Vec<u8>]) -> Vec<u8> {
        let mut buf = (entries.len() as u32).to_le_bytes().to_vec();
        for e in entries {
            buf.extend_from_slice(e);
        }
        buf
    }

    fn named(entries: u32) -> Vec<u8> {
        let e = entry(1, &[Tag::compact(names::FILENAME, TagValue::String(b"a"))]);
        let mut buf = entries.to_le_bytes().to_vec();
        for _ in 0..entries {
            buf.extend_from_slice(&e);
        }
        buf
    }

    #[test]
    fn encoded_offer_decodes_back() {
        let msg = OfferFiles {
            files: vec![
                OfferedFile {
                    hash: [3; 16],
                    client_id: 0x0100_007F,
                    port: 4662,
                    name: "movie.avi".into(),
                    size: 0x1_2345_6789,
                    rating: 4,
                    file_type: 2,
                },
                OfferedFile {
                    hash: [4; 16],
                    name: "song.mp3".into(),
                    size: 3_000_000,
                    ..OfferedFile::default()
                },
            ],
        };
        let mut payload = BytesMut::new();
        msg.encode_payload(&mut payload);

        assert_eq!(OfferFiles::decode(&payload).unwrap(), msg);
    }

    #[test]
    fn two_hundred_files_is_the_limit() {
        assert_eq!(OfferFiles::decode(&named(200)).unwrap().files.len(), 200);

        let err = OfferFiles::decode(&named(201)).unwrap_err();
        assert!(matches!(err, ProtoError::TooManyFiles(201)));
        assert_eq!(err.kind(), ErrorKind::Malformed);
    }

    #[test]
    fn size_halves_combine_in_any_order() {
        let buf = offer(&[entry(
            1,
            &[
                Tag::compact(names::FILESIZE_HI, TagValue::UInt32(2)),
                Tag::compact(names::FILESIZE, TagValue::UInt32(5)),
            ],
        )]);
        assert_eq!(OfferFiles::decode(&buf).unwrap().files[0].size, (2 << 32) | 5);
    }

    #[test]
    fn media_tags_are_skipped() {
        let buf = offer(&[entry(
            1,
            &[
                Tag::new(TagName::Named(names::MEDIA_LENGTH), TagValue::UInt32(300)),
                Tag::new(TagName::Named(names::MEDIA_LENGTH), TagValue::String(b"5:00")),
                Tag::new(TagName::Named(names::MEDIA_BITRATE), TagValue::UInt32(128)),
                Tag::new(TagName::Named(names::MEDIA_CODEC), TagValue::String(b"mp3")),
                Tag::compact(names::FILENAME, TagValue::String(b"x.mp3")),
            ],
        )]);
        let files = OfferFiles::decode(&buf).unwrap().files;
        assert_eq!(files[0].name, "x.mp3");
    }

    #[test]
    fn mistyped_media_tags_are_malformed() {
        for tag in [
            Tag::new(TagName::Named(names::MEDIA_LENGTH), TagValue::UInt16(1)),
            Tag::new(TagName::Named(names::MEDIA_BITRATE), TagValue::String(b"128")),
            Tag::new(TagName::Named(names::MEDIA_CODEC), TagValue::UInt32(1)),
        ] {
            let buf = offer(&[entry(1, &[tag])]);
            assert!(matches!(
                OfferFiles::decode(&buf),
                Err(ProtoError::UnexpectedTagType { .. })
            ));
        }
    }

    #[test]
    fn inline_string_types_are_malformed_in_offers() {
        let mut name = entry(1, &[]);
        name.truncate(name.len() - 4);
        name.extend_from_slice(&1u32.to_le_bytes());
        name.extend_from_slice(&[0x12, 0x01, 0x00, names::FILENAME, b'a', b'b']);
        assert!(matches!(
            OfferFiles::decode(&offer(&[name])),
            Err(ProtoError::UnknownTagType(0x12))
        ));

        let mut codec = entry(1, &[]);
        codec.truncate(codec.len() - 4);
        codec.extend_from_slice(&1u32.to_le_bytes());
        codec.push(0x13);
        codec.extend_from_slice(&(names::MEDIA_CODEC.len() as u16).to_le_bytes());
        codec.extend_from_slice(names::MEDIA_CODEC);
        codec.extend_from_slice(b"mp3");
        assert!(matches!(
            OfferFiles::decode(&offer(&[codec])),
            Err(ProtoError::UnknownTagType(0x13))
        ));
    }

    #[test]
    fn unknown_string_name_is_malformed() {
        let buf = offer(&[entry(
            1,
            &[Tag::new(TagName::Named(b"artist"), TagValue::String(b"x"))],
        )]);
        assert!(matches!(
            OfferFiles::decode(&buf),
            Err(ProtoError::UnknownTagName(_))
        ));
    }

    #[test]
    fn string_file_type_is_consumed_but_not_recorded() {
        let buf = offer(&[entry(
            1,
            &[
                Tag::compact(names::FILETYPE, TagValue::String(b"Audio")),
                Tag::compact(names::FILERATING, TagValue::UInt32(3)),
            ],
        )]);
        let file = &OfferFiles::decode(&buf).unwrap().files[0];
        assert_eq!(file.file_type, 0);
        assert_eq!(file.rating, 3);
    }

    #[test]
    fn long_name_is_truncated_and_next_tag_still_parses() {
        let long = vec![b'f'; MAX_FILENAME_LEN + 40];
        let buf = offer(&[entry(
            1,
            &[
                Tag::compact(names::FILENAME, TagValue::String(&long)),
                Tag::compact(names::FILESIZE, TagValue::UInt32(77)),
            ],
        )]);
        let file = &OfferFiles::decode(&buf).unwrap().files[0];
        assert_eq!(file.name.len(), MAX_FILENAME_LEN);
        assert_eq!(file.size, 77);
    }

    #[test]
    fn complete_source_sentinel_is_recognized() {
        let mut buf = 1u32.to_le_bytes().to_vec();
        buf.extend_from_slice(&[9u8; HASH_LEN]);
        buf.extend_from_slice(&COMPLETE_SOURCE_ID.to_le_bytes());
        buf.extend_from_slice(&COMPLETE_SOURCE_PORT.to_le_bytes());
        buf.extend_from_slice(&0u32.to_le_bytes());

        let files = OfferFiles::decode(&buf).unwrap().files;
        assert!(files[0].is_complete_source());
    }

    #[test]
    fn failure_in_a_later_entry_rejects_the_whole_offer() {
        let good = entry(1, &[Tag::compact(names::FILENAME, TagValue::String(b"ok"))]);
        let bad = entry(2, &[Tag::compact(0x77, TagValue::UInt32(1))]);
        assert!(OfferFiles::decode(&offer(&[good, bad])).is_err());
    }
}
