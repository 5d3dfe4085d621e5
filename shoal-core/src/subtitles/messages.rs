//! GET_SUBS and SUBS wire codec.

use std::collections::BTreeMap;

use super::{SubtitleError, languages};
use crate::bencode::{self, Value};
use crate::overlay::{MessageTag, frame};
use crate::torrent::{InfoHash, Permid, pack_u32_be, unpack_u32_be};

/// Request for the subtitles of `(channel, info_hash)` in the languages of `mask`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GetSubsMessage {
    pub channel: Permid,
    pub info_hash: InfoHash,
    pub mask: u32,
}

impl GetSubsMessage {
    /// Framed message ready for the overlay.
    pub fn encode(&self) -> Vec<u8> {
        let body = Value::List(vec![
            Value::bytes(self.channel.as_bytes()),
            Value::bytes(self.info_hash.as_bytes()),
            Value::bytes(pack_u32_be(self.mask)),
        ]);
        frame(MessageTag::GetSubs, &body)
    }

    /// Decodes a GET_SUBS body.
    ///
    /// # Errors
    ///
    /// - `SubtitleError::BadEncoding` - If the body is not bencode
    /// - `SubtitleError::Malformed` - If the body is not a 3-element list of strings
    /// - `SubtitleError::InvalidPermid` / `InvalidInfohash` / `InvalidBitmask` - On bad fields
    pub fn decode(body: &[u8]) -> Result<Self, SubtitleError> {
        let value = bencode::decode(body)?;
        let fields = value
            .as_list()
            .filter(|list| list.len() == 3)
            .ok_or_else(|| malformed("GET_SUBS is not a 3-element list"))?;
        let (channel, info_hash, mask) = header(fields)?;
        Ok(Self {
            channel,
            info_hash,
            mask,
        })
    }

    pub fn languages(&self) -> Vec<&'static str> {
        languages::codes_of(self.mask)
    }
}

/// Subtitle bundle answering a GET_SUBS.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubsMessage {
    pub channel: Permid,
    pub info_hash: InfoHash,
    /// Content by language code, iterated in bitmask order
    pub contents: BTreeMap<String, Vec<u8>>,
}

impl SubsMessage {
    pub fn new(channel: Permid, info_hash: InfoHash) -> Self {
        Self {
            channel,
            info_hash,
            contents: BTreeMap::new(),
        }
    }

    pub fn mask(&self) -> u32 {
        self.contents
            .keys()
            .filter_map(|code| languages::bit(code).ok())
            .fold(0, |mask, bit| mask | bit)
    }

    pub fn is_empty(&self) -> bool {
        self.contents.is_empty()
    }

    /// Framed message ready for the overlay. Unsupported languages are skipped.
    pub fn encode(&self) -> Vec<u8> {
        let payloads = self
            .contents
            .iter()
            .filter(|(code, _)| languages::is_supported(code))
            .map(|(_, content)| Value::bytes(content))
            .collect();
        let body = Value::List(vec![
            Value::bytes(self.channel.as_bytes()),
            Value::bytes(self.info_hash.as_bytes()),
            Value::bytes(pack_u32_be(self.mask())),
            Value::List(payloads),
        ]);
        frame(MessageTag::Subs, &body)
    }

    /// Decodes a SUBS body.
    ///
    /// # Errors
    ///
    /// - `SubtitleError::BadEncoding` - If the body is not bencode
    /// - `SubtitleError::Malformed` - If the shape is wrong or the payload count
    ///   does not match the bitmask
    /// - `SubtitleError::TooLarge` - If a payload exceeds `max_subtitle_size`
    /// - `SubtitleError::InvalidPermid` / `InvalidInfohash` / `InvalidBitmask` - On bad fields
    pub fn decode(body: &[u8], max_subtitle_size: usize) -> Result<Self, SubtitleError> {
        let value = bencode::decode(body)?;
        let list = value
            .as_list()
            .filter(|list| list.len() == 4)
            .ok_or_else(|| malformed("SUBS is not a 4-element list"))?;
        let (channel, info_hash, mask) = header(&list[..3])?;

        let payloads = list[3]
            .as_list()
            .ok_or_else(|| malformed("payloads is not a list"))?;
        let codes = languages::codes_of(mask);
        if codes.len() != payloads.len() {
            return Err(malformed("payload count does not match bitmask"));
        }

        let mut contents = BTreeMap::new();
        for (code, payload) in codes.into_iter().zip(payloads) {
            let payload = payload
                .as_bytes()
                .ok_or_else(|| malformed("payload is not a string"))?;
            if payload.len() > max_subtitle_size {
                return Err(SubtitleError::TooLarge {
                    size: payload.len(),
                    limit: max_subtitle_size,
                });
            }
            contents.insert(code.to_string(), payload.to_vec());
        }

        Ok(Self {
            channel,
            info_hash,
            contents,
        })
    }
}

/// Channel, infohash and bitmask leading both messages.
fn header(fields: &[Value]) -> Result<(Permid, InfoHash, u32), SubtitleError> {
    let fields = fields
        .iter()
        .map(|field| field.as_bytes().ok_or_else(|| malformed("field is not a string")))
        .collect::<Result<Vec<_>, _>>()?;
    let channel = Permid::from_slice(fields[0]).map_err(|_| SubtitleError::InvalidPermid {
        length: fields[0].len(),
    })?;
    let info_hash = InfoHash::try_from(fields[1]).map_err(|_| SubtitleError::InvalidInfohash {
        length: fields[1].len(),
    })?;
    let mask = unpack_u32_be(fields[2]).map_err(|_| SubtitleError::InvalidBitmask {
        length: fields[2].len(),
    })?;
    Ok((channel, info_hash, mask))
}

fn malformed(reason: &str) -> SubtitleError {
    SubtitleError::Malformed {
        reason: reason.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::overlay::split_frame;
    use crate::subtitles::MAX_SUBTITLE_SIZE;

    fn channel() -> Permid {
        Permid::from_slice(&[4; 32]).unwrap()
    }

    fn body(message: &[u8]) -> &[u8] {
        split_frame(message).unwrap().1
    }

    #[test]
    fn test_get_subs_wire_form() {
        let request = GetSubsMessage {
            channel: channel(),
            info_hash: InfoHash::new([1; 20]),
            mask: (1 << 6) | (1 << 13),
        };
        let message = request.encode();
        assert_eq!(message[0], MessageTag::GetSubs.as_byte());

        let decoded = GetSubsMessage::decode(body(&message)).unwrap();
        assert_eq!(decoded, request);
        assert_eq!(decoded.languages(), vec!["eng", "ita"]);
    }

    #[test]
    fn test_get_subs_rejects_bad_fields() {
        let encode = |fields: Vec<Value>| Value::List(fields).to_bytes();

        let short_hash = encode(vec![
            Value::bytes(channel().as_bytes()),
            Value::bytes([1u8; 19]),
            Value::bytes([0u8; 4]),
        ]);
        assert!(matches!(
            GetSubsMessage::decode(&short_hash),
            Err(SubtitleError::InvalidInfohash { length: 19 })
        ));

        let long_mask = encode(vec![
            Value::bytes(channel().as_bytes()),
            Value::bytes([1u8; 20]),
            Value::bytes([0u8; 5]),
        ]);
        assert!(matches!(
            GetSubsMessage::decode(&long_mask),
            Err(SubtitleError::InvalidBitmask { length: 5 })
        ));

        let empty_permid = encode(vec![
            Value::bytes(b""),
            Value::bytes([1u8; 20]),
            Value::bytes([0u8; 4]),
        ]);
        assert!(matches!(
            GetSubsMessage::decode(&empty_permid),
            Err(SubtitleError::InvalidPermid { length: 0 })
        ));

        assert!(matches!(
            GetSubsMessage::decode(b"i3e"),
            Err(SubtitleError::Malformed { .. })
        ));
        assert!(matches!(
            GetSubsMessage::decode(b"l3:abc"),
            Err(SubtitleError::BadEncoding(_))
        ));
    }

    #[test]
    fn test_subs_payloads_follow_bitmask_order() {
        let mut subs = SubsMessage::new(channel(), InfoHash::new([2; 20]));
        subs.contents.insert("nld".to_string(), b"dutch".to_vec());
        subs.contents.insert("eng".to_string(), b"english".to_vec());

        let message = subs.encode();
        let value = bencode::decode(body(&message)).unwrap();
        let payloads = value.as_list().unwrap()[3].as_list().unwrap();
        assert_eq!(payloads[0], Value::bytes(b"english"));
        assert_eq!(payloads[1], Value::bytes(b"dutch"));

        assert_eq!(SubsMessage::decode(body(&message), MAX_SUBTITLE_SIZE).unwrap(), subs);
    }

    #[test]
    fn test_subs_count_must_match_mask() {
        let body = Value::List(vec![
            Value::bytes(channel().as_bytes()),
            Value::bytes([2u8; 20]),
            Value::bytes(pack_u32_be(0b11)),
            Value::List(vec![Value::bytes(b"one")]),
        ])
        .to_bytes();

        assert!(matches!(
            SubsMessage::decode(&body, MAX_SUBTITLE_SIZE),
            Err(SubtitleError::Malformed { .. })
        ));
    }

    #[test]
    fn test_subs_payload_ceiling() {
        let mut subs = SubsMessage::new(channel(), InfoHash::new([2; 20]));
        subs.contents.insert("eng".to_string(), vec![b'x'; 11]);
        let message = subs.encode();

        assert!(matches!(
            SubsMessage::decode(body(&message), 10),
            Err(SubtitleError::TooLarge { size: 11, limit: 10 })
        ));
    }
}
