//! Fixed-width integer packing for overlay bitmasks

use super::TorrentError;

/// Packs a language or have bitmask as 4 big-endian bytes.
pub fn pack_u32_be(value: u32) -> [u8; 4] {
    value.to_be_bytes()
}

/// Unpacks a 4-byte big-endian bitmask.
///
/// # Errors
///
/// - `TorrentError::InvalidBitmask` - If `bytes` is not exactly 4 bytes long
pub fn unpack_u32_be(bytes: &[u8]) -> Result<u32, TorrentError> {
    let raw: [u8; 4] = bytes
        .try_into()
        .map_err(|_| TorrentError::InvalidBitmask {
            length: bytes.len(),
        })?;
    Ok(u32::from_be_bytes(raw))
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    #[test]
    fn test_pack_is_big_endian() {
        assert_eq!(pack_u32_be(0x0000_2040), [0x00, 0x00, 0x20, 0x40]);
        assert_eq!(unpack_u32_be(&[0x80, 0, 0, 1]).unwrap(), 0x8000_0001);
    }

    #[test]
    fn test_unpack_rejects_wrong_width() {
        assert_eq!(
            unpack_u32_be(&[1, 2, 3]),
            Err(TorrentError::InvalidBitmask { length: 3 })
        );
        assert!(unpack_u32_be(&[0; 5]).is_err());
    }

    proptest! {
        #[test]
        fn pack_inverts_unpack(bytes in any::<[u8; 4]>()) {
            let value = unpack_u32_be(&bytes).unwrap();
            prop_assert_eq!(pack_u32_be(value), bytes);
        }
    }
}
