//! Supported subtitle languages and the 32-bit language bitmask.
//!
//! Bit `i` (least significant first) stands for the `i`-th code in
//! lexicographic order. The table below is kept sorted so the index of a
//! code is its bit.

use super::SubtitleError;

/// ISO 639-2 codes with English names, sorted by code.
pub const LANGUAGES: [(&str, &str); 32] = [
    ("ara", "Arabic"),
    ("ben", "Bengali"),
    ("ces", "Czech"),
    ("dan", "Danish"),
    ("deu", "German"),
    ("ell", "Greek"),
    ("eng", "English"),
    ("fas", "Persian"),
    ("fin", "Finnish"),
    ("fra", "French"),
    ("hin", "Hindi"),
    ("hrv", "Croatian"),
    ("hun", "Hungarian"),
    ("ita", "Italian"),
    ("jav", "Javanese"),
    ("jpn", "Japanese"),
    ("kor", "Korean"),
    ("lit", "Lithuanian"),
    ("msa", "Malay"),
    ("nld", "Dutch"),
    ("pan", "Panjabi"),
    ("pol", "Polish"),
    ("por", "Portuguese"),
    ("ron", "Romanian"),
    ("rus", "Russian"),
    ("spa", "Spanish"),
    ("srp", "Serbian"),
    ("swe", "Swedish"),
    ("tur", "Turkish"),
    ("ukr", "Ukrainian"),
    ("vie", "Vietnamese"),
    ("zho", "Chinese"),
];

/// Bit index of `code`, if supported.
pub fn index_of(code: &str) -> Option<usize> {
    LANGUAGES
        .binary_search_by(|(candidate, _)| (*candidate).cmp(code))
        .ok()
}

pub fn is_supported(code: &str) -> bool {
    index_of(code).is_some()
}

/// English name of `code`.
pub fn name_of(code: &str) -> Option<&'static str> {
    index_of(code).map(|index| LANGUAGES[index].1)
}

/// Single-bit mask of `code`.
///
/// # Errors
///
/// - `SubtitleError::UnsupportedLanguage` - If `code` is not in the table
pub fn bit(code: &str) -> Result<u32, SubtitleError> {
    index_of(code)
        .map(|index| 1u32 << index)
        .ok_or_else(|| SubtitleError::UnsupportedLanguage {
            code: code.to_string(),
        })
}

/// Mask with the bits of all `codes` set.
///
/// # Errors
///
/// - `SubtitleError::UnsupportedLanguage` - If any code is not in the table
pub fn mask_of<'a>(codes: impl IntoIterator<Item = &'a str>) -> Result<u32, SubtitleError> {
    codes
        .into_iter()
        .try_fold(0u32, |mask, code| Ok(mask | bit(code)?))
}

/// Codes whose bits are set in `mask`, in bit order.
pub fn codes_of(mask: u32) -> Vec<&'static str> {
    LANGUAGES
        .iter()
        .enumerate()
        .filter(|(index, _)| mask & (1u32 << index) != 0)
        .map(|(_, (code, _))| *code)
        .collect()
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    #[test]
    fn test_table_is_sorted() {
        assert!(LANGUAGES.windows(2).all(|pair| pair[0].0 < pair[1].0));
    }

    #[test]
    fn test_known_bits() {
        assert_eq!(bit("ara").unwrap(), 1);
        assert_eq!(bit("eng").unwrap(), 1 << 6);
        assert_eq!(bit("ita").unwrap(), 1 << 13);
        assert_eq!(bit("nld").unwrap(), 1 << 19);
        assert_eq!(bit("zho").unwrap(), 1 << 31);
        assert_eq!(name_of("nld"), Some("Dutch"));
    }

    #[test]
    fn test_unsupported_code() {
        assert!(matches!(
            mask_of(["eng", "xyz"]),
            Err(SubtitleError::UnsupportedLanguage { code }) if code == "xyz"
        ));
        assert!(!is_supported("en"));
    }

    #[test]
    fn test_codes_in_bit_order() {
        let mask = mask_of(["nld", "eng", "ita"]).unwrap();
        assert_eq!(codes_of(mask), vec!["eng", "ita", "nld"]);
        assert!(codes_of(0).is_empty());
    }

    proptest! {
        #[test]
        fn prop_mask_codes_mask_is_identity(mask in any::<u32>()) {
            let codes = codes_of(mask);
            prop_assert_eq!(codes.len() as u32, mask.count_ones());
            prop_assert_eq!(mask_of(codes).unwrap(), mask);
        }
    }
}
