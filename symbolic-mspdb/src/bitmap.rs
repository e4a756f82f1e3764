use crate::cursor::ByteCursor;
use crate::error::Result;

/// A read-only set of bits, stored as a word count followed by that many 32-bit words.
///
/// The name index uses two of these to mark present and deleted hash slots.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct Bitmap {
    words: Vec<u32>,
}

impl Bitmap {
    pub(crate) fn parse(cursor: &mut ByteCursor) -> Result<Self> {
        let count = cursor.read_u32()? as usize;
        let words = cursor.read_u32_vec(count)?;
        Ok(Self { words })
    }

    /// Returns `true` if the bit at `index` is set. Indices beyond the stored words are unset.
    pub(crate) fn contains(&self, index: usize) -> bool {
        match self.words.get(index / 32) {
            Some(word) => word & (1 << (index % 32)) != 0,
            None => false,
        }
    }

    /// Returns `true` if no bit is set.
    pub(crate) fn is_empty(&self) -> bool {
        self.words.iter().all(|word| *word == 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bitmap(words: &[u32]) -> Bitmap {
        let mut bytes = (words.len() as u32).to_le_bytes().to_vec();
        for word in words {
            bytes.extend_from_slice(&word.to_le_bytes());
        }
        Bitmap::parse(&mut ByteCursor::from_vec(bytes)).unwrap()
    }

    #[test]
    fn test_membership() {
        let bits = bitmap(&[0b1010]);
        assert!(bits.contains(1));
        assert!(bits.contains(3));
        for index in [0, 2, 4, 5, 31] {
            assert!(!bits.contains(index), "bit {index} should be unset");
        }
        assert!(!bits.contains(32));
        assert!(!bits.contains(1000));
    }

    #[test]
    fn test_second_word() {
        let bits = bitmap(&[0, 1 << 31 | 1]);
        assert!(bits.contains(32));
        assert!(bits.contains(63));
        assert!(!bits.contains(31));
    }

    #[test]
    fn test_empty() {
        let bits = bitmap(&[]);
        assert!(bits.is_empty());
        assert!(!bits.contains(0));
    }

    #[test]
    fn test_zero_words_are_empty() {
        assert!(bitmap(&[0, 0]).is_empty());
        assert!(!bitmap(&[0, 4]).is_empty());
    }

    #[test]
    fn test_truncated_words() {
        let mut cursor = ByteCursor::from_vec(vec![2, 0, 0, 0, 1, 0, 0, 0]);
        assert!(Bitmap::parse(&mut cursor).is_err());
    }
}
