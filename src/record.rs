//! Line record model and ordering.
//!
//! Every input line has the form `<number>. <text>`. Records are ordered by the text part first
//! (ordinal byte order, case-sensitive) and by the number when texts are equal.

use std::cmp::Ordering;
use std::error::Error;
use std::fmt;
use std::fmt::Display;

/// Separator between the numeric prefix and the text part of a line.
pub const SEPARATOR: &[u8] = b". ";

/// Record comparison function.
pub type CompareFn = for<'a, 'b> fn(&LineRecord<'a>, &LineRecord<'b>) -> Ordering;

/// Line grammar violation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordError {
    /// The line has no `". "` separator.
    MissingSeparator,
    /// The prefix before the separator is not a non-negative integer.
    InvalidNumber,
}

impl Error for RecordError {}

impl Display for RecordError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecordError::MissingSeparator => write!(f, "separator '. ' not found"),
            RecordError::InvalidNumber => write!(f, "prefix is not a non-negative integer"),
        }
    }
}

/// Borrowed view of a single line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LineRecord<'a> {
    raw: &'a [u8],
    key: &'a [u8],
    number: u64,
}

impl<'a> LineRecord<'a> {
    /// Parses a line without its terminator.
    pub fn parse(raw: &'a [u8]) -> Result<Self, RecordError> {
        let sep = find_separator(raw).ok_or(RecordError::MissingSeparator)?;
        let number = parse_number(&raw[..sep]).ok_or(RecordError::InvalidNumber)?;

        return Ok(LineRecord {
            raw,
            key: &raw[sep + SEPARATOR.len()..],
            number,
        });
    }

    /// Parses a line falling back to the whole line as the key and zero as the number.
    pub fn parse_lenient(raw: &'a [u8]) -> Self {
        LineRecord::parse(raw).unwrap_or(LineRecord { raw, key: raw, number: 0 })
    }

    /// Builds a record from already known key offset and number.
    pub(crate) fn from_parts(raw: &'a [u8], key_offset: usize, number: u64) -> Self {
        LineRecord {
            raw,
            key: &raw[key_offset..],
            number,
        }
    }

    /// Full line text.
    pub fn raw(&self) -> &'a [u8] {
        self.raw
    }

    /// Text part of the line.
    pub fn key(&self) -> &'a [u8] {
        self.key
    }

    /// Numeric prefix of the line.
    pub fn number(&self) -> u64 {
        self.number
    }

    /// Offset of the key inside the raw line.
    pub(crate) fn key_offset(&self) -> usize {
        self.raw.len() - self.key.len()
    }
}

/// Default record order: text ascending, then number ascending.
pub fn compare(a: &LineRecord<'_>, b: &LineRecord<'_>) -> Ordering {
    a.key.cmp(b.key).then(a.number.cmp(&b.number))
}

/// Compares two raw lines using the default record order.
/// Lines violating the grammar are compared as if the whole line were the text part with number zero.
pub fn compare_lines(a: &[u8], b: &[u8]) -> Ordering {
    compare(&LineRecord::parse_lenient(a), &LineRecord::parse_lenient(b))
}

/// Orders records by `compare` and breaks remaining ties by raw bytes,
/// so that equal-comparing but textually different lines always come out in the same order.
#[inline]
pub(crate) fn total_cmp(compare: CompareFn, a: &LineRecord<'_>, b: &LineRecord<'_>) -> Ordering {
    compare(a, b).then_with(|| a.raw.cmp(b.raw))
}

/// Strips the trailing `\n` and `\r` of a line read with `read_until`.
pub(crate) fn trim_line_end(mut line: &[u8]) -> &[u8] {
    if let [rest @ .., b'\n'] = line {
        line = rest;
    }
    if let [rest @ .., b'\r'] = line {
        line = rest;
    }
    line
}

fn find_separator(raw: &[u8]) -> Option<usize> {
    memchr::memmem::find(raw, SEPARATOR)
}

fn parse_number(digits: &[u8]) -> Option<u64> {
    if digits.is_empty() {
        return None;
    }

    let mut number: u64 = 0;
    for &byte in digits {
        if !byte.is_ascii_digit() {
            return None;
        }
        number = number.checked_mul(10)?.checked_add(u64::from(byte - b'0'))?;
    }

    return Some(number);
}

#[cfg(test)]
mod test {
    use std::cmp::Ordering;

    use rstest::*;

    use super::{compare, compare_lines, trim_line_end, LineRecord, RecordError};

    #[rstest]
    #[case(b"1. Apple", "Apple", 1)]
    #[case(b"30432. Something something something", "Something something something", 30432)]
    #[case(b"7. ", "", 7)]
    #[case(b"007. Mr. Smith", "Mr. Smith", 7)]
    #[case(b"18446744073709551615. max", "max", u64::MAX)]
    #[case("5. üçé Äpfel".as_bytes(), "üçé Äpfel", 5)]
    fn test_parse(#[case] line: &[u8], #[case] key: &str, #[case] number: u64) {
        let record = LineRecord::parse(line).unwrap();

        assert_eq!(record.raw(), line);
        assert_eq!(record.key(), key.as_bytes());
        assert_eq!(record.number(), number);
    }

    #[rstest]
    #[case(b"garbage-no-separator", RecordError::MissingSeparator)]
    #[case(b"", RecordError::MissingSeparator)]
    #[case(b"12.Apple", RecordError::MissingSeparator)]
    #[case(b". Apple", RecordError::InvalidNumber)]
    #[case(b"-1. Apple", RecordError::InvalidNumber)]
    #[case(b" 1. Apple", RecordError::InvalidNumber)]
    #[case(b"1.5. Apple", RecordError::InvalidNumber)]
    #[case(b"18446744073709551616. overflow", RecordError::InvalidNumber)]
    fn test_parse_malformed(#[case] line: &[u8], #[case] expected: RecordError) {
        assert_eq!(LineRecord::parse(line), Err(expected));
    }

    #[test]
    fn test_parse_lenient() {
        let record = LineRecord::parse_lenient(b"no number here");
        assert_eq!(record.key(), b"no number here");
        assert_eq!(record.number(), 0);

        let record = LineRecord::parse_lenient(b"3. three");
        assert_eq!(record.key(), b"three");
        assert_eq!(record.number(), 3);
    }

    #[rstest]
    #[case("1. Apple", "415. Apple", Ordering::Less)]
    #[case("415. Apple", "2. Banana is yellow", Ordering::Less)]
    #[case("100. Same Text", "10. Same Text", Ordering::Greater)]
    #[case("3. APPLE", "2. Apple", Ordering::Less)]
    #[case("4. aPPle", "1. apple", Ordering::Less)]
    #[case("2. Apple", "4. Apple#", Ordering::Less)]
    #[case("4. Apple#", "1. Apple!", Ordering::Greater)]
    #[case("9. ", "1. A", Ordering::Less)]
    #[case("1. ", "1. ", Ordering::Equal)]
    #[case("4. üçé Apple", "2. Äpfel", Ordering::Greater)]
    #[case("1. Apple", "4. üçé Apple", Ordering::Less)]
    fn test_compare(#[case] a: &str, #[case] b: &str, #[case] expected: Ordering) {
        let a = LineRecord::parse(a.as_bytes()).unwrap();
        let b = LineRecord::parse(b.as_bytes()).unwrap();

        assert_eq!(compare(&a, &b), expected);
        assert_eq!(compare(&b, &a), expected.reverse());
    }

    #[test]
    fn test_compare_lines_sorts_example() {
        let mut lines = vec![
            "415. Apple",
            "30432. Something something something",
            "1. Apple",
            "32. Cherry is the best",
            "2. Banana is yellow",
        ];
        lines.sort_by(|a, b| compare_lines(a.as_bytes(), b.as_bytes()));

        assert_eq!(
            lines,
            vec![
                "1. Apple",
                "415. Apple",
                "2. Banana is yellow",
                "32. Cherry is the best",
                "30432. Something something something",
            ]
        );
    }

    #[rstest]
    #[case(b"1. a\n", b"1. a")]
    #[case(b"1. a\r\n", b"1. a")]
    #[case(b"1. a", b"1. a")]
    #[case(b"\n", b"")]
    fn test_trim_line_end(#[case] line: &[u8], #[case] expected: &[u8]) {
        assert_eq!(trim_line_end(line), expected);
    }
}
