//! Binary formats shared by the coverage pass and the coverage runtime
//!
//! Both artifacts produced by the toolchain are streams of 4-byte
//! little-endian words:
//!
//! - the **report file** written by the runtime: delta records of fired
//!   block indices, followed by a block-to-name-id table and a name
//!   dictionary, separated by magic markers;
//! - the **notes file** written by the pass: one sidecar per compilation
//!   unit mapping source file -> function -> block -> source lines.
//!
//! Strings are length-prefixed in words (`len / 4 + 1`), padded with NUL
//! bytes to the next word boundary, so a reader can skip any entry without
//! a schema and the final payload byte is always NUL.
//!
//! The encoding half is used by the producers; the decoding half is test
//! tooling for the sibling crates (the full offline analyzer lives
//! elsewhere).

use thiserror::Error;

/// Marks the start of one `test_finished` delta record.
pub const MAGIC_TEST_ENTRY: u32 = 0xFEFE_FEAA;
/// Marks the start of the block-index -> name-id table.
pub const MAGIC_NAME_INDICES: u32 = 0xFEFE_FEAB;
/// Marks the start of the name dictionary.
pub const MAGIC_NAMES: u32 = 0xFEFE_FEAC;
/// Marks the start of one compilation-unit entry in a notes file.
pub const MAGIC_NOTES_UNIT: u32 = 0xFEFE_FEAD;

/// Result type alias for decoding operations.
pub type FormatResult<T> = Result<T, FormatError>;

/// Decoding failures.
#[derive(Debug, Error)]
pub enum FormatError {
    #[error("input truncated at word {offset}")]
    Truncated { offset: usize },

    #[error("expected magic {expected:#010x}, found {found:#010x}")]
    BadMagic { expected: u32, found: u32 },

    #[error("string payload is not valid UTF-8")]
    Utf8,
}

/// Encode `bytes` as a length-prefixed, NUL-padded word sequence.
///
/// The prefix is `len / 4 + 1` words; the payload is followed by
/// `4 - len % 4` NUL bytes, so the total is exactly the advertised word
/// count and the last byte is always NUL.
pub fn string_words(bytes: &[u8]) -> Vec<u32> {
    let len_words = bytes.len() / 4 + 1;
    let mut padded = Vec::with_capacity(len_words * 4);
    padded.extend_from_slice(bytes);
    padded.resize(len_words * 4, 0);

    let mut words = Vec::with_capacity(len_words + 1);
    words.push(len_words as u32);
    for chunk in padded.chunks_exact(4) {
        words.push(u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]));
    }
    words
}

/// Append an encoded string to a word buffer.
pub fn push_string(words: &mut Vec<u32>, bytes: &[u8]) {
    words.extend(string_words(bytes));
}

/// Serialize a word buffer to little-endian bytes.
pub fn words_to_bytes(words: &[u32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(words.len() * 4);
    for word in words {
        bytes.extend_from_slice(&word.to_le_bytes());
    }
    bytes
}

/// Sequential word/string reader over an encoded byte buffer.
pub struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    /// Words still available.
    pub fn remaining(&self) -> usize {
        (self.buf.len() - self.pos) / 4
    }

    /// Next word without consuming it.
    pub fn peek(&self) -> Option<u32> {
        let bytes = self.buf.get(self.pos..self.pos + 4)?;
        Some(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    pub fn word(&mut self) -> FormatResult<u32> {
        let word = self.peek().ok_or(FormatError::Truncated {
            offset: self.pos / 4,
        })?;
        self.pos += 4;
        Ok(word)
    }

    pub fn expect(&mut self, magic: u32) -> FormatResult<()> {
        let found = self.word()?;
        if found != magic {
            return Err(FormatError::BadMagic {
                expected: magic,
                found,
            });
        }
        Ok(())
    }

    /// Read a length-prefixed string, trimming the NUL padding.
    pub fn string(&mut self) -> FormatResult<String> {
        let len_words = self.word()? as usize;
        let end = self.pos + len_words * 4;
        let payload = self.buf.get(self.pos..end).ok_or(FormatError::Truncated {
            offset: self.pos / 4,
        })?;
        self.pos = end;
        let trimmed = match payload.iter().rposition(|b| *b != 0) {
            Some(last) => &payload[..=last],
            None => &[],
        };
        String::from_utf8(trimmed.to_vec()).map_err(|_| FormatError::Utf8)
    }
}

/// Decoded report file.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct Report {
    /// One entry per `test_finished` call, each the ascending list of
    /// newly-fired block indices.
    pub tests: Vec<Vec<u32>>,
    /// Name id assigned to each block index.
    pub block_name_ids: Vec<u32>,
    /// Dictionary of `(name id, function name)` in first-seen order.
    pub names: Vec<(u32, String)>,
}

/// Decode a report file: `TestRecord* NamesIndices NamesDictionary`.
///
/// Tolerates the single trailing zero word left by the shutdown
/// truncation rule.
pub fn parse_report(bytes: &[u8]) -> FormatResult<Report> {
    let mut reader = Reader::new(bytes);
    let mut report = Report::default();

    let mut current: Option<Vec<u32>> = None;
    loop {
        let word = reader.word()?;
        match word {
            MAGIC_TEST_ENTRY => {
                if let Some(record) = current.take() {
                    report.tests.push(record);
                }
                current = Some(Vec::new());
            }
            MAGIC_NAME_INDICES => {
                if let Some(record) = current.take() {
                    report.tests.push(record);
                }
                break;
            }
            index => match current.as_mut() {
                Some(record) => record.push(index),
                None => {
                    return Err(FormatError::BadMagic {
                        expected: MAGIC_TEST_ENTRY,
                        found: index,
                    })
                }
            },
        }
    }

    loop {
        let word = reader.word()?;
        if word == MAGIC_NAMES {
            break;
        }
        report.block_name_ids.push(word);
    }

    while reader.remaining() >= 2 {
        let id = reader.word()?;
        let name = reader.string()?;
        report.names.push((id, name));
    }

    Ok(report)
}

/// One compilation-unit entry of a notes file.
#[derive(Debug, PartialEq, Eq)]
pub struct NotesUnit {
    pub source: String,
    pub functions: Vec<NotesFunction>,
}

/// Per-function block line sets, in block-index order.
#[derive(Debug, PartialEq, Eq)]
pub struct NotesFunction {
    pub name: String,
    pub blocks: Vec<Vec<u32>>,
}

/// Decode a notes file: a sequence of magic-prefixed CU entries.
pub fn parse_notes(bytes: &[u8]) -> FormatResult<Vec<NotesUnit>> {
    let mut reader = Reader::new(bytes);
    let mut units = Vec::new();

    while reader.remaining() > 0 {
        reader.expect(MAGIC_NOTES_UNIT)?;
        let source = reader.string()?;
        let func_count = reader.word()?;
        let mut functions = Vec::with_capacity(func_count as usize);
        for _ in 0..func_count {
            let name = reader.string()?;
            let block_count = reader.word()?;
            let mut blocks = Vec::with_capacity(block_count as usize);
            for _ in 0..block_count {
                let line_count = reader.word()?;
                let mut lines = Vec::with_capacity(line_count as usize);
                for _ in 0..line_count {
                    lines.push(reader.word()?);
                }
                blocks.push(lines);
            }
            functions.push(NotesFunction { name, blocks });
        }
        units.push(NotesUnit { source, functions });
    }

    Ok(units)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn string_words_pads_to_word_boundary() {
        // len % 4 == 0 still gets a full word of padding
        assert_eq!(string_words(b""), vec![1, 0]);
        assert_eq!(string_words(b"abcd"), vec![2, u32::from_le_bytes(*b"abcd"), 0]);

        // shorter remainders pad with NULs
        assert_eq!(string_words(b"a"), vec![1, u32::from_le_bytes([b'a', 0, 0, 0])]);
        assert_eq!(
            string_words(b"abc"),
            vec![1, u32::from_le_bytes([b'a', b'b', b'c', 0])]
        );
    }

    #[test]
    fn string_words_final_byte_is_nul() {
        for len in 0..9 {
            let input: Vec<u8> = (0..len).map(|i| b'a' + i).collect();
            let words = string_words(&input);
            assert_eq!(words[0] as usize, input.len() / 4 + 1);
            let bytes = words_to_bytes(&words[1..]);
            assert_eq!(*bytes.last().unwrap(), 0, "len {len}");
        }
    }

    #[test]
    fn string_roundtrip() {
        for name in ["", "f", "main", "_ZN4blog3fooEv", "a_rather_long_symbol_name"] {
            let mut words = Vec::new();
            push_string(&mut words, name.as_bytes());
            let bytes = words_to_bytes(&words);
            let mut reader = Reader::new(&bytes);
            assert_eq!(reader.string().unwrap(), name);
            assert_eq!(reader.remaining(), 0);
        }
    }

    #[test]
    fn parse_report_roundtrip() {
        let mut words = vec![MAGIC_TEST_ENTRY, 0, 2, 5, MAGIC_TEST_ENTRY, MAGIC_NAME_INDICES];
        words.extend([0, 0, 1]);
        words.push(MAGIC_NAMES);
        words.push(0);
        push_string(&mut words, b"main");
        words.push(1);
        push_string(&mut words, b"foo");
        // trailing zero word, as left behind by the shutdown truncation rule
        words.push(0);

        let report = parse_report(&words_to_bytes(&words)).unwrap();
        assert_eq!(report.tests, vec![vec![0, 2, 5], vec![]]);
        assert_eq!(report.block_name_ids, vec![0, 0, 1]);
        assert_eq!(
            report.names,
            vec![(0, "main".to_string()), (1, "foo".to_string())]
        );
    }

    #[test]
    fn parse_report_without_tests() {
        let mut words = vec![MAGIC_NAME_INDICES, 0, MAGIC_NAMES, 0];
        push_string(&mut words, b"lonely");
        let report = parse_report(&words_to_bytes(&words)).unwrap();
        assert!(report.tests.is_empty());
        assert_eq!(report.block_name_ids, vec![0]);
        assert_eq!(report.names, vec![(0, "lonely".to_string())]);
    }

    #[test]
    fn parse_report_rejects_stray_leading_word() {
        let words = [7, MAGIC_NAME_INDICES, MAGIC_NAMES];
        let err = parse_report(&words_to_bytes(&words)).unwrap_err();
        assert!(matches!(err, FormatError::BadMagic { found: 7, .. }));
    }

    #[test]
    fn non_utf8_payload_is_rejected() {
        let mut words = Vec::new();
        push_string(&mut words, &[0xFF, 0xFE, b'a']);
        let bytes = words_to_bytes(&words);
        let mut reader = Reader::new(&bytes);
        let err = reader.string().unwrap_err();
        assert!(matches!(err, FormatError::Utf8));
    }

    #[test]
    fn parse_notes_roundtrip() {
        let mut words = vec![MAGIC_NOTES_UNIT];
        push_string(&mut words, b"lib.c");
        words.push(2); // two functions
        push_string(&mut words, b"foo");
        words.extend([2, 2, 10, 11, 0]); // two blocks: lines {10,11}, {}
        push_string(&mut words, b"bar");
        words.extend([1, 1, 42]);

        let units = parse_notes(&words_to_bytes(&words)).unwrap();
        assert_eq!(units.len(), 1);
        assert_eq!(units[0].source, "lib.c");
        assert_eq!(units[0].functions.len(), 2);
        assert_eq!(units[0].functions[0].name, "foo");
        assert_eq!(units[0].functions[0].blocks, vec![vec![10, 11], vec![]]);
        assert_eq!(units[0].functions[1].name, "bar");
        assert_eq!(units[0].functions[1].blocks, vec![vec![42]]);
    }

    #[test]
    fn truncated_input_reports_offset() {
        let words = [MAGIC_TEST_ENTRY, 3];
        let err = parse_report(&words_to_bytes(&words)).unwrap_err();
        assert!(matches!(err, FormatError::Truncated { offset: 2 }));
    }
}
