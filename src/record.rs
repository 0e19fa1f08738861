/// One unit of work flowing from a source to the sink.
///
/// The value is an opaque payload (usually one trimmed line of text) and the
/// key is an optional attribution tag. Records are never mutated after the
/// tailer builds them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub key: Option<Vec<u8>>,
    pub value: Vec<u8>,
}

impl Record {
    pub fn new(key: Option<Vec<u8>>, value: impl Into<Vec<u8>>) -> Self {
        Self {
            key,
            value: value.into(),
        }
    }

    /// A record with only a value and no key.
    pub fn value(value: impl Into<Vec<u8>>) -> Self {
        Self::new(None, value)
    }

    /// Build a record from one raw line, trimming surrounding whitespace.
    ///
    /// UTF-8 lines lose Unicode whitespace too (NBSP, U+2028, ...); other
    /// bytes only lose ASCII whitespace.
    pub fn from_line(key: Option<&[u8]>, line: &[u8]) -> Self {
        let value = match std::str::from_utf8(line) {
            Ok(text) => text.trim().as_bytes(),
            Err(_) => line.trim_ascii(),
        };
        Self::new(key.map(<[u8]>::to_vec), value)
    }
}
