use std::borrow::Cow;

use serde::Deserialize;

use crate::error::Result;
use crate::index::LineCounts;
use crate::types::{Level, Timestamp};

/// Byte range inside a block payload or output buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Span {
    pub start: usize,
    pub end: usize,
}

impl Span {
    pub fn len(&self) -> usize {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }
}

/// A parsed log record. Immutable after parsing.
///
/// `timestamp` is `None` only when neither the record nor any prior record
/// in its block carried one; the pipeline resolves those against the block
/// range before merging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Record {
    pub timestamp: Option<Timestamp>,
    pub level: Level,
    pub span: Span,
}

/// Outcome of parsing one line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParsedLine {
    pub timestamp: Option<Timestamp>,
    pub level: Level,
}

/// Records and line accounting produced from one block.
#[derive(Debug, Default)]
pub struct ParsedRecords {
    pub records: Vec<Record>,
    pub lines: LineCounts,
}

/// Line-format plug-in. Implementations parse a single line; the provided
/// block walk handles line splitting, `\r` stripping, accounting, and
/// timestamp inheritance.
pub trait RecordParser: Send + Sync {
    /// Parses one line (no trailing newline or carriage return). `None`
    /// marks the line invalid.
    fn parse_line(&self, line: &[u8]) -> Option<ParsedLine>;

    /// Splits a block into lines and parses each. A record without a
    /// timestamp inherits the nearest prior record's timestamp within the
    /// block. Exactly `valid + invalid` non-empty lines are accounted.
    fn parse_block(&self, data: &[u8]) -> ParsedRecords {
        let mut out = ParsedRecords::default();
        let mut inherited: Option<Timestamp> = None;
        let mut start = 0usize;
        while start < data.len() {
            let end = memchr::memchr(b'\n', &data[start..])
                .map(|pos| start + pos)
                .unwrap_or(data.len());
            let mut line_end = end;
            if line_end > start && data[line_end - 1] == b'\r' {
                line_end -= 1;
            }
            if line_end > start {
                match self.parse_line(&data[start..line_end]) {
                    Some(parsed) => {
                        let timestamp = parsed.timestamp.or(inherited);
                        inherited = timestamp;
                        out.records.push(Record {
                            timestamp,
                            level: parsed.level,
                            span: Span {
                                start,
                                end: line_end,
                            },
                        });
                        out.lines.valid += 1;
                    }
                    None => out.lines.invalid += 1,
                }
            }
            start = end + 1;
        }
        out
    }
}

/// Output-format plug-in: appends the rendered record to `buf` and returns
/// the appended range.
pub trait RecordFormatter: Send + Sync {
    fn format_record(&self, record: &Record, line: &[u8], buf: &mut Vec<u8>) -> Result<Span>;
}

// ---

#[derive(Debug, Deserialize)]
struct Envelope<'a> {
    #[serde(alias = "time", alias = "timestamp", borrow)]
    ts: Option<TsValue<'a>>,
    #[serde(alias = "lvl", alias = "severity", borrow)]
    level: Option<Cow<'a, str>>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum TsValue<'a> {
    Millis(i64),
    #[serde(borrow)]
    Text(Cow<'a, str>),
}

/// Parser for one-JSON-object-per-line logs.
///
/// Timestamps come from `ts` / `time` / `timestamp` as integer milliseconds
/// or RFC 3339 strings; levels from `level` / `lvl` / `severity`.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonLineParser;

impl RecordParser for JsonLineParser {
    fn parse_line(&self, line: &[u8]) -> Option<ParsedLine> {
        let envelope: Envelope = serde_json::from_slice(line).ok()?;
        let timestamp = match envelope.ts {
            Some(TsValue::Millis(ms)) => Some(ms),
            Some(TsValue::Text(text)) => chrono::DateTime::parse_from_rfc3339(&text)
                .ok()
                .map(|dt| dt.timestamp_millis()),
            None => None,
        };
        let level = envelope
            .level
            .map(|name| Level::parse(&name))
            .unwrap_or(Level::Unknown);
        Some(ParsedLine { timestamp, level })
    }
}

/// Formatter that re-emits the record's raw line followed by a newline.
#[derive(Debug, Default, Clone, Copy)]
pub struct PlainFormatter;

impl RecordFormatter for PlainFormatter {
    fn format_record(&self, _record: &Record, line: &[u8], buf: &mut Vec<u8>) -> Result<Span> {
        let start = buf.len();
        buf.extend_from_slice(line);
        buf.push(b'\n');
        Ok(Span {
            start,
            end: buf.len(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_parser_reads_millis_and_level() {
        let parsed = JsonLineParser
            .parse_line(br#"{"ts":1500000,"level":"warn","msg":"x"}"#)
            .unwrap();
        assert_eq!(parsed.timestamp, Some(1_500_000));
        assert_eq!(parsed.level, Level::Warning);
    }

    #[test]
    fn json_parser_reads_rfc3339() {
        let parsed = JsonLineParser
            .parse_line(br#"{"time":"1970-01-01T00:00:01Z","severity":"error"}"#)
            .unwrap();
        assert_eq!(parsed.timestamp, Some(1_000));
        assert_eq!(parsed.level, Level::Error);
    }

    #[test]
    fn json_parser_rejects_garbage() {
        assert!(JsonLineParser.parse_line(b"not json at all").is_none());
    }

    #[test]
    fn parse_block_accounts_every_nonempty_line() {
        let data = b"{\"ts\":10,\"level\":\"info\"}\nbroken\n\n{\"level\":\"debug\"}\n";
        let parsed = JsonLineParser.parse_block(data);
        assert_eq!(parsed.lines, LineCounts { valid: 2, invalid: 1 });
        assert_eq!(parsed.records.len(), 2);
        // The second record inherits the first one's timestamp.
        assert_eq!(parsed.records[1].timestamp, Some(10));
        assert_eq!(parsed.records[1].level, Level::Debug);
    }

    #[test]
    fn parse_block_strips_carriage_returns() {
        let data = b"{\"ts\":5,\"level\":\"info\"}\r\n";
        let parsed = JsonLineParser.parse_block(data);
        assert_eq!(parsed.records.len(), 1);
        let span = parsed.records[0].span;
        assert_eq!(&data[span.start..span.end], br#"{"ts":5,"level":"info"}"#);
    }
}
