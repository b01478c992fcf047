use serde::Deserialize;

use crate::errors::ParseError;
use crate::types::Reading;

/// Fixed shape of one monitor output block.
///
/// Defaults match `top -b -p <pid>`: five summary lines, a blank line and the
/// column header, then the process row (`RES` is field 5, `%CPU` field 8),
/// then one blank line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BlockLayout {
    pub header_lines: usize,
    pub trailer_lines: usize,
    pub memory_field: usize,
    pub cpu_field: usize,
}

impl Default for BlockLayout {
    fn default() -> Self {
        Self {
            header_lines: 7,
            trailer_lines: 1,
            memory_field: 5,
            cpu_field: 8,
        }
    }
}

impl BlockLayout {
    pub fn block_len(&self) -> usize {
        self.header_lines + 1 + self.trailer_lines
    }
}

/// Line-at-a-time parser for a stream of fixed-layout blocks.
///
/// Yields one [`Reading`] per completed block. The stats line is parsed as soon
/// as it arrives so a malformed block fails before its trailer is read.
#[derive(Debug)]
pub struct BlockParser {
    layout: BlockLayout,
    position: usize,
    block: u64,
    pending: Option<Reading>,
}

impl BlockParser {
    pub fn new(layout: BlockLayout) -> Self {
        Self {
            layout,
            position: 0,
            block: 0,
            pending: None,
        }
    }

    /// Number of blocks fully consumed so far.
    pub fn blocks(&self) -> u64 {
        self.block
    }

    pub fn feed(&mut self, line: &str) -> Result<Option<Reading>, ParseError> {
        if self.position == self.layout.header_lines {
            self.pending = Some(self.parse_stats(line)?);
        }

        self.position += 1;
        if self.position < self.layout.block_len() {
            return Ok(None);
        }

        self.position = 0;
        self.block += 1;
        Ok(self.pending.take())
    }

    fn parse_stats(&self, line: &str) -> Result<Reading, ParseError> {
        let fields: Vec<&str> = line.split_whitespace().collect();
        let expected = self.layout.memory_field.max(self.layout.cpu_field) + 1;
        if fields.len() < expected {
            return Err(ParseError::MissingField {
                block: self.block,
                expected,
                found: fields.len(),
            });
        }

        let cpu_token = fields[self.layout.cpu_field];
        let cpu_percent = match cpu_token.parse::<f64>() {
            Ok(v) if v.is_finite() && v >= 0.0 => v,
            _ => {
                return Err(ParseError::InvalidCpu {
                    block: self.block,
                    token: cpu_token.to_string(),
                });
            }
        };

        Ok(Reading {
            memory: fields[self.layout.memory_field].to_string(),
            cpu_percent,
        })
    }
}
