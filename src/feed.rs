use std::path::Path;

use anyhow::Context as _;
use tokio::{
    fs::File,
    io::{AsyncBufRead, AsyncBufReadExt as _, BufReader},
};

use crate::event::{ParseError, ReplayEvent, parse_line};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FeedRecord {
    Event {
        line_number: u64,
        event: ReplayEvent,
    },
    Malformed {
        line_number: u64,
        raw: String,
        error: ParseError,
    },
}

/// Lazily decodes a statement log, one record per non-blank line.
#[derive(Debug)]
pub struct EventFeed<R> {
    reader: R,
    line_number: u64,
    buffer: Vec<u8>,
}

impl EventFeed<BufReader<File>> {
    pub async fn open(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let file = File::open(path)
            .await
            .with_context(|| format!("open replay log {}", path.display()))?;
        Ok(Self::new(BufReader::new(file)))
    }
}

impl<R: AsyncBufRead + Unpin> EventFeed<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            line_number: 0,
            buffer: Vec::new(),
        }
    }

    pub fn line_number(&self) -> u64 {
        self.line_number
    }

    pub async fn next_record(&mut self) -> anyhow::Result<Option<FeedRecord>> {
        loop {
            self.buffer.clear();
            let read = self
                .reader
                .read_until(b'\n', &mut self.buffer)
                .await
                .with_context(|| format!("read replay log line {}", self.line_number + 1))?;
            if read == 0 {
                return Ok(None);
            }
            self.line_number += 1;

            let line = trim_line_ending(&self.buffer);
            if line.is_empty() {
                continue;
            }

            let line_number = self.line_number;
            let record = match std::str::from_utf8(line) {
                Ok(text) => match parse_line(text) {
                    Ok(event) => FeedRecord::Event { line_number, event },
                    Err(error) => FeedRecord::Malformed {
                        line_number,
                        raw: text.to_owned(),
                        error,
                    },
                },
                Err(_) => FeedRecord::Malformed {
                    line_number,
                    raw: String::from_utf8_lossy(line).into_owned(),
                    error: ParseError::Encoding,
                },
            };
            return Ok(Some(record));
        }
    }
}

fn trim_line_ending(line: &[u8]) -> &[u8] {
    let line = line.strip_suffix(b"\n").unwrap_or(line);
    line.strip_suffix(b"\r").unwrap_or(line)
}
