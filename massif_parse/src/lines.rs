//! Line source shared by the header, snapshot and tree readers.

use crate::Result;
use std::io;

/// A line of input with its 1-based line number.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Line {
    pub number: usize,
    pub text: String,
}

impl Line {
    /// Comment and blank lines are skipped between header and snapshot fields.
    fn is_filler(&self) -> bool {
        let trimmed = self.text.trim_start();
        trimmed.is_empty() || trimmed.starts_with('#')
    }
}

/// Numbered, single-line pushback reader over a source of lines.
pub(crate) struct LineSource<I> {
    lines: I,
    consumed: usize,
    pushed_back: Option<Line>,
}

impl<I> LineSource<I>
where
    I: Iterator<Item = io::Result<String>>,
{
    pub fn new(lines: I) -> Self {
        Self {
            lines,
            consumed: 0,
            pushed_back: None,
        }
    }

    /// Read the next line, whatever it contains. `None` at end of input.
    pub fn next_line(&mut self) -> Result<Option<Line>> {
        if let Some(line) = self.pushed_back.take() {
            return Ok(Some(line));
        }

        match self.lines.next() {
            None => Ok(None),
            Some(result) => {
                let mut text = result?;
                if text.ends_with('\r') {
                    text.pop();
                }
                self.consumed += 1;
                Ok(Some(Line {
                    number: self.consumed,
                    text,
                }))
            }
        }
    }

    /// Read the next line that is neither blank nor a `#` comment.
    pub fn next_field_line(&mut self) -> Result<Option<Line>> {
        while let Some(line) = self.next_line()? {
            if !line.is_filler() {
                return Ok(Some(line));
            }
        }
        Ok(None)
    }

    /// Hand a line back so the next read returns it again.
    pub fn push_back(&mut self, line: Line) {
        debug_assert!(self.pushed_back.is_none(), "only one line of pushback");
        self.pushed_back = Some(line);
    }

    /// Line number to report for a failure detected at end of input.
    pub fn end_line(&self) -> usize {
        self.consumed + 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{BufRead, Cursor};

    fn source(data: &str) -> LineSource<impl Iterator<Item = io::Result<String>>> {
        LineSource::new(Cursor::new(data.to_string()).lines())
    }

    #[test]
    fn numbers_lines_from_one() {
        let mut lines = source("a\nb\n");

        assert_eq!(lines.next_line().unwrap().unwrap().number, 1);
        assert_eq!(lines.next_line().unwrap().unwrap().number, 2);
        assert_eq!(lines.next_line().unwrap(), None);
        assert_eq!(lines.end_line(), 3);
    }

    #[test]
    fn skips_comments_and_blank_lines() {
        let mut lines = source("#-----------\n\n   \nsnapshot=0\n");
        let line = lines.next_field_line().unwrap().unwrap();

        assert_eq!(line.number, 4);
        assert_eq!(line.text, "snapshot=0");
    }

    #[test]
    fn pushed_back_line_is_read_again() {
        let mut lines = source("first\nsecond\n");
        let first = lines.next_line().unwrap().unwrap();
        lines.push_back(first.clone());

        assert_eq!(lines.next_field_line().unwrap(), Some(first));
        assert_eq!(lines.next_line().unwrap().unwrap().text, "second");
    }

    #[test]
    fn strips_carriage_returns() {
        let mut lines = source("time=5\r\n");
        assert_eq!(lines.next_line().unwrap().unwrap().text, "time=5");
    }
}
