//! Reader for the sequence of `snapshot=N` blocks.

use crate::lines::{Line, LineSource};
use crate::tree::TreeParser;
use crate::{ParseError, ParserConfig, Result, Snapshot};
use log::debug;
use std::io;

const SNAPSHOT: &str = "snapshot";
const TIME: &str = "time";
const MEM_HEAP: &str = "mem_heap_B";
const MEM_HEAP_EXTRA: &str = "mem_heap_extra_B";
const MEM_STACKS: &str = "mem_stacks_B";
const HEAP_TREE: &str = "heap_tree";

const NON_NEGATIVE_INTEGER: &str = "a non-negative integer";

/// Value of the `heap_tree=` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TreeMarker {
    Empty,
    Detailed,
    Peak,
}

/// Snapshots plus the indices derived while reading them.
#[derive(Debug, Default)]
pub(crate) struct SnapshotSequence {
    pub snapshots: Vec<Snapshot>,
    pub detailed_indices: Vec<usize>,
    pub peak_index: Option<usize>,
}

/// Read snapshot blocks until the input is exhausted.
pub(crate) fn read_snapshots<I>(
    source: &mut LineSource<I>,
    config: &ParserConfig,
) -> Result<SnapshotSequence>
where
    I: Iterator<Item = io::Result<String>>,
{
    let mut sequence = SnapshotSequence::default();

    while let Some(marker_line) = source.next_field_line()? {
        let position = sequence.snapshots.len();

        let id = parse_count(&marker_line, SNAPSHOT)?;
        if id != position {
            return Err(ParseError::MalformedSnapshot {
                line: marker_line.number,
                field: SNAPSHOT,
                expected: position.to_string(),
                found: id.to_string(),
            });
        }

        let time = read_scalar(source, TIME)?;
        let heap_bytes = read_scalar(source, MEM_HEAP)?;
        let heap_extra_bytes = read_scalar(source, MEM_HEAP_EXTRA)?;
        let stack_bytes = read_scalar(source, MEM_STACKS)?;

        let tree_line = read_field(source, HEAP_TREE)?;
        let marker = parse_marker(&tree_line)?;

        let tree = match marker {
            TreeMarker::Empty => None,
            TreeMarker::Detailed | TreeMarker::Peak => {
                if marker == TreeMarker::Peak {
                    if let Some(first) = sequence.peak_index {
                        return Err(ParseError::MultiplePeaks {
                            line: tree_line.number,
                            first,
                            second: position,
                        });
                    }
                    sequence.peak_index = Some(position);
                }
                sequence.detailed_indices.push(position);
                Some(TreeParser::new(source, config).parse_tree(tree_line.number)?)
            }
        };

        debug!(
            "snapshot {}: time={} heap={} extra={} stacks={} tree={:?}",
            id, time, heap_bytes, heap_extra_bytes, stack_bytes, marker
        );

        sequence.snapshots.push(Snapshot {
            id,
            time,
            heap_bytes,
            heap_extra_bytes,
            stack_bytes,
            tree,
        });
    }

    Ok(sequence)
}

/// Read the next field line and check it starts with `key=`.
fn read_field<I>(source: &mut LineSource<I>, key: &'static str) -> Result<Line>
where
    I: Iterator<Item = io::Result<String>>,
{
    match source.next_field_line()? {
        Some(line) => {
            field_value(&line, key)?;
            Ok(line)
        }
        None => Err(ParseError::MalformedSnapshot {
            line: source.end_line(),
            field: key,
            expected: format!("'{}=' line", key),
            found: "end of input".to_string(),
        }),
    }
}

fn read_scalar<I>(source: &mut LineSource<I>, key: &'static str) -> Result<u64>
where
    I: Iterator<Item = io::Result<String>>,
{
    let line = read_field(source, key)?;
    let value = field_value(&line, key)?;
    value
        .parse::<u64>()
        .map_err(|_| scalar_error(&line, key, value))
}

fn parse_count(line: &Line, key: &'static str) -> Result<usize> {
    let value = field_value(line, key)?;
    value
        .parse::<usize>()
        .map_err(|_| scalar_error(line, key, value))
}

fn parse_marker(line: &Line) -> Result<TreeMarker> {
    match field_value(line, HEAP_TREE)? {
        "empty" => Ok(TreeMarker::Empty),
        "detailed" => Ok(TreeMarker::Detailed),
        "peak" => Ok(TreeMarker::Peak),
        other => Err(ParseError::MalformedSnapshot {
            line: line.number,
            field: HEAP_TREE,
            expected: "one of 'empty', 'detailed', 'peak'".to_string(),
            found: other.to_string(),
        }),
    }
}

/// The trimmed text after `key=`.
fn field_value<'l>(line: &'l Line, key: &'static str) -> Result<&'l str> {
    line.text
        .trim()
        .strip_prefix(key)
        .and_then(|rest| rest.strip_prefix('='))
        .map(str::trim)
        .ok_or_else(|| ParseError::MalformedSnapshot {
            line: line.number,
            field: key,
            expected: format!("'{}=' line", key),
            found: line.text.clone(),
        })
}

fn scalar_error(line: &Line, key: &'static str, raw: &str) -> ParseError {
    ParseError::MalformedSnapshot {
        line: line.number,
        field: key,
        expected: NON_NEGATIVE_INTEGER.to_string(),
        found: raw.to_string(),
    }
}
