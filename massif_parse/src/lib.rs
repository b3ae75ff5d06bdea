//! Valgrind massif output parser library.
//!
//! This library parses the `massif.out.<pid>` files written by
//! `valgrind --tool=massif` from any `Read`-able source and provides
//! structured access to the header, the snapshot sequence and the
//! allocation trees of detailed snapshots.
//!
//! # Example
//!
//! ```no_run
//! use std::fs::File;
//! use massif_parse::Document;
//!
//! let file = File::open("massif.out.1234").unwrap();
//! let massif = Document::parse(file).unwrap();
//!
//! println!("Command: {}", massif.command);
//! println!("Snapshots: {}", massif.snapshots.len());
//! if let Some(peak) = massif.peak_snapshot() {
//!     println!("Peak heap: {} bytes", peak.total_heap());
//! }
//! ```

mod header;
mod lines;
mod snapshot;
mod tree;

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::io::{self, BufRead, BufReader, Read};
use std::str::FromStr;
use thiserror::Error;

use crate::lines::LineSource;

/// Errors that can occur during massif parsing.
///
/// Every variant is fatal: the parse stops at the first one and no partial
/// document is returned.
#[derive(Error, Debug)]
pub enum ParseError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("malformed header at line {line}: '{key}' {reason}")]
    MalformedHeader {
        line: usize,
        key: &'static str,
        reason: String,
    },

    #[error("malformed snapshot at line {line}: field '{field}' expected {expected}, found '{found}'")]
    MalformedSnapshot {
        line: usize,
        field: &'static str,
        expected: String,
        found: String,
    },

    #[error("snapshot {second} at line {line} is marked peak, but snapshot {first} already was")]
    MultiplePeaks {
        line: usize,
        first: usize,
        second: usize,
    },

    #[error("malformed allocation tree entry at line {line}: {reason} in '{text}'")]
    MalformedLocation {
        line: usize,
        text: String,
        reason: String,
    },

    #[error("allocation tree truncated: node at line {line} still expects {remaining} child node(s)")]
    TruncatedTree { line: usize, remaining: usize },

    #[error("allocation tree node at line {line} is indented by {found}, expected {expected}")]
    Indentation {
        line: usize,
        expected: usize,
        found: usize,
    },

    #[error("snapshot reference {index} is invalid: {reason}")]
    InvalidSnapshotReference { index: usize, reason: String },
}

/// Result type for massif parsing operations.
pub type Result<T> = std::result::Result<T, ParseError>;

// ============================================================================
// Configuration
// ============================================================================

/// How tree node indentation is checked against the declared child counts.
///
/// Massif indents every node by one space per level of depth. The declared
/// child count is always what decides subtree boundaries. Under `Warn` and
/// `Strict`, a node whose indentation would put it in a different subtree than
/// its count does fails with [`ParseError::Indentation`]; this policy decides
/// what happens to the remaining, cosmetic mismatches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IndentationPolicy {
    /// Do not look at indentation at all.
    Ignore,
    /// Log a warning for every node whose indentation does not match its depth.
    #[default]
    Warn,
    /// Fail on any node whose indentation does not match its depth.
    Strict,
}

/// Configuration for the parser.
#[derive(Debug, Clone)]
pub struct ParserConfig {
    /// Indentation check applied to allocation tree nodes.
    pub indentation: IndentationPolicy,
    /// Deepest allocation tree nesting accepted before the input is rejected.
    /// The root is depth 0; massif itself never writes more than 200 levels.
    pub max_depth: usize,
}

impl Default for ParserConfig {
    fn default() -> Self {
        Self {
            indentation: IndentationPolicy::Warn,
            max_depth: 512,
        }
    }
}

// ============================================================================
// Document types
// ============================================================================

/// Unit of the `time` field of every snapshot, from the `time_unit:` header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TimeUnit {
    /// Instructions executed (`--time-unit=i`, massif's default).
    #[serde(rename = "i")]
    Instructions,
    /// Wall-clock milliseconds (`--time-unit=ms`).
    #[serde(rename = "ms")]
    Milliseconds,
    /// Bytes allocated and deallocated (`--time-unit=B`).
    #[serde(rename = "B")]
    Bytes,
}

impl TimeUnit {
    /// The label massif writes for this unit.
    pub fn as_str(&self) -> &'static str {
        match self {
            TimeUnit::Instructions => "i",
            TimeUnit::Milliseconds => "ms",
            TimeUnit::Bytes => "B",
        }
    }
}

impl fmt::Display for TimeUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TimeUnit {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "i" => Ok(TimeUnit::Instructions),
            "ms" => Ok(TimeUnit::Milliseconds),
            "B" => Ok(TimeUnit::Bytes),
            other => Err(format!("unknown time unit '{}'", other)),
        }
    }
}

/// Source-level attribution of an allocation tree node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Location {
    /// Code address as printed by massif, e.g. `0x4C2DB8F`.
    pub address: String,
    /// Function name, `???` when massif could not symbolize it.
    pub function: String,
    /// Source file, or object path for code without debug info.
    pub file: Option<String>,
    /// Source line, when debug info was available.
    pub line: Option<u32>,
}

/// One entry of an allocation tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocationNode {
    /// Bytes attributed to this node and everything below it.
    #[serde(rename = "nbytes")]
    pub bytes: u64,
    /// Where the bytes were allocated. `None` for the root and for entries
    /// aggregated below massif's reporting threshold.
    #[serde(rename = "details")]
    pub location: Option<Location>,
    pub children: Vec<AllocationNode>,
}

impl AllocationNode {
    /// Returns true if this node has no children.
    pub fn is_leaf(&self) -> bool {
        self.children.is_empty()
    }

    /// Number of nodes in this subtree, this node included.
    pub fn node_count(&self) -> usize {
        self.depth_first().count()
    }

    /// Iterate over this subtree in pre-order, in the order massif wrote it.
    pub fn depth_first(&self) -> DepthFirst<'_> {
        DepthFirst { stack: vec![self] }
    }
}

/// Pre-order iterator over an allocation tree.
#[derive(Debug)]
pub struct DepthFirst<'a> {
    stack: Vec<&'a AllocationNode>,
}

impl<'a> Iterator for DepthFirst<'a> {
    type Item = &'a AllocationNode;

    fn next(&mut self) -> Option<Self::Item> {
        let node = self.stack.pop()?;
        self.stack.extend(node.children.iter().rev());
        Some(node)
    }
}

/// One memory usage sample.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    /// Ordinal id, equal to the snapshot's position in the document.
    pub id: usize,
    /// Elapsed time, in the document's [`TimeUnit`].
    pub time: u64,
    /// Useful heap bytes.
    #[serde(rename = "mem_heap")]
    pub heap_bytes: u64,
    /// Heap bytes lost to allocator overhead and alignment.
    #[serde(rename = "mem_heap_extra")]
    pub heap_extra_bytes: u64,
    /// Stack bytes, only non-zero with `--stacks=yes`.
    #[serde(rename = "mem_stack")]
    pub stack_bytes: u64,
    /// Allocation tree, present for detailed and peak snapshots only.
    #[serde(rename = "heap_tree")]
    pub tree: Option<AllocationNode>,
}

impl Snapshot {
    /// Returns true if massif recorded an allocation tree for this snapshot.
    pub fn is_detailed(&self) -> bool {
        self.tree.is_some()
    }

    /// Useful plus extra heap bytes.
    pub fn total_heap(&self) -> u64 {
        self.heap_bytes.saturating_add(self.heap_extra_bytes)
    }
}

// ============================================================================
// Main Document type
// ============================================================================

/// A parsed massif output file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Document {
    /// Profiled command line (`cmd:`).
    #[serde(rename = "cmd")]
    pub command: String,
    /// Massif options used for the run (`desc:`).
    #[serde(rename = "desc")]
    pub description: String,
    /// Unit of every snapshot's `time`.
    pub time_unit: TimeUnit,
    /// All snapshots, in file order.
    pub snapshots: Vec<Snapshot>,
    /// Positions of the snapshots carrying an allocation tree, peak included.
    #[serde(rename = "detailed_snapshots_index")]
    pub detailed_indices: Vec<usize>,
    /// Position of the peak snapshot, if massif marked one.
    #[serde(rename = "peak_snapshot_index")]
    pub peak_index: Option<usize>,
}

impl Document {
    /// Parse a massif file from any `Read`-able source.
    pub fn parse<R: Read>(reader: R) -> Result<Self> {
        Self::parse_with_config(reader, &ParserConfig::default())
    }

    /// Parse a massif file with custom configuration.
    pub fn parse_with_config<R: Read>(reader: R, config: &ParserConfig) -> Result<Self> {
        Self::from_lines(BufReader::new(reader).lines(), config)
    }

    /// Parse a massif file from a source of lines.
    ///
    /// The first I/O error the source yields aborts the parse and is returned
    /// as [`ParseError::Io`].
    pub fn from_lines<I>(lines: I, config: &ParserConfig) -> Result<Self>
    where
        I: IntoIterator<Item = io::Result<String>>,
    {
        let mut source = LineSource::new(lines.into_iter());

        let header = header::read_header(&mut source)?;
        let sequence = snapshot::read_snapshots(&mut source, config)?;

        let document = Document {
            command: header.command,
            description: header.description,
            time_unit: header.time_unit,
            snapshots: sequence.snapshots,
            detailed_indices: sequence.detailed_indices,
            peak_index: sequence.peak_index,
        };

        document.validate()?;

        Ok(document)
    }

    /// Check the snapshot cross-references.
    ///
    /// Every snapshot id must equal its position, every detailed index and the
    /// peak index must point at a snapshot carrying a tree, the peak must be
    /// listed as detailed, and no snapshot may carry a tree without being
    /// listed.
    pub fn validate(&self) -> Result<()> {
        let detailed: HashSet<usize> = self.detailed_indices.iter().copied().collect();

        for (position, snapshot) in self.snapshots.iter().enumerate() {
            if snapshot.id != position {
                return Err(ParseError::InvalidSnapshotReference {
                    index: position,
                    reason: format!("snapshot at this position has id {}", snapshot.id),
                });
            }
            if snapshot.is_detailed() && !detailed.contains(&position) {
                return Err(ParseError::InvalidSnapshotReference {
                    index: position,
                    reason: "snapshot carries a tree but is not listed as detailed".to_string(),
                });
            }
        }

        for &index in &self.detailed_indices {
            self.check_tree_reference(index)?;
        }

        if let Some(peak) = self.peak_index {
            self.check_tree_reference(peak)?;
            if !detailed.contains(&peak) {
                return Err(ParseError::InvalidSnapshotReference {
                    index: peak,
                    reason: "peak snapshot is not listed as detailed".to_string(),
                });
            }
        }

        Ok(())
    }

    fn check_tree_reference(&self, index: usize) -> Result<()> {
        match self.snapshots.get(index) {
            None => Err(ParseError::InvalidSnapshotReference {
                index,
                reason: format!("only {} snapshots exist", self.snapshots.len()),
            }),
            Some(snapshot) if !snapshot.is_detailed() => Err(ParseError::InvalidSnapshotReference {
                index,
                reason: "snapshot has no allocation tree".to_string(),
            }),
            Some(_) => Ok(()),
        }
    }

    /// The peak snapshot, if massif marked one.
    pub fn peak_snapshot(&self) -> Option<&Snapshot> {
        self.peak_index.and_then(|index| self.snapshots.get(index))
    }

    /// All snapshots carrying an allocation tree, in file order.
    pub fn detailed_snapshots(&self) -> impl Iterator<Item = &Snapshot> {
        self.detailed_indices
            .iter()
            .filter_map(|&index| self.snapshots.get(index))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    const HEADER: &str = "desc: --time-unit=B\ncmd: ./app --flag\ntime_unit: B\n";

    fn snapshot_block(id: usize, heap: u64, tree: &str) -> String {
        format!(
            "#-----------\nsnapshot={}\n#-----------\ntime={}\nmem_heap_B={}\nmem_heap_extra_B=8\nmem_stacks_B=0\nheap_tree={}\n",
            id,
            id * 100,
            heap,
            tree
        )
    }

    fn leaf(bytes: u64) -> AllocationNode {
        AllocationNode {
            bytes,
            location: None,
            children: Vec::new(),
        }
    }

    #[test]
    fn parse_header_only() {
        let massif = Document::parse(Cursor::new(HEADER)).unwrap();

        assert_eq!(massif.description, "--time-unit=B");
        assert_eq!(massif.command, "./app --flag");
        assert_eq!(massif.time_unit, TimeUnit::Bytes);
        assert!(massif.snapshots.is_empty());
        assert!(massif.detailed_indices.is_empty());
        assert_eq!(massif.peak_index, None);
    }

    #[test]
    fn parse_single_empty_snapshot() {
        let data = format!("{}{}", HEADER, snapshot_block(0, 0, "empty"));
        let massif = Document::parse(Cursor::new(data)).unwrap();

        assert_eq!(massif.snapshots.len(), 1);
        assert_eq!(massif.snapshots[0].id, 0);
        assert_eq!(massif.snapshots[0].tree, None);
        assert!(massif.detailed_indices.is_empty());
        assert_eq!(massif.peak_index, None);
    }

    #[test]
    fn parse_peak_snapshot_with_two_leaves() {
        let data = format!(
            "{}{}{}n2: 300 (heap allocation functions) malloc/new/new[], --alloc-fns, etc.\n n0: 200 0x1: f (a.c:1)\n n0: 100 in 1 place, below massif's threshold (1.00%)\n",
            HEADER,
            snapshot_block(0, 0, "empty"),
            snapshot_block(1, 300, "peak"),
        );
        let massif = Document::parse(Cursor::new(data)).unwrap();

        assert_eq!(massif.peak_index, Some(1));
        assert_eq!(massif.detailed_indices, vec![1]);

        let tree = massif.snapshots[1].tree.as_ref().unwrap();
        assert_eq!(tree.node_count(), 3);
        assert_eq!(tree.children.len(), 2);
        assert!(tree.children.iter().all(AllocationNode::is_leaf));
        assert_eq!(massif.peak_snapshot().unwrap().total_heap(), 308);
    }

    #[test]
    fn truncated_tree_reports_remaining_children() {
        let data = format!(
            "{}{}n2: 300 (heap allocation functions) malloc/new/new[], --alloc-fns, etc.\n n0: 200 0x1: f (a.c:1)\n",
            HEADER,
            snapshot_block(0, 300, "detailed"),
        );
        let result = Document::parse(Cursor::new(data));

        assert!(matches!(
            result,
            Err(ParseError::TruncatedTree { remaining: 1, .. })
        ));
    }

    #[test]
    fn second_peak_fails() {
        let root = "n0: 10 (heap allocation functions) malloc/new/new[], --alloc-fns, etc.\n";
        let data = format!(
            "{}{}{}{}{}",
            HEADER,
            snapshot_block(0, 10, "peak"),
            root,
            snapshot_block(1, 10, "peak"),
            root,
        );
        let result = Document::parse(Cursor::new(data));

        assert!(matches!(
            result,
            Err(ParseError::MultiplePeaks {
                first: 0,
                second: 1,
                ..
            })
        ));
    }

    #[test]
    fn reparse_is_deterministic() {
        let data = format!(
            "{}{}n1: 10 (heap allocation functions) malloc/new/new[], --alloc-fns, etc.\n n0: 10 0x2: g (b.c:2)\n{}",
            HEADER,
            snapshot_block(0, 10, "detailed"),
            snapshot_block(1, 0, "empty"),
        );

        let first = Document::parse(Cursor::new(data.clone())).unwrap();
        let second = Document::parse(Cursor::new(data)).unwrap();

        assert_eq!(first, second);
    }

    #[test]
    fn io_error_is_wrapped() {
        let lines = vec![
            Ok("desc: x".to_string()),
            Err(io::Error::other("disk on fire")),
        ];
        let result = Document::from_lines(lines, &ParserConfig::default());

        match result {
            Err(ParseError::Io(err)) => assert_eq!(err.to_string(), "disk on fire"),
            other => panic!("expected IO error, got {:?}", other),
        }
    }

    #[test]
    fn time_unit_labels() {
        for unit in [TimeUnit::Instructions, TimeUnit::Milliseconds, TimeUnit::Bytes] {
            assert_eq!(unit.to_string().parse::<TimeUnit>(), Ok(unit));
        }
        assert!("s".parse::<TimeUnit>().is_err());
    }

    #[test]
    fn depth_first_is_pre_order() {
        let tree = AllocationNode {
            bytes: 6,
            location: None,
            children: vec![
                AllocationNode {
                    bytes: 4,
                    location: None,
                    children: vec![leaf(3), leaf(1)],
                },
                leaf(2),
            ],
        };

        let order: Vec<u64> = tree.depth_first().map(|n| n.bytes).collect();
        assert_eq!(order, vec![6, 4, 3, 1, 2]);
        assert_eq!(tree.node_count(), 5);
    }

    fn detailed_document() -> Document {
        Document {
            command: "./app".to_string(),
            description: "(none)".to_string(),
            time_unit: TimeUnit::Instructions,
            snapshots: vec![
                Snapshot {
                    id: 0,
                    time: 0,
                    heap_bytes: 0,
                    heap_extra_bytes: 0,
                    stack_bytes: 0,
                    tree: None,
                },
                Snapshot {
                    id: 1,
                    time: 10,
                    heap_bytes: 5,
                    heap_extra_bytes: 0,
                    stack_bytes: 0,
                    tree: Some(leaf(5)),
                },
            ],
            detailed_indices: vec![1],
            peak_index: Some(1),
        }
    }

    #[test]
    fn validate_accepts_consistent_document() {
        assert!(detailed_document().validate().is_ok());
        assert_eq!(detailed_document().detailed_snapshots().count(), 1);
    }

    #[test]
    fn validate_rejects_peak_without_tree() {
        let mut massif = detailed_document();
        massif.peak_index = Some(0);

        assert!(matches!(
            massif.validate(),
            Err(ParseError::InvalidSnapshotReference { index: 0, .. })
        ));
    }

    #[test]
    fn validate_rejects_out_of_range_index() {
        let mut massif = detailed_document();
        massif.detailed_indices.push(7);

        assert!(matches!(
            massif.validate(),
            Err(ParseError::InvalidSnapshotReference { index: 7, .. })
        ));
    }

    #[test]
    fn validate_rejects_unlisted_tree() {
        let mut massif = detailed_document();
        massif.detailed_indices.clear();
        massif.peak_index = None;

        assert!(matches!(
            massif.validate(),
            Err(ParseError::InvalidSnapshotReference { index: 1, .. })
        ));
    }
}
