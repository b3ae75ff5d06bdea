//! Count-driven reader for massif allocation trees.
//!
//! Each node line declares its own child count, and exactly that many node
//! lines follow it, depth first:
//!
//! ```text
//! n2: 165990400 (heap allocation functions) malloc/new/new[], --alloc-fns, etc.
//!  n2: 111468544 0x5E70169: mmap (syscall-template.S:82)
//!   n0: 83079168 0x5E031E7: malloc (arena.c:824)
//!   n0: 8192 in 1 place, below massif's threshold (01.00%)
//!  n0: 83079168 0x5DFE377: new_heap (arena.c:554)
//! ```
//!
//! The leading spaces mirror the depth but the declared counts decide which
//! lines belong to which subtree. The descent keeps its open nodes on an
//! explicit stack, so nesting depth is bounded by [`ParserConfig::max_depth`]
//! and not by the thread's stack size.

use crate::lines::{Line, LineSource};
use crate::{AllocationNode, IndentationPolicy, Location, ParseError, ParserConfig, Result};
use log::{trace, warn};
use std::io;
use std::mem;

/// Prefixes of the root node description, one per massif profiling mode.
const ROOT_BANNERS: [&str; 2] = ["(heap allocation functions)", "(page allocation syscalls)"];

/// The parts of a node line, borrowed from the line text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct NodeLine<'a> {
    indent: usize,
    children: usize,
    bytes: u64,
    description: Option<&'a str>,
}

/// A node whose declared children have not all been read yet.
struct OpenNode {
    line: usize,
    indent: usize,
    bytes: u64,
    location: Option<Location>,
    remaining: usize,
    children: Vec<AllocationNode>,
    /// Smallest indentation of any line read so far below this node.
    lowest_child_indent: usize,
}

impl OpenNode {
    fn new(line: &Line, node: &NodeLine<'_>, location: Option<Location>) -> Self {
        Self {
            line: line.number,
            indent: node.indent,
            bytes: node.bytes,
            location,
            remaining: node.children,
            children: Vec::with_capacity(node.children),
            lowest_child_indent: usize::MAX,
        }
    }

    /// Whether indentation alone would also put a line indented by `indent`
    /// under this node: it must be deeper than this node and no shallower than
    /// any line of the earlier siblings' subtrees.
    fn owns_indent(&self, indent: usize) -> bool {
        self.indent < indent && indent <= self.lowest_child_indent
    }

    fn adopt(&mut self, child: OpenNode) {
        self.lowest_child_indent = self
            .lowest_child_indent
            .min(child.indent)
            .min(child.lowest_child_indent);
        self.children.push(child.into_node());
    }

    fn into_node(self) -> AllocationNode {
        AllocationNode {
            bytes: self.bytes,
            location: self.location,
            children: self.children,
        }
    }
}

/// Reads one allocation tree from a line source.
pub(crate) struct TreeParser<'s, I> {
    source: &'s mut LineSource<I>,
    config: &'s ParserConfig,
}

impl<'s, I> TreeParser<'s, I>
where
    I: Iterator<Item = io::Result<String>>,
{
    pub fn new(source: &'s mut LineSource<I>, config: &'s ParserConfig) -> Self {
        Self { source, config }
    }

    /// Read the root node and its full subtree.
    ///
    /// `marker_line` is the `heap_tree=` line, reported if the root is missing.
    pub fn parse_tree(mut self, marker_line: usize) -> Result<AllocationNode> {
        let line = self.next_node_line()?.ok_or(ParseError::TruncatedTree {
            line: marker_line,
            remaining: 1,
        })?;

        let node = parse_node_line(&line)?;
        self.check_indentation(&line, node.indent, 0)?;
        check_banner(node.description, &line)?;

        let first_line = line.number;
        let mut current = OpenNode::new(&line, &node, None);
        let mut ancestors: Vec<OpenNode> = Vec::new();

        loop {
            if current.remaining == 0 {
                match ancestors.pop() {
                    Some(mut parent) => {
                        parent.adopt(current);
                        current = parent;
                        continue;
                    }
                    None => {
                        let root = current.into_node();
                        trace!(
                            "allocation tree at line {}: {} nodes",
                            first_line,
                            root.node_count()
                        );
                        return Ok(root);
                    }
                }
            }

            let Some(line) = self.next_node_line()? else {
                return Err(ParseError::TruncatedTree {
                    line: current.line,
                    remaining: current.remaining,
                });
            };
            current.remaining -= 1;

            let depth = ancestors.len() + 1;
            if depth > self.config.max_depth {
                return Err(malformed(
                    &line,
                    &format!("nesting deeper than {} levels", self.config.max_depth),
                ));
            }

            let node = parse_node_line(&line)?;
            self.check_membership(&line, node.indent, depth, &current)?;
            let location = match node.description {
                Some(description) => parse_description(description, &line)?,
                None => return Err(malformed(&line, "missing description")),
            };

            let child = OpenNode::new(&line, &node, location);
            ancestors.push(mem::replace(&mut current, child));
        }
    }

    /// Next line of the tree, or `None` at end of input.
    ///
    /// Blank lines running up to the end of input count as end of input, so a
    /// file cut short after a newline still reports the missing nodes.
    fn next_node_line(&mut self) -> Result<Option<Line>> {
        let Some(line) = self.source.next_line()? else {
            return Ok(None);
        };
        if !line.text.trim().is_empty() {
            return Ok(Some(line));
        }

        while let Some(next) = self.source.next_line()? {
            if !next.text.trim().is_empty() {
                self.source.push_back(next);
                return Ok(Some(line));
            }
        }
        Ok(None)
    }

    /// Check a child line's indentation against the node the counts put it under.
    ///
    /// Unless indentation is ignored, a line whose indentation would place it
    /// in another subtree is always an error. Anything else only has to match
    /// the depth as far as [`check_indentation`](Self::check_indentation) asks.
    fn check_membership(
        &self,
        line: &Line,
        found: usize,
        depth: usize,
        parent: &OpenNode,
    ) -> Result<()> {
        if self.config.indentation == IndentationPolicy::Ignore {
            return Ok(());
        }
        if !parent.owns_indent(found) {
            return Err(ParseError::Indentation {
                line: line.number,
                expected: depth,
                found,
            });
        }
        self.check_indentation(line, found, depth)
    }

    fn check_indentation(&self, line: &Line, found: usize, expected: usize) -> Result<()> {
        if found == expected {
            return Ok(());
        }

        match self.config.indentation {
            IndentationPolicy::Ignore => Ok(()),
            IndentationPolicy::Warn => {
                warn!(
                    "allocation tree node at line {} is indented by {}, expected {}",
                    line.number, found, expected
                );
                Ok(())
            }
            IndentationPolicy::Strict => Err(ParseError::Indentation {
                line: line.number,
                expected,
                found,
            }),
        }
    }
}

/// The root carries massif's allocation functions banner, never a code location.
fn check_banner(description: Option<&str>, line: &Line) -> Result<()> {
    match description {
        Some(text) if ROOT_BANNERS.iter().any(|banner| text.starts_with(banner)) => Ok(()),
        _ => Err(malformed(line, "root is not an allocation functions banner")),
    }
}

/// Split `  n<children>: <bytes> <description>` into its parts.
fn parse_node_line(line: &Line) -> Result<NodeLine<'_>> {
    let text = line.text.trim_end();
    let rest = text.trim_start_matches(' ');
    let indent = text.len() - rest.len();

    let rest = rest
        .strip_prefix('n')
        .ok_or_else(|| malformed(line, "expected 'n<children>:'"))?;
    let (children, rest) = rest
        .split_once(": ")
        .ok_or_else(|| malformed(line, "expected 'n<children>: <bytes>'"))?;
    let children = parse_digits::<usize>(children)
        .ok_or_else(|| malformed(line, "child count is not a non-negative integer"))?;

    let (bytes, description) = match rest.split_once(' ') {
        Some((bytes, description)) => (bytes, Some(description)),
        None => (rest, None),
    };
    let bytes = parse_digits::<u64>(bytes)
        .ok_or_else(|| malformed(line, "byte count is not a non-negative integer"))?;

    Ok(NodeLine {
        indent,
        children,
        bytes,
        description,
    })
}

/// Turn a child node description into its location.
///
/// Below-threshold entries (`in 3 places, all below massif's threshold ...`)
/// have no location. Everything else must be `<address>: <function>`,
/// optionally followed by ` (<file>:<line>)`, ` (<file>)` or ` (in <object>)`.
fn parse_description(description: &str, line: &Line) -> Result<Option<Location>> {
    if is_below_threshold(description) {
        return Ok(None);
    }

    let (address, rest) = description
        .split_once(": ")
        .ok_or_else(|| malformed(line, "expected '<address>: <function>'"))?;
    if address.is_empty()
        || !address
            .chars()
            .all(|c| c.is_ascii_hexdigit() || c == 'x')
    {
        return Err(malformed(line, "address is not hexadecimal"));
    }

    let (function, file, source_line) = split_function(rest, line)?;
    if function.is_empty() {
        return Err(malformed(line, "missing function name"));
    }

    Ok(Some(Location {
        address: address.to_string(),
        function: function.to_string(),
        file: file.map(str::to_string),
        line: source_line,
    }))
}

fn is_below_threshold(description: &str) -> bool {
    description
        .strip_prefix("in ")
        .is_some_and(|rest| rest.contains("place"))
}

/// Separate a trailing ` (<file>[:<line>])` group from the function name.
///
/// Function names can contain parentheses and spaces themselves, so the first
/// ` (` whose remainder forms a valid file group wins.
fn split_function<'a>(
    text: &'a str,
    line: &Line,
) -> Result<(&'a str, Option<&'a str>, Option<u32>)> {
    for (split, _) in text.match_indices(" (") {
        let group = &text[split + 2..];
        let Some(inner) = group.strip_suffix(')') else {
            continue;
        };
        let inner = inner.strip_prefix("in ").unwrap_or(inner);

        let (file, digits) = match inner.split_once(':') {
            Some((file, digits)) => (file, digits),
            None => (inner, ""),
        };
        if file.is_empty() || digits.contains(':') {
            continue;
        }
        if !digits.is_empty() && parse_digits::<u64>(digits).is_none() {
            continue;
        }

        let source_line = if digits.is_empty() {
            None
        } else {
            Some(
                digits
                    .parse::<u32>()
                    .map_err(|_| malformed(line, "source line number out of range"))?,
            )
        };

        return Ok((&text[..split], Some(file), source_line));
    }

    Ok((text, None, None))
}

/// Parse a string of ASCII digits, rejecting signs and empty input.
fn parse_digits<T: std::str::FromStr>(text: &str) -> Option<T> {
    if text.is_empty() || !text.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    text.parse().ok()
}

fn malformed(line: &Line, reason: &str) -> ParseError {
    ParseError::MalformedLocation {
        line: line.number,
        text: line.text.clone(),
        reason: reason.to_string(),
    }
}
