//! Source location tracking and span utilities

use serde::{Deserialize, Serialize};

/// A location in source text, expressed as a half-open byte range.
///
/// The core never re-derives spans from source text (lexing/parsing is an
/// external collaborator); it only carries spans that arrive already attached
/// to AST nodes, threading them through the compiler into the line table and
/// through the VM into stack traces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Span {
    /// Starting byte offset
    pub start: usize,
    /// Ending byte offset (exclusive)
    pub end: usize,
    /// 1-based source line, when known
    pub line: u32,
}

impl Span {
    /// Create a new span
    pub fn new(start: usize, end: usize, line: u32) -> Self {
        Self { start, end, line }
    }

    /// Create a dummy span for synthetic/compiler-inserted instructions
    pub fn dummy() -> Self {
        Self {
            start: 0,
            end: 0,
            line: 0,
        }
    }

    /// Combine two spans into one encompassing span, keeping the earlier line
    pub fn merge(self, other: Span) -> Span {
        Span {
            start: self.start.min(other.start),
            end: self.end.max(other.end),
            line: self.line.min(other.line),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merge_takes_widest_range_and_earliest_line() {
        let a = Span::new(0, 5, 3);
        let b = Span::new(3, 10, 1);
        let merged = a.merge(b);
        assert_eq!(merged.start, 0);
        assert_eq!(merged.end, 10);
        assert_eq!(merged.line, 1);
    }
}
