//! Source location tracking
//!
//! The scanner only needs a line number per token (spec's error messages are
//! line-granular, not column-granular), so `Span` is a thin newtype rather
//! than the byte-range span the rest of the retrieval pack uses elsewhere.

/// 1-indexed source line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Line(pub u32);

impl Line {
    pub const fn start() -> Self {
        Line(1)
    }
}

impl std::fmt::Display for Line {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}
