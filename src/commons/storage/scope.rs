use std::fmt::{Display, Formatter};

use crate::commons::storage::SegmentBuf;

/// Used to scope a [`Key`]. Consists of a vector of zero or more
/// [`SegmentBuf`]s.
///
/// [`Key`]: crate::commons::storage::Key
#[derive(Clone, Debug, Default, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct Scope {
    segments: Vec<SegmentBuf>,
}

impl Scope {
    /// Character used to split on when parsing a Scope from a string.
    pub const SEPARATOR: char = '/';

    /// Create a `Scope` from a single segment.
    pub fn from_segment(segment: impl Into<SegmentBuf>) -> Self {
        Scope::new(vec![segment.into()])
    }

    /// Create an empty `Scope`.
    pub fn global() -> Self {
        Scope::new(Vec::new())
    }

    /// Create a `Scope` from a vector of [`SegmentBuf`]s.
    pub fn new(segments: Vec<SegmentBuf>) -> Self {
        Scope { segments }
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    pub fn is_global(&self) -> bool {
        self.is_empty()
    }

    /// Returns whether the encapsulated vector starts with a certain prefix.
    pub fn starts_with(&self, prefix: &Self) -> bool {
        if prefix.segments.len() <= self.segments.len() {
            self.segments[0..prefix.segments.len()] == prefix.segments
        } else {
            false
        }
    }
}

impl Display for Scope {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let scope = self
            .segments
            .iter()
            .map(|segment| segment.as_str())
            .collect::<Vec<_>>()
            .join(&Self::SEPARATOR.to_string());
        write!(f, "{scope}")
    }
}

impl<'a> IntoIterator for &'a Scope {
    type Item = &'a SegmentBuf;
    type IntoIter = std::slice::Iter<'a, SegmentBuf>;

    fn into_iter(self) -> Self::IntoIter {
        self.segments.iter()
    }
}
