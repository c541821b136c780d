//! Identifiers for components of a storage key.

use std::borrow::Borrow;
use std::fmt::{Display, Formatter};
use std::ops::Deref;
use std::str::FromStr;

use log::warn;

use crate::commons::storage::Scope;

//------------ Segment -------------------------------------------------------

/// A nonempty string slice that does not start or end with whitespace and
/// does not contain any instances of [`Scope::SEPARATOR`].
///
/// For the owned variant, see [`SegmentBuf`].
#[derive(Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[repr(transparent)]
pub struct Segment(str);

impl Segment {
    /// Parse a Segment from a string.
    pub const fn parse(value: &str) -> Result<&Self, ParseSegmentError> {
        if value.is_empty() {
            return Err(ParseSegmentError::Empty);
        }
        let bytes = value.as_bytes();
        if bytes[0].is_ascii_whitespace() || bytes[bytes.len() - 1].is_ascii_whitespace() {
            return Err(ParseSegmentError::SurroundingWhitespace);
        }
        let mut i = 0;
        while i < bytes.len() {
            if bytes[i] == Scope::SEPARATOR as u8 {
                return Err(ParseSegmentError::ContainsSeparator);
            }
            i += 1;
        }
        // Safety: all checks performed above.
        Ok(unsafe { Segment::from_str_unchecked(value) })
    }

    /// Creates a segment from the given string slice or panics.
    ///
    /// This function should be used to create segment constants.
    pub const fn make(s: &str) -> &Self {
        match Self::parse(s) {
            Ok(segment) => segment,
            Err(_) => panic!("invalid segment constant"),
        }
    }

    /// Return the encapsulated string.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Creates a Segment from a string without performing any checks.
    ///
    /// # Safety
    /// This should only be called for const values, where we know that the
    /// input is safe, or in case the input was thoroughly checked in
    /// another way.
    pub const unsafe fn from_str_unchecked(s: &str) -> &Self {
        unsafe { &*(s as *const str as *const Self) }
    }
}

impl Display for Segment {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", &self.0)
    }
}

impl ToOwned for Segment {
    type Owned = SegmentBuf;

    fn to_owned(&self) -> Self::Owned {
        SegmentBuf(self.0.to_string())
    }
}

//------------ SegmentBuf ----------------------------------------------------

/// The owned variant of [`Segment`].
#[derive(Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[repr(transparent)]
pub struct SegmentBuf(String);

impl SegmentBuf {
    /// Parse a segment, replacing offending characters where needed.
    pub fn parse_lossy(value: &str) -> Self {
        match Segment::parse(value) {
            Ok(segment) => segment.to_owned(),
            Err(error) => {
                let sanitized = value.trim().replace(Scope::SEPARATOR, "+");
                let nonempty = if sanitized.is_empty() {
                    "EMPTY".to_owned()
                } else {
                    sanitized
                };
                let segment = Segment::parse(&nonempty).unwrap(); // cannot panic as all checks are performed above
                warn!("{value} is not a valid Segment: {error}\nusing {segment} instead");
                segment.to_owned()
            }
        }
    }
}

impl AsRef<Segment> for SegmentBuf {
    fn as_ref(&self) -> &Segment {
        self
    }
}

impl Borrow<Segment> for SegmentBuf {
    fn borrow(&self) -> &Segment {
        self
    }
}

impl Deref for SegmentBuf {
    type Target = Segment;

    fn deref(&self) -> &Self::Target {
        unsafe { Segment::from_str_unchecked(&self.0) }
    }
}

impl Display for SegmentBuf {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for SegmentBuf {
    type Err = ParseSegmentError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Segment::parse(s)?.to_owned())
    }
}

impl From<&Segment> for SegmentBuf {
    fn from(value: &Segment) -> Self {
        value.to_owned()
    }
}

//------------ Namespace -----------------------------------------------------

/// The first level under which keys of a store are grouped.
///
/// Namespaces are more restrictive than segments: only ASCII alphanumeric
/// characters, dash and underscore are allowed. This keeps them safe for
/// use as directory or database names.
#[derive(Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[repr(transparent)]
pub struct Namespace(str);

impl Namespace {
    pub const fn parse(value: &str) -> Result<&Self, ParseSegmentError> {
        if value.is_empty() {
            return Err(ParseSegmentError::Empty);
        }
        let bytes = value.as_bytes();
        let mut i = 0;
        while i < bytes.len() {
            let b = bytes[i];
            if !b.is_ascii_alphanumeric() && b != b'-' && b != b'_' {
                return Err(ParseSegmentError::IllegalCharacter);
            }
            i += 1;
        }
        // Safety: all checks performed above.
        Ok(unsafe { Namespace::from_str_unchecked(value) })
    }

    /// Creates a namespace from the given string slice or panics.
    ///
    /// This function should be used to create namespace constants.
    pub const fn make(s: &str) -> &Self {
        match Self::parse(s) {
            Ok(ns) => ns,
            Err(_) => panic!("invalid namespace constant"),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// # Safety
    /// The string must only contain valid namespace characters.
    pub const unsafe fn from_str_unchecked(s: &str) -> &Self {
        unsafe { &*(s as *const str as *const Self) }
    }
}

impl Display for Namespace {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", &self.0)
    }
}

impl ToOwned for Namespace {
    type Owned = NamespaceBuf;

    fn to_owned(&self) -> Self::Owned {
        NamespaceBuf(self.0.to_string())
    }
}

//------------ NamespaceBuf --------------------------------------------------

/// The owned variant of [`Namespace`].
#[derive(Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[repr(transparent)]
pub struct NamespaceBuf(String);

impl AsRef<Namespace> for NamespaceBuf {
    fn as_ref(&self) -> &Namespace {
        self
    }
}

impl Borrow<Namespace> for NamespaceBuf {
    fn borrow(&self) -> &Namespace {
        self
    }
}

impl Deref for NamespaceBuf {
    type Target = Namespace;

    fn deref(&self) -> &Self::Target {
        unsafe { Namespace::from_str_unchecked(&self.0) }
    }
}

impl Display for NamespaceBuf {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for NamespaceBuf {
    type Err = ParseSegmentError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Namespace::parse(s)?.to_owned())
    }
}

impl From<&Namespace> for NamespaceBuf {
    fn from(value: &Namespace) -> Self {
        value.to_owned()
    }
}

//------------ ParseSegmentError ---------------------------------------------

#[derive(Clone, Copy, Debug)]
pub enum ParseSegmentError {
    Empty,
    SurroundingWhitespace,
    ContainsSeparator,
    IllegalCharacter,
}

impl Display for ParseSegmentError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            ParseSegmentError::Empty => write!(f, "empty identifier"),
            ParseSegmentError::SurroundingWhitespace => {
                write!(f, "identifier starts or ends with whitespace")
            }
            ParseSegmentError::ContainsSeparator => {
                write!(f, "identifier contains scope separator")
            }
            ParseSegmentError::IllegalCharacter => {
                write!(f, "identifier contains an illegal character")
            }
        }
    }
}

impl std::error::Error for ParseSegmentError {}
