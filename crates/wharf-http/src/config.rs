use std::ops::{BitAnd, BitOr};

/// Set of RFCs the parser enforces strictly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Compliance(u16);

impl Compliance {
    pub const NONE: Self = Self(0);
    pub const RFC1945: Self = Self(0x0001);
    pub const RFC2616: Self = Self(0x0002);
    pub const RFC7230: Self = Self(0x0004);
    pub const RFC7231: Self = Self(0x0008);
    pub const RFC7232: Self = Self(0x0010);
    pub const RFC7233: Self = Self(0x0020);
    pub const RFC7234: Self = Self(0x0040);
    pub const RFC7235: Self = Self(0x0080);
    pub const RFC7540: Self = Self(0x0100);
    pub const RFC7541: Self = Self(0x0200);

    pub fn bits(self) -> u16 {
        self.0
    }

    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

impl Default for Compliance {
    fn default() -> Self {
        Self::RFC7230
    }
}

impl BitOr for Compliance {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitAnd for Compliance {
    type Output = Self;

    fn bitand(self, rhs: Self) -> Self {
        Self(self.0 & rhs.0)
    }
}

/// Parser and connection limits.
#[derive(Debug, Clone)]
pub struct HttpConfig {
    pub compliance: Compliance,
    /// Longest accepted start or header line, in bytes.
    pub max_line_length: usize,
    /// Largest accepted declared `Content-Length`.
    pub max_content_length: usize,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            compliance: Compliance::default(),
            max_line_length: 8192,
            max_content_length: usize::MAX,
        }
    }
}
