//! Parsing of buffer-protocol format strings.
//!
//! A format is an optional byte-order marker, a single type code and an
//! optional decimal byte width that overrides the code's default width:
//!
//! ```text
//! format := [ '@' | '=' | '<' | '>' | '!' ] code [ digits ]
//! code   := '?' | 'b' | 'B' | 'h' | 'H' | 'i' | 'I' | 'l' | 'L'
//!         | 'q' | 'Q' | 'n' | 'N' | 'e' | 'f' | 'd'
//! ```
use crate::ValueKind;
use std::os::raw::c_long;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FormatError {
    #[error("Unparseable buffer format {0:?}.")]
    Unparseable(String),
    #[error("Unknown type code {code:?} in buffer format {format:?}.")]
    UnknownCode { code: char, format: String },
}

/// Byte order and sizing mode selected by the leading marker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ByteOrder {
    /// `@` or no marker: native order, native sizes.
    #[default]
    Native,
    /// `=`: native order, standard sizes.
    Standard,
    /// `<`
    Little,
    /// `>` or `!`
    Big,
}

impl ByteOrder {
    fn from_marker(c: char) -> Option<Self> {
        match c {
            '@' => Some(ByteOrder::Native),
            '=' => Some(ByteOrder::Standard),
            '<' => Some(ByteOrder::Little),
            '>' | '!' => Some(ByteOrder::Big),
            _ => None,
        }
    }

    pub fn uses_native_sizes(self) -> bool {
        matches!(self, ByteOrder::Native)
    }

    /// Whether values in this order can be read without byte swapping.
    pub fn matches_host(self) -> bool {
        match self {
            ByteOrder::Native | ByteOrder::Standard => true,
            ByteOrder::Little => cfg!(target_endian = "little"),
            ByteOrder::Big => cfg!(target_endian = "big"),
        }
    }
}

/// One entry of the type code table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TypeCode {
    pub code: char,
    pub kind: ValueKind,
    standard_width: usize,
    native_width: usize,
}

const fn tc(code: char, kind: ValueKind, standard_width: usize, native_width: usize) -> TypeCode {
    TypeCode {
        code,
        kind,
        standard_width,
        native_width,
    }
}

const LONG: usize = std::mem::size_of::<c_long>();
const SSIZE: usize = std::mem::size_of::<isize>();

/// Every type code the validator understands. `n`/`N` have no standard size.
pub const TYPE_CODES: [TypeCode; 16] = [
    tc('?', ValueKind::Bool, 1, 1),
    tc('b', ValueKind::SignedInt, 1, 1),
    tc('B', ValueKind::UnsignedInt, 1, 1),
    tc('h', ValueKind::SignedInt, 2, 2),
    tc('H', ValueKind::UnsignedInt, 2, 2),
    tc('i', ValueKind::SignedInt, 4, 4),
    tc('I', ValueKind::UnsignedInt, 4, 4),
    tc('l', ValueKind::SignedInt, 4, LONG),
    tc('L', ValueKind::UnsignedInt, 4, LONG),
    tc('q', ValueKind::SignedInt, 8, 8),
    tc('Q', ValueKind::UnsignedInt, 8, 8),
    tc('n', ValueKind::SignedInt, 0, SSIZE),
    tc('N', ValueKind::UnsignedInt, 0, SSIZE),
    tc('e', ValueKind::Float, 2, 2),
    tc('f', ValueKind::Float, 4, 4),
    tc('d', ValueKind::Float, 8, 8),
];

impl TypeCode {
    pub fn lookup(code: char) -> Option<TypeCode> {
        TYPE_CODES.iter().copied().find(|t| t.code == code)
    }

    /// Width in bytes under the given byte order, `None` if the code has no
    /// size in that mode.
    pub fn width(&self, order: ByteOrder) -> Option<usize> {
        let width = if order.uses_native_sizes() {
            self.native_width
        } else {
            self.standard_width
        };
        (width != 0).then_some(width)
    }
}

/// A parsed single-element format string.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FormatSpec {
    pub order: ByteOrder,
    pub code: TypeCode,
    width: usize,
}

impl FormatSpec {
    pub fn parse(format: &str) -> Result<Self, FormatError> {
        let unparseable = || FormatError::Unparseable(format.to_string());
        let mut chars = format.chars().peekable();

        let order = match chars.peek().copied().and_then(ByteOrder::from_marker) {
            Some(order) => {
                chars.next();
                order
            }
            None => ByteOrder::Native,
        };

        let code_char = chars.next().ok_or_else(unparseable)?;
        let code = TypeCode::lookup(code_char).ok_or_else(|| FormatError::UnknownCode {
            code: code_char,
            format: format.to_string(),
        })?;

        let digits: String = chars.collect();
        let width = if digits.is_empty() {
            code.width(order).ok_or_else(unparseable)?
        } else {
            if !digits.chars().all(|c| c.is_ascii_digit()) {
                return Err(unparseable());
            }
            match digits.parse::<usize>() {
                Ok(w) if w > 0 => w,
                _ => return Err(unparseable()),
            }
        };

        Ok(Self { order, code, width })
    }

    /// Effective element width in bytes.
    pub fn width(&self) -> usize {
        self.width
    }

    pub fn kind(&self) -> ValueKind {
        self.code.kind
    }
}

impl std::str::FromStr for FormatSpec {
    type Err = FormatError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}
