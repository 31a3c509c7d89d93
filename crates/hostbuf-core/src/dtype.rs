use half::f16;

use crate::FormatSpec;

/// The category of value stored in an element, independent of its width.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum ValueKind {
    SignedInt,
    UnsignedInt,
    Float,
    Bool,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum DType {
    Bool,
    I8,
    I16,
    I32,
    I64,
    U8,
    U16,
    U32,
    U64,
    F16,
    F32,
    F64,
}

impl DType {
    pub const ALL: [DType; 12] = [
        DType::Bool,
        DType::I8,
        DType::I16,
        DType::I32,
        DType::I64,
        DType::U8,
        DType::U16,
        DType::U32,
        DType::U64,
        DType::F16,
        DType::F32,
        DType::F64,
    ];

    /// Returns the size of the type in bytes.
    pub fn size_of(self) -> usize {
        match self {
            DType::Bool | DType::I8 | DType::U8 => 1,
            DType::I16 | DType::U16 | DType::F16 => 2,
            DType::I32 | DType::U32 | DType::F32 => 4,
            DType::I64 | DType::U64 | DType::F64 => 8,
        }
    }

    pub fn kind(self) -> ValueKind {
        match self {
            DType::Bool => ValueKind::Bool,
            DType::I8 | DType::I16 | DType::I32 | DType::I64 => ValueKind::SignedInt,
            DType::U8 | DType::U16 | DType::U32 | DType::U64 => ValueKind::UnsignedInt,
            DType::F16 | DType::F32 | DType::F64 => ValueKind::Float,
        }
    }

    /// The canonical buffer-protocol type code for this dtype.
    pub fn code(self) -> char {
        match self {
            DType::Bool => '?',
            DType::I8 => 'b',
            DType::I16 => 'h',
            DType::I32 => 'i',
            DType::I64 => 'q',
            DType::U8 => 'B',
            DType::U16 => 'H',
            DType::U32 => 'I',
            DType::U64 => 'Q',
            DType::F16 => 'e',
            DType::F32 => 'f',
            DType::F64 => 'd',
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DTypeError {
    #[error("Type mismatch, buffer format {format:?} cannot be read as {expected}.")]
    TypeMismatch {
        expected: &'static str,
        format: String,
    },
    #[error("Size mismatch, {expected} is {expected_size} bytes wide, buffer holds {actual}-byte items.")]
    SizeMismatch {
        expected: &'static str,
        expected_size: usize,
        actual: usize,
    },
}

/// A Rust type that can be read directly out of host memory.
///
/// # Safety
///
/// Every bit pattern the host may store under a format accepted for this
/// type must be a valid value of the type. Implementations returning `None`
/// from [`Element::dt`] are opaque: their format is never checked, so the
/// type must be valid for any bit pattern of its size.
pub unsafe trait Element:
    Copy + std::fmt::Debug + PartialEq + Send + Sync + 'static
{
    /// The dtype this element corresponds to, `None` for opaque types.
    fn dt() -> Option<DType>;
}

/// A host boolean, stored as one byte.
///
/// The `'?'` format only promises a byte: any non-zero value is true. Reads
/// never reinterpret host memory as a Rust `bool`, which must be 0 or 1.
#[derive(Default, Copy, Clone)]
#[repr(transparent)]
pub struct HostBool(u8);

impl HostBool {
    pub const TRUE: HostBool = HostBool(1);
    pub const FALSE: HostBool = HostBool(0);

    pub fn get(self) -> bool {
        self.0 != 0
    }

    /// The byte as stored by the host.
    pub fn raw(self) -> u8 {
        self.0
    }
}

impl PartialEq for HostBool {
    fn eq(&self, other: &Self) -> bool {
        self.get() == other.get()
    }
}

impl Eq for HostBool {}

impl std::fmt::Debug for HostBool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self.get())
    }
}

impl From<bool> for HostBool {
    fn from(value: bool) -> Self {
        HostBool(value as u8)
    }
}

impl From<HostBool> for bool {
    fn from(value: HostBool) -> Self {
        value.get()
    }
}

unsafe impl bytemuck::Zeroable for HostBool {}
unsafe impl bytemuck::Pod for HostBool {}

macro_rules! map_type {
    ($t:ty, $v:ident) => {
        unsafe impl Element for $t {
            fn dt() -> Option<DType> {
                Some(DType::$v)
            }
        }
    };
}

map_type!(HostBool, Bool);
map_type!(i8, I8);
map_type!(i16, I16);
map_type!(i32, I32);
map_type!(i64, I64);
map_type!(u8, U8);
map_type!(u16, U16);
map_type!(u32, U32);
map_type!(u64, U64);
map_type!(f16, F16);
map_type!(f32, F32);
map_type!(f64, F64);

#[cfg(target_pointer_width = "64")]
map_type!(isize, I64);
#[cfg(target_pointer_width = "64")]
map_type!(usize, U64);
#[cfg(target_pointer_width = "32")]
map_type!(isize, I32);
#[cfg(target_pointer_width = "32")]
map_type!(usize, U32);

/// Checks a buffer's format string against the requested element type.
///
/// A missing or empty format means unsigned bytes, as in the buffer
/// protocol. Opaque element types accept any format.
pub fn validate_format<T: Element>(format: Option<&str>) -> Result<(), DTypeError> {
    check_format(T::dt(), std::any::type_name::<T>(), format)
}

/// Checks that the buffer's item size is exactly the width of `T`.
pub fn validate_itemsize<T: Element>(itemsize: usize) -> Result<(), DTypeError> {
    let expected_size = std::mem::size_of::<T>();
    if itemsize != expected_size {
        return Err(DTypeError::SizeMismatch {
            expected: std::any::type_name::<T>(),
            expected_size,
            actual: itemsize,
        });
    }
    Ok(())
}

pub(crate) fn check_format(
    expected: Option<DType>,
    type_name: &'static str,
    format: Option<&str>,
) -> Result<(), DTypeError> {
    let Some(expected) = expected else {
        log::trace!("Skipping format validation for opaque element {}", type_name);
        return Ok(());
    };
    let format = match format {
        None | Some("") => "B",
        Some(f) => f,
    };
    let mismatch = || DTypeError::TypeMismatch {
        expected: type_name,
        format: format.to_string(),
    };

    let spec = match FormatSpec::parse(format) {
        Ok(spec) => spec,
        Err(e) => {
            let mut chars = format.chars();
            if chars.next() == Some(expected.code()) && chars.next().is_none() {
                return Ok(());
            }
            log::debug!("{}", e);
            return Err(mismatch());
        }
    };

    if spec.width() != expected.size_of() {
        return Err(DTypeError::SizeMismatch {
            expected: type_name,
            expected_size: expected.size_of(),
            actual: spec.width(),
        });
    }
    if spec.kind() != expected.kind() {
        return Err(mismatch());
    }
    // Multi-byte values in foreign byte order would need swapping on every read.
    if spec.width() > 1 && !spec.order.matches_host() {
        return Err(mismatch());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ByteOrder, TYPE_CODES};

    #[test]
    fn agreeing_codes_pass_and_disagreeing_fail() {
        for code in TYPE_CODES.iter() {
            let format = code.code.to_string();
            let width = code.width(ByteOrder::Native).unwrap();
            for dt in DType::ALL {
                let result = check_format(Some(dt), "T", Some(&format));
                let agrees = width == dt.size_of() && code.kind == dt.kind();
                assert_eq!(
                    result.is_ok(),
                    agrees,
                    "format {:?} vs {:?}: {:?}",
                    format,
                    dt,
                    result
                );
                if width != dt.size_of() {
                    assert!(matches!(result, Err(DTypeError::SizeMismatch { .. })));
                } else if !agrees {
                    assert!(matches!(result, Err(DTypeError::TypeMismatch { .. })));
                }
            }
        }
    }

    #[test]
    fn canonical_codes_round_trip() {
        for dt in DType::ALL {
            let spec = FormatSpec::parse(&dt.code().to_string()).unwrap();
            assert_eq!(spec.width(), dt.size_of());
            assert_eq!(spec.kind(), dt.kind());
        }
    }

    #[test]
    fn typed_validation() {
        assert!(validate_format::<i64>(Some("q")).is_ok());
        assert!(validate_format::<i64>(Some("<q")).is_ok() == cfg!(target_endian = "little"));
        assert!(validate_format::<i64>(Some("i8")).is_ok());
        assert!(matches!(
            validate_format::<i64>(Some("d")),
            Err(DTypeError::TypeMismatch { .. })
        ));
        assert!(matches!(
            validate_format::<i64>(Some("i")),
            Err(DTypeError::SizeMismatch {
                expected_size: 8,
                actual: 4,
                ..
            })
        ));
        assert!(validate_format::<f16>(Some("e")).is_ok());
        assert!(validate_format::<HostBool>(Some("?")).is_ok());
        assert!(validate_format::<HostBool>(Some("B")).is_err());
    }

    #[test]
    fn missing_format_means_bytes() {
        assert!(validate_format::<u8>(None).is_ok());
        assert!(validate_format::<u8>(Some("")).is_ok());
        assert!(validate_format::<i8>(None).is_err());
    }

    #[test]
    fn unparseable_format_is_a_type_mismatch() {
        assert!(matches!(
            validate_format::<f64>(Some("T{d:x:}")),
            Err(DTypeError::TypeMismatch { .. })
        ));
    }

    #[test]
    fn foreign_byte_order_is_rejected() {
        let foreign = if cfg!(target_endian = "little") { ">d" } else { "<d" };
        assert!(validate_format::<f64>(Some(foreign)).is_err());
        let single = if cfg!(target_endian = "little") { ">b" } else { "<b" };
        assert!(validate_format::<i8>(Some(single)).is_ok());
    }

    #[test]
    fn host_bools_are_truthy_bytes() {
        let stored: [HostBool; 3] = bytemuck::cast([0u8, 1, 2]);
        assert_eq!(stored.map(HostBool::get), [false, true, true]);
        assert_eq!(stored[2], HostBool::TRUE);
        assert_eq!(stored[2].raw(), 2);
        assert_eq!(HostBool::from(false), HostBool::FALSE);
        assert!(bool::from(stored[1]));
    }

    #[derive(Debug, Clone, Copy, PartialEq)]
    #[repr(C)]
    struct Rgb([u8; 3]);

    unsafe impl Element for Rgb {
        fn dt() -> Option<DType> {
            None
        }
    }

    #[test]
    fn opaque_elements_skip_format_checks() {
        assert!(validate_format::<Rgb>(Some("T{B:r:B:g:B:b:}")).is_ok());
        assert!(validate_itemsize::<Rgb>(3).is_ok());
        assert!(matches!(
            validate_itemsize::<Rgb>(4),
            Err(DTypeError::SizeMismatch { .. })
        ));
    }
}
