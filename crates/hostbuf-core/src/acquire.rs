//! Negotiating buffer descriptors from host objects.
use std::any::Any;
use std::ops::BitOr;

use derive_new::new;

use crate::{RVec, Shape, Strides};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AcquisitionError {
    #[error("Object does not expose a buffer interface.")]
    NoBufferInterface,
    #[error("Write access requested on a read-only buffer.")]
    ReadOnly,
    #[error("Host refused the buffer request: {0}")]
    Refused(String),
    #[error("Host returned an invalid buffer descriptor: {0}")]
    InvalidDescriptor(String),
}

/// Capability flags sent with a buffer request.
///
/// The values match the host buffer protocol so they can be passed through
/// unchanged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct BufferFlags(u32);

impl BufferFlags {
    pub const SIMPLE: Self = Self(0);
    pub const WRITABLE: Self = Self(0x0001);
    pub const FORMAT: Self = Self(0x0004);
    pub const ND: Self = Self(0x0008);
    pub const STRIDES: Self = Self(0x0010 | 0x0008);
    pub const C_CONTIGUOUS: Self = Self(0x0020 | 0x0010 | 0x0008);
    pub const F_CONTIGUOUS: Self = Self(0x0040 | 0x0010 | 0x0008);
    pub const ANY_CONTIGUOUS: Self = Self(0x0080 | 0x0010 | 0x0008);

    pub const fn bits(self) -> u32 {
        self.0
    }

    pub const fn from_bits(bits: u32) -> Self {
        Self(bits)
    }

    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for BufferFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self::Output {
        Self(self.0 | rhs.0)
    }
}

/// Opaque per-export state an exporter needs back on release.
pub type ExportToken = Box<dyn Any + Send + Sync>;

/// A block of host memory lent out by a [`BufferExporter`].
///
/// The descriptor is released by handing it back to the exporter that
/// produced it. Release consumes the export token, so releasing twice is a
/// no-op. Exporters should also release when the token is dropped, so a
/// descriptor dropped without [`BufferExporter::release_buffer`] does not
/// leak its export.
pub struct BufferDescriptor {
    pub ptr: *mut u8,
    /// Length of the buffer in bytes.
    pub len: usize,
    pub shape: Shape,
    /// Byte strides, `None` when the exporter left them to the default.
    pub strides: Option<Strides>,
    pub format: Option<String>,
    pub itemsize: usize,
    pub readonly: bool,
    token: Option<ExportToken>,
}

unsafe impl Send for BufferDescriptor {}
unsafe impl Sync for BufferDescriptor {}

impl BufferDescriptor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        ptr: *mut u8,
        len: usize,
        shape: Shape,
        strides: Option<Strides>,
        format: Option<String>,
        itemsize: usize,
        readonly: bool,
        token: ExportToken,
    ) -> Self {
        Self {
            ptr,
            len,
            shape,
            strides,
            format,
            itemsize,
            readonly,
            token: Some(token),
        }
    }

    pub fn ndim(&self) -> usize {
        self.shape.len()
    }

    pub fn is_released(&self) -> bool {
        self.token.is_none()
    }

    /// Takes the export token, leaving the descriptor released. Returns
    /// `None` if it was already released.
    pub fn take_token(&mut self) -> Option<ExportToken> {
        self.token.take()
    }

    /// Borrows the export token of a live descriptor.
    pub fn token(&self) -> Option<&(dyn Any + Send + Sync)> {
        self.token.as_deref()
    }
}

impl std::fmt::Debug for BufferDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferDescriptor")
            .field("ptr", &self.ptr)
            .field("len", &self.len)
            .field("shape", &self.shape)
            .field("strides", &self.strides)
            .field("format", &self.format)
            .field("itemsize", &self.itemsize)
            .field("readonly", &self.readonly)
            .field("released", &self.is_released())
            .finish()
    }
}

/// A host object that can lend out its backing memory.
///
/// Every descriptor returned by [`BufferExporter::get_buffer`] keeps the
/// backing storage alive until it is passed to
/// [`BufferExporter::release_buffer`].
pub trait BufferExporter: Send + Sync {
    fn has_buffer_interface(&self) -> bool {
        true
    }

    fn get_buffer(&self, flags: BufferFlags) -> Result<BufferDescriptor, AcquisitionError>;

    /// Returns a descriptor to the host. Must tolerate descriptors that were
    /// already released.
    fn release_buffer(&self, descriptor: &mut BufferDescriptor);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AccessMode {
    Read,
    Write,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum LayoutPreference {
    /// Ask for a C-contiguous buffer, accepting a strided one if the host
    /// cannot provide it.
    #[default]
    Contiguous,
    /// Accept whatever layout the host has.
    Strided,
}

#[derive(new, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BufferRequest {
    pub mode: AccessMode,
    pub layout: LayoutPreference,
}

impl BufferRequest {
    pub fn flags(&self) -> BufferFlags {
        let layout = match self.layout {
            LayoutPreference::Contiguous => BufferFlags::C_CONTIGUOUS,
            LayoutPreference::Strided => BufferFlags::STRIDES,
        };
        let flags = layout | BufferFlags::FORMAT;
        match self.mode {
            AccessMode::Read => flags,
            AccessMode::Write => flags | BufferFlags::WRITABLE,
        }
    }
}

/// Requests a descriptor from `source` for `request`.
///
/// A refused contiguous request is retried with strided flags. Any check that
/// fails after the host handed out a descriptor releases it before the error
/// is returned.
///
/// The caller owns the returned descriptor and hands it back through
/// `source.release_buffer` when done. Views do this on release and drop.
pub fn acquire(
    source: &dyn BufferExporter,
    request: BufferRequest,
) -> Result<BufferDescriptor, AcquisitionError> {
    if !source.has_buffer_interface() {
        return Err(AcquisitionError::NoBufferInterface);
    }

    let mut descriptor = match source.get_buffer(request.flags()) {
        Err(AcquisitionError::Refused(reason))
            if request.layout == LayoutPreference::Contiguous =>
        {
            log::debug!(
                "Contiguous buffer refused ({}), retrying with strided flags",
                reason
            );
            let strided = BufferRequest::new(request.mode, LayoutPreference::Strided);
            source.get_buffer(strided.flags())?
        }
        result => result?,
    };

    if let Err(e) = check_descriptor(&descriptor, request.mode) {
        source.release_buffer(&mut descriptor);
        return Err(e);
    }

    log::trace!(
        "Acquired buffer {:p} ({} bytes, shape {:?}, format {:?})",
        descriptor.ptr,
        descriptor.len,
        descriptor.shape,
        descriptor.format
    );
    Ok(descriptor)
}

fn check_descriptor(descriptor: &BufferDescriptor, mode: AccessMode) -> Result<(), AcquisitionError> {
    if mode == AccessMode::Write && descriptor.readonly {
        return Err(AcquisitionError::ReadOnly);
    }
    if descriptor.is_released() {
        return Err(AcquisitionError::InvalidDescriptor(
            "descriptor carries no export token".to_string(),
        ));
    }
    if let Some(strides) = &descriptor.strides {
        if strides.len() != descriptor.ndim() {
            return Err(AcquisitionError::InvalidDescriptor(format!(
                "{} strides for {} dimensions",
                strides.len(),
                descriptor.ndim()
            )));
        }
    }
    if descriptor.itemsize == 0 {
        return Err(AcquisitionError::InvalidDescriptor(
            "zero item size".to_string(),
        ));
    }
    if descriptor.ptr.is_null() && descriptor.len > 0 {
        return Err(AcquisitionError::InvalidDescriptor(
            "null data pointer".to_string(),
        ));
    }
    Ok(())
}

/// Copies host-provided extent/stride arrays into owned metadata.
///
/// # Safety
///
/// `shape` must point to `ndim` extents and `strides`, when non-null, to
/// `ndim` strides.
pub unsafe fn metadata_from_raw(
    ndim: usize,
    shape: *const isize,
    strides: *const isize,
    itemsize: usize,
    len: usize,
) -> Result<(Shape, Option<Strides>), AcquisitionError> {
    let shape: RVec<usize> = if ndim == 0 {
        RVec::new()
    } else if shape.is_null() {
        // Without ND the host describes a flat run of bytes.
        let mut flat = RVec::new();
        flat.push(len / itemsize.max(1));
        return Ok((Shape::new(flat), None));
    } else {
        let raw = std::slice::from_raw_parts(shape, ndim);
        raw.iter()
            .map(|&d| {
                usize::try_from(d).map_err(|_| {
                    AcquisitionError::InvalidDescriptor(format!("negative extent {}", d))
                })
            })
            .collect::<Result<_, _>>()?
    };
    let strides = if strides.is_null() || ndim == 0 {
        None
    } else {
        Some(Strides::from(std::slice::from_raw_parts(strides, ndim)))
    };
    Ok((Shape::new(shape), strides))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{shape, HostArray};

    #[test]
    fn request_flags() {
        let read = BufferRequest::new(AccessMode::Read, LayoutPreference::Strided).flags();
        assert!(read.contains(BufferFlags::STRIDES));
        assert!(read.contains(BufferFlags::FORMAT));
        assert!(!read.contains(BufferFlags::WRITABLE));
        assert!(!read.contains(BufferFlags::C_CONTIGUOUS));

        let write = BufferRequest::new(AccessMode::Write, LayoutPreference::Contiguous).flags();
        assert!(write.contains(BufferFlags::C_CONTIGUOUS));
        assert!(write.contains(BufferFlags::WRITABLE));
        assert_eq!(write.bits(), 0x3d);
    }

    #[test]
    fn write_on_readonly_source_fails_without_leaking() {
        let array = HostArray::from_slice(&[1i64, 2, 3], shape![3]).into_readonly();
        let request = BufferRequest::new(AccessMode::Write, LayoutPreference::Strided);
        assert_eq!(
            acquire(&array, request).unwrap_err(),
            AcquisitionError::ReadOnly
        );
        assert_eq!(array.outstanding_exports(), 0);
    }

    #[test]
    fn contiguous_request_falls_back_to_strided() {
        let array = HostArray::from_slice(&[1.0f64, 2.0, 3.0, 4.0, 5.0, 6.0], shape![2, 3]);
        let transposed = array.transpose();
        let request = BufferRequest::new(AccessMode::Read, LayoutPreference::Contiguous);
        let mut descriptor = acquire(&transposed, request).unwrap();
        assert_eq!(descriptor.strides.as_ref().unwrap().to_vec(), vec![8, 24]);
        assert_eq!(array.outstanding_exports(), 1);
        transposed.release_buffer(&mut descriptor);
        transposed.release_buffer(&mut descriptor);
        assert_eq!(array.outstanding_exports(), 0);
    }

    #[test]
    fn raw_metadata_copies() {
        let shape = [2isize, 3];
        let strides = [24isize, 8];
        let (s, st) =
            unsafe { metadata_from_raw(2, shape.as_ptr(), strides.as_ptr(), 8, 48) }.unwrap();
        assert_eq!(s, shape![2, 3]);
        assert_eq!(st.unwrap().to_vec(), vec![24, 8]);

        let (s, st) =
            unsafe { metadata_from_raw(1, std::ptr::null(), std::ptr::null(), 8, 48) }.unwrap();
        assert_eq!(s, shape![6]);
        assert!(st.is_none());

        let bad = [-1isize];
        assert!(unsafe { metadata_from_raw(1, bad.as_ptr(), std::ptr::null(), 8, 0) }.is_err());
    }
}
