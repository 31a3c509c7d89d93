use std::alloc::Layout as AllocLayout;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use bytemuck::NoUninit;

use crate::{
    AcquisitionError, BufferDescriptor, BufferExporter, BufferFlags, Element, Layout, LayoutError,
    Shape, Strides,
};

#[derive(Debug)]
struct RawHostBuffer(*mut u8, AllocLayout);

impl RawHostBuffer {
    fn from_bytes(bytes: &[u8], alignment: usize) -> Self {
        let raw = Self::uninitialized(bytes.len(), alignment);
        if !bytes.is_empty() {
            unsafe { raw.0.copy_from_nonoverlapping(bytes.as_ptr(), bytes.len()) };
        }
        raw
    }

    fn uninitialized(size: usize, alignment: usize) -> Self {
        let layout = AllocLayout::from_size_align(size, alignment)
            .unwrap_or_else(|_| panic!("invalid host allocation: {} bytes at {}", size, alignment));
        let data = if size == 0 {
            std::ptr::null_mut()
        } else {
            let ptr = unsafe { std::alloc::alloc(layout) };
            if ptr.is_null() {
                std::alloc::handle_alloc_error(layout);
            }
            ptr
        };
        Self(data, layout)
    }

    fn n_bytes(&self) -> usize {
        self.1.size()
    }
}

impl Drop for RawHostBuffer {
    fn drop(&mut self) {
        if !self.0.is_null() && self.1.size() > 0 {
            log::trace!("Freeing host buffer {:p}", self.0);
            unsafe { std::alloc::dealloc(self.0, self.1) }
        }
    }
}

#[derive(Debug)]
struct HostStorage {
    raw: RawHostBuffer,
    exports: AtomicUsize,
}

unsafe impl Send for HostStorage {}
unsafe impl Sync for HostStorage {}

/// Keeps the storage alive for as long as a descriptor is lent out. The
/// export is returned when the token is dropped.
struct HostExport(Arc<HostStorage>);

impl Drop for HostExport {
    fn drop(&mut self) {
        self.0.exports.fetch_sub(1, Ordering::SeqCst);
    }
}

/// An in-process host array that lends out its memory through
/// [`BufferExporter`].
///
/// Clones and windows created with [`HostArray::transpose`] or
/// [`HostArray::as_strided`] share storage and the export counter, like array
/// views in a dynamic runtime.
#[derive(Debug, Clone)]
pub struct HostArray {
    storage: Arc<HostStorage>,
    offset: isize,
    layout: Layout,
    format: Option<String>,
    readonly: bool,
}

impl HostArray {
    /// Copies `data` into freshly allocated storage laid out row-major.
    pub fn from_slice<T: Element + NoUninit>(data: &[T], shape: Shape) -> Self {
        assert_eq!(data.len(), shape.numel());
        let bytes: &[u8] = bytemuck::cast_slice(data);
        let raw = RawHostBuffer::from_bytes(bytes, std::mem::align_of::<T>());
        Self {
            storage: Arc::new(HostStorage {
                raw,
                exports: AtomicUsize::new(0),
            }),
            offset: 0,
            layout: Layout::row_major(shape, std::mem::size_of::<T>()),
            format: T::dt().map(|dt| dt.code().to_string()),
            readonly: false,
        }
    }

    /// Overrides the advertised format string. `None` advertises no format,
    /// which consumers read as unsigned bytes.
    pub fn with_format(mut self, format: Option<&str>) -> Self {
        self.format = format.map(str::to_string);
        self
    }

    pub fn into_readonly(mut self) -> Self {
        self.readonly = true;
        self
    }

    /// A window over the same memory with the axis order reversed.
    pub fn transpose(&self) -> Self {
        Self {
            layout: self.layout.reversed(),
            ..self.clone()
        }
    }

    /// A window over the same memory with arbitrary geometry. `offset` is in
    /// bytes from the start of the storage.
    pub fn as_strided(
        &self,
        shape: Shape,
        strides: Strides,
        offset: isize,
    ) -> Result<Self, LayoutError> {
        let layout = Layout::analyze(shape, Some(strides), self.layout.itemsize())?;
        let (low, high) = layout.byte_bounds();
        let len = self.storage.raw.n_bytes();
        if layout.numel() > 0 && (offset + low < 0 || offset + high > len as isize) {
            return Err(LayoutError::OutOfBounds {
                low: offset + low,
                high: offset + high,
                len,
            });
        }
        Ok(Self {
            offset,
            layout,
            ..self.clone()
        })
    }

    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    pub fn is_readonly(&self) -> bool {
        self.readonly
    }

    /// Number of descriptors handed out over this storage and not yet
    /// released.
    pub fn outstanding_exports(&self) -> usize {
        self.storage.exports.load(Ordering::SeqCst)
    }

    /// Address of the first logical element.
    pub fn as_ptr(&self) -> *const u8 {
        self.base().cast_const()
    }

    fn base(&self) -> *mut u8 {
        self.storage.raw.0.wrapping_offset(self.offset)
    }

    /// Reads the logical elements in row-major order.
    pub fn to_vec<T: Element>(&self) -> Vec<T> {
        assert_eq!(std::mem::size_of::<T>(), self.layout.itemsize());
        (0..self.layout.numel())
            .map(|flat| {
                let offset = self.layout.byte_offset(&self.layout.unravel(flat));
                unsafe { self.base().offset(offset).cast::<T>().read_unaligned() }
            })
            .collect()
    }
}

impl BufferExporter for HostArray {
    fn get_buffer(&self, flags: BufferFlags) -> Result<BufferDescriptor, AcquisitionError> {
        if flags.contains(BufferFlags::WRITABLE) && self.readonly {
            return Err(AcquisitionError::ReadOnly);
        }
        let layout = &self.layout;
        let refused = |what: &str| {
            AcquisitionError::Refused(format!("{} requested, array has strides {:?}", what, layout.strides()))
        };
        if flags.contains(BufferFlags::C_CONTIGUOUS) && !layout.is_contiguous() {
            return Err(refused("C-contiguous buffer"));
        }
        if flags.contains(BufferFlags::F_CONTIGUOUS) && !layout.is_f_contiguous() {
            return Err(refused("Fortran-contiguous buffer"));
        }
        if flags.contains(BufferFlags::ANY_CONTIGUOUS)
            && !(layout.is_contiguous() || layout.is_f_contiguous())
        {
            return Err(refused("contiguous buffer"));
        }
        if !flags.contains(BufferFlags::STRIDES) && !layout.is_contiguous() {
            return Err(refused("buffer without strides"));
        }

        let (shape, strides) = if !flags.contains(BufferFlags::ND) {
            (crate::shape![layout.numel()], None)
        } else if flags.contains(BufferFlags::STRIDES) {
            (layout.shape().clone(), Some(layout.strides().clone()))
        } else {
            (layout.shape().clone(), None)
        };
        let format = if flags.contains(BufferFlags::FORMAT) {
            self.format.clone()
        } else {
            None
        };

        self.storage.exports.fetch_add(1, Ordering::SeqCst);
        let descriptor = BufferDescriptor::new(
            self.base(),
            layout.numel() * layout.itemsize(),
            shape,
            strides,
            format,
            layout.itemsize(),
            self.readonly,
            Box::new(HostExport(self.storage.clone())),
        );
        log::trace!("Exported {:?}", descriptor);
        Ok(descriptor)
    }

    fn release_buffer(&self, descriptor: &mut BufferDescriptor) {
        let Some(token) = descriptor.take_token() else {
            return;
        };
        match token.downcast::<HostExport>() {
            Ok(export) => drop(export),
            Err(_) => log::warn!("Ignoring release of a descriptor exported elsewhere"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shape;

    #[test]
    fn exports_are_counted_per_storage() {
        let array = HostArray::from_slice(&[1i32, 2, 3, 4], shape![2, 2]);
        let window = array.transpose();
        let mut a = array.get_buffer(BufferFlags::STRIDES).unwrap();
        let mut b = window.get_buffer(BufferFlags::STRIDES).unwrap();
        assert_eq!(array.outstanding_exports(), 2);
        window.release_buffer(&mut b);
        array.release_buffer(&mut a);
        array.release_buffer(&mut a);
        assert_eq!(array.outstanding_exports(), 0);
    }

    #[test]
    fn dropped_descriptors_return_their_export() {
        let array = HostArray::from_slice(&[1u16, 2], shape![2]);
        let descriptor = array.get_buffer(BufferFlags::STRIDES).unwrap();
        assert_eq!(array.outstanding_exports(), 1);
        drop(descriptor);
        assert_eq!(array.outstanding_exports(), 0);
    }

    #[test]
    fn flat_export_drops_dimensions() {
        let array = HostArray::from_slice(&[1u8, 2, 3, 4, 5, 6], shape![2, 3]);
        let mut descriptor = array.get_buffer(BufferFlags::SIMPLE).unwrap();
        assert_eq!(descriptor.shape, shape![6]);
        assert!(descriptor.strides.is_none());
        assert!(descriptor.format.is_none());
        array.release_buffer(&mut descriptor);
    }

    #[test]
    fn strided_windows_refuse_contiguous_requests() {
        let array = HostArray::from_slice(&[0f64; 6], shape![2, 3]);
        let window = array.transpose();
        assert!(matches!(
            window.get_buffer(BufferFlags::C_CONTIGUOUS),
            Err(AcquisitionError::Refused(_))
        ));
        assert!(window.get_buffer(BufferFlags::F_CONTIGUOUS).is_ok_and(|mut d| {
            window.release_buffer(&mut d);
            true
        }));
        assert!(matches!(
            window.get_buffer(BufferFlags::ND),
            Err(AcquisitionError::Refused(_))
        ));
        assert_eq!(array.outstanding_exports(), 0);
    }

    #[test]
    fn windows_read_logical_order() {
        let array = HostArray::from_slice(&[1.0f64, 2.0, 3.0, 4.0, 5.0, 6.0], shape![2, 3]);
        assert_eq!(array.transpose().to_vec::<f64>(), vec![1.0, 4.0, 2.0, 5.0, 3.0, 6.0]);
        let column = array
            .as_strided(shape![2], vec![24].into(), 16)
            .unwrap();
        assert_eq!(column.to_vec::<f64>(), vec![3.0, 6.0]);
        let reversed = array.as_strided(shape![3], vec![-8].into(), 16).unwrap();
        assert_eq!(reversed.to_vec::<f64>(), vec![3.0, 2.0, 1.0]);
    }

    #[test]
    fn windows_must_stay_inside_storage() {
        let array = HostArray::from_slice(&[0i64; 4], shape![4]);
        assert!(matches!(
            array.as_strided(shape![4], vec![16].into(), 0),
            Err(LayoutError::OutOfBounds { len: 32, .. })
        ));
        assert!(array.as_strided(shape![0], vec![16].into(), 64).is_ok());
    }
}
