use std::marker::PhantomData;
use std::ptr::NonNull;
use std::sync::Arc;

use crate::{
    acquire, validate_format, validate_itemsize, AccessMode, AcquisitionError, BufferDescriptor,
    BufferExporter, BufferRequest, DTypeError, Element, IndexedIter, Iter, IterMut, Layout,
    LayoutError, LayoutPreference, Shape, Strides,
};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ViewError {
    #[error(transparent)]
    Acquisition(#[from] AcquisitionError),
    #[error(transparent)]
    DType(#[from] DTypeError),
    #[error(transparent)]
    Layout(#[from] LayoutError),
    #[error("Dimension mismatch, expected {expected} indices, got {actual}.")]
    DimensionMismatch { expected: usize, actual: usize },
    #[error("Index {index} is out of range for extent {extent} (axis {axis:?}).")]
    IndexOutOfRange {
        index: usize,
        extent: usize,
        axis: Option<usize>,
    },
    #[error("View was used after it was released.")]
    UseAfterRelease,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ViewState {
    Active,
    Released,
}

/// State shared by read and write views: the descriptor, a keep-alive
/// handle on its exporter and the validated layout.
struct ViewCore<T> {
    source: Arc<dyn BufferExporter>,
    descriptor: BufferDescriptor,
    layout: Layout,
    base: *mut u8,
    aligned: bool,
    state: ViewState,
    _marker: PhantomData<T>,
}

impl<T: Element> ViewCore<T> {
    fn acquire(
        source: Arc<dyn BufferExporter>,
        request: BufferRequest,
    ) -> Result<Self, ViewError> {
        let descriptor = acquire(source.as_ref(), request)?;
        Self::from_descriptor(source, descriptor, request.mode)
    }

    fn from_descriptor(
        source: Arc<dyn BufferExporter>,
        mut descriptor: BufferDescriptor,
        mode: AccessMode,
    ) -> Result<Self, ViewError> {
        if descriptor.is_released() {
            return Err(AcquisitionError::InvalidDescriptor(
                "descriptor was already released".to_string(),
            )
            .into());
        }
        let layout = match Self::validate(&descriptor, mode) {
            Ok(layout) => layout,
            Err(e) => {
                log::debug!("Rejecting {:?}: {}", descriptor, e);
                source.release_buffer(&mut descriptor);
                return Err(e);
            }
        };
        let base = descriptor.ptr;
        let aligned = layout.is_aligned_for::<T>(base);
        Ok(Self {
            source,
            descriptor,
            layout,
            base,
            aligned,
            state: ViewState::Active,
            _marker: PhantomData,
        })
    }

    fn validate(descriptor: &BufferDescriptor, mode: AccessMode) -> Result<Layout, ViewError> {
        if mode == AccessMode::Write && descriptor.readonly {
            return Err(AcquisitionError::ReadOnly.into());
        }
        validate_itemsize::<T>(descriptor.itemsize)?;
        validate_format::<T>(descriptor.format.as_deref())?;
        let layout = Layout::analyze(
            descriptor.shape.clone(),
            descriptor.strides.clone(),
            descriptor.itemsize,
        )?;
        Ok(layout)
    }

    fn release(&mut self) {
        if self.state == ViewState::Released {
            return;
        }
        self.state = ViewState::Released;
        log::trace!("Releasing buffer {:p}", self.descriptor.ptr);
        self.source.release_buffer(&mut self.descriptor);
    }

    fn live(&self) -> Result<(), ViewError> {
        match self.state {
            ViewState::Active => Ok(()),
            ViewState::Released => Err(ViewError::UseAfterRelease),
        }
    }

    fn require_contiguous(&self) -> Result<(), ViewError> {
        self.live()?;
        if !self.layout.is_contiguous() {
            return Err(LayoutError::NotContiguous(self.layout.strides().clone()).into());
        }
        Ok(())
    }

    fn require_aligned(&self) -> Result<(), ViewError> {
        if !self.aligned {
            return Err(LayoutError::Misaligned(std::any::type_name::<T>()).into());
        }
        Ok(())
    }

    fn flat_offset(&self, index: usize) -> Result<isize, ViewError> {
        self.require_contiguous()?;
        if index >= self.layout.numel() {
            return Err(ViewError::IndexOutOfRange {
                index,
                extent: self.layout.numel(),
                axis: None,
            });
        }
        Ok((index * self.layout.itemsize()) as isize)
    }

    fn multi_offset(&self, index: &[usize]) -> Result<isize, ViewError> {
        self.live()?;
        self.layout.checked_byte_offset(index)
    }

    unsafe fn read(&self, offset: isize) -> T {
        self.base.offset(offset).cast::<T>().read_unaligned()
    }

    unsafe fn write(&self, offset: isize, value: T) {
        self.base.offset(offset).cast::<T>().write_unaligned(value)
    }

    fn slice_ptr(&self) -> Result<*mut T, ViewError> {
        self.require_contiguous()?;
        self.require_aligned()?;
        if self.layout.numel() == 0 || self.base.is_null() {
            return Ok(NonNull::<T>::dangling().as_ptr());
        }
        Ok(self.base.cast::<T>())
    }
}

impl<T> Drop for ViewCore<T> {
    fn drop(&mut self) {
        if self.state == ViewState::Active {
            self.state = ViewState::Released;
            self.source.release_buffer(&mut self.descriptor);
        }
    }
}

macro_rules! impl_view_reads {
    ($view:ident) => {
        impl<T: Element> $view<T> {
            /// Wraps a descriptor already obtained from `source`. The
            /// descriptor is released if validation fails.
            pub fn from_descriptor(
                source: Arc<dyn BufferExporter>,
                descriptor: BufferDescriptor,
            ) -> Result<Self, ViewError> {
                ViewCore::from_descriptor(source, descriptor, Self::MODE).map(|core| Self { core })
            }

            /// Number of elements.
            pub fn count(&self) -> usize {
                self.core.layout.numel()
            }

            pub fn ndim(&self) -> usize {
                self.core.layout.rank()
            }

            pub fn shape(&self) -> &Shape {
                self.core.layout.shape()
            }

            pub fn strides(&self) -> &Strides {
                self.core.layout.strides()
            }

            pub fn layout(&self) -> &Layout {
                &self.core.layout
            }

            pub fn itemsize(&self) -> usize {
                self.core.layout.itemsize()
            }

            pub fn format(&self) -> Option<&str> {
                self.core.descriptor.format.as_deref()
            }

            pub fn is_contiguous(&self) -> bool {
                self.core.layout.is_contiguous()
            }

            pub fn is_f_contiguous(&self) -> bool {
                self.core.layout.is_f_contiguous()
            }

            pub fn state(&self) -> ViewState {
                self.core.state
            }

            pub fn is_released(&self) -> bool {
                self.core.state == ViewState::Released
            }

            /// Element at a flat row-major index. Contiguous views only.
            pub fn get(&self, index: usize) -> Result<T, ViewError> {
                let offset = self.core.flat_offset(index)?;
                Ok(unsafe { self.core.read(offset) })
            }

            /// Element at a multi-index, for any layout.
            pub fn get_at(&self, index: &[usize]) -> Result<T, ViewError> {
                let offset = self.core.multi_offset(index)?;
                Ok(unsafe { self.core.read(offset) })
            }

            /// # Safety
            ///
            /// The view must be active and contiguous and `index` less than
            /// [`Self::count`].
            pub unsafe fn get_unchecked(&self, index: usize) -> T {
                self.core.read((index * self.core.layout.itemsize()) as isize)
            }

            /// # Safety
            ///
            /// The view must be active and `index` in bounds on every axis.
            pub unsafe fn get_at_unchecked(&self, index: &[usize]) -> T {
                self.core.read(self.core.layout.byte_offset(index))
            }

            /// Pointer to the first element of a contiguous view. The
            /// pointer may be unaligned for foreign buffers.
            pub fn as_ptr(&self) -> Result<*const T, ViewError> {
                self.core.require_contiguous()?;
                Ok(self.core.base.cast_const().cast::<T>())
            }

            pub fn as_slice(&self) -> Result<&[T], ViewError> {
                let ptr = self.core.slice_ptr()?;
                Ok(unsafe { std::slice::from_raw_parts(ptr, self.count()) })
            }

            /// Row-major element iterator. Each call starts a fresh pass.
            pub fn iter(&self) -> Result<Iter<'_, T>, ViewError> {
                self.core.live()?;
                Ok(unsafe { Iter::new(self.core.base, &self.core.layout) })
            }

            /// Row-major iterator over `(index, value)` pairs.
            pub fn indexed_iter(&self) -> Result<IndexedIter<'_, T>, ViewError> {
                self.core.live()?;
                Ok(unsafe { IndexedIter::new(self.core.base, &self.core.layout) })
            }

            /// Copies the elements out in row-major order.
            pub fn to_vec(&self) -> Result<Vec<T>, ViewError> {
                Ok(self.iter()?.collect())
            }

            /// Returns the buffer to its exporter. Further data access fails
            /// with [`ViewError::UseAfterRelease`]; releasing again does
            /// nothing.
            pub fn release(&mut self) {
                self.core.release()
            }
        }

        impl<T: Element> std::fmt::Debug for $view<T> {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.debug_struct(stringify!($view))
                    .field("dtype", &std::any::type_name::<T>())
                    .field("shape", self.shape())
                    .field("strides", self.strides())
                    .field("contiguous", &self.is_contiguous())
                    .field("state", &self.state())
                    .finish()
            }
        }
    };
}

/// A read-only, zero-copy view of a host buffer.
pub struct ReadView<T> {
    core: ViewCore<T>,
}

unsafe impl<T: Element> Send for ReadView<T> {}
unsafe impl<T: Element> Sync for ReadView<T> {}

impl<T: Element> ReadView<T> {
    const MODE: AccessMode = AccessMode::Read;

    pub fn acquire<S: BufferExporter + 'static>(
        source: &Arc<S>,
        preference: LayoutPreference,
    ) -> Result<Self, ViewError> {
        let request = BufferRequest::new(Self::MODE, preference);
        ViewCore::acquire(source.clone(), request).map(|core| Self { core })
    }
}

impl_view_reads!(ReadView);

/// A mutable, zero-copy view of a writable host buffer.
///
/// The caller must ensure no other view overlaps its memory while it is
/// alive.
pub struct WriteView<T> {
    core: ViewCore<T>,
}

unsafe impl<T: Element> Send for WriteView<T> {}

impl<T: Element> WriteView<T> {
    const MODE: AccessMode = AccessMode::Write;

    pub fn acquire<S: BufferExporter + 'static>(
        source: &Arc<S>,
        preference: LayoutPreference,
    ) -> Result<Self, ViewError> {
        let request = BufferRequest::new(Self::MODE, preference);
        ViewCore::acquire(source.clone(), request).map(|core| Self { core })
    }

    pub fn set(&mut self, index: usize, value: T) -> Result<(), ViewError> {
        let offset = self.core.flat_offset(index)?;
        unsafe { self.core.write(offset, value) };
        Ok(())
    }

    pub fn set_at(&mut self, index: &[usize], value: T) -> Result<(), ViewError> {
        let offset = self.core.multi_offset(index)?;
        unsafe { self.core.write(offset, value) };
        Ok(())
    }

    pub fn as_mut_ptr(&mut self) -> Result<*mut T, ViewError> {
        self.core.require_contiguous()?;
        Ok(self.core.base.cast::<T>())
    }

    pub fn as_mut_slice(&mut self) -> Result<&mut [T], ViewError> {
        let ptr = self.core.slice_ptr()?;
        Ok(unsafe { std::slice::from_raw_parts_mut(ptr, self.count()) })
    }

    /// Row-major iterator over mutable element slots. Requires aligned,
    /// non-overlapping memory so that no two slots alias.
    pub fn iter_mut(&mut self) -> Result<IterMut<'_, T>, ViewError> {
        self.core.live()?;
        self.core.require_aligned()?;
        if !self.core.layout.is_non_overlapping() {
            return Err(LayoutError::Overlapping.into());
        }
        Ok(unsafe { IterMut::new(self.core.base, &self.core.layout) })
    }
}

impl_view_reads!(WriteView);
