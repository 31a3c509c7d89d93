//! Shape/stride normalization and contiguity classification.
use crate::{RVec, Shape, Strides, ViewError};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LayoutError {
    #[error("Rank mismatch, shape {shape:?} has {} dimensions but {strides} strides were given.", .shape.len())]
    RankMismatch { shape: Shape, strides: usize },
    #[error("Operation requires a C-contiguous buffer, got strides {0:?}.")]
    NotContiguous(Strides),
    #[error("Buffer memory is not aligned for {0}.")]
    Misaligned(&'static str),
    #[error("Buffer layout maps distinct indices to overlapping memory.")]
    Overlapping,
    #[error("Layout touches bytes {low}..{high}, outside a {len}-byte allocation.")]
    OutOfBounds { low: isize, high: isize, len: usize },
}

/// The normalized geometry of a buffer: extents, byte strides and the
/// contiguity classification derived from them.
///
/// Strides are always materialized. Whether the flat fast path applies is
/// decided once here and cached in [`Layout::is_contiguous`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Layout {
    shape: Shape,
    strides: Strides,
    itemsize: usize,
    numel: usize,
    contiguous: bool,
    f_contiguous: bool,
}

impl Layout {
    /// Normalizes raw extents and optional byte strides.
    ///
    /// Missing strides are filled in with packed row-major defaults.
    pub fn analyze(
        shape: Shape,
        strides: Option<Strides>,
        itemsize: usize,
    ) -> Result<Self, LayoutError> {
        let strides = match strides {
            Some(strides) if strides.len() != shape.len() => {
                return Err(LayoutError::RankMismatch {
                    strides: strides.len(),
                    shape,
                })
            }
            Some(strides) => strides,
            None => Strides::row_major(&shape, itemsize),
        };
        let numel = shape.numel();
        let contiguous = is_row_major(&shape, &strides, itemsize);
        let f_contiguous = is_col_major(&shape, &strides, itemsize);
        log::trace!(
            "Layout {:?} strides {:?} itemsize {}: c_contiguous={} f_contiguous={}",
            shape,
            strides,
            itemsize,
            contiguous,
            f_contiguous
        );
        Ok(Self {
            shape,
            strides,
            itemsize,
            numel,
            contiguous,
            f_contiguous,
        })
    }

    /// A packed row-major layout.
    pub fn row_major(shape: Shape, itemsize: usize) -> Self {
        let strides = Strides::row_major(&shape, itemsize);
        let numel = shape.numel();
        Self {
            shape,
            strides,
            itemsize,
            numel,
            contiguous: true,
            f_contiguous: false,
        }
        .reclassified()
    }

    fn reclassified(mut self) -> Self {
        self.contiguous = is_row_major(&self.shape, &self.strides, self.itemsize);
        self.f_contiguous = is_col_major(&self.shape, &self.strides, self.itemsize);
        self
    }

    /// The same memory with the axis order reversed.
    pub fn reversed(&self) -> Self {
        Self {
            shape: self.shape.reversed(),
            strides: self.strides.reversed(),
            itemsize: self.itemsize,
            numel: self.numel,
            contiguous: false,
            f_contiguous: false,
        }
        .reclassified()
    }

    pub fn shape(&self) -> &Shape {
        &self.shape
    }

    pub fn strides(&self) -> &Strides {
        &self.strides
    }

    pub fn itemsize(&self) -> usize {
        self.itemsize
    }

    pub fn numel(&self) -> usize {
        self.numel
    }

    pub fn rank(&self) -> usize {
        self.shape.rank()
    }

    /// Row-major (C) contiguity.
    pub fn is_contiguous(&self) -> bool {
        self.contiguous
    }

    /// Column-major (Fortran) contiguity.
    pub fn is_f_contiguous(&self) -> bool {
        self.f_contiguous
    }

    /// Byte offset of a multi-index, without bounds or arity checks.
    pub fn byte_offset(&self, index: &[usize]) -> isize {
        debug_assert_eq!(index.len(), self.rank());
        index
            .iter()
            .zip(self.strides.iter())
            .map(|(&i, &stride)| i as isize * stride)
            .sum()
    }

    /// Byte offset of a multi-index after checking its arity and bounds.
    pub fn checked_byte_offset(&self, index: &[usize]) -> Result<isize, ViewError> {
        if index.len() != self.rank() {
            return Err(ViewError::DimensionMismatch {
                expected: self.rank(),
                actual: index.len(),
            });
        }
        for (axis, (&i, &extent)) in index.iter().zip(self.shape.iter()).enumerate() {
            if i >= extent {
                return Err(ViewError::IndexOutOfRange {
                    index: i,
                    extent,
                    axis: Some(axis),
                });
            }
        }
        Ok(self.byte_offset(index))
    }

    /// Row-major multi-index of the `flat`-th element.
    pub fn unravel(&self, mut flat: usize) -> RVec<usize> {
        let mut index: RVec<usize> = self.shape.iter().map(|_| 0).collect();
        for (axis, &extent) in self.shape.iter().enumerate().rev() {
            if extent == 0 {
                break;
            }
            index[axis] = flat % extent;
            flat /= extent;
        }
        index
    }

    /// True when no two in-bounds indices address overlapping bytes.
    pub fn is_non_overlapping(&self) -> bool {
        if self.numel == 0 {
            return true;
        }
        let mut axes: RVec<(usize, usize)> = self
            .shape
            .iter()
            .zip(self.strides.iter())
            .filter(|(&extent, _)| extent > 1)
            .map(|(&extent, &stride)| (extent, stride.unsigned_abs()))
            .collect();
        axes.sort_by_key(|&(_, stride)| stride);
        let mut span = self.itemsize;
        for (extent, stride) in axes {
            if stride < span {
                return false;
            }
            span += stride * (extent - 1);
        }
        true
    }

    /// True when `base` and every stride that is actually stepped are
    /// multiples of `align`.
    pub fn is_aligned(&self, base: *const u8, align: usize) -> bool {
        if (base as usize) % align != 0 {
            return false;
        }
        self.shape
            .iter()
            .zip(self.strides.iter())
            .filter(|(&extent, _)| extent > 1)
            .all(|(_, &stride)| stride.unsigned_abs() % align == 0)
    }

    pub fn is_aligned_for<T>(&self, base: *const u8) -> bool {
        self.is_aligned(base, std::mem::align_of::<T>())
    }

    /// Lowest and one-past-highest byte offsets touched, relative to the
    /// base pointer. An empty layout touches nothing.
    pub fn byte_bounds(&self) -> (isize, isize) {
        if self.numel == 0 {
            return (0, 0);
        }
        let (mut low, mut high) = (0isize, 0isize);
        for (&extent, &stride) in self.shape.iter().zip(self.strides.iter()) {
            let reach = (extent as isize - 1) * stride;
            if reach < 0 {
                low += reach;
            } else {
                high += reach;
            }
        }
        (low, high + self.itemsize as isize)
    }
}

/// Row-major contiguity: scanning innermost to outermost, each stride must
/// equal the running product of item size and faster extents. Extents of
/// 0 and 1 are exempt, a scalar is always contiguous and so is any layout
/// holding no elements.
pub fn is_row_major(shape: &Shape, strides: &Strides, itemsize: usize) -> bool {
    if shape.has_zero_extent() {
        return true;
    }
    let mut expected = itemsize as isize;
    for (&extent, &stride) in shape.iter().zip(strides.iter()).rev() {
        if extent > 1 && stride != expected {
            return false;
        }
        expected *= extent as isize;
    }
    true
}

/// Column-major contiguity, the mirror image of [`is_row_major`].
pub fn is_col_major(shape: &Shape, strides: &Strides, itemsize: usize) -> bool {
    if shape.has_zero_extent() {
        return true;
    }
    let mut expected = itemsize as isize;
    for (&extent, &stride) in shape.iter().zip(strides.iter()) {
        if extent > 1 && stride != expected {
            return false;
        }
        expected *= extent as isize;
    }
    true
}
