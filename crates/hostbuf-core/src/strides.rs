use crate::{RVec, Shape};

/// Per-dimension byte strides, outermost first. Negative strides walk
/// memory backwards from the buffer's base pointer.
#[derive(Clone, PartialEq, Eq, Default, Hash)]
pub struct Strides(RVec<isize>);

impl Strides {
    pub fn new(strides: RVec<isize>) -> Self {
        Self(strides)
    }

    /// Default strides for a packed, row-major buffer.
    ///
    /// Zero extents are treated as one so that the outer strides of an empty
    /// buffer stay meaningful.
    pub fn row_major(shape: &Shape, itemsize: usize) -> Self {
        let mut strides: RVec<isize> = shape.iter().map(|_| 0).collect();
        let mut stride = itemsize as isize;
        for (dim, &size) in shape.iter().enumerate().rev() {
            strides[dim] = stride;
            stride *= size.max(1) as isize;
        }
        Self(strides)
    }

    /// Default strides for a packed, column-major buffer.
    pub fn col_major(shape: &Shape, itemsize: usize) -> Self {
        let mut strides = RVec::with_capacity(shape.len());
        let mut stride = itemsize as isize;
        for &size in shape.iter() {
            strides.push(stride);
            stride *= size.max(1) as isize;
        }
        Self(strides)
    }

    pub fn inner(&self) -> &RVec<isize> {
        &self.0
    }

    pub fn as_slice(&self) -> &[isize] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn to_vec(&self) -> Vec<isize> {
        self.0.to_vec()
    }

    pub fn iter(&self) -> impl DoubleEndedIterator<Item = &isize> + ExactSizeIterator {
        self.0.iter()
    }

    pub fn reversed(&self) -> Self {
        Strides(self.0.iter().rev().copied().collect())
    }
}

impl std::fmt::Debug for Strides {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[")?;
        for (axis, dim) in self.0.iter().enumerate() {
            if axis > 0 {
                write!(f, "x")?;
            }
            write!(f, "{}", dim)?;
        }
        write!(f, "]")
    }
}

impl std::ops::Index<usize> for Strides {
    type Output = isize;

    fn index(&self, index: usize) -> &Self::Output {
        &self.0[index]
    }
}

impl From<Vec<isize>> for Strides {
    fn from(strides: Vec<isize>) -> Self {
        Self(strides.into())
    }
}

impl From<&[isize]> for Strides {
    fn from(slice: &[isize]) -> Self {
        Strides(slice.into())
    }
}
