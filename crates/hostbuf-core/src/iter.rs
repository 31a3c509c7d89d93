//! Row-major traversal of a buffer layout.
use std::iter::FusedIterator;
use std::marker::PhantomData;

use crate::{Element, Layout, RVec};

/// Walks the byte offsets of a layout in row-major order.
///
/// Contiguous layouts advance by the item size. Strided layouts keep an
/// odometer: after each element the innermost index is bumped, and an index
/// that reaches its extent resets to zero and carries into the next outer
/// axis.
#[derive(Debug, Clone)]
struct Cursor<'a> {
    layout: &'a Layout,
    index: RVec<usize>,
    offset: isize,
    remaining: usize,
    track_index: bool,
}

impl<'a> Cursor<'a> {
    fn new(layout: &'a Layout, track_index: bool) -> Self {
        Self {
            layout,
            index: layout.shape().iter().map(|_| 0).collect(),
            offset: 0,
            remaining: layout.numel(),
            track_index: track_index || !layout.is_contiguous(),
        }
    }

    /// Returns the offset of the current element and steps past it.
    fn step(&mut self) -> Option<isize> {
        if self.remaining == 0 {
            return None;
        }
        let current = self.offset;
        self.remaining -= 1;
        if self.remaining > 0 {
            self.advance();
        }
        Some(current)
    }

    fn advance(&mut self) {
        if !self.track_index {
            self.offset += self.layout.itemsize() as isize;
            return;
        }
        let shape = self.layout.shape();
        let strides = self.layout.strides();
        for axis in (0..self.index.len()).rev() {
            self.index[axis] += 1;
            self.offset += strides[axis];
            if self.index[axis] < shape[axis] {
                return;
            }
            self.offset -= strides[axis] * shape[axis] as isize;
            self.index[axis] = 0;
        }
    }
}

/// Element iterator of a view, yielding copies.
pub struct Iter<'a, T> {
    base: *const u8,
    cursor: Cursor<'a>,
    _marker: PhantomData<&'a T>,
}

impl<'a, T: Element> Iter<'a, T> {
    /// # Safety
    ///
    /// Every offset of `layout` from `base` must address a readable `T`
    /// for `'a`.
    pub(crate) unsafe fn new(base: *const u8, layout: &'a Layout) -> Self {
        Self {
            base,
            cursor: Cursor::new(layout, false),
            _marker: PhantomData,
        }
    }
}

impl<T: Element> Iterator for Iter<'_, T> {
    type Item = T;

    fn next(&mut self) -> Option<T> {
        let offset = self.cursor.step()?;
        Some(unsafe { self.base.offset(offset).cast::<T>().read_unaligned() })
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (self.cursor.remaining, Some(self.cursor.remaining))
    }
}

impl<T: Element> ExactSizeIterator for Iter<'_, T> {}
impl<T: Element> FusedIterator for Iter<'_, T> {}

/// Like [`Iter`], also yielding each element's multi-index.
pub struct IndexedIter<'a, T> {
    base: *const u8,
    cursor: Cursor<'a>,
    _marker: PhantomData<&'a T>,
}

impl<'a, T: Element> IndexedIter<'a, T> {
    /// # Safety
    ///
    /// As for [`Iter::new`].
    pub(crate) unsafe fn new(base: *const u8, layout: &'a Layout) -> Self {
        Self {
            base,
            cursor: Cursor::new(layout, true),
            _marker: PhantomData,
        }
    }
}

impl<T: Element> Iterator for IndexedIter<'_, T> {
    type Item = (RVec<usize>, T);

    fn next(&mut self) -> Option<Self::Item> {
        let index = self.cursor.index.clone();
        let offset = self.cursor.step()?;
        let value = unsafe { self.base.offset(offset).cast::<T>().read_unaligned() };
        Some((index, value))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (self.cursor.remaining, Some(self.cursor.remaining))
    }
}

impl<T: Element> ExactSizeIterator for IndexedIter<'_, T> {}
impl<T: Element> FusedIterator for IndexedIter<'_, T> {}

/// Mutable element iterator of a write view.
pub struct IterMut<'a, T> {
    base: *mut u8,
    cursor: Cursor<'a>,
    _marker: PhantomData<&'a mut T>,
}

impl<'a, T: Element> IterMut<'a, T> {
    /// # Safety
    ///
    /// Every offset of `layout` from `base` must address a distinct, aligned
    /// and writable `T`, exclusively borrowed for `'a`.
    pub(crate) unsafe fn new(base: *mut u8, layout: &'a Layout) -> Self {
        Self {
            base,
            cursor: Cursor::new(layout, false),
            _marker: PhantomData,
        }
    }
}

impl<'a, T: Element> Iterator for IterMut<'a, T> {
    type Item = &'a mut T;

    fn next(&mut self) -> Option<&'a mut T> {
        let offset = self.cursor.step()?;
        Some(unsafe { &mut *self.base.offset(offset).cast::<T>() })
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (self.cursor.remaining, Some(self.cursor.remaining))
    }
}

impl<T: Element> ExactSizeIterator for IterMut<'_, T> {}
impl<T: Element> FusedIterator for IterMut<'_, T> {}
