use crate::RVec;
use std::ops::RangeTo;

/// Per-dimension extents of a buffer, outermost first.
///
/// A shape of rank 0 describes a scalar and holds exactly one element.
#[derive(Clone, PartialEq, Eq, Hash, Default)]
pub struct Shape(RVec<usize>);

impl Shape {
    pub fn new(shape: RVec<usize>) -> Self {
        Self(shape)
    }

    pub fn inner(&self) -> &RVec<usize> {
        &self.0
    }

    pub fn get(&self, index: usize) -> Option<&usize> {
        self.0.get(index)
    }

    pub fn numel(&self) -> usize {
        self.0.iter().product()
    }

    pub fn to_vec(&self) -> Vec<usize> {
        self.0.to_vec()
    }

    pub fn iter(&self) -> impl DoubleEndedIterator<Item = &usize> + ExactSizeIterator {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn rank(&self) -> usize {
        self.len()
    }

    pub fn is_scalar(&self) -> bool {
        self.0.is_empty()
    }

    /// True when at least one extent is zero, so the buffer holds no elements.
    pub fn has_zero_extent(&self) -> bool {
        self.0.iter().any(|&d| d == 0)
    }

    pub fn as_slice(&self) -> &[usize] {
        &self.0
    }

    /// Shape with the axes in reverse order.
    pub fn reversed(&self) -> Self {
        Shape(self.0.iter().rev().copied().collect())
    }
}

impl std::fmt::Debug for Shape {
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

impl std::fmt::Display for Shape {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self.0)
    }
}

impl std::ops::Index<usize> for Shape {
    type Output = usize;

    fn index(&self, index: usize) -> &Self::Output {
        &self.0[index]
    }
}

impl std::ops::Index<RangeTo<usize>> for Shape {
    type Output = [usize];

    fn index(&self, index: RangeTo<usize>) -> &Self::Output {
        &self.0[index]
    }
}

impl From<Vec<usize>> for Shape {
    fn from(shape: Vec<usize>) -> Self {
        Self(shape.into())
    }
}

impl From<&[usize]> for Shape {
    fn from(slice: &[usize]) -> Self {
        Shape(slice.into())
    }
}

impl<const N: usize> From<[usize; N]> for Shape {
    fn from(arr: [usize; N]) -> Self {
        Shape(arr.iter().copied().collect())
    }
}

#[cfg(test)]
mod tests {
    use crate::{shape, Shape};
    use proptest::prelude::*;
    use proptest::strategy::{BoxedStrategy, Strategy};
    use std::ops::RangeInclusive;

    impl Arbitrary for Shape {
        type Parameters = Vec<RangeInclusive<usize>>;
        type Strategy = BoxedStrategy<Self>;

        fn arbitrary_with(args: Self::Parameters) -> Self::Strategy {
            args.prop_map(Into::<Shape>::into).boxed()
        }
    }

    #[test]
    fn scalar_shape_has_one_element() {
        let scalar = shape![];
        assert!(scalar.is_scalar());
        assert_eq!(scalar.numel(), 1);
        assert_eq!(format!("{:?}", scalar), "[]");
        assert_eq!(format!("{:?}", shape![0]), "[0]");
    }

    #[test]
    fn zero_extent_empties_the_shape() {
        let s = shape![3, 0, 2];
        assert!(s.has_zero_extent());
        assert_eq!(s.numel(), 0);
    }

    #[test]
    fn debug_and_display() {
        let s = shape![2, 3, 4];
        assert_eq!(format!("{:?}", s), "[2x3x4]");
        assert_eq!(format!("{}", s), "[2, 3, 4]");
        assert_eq!(s.reversed(), shape![4, 3, 2]);
    }

    proptest! {
        #[test]
        fn numel_is_product(s in Shape::arbitrary_with(vec![1..=5usize, 0..=4usize, 1..=3usize])) {
            prop_assert_eq!(s.numel(), s[0] * s[1] * s[2]);
            prop_assert_eq!(s.rank(), 3);
        }
    }
}
