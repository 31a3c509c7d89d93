//! Zero-copy views over memory owned by a host runtime.
//!
//! A host object lends out its backing storage through the buffer protocol
//! ([`BufferExporter`]). [`ReadView`] and [`WriteView`] validate the lent
//! descriptor against a Rust element type, classify its layout and hand out
//! bounds-checked access until they are released, either explicitly or on
//! drop. [`LockBridge`] runs a numeric block with the host's global lock
//! released.
mod acquire;
mod dtype;
mod format;
mod host;
mod iter;
mod layout;
mod lock;
mod shape;
mod strides;
mod view;

#[cfg(feature = "pyo3")]
pub mod python;

pub use acquire::*;
pub use dtype::*;
pub use format::*;
pub use host::*;
pub use iter::*;
pub use layout::*;
pub use lock::*;
pub use shape::*;
pub use strides::*;
pub use view::*;

use smallvec::SmallVec;
pub type RVec<T> = SmallVec<[T; 4]>;

//https://github.com/sonos/tract/blob/main/data/src/macros.rs#L2
#[macro_export]
macro_rules! rvec {
    (@one $x:expr) => (1usize);
    ($elem:expr; $n:expr) => ({
        $crate::RVec::from_elem($elem, $n)
    });
    ($($x:expr),*$(,)*) => ({
        let count = 0usize $(+ $crate::rvec![@one $x])*;
        #[allow(unused_mut)]
        let mut vec = $crate::RVec::new();
        if count <= vec.inline_size() {
            $(vec.push($x);)*
            vec
        } else {
            $crate::RVec::from_vec(vec![$($x,)*])
        }
    });
}

#[macro_export]
macro_rules! shape {
    ($($x:expr),*$(,)*) => ({
        $crate::Shape::new($crate::rvec![$($x,)*])
    });
}

pub mod prelude {
    pub use crate::{
        rvec, shape, without_host_lock, AccessMode, BufferExporter, Element, HostArray, HostBool,
        LayoutPreference, LockBridge, ReadView, WriteView,
    };
}
