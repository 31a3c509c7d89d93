//! Python objects as buffer exporters.
use std::ffi::CStr;
use std::mem::MaybeUninit;
use std::os::raw::c_int;
use std::sync::Arc;

use pyo3::exceptions::{PyBufferError, PyIndexError, PyRuntimeError, PyTypeError, PyValueError};
use pyo3::{ffi, FromPyObject, IntoPy, Py, PyAny, PyErr, PyResult, Python};

use crate::{
    metadata_from_raw, AcquisitionError, BufferDescriptor, BufferExporter, BufferFlags, Element,
    LayoutPreference, LockBridgeError, ReadView, Shape, Strides, ViewError, WriteView,
};

/// A Python object exporting its memory through the buffer protocol.
#[derive(Debug, Clone)]
pub struct PyBufferSource {
    object: Py<PyAny>,
}

impl PyBufferSource {
    pub fn new(object: Py<PyAny>) -> Self {
        Self { object }
    }

    pub fn object(&self) -> &Py<PyAny> {
        &self.object
    }
}

/// The `Py_buffer` filled in by the exporter. Dropping it releases the
/// buffer with the GIL held.
struct PyExport(Box<ffi::Py_buffer>);

unsafe impl Send for PyExport {}
unsafe impl Sync for PyExport {}

impl Drop for PyExport {
    fn drop(&mut self) {
        Python::with_gil(|_py| unsafe { ffi::PyBuffer_Release(&mut *self.0) });
    }
}

impl PyExport {
    /// Copies the exporter's metadata into a descriptor that takes ownership
    /// of the export. Must be called with the GIL held; on failure the
    /// export is dropped, releasing it.
    unsafe fn into_descriptor(self) -> Result<BufferDescriptor, AcquisitionError> {
        let (shape, strides, format) = self.metadata()?;
        let raw = &*self.0;
        Ok(BufferDescriptor::new(
            raw.buf.cast::<u8>(),
            raw.len as usize,
            shape,
            strides,
            format,
            raw.itemsize as usize,
            raw.readonly != 0,
            Box::new(self),
        ))
    }

    unsafe fn metadata(&self) -> Result<(Shape, Option<Strides>, Option<String>), AcquisitionError> {
        let raw = &*self.0;
        if !raw.suboffsets.is_null() {
            return Err(AcquisitionError::InvalidDescriptor(
                "indirect (suboffset) buffers are not supported".to_string(),
            ));
        }
        let format = if raw.format.is_null() {
            None
        } else {
            let format = CStr::from_ptr(raw.format).to_str().map_err(|_| {
                AcquisitionError::InvalidDescriptor("format is not valid UTF-8".to_string())
            })?;
            Some(format.to_string())
        };
        let ndim = usize::try_from(raw.ndim)
            .map_err(|_| AcquisitionError::InvalidDescriptor(format!("ndim {}", raw.ndim)))?;
        let (shape, strides) = metadata_from_raw(
            ndim,
            raw.shape,
            raw.strides,
            raw.itemsize as usize,
            raw.len as usize,
        )?;
        Ok((shape, strides, format))
    }
}

fn acquisition_error(py: Python<'_>, err: PyErr, flags: BufferFlags) -> AcquisitionError {
    if err.is_instance_of::<PyTypeError>(py) {
        return AcquisitionError::NoBufferInterface;
    }
    let message = err.value(py).to_string();
    let lowered = message.to_lowercase();
    if flags.contains(BufferFlags::WRITABLE)
        && (lowered.contains("writ") || lowered.contains("read-only"))
    {
        AcquisitionError::ReadOnly
    } else {
        AcquisitionError::Refused(message)
    }
}

impl BufferExporter for PyBufferSource {
    fn get_buffer(&self, flags: BufferFlags) -> Result<BufferDescriptor, AcquisitionError> {
        Python::with_gil(|py| {
            let mut uninit = Box::new(MaybeUninit::<ffi::Py_buffer>::uninit());
            let rc = unsafe {
                ffi::PyObject_GetBuffer(
                    self.object.as_ptr(),
                    uninit.as_mut_ptr(),
                    flags.bits() as c_int,
                )
            };
            if rc != 0 {
                return Err(acquisition_error(py, PyErr::fetch(py), flags));
            }
            let raw = unsafe { Box::from_raw(Box::into_raw(uninit).cast::<ffi::Py_buffer>()) };
            unsafe { PyExport(raw).into_descriptor() }
        })
    }

    fn release_buffer(&self, descriptor: &mut BufferDescriptor) {
        let Some(token) = descriptor.take_token() else {
            return;
        };
        match token.downcast::<PyExport>() {
            Ok(export) => drop(export),
            Err(_) => log::warn!("Ignoring release of a descriptor exported elsewhere"),
        }
    }
}

impl<'source, T: Element> FromPyObject<'source> for ReadView<T> {
    fn extract(ob: &'source PyAny) -> PyResult<Self> {
        let source = Arc::new(PyBufferSource::new(ob.into_py(ob.py())));
        Ok(ReadView::acquire(&source, LayoutPreference::Contiguous)?)
    }
}

impl<'source, T: Element> FromPyObject<'source> for WriteView<T> {
    fn extract(ob: &'source PyAny) -> PyResult<Self> {
        let source = Arc::new(PyBufferSource::new(ob.into_py(ob.py())));
        Ok(WriteView::acquire(&source, LayoutPreference::Contiguous)?)
    }
}

impl From<ViewError> for PyErr {
    fn from(err: ViewError) -> Self {
        let message = err.to_string();
        match err {
            ViewError::Acquisition(AcquisitionError::NoBufferInterface) | ViewError::DType(_) => {
                PyTypeError::new_err(message)
            }
            ViewError::Acquisition(_) => PyBufferError::new_err(message),
            ViewError::IndexOutOfRange { .. } | ViewError::DimensionMismatch { .. } => {
                PyIndexError::new_err(message)
            }
            ViewError::Layout(_) | ViewError::UseAfterRelease => PyValueError::new_err(message),
        }
    }
}

impl From<LockBridgeError> for PyErr {
    fn from(err: LockBridgeError) -> Self {
        PyRuntimeError::new_err(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pyo3::types::PyBytes;

    fn eval<'py>(py: Python<'py>, code: &str) -> &'py PyAny {
        py.eval(code, None, None).unwrap()
    }

    #[test]
    fn reads_typed_arrays() {
        pyo3::prepare_freethreaded_python();
        Python::with_gil(|py| {
            let array = eval(py, "__import__('array').array('q', [1, 2, 3, 4, 5])");
            let view: ReadView<i64> = array.extract().unwrap();
            assert_eq!(view.iter().unwrap().sum::<i64>(), 15);
            assert_eq!(view.get(4).unwrap(), 5);
        });
    }

    #[test]
    fn strided_memoryviews_fall_back() {
        pyo3::prepare_freethreaded_python();
        Python::with_gil(|py| {
            let strided = eval(py, "memoryview(__import__('array').array('q', range(6)))[::2]");
            let view: ReadView<i64> = strided.extract().unwrap();
            assert!(!view.is_contiguous());
            assert_eq!(view.to_vec().unwrap(), vec![0, 2, 4]);
        });
    }

    #[test]
    fn writes_are_visible_to_python() {
        pyo3::prepare_freethreaded_python();
        Python::with_gil(|py| {
            let bytes = eval(py, "bytearray(b'abc')");
            {
                let mut view: WriteView<u8> = bytes.extract().unwrap();
                view.set(0, b'z').unwrap();
            }
            let contents: Vec<u8> = bytes.extract().unwrap();
            assert_eq!(contents, b"zbc");
            // Resizing only succeeds once the export is released.
            assert!(bytes.call_method1("append", (1,)).is_ok());
        });
    }

    #[test]
    fn dropped_descriptors_release_the_export() {
        pyo3::prepare_freethreaded_python();
        Python::with_gil(|py| {
            let bytes = eval(py, "bytearray(b'abc')");
            let source = PyBufferSource::new(bytes.into_py(py));
            let descriptor = source
                .get_buffer(BufferFlags::STRIDES | BufferFlags::WRITABLE)
                .unwrap();
            assert!(bytes.call_method1("append", (1,)).is_err());
            drop(descriptor);
            assert!(bytes.call_method1("append", (1,)).is_ok());
        });
    }

    #[test]
    fn failures_map_to_python_exceptions() {
        pyo3::prepare_freethreaded_python();
        Python::with_gil(|py| {
            let readonly = PyBytes::new(py, b"abc");
            let err = readonly.extract::<WriteView<u8>>().unwrap_err();
            assert!(err.is_instance_of::<PyBufferError>(py));

            let opaque = eval(py, "object()");
            let err = opaque.extract::<ReadView<u8>>().unwrap_err();
            assert!(err.is_instance_of::<PyTypeError>(py));

            let narrow = eval(py, "bytearray(8)");
            let err = narrow.extract::<ReadView<i64>>().unwrap_err();
            assert!(err.is_instance_of::<PyTypeError>(py));
            assert!(narrow.call_method1("append", (1,)).is_ok());
        });
    }
}
