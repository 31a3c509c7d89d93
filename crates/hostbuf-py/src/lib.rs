//! `_hostbuf`: numpy-facing routines built on hostbuf views.
use hostbuf::{ReadView, WriteView};
use pyo3::exceptions::{PyRuntimeError, PyValueError};
use pyo3::prelude::*;

pub mod kernels;

use kernels::KernelError;

pub const LOG_LEVEL_VAR: &str = "HOSTBUF_LOG";

impl From<KernelError> for PyErr {
    fn from(err: KernelError) -> Self {
        match err {
            KernelError::View(e) => e.into(),
            KernelError::Lock(e) => PyRuntimeError::new_err(e.to_string()),
            e @ (KernelError::Rank { .. } | KernelError::Incompatible { .. }) => {
                PyValueError::new_err(e.to_string())
            }
        }
    }
}

pub fn start_logger() {
    let level = std::env::var(LOG_LEVEL_VAR)
        .ok()
        .and_then(|level| level.parse().ok())
        .unwrap_or(log::LevelFilter::Warn);
    let logger = fern::Dispatch::new()
        .format(|out, message, record| {
            out.finish(format_args!(
                "{}[{}][{}] {}",
                chrono::Local::now().format("[%Y-%m-%d][%H:%M:%S]"),
                record.target(),
                record.level(),
                message
            ))
        })
        .level(level)
        .chain(std::io::stderr())
        .apply();
    match logger {
        Ok(_) => log::info!("Logging initialized at {}.", level),
        Err(error) => eprintln!("Error initializing logging: {:?}", error),
    }
}

/// Sum of a 1-D int64 array.
#[pyfunction]
fn numpy_array_sum(array: ReadView<i64>) -> PyResult<i64> {
    Ok(kernels::sum(&array)?)
}

/// Sum of a 1-D int64 array, computed with the GIL released.
#[pyfunction]
fn numpy_array_sum_fast(array: ReadView<i64>) -> PyResult<i64> {
    Ok(kernels::sum_unlocked(&array)?)
}

#[pyfunction]
fn numpy_array_multiply_scalar(array: ReadView<f64>, scalar: f64) -> PyResult<Vec<f64>> {
    Ok(kernels::scaled(&array, scalar)?)
}

/// Multiplies a float64 array by `scalar` without copying it.
#[pyfunction]
fn numpy_array_multiply_in_place(mut array: WriteView<f64>, scalar: f64) -> PyResult<()> {
    Ok(kernels::scale_in_place(&mut array, scalar)?)
}

#[pyfunction]
fn numpy_matrix_multiply(a: ReadView<f64>, b: ReadView<f64>) -> PyResult<Vec<Vec<f64>>> {
    Ok(kernels::matmul(&a, &b)?)
}

#[pymodule]
fn _hostbuf(_py: Python<'_>, m: &PyModule) -> PyResult<()> {
    start_logger();
    m.add_function(wrap_pyfunction!(numpy_array_sum, m)?)?;
    m.add_function(wrap_pyfunction!(numpy_array_sum_fast, m)?)?;
    m.add_function(wrap_pyfunction!(numpy_array_multiply_scalar, m)?)?;
    m.add_function(wrap_pyfunction!(numpy_array_multiply_in_place, m)?)?;
    m.add_function(wrap_pyfunction!(numpy_matrix_multiply, m)?)?;
    Ok(())
}
