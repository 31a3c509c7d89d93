use hostbuf::{without_host_lock, LockBridgeError, ReadView, ViewError, WriteView};

#[derive(Debug, thiserror::Error)]
pub enum KernelError {
    #[error(transparent)]
    View(#[from] ViewError),
    #[error(transparent)]
    Lock(#[from] LockBridgeError),
    #[error("Expected a {expected}-dimensional array, got {actual} dimensions.")]
    Rank { expected: usize, actual: usize },
    #[error("Cannot multiply a {lhs:?} matrix by a {rhs:?} matrix.")]
    Incompatible { lhs: Vec<usize>, rhs: Vec<usize> },
}

/// Wraps on overflow, like numpy's int64 reductions.
pub fn sum(values: &ReadView<i64>) -> Result<i64, KernelError> {
    Ok(values.iter()?.fold(0, i64::wrapping_add))
}

/// Like [`sum`], with the host lock released for the duration of the loop.
pub fn sum_unlocked(values: &ReadView<i64>) -> Result<i64, KernelError> {
    let iter = values.iter()?;
    Ok(without_host_lock(move || iter.fold(0, i64::wrapping_add))?)
}

pub fn scaled(values: &ReadView<f64>, scalar: f64) -> Result<Vec<f64>, KernelError> {
    Ok(values.iter()?.map(|v| v * scalar).collect())
}

pub fn scale_in_place(values: &mut WriteView<f64>, scalar: f64) -> Result<(), KernelError> {
    for slot in values.iter_mut()? {
        *slot *= scalar;
    }
    Ok(())
}

fn require_matrix(view: &ReadView<f64>) -> Result<(usize, usize), KernelError> {
    match view.shape().as_slice() {
        &[rows, cols] => Ok((rows, cols)),
        dims => Err(KernelError::Rank {
            expected: 2,
            actual: dims.len(),
        }),
    }
}

/// Naive matrix product over views of any layout.
pub fn matmul(lhs: &ReadView<f64>, rhs: &ReadView<f64>) -> Result<Vec<Vec<f64>>, KernelError> {
    let (m, k) = require_matrix(lhs)?;
    let (k2, n) = require_matrix(rhs)?;
    if k != k2 {
        return Err(KernelError::Incompatible {
            lhs: lhs.shape().to_vec(),
            rhs: rhs.shape().to_vec(),
        });
    }
    let mut out = vec![vec![0.0; n]; m];
    for (i, row) in out.iter_mut().enumerate() {
        for (j, cell) in row.iter_mut().enumerate() {
            let mut acc = 0.0;
            for p in 0..k {
                acc += lhs.get_at(&[i, p])? * rhs.get_at(&[p, j])?;
            }
            *cell = acc;
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use hostbuf::prelude::*;
    use std::sync::Arc;

    fn floats(data: &[f64], shape: hostbuf::Shape) -> HostArray {
        HostArray::from_slice(data, shape)
    }

    fn read<T: Element>(array: &HostArray) -> ReadView<T> {
        ReadView::acquire(&Arc::new(array.clone()), LayoutPreference::Contiguous).unwrap()
    }

    #[test]
    fn sums() -> anyhow::Result<()> {
        let _ = env_logger::builder().is_test(true).try_init();
        let values = HostArray::from_slice(&[1i64, 2, 3, 4, 5], shape![5]);
        assert_eq!(sum(&read(&values))?, 15);
        let empty = HostArray::from_slice::<i64>(&[], shape![0]);
        assert_eq!(sum(&read(&empty))?, 0);
        let single = HostArray::from_slice(&[42i64], shape![1]);
        assert_eq!(sum(&read(&single))?, 42);
        let overflowing = HostArray::from_slice(&[i64::MAX, 1, 1], shape![3]);
        assert_eq!(sum(&read(&overflowing))?, i64::MIN + 1);
        Ok(())
    }

    #[test]
    fn unlocked_sum_matches() -> anyhow::Result<()> {
        pyo3::prepare_freethreaded_python();
        let data: Vec<i64> = (0..1000).collect();
        let values = HostArray::from_slice(&data, shape![1000]);
        let view = read::<i64>(&values);
        let total = pyo3::Python::with_gil(|_py| sum_unlocked(&view))?;
        assert_eq!(total, (0..1000).sum::<i64>());
        Ok(())
    }

    #[test]
    fn global_bridge_resolves_against_the_interpreter() {
        pyo3::prepare_freethreaded_python();
        let addresses: Vec<usize> = (0..4)
            .map(|_| {
                std::thread::spawn(|| {
                    let bridge = LockBridge::global().expect("interpreter entry points resolve");
                    bridge as *const LockBridge as usize
                })
            })
            .collect::<Vec<_>>()
            .into_iter()
            .map(|handle| handle.join().unwrap())
            .collect();
        assert!(addresses.windows(2).all(|pair| pair[0] == pair[1]));
        let here = LockBridge::global().unwrap() as *const LockBridge as usize;
        assert_eq!(addresses[0], here);
    }

    #[test]
    fn scaling() -> anyhow::Result<()> {
        let values = floats(&[1.0, 2.0, 3.0], shape![3]);
        assert_eq!(scaled(&read(&values), 2.5)?, vec![2.5, 5.0, 7.5]);

        let mut view = WriteView::<f64>::acquire(&Arc::new(values.clone()), LayoutPreference::Contiguous)?;
        scale_in_place(&mut view, 3.0)?;
        view.release();
        assert_eq!(values.to_vec::<f64>(), vec![3.0, 6.0, 9.0]);
        Ok(())
    }

    #[test]
    fn matrix_products() -> anyhow::Result<()> {
        let a = floats(&[1.0, 2.0, 3.0, 4.0], shape![2, 2]);
        let b = floats(&[5.0, 6.0, 7.0, 8.0], shape![2, 2]);
        assert_eq!(
            matmul(&read(&a), &read(&b))?,
            vec![vec![19.0, 22.0], vec![43.0, 50.0]]
        );
        // Transposed operands go through the strided path.
        let at = read::<f64>(&a.transpose());
        assert!(!at.is_contiguous());
        assert_eq!(
            matmul(&at, &read(&b))?,
            vec![vec![26.0, 30.0], vec![38.0, 44.0]]
        );

        let row = floats(&[1.0, 2.0, 3.0], shape![1, 3]);
        assert!(matches!(
            matmul(&read(&row), &read(&b)),
            Err(KernelError::Incompatible { .. })
        ));
        let flat = floats(&[1.0, 2.0], shape![2]);
        assert!(matches!(
            matmul(&read(&flat), &read(&b)),
            Err(KernelError::Rank { actual: 1, .. })
        ));
        Ok(())
    }
}
