//! Running native code with the host runtime's global lock released.
//!
//! The host's thread-state entry points are looked up by name at runtime, so
//! the engine does not link against the host library. Resolution happens
//! once per process and is cached.
use std::cell::Cell;
use std::ffi::c_void;
use std::path::PathBuf;
use std::sync::OnceLock;

/// Saves the current thread state and releases the global lock.
pub type SaveThreadFn = unsafe extern "C" fn() -> *mut c_void;
/// Reacquires the global lock and restores a saved thread state.
pub type RestoreThreadFn = unsafe extern "C" fn(*mut c_void);

pub const DEFAULT_SAVE_SYMBOL: &str = "PyEval_SaveThread";
pub const DEFAULT_RESTORE_SYMBOL: &str = "PyEval_RestoreThread";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LockBridgeError {
    #[error("Host lock bridge unavailable: {reason}")]
    Unavailable { reason: String },
}

fn unavailable(reason: String) -> LockBridgeError {
    LockBridgeError::Unavailable { reason }
}

/// Where to find the host's thread-state entry points.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockBridgeConfig {
    /// Library to search, `None` for the current process image.
    pub library: Option<PathBuf>,
    pub save_symbol: String,
    pub restore_symbol: String,
}

impl Default for LockBridgeConfig {
    fn default() -> Self {
        Self {
            library: None,
            save_symbol: DEFAULT_SAVE_SYMBOL.to_string(),
            restore_symbol: DEFAULT_RESTORE_SYMBOL.to_string(),
        }
    }
}

impl LockBridgeConfig {
    pub const LIBRARY_VAR: &'static str = "HOSTBUF_HOST_LIBRARY";
    pub const SAVE_SYMBOL_VAR: &'static str = "HOSTBUF_SAVE_SYMBOL";
    pub const RESTORE_SYMBOL_VAR: &'static str = "HOSTBUF_RESTORE_SYMBOL";

    /// The defaults, overridden by any of the `HOSTBUF_*` variables that are
    /// set.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            library: std::env::var_os(Self::LIBRARY_VAR).map(PathBuf::from),
            save_symbol: std::env::var(Self::SAVE_SYMBOL_VAR).unwrap_or(defaults.save_symbol),
            restore_symbol: std::env::var(Self::RESTORE_SYMBOL_VAR)
                .unwrap_or(defaults.restore_symbol),
        }
    }
}

static GLOBAL_BRIDGE: OnceLock<Result<LockBridge, LockBridgeError>> = OnceLock::new();

thread_local! {
    static LOCK_RELEASED: Cell<bool> = const { Cell::new(false) };
}

/// Resolved save/restore entry points of the host runtime.
#[derive(Debug, Clone, Copy)]
pub struct LockBridge {
    save: SaveThreadFn,
    restore: RestoreThreadFn,
}

impl LockBridge {
    /// Loads the entry points named by `config`. The library stays loaded for
    /// the rest of the process.
    pub fn resolve(config: &LockBridgeConfig) -> Result<Self, LockBridgeError> {
        let library = match &config.library {
            Some(path) => unsafe { libloading::Library::new(path) }
                .map_err(|e| unavailable(format!("cannot load {}: {}", path.display(), e)))?,
            None => current_process()
                .map_err(|e| unavailable(format!("cannot open current process: {}", e)))?,
        };

        let bridge = unsafe {
            let save = library
                .get::<SaveThreadFn>(config.save_symbol.as_bytes())
                .map_err(|e| unavailable(format!("{}: {}", config.save_symbol, e)))?;
            let restore = library
                .get::<RestoreThreadFn>(config.restore_symbol.as_bytes())
                .map_err(|e| unavailable(format!("{}: {}", config.restore_symbol, e)))?;
            Self {
                save: *save,
                restore: *restore,
            }
        };
        std::mem::forget(library);

        log::debug!(
            "Resolved host lock entry points {} / {}",
            config.save_symbol,
            config.restore_symbol
        );
        Ok(bridge)
    }

    /// Wraps entry points the caller already holds.
    ///
    /// # Safety
    ///
    /// `save` must release the host lock and return a state that `restore`
    /// accepts to reacquire it, on the calling thread.
    pub unsafe fn from_entry_points(save: SaveThreadFn, restore: RestoreThreadFn) -> Self {
        Self { save, restore }
    }

    /// The process-wide bridge configured from the environment.
    ///
    /// Concurrent first callers may each resolve, the first stored result is
    /// the one every caller sees.
    pub fn global() -> Result<&'static LockBridge, LockBridgeError> {
        if let Some(cached) = GLOBAL_BRIDGE.get() {
            return cached.as_ref().map_err(Clone::clone);
        }
        let resolved = Self::resolve(&LockBridgeConfig::from_env());
        GLOBAL_BRIDGE
            .get_or_init(move || resolved)
            .as_ref()
            .map_err(Clone::clone)
    }

    /// Runs `f` with the host lock released and reacquires it on every exit
    /// path, unwinding included. On a thread that already released the lock
    /// through a bridge, `f` simply runs.
    ///
    /// `f` must not call into the host runtime or touch host objects. Views
    /// acquired beforehand stay usable.
    pub fn run_unlocked<F, R>(&self, f: F) -> R
    where
        F: FnOnce() -> R,
    {
        if host_lock_released() {
            return f();
        }
        let state = unsafe { (self.save)() };
        LOCK_RELEASED.with(|released| released.set(true));
        let _guard = RestoreGuard {
            restore: self.restore,
            state,
        };
        f()
    }
}

struct RestoreGuard {
    restore: RestoreThreadFn,
    state: *mut c_void,
}

impl Drop for RestoreGuard {
    fn drop(&mut self) {
        unsafe { (self.restore)(self.state) };
        LOCK_RELEASED.with(|released| released.set(false));
    }
}

/// True while the current thread is inside [`LockBridge::run_unlocked`].
pub fn host_lock_released() -> bool {
    LOCK_RELEASED.with(Cell::get)
}

/// Runs `f` with the host lock released, using the process-wide bridge.
///
/// Fails without running `f` if the entry points cannot be resolved.
pub fn without_host_lock<F, R>(f: F) -> Result<R, LockBridgeError>
where
    F: FnOnce() -> R,
{
    let bridge = LockBridge::global().map_err(|e| {
        log::warn!("{}", e);
        e
    })?;
    Ok(bridge.run_unlocked(f))
}

#[cfg(unix)]
fn current_process() -> Result<libloading::Library, libloading::Error> {
    Ok(libloading::os::unix::Library::this().into())
}

#[cfg(windows)]
fn current_process() -> Result<libloading::Library, libloading::Error> {
    libloading::os::windows::Library::this().map(Into::into)
}

#[cfg(test)]
mod tests {
    use super::*;

    thread_local! {
        static SAVES: Cell<usize> = const { Cell::new(0) };
        static RESTORES: Cell<usize> = const { Cell::new(0) };
    }

    const STATE: usize = 0x5eed;

    unsafe extern "C" fn fake_save() -> *mut c_void {
        SAVES.with(|c| c.set(c.get() + 1));
        STATE as *mut c_void
    }

    unsafe extern "C" fn fake_restore(state: *mut c_void) {
        assert_eq!(state as usize, STATE);
        RESTORES.with(|c| c.set(c.get() + 1));
    }

    fn fake_bridge() -> LockBridge {
        unsafe { LockBridge::from_entry_points(fake_save, fake_restore) }
    }

    fn counts() -> (usize, usize) {
        (SAVES.with(Cell::get), RESTORES.with(Cell::get))
    }

    #[test]
    fn scoped_sum_restores_lock() {
        let bridge = fake_bridge();
        let total = bridge.run_unlocked(|| {
            assert!(host_lock_released());
            (0..100u64).sum::<u64>()
        });
        assert_eq!(total, 4950);
        assert_eq!(counts(), (1, 1));
        assert!(!host_lock_released());
    }

    #[test]
    fn restore_runs_on_panic() {
        let bridge = fake_bridge();
        let result = std::panic::catch_unwind(|| bridge.run_unlocked(|| panic!("numeric failure")));
        assert!(result.is_err());
        assert_eq!(counts(), (1, 1));
        assert!(!host_lock_released());
    }

    #[test]
    fn nested_scopes_release_once() {
        let bridge = fake_bridge();
        let value = bridge.run_unlocked(|| bridge.run_unlocked(|| 7));
        assert_eq!(value, 7);
        assert_eq!(counts(), (1, 1));
    }

    #[test]
    fn missing_library_is_unavailable() {
        let config = LockBridgeConfig {
            library: Some(PathBuf::from("/nonexistent/libhost-runtime.so")),
            ..Default::default()
        };
        assert!(matches!(
            LockBridge::resolve(&config),
            Err(LockBridgeError::Unavailable { .. })
        ));
    }

    #[test]
    fn missing_symbol_is_unavailable() {
        let config = LockBridgeConfig {
            save_symbol: "hostbuf_no_such_save_symbol".to_string(),
            ..Default::default()
        };
        let err = LockBridge::resolve(&config).unwrap_err();
        assert!(err.to_string().contains("hostbuf_no_such_save_symbol"));
    }

    #[test]
    fn global_resolution_is_consistent() {
        let results: Vec<_> = (0..4)
            .map(|_| std::thread::spawn(|| LockBridge::global().map(|b| b as *const LockBridge as usize)))
            .collect::<Vec<_>>()
            .into_iter()
            .map(|handle| handle.join().unwrap())
            .collect();
        assert!(results.windows(2).all(|pair| pair[0] == pair[1]));
        // Without the pyo3 feature no interpreter is linked, so the cached result is an error.
        #[cfg(not(feature = "pyo3"))]
        assert!(matches!(results[0], Err(LockBridgeError::Unavailable { .. })));
    }
}
