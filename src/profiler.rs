use std::ffi::{c_char, c_int, CString, OsString};
use std::sync::Arc;

use anyhow::{Context, Result};
use libloading::Library;

pub const CUDART_ENV: &str = "AFNO_CUDART_LIB";
pub const NVTX_ENV: &str = "AFNO_NVTX_LIB";
const CUDART_DEFAULT: &str = "libcudart.so";
const NVTX_DEFAULT: &str = "libnvToolsExt.so";

type StatusFn = unsafe extern "C" fn() -> c_int;
type PushFn = unsafe extern "C" fn(*const c_char) -> c_int;

/// Resolved entry points. The libraries are kept alive alongside them.
struct NativeProfiler {
    start: StatusFn,
    stop: StatusFn,
    push: PushFn,
    pop: StatusFn,
    _cudart: Library,
    _nvtx: Library,
}

impl NativeProfiler {
    fn open(cudart: &OsString, nvtx: &OsString) -> Result<Self> {
        let cudart_lib = unsafe { Library::new(cudart) }
            .with_context(|| format!("failed to open profiler runtime {:?}", cudart))?;
        let nvtx_lib = unsafe { Library::new(nvtx) }
            .with_context(|| format!("failed to open range library {:?}", nvtx))?;
        unsafe {
            let start = *cudart_lib
                .get::<StatusFn>(b"cudaProfilerStart\0")
                .context("missing cudaProfilerStart")?;
            let stop = *cudart_lib
                .get::<StatusFn>(b"cudaProfilerStop\0")
                .context("missing cudaProfilerStop")?;
            let push = *nvtx_lib
                .get::<PushFn>(b"nvtxRangePushA\0")
                .context("missing nvtxRangePushA")?;
            let pop = *nvtx_lib
                .get::<StatusFn>(b"nvtxRangePop\0")
                .context("missing nvtxRangePop")?;
            Ok(Self { start, stop, push, pop, _cudart: cudart_lib, _nvtx: nvtx_lib })
        }
    }
}

/// Handle to the native profiler. The default handle is disabled and
/// every call on it is a no-op.
#[derive(Clone, Default)]
pub struct Profiler {
    native: Option<Arc<NativeProfiler>>,
}

impl Profiler {
    pub fn disabled() -> Self {
        Self::default()
    }

    /// Opens the libraries named by `AFNO_CUDART_LIB` and `AFNO_NVTX_LIB`,
    /// falling back to the usual sonames.
    pub fn load() -> Result<Self> {
        let cudart = std::env::var_os(CUDART_ENV).unwrap_or_else(|| CUDART_DEFAULT.into());
        let nvtx = std::env::var_os(NVTX_ENV).unwrap_or_else(|| NVTX_DEFAULT.into());
        Self::load_from(cudart, nvtx)
    }

    pub fn load_from(cudart: impl Into<OsString>, nvtx: impl Into<OsString>) -> Result<Self> {
        let native = NativeProfiler::open(&cudart.into(), &nvtx.into())?;
        tracing::debug!("profiler libraries loaded");
        Ok(Self { native: Some(Arc::new(native)) })
    }

    pub fn is_enabled(&self) -> bool {
        self.native.is_some()
    }

    pub fn start(&self) {
        if let Some(p) = &self.native {
            check("cudaProfilerStart", unsafe { (p.start)() });
        }
    }

    pub fn stop(&self) {
        if let Some(p) = &self.native {
            check("cudaProfilerStop", unsafe { (p.stop)() });
        }
    }

    /// Pushes a named range, popped when the guard drops.
    pub fn range(&self, name: &str) -> Range {
        let native = self.native.as_ref().map(|p| {
            // interior nul bytes are dropped rather than truncating the name
            let name = CString::new(name.replace('\0', "")).unwrap_or_default();
            unsafe { (p.push)(name.as_ptr()) };
            p.clone()
        });
        Range { native }
    }
}

fn check(call: &str, code: c_int) {
    if code != 0 {
        tracing::warn!(code, "{call} failed");
    }
}

#[must_use = "the range closes when this guard is dropped"]
pub struct Range {
    native: Option<Arc<NativeProfiler>>,
}

impl Drop for Range {
    fn drop(&mut self) {
        if let Some(p) = &self.native {
            unsafe { (p.pop)() };
        }
    }
}
