use std::{collections::HashMap, sync::Arc};

use parking_lot::Mutex;

/// A loaded code module containing some address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleInfo {
    /// Path or name of the module.
    pub name: Arc<str>,
    /// Load address of the module.
    pub base: usize,
}

impl ModuleInfo {
    /// Creates a module description.
    pub fn new(name: impl Into<Arc<str>>, base: usize) -> Self {
        Self {
            name: name.into(),
            base,
        }
    }

    /// Offset of `address` relative to this module's base.
    pub fn relative(&self, address: usize) -> usize {
        address.wrapping_sub(self.base)
    }
}

/// Maps code addresses to modules and function names when a dump is produced.
///
/// Only ever called from the dump path, never while an intercepted call is in flight.
pub trait Symbolizer: Send + Sync {
    /// The module containing `address`, if any.
    fn module_of(&self, address: usize) -> Option<ModuleInfo>;

    /// The function containing `address`, if it can be resolved.
    fn function_name(&self, _address: usize) -> Option<String> {
        None
    }

    /// Called when a new code module has been mapped into the process.
    fn modules_changed(&self) {}
}

/// Default [`Symbolizer`] built on `dladdr` and the `backtrace` crate's symbol resolution.
///
/// Module lookups are cached per address until [`Symbolizer::modules_changed`] is called.
#[derive(Debug, Default)]
pub struct DlSymbolizer {
    cache: Mutex<HashMap<usize, Option<ModuleInfo>>>,
}

impl DlSymbolizer {
    /// Creates a symbolizer with an empty cache.
    pub fn new() -> Self {
        Self::default()
    }
}

impl Symbolizer for DlSymbolizer {
    fn module_of(&self, address: usize) -> Option<ModuleInfo> {
        if let Some(cached) = self.cache.lock().get(&address) {
            return cached.clone();
        }

        let resolved = dladdr_module(address);
        self.cache.lock().insert(address, resolved.clone());
        resolved
    }

    fn function_name(&self, address: usize) -> Option<String> {
        let mut name = None;
        backtrace::resolve(address as *mut std::ffi::c_void, |symbol| {
            if name.is_none() {
                name = symbol.name().map(|name| name.to_string());
            }
        });
        name
    }

    fn modules_changed(&self) {
        self.cache.lock().clear();
    }
}

#[cfg(unix)]
fn dladdr_module(address: usize) -> Option<ModuleInfo> {
    use std::ffi::CStr;

    if address == 0 {
        return None;
    }

    let mut info = std::mem::MaybeUninit::<libc::Dl_info>::zeroed();
    // SAFETY: `dladdr` only inspects the loader's module list; `address` is never dereferenced.
    let found = unsafe { libc::dladdr(address as *const libc::c_void, info.as_mut_ptr()) };
    if found == 0 {
        return None;
    }

    // SAFETY: a non-zero return means `dladdr` filled in the structure.
    let info = unsafe { info.assume_init() };
    if info.dli_fname.is_null() {
        return None;
    }

    // SAFETY: `dli_fname` points at a NUL-terminated string owned by the loader.
    let name = unsafe { CStr::from_ptr(info.dli_fname) }.to_string_lossy();
    Some(ModuleInfo::new(name.as_ref(), info.dli_fbase as usize))
}

#[cfg(not(unix))]
fn dladdr_module(_address: usize) -> Option<ModuleInfo> {
    None
}
