//! FFI types and entry points of native mod binaries
//!
//! A mod binary exports either the full entry point, returning an
//! [`FfiModInstance`] vtable, or the four C-style functions. Each symbol is
//! looked up under its plain name first and its stdcall-decorated name second.
//! All types use `#[repr(C)]` for ABI compatibility.

use crate::context::{ModContext, ModInterface};
use crate::error::LoadError;
use crate::hook::HookId;
use crate::journal::Severity;
use crate::patch::PatchId;
use libloading::Library;
use std::ffi::{c_char, c_void, CStr, CString};
use std::os::raw::c_int;
use std::path::{Path, PathBuf};
use void_core::ModId;

/// Success return code of host callbacks
pub const FFI_OK: c_int = 0;

/// Failure return code of host callbacks; details go to the journal
pub const FFI_ERROR: c_int = -1;

/// Full entry point
pub const LOAD_SYMBOLS: [&[u8]; 2] = [b"void_mod_load\0", b"_void_mod_load@0\0"];

/// C-style entry points
pub const C_LOAD_SYMBOLS: [&[u8]; 2] = [b"void_mod_c_load\0", b"_void_mod_c_load@4\0"];
pub const C_UNLOAD_SYMBOLS: [&[u8]; 2] = [b"void_mod_c_unload\0", b"_void_mod_c_unload@0\0"];
pub const C_ENABLE_SYMBOLS: [&[u8]; 2] = [b"void_mod_c_enable\0", b"_void_mod_c_enable@4\0"];
pub const C_DISABLE_SYMBOLS: [&[u8]; 2] = [b"void_mod_c_disable\0", b"_void_mod_c_disable@4\0"];
pub const C_FREE_ERROR_SYMBOLS: [&[u8]; 2] = [b"void_mod_c_free_error\0", b"_void_mod_c_free_error@4\0"];

/// Host services handed to native code
///
/// Only valid for the duration of the call it is passed to.
#[repr(C)]
pub struct FfiHostApi {
    /// Opaque pointer to the mod's context
    pub ctx: *mut c_void,
    /// Null-terminated ID of the mod
    pub mod_id: *const c_char,

    // Hooks
    pub add_hook: extern "C" fn(*mut c_void, usize, usize, *mut u64) -> c_int,
    pub enable_hook: extern "C" fn(*mut c_void, u64) -> c_int,
    pub disable_hook: extern "C" fn(*mut c_void, u64) -> c_int,
    pub remove_hook: extern "C" fn(*mut c_void, u64) -> c_int,

    // Patches
    pub patch: extern "C" fn(*mut c_void, usize, *const u8, usize, *mut u64) -> c_int,
    pub unpatch: extern "C" fn(*mut c_void, u64) -> c_int,

    // Logging
    pub log: extern "C" fn(*mut c_void, c_int, *const c_char),
}

/// Mod object returned by the full entry point
#[repr(C)]
pub struct FfiModInstance {
    /// Opaque pointer to the mod's state
    pub userdata: *mut c_void,
    pub setup: Option<extern "C" fn(*mut c_void, *const FfiHostApi)>,
    pub enable: Option<extern "C" fn(*mut c_void, *const FfiHostApi)>,
    pub disable: Option<extern "C" fn(*mut c_void, *const FfiHostApi)>,
    /// Frees the instance and its userdata
    pub destroy: Option<extern "C" fn(*mut FfiModInstance)>,
}

/// Type alias for the full entry point
pub type LoadFn = unsafe extern "C" fn() -> *mut FfiModInstance;

/// Returns null on success, or an error message
pub type CLoadFn = unsafe extern "C" fn(*const FfiHostApi) -> *const c_char;
pub type CUnloadFn = unsafe extern "C" fn();
pub type CToggleFn = unsafe extern "C" fn(*const FfiHostApi);
pub type CFreeErrorFn = unsafe extern "C" fn(*const c_char);

/// Build the mod instance exported by a loaded binary
///
/// # Safety
///
/// The returned instance calls into `library` and must be dropped before it.
pub unsafe fn instantiate(library: &Library, id: &ModId, path: &Path) -> Result<Box<dyn ModInterface>, LoadError> {
    if let Some(load) = lookup::<LoadFn>(library, &LOAD_SYMBOLS) {
        let instance = load();
        if instance.is_null() {
            return Err(LoadError::binary_load_failed(id, path, "entry point returned no mod instance"));
        }
        log::debug!("'{}' uses the full entry point", id);
        return Ok(Box::new(NativeMod::new(id, instance)));
    }

    if let Some(load) = lookup::<CLoadFn>(library, &C_LOAD_SYMBOLS) {
        log::debug!("'{}' uses the C entry points", id);
        return Ok(Box::new(CApiMod {
            id: ffi_id(id),
            path: path.to_path_buf(),
            load,
            unload: lookup(library, &C_UNLOAD_SYMBOLS),
            enable: lookup(library, &C_ENABLE_SYMBOLS),
            disable: lookup(library, &C_DISABLE_SYMBOLS),
            free_error: lookup(library, &C_FREE_ERROR_SYMBOLS),
            loaded: false,
        }));
    }

    Err(LoadError::EntryPointMissing {
        id: id.clone(),
        path: path.to_path_buf(),
    })
}

unsafe fn lookup<T: Copy>(library: &Library, names: &[&[u8]]) -> Option<T> {
    names
        .iter()
        .find_map(|name| library.get::<T>(name).ok().map(|symbol| *symbol))
}

fn ffi_id(id: &ModId) -> CString {
    // ModId is ASCII without NUL, so this cannot fail in practice
    CString::new(id.as_str()).unwrap_or_default()
}

/// Host API bound to `ctx`
pub fn host_api(ctx: &mut ModContext<'_>, id: &CString) -> FfiHostApi {
    FfiHostApi {
        ctx: ctx as *mut ModContext<'_> as *mut c_void,
        mod_id: id.as_ptr(),
        add_hook: host_add_hook,
        enable_hook: host_enable_hook,
        disable_hook: host_disable_hook,
        remove_hook: host_remove_hook,
        patch: host_patch,
        unpatch: host_unpatch,
        log: host_log,
    }
}

/// # Safety
///
/// `ctx` must come from [`host_api`] and the call it was made for must still be running.
unsafe fn context<'a>(ctx: *mut c_void) -> &'a mut ModContext<'a> {
    &mut *(ctx as *mut ModContext<'a>)
}

fn status<T, E>(result: Result<T, E>) -> c_int {
    if result.is_ok() {
        FFI_OK
    } else {
        FFI_ERROR
    }
}

extern "C" fn host_add_hook(ctx: *mut c_void, address: usize, detour: usize, out_id: *mut u64) -> c_int {
    let ctx = unsafe { context(ctx) };
    match ctx.add_hook(address, detour) {
        Ok(id) => {
            if !out_id.is_null() {
                unsafe { *out_id = id.to_raw() };
            }
            FFI_OK
        }
        Err(_) => FFI_ERROR,
    }
}

extern "C" fn host_enable_hook(ctx: *mut c_void, id: u64) -> c_int {
    status(unsafe { context(ctx) }.enable_hook(HookId::from_raw(id)))
}

extern "C" fn host_disable_hook(ctx: *mut c_void, id: u64) -> c_int {
    status(unsafe { context(ctx) }.disable_hook(HookId::from_raw(id)))
}

extern "C" fn host_remove_hook(ctx: *mut c_void, id: u64) -> c_int {
    status(unsafe { context(ctx) }.remove_hook(HookId::from_raw(id)))
}

extern "C" fn host_patch(ctx: *mut c_void, address: usize, bytes: *const u8, len: usize, out_id: *mut u64) -> c_int {
    let ctx = unsafe { context(ctx) };
    let bytes = if bytes.is_null() || len == 0 {
        &[][..]
    } else {
        unsafe { std::slice::from_raw_parts(bytes, len) }
    };
    match ctx.patch(address, bytes) {
        Ok(id) => {
            if !out_id.is_null() {
                unsafe { *out_id = id.to_raw() };
            }
            FFI_OK
        }
        Err(_) => FFI_ERROR,
    }
}

extern "C" fn host_unpatch(ctx: *mut c_void, id: u64) -> c_int {
    status(unsafe { context(ctx) }.unpatch(PatchId::from_raw(id)))
}

extern "C" fn host_log(ctx: *mut c_void, severity: c_int, message: *const c_char) {
    if message.is_null() {
        return;
    }
    let ctx = unsafe { context(ctx) };
    let message = unsafe { CStr::from_ptr(message) }.to_string_lossy().into_owned();
    ctx.log(severity_from_raw(severity), message);
}

/// Severity from its index, clamped to the known range
pub fn severity_from_raw(raw: c_int) -> Severity {
    let index = raw.clamp(0, Severity::ALL.len() as c_int - 1) as usize;
    Severity::ALL[index]
}

/// Adapter for binaries exporting the full entry point
pub struct NativeMod {
    id: CString,
    instance: *mut FfiModInstance,
}

impl NativeMod {
    fn new(id: &ModId, instance: *mut FfiModInstance) -> Self {
        Self {
            id: ffi_id(id),
            instance,
        }
    }

    fn call(&mut self, ctx: &mut ModContext<'_>, select: fn(&FfiModInstance) -> Option<extern "C" fn(*mut c_void, *const FfiHostApi)>) {
        if self.instance.is_null() {
            return;
        }
        // Safety: the instance stays valid until `destroy`, which nulls it
        let instance = unsafe { &*self.instance };
        if let Some(callback) = select(instance) {
            let host = host_api(ctx, &self.id);
            callback(instance.userdata, &host);
        }
    }

    fn destroy(&mut self) {
        if self.instance.is_null() {
            return;
        }
        let instance = std::mem::replace(&mut self.instance, std::ptr::null_mut());
        // Safety: `instance` is non-null and was produced by the mod's entry point
        if let Some(destroy) = unsafe { (*instance).destroy } {
            destroy(instance);
        }
    }
}

impl ModInterface for NativeMod {
    fn setup(&mut self, ctx: &mut ModContext<'_>) -> Result<(), LoadError> {
        self.call(ctx, |instance| instance.setup);
        Ok(())
    }

    fn enable(&mut self, ctx: &mut ModContext<'_>) {
        self.call(ctx, |instance| instance.enable);
    }

    fn disable(&mut self, ctx: &mut ModContext<'_>) {
        self.call(ctx, |instance| instance.disable);
    }

    fn unload(&mut self) {
        self.destroy();
    }
}

impl Drop for NativeMod {
    fn drop(&mut self) {
        self.destroy();
    }
}

/// Adapter for binaries exporting the C-style entry points
pub struct CApiMod {
    id: CString,
    path: PathBuf,
    load: CLoadFn,
    unload: Option<CUnloadFn>,
    enable: Option<CToggleFn>,
    disable: Option<CToggleFn>,
    free_error: Option<CFreeErrorFn>,
    loaded: bool,
}

impl CApiMod {
    fn toggle(&mut self, ctx: &mut ModContext<'_>, callback: Option<CToggleFn>) {
        if let Some(callback) = callback.filter(|_| self.loaded) {
            let host = host_api(ctx, &self.id);
            unsafe { callback(&host) };
        }
    }
}

impl ModInterface for CApiMod {
    fn setup(&mut self, ctx: &mut ModContext<'_>) -> Result<(), LoadError> {
        let host = host_api(ctx, &self.id);
        let error = unsafe { (self.load)(&host) };
        if error.is_null() {
            self.loaded = true;
            return Ok(());
        }

        let message = unsafe { CStr::from_ptr(error) }.to_string_lossy().into_owned();
        if let Some(free_error) = self.free_error {
            unsafe { free_error(error) };
        }
        Err(LoadError::binary_load_failed(ctx.id(), &self.path, message))
    }

    fn enable(&mut self, ctx: &mut ModContext<'_>) {
        self.toggle(ctx, self.enable);
    }

    fn disable(&mut self, ctx: &mut ModContext<'_>) {
        self.toggle(ctx, self.disable);
    }

    fn unload(&mut self) {
        if !std::mem::replace(&mut self.loaded, false) {
            return;
        }
        if let Some(unload) = self.unload {
            unsafe { unload() };
        }
    }
}
