//! OS loader backends
//!
//! Opens a shared library through the platform loader and reports where it
//! was mapped. Each successful [`open`] takes one loader reference, which
//! [`close`] gives back.

use std::ops::Range;
use std::path::{Path, PathBuf};

use crate::error::ResolveError;

/// A library mapped by the OS loader
#[derive(Debug)]
pub struct LoadedImage {
    /// Opaque loader handle (`dlopen` handle or `HMODULE`)
    pub handle: usize,
    /// Path the loader reports for the mapping
    pub path: PathBuf,
    /// Lowest mapped address
    pub base: usize,
    /// Span from `base` to the end of the highest mapping
    pub size: usize,
    /// Difference between link-time and run-time addresses
    pub load_bias: usize,
    /// Readable ranges inside `[base, base + size)`
    pub regions: Vec<Range<usize>>,
}

fn io_error(path: &Path, reason: impl Into<String>) -> ResolveError {
    ResolveError::Io {
        path: path.to_path_buf(),
        reason: reason.into(),
    }
}

#[cfg(target_os = "linux")]
mod imp {
    use std::ffi::{c_int, c_void, CStr, CString};
    use std::os::unix::ffi::OsStrExt;
    use std::path::{Path, PathBuf};

    use super::{io_error, LoadedImage};
    use crate::error::ResolveError;

    struct Mapping {
        name: CString,
        bias: usize,
        regions: Vec<std::ops::Range<usize>>,
    }

    fn last_dl_error() -> String {
        // SAFETY: dlerror returns null or a thread-local NUL-terminated string
        unsafe {
            let err = libc::dlerror();
            if err.is_null() {
                "unknown dlopen failure".to_string()
            } else {
                CStr::from_ptr(err).to_string_lossy().into_owned()
            }
        }
    }

    unsafe extern "C" fn collect_mapping(
        info: *mut libc::dl_phdr_info,
        _size: libc::size_t,
        data: *mut c_void,
    ) -> c_int {
        let mappings = &mut *(data as *mut Vec<Mapping>);
        let info = &*info;

        if info.dlpi_name.is_null() || *info.dlpi_name == 0 {
            return 0;
        }

        let bias = info.dlpi_addr as usize;
        let headers = std::slice::from_raw_parts(info.dlpi_phdr, info.dlpi_phnum as usize);
        let mut regions: Vec<_> = headers
            .iter()
            .filter(|h| h.p_type == libc::PT_LOAD && h.p_flags & libc::PF_R != 0)
            .map(|h| {
                let start = bias + h.p_vaddr as usize;
                start..start + h.p_memsz as usize
            })
            .collect();
        regions.sort_by_key(|r| r.start);

        mappings.push(Mapping {
            name: CStr::from_ptr(info.dlpi_name).to_owned(),
            bias,
            regions,
        });
        0
    }

    fn find_mapping(handle: *mut c_void) -> Option<Mapping> {
        let mut mappings: Vec<Mapping> = Vec::new();
        // SAFETY: the callback only touches `mappings` through the data pointer
        unsafe {
            libc::dl_iterate_phdr(
                Some(collect_mapping),
                &mut mappings as *mut Vec<Mapping> as *mut c_void,
            );
        }

        // Same object if re-opening its name without loading yields our handle
        mappings.into_iter().find(|mapping| {
            // SAFETY: name is NUL-terminated
            let probe = unsafe {
                libc::dlopen(mapping.name.as_ptr(), libc::RTLD_NOW | libc::RTLD_NOLOAD)
            };
            if probe.is_null() {
                return false;
            }
            // SAFETY: probe came from dlopen above
            unsafe { libc::dlclose(probe) };
            probe == handle
        })
    }

    pub fn open(path: &Path) -> Result<LoadedImage, ResolveError> {
        let c_path = CString::new(path.as_os_str().as_bytes())
            .map_err(|_| io_error(path, "path contains a NUL byte"))?;

        // SAFETY: c_path is NUL-terminated
        let handle = unsafe { libc::dlopen(c_path.as_ptr(), libc::RTLD_NOW) };
        if handle.is_null() {
            return Err(io_error(path, last_dl_error()));
        }

        let mapping = find_mapping(handle).filter(|m| !m.regions.is_empty());
        let Some(mapping) = mapping else {
            // SAFETY: handle came from dlopen above
            unsafe { libc::dlclose(handle) };
            return Err(io_error(path, "loaded image has no readable segments"));
        };

        let base = mapping.regions[0].start;
        let size = mapping.regions.iter().map(|r| r.end).max().unwrap_or(base) - base;
        Ok(LoadedImage {
            handle: handle as usize,
            path: PathBuf::from(std::ffi::OsStr::from_bytes(mapping.name.as_bytes())),
            base,
            size,
            load_bias: mapping.bias,
            regions: mapping.regions,
        })
    }

    pub fn symbol(handle: usize, name: &str) -> Option<usize> {
        let c_name = CString::new(name).ok()?;
        // SAFETY: handle is a live dlopen handle owned by the caller
        let address = unsafe { libc::dlsym(handle as *mut c_void, c_name.as_ptr()) };
        (!address.is_null()).then_some(address as usize)
    }

    pub fn close(handle: usize) {
        // SAFETY: handle came from a successful dlopen
        unsafe { libc::dlclose(handle as *mut c_void) };
    }
}

#[cfg(windows)]
mod imp {
    use std::ffi::CString;
    use std::path::{Path, PathBuf};

    use windows::core::{HSTRING, PCSTR};
    use windows::Win32::Foundation::{FreeLibrary, HMODULE};
    use windows::Win32::System::LibraryLoader::{GetModuleFileNameW, GetProcAddress, LoadLibraryW};
    use windows::Win32::System::ProcessStatus::{GetModuleInformation, MODULEINFO};
    use windows::Win32::System::Threading::GetCurrentProcess;

    use super::{io_error, LoadedImage};
    use crate::error::ResolveError;

    pub fn open(path: &Path) -> Result<LoadedImage, ResolveError> {
        let wide = HSTRING::from(path.as_os_str());
        // SAFETY: wide is a valid NUL-terminated wide string
        let module = unsafe { LoadLibraryW(&wide) }.map_err(|e| io_error(path, e.to_string()))?;

        let mut info = MODULEINFO::default();
        // SAFETY: module is a live module handle, info is correctly sized
        let queried = unsafe {
            GetModuleInformation(
                GetCurrentProcess(),
                module,
                &mut info,
                std::mem::size_of::<MODULEINFO>() as u32,
            )
        };
        if let Err(e) = queried {
            // SAFETY: module came from LoadLibraryW above
            let _ = unsafe { FreeLibrary(module) };
            return Err(io_error(path, e.to_string()));
        }

        let mut name = [0u16; 1024];
        // SAFETY: buffer is writable for its full length
        let len = unsafe { GetModuleFileNameW(module, &mut name) } as usize;
        let loaded_path = if len == 0 {
            path.to_path_buf()
        } else {
            PathBuf::from(String::from_utf16_lossy(&name[..len]))
        };

        let base = info.lpBaseOfDll as usize;
        let size = info.SizeOfImage as usize;
        Ok(LoadedImage {
            handle: module.0 as usize,
            path: loaded_path,
            base,
            size,
            load_bias: base,
            regions: vec![base..base + size],
        })
    }

    pub fn symbol(handle: usize, name: &str) -> Option<usize> {
        let c_name = CString::new(name).ok()?;
        // SAFETY: handle is a live module owned by the caller
        let proc = unsafe {
            GetProcAddress(
                HMODULE(handle as *mut std::ffi::c_void),
                PCSTR(c_name.as_ptr() as *const u8),
            )
        };
        proc.map(|f| f as usize)
    }

    pub fn close(handle: usize) {
        // SAFETY: handle came from LoadLibraryW
        let _ = unsafe { FreeLibrary(HMODULE(handle as *mut std::ffi::c_void)) };
    }
}

#[cfg(not(any(target_os = "linux", windows)))]
mod imp {
    use std::path::Path;

    use super::{io_error, LoadedImage};
    use crate::error::ResolveError;

    pub fn open(path: &Path) -> Result<LoadedImage, ResolveError> {
        Err(io_error(path, "image loading is not supported on this platform"))
    }

    pub fn symbol(_handle: usize, _name: &str) -> Option<usize> {
        None
    }

    pub fn close(_handle: usize) {}
}

/// Load `path` through the OS loader
#[tracing::instrument(skip_all, fields(path = %path.display()))]
pub fn open(path: &Path) -> Result<LoadedImage, ResolveError> {
    let image = imp::open(path)?;
    tracing::debug!(
        "Mapped {} at {:#x} ({:#x} bytes, {} regions)",
        image.path.display(),
        image.base,
        image.size,
        image.regions.len()
    );
    Ok(image)
}

/// Exported symbol lookup through the OS loader
pub fn symbol(handle: usize, name: &str) -> Option<usize> {
    if handle == 0 {
        return None;
    }
    imp::symbol(handle, name)
}

/// Release one loader reference
pub fn close(handle: usize) {
    if handle != 0 {
        imp::close(handle);
    }
}

#[cfg(all(test, target_os = "linux"))]
mod tests {
    use super::*;

    #[test]
    fn test_open_libc() {
        let image = open(Path::new("libc.so.6")).unwrap();
        assert!(image.base != 0);
        assert!(image.size > 0);
        assert!(!image.regions.is_empty());

        let strlen = symbol(image.handle, "strlen").unwrap();
        assert!(strlen >= image.base && strlen < image.base + image.size);

        close(image.handle);
    }

    #[test]
    fn test_open_missing() {
        let result = open(Path::new("/nonexistent/libmissing.so"));
        assert!(matches!(result, Err(ResolveError::Io { .. })));
    }
}
