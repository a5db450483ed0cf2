//! Config path resolution
//!
//! The base directory is `SOURCEBIND_HOME` when set, otherwise derived from
//! the location of the loaded plugin module.

use std::path::{Path, PathBuf};

use super::{ConfigError, ConfigResult};

/// Environment variable overriding the base directory
pub const HOME_ENV: &str = "SOURCEBIND_HOME";

/// Returns the sourcebind base directory.
///
/// The plugin is loaded from:
/// `addons/sourcebind/bin/<platform>/sourcebind.so`
///
/// Without `SOURCEBIND_HOME` this navigates up 3 levels from the module
/// containing this code to reach `addons/sourcebind/`. The host executable
/// is only used when the module path cannot be determined.
pub fn base_dir() -> ConfigResult<PathBuf> {
    if let Some(home) = std::env::var_os(HOME_ENV).filter(|v| !v.is_empty()) {
        return Ok(PathBuf::from(home));
    }

    let binary = match module_path() {
        Some(path) => path,
        None => std::env::current_exe().map_err(ConfigError::IoError)?,
    };
    base_from_binary(&binary)
}

/// Absolute path of the shared object this code was loaded from
fn module_path() -> Option<PathBuf> {
    platform::module_path().filter(|path| path.is_absolute())
}

#[cfg(unix)]
mod platform {
    use std::ffi::{c_void, CStr, OsStr};
    use std::os::unix::ffi::OsStrExt;
    use std::path::PathBuf;

    pub fn module_path() -> Option<PathBuf> {
        // SAFETY: Dl_info is plain data; dladdr fills it on success
        let mut info: libc::Dl_info = unsafe { std::mem::zeroed() };
        let address = module_path as *const c_void;
        // SAFETY: address lies inside this module's code
        if unsafe { libc::dladdr(address, &mut info) } == 0 || info.dli_fname.is_null() {
            return None;
        }
        // SAFETY: dli_fname is a NUL-terminated string owned by the loader
        let name = unsafe { CStr::from_ptr(info.dli_fname) };
        if name.to_bytes().is_empty() {
            return None;
        }
        Some(PathBuf::from(OsStr::from_bytes(name.to_bytes())))
    }
}

#[cfg(windows)]
mod platform {
    use std::ffi::OsString;
    use std::os::windows::ffi::OsStringExt;
    use std::path::PathBuf;

    use windows::core::PCWSTR;
    use windows::Win32::Foundation::HMODULE;
    use windows::Win32::System::LibraryLoader::{
        GetModuleFileNameW, GetModuleHandleExW, GET_MODULE_HANDLE_EX_FLAG_FROM_ADDRESS,
        GET_MODULE_HANDLE_EX_FLAG_UNCHANGED_REFCOUNT,
    };

    pub fn module_path() -> Option<PathBuf> {
        let mut module = HMODULE::default();
        let address = PCWSTR(module_path as *const u16);
        let flags =
            GET_MODULE_HANDLE_EX_FLAG_FROM_ADDRESS | GET_MODULE_HANDLE_EX_FLAG_UNCHANGED_REFCOUNT;
        // SAFETY: with FROM_ADDRESS the name argument is an address inside this module
        unsafe { GetModuleHandleExW(flags, address, &mut module) }.ok()?;

        let mut name = [0u16; 1024];
        // SAFETY: buffer is writable for its full length
        let len = unsafe { GetModuleFileNameW(module, &mut name) } as usize;
        if len == 0 {
            return None;
        }
        Some(PathBuf::from(OsString::from_wide(&name[..len])))
    }
}

fn base_from_binary(binary: &Path) -> ConfigResult<PathBuf> {
    // Navigate: sourcebind.so -> <platform> -> bin -> sourcebind
    binary
        .parent()
        .and_then(|p| p.parent())
        .and_then(|p| p.parent())
        .map(PathBuf::from)
        .ok_or(ConfigError::NoConfigDirectory)
}

/// Returns the base configs directory.
///
/// Path: `addons/sourcebind/configs/`
pub fn configs_dir() -> ConfigResult<PathBuf> {
    Ok(base_dir()?.join("configs"))
}

/// Returns the core framework config path.
///
/// Path: `addons/sourcebind/configs/core.toml`
pub fn core_config_path() -> ConfigResult<PathBuf> {
    Ok(configs_dir()?.join("core.toml"))
}

/// Returns the gamedata directory for a configured relative path.
pub fn gamedata_dir(relative: &str) -> ConfigResult<PathBuf> {
    Ok(base_dir()?.join(relative))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base_from_binary() {
        let binary = PathBuf::from("/game/addons/sourcebind/bin/linux64/sourcebind.so");
        assert_eq!(
            base_from_binary(&binary).unwrap(),
            PathBuf::from("/game/addons/sourcebind")
        );
        assert!(base_from_binary(Path::new("sourcebind.so")).is_err());
    }

    #[test]
    fn test_module_path_is_this_binary() {
        let path = module_path().unwrap();
        assert!(path.is_absolute());
        assert!(path.exists());
    }
}
