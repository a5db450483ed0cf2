//! C-compatible exports called by the host binding layer

use std::ffi::{c_char, c_int};
use std::sync::Arc;

use tracing::instrument;
use tracing_subscriber::EnvFilter;

use sourcebind_core::{init_runtime, runtime, CoreConfig};

use super::bridge::{advance_frame, FfiEntityBridge, SourcebindEntityBridge};

// Plugin metadata - static strings with null terminators for C compatibility
static AUTHOR: &[u8] = concat!(env!("CARGO_PKG_AUTHORS"), "\0").as_bytes();
static NAME: &[u8] = b"sourcebind\0";
static DESCRIPTION: &[u8] = b"Native hooking, dynamic calls and entity rule managers\0";
static URL: &[u8] = concat!(env!("CARGO_PKG_REPOSITORY"), "\0").as_bytes();
static LICENSE: &[u8] = concat!(env!("CARGO_PKG_LICENSE"), "\0").as_bytes();
static VERSION: &[u8] = concat!(env!("CARGO_PKG_VERSION"), "\0").as_bytes();
static LOG_TAG: &[u8] = b"SOURCEBIND\0";

fn init_logging(config: &CoreConfig) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(config.log_filter()))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

/// Called when the host loads the plugin
///
/// Loads `configs/core.toml`, initialises logging, creates the shared
/// runtime and wires the gamedata hooks. Missing gamedata is not fatal.
///
/// # Safety
/// - `error` must be a valid pointer to a buffer of at least `maxlen` bytes, or null
#[no_mangle]
pub unsafe extern "C" fn sourcebind_load(error: *mut c_char, maxlen: usize) -> bool {
    let (config, config_error) = match CoreConfig::load() {
        Ok(config) => (config, None),
        Err(e) => (CoreConfig::default(), Some(e)),
    };
    init_logging(&config);

    tracing::info!("sourcebind loading...");
    if let Some(e) = config_error {
        tracing::warn!("Using default config: {}", e);
    }

    let result = std::panic::catch_unwind(|| {
        let context = init_runtime(config);
        if let Err(e) = context.load_gamedata() {
            tracing::warn!("Gamedata not loaded: {}", e);
        }
    });
    if result.is_err() {
        write_error(error, maxlen, "Panic during load");
        return false;
    }

    tracing::info!("sourcebind loaded successfully!");
    tracing::info!("Main thread ID: {:?}", std::thread::current().id());
    true
}

/// Called when the host unloads the plugin
///
/// # Safety
/// - `error` must be a valid pointer to a buffer of at least `maxlen` bytes, or null
#[no_mangle]
#[instrument(skip_all)]
pub unsafe extern "C" fn sourcebind_unload(error: *mut c_char, maxlen: usize) -> bool {
    tracing::info!("sourcebind unloading...");

    match std::panic::catch_unwind(crate::shutdown) {
        Ok(()) => true,
        Err(_) => {
            write_error(error, maxlen, "Panic during shutdown");
            false
        }
    }
}

/// Install the host's entity lookups
///
/// Returns false if the runtime is not loaded or a lookup is missing.
///
/// # Safety
/// - `bridge` must point to a valid `SourcebindEntityBridge` or be null
/// - the function pointers it holds must stay callable until unload
#[no_mangle]
pub unsafe extern "C" fn sourcebind_set_entity_bridge(bridge: *const SourcebindEntityBridge) -> bool {
    let Some(context) = runtime() else {
        return false;
    };
    if bridge.is_null() {
        context.clear_entity_bridge();
        return true;
    }

    match FfiEntityBridge::new(*bridge) {
        Some(bridge) => {
            context.set_entity_bridge(Arc::new(bridge));
            true
        }
        None => {
            tracing::error!("Rejected incomplete entity bridge");
            false
        }
    }
}

/// Called by the host once per server frame; advances the cache epoch
#[no_mangle]
pub extern "C" fn sourcebind_on_game_frame() {
    let frame = advance_frame();
    tracing::trace!("Game frame {}", frame);
}

/// Called by the host when an entity is removed
#[no_mangle]
pub extern "C" fn sourcebind_on_entity_deleted(index: c_int) {
    let Ok(index) = u32::try_from(index) else {
        return;
    };
    if let Some(context) = runtime() {
        context.on_entity_deleted(index);
    }
}

/// Called by the host when the level shuts down
#[no_mangle]
pub extern "C" fn sourcebind_on_level_shutdown() {
    if let Some(context) = runtime() {
        context.on_level_shutdown();
    }
}

// Metadata exports - these return static strings for the host to display

#[no_mangle]
pub extern "C" fn sourcebind_get_author() -> *const c_char {
    AUTHOR.as_ptr() as *const c_char
}

#[no_mangle]
pub extern "C" fn sourcebind_get_name() -> *const c_char {
    NAME.as_ptr() as *const c_char
}

#[no_mangle]
pub extern "C" fn sourcebind_get_description() -> *const c_char {
    DESCRIPTION.as_ptr() as *const c_char
}

#[no_mangle]
pub extern "C" fn sourcebind_get_url() -> *const c_char {
    URL.as_ptr() as *const c_char
}

#[no_mangle]
pub extern "C" fn sourcebind_get_license() -> *const c_char {
    LICENSE.as_ptr() as *const c_char
}

#[no_mangle]
pub extern "C" fn sourcebind_get_version() -> *const c_char {
    VERSION.as_ptr() as *const c_char
}

#[no_mangle]
pub extern "C" fn sourcebind_get_log_tag() -> *const c_char {
    LOG_TAG.as_ptr() as *const c_char
}

/// Helper to write an error message to a C buffer
///
/// # Safety
/// - `error` must be a valid pointer or null
/// - `maxlen` must accurately reflect the buffer size
unsafe fn write_error(error: *mut c_char, maxlen: usize, msg: &str) {
    if !error.is_null() && maxlen > 0 {
        let bytes = msg.as_bytes();
        let len = bytes.len().min(maxlen - 1);
        std::ptr::copy_nonoverlapping(bytes.as_ptr(), error as *mut u8, len);
        *error.add(len) = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ffi::CStr;

    #[test]
    fn test_metadata_is_nul_terminated() {
        for getter in [sourcebind_get_name, sourcebind_get_version, sourcebind_get_log_tag] {
            let text = unsafe { CStr::from_ptr(getter()) };
            assert!(!text.to_bytes().is_empty());
        }
        let version = unsafe { CStr::from_ptr(sourcebind_get_version()) };
        assert_eq!(version.to_str().unwrap(), env!("CARGO_PKG_VERSION"));
    }

    #[test]
    fn test_metadata_comes_from_manifest() {
        let author = unsafe { CStr::from_ptr(sourcebind_get_author()) };
        let url = unsafe { CStr::from_ptr(sourcebind_get_url()) };
        let license = unsafe { CStr::from_ptr(sourcebind_get_license()) };
        assert_eq!(author.to_str().unwrap(), env!("CARGO_PKG_AUTHORS"));
        assert_eq!(url.to_str().unwrap(), env!("CARGO_PKG_REPOSITORY"));
        assert_eq!(license.to_str().unwrap(), "MIT");
        assert!(!author.to_bytes().is_empty());
    }

    #[test]
    fn test_write_error_truncates() {
        let mut buffer = [0x7f as c_char; 8];
        unsafe { write_error(buffer.as_mut_ptr(), buffer.len(), "Panic during load") };
        let text = unsafe { CStr::from_ptr(buffer.as_ptr()) };
        assert_eq!(text.to_str().unwrap(), "Panic d");
    }

    #[test]
    fn test_notifications_without_runtime_are_ignored() {
        sourcebind_on_entity_deleted(-1);
        sourcebind_on_level_shutdown();
        assert!(runtime().is_none());
        assert!(!unsafe { sourcebind_set_entity_bridge(std::ptr::null()) });
    }
}
