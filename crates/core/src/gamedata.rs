//! Gamedata system for loading signatures, offsets and functions from JSON
//!
//! Gamedata files are deployed next to the plugin so addresses can be
//! updated without recompiling. Three entry kinds exist:
//!
//! ```json
//! {
//!     "TraceRay": {
//!         "signatures": { "library": "engine", "srv_check": true,
//!                         "linux": "55 48 89 E5 ? ? 41 57", "windows": "@TraceRay" }
//!     },
//!     "ShouldHitEntity": { "offsets": { "linux": 0, "windows": 0 } },
//!     "CheckTransmit": {
//!         "functions": { "library": "server", "linux": "@_ZN15CServerGameEnts13CheckTransmitEP18CCheckTransmitInfoPKti",
//!                        "convention": "thiscall", "signature": "pppi)v" }
//!     }
//! }
//! ```
//!
//! Identifiers are either byte patterns (`?`/`??` wildcards) or symbol names
//! (optionally prefixed with `@`).

use std::collections::HashMap;
use std::path::Path;

use serde::Deserialize;
use sourcebind_memory::{BinaryImageRegistry, Identifier, Pointer, ResolveError};
use sourcebind_sdk::{CallingConvention, FunctionSignature};
use thiserror::Error;

use crate::call::{CallError, CallableFunction};
use crate::config::ConfigError;

/// Errors that can occur when loading or resolving gamedata
#[derive(Debug, Error)]
pub enum GamedataError {
    #[error("Failed to read gamedata file: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Failed to parse gamedata JSON: {0}")]
    ParseError(#[from] serde_json::Error),

    #[error("Signature not found: {0}")]
    SignatureNotFound(String),

    #[error("Offset not found: {0}")]
    OffsetNotFound(String),

    #[error("Function not found: {0}")]
    FunctionNotFound(String),

    #[error("Invalid calling convention for {name}: {reason}")]
    InvalidConvention { name: String, reason: String },

    #[error("Failed to find signature in memory: {0}")]
    ScanFailed(String),

    #[error(transparent)]
    Resolve(#[from] ResolveError),

    #[error(transparent)]
    Call(#[from] CallError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// Platform-specific signature entry
#[derive(Debug, Clone, Deserialize)]
pub struct SignatureEntry {
    /// Library to scan (e.g., "server", "engine")
    #[serde(default = "default_library")]
    pub library: String,
    /// Try the dedicated-server `_srv` module name first
    #[serde(default)]
    pub srv_check: bool,
    /// Windows identifier
    pub windows: Option<String>,
    /// Linux identifier
    pub linux: Option<String>,
}

fn default_library() -> String {
    "server".to_string()
}

/// Platform-specific offset entry
#[derive(Debug, Clone, Deserialize)]
pub struct OffsetEntry {
    /// Windows offset value
    pub windows: Option<i64>,
    /// Linux offset value
    pub linux: Option<i64>,
}

/// A signature plus what is needed to call or hook the function
#[derive(Debug, Clone, Deserialize)]
pub struct FunctionEntry {
    #[serde(flatten)]
    pub address: SignatureEntry,
    #[serde(default = "default_convention")]
    pub convention: String,
    /// Signature string such as `"ppi)B"`
    pub signature: String,
}

fn default_convention() -> String {
    "cdecl".to_string()
}

/// Loaded gamedata
#[derive(Debug, Default, Clone)]
pub struct Gamedata {
    signatures: HashMap<String, SignatureEntry>,
    offsets: HashMap<String, OffsetEntry>,
    functions: HashMap<String, FunctionEntry>,
}

fn platform<T: Clone>(linux: &Option<T>, windows: &Option<T>) -> Option<T> {
    #[cfg(target_os = "windows")]
    {
        let _ = linux;
        windows.clone()
    }

    #[cfg(not(target_os = "windows"))]
    {
        let _ = windows;
        linux.clone()
    }
}

impl Gamedata {
    /// Load gamedata from a JSON file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, GamedataError> {
        let content = std::fs::read_to_string(path)?;
        Self::load_from_str(&content)
    }

    /// Load gamedata from a JSON string
    pub fn load_from_str(json: &str) -> Result<Self, GamedataError> {
        let mut gamedata = Gamedata::default();
        gamedata.merge_str(json)?;
        Ok(gamedata)
    }

    /// Load every `*.json` file of a directory, later files overriding earlier ones
    pub fn load_from_dir<P: AsRef<Path>>(dir: P) -> Result<Self, GamedataError> {
        let mut files: Vec<_> = std::fs::read_dir(dir)?
            .filter_map(Result::ok)
            .map(|entry| entry.path())
            .filter(|path| path.extension().is_some_and(|ext| ext == "json"))
            .collect();
        files.sort();

        let mut gamedata = Gamedata::default();
        for file in files {
            let content = std::fs::read_to_string(&file)?;
            gamedata.merge_str(&content)?;
            tracing::debug!("Merged gamedata from {:?}", file);
        }
        Ok(gamedata)
    }

    fn merge_str(&mut self, json: &str) -> Result<(), GamedataError> {
        let raw: HashMap<String, serde_json::Value> = serde_json::from_str(json)?;

        for (name, value) in raw {
            if let Some(entry) = value.get("signatures") {
                let entry: SignatureEntry = serde_json::from_value(entry.clone())?;
                self.signatures.insert(name, entry);
            } else if let Some(entry) = value.get("offsets") {
                let entry: OffsetEntry = serde_json::from_value(entry.clone())?;
                self.offsets.insert(name, entry);
            } else if let Some(entry) = value.get("functions") {
                let entry: FunctionEntry = serde_json::from_value(entry.clone())?;
                self.functions.insert(name, entry);
            }
            // Flat signature entry without a kind key
            else if value.get("linux").is_some() || value.get("windows").is_some() {
                let entry: SignatureEntry = serde_json::from_value(value)?;
                self.signatures.insert(name, entry);
            } else {
                tracing::warn!("Ignoring gamedata entry {} of unknown kind", name);
            }
        }

        tracing::info!(
            "Loaded gamedata: {} signatures, {} offsets, {} functions",
            self.signatures.len(),
            self.offsets.len(),
            self.functions.len()
        );
        Ok(())
    }

    /// Get a signature by name for the current platform
    pub fn get_signature(&self, name: &str) -> Result<String, GamedataError> {
        let entry = self
            .signatures
            .get(name)
            .ok_or_else(|| GamedataError::SignatureNotFound(name.to_string()))?;

        platform(&entry.linux, &entry.windows).ok_or_else(|| {
            GamedataError::SignatureNotFound(format!("{} (no signature for this platform)", name))
        })
    }

    /// Get an offset by name for the current platform
    pub fn get_offset(&self, name: &str) -> Result<i64, GamedataError> {
        let entry = self
            .offsets
            .get(name)
            .ok_or_else(|| GamedataError::OffsetNotFound(name.to_string()))?;

        platform(&entry.linux, &entry.windows).ok_or_else(|| {
            GamedataError::OffsetNotFound(format!("{} (no offset for this platform)", name))
        })
    }

    /// Get the library name for a signature or function
    pub fn get_signature_library(&self, name: &str) -> Option<&str> {
        self.signatures
            .get(name)
            .or_else(|| self.functions.get(name).map(|f| &f.address))
            .map(|e| e.library.as_str())
    }

    pub fn has_function(&self, name: &str) -> bool {
        self.functions.contains_key(name)
    }

    fn locate(
        name: &str,
        entry: &SignatureEntry,
        registry: &BinaryImageRegistry,
    ) -> Result<Pointer, GamedataError> {
        let text = platform(&entry.linux, &entry.windows).ok_or_else(|| {
            GamedataError::SignatureNotFound(format!("{} (no signature for this platform)", name))
        })?;

        let image = registry.load(&entry.library, entry.srv_check)?;
        let address = image.find_address(&Identifier::parse(&text))?;
        if address.is_null() {
            return Err(GamedataError::ScanFailed(name.to_string()));
        }
        tracing::debug!("Gamedata {} resolved to {}", name, address);
        Ok(address)
    }

    /// Resolve a signatures or functions entry to an address
    pub fn resolve_address(
        &self,
        name: &str,
        registry: &BinaryImageRegistry,
    ) -> Result<Pointer, GamedataError> {
        let entry = self
            .signatures
            .get(name)
            .or_else(|| self.functions.get(name).map(|f| &f.address))
            .ok_or_else(|| GamedataError::SignatureNotFound(name.to_string()))?;
        Self::locate(name, entry, registry)
    }

    /// Build a callable function from a functions entry
    pub fn function(
        &self,
        name: &str,
        registry: &BinaryImageRegistry,
    ) -> Result<CallableFunction, GamedataError> {
        let entry = self
            .functions
            .get(name)
            .ok_or_else(|| GamedataError::FunctionNotFound(name.to_string()))?;

        let convention: CallingConvention =
            entry
                .convention
                .parse()
                .map_err(|reason| GamedataError::InvalidConvention {
                    name: name.to_string(),
                    reason,
                })?;
        // Validate the signature before touching any image
        let signature = FunctionSignature::parse(&entry.signature).map_err(CallError::from)?;

        let address = Self::locate(name, &entry.address, registry)?;
        Ok(CallableFunction::new(address, convention, signature)?)
    }
}
