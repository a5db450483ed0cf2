//! Loaded binary images and address resolution
//!
//! A [`BinaryImage`] remembers where a module is mapped and resolves
//! identifiers to absolute addresses: exported or internal symbol names, and
//! byte patterns ("signatures"). Successful signature scans are cached by
//! their exact pattern bytes.
//!
//! Lookup misses are not errors: they return a null [`Pointer`] and the
//! caller decides what to do.

use std::collections::HashMap;
use std::ops::Range;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use dashmap::DashMap;
use object::{Object, ObjectSymbol};

use crate::error::ResolveError;
use crate::loader;
use crate::pointer::Pointer;
use crate::scan::{self, WILDCARD};

/// `jmp rel32` opcode written by relative-jump detours
const RELATIVE_JUMP: [u8; 1] = [0xE9];

/// `jmp [rip+disp32]` opcode written by absolute indirect detours
const ABSOLUTE_JUMP: [u8; 2] = [0xFF, 0x25];

/// Bytes covered by a detour jump: opcode plus 32-bit operand
const RELATIVE_JUMP_LEN: usize = RELATIVE_JUMP.len() + 4;
const ABSOLUTE_JUMP_LEN: usize = ABSOLUTE_JUMP.len() + 4;

/// Something that names an address inside an image
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Identifier {
    /// Exported or internal symbol name
    Symbol(String),
    /// Raw pattern bytes, `0x2A` is a wildcard
    Signature(Vec<u8>),
}

impl Identifier {
    /// Interpret gamedata text
    ///
    /// `@name` is always a symbol. Text that parses as a hex or `\x` pattern
    /// is a signature; anything else is a symbol name.
    pub fn parse(text: &str) -> Self {
        let text = text.trim();
        if let Some(symbol) = text.strip_prefix('@') {
            return Identifier::Symbol(symbol.to_string());
        }
        let looks_like_pattern = text.starts_with("\\x") || text.contains(' ');
        match scan::parse_pattern(text) {
            Ok(bytes) if looks_like_pattern => Identifier::Signature(bytes),
            _ => Identifier::Symbol(text.to_string()),
        }
    }
}

impl From<&str> for Identifier {
    fn from(name: &str) -> Self {
        Identifier::Symbol(name.to_string())
    }
}

impl From<Vec<u8>> for Identifier {
    fn from(pattern: Vec<u8>) -> Self {
        Identifier::Signature(pattern)
    }
}

impl From<&[u8]> for Identifier {
    fn from(pattern: &[u8]) -> Self {
        Identifier::Signature(pattern.to_vec())
    }
}

/// A module mapped into this process
pub struct BinaryImage {
    path: PathBuf,
    handle: usize,
    base: usize,
    size: usize,
    load_bias: usize,
    regions: Vec<Range<usize>>,
    signatures: DashMap<Vec<u8>, usize>,
    symbols: OnceLock<HashMap<String, usize>>,
}

impl BinaryImage {
    /// Load `path` through the OS loader
    pub fn load(path: &Path) -> Result<Self, ResolveError> {
        let loaded = loader::open(path)?;
        tracing::info!(
            "Loaded binary image {} at {:#x} ({:#x} bytes)",
            loaded.path.display(),
            loaded.base,
            loaded.size
        );
        Ok(Self {
            path: loaded.path,
            handle: loaded.handle,
            base: loaded.base,
            size: loaded.size,
            load_bias: loaded.load_bias,
            regions: loaded.regions,
            signatures: DashMap::new(),
            symbols: OnceLock::new(),
        })
    }

    /// Treat an arbitrary readable range as an image
    ///
    /// Such an image has no symbols.
    ///
    /// # Safety
    /// `[base, base + size)` must stay readable for the image's lifetime.
    pub unsafe fn from_memory(base: *const u8, size: usize) -> Self {
        let base = base as usize;
        Self {
            path: PathBuf::from(format!("<memory {:#x}>", base)),
            handle: 0,
            base,
            size,
            load_bias: base,
            regions: vec![base..base + size],
            signatures: DashMap::new(),
            symbols: OnceLock::from(HashMap::new()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn base(&self) -> Pointer {
        Pointer::new(self.base)
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn contains(&self, address: Pointer) -> bool {
        (self.base..self.base + self.size).contains(&address.address())
    }

    /// Number of cached signature resolutions
    pub fn cached_signatures(&self) -> usize {
        self.signatures.len()
    }

    /// Resolve a symbol name
    ///
    /// Tries the loader's exported symbols first, then the on-disk symbol
    /// table for internal symbols.
    pub fn find_symbol(&self, name: &str) -> Pointer {
        if let Some(address) = loader::symbol(self.handle, name) {
            tracing::debug!("Resolved export {} -> {:#x}", name, address);
            return Pointer::new(address);
        }

        match self.symbol_table().get(name) {
            Some(&relative) => {
                let address = self.load_bias.wrapping_add(relative);
                tracing::debug!("Resolved symbol {} -> {:#x}", name, address);
                Pointer::new(address)
            }
            None => {
                tracing::debug!("Symbol {} not found in {}", name, self.path.display());
                Pointer::NULL
            }
        }
    }

    fn symbol_table(&self) -> &HashMap<String, usize> {
        self.symbols.get_or_init(|| match read_symbol_table(&self.path) {
            Ok(table) => {
                tracing::debug!(
                    "Parsed {} symbols from {}",
                    table.len(),
                    self.path.display()
                );
                table
            }
            Err(e) => {
                tracing::warn!("{}", e);
                HashMap::new()
            }
        })
    }

    /// Resolve a byte pattern
    ///
    /// Returns the first match. If there is none, retries on the assumption
    /// that the target's first bytes were replaced by a jump detour; such a
    /// recovered match must be unique in the rest of the image or
    /// [`ResolveError::AmbiguousSignature`] is returned.
    #[tracing::instrument(skip_all)]
    pub fn find_signature(&self, pattern: &[u8]) -> Result<Pointer, ResolveError> {
        if pattern.is_empty() {
            return Err(ResolveError::InvalidSignature(
                "Empty signature pattern".to_string(),
            ));
        }

        if let Some(address) = self.signatures.get(pattern) {
            return Ok(Pointer::new(*address));
        }

        let found = match self.scan_from(pattern, self.base) {
            Some(address) => Some(address),
            None => self.recover_hooked(pattern)?,
        };

        match found {
            Some(address) => {
                tracing::debug!(
                    "Signature {} -> {:#x}",
                    scan::format_pattern(pattern),
                    address
                );
                self.signatures.insert(pattern.to_vec(), address);
                Ok(Pointer::new(address))
            }
            None => {
                tracing::debug!(
                    "Signature {} not found in {}",
                    scan::format_pattern(pattern),
                    self.path.display()
                );
                Ok(Pointer::NULL)
            }
        }
    }

    /// Dispatch on the identifier kind
    pub fn find_address(&self, identifier: &Identifier) -> Result<Pointer, ResolveError> {
        match identifier {
            Identifier::Symbol(name) => Ok(self.find_symbol(name)),
            Identifier::Signature(pattern) => self.find_signature(pattern),
        }
    }

    fn recover_hooked(&self, pattern: &[u8]) -> Result<Option<usize>, ResolveError> {
        if pattern.len() > RELATIVE_JUMP_LEN + 1 {
            let probe = jump_probe(&RELATIVE_JUMP, RELATIVE_JUMP_LEN, pattern);
            if let Some(address) = self.scan_unique(&probe)? {
                tracing::info!(
                    "Recovered relative-jump hooked signature at {:#x}",
                    address
                );
                return Ok(Some(address));
            }
        }

        if pattern.len() > ABSOLUTE_JUMP_LEN {
            let probe = jump_probe(&ABSOLUTE_JUMP, ABSOLUTE_JUMP_LEN, pattern);
            if let Some(address) = self.scan_unique(&probe)? {
                tracing::info!(
                    "Recovered absolute-jump hooked signature at {:#x}",
                    address
                );
                return Ok(Some(address));
            }
        }

        Ok(None)
    }

    fn scan_unique(&self, probe: &[u8]) -> Result<Option<usize>, ResolveError> {
        let Some(address) = self.scan_from(probe, self.base) else {
            return Ok(None);
        };
        if self.scan_from(probe, address + 1).is_some() {
            return Err(ResolveError::AmbiguousSignature {
                pattern: scan::format_pattern(probe),
            });
        }
        Ok(Some(address))
    }

    fn scan_from(&self, pattern: &[u8], from: usize) -> Option<usize> {
        self.regions
            .iter()
            .filter(|region| region.end > from)
            .find_map(|region| {
                let start = region.start.max(from);
                // SAFETY: regions are readable for the image's lifetime
                unsafe { scan::scan(start as *const u8, region.end - start, pattern) }
                    .map(|p| p as usize)
            })
    }
}

impl Drop for BinaryImage {
    fn drop(&mut self) {
        loader::close(self.handle);
    }
}

impl std::fmt::Debug for BinaryImage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BinaryImage")
            .field("path", &self.path)
            .field("base", &format_args!("{:#x}", self.base))
            .field("size", &format_args!("{:#x}", self.size))
            .field("cached_signatures", &self.signatures.len())
            .finish()
    }
}

/// Pattern with its first `jump_len` bytes replaced by `opcode` and wildcards
fn jump_probe(opcode: &[u8], jump_len: usize, pattern: &[u8]) -> Vec<u8> {
    let mut probe = Vec::with_capacity(pattern.len());
    probe.extend_from_slice(opcode);
    probe.resize(jump_len, WILDCARD);
    probe.extend_from_slice(&pattern[jump_len..]);
    probe
}

/// Symbol name to address relative to the load bias
fn read_symbol_table(path: &Path) -> Result<HashMap<String, usize>, ResolveError> {
    let parse_error = |reason: String| ResolveError::ImageParse {
        path: path.to_path_buf(),
        reason,
    };

    let data = std::fs::read(path).map_err(|e| parse_error(e.to_string()))?;
    let file = object::File::parse(&*data).map_err(|e| parse_error(e.to_string()))?;
    let relative_base = file.relative_address_base();

    let mut table = HashMap::new();
    for symbol in file.symbols().chain(file.dynamic_symbols()) {
        if !symbol.is_definition() || symbol.address() == 0 {
            continue;
        }
        if let Ok(name) = symbol.name() {
            table
                .entry(name.to_string())
                .or_insert(symbol.address().wrapping_sub(relative_base) as usize);
        }
    }
    Ok(table)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn image(data: &[u8]) -> BinaryImage {
        unsafe { BinaryImage::from_memory(data.as_ptr(), data.len()) }
    }

    #[test]
    fn test_identifier_parse() {
        assert_eq!(
            Identifier::parse("55 48 ? 89"),
            Identifier::Signature(vec![0x55, 0x48, WILDCARD, 0x89])
        );
        assert_eq!(
            Identifier::parse("_ZN12CBaseEntity5SpawnEv"),
            Identifier::Symbol("_ZN12CBaseEntity5SpawnEv".to_string())
        );
        assert_eq!(
            Identifier::parse("@CreateInterface"),
            Identifier::Symbol("CreateInterface".to_string())
        );
        // a bare hex-looking word is still a name
        assert_eq!(Identifier::parse("AB"), Identifier::Symbol("AB".to_string()));
    }

    #[test]
    fn test_find_signature_and_cache() {
        let mut data = vec![0xCCu8; 512];
        let pattern = [0x55, 0x48, 0x89, 0xE5, 0x41, 0x57];
        data[200..206].copy_from_slice(&pattern);
        let image = image(&data);

        let found = image.find_signature(&pattern).unwrap();
        assert_eq!(found.address(), data.as_ptr() as usize + 200);
        assert_eq!(image.cached_signatures(), 1);

        // cache hit returns the same address
        assert_eq!(image.find_signature(&pattern).unwrap(), found);
        assert_eq!(image.cached_signatures(), 1);

        let wild = [0x55, WILDCARD, 0x89];
        assert_eq!(image.find_signature(&wild).unwrap(), found);
    }

    #[test]
    fn test_find_signature_miss_is_null() {
        let data = vec![0u8; 64];
        let image = image(&data);
        assert!(image.find_signature(&[0x12, 0x34, 0x56]).unwrap().is_null());
        assert_eq!(image.cached_signatures(), 0);
        assert!(image.find_signature(&[]).is_err());
    }

    #[test]
    fn test_recover_relative_jump() {
        let original = [0x55, 0x48, 0x89, 0xE5, 0x41, 0x57, 0x41, 0x56];
        let mut data = vec![0u8; 256];
        // first five bytes overwritten by `jmp rel32`
        data[64..72].copy_from_slice(&[0xE9, 0x11, 0x22, 0x33, 0x44, 0x57, 0x41, 0x56]);
        let image = image(&data);

        let found = image.find_signature(&original).unwrap();
        assert_eq!(found.address(), data.as_ptr() as usize + 64);
    }

    #[test]
    fn test_recover_absolute_jump() {
        let original = [0x55, 0x48, 0x89, 0xE5, 0x41, 0x57, 0x41, 0x56];
        let mut data = vec![0u8; 256];
        data[32..40].copy_from_slice(&[0xFF, 0x25, 0x00, 0x00, 0x00, 0x00, 0x41, 0x56]);
        let image = image(&data);

        let found = image.find_signature(&original).unwrap();
        assert_eq!(found.address(), data.as_ptr() as usize + 32);
    }

    #[test]
    fn test_recovery_requires_unique_match() {
        let original = [0x55, 0x48, 0x89, 0xE5, 0x41, 0x57, 0x41, 0x56];
        let hooked = [0xE9, 0x11, 0x22, 0x33, 0x44, 0x57, 0x41, 0x56];
        let mut data = vec![0u8; 256];
        data[16..24].copy_from_slice(&hooked);
        data[128..136].copy_from_slice(&hooked);
        let image = image(&data);

        assert!(matches!(
            image.find_signature(&original),
            Err(ResolveError::AmbiguousSignature { .. })
        ));
    }

    #[test]
    fn test_short_patterns_skip_recovery() {
        // six bytes: too short for either recovery path
        let original = [0x55, 0x48, 0x89, 0xE5, 0x41, 0x57];
        let mut data = vec![0u8; 64];
        data[8..14].copy_from_slice(&[0xE9, 0x11, 0x22, 0x33, 0x44, 0x57]);
        let image = image(&data);

        assert!(image.find_signature(&original).unwrap().is_null());
    }

    #[test]
    fn test_find_address_dispatch() {
        let mut data = vec![0u8; 64];
        data[10..13].copy_from_slice(&[0xAA, 0xBB, 0xCC]);
        let image = image(&data);

        let by_pattern = image
            .find_address(&Identifier::Signature(vec![0xAA, 0xBB, 0xCC]))
            .unwrap();
        assert_eq!(by_pattern.address(), data.as_ptr() as usize + 10);

        let by_name = image.find_address(&Identifier::from("missing")).unwrap();
        assert!(by_name.is_null());
    }
}
