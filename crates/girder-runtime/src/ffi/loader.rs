//! Symbol resolution for native callables
//!
//! Loads shared libraries with `libloading`, honouring platform naming
//! conventions and the configured search paths, and resolves a callable's
//! exported symbol to a function address.

use crate::error::SetupError;
use girder_config::BridgeConfig;
use libloading::Library;
use std::collections::HashMap;
use std::ffi::c_void;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;

/// Library loading errors
#[derive(Debug, Clone, PartialEq, Error)]
pub enum LoadError {
    #[error("library not found: {0}")]
    LibraryNotFound(String),

    #[error("symbol '{symbol}' not found in library '{library}'")]
    SymbolNotFound { library: String, symbol: String },

    #[error("failed to load library: {0}")]
    LoadFailed(String),
}

/// Resolved function address, keeping its library loaded
#[derive(Clone)]
pub struct ResolvedSymbol {
    address: *const c_void,
    library: Arc<Library>,
}

impl ResolvedSymbol {
    pub fn address(&self) -> *const c_void {
        self.address
    }

    pub fn library(&self) -> &Arc<Library> {
        &self.library
    }
}

/// Library cache and symbol lookup
///
/// # Safety
///
/// Loading a library runs its initialisation code in this process; only
/// trusted libraries should be resolved.
pub struct SymbolResolver {
    loaded: HashMap<PathBuf, Arc<Library>>,
    search_paths: Vec<PathBuf>,
}

impl SymbolResolver {
    /// Resolver searching the configured paths before the system ones
    pub fn new(config: &BridgeConfig) -> Self {
        let mut search_paths: Vec<PathBuf> = config.library_search_paths().to_vec();
        search_paths.extend(Self::default_search_paths());
        Self {
            loaded: HashMap::new(),
            search_paths,
        }
    }

    fn default_search_paths() -> Vec<PathBuf> {
        let mut paths = Vec::new();

        #[cfg(target_os = "linux")]
        {
            paths.push(PathBuf::from("/usr/lib"));
            paths.push(PathBuf::from("/usr/local/lib"));
            paths.push(PathBuf::from("/lib"));
            if cfg!(target_pointer_width = "64") {
                paths.push(PathBuf::from("/usr/lib64"));
                paths.push(PathBuf::from("/lib64"));
                paths.push(PathBuf::from("/usr/lib/x86_64-linux-gnu"));
                paths.push(PathBuf::from("/lib/x86_64-linux-gnu"));
            }
        }

        #[cfg(target_os = "macos")]
        {
            paths.push(PathBuf::from("/usr/lib"));
            paths.push(PathBuf::from("/usr/local/lib"));
            paths.push(PathBuf::from("/opt/homebrew/lib"));
        }

        #[cfg(target_os = "windows")]
        {
            if let Ok(system_root) = std::env::var("SystemRoot") {
                paths.push(PathBuf::from(format!("{}\\System32", system_root)));
            }
        }

        paths
    }

    pub fn search_paths(&self) -> &[PathBuf] {
        &self.search_paths
    }

    /// Prepend a search path
    pub fn add_search_path(&mut self, path: PathBuf) {
        self.search_paths.insert(0, path);
    }

    pub fn loaded_count(&self) -> usize {
        self.loaded.len()
    }

    /// Full path for a library name
    ///
    /// Tries `lib{name}.{ext}` then `{name}.{ext}` in each search path, with
    /// versioned sonames (`libfoo.so.1`) accepted when given verbatim.
    fn resolve_library_path(&self, name: &str) -> Option<PathBuf> {
        let path = Path::new(name);
        if path.is_absolute() {
            return path.exists().then(|| path.to_path_buf());
        }

        let extensions: &[&str] = if cfg!(target_os = "windows") {
            &["dll"]
        } else if cfg!(target_os = "macos") {
            &["dylib", "so"]
        } else {
            &["so"]
        };
        let prefixes: &[&str] = if cfg!(target_os = "windows") {
            &["", "lib"]
        } else {
            &["lib", ""]
        };

        let mut candidates = vec![name.to_string()];
        for prefix in prefixes {
            for ext in extensions {
                candidates.push(format!("{}{}.{}", prefix, name, ext));
            }
        }

        self.search_paths
            .iter()
            .flat_map(|dir| candidates.iter().map(move |file| dir.join(file)))
            .find(|candidate| candidate.is_file())
    }

    /// Load (or reuse) a library
    pub fn load(&mut self, name: &str) -> Result<Arc<Library>, LoadError> {
        let path = self
            .resolve_library_path(name)
            .ok_or_else(|| LoadError::LibraryNotFound(name.to_string()))?;

        if let Some(library) = self.loaded.get(&path) {
            return Ok(Arc::clone(library));
        }

        // SAFETY: callers resolve only trusted libraries
        let library = unsafe { Library::new(&path) }.map_err(|e| LoadError::LoadFailed(e.to_string()))?;
        tracing::debug!(library = %path.display(), "loaded native library");
        let library = Arc::new(library);
        self.loaded.insert(path, Arc::clone(&library));
        Ok(library)
    }

    /// Address of `symbol` in `library`
    pub fn lookup(&mut self, library: &str, symbol: &str) -> Result<ResolvedSymbol, LoadError> {
        let handle = self.load(library)?;
        // SAFETY: the address is only used through a call interface built
        // from the callable's own signature
        let address = unsafe {
            handle
                .get::<unsafe extern "C" fn()>(symbol.as_bytes())
                .map(|sym| *sym as *const c_void)
        }
        .map_err(|_| LoadError::SymbolNotFound {
            library: library.to_string(),
            symbol: symbol.to_string(),
        })?;

        Ok(ResolvedSymbol {
            address,
            library: handle,
        })
    }

    /// Resolve the symbol a callable declares
    pub fn resolve(&mut self, library: &str, callable: &str, symbol: Option<&str>) -> Result<ResolvedSymbol, SetupError> {
        let symbol = symbol.ok_or_else(|| SetupError::SymbolNotFound {
            callable: callable.to_string(),
            reason: "callable declares no symbol".to_string(),
        })?;
        self.lookup(library, symbol).map_err(|e| SetupError::SymbolNotFound {
            callable: callable.to_string(),
            reason: e.to_string(),
        })
    }
}
