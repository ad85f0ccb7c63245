//! Dynamic library proxies
//!
//! A [`Library`] exposes the functions and global variables of one loaded
//! library by name, resolved lazily against the facade's declarations.
//! Function bindings are made once per proxy and reused; variable reads
//! always go back to live memory, only their types are cached.

use std::cell::RefCell;
use std::fmt;
use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::rc::Rc;

use fxhash::FxHashMap;
use log::{debug, trace};

use crate::api::FfiState;
use crate::backend::Backend;
use crate::config::{FfiConfig, LIBRARY_PATH_ENV};
use crate::error::{FfiError, Result};
use crate::value::Value;

/// Name of the thread-local error code on the default proxy
pub const ERRNO: &str = "errno";

/// Explicit symbol lookup; `Ok(None)` means the name is not declared as
/// that kind of symbol
pub trait SymbolResolver {
    type Function;
    type Variable;

    fn resolve_function(&self, name: &str) -> Result<Option<Self::Function>>;

    fn resolve_variable(&self, name: &str) -> Result<Option<Self::Variable>>;
}

/// Result of [`Library::get`]
pub enum Symbol<B: Backend> {
    Function(B::Function),
    Variable(B::Data),
    Errno(i32),
}

impl<B: Backend> fmt::Debug for Symbol<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Symbol::Function(_) => f.write_str("Symbol::Function"),
            Symbol::Variable(_) => f.write_str("Symbol::Variable"),
            Symbol::Errno(v) => write!(f, "Symbol::Errno({})", v),
        }
    }
}

pub struct Library<B: Backend> {
    state: Rc<FfiState<B>>,
    /// `None` for the process image (the C runtime)
    name: Option<String>,
    path: Option<PathBuf>,
    handle: B::Library,
    functions: RefCell<FxHashMap<String, B::Function>>,
    variable_types: RefCell<FxHashMap<String, B::Type>>,
}

impl<B: Backend> Library<B> {
    pub(crate) fn new(
        state: Rc<FfiState<B>>,
        name: Option<String>,
        path: Option<PathBuf>,
        handle: B::Library,
    ) -> Self {
        Self {
            state,
            name,
            path,
            handle,
            functions: RefCell::new(FxHashMap::default()),
            variable_types: RefCell::new(FxHashMap::default()),
        }
    }

    /// The name passed to `load`, or `None` for the default proxy
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn is_default(&self) -> bool {
        self.name.is_none()
    }

    pub fn handle(&self) -> &B::Library {
        &self.handle
    }

    /// Look up a declared function or variable
    pub fn get(&self, name: &str) -> Result<Symbol<B>> {
        if self.is_default() && name == ERRNO {
            return Ok(Symbol::Errno(self.state.backend.get_errno()));
        }
        if let Some(function) = self.resolve_function(name)? {
            return Ok(Symbol::Function(function));
        }
        if let Some(data) = self.resolve_variable(name)? {
            return Ok(Symbol::Variable(data));
        }
        Err(FfiError::UnknownSymbol(name.to_string()))
    }

    /// Bound function `name`; errors if it is not a declared function
    pub fn function(&self, name: &str) -> Result<B::Function> {
        self.resolve_function(name)?
            .ok_or_else(|| FfiError::UnknownSymbol(name.to_string()))
    }

    /// Fresh view of variable `name`
    pub fn variable(&self, name: &str) -> Result<B::Data> {
        self.resolve_variable(name)?
            .ok_or_else(|| FfiError::UnknownSymbol(name.to_string()))
    }

    /// Assign to a declared variable (or `errno` on the default proxy)
    pub fn set(&self, name: &str, value: &Value) -> Result<()> {
        if self.is_default() && name == ERRNO {
            let code = value
                .as_i64()
                .and_then(|v| i32::try_from(v).ok())
                .ok_or_else(|| {
                    FfiError::InvalidArgument(format!("errno must be an int, got {}", value.kind_name()))
                })?;
            self.state.backend.set_errno(code);
            return Ok(());
        }
        if self.state.declarations().function(name).is_some() {
            return Err(FfiError::InvalidArgument(format!(
                "cannot assign to function '{}'",
                name
            )));
        }
        let Some(ty) = self.variable_type(name)? else {
            return Err(FfiError::UnknownSymbol(name.to_string()));
        };
        trace!("writing variable {}", name);
        self.state
            .backend
            .write_variable(&self.handle, &ty, name, value)?;
        Ok(())
    }

    fn variable_type(&self, name: &str) -> Result<Option<B::Type>> {
        if let Some(ty) = self.variable_types.borrow().get(name) {
            return Ok(Some(ty.clone()));
        }
        let Some(ctype) = self.state.declarations().variable(name).cloned() else {
            return Ok(None);
        };
        let ty = self.state.resolve(&ctype)?;
        self.variable_types
            .borrow_mut()
            .insert(name.to_string(), ty.clone());
        Ok(Some(ty))
    }
}

impl<B: Backend> SymbolResolver for Library<B> {
    type Function = B::Function;
    type Variable = B::Data;

    fn resolve_function(&self, name: &str) -> Result<Option<B::Function>> {
        if let Some(function) = self.functions.borrow().get(name) {
            return Ok(Some(function.clone()));
        }
        let Some(ctype) = self.state.declarations().function(name).cloned() else {
            return Ok(None);
        };
        let ty = self.state.resolve(&ctype)?;
        let function = self.state.backend.load_function(&self.handle, &ty, name)?;
        debug!(
            "bound {} from {}",
            ctype.declaration(name),
            self.name.as_deref().unwrap_or("<process>")
        );
        self.functions
            .borrow_mut()
            .insert(name.to_string(), function.clone());
        Ok(Some(function))
    }

    fn resolve_variable(&self, name: &str) -> Result<Option<B::Data>> {
        let Some(ty) = self.variable_type(name)? else {
            return Ok(None);
        };
        Ok(Some(
            self.state.backend.read_variable(&self.handle, &ty, name)?,
        ))
    }
}

impl<B: Backend> fmt::Debug for Library<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Library")
            .field("name", &self.name)
            .field("path", &self.path)
            .field("functions", &self.functions.borrow().len())
            .finish()
    }
}

const SYSTEM_DIRS: &[&str] = &["/lib", "/usr/lib", "/lib64", "/usr/lib64", "/usr/local/lib"];

/// Locate a library by bare name (`"m"`, `"libm"`) or explicit path.
///
/// Names with a path separator are returned unchanged. Bare names are
/// tried in the configured search paths, `CFFI_LIBRARY_PATH`, the loader
/// path variable and the usual system directories, preferring versioned
/// shared objects over unversioned ones.
pub fn find_library(name: &str, config: &FfiConfig) -> Result<PathBuf> {
    if name.contains('/') || name.contains(std::path::MAIN_SEPARATOR) {
        return Ok(PathBuf::from(name));
    }
    let stem = name.strip_prefix("lib").unwrap_or(name);

    for dir in search_dirs(config) {
        if let Some(found) = find_in_dir(&dir, stem) {
            debug!("found library '{}' at {}", name, found.display());
            return Ok(found);
        }
    }
    Err(FfiError::LibraryNotFound(name.to_string()))
}

fn search_dirs(config: &FfiConfig) -> Vec<PathBuf> {
    let mut dirs: Vec<PathBuf> = config.search_paths.clone();
    for var in [LIBRARY_PATH_ENV, "LD_LIBRARY_PATH", "DYLD_LIBRARY_PATH"] {
        if let Some(value) = std::env::var_os(var) {
            dirs.extend(std::env::split_paths(&value).filter(|p| !p.as_os_str().is_empty()));
        }
    }
    let arch = std::env::consts::ARCH;
    dirs.push(PathBuf::from(format!("/usr/lib/{}-linux-gnu", arch)));
    dirs.push(PathBuf::from(format!("/lib/{}-linux-gnu", arch)));
    dirs.extend(SYSTEM_DIRS.iter().map(PathBuf::from));

    let mut seen = fxhash::FxHashSet::default();
    dirs.retain(|d| seen.insert(d.clone()));
    dirs
}

fn find_in_dir(dir: &Path, stem: &str) -> Option<PathBuf> {
    let entries = fs::read_dir(dir).ok()?;
    let versioned_prefix = format!("lib{}.so.", stem);
    let mut versioned: Vec<PathBuf> = entries
        .filter_map(|e| e.ok())
        .filter(|e| {
            e.file_name()
                .to_str()
                .and_then(|n| n.strip_prefix(&versioned_prefix))
                .is_some_and(|v| v.split('.').all(|part| part.parse::<u32>().is_ok()))
        })
        .map(|e| e.path())
        .collect();
    // shortest name first: libm.so.6 before libm.so.6.0.1
    versioned.sort_by_key(|p| (p.as_os_str().len(), p.clone()));
    if let Some(found) = versioned.into_iter().next() {
        return Some(found);
    }

    let plain = dir.join(format!("lib{}.so", stem));
    if plain.is_file() && is_elf(&plain) {
        return Some(plain);
    }
    [format!("lib{}.dylib", stem), format!("{}.dll", stem)]
        .into_iter()
        .map(|file| dir.join(file))
        .find(|p| p.is_file())
}

/// Unversioned `.so` files are often linker scripts
fn is_elf(path: &Path) -> bool {
    let mut magic = [0u8; 4];
    fs::File::open(path)
        .and_then(|mut f| f.read_exact(&mut magic))
        .map(|_| magic == *b"\x7fELF")
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_explicit_path_is_verbatim() {
        let config = FfiConfig::new();
        assert_eq!(
            find_library("./build/libfoo.so", &config).unwrap(),
            PathBuf::from("./build/libfoo.so")
        );
    }

    #[test]
    fn test_search_path_prefers_versioned() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("libdemo.so"), b"INPUT(libdemo.so.2)").unwrap();
        fs::write(dir.path().join("libdemo.so.2"), b"\x7fELF").unwrap();
        fs::write(dir.path().join("libdemo.so.2.1.0"), b"\x7fELF").unwrap();
        fs::write(dir.path().join("libdemo.so.debug"), b"").unwrap();

        let config = FfiConfig::new().with_search_path(dir.path());
        assert_eq!(
            find_library("demo", &config).unwrap(),
            dir.path().join("libdemo.so.2")
        );
        assert_eq!(
            find_library("libdemo", &config).unwrap(),
            dir.path().join("libdemo.so.2")
        );
    }

    #[test]
    fn test_linker_script_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("libcffiprobescript.so"), b"GROUP ( libc.so.6 )").unwrap();
        fs::write(dir.path().join("libreal.so"), b"\x7fELF\x02\x01").unwrap();

        let config = FfiConfig::new().with_search_path(dir.path());
        assert_eq!(
            find_library("real", &config).unwrap(),
            dir.path().join("libreal.so")
        );
        assert!(matches!(
            find_library("cffiprobescript", &config),
            Err(FfiError::LibraryNotFound(_))
        ));
    }
}
