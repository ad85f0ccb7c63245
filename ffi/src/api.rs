//! The facade
//!
//! [`Ffi`] owns the declaration table, the type caches and a backend, and
//! hands out library proxies that share that state. Type names are parsed
//! once and memoized; every logical type goes through one [`TypeCache`], so
//! equal types always come back as the same backend handle.

use std::cell::{Cell, Ref, RefCell};
use std::fmt::Write as _;
use std::rc::Rc;
use std::sync::Arc;

use fxhash::FxHashMap;
use log::{debug, info, warn};

use crate::backend::native::NativeBackend;
use crate::backend::Backend;
use crate::config::FfiConfig;
use crate::cparser::Parser;
use crate::declarations::DeclarationTable;
use crate::error::{FfiError, Result};
use crate::library::{find_library, Library};
use crate::model::CType;
use crate::resolve::TypeCache;
use crate::value::{HostCallable, Value};
use crate::verifier::{LayoutMismatch, Verifier, VerifyOptions, VerifyReport};
use diagnostics::SourceMap;

/// Integer kinds probed for the platform typedefs, widest first so that a
/// narrower kind of the same size wins (`long` over `long long`)
const PROBED_KINDS: [&str; 5] = ["long long", "long", "int", "short", "char"];

const BOOTSTRAP_CHUNK: &str = "<bootstrap>";

/// State shared by the facade and its library proxies
pub(crate) struct FfiState<B: Backend> {
    pub(crate) backend: B,
    config: FfiConfig,
    parser: RefCell<Parser>,
    /// type name -> resolved type, for queries
    parsed_types: RefCell<FxHashMap<String, (CType, B::Type)>>,
    /// type name -> resolved pointer-or-array type, for allocation
    new_types: RefCell<FxHashMap<String, (CType, B::Type)>>,
    types: TypeCache<B::Type>,
    sources: RefCell<SourceMap>,
    chunks: Cell<usize>,
}

impl<B: Backend> FfiState<B> {
    pub(crate) fn declarations(&self) -> Ref<'_, DeclarationTable> {
        Ref::map(self.parser.borrow(), |p| p.declarations())
    }

    pub(crate) fn resolve(&self, ty: &CType) -> Result<B::Type> {
        let parser = self.parser.borrow();
        Ok(self.types.resolve(&self.backend, parser.declarations(), ty)?)
    }

    fn declare(&self, chunk: &str, text: &str) -> Result<()> {
        let file = self.sources.borrow_mut().add_file(chunk, text);
        let result = self.parser.borrow_mut().parse(text);
        result.map_err(|e| FfiError::Declaration(e.located(file, &self.sources.borrow())))
    }

    fn lookup(&self, name: &str, for_alloc: bool) -> Result<(CType, B::Type)> {
        let cache = if for_alloc {
            &self.new_types
        } else {
            &self.parsed_types
        };
        let cached = cache.borrow().get(name).cloned();
        if let Some((ctype, handle)) = cached {
            // re-resolving is a cache hit that may complete a forward declaration
            self.resolve(&ctype)?;
            return Ok((ctype, handle));
        }

        let parsed = self.parser.borrow().parse_type(name, for_alloc);
        let ctype = parsed.map_err(FfiError::Declaration)?;
        debug!("type name {:?} parsed as {}", name, ctype);
        let handle = self.resolve(&ctype)?;
        cache
            .borrow_mut()
            .insert(name.to_string(), (ctype.clone(), handle.clone()));
        Ok((ctype, handle))
    }
}

pub struct Ffi<B: Backend> {
    state: Rc<FfiState<B>>,
    c: Library<B>,
}

impl Ffi<NativeBackend> {
    /// Facade over the native backend, configured from the environment
    pub fn new() -> Result<Self> {
        Self::with_backend(NativeBackend::new())
    }
}

impl<B: Backend> Ffi<B> {
    pub fn with_backend(backend: B) -> Result<Self> {
        Self::with_config(backend, FfiConfig::from_env())
    }

    pub fn with_config(backend: B, config: FfiConfig) -> Result<Self> {
        let handle = backend.load_library(None)?;
        let bootstrap = config.bootstrap_integer_types;
        let state = Rc::new(FfiState {
            backend,
            config,
            parser: RefCell::new(Parser::new()),
            parsed_types: RefCell::new(FxHashMap::default()),
            new_types: RefCell::new(FxHashMap::default()),
            types: TypeCache::new(),
            sources: RefCell::new(SourceMap::new()),
            chunks: Cell::new(0),
        });
        let c = Library::new(state.clone(), None, None, handle);
        let ffi = Self { state, c };
        if bootstrap {
            ffi.bootstrap()?;
        }
        Ok(ffi)
    }

    /// Declare `size_t`, `int32_t`, ... as typedefs of the builtin kind with
    /// the same size and signedness
    fn bootstrap(&self) -> Result<()> {
        let reported = self.state.backend.nonstandard_integer_types();
        if reported.is_empty() {
            return Ok(());
        }
        let mut by_size = FxHashMap::default();
        for kind in PROBED_KINDS {
            by_size.insert(self.size_of(kind)?, kind);
        }

        let mut text = String::new();
        for info in &reported {
            match by_size.get(&info.size) {
                Some(kind) => {
                    let sign = if info.signed { "signed" } else { "unsigned" };
                    let _ = writeln!(text, "typedef {} {} {};", sign, kind, info.name);
                }
                None => warn!(
                    "no builtin integer kind has size {} for '{}'; skipped",
                    info.size, info.name
                ),
            }
        }
        debug!(
            "bootstrapping {} integer typedefs for backend '{}'",
            reported.len(),
            self.state.backend.name()
        );
        self.state.declare(BOOTSTRAP_CHUNK, &text)
    }

    /// Add C declarations. Either every declaration in `text` is committed
    /// or, on error, none is.
    pub fn cdef(&self, text: &str) -> Result<()> {
        let n = self.state.chunks.get();
        self.state.chunks.set(n + 1);
        self.state.declare(&format!("<cdef #{}>", n), text)
    }

    /// [`cdef`](Ffi::cdef) with diagnostics reported against `name`, such as
    /// the header file the text was read from
    pub fn cdef_named(&self, name: &str, text: &str) -> Result<()> {
        self.state.chunks.set(self.state.chunks.get() + 1);
        self.state.declare(name, text)
    }

    pub fn type_of(&self, name: &str) -> Result<B::Type> {
        Ok(self.state.lookup(name, false)?.1)
    }

    pub fn type_of_data(&self, data: &B::Data) -> Result<B::Type> {
        Ok(self.state.backend.typeof_instance(data)?)
    }

    pub fn size_of(&self, name: &str) -> Result<usize> {
        let ty = self.type_of(name)?;
        Ok(self.state.backend.sizeof_type(&ty)?)
    }

    pub fn size_of_data(&self, data: &B::Data) -> Result<usize> {
        Ok(self.state.backend.sizeof_instance(data)?)
    }

    pub fn align_of(&self, name: &str) -> Result<usize> {
        let ty = self.type_of(name)?;
        Ok(self.state.backend.alignof(&ty)?)
    }

    /// Byte offset of `field` in a struct or union type
    pub fn offset_of(&self, name: &str, field: &str) -> Result<usize> {
        let (ctype, ty) = self.state.lookup(name, false)?;
        if !ctype.is_aggregate() {
            return Err(FfiError::InvalidArgument(format!(
                "'{}' is not a struct or union type",
                name
            )));
        }
        Ok(self.state.backend.offsetof(&ty, field)?)
    }

    /// Allocate zeroed storage for `name` (`"int"` allocates one int,
    /// `"int[4]"` four), optionally initialized; the result owns the memory
    pub fn alloc(&self, name: &str, init: Option<&Value>) -> Result<B::Data> {
        let (_, ty) = self.state.lookup(name, true)?;
        Ok(self.state.backend.newp(&ty, init)?)
    }

    /// Reinterpret `source` as `name`; never allocates
    pub fn cast(&self, name: &str, source: &Value) -> Result<B::Data> {
        let ty = self.type_of(name)?;
        Ok(self.state.backend.cast(&ty, source)?)
    }

    /// Bytes of a `char *`/`char[]` handle, up to `length` or the first NUL
    pub fn string(&self, data: &B::Data, length: usize) -> Result<Vec<u8>> {
        Ok(self.state.backend.string(data, length)?)
    }

    /// Open a library by bare name or path
    pub fn load(&self, name: &str) -> Result<Library<B>> {
        let path = find_library(name, &self.state.config)?;
        let handle = self.state.backend.load_library(Some(&path))?;
        info!("loaded library '{}' from {}", name, path.display());
        Ok(Library::new(
            self.state.clone(),
            Some(name.to_string()),
            Some(path),
            handle,
        ))
    }

    /// The C runtime of the running process
    pub fn c(&self) -> &Library<B> {
        &self.c
    }

    /// Native-callable trampoline for `signature`, a function or
    /// function-pointer type such as `"int(*)(const void *, const void *)"`
    pub fn callback(&self, signature: &str, callable: HostCallable) -> Result<B::Callback> {
        let (ctype, ty) = self.state.lookup(signature, false)?;
        let function = match &ctype {
            CType::Function(_) => ty,
            CType::Pointer(inner) if inner.as_function().is_some() => {
                self.state.resolve(inner)?
            }
            other => {
                return Err(FfiError::InvalidArgument(format!(
                    "callback signature '{}' is not a function type",
                    other
                )))
            }
        };
        Ok(self.state.backend.callback(&function, callable)?)
    }

    /// [`callback`](Ffi::callback) for a plain closure
    pub fn callback_fn<F>(&self, signature: &str, f: F) -> Result<B::Callback>
    where
        F: Fn(&[Value]) -> Value + Send + Sync + 'static,
    {
        self.callback(signature, Arc::new(f))
    }

    /// Hand the accumulated declarations to an external verifier
    pub fn verify(
        &self,
        preamble: &str,
        options: &VerifyOptions,
        verifier: &dyn Verifier,
    ) -> Result<VerifyReport> {
        let decls = self.state.declarations();
        Ok(verifier.verify(&decls, preamble, options)?)
    }

    /// Compare measured layouts against this backend's
    pub fn compare_layouts(&self, report: &VerifyReport) -> Result<Vec<LayoutMismatch>> {
        let mut mismatches = Vec::new();
        for measured in &report.layouts {
            let name = format!("{} {}", measured.kind, measured.name);
            let mut check = |what: String, expected: usize, actual: usize| {
                if expected != actual {
                    mismatches.push(LayoutMismatch {
                        type_name: name.clone(),
                        what,
                        expected,
                        actual,
                    });
                }
            };
            let ty = self.type_of(&name)?;
            let backend = &self.state.backend;
            check("size".to_string(), measured.size, backend.sizeof_type(&ty)?);
            check("alignment".to_string(), measured.align, backend.alignof(&ty)?);
            for field in &measured.fields {
                let offset = backend.offsetof(&ty, &field.name)?;
                check(format!("offset of '{}'", field.name), field.offset, offset);
            }
        }
        Ok(mismatches)
    }

    /// Parse a type name without resolving it
    pub fn parse_type(&self, name: &str) -> Result<CType> {
        Ok(self.state.parser.borrow().parse_type(name, false)?)
    }

    /// Backend handle for a logical type
    pub fn resolve(&self, ty: &CType) -> Result<B::Type> {
        self.state.resolve(ty)
    }

    pub fn declarations(&self) -> Ref<'_, DeclarationTable> {
        self.state.declarations()
    }

    /// Every declaration chunk seen so far, for rendering diagnostics
    pub fn source_map(&self) -> Ref<'_, SourceMap> {
        self.state.sources.borrow()
    }

    pub fn backend(&self) -> &B {
        &self.state.backend
    }

    pub fn config(&self) -> &FfiConfig {
        &self.state.config
    }

    /// Number of distinct logical types with a backend handle
    pub fn cached_types(&self) -> usize {
        self.state.types.len()
    }
}
