//! Foreign function interface driven by C declarations
//!
//! Declarations are parsed into a [`DeclarationTable`] of logical
//! [`CType`]s. A [`Backend`] turns logical types into concrete handles,
//! lays out aggregates and touches native memory; the [`Ffi`] facade
//! memoizes both steps and hands out [`Library`] proxies whose symbols are
//! bound on first access.
//!
//! ```no_run
//! use ffi::{Ffi, Value};
//!
//! let ffi = Ffi::new()?;
//! ffi.cdef("size_t strlen(const char *s);")?;
//! let strlen = ffi.c().function("strlen")?;
//! assert_eq!(strlen.call(&[Value::from("hello")])?, Value::UInt(5));
//! # Ok::<(), ffi::FfiError>(())
//! ```

pub mod api;
pub mod backend;
pub mod config;
pub mod cparser;
pub mod declarations;
pub mod error;
pub mod library;
pub mod logging;
pub mod model;
pub mod resolve;
pub mod value;
pub mod verifier;

pub use api::Ffi;
pub use backend::native::{CData, NativeBackend, NativeCallback, NativeFunction, NativeLibrary, NativeType};
pub use backend::{BResult, Backend, FieldSpec, IntegerTypeInfo};
pub use config::FfiConfig;
pub use declarations::DeclarationTable;
pub use error::{
    BackendError, BackendErrorKind, DeclarationError, DeclarationErrorKind, FfiError, Result,
    VerifyError,
};
pub use library::{find_library, Library, Symbol, SymbolResolver};
pub use model::CType;
pub use resolve::TypeCache;
pub use value::{HostCallable, Value};
pub use verifier::{
    LayoutMismatch, MeasuredLayout, SystemCompilerVerifier, Verifier, VerifyOptions, VerifyReport,
};
