//! Shared libraries and calls into them

use std::ffi::c_void;
use std::fmt;
use std::mem::transmute;
use std::path::Path;
use std::rc::Rc;

use log::trace;
use smallvec::SmallVec;

use super::data::integer_value;
use super::types::{NativeType, PrimitiveKind, TypeArena, TypeKind};
use crate::backend::BResult;
use crate::error::{BackendError, BackendErrorKind};
use crate::value::Value;

/// Integer and pointer arguments passed in registers
pub const MAX_ARGS: usize = 6;

/// A loaded library; clones share the handle
#[derive(Clone)]
pub struct NativeLibrary {
    inner: Rc<libloading::Library>,
    name: String,
}

impl NativeLibrary {
    /// The running process image, which includes the C runtime
    pub fn this() -> BResult<Self> {
        #[cfg(unix)]
        let library: libloading::Library = libloading::os::unix::Library::this().into();
        #[cfg(windows)]
        let library: libloading::Library = libloading::os::windows::Library::this()
            .map_err(|e| BackendError::new(BackendErrorKind::Library, e.to_string()))?
            .into();
        Ok(Self {
            inner: Rc::new(library),
            name: "<process>".to_string(),
        })
    }

    pub fn open(path: &Path) -> BResult<Self> {
        // SAFETY: running a library's initializers is inherent to loading it
        let library = unsafe { libloading::Library::new(path) }.map_err(|e| {
            BackendError::new(
                BackendErrorKind::Library,
                format!("failed to load {}: {}", path.display(), e),
            )
        })?;
        Ok(Self {
            inner: Rc::new(library),
            name: path.display().to_string(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Address of an exported symbol
    pub fn symbol(&self, name: &str) -> BResult<usize> {
        // SAFETY: the symbol is only read as an address
        let address = unsafe {
            let symbol: libloading::Symbol<*mut c_void> =
                self.inner.get(name.as_bytes()).map_err(|e| {
                    BackendError::new(
                        BackendErrorKind::Symbol,
                        format!("'{}' not found in {}: {}", name, self.name, e),
                    )
                })?;
            *symbol as usize
        };
        if address == 0 {
            return Err(BackendError::new(
                BackendErrorKind::Symbol,
                format!("'{}' resolves to NULL in {}", name, self.name),
            ));
        }
        Ok(address)
    }
}

impl fmt::Debug for NativeLibrary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NativeLibrary({})", self.name)
    }
}

/// How a scalar travels in one integer register
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WordClass {
    Void,
    Int { size: usize, signed: bool },
    Bool,
    Pointer,
}

impl WordClass {
    pub(crate) fn of(arena: &TypeArena, ty: NativeType) -> BResult<Self> {
        match arena.kind(ty) {
            TypeKind::Void => Ok(WordClass::Void),
            TypeKind::Pointer(_) => Ok(WordClass::Pointer),
            TypeKind::Primitive(PrimitiveKind::Bool) => Ok(WordClass::Bool),
            TypeKind::Primitive(kind) | TypeKind::Enum { repr: kind } if !kind.is_float() => {
                Ok(WordClass::Int {
                    size: kind.size(),
                    signed: kind.is_signed(),
                })
            }
            _ => Err(BackendError::unsupported(format!(
                "calls passing or returning '{}'",
                arena.name(ty)
            ))),
        }
    }

    pub(crate) fn decode(self, word: usize) -> Value {
        match self {
            WordClass::Void => Value::Void,
            WordClass::Pointer => Value::Pointer(word),
            WordClass::Bool => Value::Int((word & 0xff != 0) as i64),
            WordClass::Int { size, signed } => integer_value(word as u64, (size * 8) as u32, signed),
        }
    }

    pub(crate) fn encode(self, value: &Value) -> BResult<usize> {
        let word = match (self, value) {
            (WordClass::Void, _) => Some(0),
            (WordClass::Pointer, Value::Pointer(_) | Value::Int(_) | Value::UInt(_)) => value.as_address(),
            (WordClass::Int { .. } | WordClass::Bool, Value::Int(v)) => Some(*v as usize),
            (WordClass::Int { .. } | WordClass::Bool, Value::UInt(v)) => Some(*v as usize),
            (WordClass::Int { .. } | WordClass::Bool, Value::Pointer(p)) => Some(*p),
            _ => None,
        };
        word.ok_or_else(|| BackendError::mismatch(format!("cannot pass {} as {:?}", value.kind_name(), self)))
    }
}

struct FunctionInner {
    name: String,
    address: usize,
    arena: Rc<TypeArena>,
    args: Vec<NativeType>,
    result: NativeType,
    variadic: bool,
    _library: NativeLibrary,
}

/// A function bound to its declared type; clones share one binding
#[derive(Clone)]
pub struct NativeFunction {
    inner: Rc<FunctionInner>,
}

type Fn0 = unsafe extern "C" fn() -> usize;
type Fn1 = unsafe extern "C" fn(usize) -> usize;
type Fn2 = unsafe extern "C" fn(usize, usize) -> usize;
type Fn3 = unsafe extern "C" fn(usize, usize, usize) -> usize;
type Fn4 = unsafe extern "C" fn(usize, usize, usize, usize) -> usize;
type Fn5 = unsafe extern "C" fn(usize, usize, usize, usize, usize) -> usize;
type Fn6 = unsafe extern "C" fn(usize, usize, usize, usize, usize, usize) -> usize;
type Variadic = unsafe extern "C" fn(usize, ...) -> usize;

impl NativeFunction {
    pub(crate) fn bind(
        arena: &Rc<TypeArena>,
        library: &NativeLibrary,
        ty: NativeType,
        name: &str,
    ) -> BResult<Self> {
        let TypeKind::Function {
            args,
            result,
            variadic,
        } = arena.kind(ty)
        else {
            return Err(BackendError::mismatch(format!(
                "'{}' is not a function type",
                arena.name(ty)
            )));
        };
        let address = library.symbol(name)?;
        Ok(Self {
            inner: Rc::new(FunctionInner {
                name: name.to_string(),
                address,
                arena: arena.clone(),
                args,
                result,
                variadic,
                _library: library.clone(),
            }),
        })
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn address(&self) -> usize {
        self.inner.address
    }

    /// True if both handles come from the same binding
    pub fn same_binding(&self, other: &NativeFunction) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }

    /// Call with integer, pointer and byte-string arguments. Byte strings
    /// are passed as temporary NUL-terminated buffers that live for the
    /// duration of the call.
    pub fn call(&self, args: &[Value]) -> BResult<Value> {
        let f = &*self.inner;
        let arity_ok = if f.variadic {
            args.len() >= f.args.len()
        } else {
            args.len() == f.args.len()
        };
        if !arity_ok {
            return Err(BackendError::new(
                BackendErrorKind::Call,
                format!(
                    "'{}' expects {}{} arguments, got {}",
                    f.name,
                    if f.variadic { "at least " } else { "" },
                    f.args.len(),
                    args.len()
                ),
            ));
        }
        if args.len() > MAX_ARGS {
            return Err(BackendError::unsupported(format!(
                "calls with more than {} arguments",
                MAX_ARGS
            )));
        }
        let result = WordClass::of(&f.arena, f.result)?;

        let mut buffers: SmallVec<[Vec<u8>; 2]> = SmallVec::new();
        let mut words: SmallVec<[usize; MAX_ARGS]> = SmallVec::new();
        for (i, arg) in args.iter().enumerate() {
            let class = match f.args.get(i) {
                Some(ty) => WordClass::of(&f.arena, *ty)?,
                // default argument promotions leave integers and pointers as words
                None => WordClass::Int {
                    size: std::mem::size_of::<usize>(),
                    signed: true,
                },
            };
            let word = match arg {
                Value::Bytes(bytes) if matches!(class, WordClass::Pointer) || f.args.get(i).is_none() => {
                    let mut buffer = bytes.clone();
                    buffer.push(0);
                    let address = buffer.as_ptr() as usize;
                    buffers.push(buffer);
                    address
                }
                Value::Float(_) => {
                    return Err(BackendError::unsupported("floating-point arguments"));
                }
                other => class.encode(other)?,
            };
            words.push(word);
        }

        trace!("calling {} with {} words", f.name, words.len());
        let a = |i: usize| words.get(i).copied().unwrap_or(0);
        // SAFETY: the address was exported under this name and the
        // declaration describes it; every argument is one integer register
        let raw = unsafe {
            if f.variadic {
                let fp: Variadic = transmute::<usize, Variadic>(f.address);
                match words.len() {
                    1 => fp(a(0)),
                    2 => fp(a(0), a(1)),
                    3 => fp(a(0), a(1), a(2)),
                    4 => fp(a(0), a(1), a(2), a(3)),
                    5 => fp(a(0), a(1), a(2), a(3), a(4)),
                    6 => fp(a(0), a(1), a(2), a(3), a(4), a(5)),
                    _ => {
                        return Err(BackendError::unsupported(
                            "variadic functions without fixed arguments",
                        ))
                    }
                }
            } else {
                match words.len() {
                    0 => transmute::<usize, Fn0>(f.address)(),
                    1 => transmute::<usize, Fn1>(f.address)(a(0)),
                    2 => transmute::<usize, Fn2>(f.address)(a(0), a(1)),
                    3 => transmute::<usize, Fn3>(f.address)(a(0), a(1), a(2)),
                    4 => transmute::<usize, Fn4>(f.address)(a(0), a(1), a(2), a(3)),
                    5 => transmute::<usize, Fn5>(f.address)(a(0), a(1), a(2), a(3), a(4)),
                    _ => transmute::<usize, Fn6>(f.address)(a(0), a(1), a(2), a(3), a(4), a(5)),
                }
            }
        };
        drop(buffers);
        Ok(result.decode(raw))
    }
}

impl fmt::Debug for NativeFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<cfunction {} at {:#x}>", self.inner.name, self.inner.address)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_word_classes() {
        let int = WordClass::Int { size: 4, signed: true };
        assert_eq!(int.decode(u32::MAX as usize), Value::Int(-1));
        assert_eq!(int.encode(&Value::Int(-1)).unwrap(), usize::MAX);
        assert!(int.encode(&Value::Bytes(b"x".to_vec())).is_err());
        assert_eq!(WordClass::Bool.decode(0x100), Value::Int(0));
        assert_eq!(WordClass::Pointer.encode(&Value::Pointer(8)).unwrap(), 8);
        assert_eq!(WordClass::Void.decode(123), Value::Void);
    }

    #[test]
    fn test_process_symbols() {
        let library = NativeLibrary::this().unwrap();
        assert!(library.symbol("strlen").unwrap() != 0);
        let err = library.symbol("definitely_not_a_symbol_4711").unwrap_err();
        assert_eq!(err.kind, BackendErrorKind::Symbol);
    }
}
