//! Native-callable trampolines for host closures
//!
//! A fixed pool of `extern "C"` functions, one per slot. Each reads its
//! closure from a global slot table, so a trampoline address handed to C
//! stays valid for as long as the [`NativeCallback`] that claimed it lives.
//! Arguments arrive as integer registers; trampolines accept the maximum
//! register count and ignore the surplus.

use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use log::{debug, warn};
use parking_lot::Mutex;

use super::library::{WordClass, MAX_ARGS};
use super::types::{NativeType, TypeArena, TypeKind};
use crate::backend::BResult;
use crate::error::BackendError;
use crate::value::{HostCallable, Value};

pub const CALLBACK_SLOTS: usize = 16;

struct CallbackEntry {
    name: String,
    callable: HostCallable,
    args: Vec<WordClass>,
    result: WordClass,
}

const EMPTY: Option<Arc<CallbackEntry>> = None;

static SLOTS: Mutex<[Option<Arc<CallbackEntry>>; CALLBACK_SLOTS]> =
    parking_lot::const_mutex([EMPTY; CALLBACK_SLOTS]);

type Trampoline = extern "C" fn(usize, usize, usize, usize, usize, usize) -> usize;

extern "C" fn trampoline<const SLOT: usize>(
    a0: usize,
    a1: usize,
    a2: usize,
    a3: usize,
    a4: usize,
    a5: usize,
) -> usize {
    dispatch(SLOT, [a0, a1, a2, a3, a4, a5])
}

const TRAMPOLINES: [Trampoline; CALLBACK_SLOTS] = [
    trampoline::<0>,
    trampoline::<1>,
    trampoline::<2>,
    trampoline::<3>,
    trampoline::<4>,
    trampoline::<5>,
    trampoline::<6>,
    trampoline::<7>,
    trampoline::<8>,
    trampoline::<9>,
    trampoline::<10>,
    trampoline::<11>,
    trampoline::<12>,
    trampoline::<13>,
    trampoline::<14>,
    trampoline::<15>,
];

fn dispatch(slot: usize, words: [usize; MAX_ARGS]) -> usize {
    // the lock is released before calling out, so callbacks may re-enter
    let entry = SLOTS.lock()[slot].clone();
    let Some(entry) = entry else {
        warn!("callback slot {} called after release", slot);
        return 0;
    };
    let args: Vec<Value> = entry
        .args
        .iter()
        .zip(words)
        .map(|(class, word)| class.decode(word))
        .collect();

    // unwinding into C is undefined
    match catch_unwind(AssertUnwindSafe(|| (entry.callable)(&args))) {
        Ok(value) => entry.result.encode(&value).unwrap_or_else(|e| {
            warn!("callback '{}' returned an unusable value: {}", entry.name, e);
            0
        }),
        Err(_) => {
            warn!("callback '{}' panicked; returning 0", entry.name);
            0
        }
    }
}

/// A claimed trampoline; releases its slot when dropped
pub struct NativeCallback {
    slot: usize,
    ty: NativeType,
    name: String,
}

impl NativeCallback {
    pub(crate) fn new(arena: &TypeArena, ty: NativeType, callable: HostCallable) -> BResult<Self> {
        let TypeKind::Function {
            args,
            result,
            variadic,
        } = arena.kind(ty)
        else {
            return Err(BackendError::mismatch(format!(
                "callback type '{}' is not a function type",
                arena.name(ty)
            )));
        };
        if variadic {
            return Err(BackendError::unsupported("variadic callbacks"));
        }
        if args.len() > MAX_ARGS {
            return Err(BackendError::unsupported(format!(
                "callbacks with more than {} arguments",
                MAX_ARGS
            )));
        }
        let name = arena.name(ty);
        let entry = Arc::new(CallbackEntry {
            name: name.clone(),
            callable,
            args: args
                .iter()
                .map(|arg| WordClass::of(arena, *arg))
                .collect::<BResult<_>>()?,
            result: WordClass::of(arena, result)?,
        });

        let mut slots = SLOTS.lock();
        let slot = slots.iter().position(Option::is_none).ok_or_else(|| {
            BackendError::unsupported(format!(
                "more than {} live callbacks",
                CALLBACK_SLOTS
            ))
        })?;
        slots[slot] = Some(entry);
        debug!("callback '{}' claimed slot {}", name, slot);
        Ok(Self { slot, ty, name })
    }

    /// Address to pass where C expects a function pointer
    pub fn address(&self) -> usize {
        TRAMPOLINES[self.slot] as usize
    }

    pub fn ctype(&self) -> NativeType {
        self.ty
    }

    pub fn as_value(&self) -> Value {
        Value::Pointer(self.address())
    }
}

impl Drop for NativeCallback {
    fn drop(&mut self) {
        SLOTS.lock()[self.slot] = None;
        debug!("callback '{}' released slot {}", self.name, self.slot);
    }
}

impl fmt::Debug for NativeCallback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<callback '{}' at {:#x}>", self.name, self.address())
    }
}

/// Number of slots currently claimed
pub fn live_callbacks() -> usize {
    SLOTS.lock().iter().filter(|slot| slot.is_some()).count()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::native::types::PrimitiveKind;

    #[test]
    fn test_trampoline_dispatches_to_closure() {
        let arena = TypeArena::new();
        let int = arena.push("int&".into(), TypeKind::Primitive(PrimitiveKind::Int));
        let ty = arena.push(
            "int&(int, int)".into(),
            TypeKind::Function {
                args: vec![int, int],
                result: int,
                variadic: false,
            },
        );
        let callback = NativeCallback::new(
            &arena,
            ty,
            Arc::new(|args: &[Value]| {
                let a = args[0].as_i64().unwrap_or(0);
                let b = args[1].as_i64().unwrap_or(0);
                Value::Int(a - b)
            }),
        )
        .unwrap();

        let f: Trampoline = TRAMPOLINES[callback.slot];
        // a negative int comes back sign-extended in the low 32 bits
        let raw = f(3, 5, 0, 0, 0, 0);
        assert_eq!(raw as u32, (-2i32) as u32);
        assert_eq!(callback.address(), f as usize);
    }

    #[test]
    fn test_panicking_closure_returns_zero() {
        let arena = TypeArena::new();
        let int = arena.push("int&".into(), TypeKind::Primitive(PrimitiveKind::Int));
        let ty = arena.push(
            "int&(void)".into(),
            TypeKind::Function {
                args: vec![],
                result: int,
                variadic: false,
            },
        );
        let callback = NativeCallback::new(&arena, ty, Arc::new(|_: &[Value]| panic!("boom"))).unwrap();
        assert_eq!(TRAMPOLINES[callback.slot](0, 0, 0, 0, 0, 0), 0);
    }

    #[test]
    fn test_variadic_callbacks_rejected() {
        let arena = TypeArena::new();
        let int = arena.push("int&".into(), TypeKind::Primitive(PrimitiveKind::Int));
        let ty = arena.push(
            "int&(int, ...)".into(),
            TypeKind::Function {
                args: vec![int],
                result: int,
                variadic: true,
            },
        );
        assert!(NativeCallback::new(&arena, ty, Arc::new(|_: &[Value]| Value::Int(0))).is_err());
    }
}
