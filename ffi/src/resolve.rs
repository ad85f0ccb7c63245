//! Backend-type construction
//!
//! [`TypeCache`] maps logical types to backend handles, one handle per
//! structurally distinct node. Aggregates get an incomplete placeholder in
//! the cache before their fields are resolved, which is what lets
//! `struct Node { struct Node *next; }` terminate: resolving the field's
//! pointer finds the placeholder immediately.
//!
//! Every insertion is journaled. When an aggregate fails to complete, all
//! entries made since it started (its placeholder and anything that points
//! at it) are dropped again, so no half-built handle is ever observable.

use std::cell::RefCell;

use fxhash::{FxHashMap, FxHashSet};
use log::{debug, trace};

use crate::backend::{BResult, Backend};
use crate::declarations::DeclarationTable;
use crate::model::CType;

#[derive(Debug)]
pub struct TypeCache<T> {
    handles: RefCell<FxHashMap<CType, T>>,
    journal: RefCell<Vec<CType>>,
    /// Aggregates cached without fields (forward declarations)
    opaque: RefCell<FxHashSet<CType>>,
    /// Aggregates whose fields are being resolved right now
    completing: RefCell<FxHashSet<CType>>,
}

impl<T> Default for TypeCache<T> {
    fn default() -> Self {
        Self {
            handles: RefCell::new(FxHashMap::default()),
            journal: RefCell::new(Vec::new()),
            opaque: RefCell::new(FxHashSet::default()),
            completing: RefCell::new(FxHashSet::default()),
        }
    }
}

impl<T: Clone> TypeCache<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.handles.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.borrow().is_empty()
    }

    pub fn get(&self, ty: &CType) -> Option<T> {
        self.handles.borrow().get(ty).cloned()
    }

    pub fn contains(&self, ty: &CType) -> bool {
        self.handles.borrow().contains_key(ty)
    }

    /// True while an aggregate is cached but still has no fields
    pub fn is_opaque(&self, ty: &CType) -> bool {
        self.opaque.borrow().contains(ty)
    }

    /// Backend handle for `ty`, building it (and its dependencies) on first use
    pub fn resolve<B>(&self, backend: &B, decls: &DeclarationTable, ty: &CType) -> BResult<T>
    where
        B: Backend<Type = T>,
    {
        if let Some(handle) = self.get(ty) {
            self.complete_pending(backend, decls, ty)?;
            return Ok(handle);
        }
        if ty.is_aggregate() {
            self.resolve_aggregate(backend, decls, ty)
        } else {
            self.resolve_node(backend, decls, ty)
        }
    }

    fn resolve_node<B>(&self, backend: &B, decls: &DeclarationTable, ty: &CType) -> BResult<T>
    where
        B: Backend<Type = T>,
    {
        let deps = ty
            .prepare(decls)
            .iter()
            .map(|dep| self.resolve(backend, decls, dep))
            .collect::<BResult<Vec<_>>>()?;
        // a dependency may have built this node already
        if let Some(handle) = self.get(ty) {
            return Ok(handle);
        }
        trace!("finishing {}", ty);
        let handle = ty.finish(backend, decls, None, &deps)?;
        Ok(self.insert(ty, handle))
    }

    fn resolve_aggregate<B>(&self, backend: &B, decls: &DeclarationTable, ty: &CType) -> BResult<T>
    where
        B: Backend<Type = T>,
    {
        let mark = self.journal.borrow().len();
        let placeholder = ty.new_incomplete(backend)?;
        let placeholder = self.insert(ty, placeholder);

        let has_fields = ty.as_aggregate().and_then(|s| decls.fields(s)).is_some();
        if !has_fields {
            debug!("'{}' cached as an opaque type", ty);
            self.opaque.borrow_mut().insert(ty.clone());
            return Ok(placeholder);
        }

        match self.complete(backend, decls, ty, &placeholder) {
            Ok(()) => Ok(placeholder),
            Err(e) => {
                self.rollback(mark);
                Err(e)
            }
        }
    }

    fn complete<B>(&self, backend: &B, decls: &DeclarationTable, ty: &CType, placeholder: &T) -> BResult<()>
    where
        B: Backend<Type = T>,
    {
        self.completing.borrow_mut().insert(ty.clone());
        let result = ty
            .prepare(decls)
            .iter()
            .map(|dep| self.resolve(backend, decls, dep))
            .collect::<BResult<Vec<_>>>()
            .and_then(|deps| {
                trace!("completing {} with {} fields", ty, deps.len());
                ty.finish(backend, decls, Some(placeholder), &deps)
            });
        self.completing.borrow_mut().remove(ty);
        result.map(|_| ())
    }

    /// Complete a forward-declared aggregate once its definition has arrived.
    /// Pointers and arrays complete what they point at, so `struct S *`
    /// cached before the definition still sees a laid-out `struct S`.
    fn complete_pending<B>(&self, backend: &B, decls: &DeclarationTable, ty: &CType) -> BResult<()>
    where
        B: Backend<Type = T>,
    {
        let target = match ty {
            CType::Pointer(pointee) => return self.complete_pending(backend, decls, pointee),
            CType::Array(array) => return self.complete_pending(backend, decls, array.element()),
            CType::StructOrUnion(s) => s,
            _ => return Ok(()),
        };
        if !self.opaque.borrow().contains(ty)
            || self.completing.borrow().contains(ty)
            || decls.fields(target).is_none()
        {
            return Ok(());
        }
        let Some(placeholder) = self.get(ty) else {
            return Ok(());
        };
        debug!("late completion of '{}'", ty);
        self.complete(backend, decls, ty, &placeholder)?;
        self.opaque.borrow_mut().remove(ty);
        Ok(())
    }

    /// Insert unless present; returns the cached handle either way
    fn insert(&self, ty: &CType, handle: T) -> T {
        let mut handles = self.handles.borrow_mut();
        if let Some(existing) = handles.get(ty) {
            return existing.clone();
        }
        handles.insert(ty.clone(), handle.clone());
        self.journal.borrow_mut().push(ty.clone());
        handle
    }

    fn rollback(&self, mark: usize) {
        let removed: Vec<CType> = self.journal.borrow_mut().drain(mark..).collect();
        debug!("rolling back {} cached types", removed.len());
        let mut handles = self.handles.borrow_mut();
        let mut opaque = self.opaque.borrow_mut();
        for ty in removed {
            handles.remove(&ty);
            opaque.remove(&ty);
        }
    }
}
