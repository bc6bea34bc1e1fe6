//! Typed accessors. Spec types carry their namespace and kind, so callers name
//! a Rust type instead of a (namespace, kind) pair; a resource of another kind
//! surfaces as `TypeMismatch`.

use bastion_core::{Kind, ListOptions, Namespace, ResourceId, StateError, StateResult, Version};
use bastion_resources::{Resource, TypedResource, TypedSpec};

use crate::MODIFY_RETRIES;

pub trait Reader {
    fn get(&self, id: &ResourceId) -> StateResult<Resource>;
    fn list(&self, namespace: Namespace, kind: Kind, opts: &ListOptions) -> StateResult<Vec<Resource>>;
}

/// Mutating access bound to an owner identity.
pub trait Writer: Reader {
    fn owner(&self) -> &str;
    fn create(&self, r: Resource) -> StateResult<Resource>;
    fn update(&self, expected: Version, r: Resource) -> StateResult<Resource>;
    fn modify<F, E>(&self, template: Resource, f: F) -> Result<Resource, E>
    where
        F: FnMut(&mut Resource) -> Result<(), E>,
        E: From<StateError>;
    fn teardown(&self, id: &ResourceId) -> StateResult<bool>;
    fn destroy(&self, id: &ResourceId) -> StateResult<()>;
    fn add_finalizer(&self, id: &ResourceId, name: &str) -> StateResult<()>;
    fn remove_finalizer(&self, id: &ResourceId, name: &str) -> StateResult<()>;
}

fn spec_mut<T: TypedSpec>(r: &mut Resource) -> StateResult<&mut T> {
    let (id, actual) = (r.pointer(), r.spec.kind());
    T::from_spec_mut(&mut r.spec).ok_or(StateError::TypeMismatch { id, expected: T::KIND, actual })
}

/// Resource `id` of kind `T` in `T`'s namespace.
pub fn get<T: TypedSpec, R: Reader + ?Sized>(r: &R, id: &str) -> StateResult<TypedResource<T>> {
    get_by_id(r, &T::resource_id(id))
}

pub fn get_by_id<T: TypedSpec, R: Reader + ?Sized>(r: &R, id: &ResourceId) -> StateResult<TypedResource<T>> {
    if id.kind != T::KIND {
        return Err(StateError::TypeMismatch { id: id.clone(), expected: T::KIND, actual: id.kind });
    }
    TypedResource::from_resource(r.get(id)?)
}

/// Like [`get`] with `NotFound` mapped to `None`.
pub fn get_opt<T: TypedSpec, R: Reader + ?Sized>(r: &R, id: &str) -> StateResult<Option<TypedResource<T>>> {
    match get(r, id) {
        Ok(v) => Ok(Some(v)),
        Err(e) if e.is_not_found() => Ok(None),
        Err(e) => Err(e),
    }
}

pub fn list<T: TypedSpec, R: Reader + ?Sized>(r: &R, opts: &ListOptions) -> StateResult<Vec<TypedResource<T>>> {
    r.list(T::NAMESPACE, T::KIND, opts)?.into_iter().map(TypedResource::from_resource).collect()
}

/// Creates `id` from `T::default()` when absent, then applies `f` to the spec.
pub fn modify<T, W, F, E>(w: &W, id: &str, mut f: F) -> Result<TypedResource<T>, E>
where
    T: TypedSpec,
    W: Writer + ?Sized,
    F: FnMut(&mut T) -> Result<(), E>,
    E: From<StateError>,
{
    let template = TypedResource::new(id, T::default()).into_resource();
    let out = w.modify(template, |r: &mut Resource| f(spec_mut::<T>(r)?))?;
    Ok(TypedResource::from_resource(out)?)
}

/// Like [`modify`] with access to labels and annotations.
pub fn modify_with<T, W, F, E>(w: &W, id: &str, mut f: F) -> Result<TypedResource<T>, E>
where
    T: TypedSpec,
    W: Writer + ?Sized,
    F: FnMut(&mut bastion_core::Metadata, &mut T) -> Result<(), E>,
    E: From<StateError>,
{
    let template = TypedResource::new(id, T::default()).into_resource();
    let out = w.modify(template, |r: &mut Resource| {
        let Resource { metadata, spec } = r;
        let actual = spec.kind();
        let spec = T::from_spec_mut(spec)
            .ok_or(StateError::TypeMismatch { id: metadata.pointer(), expected: T::KIND, actual })?;
        f(metadata, spec)
    })?;
    Ok(TypedResource::from_resource(out)?)
}

/// Updates an existing resource, re-running `f` on a fresh copy after a version
/// conflict. Any other error, including `NotFound`, surfaces immediately.
pub fn update_with_conflicts<T, W, F, E>(w: &W, id: &str, mut f: F) -> Result<TypedResource<T>, E>
where
    T: TypedSpec,
    W: Writer + ?Sized,
    F: FnMut(&mut T) -> Result<(), E>,
    E: From<StateError>,
{
    let mut last = None;
    for _ in 0..MODIFY_RETRIES {
        let mut cur = w.get(&T::resource_id(id))?;
        let version = cur.metadata.version;
        f(spec_mut::<T>(&mut cur)?)?;
        match w.update(version, cur) {
            Ok(r) => return Ok(TypedResource::from_resource(r)?),
            Err(e) if e.is_conflict() => last = Some(e),
            Err(e) => return Err(e.into()),
        }
    }
    Err(last.unwrap_or(StateError::Cancelled).into())
}

/// Tears down and, when no finalizers are left, destroys every resource of
/// kind `T` owned by the writer whose id fails `keep`. Returns how many remain
/// in teardown.
pub fn cleanup_outputs<T, W, K>(w: &W, mut keep: K) -> StateResult<usize>
where
    T: TypedSpec,
    W: Writer + ?Sized,
    K: FnMut(&str) -> bool,
{
    let mut pending = 0;
    for r in w.list(T::NAMESPACE, T::KIND, &ListOptions::default())? {
        if r.metadata.owner != w.owner() || keep(&r.metadata.id) {
            continue;
        }
        let id = r.pointer();
        if w.teardown(&id)? {
            w.destroy(&id)?;
        } else {
            pending += 1;
        }
    }
    Ok(pending)
}
