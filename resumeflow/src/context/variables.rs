//! Typed contextual services.
//!
//! Every unit of work sees a [`ContextVariables`] set: a chain of layers
//! mapping a Rust type to one value of that type. Bodies push a new layer
//! built from [`ContextOverrides`]. When an override meets a value of the
//! same type that is already visible, the two are combined by the type's
//! [`Contextual::merge`] instead of the newer value simply winning.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// A value that can be made available to units of work through their context.
pub trait Contextual: Any + Send + Sync {
    /// Combines an inherited value with a more specific one.
    fn merge(original: &Self, subsequent: &Self) -> Self
    where
        Self: Sized;
}

type Erased = Arc<dyn Any + Send + Sync>;
type MergeFn = fn(&Erased, &Erased) -> Option<Erased>;

fn merge_erased<T: Contextual>(original: &Erased, subsequent: &Erased) -> Option<Erased> {
    let original = (**original).downcast_ref::<T>()?;
    let subsequent = (**subsequent).downcast_ref::<T>()?;
    Some(Arc::new(T::merge(original, subsequent)))
}

#[derive(Clone)]
struct Entry {
    value: Erased,
    merge: MergeFn,
    type_name: &'static str,
}

impl Entry {
    fn of<T: Contextual>(value: T) -> Self {
        Self {
            value: Arc::new(value),
            merge: merge_erased::<T>,
            type_name: std::any::type_name::<T>(),
        }
    }

    fn merged_over(&self, original: &Self) -> Self {
        let value = (self.merge)(&original.value, &self.value).unwrap_or_else(|| self.value.clone());
        Self {
            value,
            merge: self.merge,
            type_name: self.type_name,
        }
    }
}

struct Layer {
    values: HashMap<TypeId, Entry>,
    parent: Option<Arc<Layer>>,
}

/// An immutable, layered set of contextual values.
#[derive(Clone, Default)]
pub struct ContextVariables {
    top: Option<Arc<Layer>>,
}

impl ContextVariables {
    /// Creates an empty set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a set with `value` layered on top, merged with any visible value of the same type.
    #[must_use]
    pub fn with<T: Contextual>(self, value: T) -> Self {
        let mut overrides = ContextOverrides::new();
        overrides.add(value);
        self.overlay(&overrides)
    }

    /// Looks up the value for type `T`.
    #[must_use]
    pub fn get<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        self.lookup(TypeId::of::<T>())
            .and_then(|entry| entry.value.clone().downcast::<T>().ok())
    }

    /// Returns true if a value of type `T` is visible.
    #[must_use]
    pub fn contains<T: Any + Send + Sync>(&self) -> bool {
        self.lookup(TypeId::of::<T>()).is_some()
    }

    /// Pushes a new layer built from `overrides`.
    #[must_use]
    pub fn overlay(&self, overrides: &ContextOverrides) -> Self {
        if overrides.is_empty() {
            return self.clone();
        }
        let values = overrides
            .entries
            .iter()
            .map(|(id, entry)| {
                let merged = match self.lookup(*id) {
                    Some(inherited) => entry.merged_over(inherited),
                    None => entry.clone(),
                };
                (*id, merged)
            })
            .collect();
        Self {
            top: Some(Arc::new(Layer {
                values,
                parent: self.top.clone(),
            })),
        }
    }

    fn lookup(&self, id: TypeId) -> Option<&Entry> {
        let mut layer = self.top.as_deref();
        while let Some(current) = layer {
            if let Some(entry) = current.values.get(&id) {
                return Some(entry);
            }
            layer = current.parent.as_deref();
        }
        None
    }

    fn type_names(&self) -> Vec<&'static str> {
        let mut names = Vec::new();
        let mut layer = self.top.as_deref();
        while let Some(current) = layer {
            names.extend(current.values.values().map(|entry| entry.type_name));
            layer = current.parent.as_deref();
        }
        names.sort_unstable();
        names.dedup();
        names
    }
}

impl fmt::Debug for ContextVariables {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContextVariables")
            .field("types", &self.type_names())
            .finish()
    }
}

/// Overrides accumulated by a body invoker before launch.
#[derive(Clone, Default)]
pub struct ContextOverrides {
    entries: HashMap<TypeId, Entry>,
}

impl ContextOverrides {
    /// Creates an empty set of overrides.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds an override, merging with an earlier override of the same type.
    pub fn add<T: Contextual>(&mut self, value: T) {
        let entry = Entry::of(value);
        let merged = match self.entries.get(&TypeId::of::<T>()) {
            Some(earlier) => entry.merged_over(earlier),
            None => entry,
        };
        self.entries.insert(TypeId::of::<T>(), merged);
    }

    /// Returns the number of distinct overridden types.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if nothing is overridden.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl fmt::Debug for ContextOverrides {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<_> = self.entries.values().map(|entry| entry.type_name).collect();
        names.sort_unstable();
        f.debug_struct("ContextOverrides").field("types", &names).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[derive(Debug, PartialEq)]
    struct Trail(Vec<&'static str>);

    impl Contextual for Trail {
        fn merge(original: &Self, subsequent: &Self) -> Self {
            let mut steps = original.0.clone();
            steps.extend(subsequent.0.iter().copied());
            Self(steps)
        }
    }

    #[derive(Debug, PartialEq)]
    struct Label(&'static str);

    impl Contextual for Label {
        fn merge(_original: &Self, subsequent: &Self) -> Self {
            Self(subsequent.0)
        }
    }

    #[test]
    fn test_lookup_walks_parent_layers() {
        let root = ContextVariables::new().with(Label("root"));
        let mut overrides = ContextOverrides::new();
        overrides.add(Trail(vec!["a"]));
        let child = root.overlay(&overrides);

        assert_eq!(child.get::<Label>().unwrap().0, "root");
        assert_eq!(child.get::<Trail>().unwrap().0, vec!["a"]);
        assert!(root.get::<Trail>().is_none());
    }

    #[test]
    fn test_override_merges_with_inherited_value() {
        let root = ContextVariables::new().with(Trail(vec!["outer"]));
        let child = root.clone().with(Trail(vec!["inner"]));

        assert_eq!(*child.get::<Trail>().unwrap(), Trail(vec!["outer", "inner"]));
        assert_eq!(*root.get::<Trail>().unwrap(), Trail(vec!["outer"]));
    }

    #[test]
    fn test_conflicting_overrides_in_one_builder_merge() {
        let mut overrides = ContextOverrides::new();
        overrides.add(Trail(vec!["first"]));
        overrides.add(Trail(vec!["second"]));
        assert_eq!(overrides.len(), 1);

        let vars = ContextVariables::new().overlay(&overrides);
        assert_eq!(*vars.get::<Trail>().unwrap(), Trail(vec!["first", "second"]));
    }

    #[test]
    fn test_missing_type_is_absent() {
        let vars = ContextVariables::new();
        assert!(vars.get::<Label>().is_none());
        assert!(!vars.contains::<Label>());
    }
}
