/*
 *
 * Copyright 2025 gRPC authors.
 *
 * Permission is hereby granted, free of charge, to any person obtaining a copy
 * of this software and associated documentation files (the "Software"), to
 * deal in the Software without restriction, including without limitation the
 * rights to use, copy, modify, merge, publish, distribute, sublicense, and/or
 * sell copies of the Software, and to permit persons to whom the Software is
 * furnished to do so, subject to the following conditions:
 *
 * The above copyright notice and this permission notice shall be included in
 * all copies or substantial portions of the Software.
 *
 * THE SOFTWARE IS PROVIDED "AS IS", WITHOUT WARRANTY OF ANY KIND, EXPRESS OR
 * IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY,
 * FITNESS FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL THE
 * AUTHORS OR COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER
 * LIABILITY, WHETHER IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING
 * FROM, OUT OF OR IN CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER DEALINGS
 * IN THE SOFTWARE.
 *
 */

use std::any::{Any, TypeId};
use std::cmp::Ordering;
use std::fmt::Debug;
use std::sync::Arc;

/// Ensures only types that support comparison can be inserted into the
/// Attributes struct. This allows the use of value-based equality rather than
/// relying on pointer comparisons.
trait AttributeTrait: Any + Send + Sync + Debug {
    fn any_ref(&self) -> &dyn Any;
    fn dyn_eq(&self, other: &dyn AttributeTrait) -> bool;
    fn dyn_cmp(&self, other: &dyn AttributeTrait) -> Ordering;
}

impl<T: Any + Send + Sync + Eq + Ord + Debug> AttributeTrait for T {
    fn any_ref(&self) -> &dyn Any {
        self
    }

    fn dyn_eq(&self, other: &dyn AttributeTrait) -> bool {
        if let Some(other) = other.any_ref().downcast_ref::<T>() {
            self == other
        } else {
            false
        }
    }

    fn dyn_cmp(&self, other: &dyn AttributeTrait) -> Ordering {
        if let Some(other) = other.any_ref().downcast_ref::<T>() {
            self.cmp(other)
        } else {
            // Entries are compared per-key, so both sides have the same type;
            // this arm only exists to keep the trait total.
            TypeId::of::<T>().cmp(&other.any_ref().type_id())
        }
    }
}

#[derive(Clone, Debug)]
struct AttributeValue(Arc<dyn AttributeTrait>);

impl PartialEq for AttributeValue {
    fn eq(&self, other: &Self) -> bool {
        self.0.dyn_eq(other.0.as_ref())
    }
}

impl Eq for AttributeValue {}

impl PartialOrd for AttributeValue {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for AttributeValue {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.dyn_cmp(other.0.as_ref())
    }
}

/// A collection of attributes indexed by their type.
///
/// `Attributes` provides a map-like interface where values are keyed by their
/// TypeId.  It is how a channel passes arbitrary typed data to LB policies
/// (on a `ResolverUpdate`) and how LB policies attach data to individual
/// addresses and endpoints.
///
/// Equality and ordering of `Attributes` are structural: two maps are equal if
/// they contain the same set of values, compared by value.  Stored types must
/// implement `Any + Send + Sync + Eq + Ord + Debug`.
///
/// The map is persistent: mutating operations return a new `Attributes`.  The
/// entries are kept in a vector sorted by `TypeId`; these maps hold a handful
/// of entries at most.
#[derive(Clone, Default, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct Attributes {
    entries: Vec<(TypeId, AttributeValue)>,
}

impl Attributes {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a value to the attributes.
    /// Returns a new Attributes object with the value added.
    /// If a value of the same type already exists, it is replaced.
    pub fn add<T: Send + Sync + Eq + Ord + Debug + 'static>(&self, value: T) -> Self {
        let id = TypeId::of::<T>();
        let value = AttributeValue(Arc::new(value));
        let mut entries = self.entries.clone();
        match entries.binary_search_by_key(&id, |(k, _)| *k) {
            Ok(idx) => entries[idx] = (id, value),
            Err(idx) => entries.insert(idx, (id, value)),
        }
        Attributes { entries }
    }

    /// Gets a reference to a value of type T.
    pub fn get<T: 'static>(&self) -> Option<&T> {
        let id = TypeId::of::<T>();
        self.entries
            .binary_search_by_key(&id, |(k, _)| *k)
            .ok()
            .and_then(|idx| self.entries[idx].1 .0.any_ref().downcast_ref())
    }

    /// Removes a value of type T from the attributes.
    /// Returns a new Attributes object with the value removed.
    pub fn remove<T: 'static>(&self) -> Self {
        let id = TypeId::of::<T>();
        let mut entries = self.entries.clone();
        if let Ok(idx) = entries.binary_search_by_key(&id, |(k, _)| *k) {
            entries.remove(idx);
        }
        Attributes { entries }
    }

    /// Inserts all values from another Attributes object into this one.
    /// Returns a new Attributes object with the values added.
    /// If a value of the same type already exists, it is replaced by the value
    /// from `other`.
    pub fn union(&self, other: &Attributes) -> Self {
        let mut result = self.clone();
        for (id, value) in &other.entries {
            match result.entries.binary_search_by_key(id, |(k, _)| *k) {
                Ok(idx) => result.entries[idx] = (*id, value.clone()),
                Err(idx) => result.entries.insert(idx, (*id, value.clone())),
            }
        }
        result
    }
}
