// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Index arenas.
//!
//! A `Region` owns its items and is released as a whole. Items refer to each
//! other through `Id` handles, so a region can be serialized as-is and later
//! reloaded at any address. The only way to keep an item beyond the lifetime
//! of its region is to `promote` it into another one.

use crate::error::RuleError;

use core::fmt;
use core::hash::{Hash, Hasher};
use core::marker::PhantomData;
use core::ops::{Index, IndexMut};

use anyhow::{bail, Result};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Handle to an item of a `Region<T>`.
pub struct Id<T> {
    index: u32,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Id<T> {
    pub(crate) fn new(index: u32) -> Self {
        Self {
            index,
            _marker: PhantomData,
        }
    }

    pub fn index(&self) -> usize {
        self.index as usize
    }
}

impl<T> Clone for Id<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for Id<T> {}

impl<T> PartialEq for Id<T> {
    fn eq(&self, other: &Self) -> bool {
        self.index == other.index
    }
}

impl<T> Eq for Id<T> {}

impl<T> PartialOrd for Id<T> {
    fn partial_cmp(&self, other: &Self) -> Option<core::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl<T> Ord for Id<T> {
    fn cmp(&self, other: &Self) -> core::cmp::Ordering {
        self.index.cmp(&other.index)
    }
}

impl<T> Hash for Id<T> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.index.hash(state)
    }
}

impl<T> fmt::Debug for Id<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.index)
    }
}

impl<T> Serialize for Id<T> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.index.serialize(serializer)
    }
}

impl<'de, T> Deserialize<'de> for Id<T> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Ok(Id::new(u32::deserialize(deserializer)?))
    }
}

/// Approximate number of bytes an item keeps alive, including heap payloads.
pub trait Footprint {
    fn footprint(&self) -> usize {
        core::mem::size_of_val(self)
    }
}

/// Items that hold handles into their own region.
pub trait Relocate: Sized {
    /// Copy `self` with every child handle rewritten by `map`.
    fn relocate(&self, map: &mut dyn FnMut(Id<Self>) -> Result<Id<Self>>) -> Result<Self>;
}

#[derive(Clone, Serialize, Deserialize)]
pub struct Region<T> {
    items: Vec<T>,
    bytes: usize,
    limit: usize,
}

impl<T> Default for Region<T> {
    fn default() -> Self {
        Self {
            items: vec![],
            bytes: 0,
            limit: usize::MAX,
        }
    }
}

impl<T> fmt::Debug for Region<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Region")
            .field("items", &self.items.len())
            .field("bytes", &self.bytes)
            .field("limit", &self.limit)
            .finish()
    }
}

impl<T: Footprint> Region<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_limit(limit: usize) -> Self {
        Self {
            limit,
            ..Self::default()
        }
    }

    pub fn alloc(&mut self, item: T) -> Result<Id<T>> {
        let size = item.footprint();
        if self.bytes.saturating_add(size) > self.limit {
            bail!(RuleError::OutOfMemory { limit: self.limit });
        }
        if self.items.len() >= u32::MAX as usize {
            bail!(RuleError::OutOfMemory { limit: self.limit });
        }
        self.bytes += size;
        self.items.push(item);
        Ok(Id::new(self.items.len() as u32 - 1))
    }

    /// Replace an item in place, keeping the byte accounting current.
    pub fn replace(&mut self, id: Id<T>, item: T) -> Result<T> {
        let new_size = item.footprint();
        let old_size = self.items[id.index()].footprint();
        let bytes = self.bytes.saturating_sub(old_size).saturating_add(new_size);
        if bytes > self.limit {
            bail!(RuleError::OutOfMemory { limit: self.limit });
        }
        self.bytes = bytes;
        Ok(core::mem::replace(&mut self.items[id.index()], item))
    }
}

impl<T> Region<T> {
    pub fn get(&self, id: Id<T>) -> Option<&T> {
        self.items.get(id.index())
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Bytes allocated so far.
    pub fn footprint(&self) -> usize {
        self.bytes
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    pub fn iter(&self) -> impl Iterator<Item = (Id<T>, &T)> {
        self.items
            .iter()
            .enumerate()
            .map(|(i, item)| (Id::new(i as u32), item))
    }
}

impl<T> Index<Id<T>> for Region<T> {
    type Output = T;

    fn index(&self, id: Id<T>) -> &T {
        &self.items[id.index()]
    }
}

impl<T> IndexMut<Id<T>> for Region<T> {
    fn index_mut(&mut self, id: Id<T>) -> &mut T {
        &mut self.items[id.index()]
    }
}

/// Deep-copy the item `id` of `src`, and everything reachable from it, into `dst`.
pub fn promote<T: Relocate + Footprint>(
    src: &Region<T>,
    id: Id<T>,
    dst: &mut Region<T>,
) -> Result<Id<T>> {
    let item = src[id].relocate(&mut |child| promote(src, child, dst))?;
    dst.alloc(item)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, PartialEq)]
    enum Tree {
        Leaf(i64),
        Pair(Id<Tree>, Id<Tree>),
    }

    impl Footprint for Tree {}

    impl Relocate for Tree {
        fn relocate(&self, map: &mut dyn FnMut(Id<Self>) -> Result<Id<Self>>) -> Result<Self> {
            Ok(match self {
                Tree::Leaf(v) => Tree::Leaf(*v),
                Tree::Pair(a, b) => Tree::Pair(map(*a)?, map(*b)?),
            })
        }
    }

    fn sum(r: &Region<Tree>, id: Id<Tree>) -> i64 {
        match &r[id] {
            Tree::Leaf(v) => *v,
            Tree::Pair(a, b) => sum(r, *a) + sum(r, *b),
        }
    }

    #[test]
    fn promote_copies_reachable_items_only() -> Result<()> {
        let mut src = Region::new();
        let _garbage = src.alloc(Tree::Leaf(100))?;
        let a = src.alloc(Tree::Leaf(1))?;
        let b = src.alloc(Tree::Leaf(2))?;
        let p = src.alloc(Tree::Pair(a, b))?;

        let mut dst = Region::new();
        let q = promote(&src, p, &mut dst)?;
        drop(src);

        assert_eq!(dst.len(), 3);
        assert_eq!(sum(&dst, q), 3);
        Ok(())
    }

    #[test]
    fn alloc_beyond_limit_is_out_of_memory() {
        let leaf = core::mem::size_of::<Tree>();
        let mut r = Region::with_limit(leaf * 2);
        assert!(r.alloc(Tree::Leaf(1)).is_ok());
        assert!(r.alloc(Tree::Leaf(2)).is_ok());
        let err = r.alloc(Tree::Leaf(3)).unwrap_err();
        assert_eq!(
            RuleError::from_anyhow(&err).code(),
            crate::error::codes::RE_OUT_OF_MEMORY
        );
    }
}
