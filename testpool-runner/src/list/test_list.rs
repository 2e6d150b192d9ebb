// Copyright (c) The testpool Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use super::{ItemId, StatusCache, TestItem, TestSetup};
use crate::errors::TestListError;
use std::{
    collections::{BTreeMap, HashSet},
    sync::Arc,
};

/// A test item along with its position in discovery order.
#[derive(Clone, Debug, PartialEq)]
pub struct TestInstance {
    /// The position of this item in discovery order, starting at 0.
    pub sequence_number: usize,

    /// The item.
    pub item: TestItem,
}

impl TestInstance {
    /// Returns the item's ID.
    pub fn id(&self) -> &ItemId {
        &self.item.id
    }
}

/// The validated set of items and setups for a run.
///
/// Cloning a `TestList` is cheap.
#[derive(Clone, Debug)]
pub struct TestList {
    instances: Vec<Arc<TestInstance>>,
    setups: Arc<BTreeMap<String, TestSetup>>,
}

impl TestList {
    /// Creates a new test list.
    ///
    /// Items are numbered in iteration order. Returns an error if two items share an ID or two
    /// setups share a name.
    pub fn new(
        items: impl IntoIterator<Item = TestItem>,
        setups: impl IntoIterator<Item = TestSetup>,
    ) -> Result<Self, TestListError> {
        let mut seen = HashSet::new();
        let mut instances = Vec::new();
        for (sequence_number, item) in items.into_iter().enumerate() {
            if !seen.insert(item.id.clone()) {
                return Err(TestListError::DuplicateItemId { id: item.id });
            }
            instances.push(Arc::new(TestInstance {
                sequence_number,
                item,
            }));
        }

        let mut setup_map = BTreeMap::new();
        for setup in setups {
            if setup_map.contains_key(&setup.name) {
                return Err(TestListError::DuplicateSetupName { name: setup.name });
            }
            setup_map.insert(setup.name.clone(), setup);
        }

        Ok(Self {
            instances,
            setups: Arc::new(setup_map),
        })
    }

    /// Returns the number of items.
    pub fn len(&self) -> usize {
        self.instances.len()
    }

    /// Returns true if there are no items.
    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }

    /// Iterates over items in discovery order.
    pub fn iter(&self) -> impl Iterator<Item = &Arc<TestInstance>> + '_ {
        self.instances.iter()
    }

    /// Looks up a setup by name.
    pub fn setup(&self, name: &str) -> Option<&TestSetup> {
        self.setups.get(name)
    }

    /// Iterates over setups in name order.
    pub fn setups(&self) -> impl Iterator<Item = &TestSetup> + '_ {
        self.setups.values()
    }

    /// Returns the (item, setup name) pairs where an item depends on a setup that isn't declared.
    ///
    /// Such items are still dispatched: the setup call is attempted and fails on the worker.
    pub fn undeclared_setups(&self) -> Vec<(&ItemId, &str)> {
        self.instances
            .iter()
            .flat_map(|instance| {
                instance
                    .item
                    .setups
                    .iter()
                    .filter(|name| !self.setups.contains_key(name.as_str()))
                    .map(move |name| (&instance.item.id, name.as_str()))
            })
            .collect()
    }

    /// Returns items in the order they should be dispatched.
    ///
    /// With a status cache, items that did not pass last time come first, then items never seen
    /// before, then items that passed. The sort is stable, so discovery order is kept within each
    /// group. Without a cache, discovery order is used.
    pub fn ordered(&self, cache: Option<&StatusCache>) -> Vec<Arc<TestInstance>> {
        let mut ordered = self.instances.clone();
        if let Some(cache) = cache {
            ordered.sort_by_key(|instance| cache.priority(instance.id()));
        }
        ordered
    }
}
