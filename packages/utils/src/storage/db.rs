use std::any::Any;
use std::fmt;
use std::hash::Hash;
use std::marker::PhantomData;
use std::sync::Arc;

use anyhow::anyhow;
use dashmap::mapref::entry::Entry;
use dashmap::mapref::multiple::RefMulti;
use dashmap::DashMap;
use tracing::instrument;

/// The logical tables of the plant. Table names mirror the wide-column
/// schema so the in-memory backend reads like the real one.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Table {
    Devices,
    Interfaces,
    Endpoints,
    IndividualProperties,
    IndividualDatastreams,
    ObjectDatastreams,
    SimpleTriggers,
    KvStore,
    Test(&'static str),
}

impl Table {
    pub fn name(&self) -> &'static str {
        match self {
            Table::Devices => "devices",
            Table::Interfaces => "interfaces",
            Table::Endpoints => "endpoints",
            Table::IndividualProperties => "individual_properties",
            Table::IndividualDatastreams => "individual_datastreams",
            Table::ObjectDatastreams => "object_datastreams",
            Table::SimpleTriggers => "simple_triggers",
            Table::KvStore => "kv_store",
            Table::Test(name) => name,
        }
    }
}

#[derive(Copy, Clone)]
pub struct TableHandle<K, V> {
    table: Table,
    _marker: PhantomData<(K, V)>,
}

impl<K, V> TableHandle<K, V> {
    pub const fn new(table: Table) -> Self {
        Self {
            table,
            _marker: PhantomData,
        }
    }

    pub const fn table(&self) -> Table {
        self.table
    }
}

impl<K, V> fmt::Debug for TableHandle<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TableHandle")
            .field("table", &self.table)
            .finish()
    }
}

pub type DbError = anyhow::Error;

type AnyMap = Arc<dyn Any + Send + Sync>;

/// Typed in-memory table store: each `Table` holds one `DashMap<K, V>`
/// whose concrete types are pinned by the first `TableHandle` that touches
/// it.
#[derive(Clone, Default)]
pub struct PlantDb {
    tables: Arc<DashMap<Table, AnyMap>>,
}

impl PlantDb {
    pub fn new() -> Self {
        Self {
            tables: Arc::new(DashMap::new()),
        }
    }

    #[instrument(skip(self, key, value), fields(subsys = "PlantDb", table = ?handle.table()))]
    pub fn set<K, V>(&self, handle: &TableHandle<K, V>, key: K, value: V) -> Result<(), DbError>
    where
        K: Eq + Hash + Clone + Send + Sync + 'static,
        V: Clone + Send + Sync + 'static,
    {
        let map = self.table_map(handle)?;
        map.insert(key, value);
        Ok(())
    }

    #[instrument(skip(self, key), fields(subsys = "PlantDb", table = ?handle.table()))]
    pub fn get<K, V>(&self, handle: &TableHandle<K, V>, key: &K) -> Result<Option<V>, DbError>
    where
        K: Eq + Hash + Clone + Send + Sync + 'static,
        V: Clone + Send + Sync + 'static,
    {
        let map = self.table_map(handle)?;
        Ok(map.get(key).map(|v| v.clone()))
    }

    #[instrument(skip(self, key), fields(subsys = "PlantDb", table = ?handle.table()))]
    pub fn remove<K, V>(&self, handle: &TableHandle<K, V>, key: &K) -> Result<Option<V>, DbError>
    where
        K: Eq + Hash + Clone + Send + Sync + 'static,
        V: Clone + Send + Sync + 'static,
    {
        let map = self.table_map(handle)?;
        Ok(map.remove(key).map(|(_, v)| v))
    }

    #[instrument(skip(self, key), fields(subsys = "PlantDb", table = ?handle.table()))]
    pub fn contains_key<K, V>(&self, handle: &TableHandle<K, V>, key: &K) -> Result<bool, DbError>
    where
        K: Eq + Hash + Clone + Send + Sync + 'static,
        V: Clone + Send + Sync + 'static,
    {
        let map = self.table_map(handle)?;
        Ok(map.contains_key(key))
    }

    /// Read-modify-write of one entry under the map's shard lock.
    #[instrument(skip(self, key, f), fields(subsys = "PlantDb", table = ?handle.table()))]
    pub fn update<K, V, F>(&self, handle: &TableHandle<K, V>, key: K, f: F) -> Result<(), DbError>
    where
        K: Eq + Hash + Clone + Send + Sync + 'static,
        V: Clone + Default + Send + Sync + 'static,
        F: FnOnce(&mut V),
    {
        let map = self.table_map(handle)?;
        let mut entry = map.entry(key).or_default();
        f(entry.value_mut());
        Ok(())
    }

    #[instrument(skip(self, f), fields(subsys = "PlantDb", table = ?handle.table()))]
    pub fn with_table_read<K, V, F, R>(
        &self,
        handle: &TableHandle<K, V>,
        f: F,
    ) -> Result<R, DbError>
    where
        K: Eq + Hash + Clone + Send + Sync + 'static,
        V: Clone + Send + Sync + 'static,
        F: FnOnce(&TableReadGuard<K, V>) -> Result<R, DbError>,
    {
        let map = self.table_map(handle)?;
        let guard = TableReadGuard { map };
        f(&guard)
    }

    fn table_map<K, V>(&self, handle: &TableHandle<K, V>) -> Result<Arc<DashMap<K, V>>, DbError>
    where
        K: Eq + Hash + Clone + Send + Sync + 'static,
        V: Clone + Send + Sync + 'static,
    {
        match self.tables.entry(handle.table()) {
            Entry::Occupied(entry) => {
                let existing = entry.get().clone();
                existing
                    .downcast::<DashMap<K, V>>()
                    .map_err(|_| anyhow!("table {:?} type mismatch", handle.table()))
            }
            Entry::Vacant(entry) => {
                let map: Arc<DashMap<K, V>> = Arc::new(DashMap::new());
                let erased: AnyMap = map.clone();
                entry.insert(erased);
                Ok(map)
            }
        }
    }
}

pub struct TableReadGuard<K, V> {
    map: Arc<DashMap<K, V>>,
}

impl<K, V> TableReadGuard<K, V>
where
    K: Eq + Hash,
{
    pub fn iter(&self) -> TableIter<'_, K, V> {
        TableIter {
            inner: self.map.iter(),
        }
    }
}

pub struct TableIter<'a, K, V> {
    inner: dashmap::iter::Iter<'a, K, V>,
}

impl<'a, K, V> Iterator for TableIter<'a, K, V>
where
    K: Eq + Hash,
{
    type Item = TableEntry<'a, K, V>;

    fn next(&mut self) -> Option<Self::Item> {
        self.inner.next().map(TableEntry)
    }
}

pub struct TableEntry<'a, K, V>(RefMulti<'a, K, V>);

impl<'a, K, V> TableEntry<'a, K, V>
where
    K: Eq + Hash,
{
    pub fn pair(&self) -> (&K, &V) {
        (self.0.key(), self.0.value())
    }
}
