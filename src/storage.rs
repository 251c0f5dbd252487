//! A storage is the data structure where components of one type for all
//! entities are stored.
//!
//! Three backends exist. *Sparse* indexes the field columns directly by
//! entity id. *Packed* maps entity ids through a slot index with a LIFO free
//! list, growing geometrically when elastic. *Compact* keeps a small
//! linear-scan table of live ids. Tag components store nothing; their
//! existence lives solely in the shape bitmask.

use crate::comp::{Capacity, StorageKind, TypeInfo};
use crate::error::{CheckError, InternalError, Result};

pub(crate) mod bind;
pub(crate) mod column;

use column::Column;

/// A slot index or free stack whose cell width tracks the slot capacity,
/// so small storages pay one byte per entry. `-1` encodes vacancy.
pub(crate) enum SlotList {
    I8(Vec<i8>),
    I16(Vec<i16>),
    I32(Vec<i32>),
}

impl SlotList {
    fn width_holds(capacity: usize) -> u8 {
        if capacity <= 1 + i8::MAX as usize {
            1
        } else if capacity <= 1 + i16::MAX as usize {
            2
        } else {
            4
        }
    }

    /// A fixed-length map filled with vacancies, for use as a slot index.
    pub(crate) fn vacant(len: usize, capacity: usize) -> Self {
        match Self::width_holds(capacity) {
            1 => Self::I8(vec![-1; len]),
            2 => Self::I16(vec![-1; len]),
            _ => Self::I32(vec![-1; len]),
        }
    }

    /// An empty stack, for use as a free list.
    pub(crate) fn stack(capacity: usize) -> Self {
        match Self::width_holds(capacity) {
            1 => Self::I8(Vec::new()),
            2 => Self::I16(Vec::new()),
            _ => Self::I32(Vec::new()),
        }
    }

    pub(crate) fn get(&self, index: usize) -> Option<u32> {
        let value = match self {
            Self::I8(vec) => i64::from(vec[index]),
            Self::I16(vec) => i64::from(vec[index]),
            Self::I32(vec) => i64::from(vec[index]),
        };
        u32::try_from(value).ok()
    }

    pub(crate) fn set(&mut self, index: usize, value: Option<u32>) {
        match self {
            Self::I8(vec) => vec[index] = value.map_or(-1, |v| v as i8),
            Self::I16(vec) => vec[index] = value.map_or(-1, |v| v as i16),
            Self::I32(vec) => vec[index] = value.map_or(-1, |v| v as i32),
        }
    }

    pub(crate) fn push(&mut self, value: u32) {
        match self {
            Self::I8(vec) => vec.push(value as i8),
            Self::I16(vec) => vec.push(value as i16),
            Self::I32(vec) => vec.push(value as i32),
        }
    }

    pub(crate) fn pop(&mut self) -> Option<u32> {
        let value = match self {
            Self::I8(vec) => vec.pop().map(i64::from),
            Self::I16(vec) => vec.pop().map(i64::from),
            Self::I32(vec) => vec.pop().map(i64::from),
        }?;
        Some(u32::try_from(value).expect("free stack never holds vacancies"))
    }

    /// Re-encodes at a wider cell size when the new capacity demands it.
    pub(crate) fn widen_for(&mut self, capacity: usize) {
        let width = Self::width_holds(capacity);
        match (&*self, width) {
            (Self::I8(vec), 2) => *self = Self::I16(vec.iter().map(|&v| i16::from(v)).collect()),
            (Self::I8(vec), 4) => *self = Self::I32(vec.iter().map(|&v| i32::from(v)).collect()),
            (Self::I16(vec), 4) => *self = Self::I32(vec.iter().map(|&v| i32::from(v)).collect()),
            _ => {}
        }
    }
}

enum Backend {
    /// No data; the shape bit is the whole truth.
    Tag,
    /// `slot == entity id`; columns sized to the entity limit.
    Sparse,
    Packed {
        /// Maps entity id to slot; vacancy for unacquired entities.
        index: SlotList,
        /// Released slots, recycled LIFO.
        free:  SlotList,
        /// High-water slot count.
        len:   u32,
    },
    Compact {
        /// `ids[slot]` is the entity occupying the slot.
        ids: Vec<Option<u32>>,
    },
}

/// One component type's storage: backend bookkeeping plus field columns.
pub(crate) struct Storage {
    backend:              Backend,
    pub(crate) columns:   Vec<Column>,
    capacity:             usize,
    elastic:              bool,
    max_entities:         usize,
    /// Bumped on every elastic reallocation; views bound before a bump are
    /// stale and must be rebound.
    pub(crate) epoch:     u32,
    pub(crate) comp_name: String,
}

impl Storage {
    pub(crate) fn new(info: &TypeInfo, max_entities: usize) -> Self {
        let (initial, elastic) = match info.capacity {
            Capacity::Fixed(n) => (n, false),
            Capacity::Elastic(n) => (n.max(1), true),
        };

        let (backend, capacity) = if info.is_tag() {
            (Backend::Tag, 0)
        } else {
            match info.storage {
                StorageKind::Sparse => (Backend::Sparse, max_entities),
                StorageKind::Packed => {
                    let capacity = initial.min(max_entities).max(1);
                    (
                        Backend::Packed {
                            index: SlotList::vacant(max_entities, capacity),
                            free:  SlotList::stack(capacity),
                            len:   0,
                        },
                        capacity,
                    )
                }
                StorageKind::Compact => {
                    let capacity = initial.min(max_entities).max(1);
                    (Backend::Compact { ids: vec![None; capacity] }, capacity)
                }
            }
        };

        let columns =
            info.fields.iter().map(|field| Column::new(&field.default, capacity)).collect();

        Self {
            backend,
            columns,
            capacity,
            elastic,
            max_entities,
            epoch: 0,
            comp_name: info.name.clone(),
        }
    }

    fn exhausted(&self) -> CheckError {
        CheckError::CapacityExhausted { what: self.comp_name.clone(), capacity: self.capacity }
    }

    /// Doubles the slot capacity, capped at the entity limit.
    fn grow(&mut self, info: &TypeInfo) -> Result<(), CheckError> {
        if !self.elastic || self.capacity >= self.max_entities {
            return Err(self.exhausted());
        }
        self.capacity = (self.capacity * 2).min(self.max_entities);

        for (column, field) in self.columns.iter_mut().zip(&info.fields) {
            column.grow(&field.default, self.capacity);
        }
        match &mut self.backend {
            Backend::Packed { index, free, .. } => {
                index.widen_for(self.capacity);
                free.widen_for(self.capacity);
            }
            Backend::Compact { ids } => ids.resize(self.capacity, None),
            Backend::Tag | Backend::Sparse => unreachable!("tag and sparse storages never grow"),
        }
        self.epoch += 1;
        Ok(())
    }

    /// Allocates a slot for the entity. The slot is stable until released.
    pub(crate) fn acquire(&mut self, entity: u32, info: &TypeInfo) -> Result<u32> {
        match self.backend {
            Backend::Tag => return Ok(0),
            Backend::Sparse => return Ok(entity),
            _ => {}
        }

        let occupied = match &self.backend {
            Backend::Packed { index, .. } => index.get(entity as usize).is_some(),
            Backend::Compact { ids } => ids.contains(&Some(entity)),
            Backend::Tag | Backend::Sparse => unreachable!("handled above"),
        };
        if occupied {
            return Err(
                InternalError::AcquireOccupied { component: self.comp_name.clone(), entity }.into()
            );
        }

        loop {
            let capacity = self.capacity;
            match &mut self.backend {
                Backend::Packed { index, free, len } => {
                    let slot = match free.pop() {
                        Some(slot) => Some(slot),
                        None if (*len as usize) < capacity => {
                            let slot = *len;
                            *len += 1;
                            Some(slot)
                        }
                        None => None,
                    };
                    if let Some(slot) = slot {
                        index.set(entity as usize, Some(slot));
                        return Ok(slot);
                    }
                }
                Backend::Compact { ids } => {
                    if let Some(slot) = ids.iter().position(Option::is_none) {
                        ids[slot] = Some(entity);
                        return Ok(slot as u32);
                    }
                }
                Backend::Tag | Backend::Sparse => unreachable!("handled above"),
            }
            self.grow(info)?;
        }
    }

    /// The slot currently mapped to the entity, if any. For sparse storages
    /// occupancy is tracked by the shape bit, not here.
    pub(crate) fn slot_of(&self, entity: u32) -> Option<u32> {
        match &self.backend {
            Backend::Tag => Some(0),
            Backend::Sparse => Some(entity),
            Backend::Packed { index, .. } => index.get(entity as usize),
            Backend::Compact { ids } => ids
                .iter()
                .position(|id| *id == Some(entity))
                .map(|slot| slot as u32),
        }
    }

    /// Returns the slot to the free list (packed) or clears its id (compact).
    pub(crate) fn release(&mut self, entity: u32) -> Result<()> {
        match &mut self.backend {
            Backend::Tag | Backend::Sparse => Ok(()),
            Backend::Packed { index, free, .. } => match index.get(entity as usize) {
                Some(slot) => {
                    index.set(entity as usize, None);
                    free.push(slot);
                    Ok(())
                }
                None => Err(InternalError::ReleaseUnacquired {
                    component: self.comp_name.clone(),
                    entity,
                }
                .into()),
            },
            Backend::Compact { ids } => match ids.iter().position(|id| *id == Some(entity)) {
                Some(slot) => {
                    ids[slot] = None;
                    Ok(())
                }
                None => Err(InternalError::ReleaseUnacquired {
                    component: self.comp_name.clone(),
                    entity,
                }
                .into()),
            },
        }
    }

    /// Resets every field of a slot to its schema default.
    pub(crate) fn init_default(&mut self, slot: u32, info: &TypeInfo) {
        for (column, field) in self.columns.iter_mut().zip(&info.fields) {
            column
                .set(slot as usize, &field.default)
                .expect("schema default matches column kind");
        }
    }

    pub(crate) fn capacity(&self) -> usize { self.capacity }
}

#[cfg(test)]
mod tests {
    use crate::comp::{Capacity, ComponentDef, FieldKind, Registry, StorageKind};

    use super::*;

    fn storage(kind: StorageKind, capacity: Capacity, max: usize) -> (Registry, Storage) {
        let mut registry = Registry::default();
        let id = registry
            .register(
                ComponentDef::new("C")
                    .storage(kind)
                    .capacity(capacity)
                    .field_default("v", FieldKind::U32),
                StorageKind::Sparse,
            )
            .unwrap();
        let storage = Storage::new(registry.info(id), max);
        (registry, storage)
    }

    #[test]
    fn packed_recycles_slots_lifo() {
        let (registry, mut storage) = storage(StorageKind::Packed, Capacity::Elastic(2), 100);
        let info = registry.info(crate::comp::ComponentId(0));

        let a = storage.acquire(10, info).unwrap();
        let b = storage.acquire(20, info).unwrap();
        assert_eq!((a, b), (0, 1));

        storage.release(10).unwrap();
        let c = storage.acquire(30, info).unwrap();
        assert_eq!(c, 0, "freed slot is reused first");
        assert_eq!(storage.slot_of(30), Some(0));
        assert_eq!(storage.slot_of(10), None);
    }

    #[test]
    fn packed_elastic_grows_and_bumps_epoch() {
        let (registry, mut storage) = storage(StorageKind::Packed, Capacity::Elastic(1), 100);
        let info = registry.info(crate::comp::ComponentId(0));

        storage.acquire(0, info).unwrap();
        assert_eq!(storage.epoch, 0);
        storage.acquire(1, info).unwrap();
        assert_eq!(storage.capacity(), 2);
        assert_eq!(storage.epoch, 1);
    }

    #[test]
    fn packed_fixed_capacity_exhausts() {
        let (registry, mut storage) = storage(StorageKind::Packed, Capacity::Fixed(1), 100);
        let info = registry.info(crate::comp::ComponentId(0));

        storage.acquire(0, info).unwrap();
        let err = storage.acquire(1, info).unwrap_err();
        assert!(matches!(
            err,
            crate::error::Error::Check(CheckError::CapacityExhausted { .. })
        ));
    }

    #[test]
    fn compact_scans_for_first_empty() {
        let (registry, mut storage) = storage(StorageKind::Compact, Capacity::Elastic(2), 100);
        let info = registry.info(crate::comp::ComponentId(0));

        assert_eq!(storage.acquire(5, info).unwrap(), 0);
        assert_eq!(storage.acquire(6, info).unwrap(), 1);
        storage.release(5).unwrap();
        assert_eq!(storage.acquire(7, info).unwrap(), 0);
        assert_eq!(storage.slot_of(6), Some(1));
    }

    #[test]
    fn release_unacquired_is_internal() {
        let (registry, mut storage) = storage(StorageKind::Packed, Capacity::Elastic(2), 100);
        let _ = registry;
        assert!(matches!(
            storage.release(3),
            Err(crate::error::Error::Internal(InternalError::ReleaseUnacquired { .. }))
        ));
    }

    #[test]
    fn slot_list_widens_with_capacity() {
        let mut list = SlotList::vacant(4, 100);
        assert!(matches!(list, SlotList::I8(_)));
        list.set(2, Some(99));

        list.widen_for(1000);
        assert!(matches!(list, SlotList::I16(_)));
        assert_eq!(list.get(2), Some(99));
        assert_eq!(list.get(0), None);
    }
}
