//! The shape table: one bit stripe per entity, one bit per component type.
//!
//! All "has component" queries are word-level tests against this table; the
//! lifecycle code is the only writer.

use bitvec::slice::BitSlice;
use bitvec::vec::BitVec;

use crate::comp::ComponentId;

pub(crate) struct ShapeTable {
    bits:   BitVec,
    stripe: usize,
}

impl ShapeTable {
    pub(crate) fn new(max_entities: usize, num_components: usize) -> Self {
        Self { bits: BitVec::repeat(false, max_entities * num_components), stripe: num_components }
    }

    fn offset(&self, entity: usize, comp: ComponentId) -> usize {
        debug_assert!(comp.index() < self.stripe, "component id out of stripe");
        entity * self.stripe + comp.index()
    }

    pub(crate) fn set(&mut self, entity: usize, comp: ComponentId, present: bool) {
        let offset = self.offset(entity, comp);
        self.bits.set(offset, present);
    }

    pub(crate) fn has(&self, entity: usize, comp: ComponentId) -> bool {
        self.bits[self.offset(entity, comp)]
    }

    /// The bit stripe of one entity, indexed by component id.
    pub(crate) fn stripe(&self, entity: usize) -> &BitSlice {
        &self.bits[entity * self.stripe..(entity + 1) * self.stripe]
    }

    pub(crate) fn clear_entity(&mut self, entity: usize) {
        let start = entity * self.stripe;
        self.bits[start..start + self.stripe].fill(false);
    }

    pub(crate) fn count(&self, entity: usize) -> usize { self.stripe(entity).count_ones() }

    /// Component ids present on the entity, ascending.
    pub(crate) fn present(&self, entity: usize) -> impl Iterator<Item = ComponentId> + '_ {
        self.stripe(entity).iter_ones().map(|index| ComponentId(index as u32))
    }
}
