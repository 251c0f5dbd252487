//! Reverse edges of `ref` fields, used to null out dangling references.
//!
//! Every `Some(target)` stored in a ref field registers a back edge
//! `(source entity, component, field seq) → target`. Deleting the target
//! drains its edge list and nulls each source field. Typical in-degree is
//! low, so each list is a small flat vec.

use std::collections::HashMap;

use crate::comp::ComponentId;
use crate::entity::Entity;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct BackRef {
    pub(crate) source: Entity,
    pub(crate) comp:   ComponentId,
    pub(crate) field:  u16,
}

#[derive(Default)]
pub(crate) struct RefGraph {
    inbound: HashMap<u32, Vec<BackRef>>,
}

impl RefGraph {
    pub(crate) fn link(&mut self, target: Entity, source: Entity, comp: ComponentId, field: u16) {
        self.inbound.entry(target.id).or_default().push(BackRef { source, comp, field });
    }

    pub(crate) fn unlink(&mut self, target: Entity, source: Entity, comp: ComponentId, field: u16) {
        let edges = self.inbound.get_mut(&target.id).expect("unlink of unregistered back ref");
        let needle = BackRef { source, comp, field };
        let position =
            edges.iter().position(|edge| *edge == needle).expect("unlink of unregistered back ref");
        edges.swap_remove(position);
        if edges.is_empty() {
            self.inbound.remove(&target.id);
        }
    }

    /// Drains all edges pointing at the entity, for the deletion sweep.
    pub(crate) fn take_inbound(&mut self, target: Entity) -> Vec<BackRef> {
        self.inbound.remove(&target.id).unwrap_or_default()
    }

    /// Number of live references to the entity.
    pub(crate) fn inbound_count(&self, target: Entity) -> usize {
        self.inbound.get(&target.id).map_or(0, Vec::len)
    }
}

#[cfg(test)]
mod tests {
    use std::num::NonZeroU32;

    use super::*;

    fn entity(id: u32) -> Entity {
        Entity { id, generation: NonZeroU32::new(1).expect("1 != 0") }
    }

    #[test]
    fn link_unlink_roundtrip() {
        let mut graph = RefGraph::default();
        let (source, target) = (entity(1), entity(2));

        graph.link(target, source, ComponentId(0), 0);
        assert_eq!(graph.inbound_count(target), 1);

        graph.unlink(target, source, ComponentId(0), 0);
        assert_eq!(graph.inbound_count(target), 0);
    }

    #[test]
    fn take_inbound_drains_all_edges() {
        let mut graph = RefGraph::default();
        let target = entity(9);
        graph.link(target, entity(1), ComponentId(0), 0);
        graph.link(target, entity(2), ComponentId(1), 3);

        let edges = graph.take_inbound(target);
        assert_eq!(edges.len(), 2);
        assert_eq!(graph.inbound_count(target), 0);
    }
}
