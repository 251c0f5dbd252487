//! Assembles a world from component and system registrations.

use indexmap::IndexSet;

use crate::comp::{ComponentDef, ComponentId, Registry};
use crate::coroutine::Engine;
use crate::entity::refs::RefGraph;
use crate::entity::shape::ShapeTable;
use crate::entity::Allocator;
use crate::error::{CheckError, Result};
use crate::scheduler;
use crate::storage::Storage;
use crate::system::query::Declarations;
use crate::system::{Control, Node, SystemDef, SystemId};
use crate::world::{State, World, WorldOptions};

/// Builds a world. Component and system registration happens here; once
/// [`build`](Self::build) resolves the execution plans, the set is frozen.
pub struct Builder {
    options:  WorldOptions,
    registry: Registry,
    systems:  Vec<SystemDef>,
    names:    IndexSet<String>,
}

impl Builder {
    pub(crate) fn new(options: WorldOptions) -> Self {
        Self { options, registry: Registry::default(), systems: Vec::new(), names: IndexSet::new() }
    }

    /// Registers a component type, consuming its def. Returns the id used
    /// for every later access to the type.
    pub fn register_component(&mut self, def: ComponentDef) -> Result<ComponentId> {
        self.registry.register(def, self.options.default_storage)
    }

    /// Registers a system instance. Returns the id usable in `before`/`after`
    /// constraints of later registrations.
    pub fn register_system(&mut self, def: SystemDef) -> Result<SystemId> {
        if !self.names.insert(def.name.clone()) {
            return Err(CheckError::DuplicateName { name: def.name }.into());
        }
        let id = SystemId(self.systems.len() as u32);
        self.systems.push(def);
        Ok(id)
    }

    /// Resolves queries and execution plans and produces the world in its
    /// setup state. Schedule cycles are fatal here.
    pub fn build(self) -> Result<World> {
        let Self { options, registry, systems, names: _ } = self;
        let num_components = registry.len();
        let num_systems = systems.len();

        let storages: Vec<Storage> =
            registry.types.iter().map(|info| Storage::new(info, options.max_entities)).collect();

        let mut nodes: Vec<Node> =
            systems.into_iter().map(|def| Node::new(def, num_components)).collect();

        // constraint targets must be systems this builder issued
        for node in &nodes {
            for other in node.befores.iter().chain(&node.afters) {
                if other.index() >= num_systems {
                    return Err(CheckError::UnknownId { what: "system", id: other.0 }.into());
                }
            }
        }

        // the declare pass: each system builds its queries and entitlements
        let mut queries = Vec::new();
        for (index, node) in nodes.iter_mut().enumerate() {
            let mut instance = node.instance.take().expect("instance present before declare");
            let mut decl = Declarations {
                system: index as u32,
                num_components,
                max_entities: options.max_entities,
                node: &mut *node,
                queries: &mut queries,
            };
            instance.declare(&mut decl);
            node.instance = Some(instance);
        }

        let plans = scheduler::build_plans(&nodes)?;
        log::debug!(
            "world built: {num_components} component types, {num_systems} systems, {} groups",
            plans.len(),
        );

        Ok(World {
            shapes: ShapeTable::new(options.max_entities, num_components),
            alloc: Allocator::new(options.max_entities),
            coroutines: Engine::new(num_systems),
            options,
            state: State::Setup,
            components: registry,
            storages,
            refs: RefGraph::default(),
            nodes,
            plans,
            queries,
            clock: Default::default(),
            deferred: Default::default(),
            pending_control: Control::default(),
            build_log: None,
        })
    }
}
