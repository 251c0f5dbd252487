//! Derives a deterministic linear execution order per system group.
//!
//! Edges come from two sources: explicit `before`/`after` constraints, and
//! an implicit `writer → reader` edge per component type so every reader
//! observes the same-frame effects of every writer in its group. Write–write
//! pairs are not ordered implicitly; only explicit constraints order them.
//! Ties break by registration order, so the plan is stable across runs.

use std::collections::BTreeMap;

use itertools::Itertools;

use crate::error::{CheckError, Error, Result};
use crate::system::Node;

/// The cached topological order of one group.
pub(crate) struct SimplePlan {
    pub(crate) group: u32,
    /// System indices in execution order.
    pub(crate) order: Vec<usize>,
}

/// Builds the plan of every group. Fails with
/// [`CheckError::CycleDetected`] if explicit constraints and entitlement
/// edges form a cycle, and with [`CheckError::ForeignConstraint`] if a
/// constraint crosses groups.
pub(crate) fn build_plans(nodes: &[Node]) -> Result<BTreeMap<u32, SimplePlan>> {
    let mut groups: BTreeMap<u32, Vec<usize>> = BTreeMap::new();
    for (index, node) in nodes.iter().enumerate() {
        groups.entry(node.group).or_default().push(index);
    }

    let mut plans = BTreeMap::new();
    for (&group, members) in &groups {
        let plan = plan_group(nodes, group, members)?;
        log::debug!(
            "group {group} execution order: {}",
            plan.order.iter().map(|&index| nodes[index].name.as_str()).join(" -> "),
        );
        plans.insert(group, plan);
    }
    Ok(plans)
}

fn plan_group(nodes: &[Node], group: u32, members: &[usize]) -> Result<SimplePlan> {
    // edges[a] contains b  <=>  a runs before b
    let mut edges: Vec<Vec<usize>> = vec![Vec::new(); members.len()];
    let mut indegree: Vec<usize> = vec![0; members.len()];
    let local = |index: usize| members.iter().position(|&m| m == index);

    fn add_edge(edges: &mut [Vec<usize>], indegree: &mut [usize], a: usize, b: usize) {
        if a == b || edges[a].contains(&b) {
            return;
        }
        edges[a].push(b);
        indegree[b] += 1;
    }

    // explicit constraints
    for (position, &index) in members.iter().enumerate() {
        let node = &nodes[index];
        for &other in &node.befores {
            let target = local(other.index()).ok_or_else(|| foreign(nodes, index, other.index()))?;
            add_edge(&mut edges, &mut indegree, position, target);
        }
        for &other in &node.afters {
            let source = local(other.index()).ok_or_else(|| foreign(nodes, index, other.index()))?;
            add_edge(&mut edges, &mut indegree, source, position);
        }
    }

    // writers run before readers of the same component type
    let num_components = members
        .first()
        .map_or(0, |&index| nodes[index].reads.len());
    for comp in 0..num_components {
        for (writer_pos, &writer) in members.iter().enumerate() {
            if !nodes[writer].writes[comp] {
                continue;
            }
            for (reader_pos, &reader) in members.iter().enumerate() {
                if nodes[reader].reads[comp] && !nodes[reader].writes[comp] {
                    add_edge(&mut edges, &mut indegree, writer_pos, reader_pos);
                }
            }
        }
    }

    // Kahn's algorithm; the ready pool drains in registration order
    let mut ready: Vec<usize> = indegree
        .iter()
        .enumerate()
        .filter(|(_, &count)| count == 0)
        .map(|(position, _)| position)
        .collect();
    let mut order = Vec::with_capacity(members.len());
    while let Some(position) = ready.first().copied() {
        ready.remove(0);
        order.push(members[position]);
        for &dependent in &edges[position] {
            indegree[dependent] -= 1;
            if indegree[dependent] == 0 {
                let at = ready.partition_point(|&p| p < dependent);
                ready.insert(at, dependent);
            }
        }
    }

    if order.len() != members.len() {
        let stuck = members
            .iter()
            .enumerate()
            .filter(|(position, _)| indegree[*position] > 0)
            .map(|(_, &index)| nodes[index].name.as_str())
            .join(", ");
        return Err(CheckError::CycleDetected { group, systems: stuck }.into());
    }

    Ok(SimplePlan { group, order })
}

fn foreign(nodes: &[Node], system: usize, other: usize) -> Error {
    CheckError::ForeignConstraint {
        system: nodes[system].name.clone(),
        other:  nodes.get(other).map_or_else(|| format!("#{other}"), |node| node.name.clone()),
    }
    .into()
}
