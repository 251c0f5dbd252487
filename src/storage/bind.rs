//! Read and write views over one bound component instance.
//!
//! Views are cheap, short-lived handles over the current slot; the borrow
//! they hold on the world keeps them from being retained across suspension
//! points, and elastic reallocation bumps the storage epoch so a logically
//! stale rebind is detectable in assertions.

use crate::comp::{ComponentId, FieldKind, TypeInfo, Value};
use crate::entity::refs::RefGraph;
use crate::entity::{Allocator, Entity};
use crate::error::{CheckError, Result};
use crate::storage::column::Column;

/// A read-only view of one component instance.
pub struct CompRead<'w> {
    pub(crate) info:    &'w TypeInfo,
    pub(crate) columns: &'w [Column],
    pub(crate) slot:    usize,
}

impl CompRead<'_> {
    /// Reads a field by name.
    pub fn get(&self, field: &str) -> Result<Value> {
        let def = self.info.resolve(field)?;
        Ok(self.columns[def.seq as usize].get(self.slot))
    }

    /// Reads a `ref` field.
    pub fn entity_ref(&self, field: &str) -> Result<Option<Entity>> {
        let def = self.info.resolve(field)?;
        if def.kind != FieldKind::Ref {
            return Err(CheckError::FieldType {
                component: self.info.name.clone(),
                field:     field.to_owned(),
                expected:  def.kind.name(),
                actual:    FieldKind::Ref.name(),
            }
            .into());
        }
        Ok(self.columns[def.seq as usize].get_ref(self.slot))
    }
}

/// A writable view of one component instance.
///
/// Ref-field writes keep the reverse-edge graph in sync, so deleting the
/// referenced entity can null this field out again.
pub struct CompWrite<'w> {
    pub(crate) info:    &'w TypeInfo,
    pub(crate) columns: &'w mut Vec<Column>,
    pub(crate) slot:    usize,
    pub(crate) refs:    &'w mut RefGraph,
    pub(crate) alloc:   &'w Allocator,
    pub(crate) source:  Entity,
    pub(crate) comp:    ComponentId,
}

impl CompWrite<'_> {
    /// Reads a field by name.
    pub fn get(&self, field: &str) -> Result<Value> {
        let def = self.info.resolve(field)?;
        Ok(self.columns[def.seq as usize].get(self.slot))
    }

    /// Reads a `ref` field.
    pub fn entity_ref(&self, field: &str) -> Result<Option<Entity>> {
        let def = self.info.resolve(field)?;
        if def.kind != FieldKind::Ref {
            return Err(CheckError::FieldType {
                component: self.info.name.clone(),
                field:     field.to_owned(),
                expected:  def.kind.name(),
                actual:    FieldKind::Ref.name(),
            }
            .into());
        }
        Ok(self.columns[def.seq as usize].get_ref(self.slot))
    }

    /// Writes a field by name.
    pub fn set(&mut self, field: &str, value: Value) -> Result<()> {
        let def = self.info.resolve(field)?;
        let column = &mut self.columns[def.seq as usize];

        if def.kind == FieldKind::Ref {
            let target = match value {
                Value::Ref(target) => target,
                other => {
                    return Err(CheckError::FieldType {
                        component: self.info.name.clone(),
                        field:     field.to_owned(),
                        expected:  FieldKind::Ref.name(),
                        actual:    other.kind().name(),
                    }
                    .into())
                }
            };
            if let Some(target) = target {
                self.alloc.check(target)?;
            }

            let old = column.get_ref(self.slot);
            if old != target {
                if let Some(old) = old {
                    self.refs.unlink(old, self.source, self.comp, def.seq);
                }
                if let Some(new) = target {
                    self.refs.link(new, self.source, self.comp, def.seq);
                }
                column.set_ref(self.slot, target);
            }
            return Ok(());
        }

        column.set(self.slot, &value).map_err(|()| {
            CheckError::FieldType {
                component: self.info.name.clone(),
                field:     field.to_owned(),
                expected:  def.kind.name(),
                actual:    value.kind().name(),
            }
            .into()
        })
    }
}
