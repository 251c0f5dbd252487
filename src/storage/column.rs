//! Struct-of-arrays field buffers.
//!
//! Each schema field owns one typed column; a slot indexes every column of
//! the component in parallel. Columns are preallocated to the storage
//! capacity and grown wholesale on elastic reallocation.

use crate::comp::{FieldKind, Value};
use crate::entity::Entity;

/// One typed buffer, one cell per slot.
pub(crate) enum Column {
    F32(Vec<f32>),
    F64(Vec<f64>),
    I8(Vec<i8>),
    I16(Vec<i16>),
    I32(Vec<i32>),
    I64(Vec<i64>),
    U8(Vec<u8>),
    U16(Vec<u16>),
    U32(Vec<u32>),
    U64(Vec<u64>),
    Bool(Vec<bool>),
    Ref(Vec<Option<Entity>>),
}

macro_rules! dispatch {
    ($self:expr, $vec:pat => $body:expr) => {
        match $self {
            Column::F32($vec) => $body,
            Column::F64($vec) => $body,
            Column::I8($vec) => $body,
            Column::I16($vec) => $body,
            Column::I32($vec) => $body,
            Column::I64($vec) => $body,
            Column::U8($vec) => $body,
            Column::U16($vec) => $body,
            Column::U32($vec) => $body,
            Column::U64($vec) => $body,
            Column::Bool($vec) => $body,
            Column::Ref($vec) => $body,
        }
    };
}

impl Column {
    /// Allocates a column of `len` cells filled with the field default.
    pub(crate) fn new(default: &Value, len: usize) -> Self {
        match *default {
            Value::F32(v) => Self::F32(vec![v; len]),
            Value::F64(v) => Self::F64(vec![v; len]),
            Value::I8(v) => Self::I8(vec![v; len]),
            Value::I16(v) => Self::I16(vec![v; len]),
            Value::I32(v) => Self::I32(vec![v; len]),
            Value::I64(v) => Self::I64(vec![v; len]),
            Value::U8(v) => Self::U8(vec![v; len]),
            Value::U16(v) => Self::U16(vec![v; len]),
            Value::U32(v) => Self::U32(vec![v; len]),
            Value::U64(v) => Self::U64(vec![v; len]),
            Value::Bool(v) => Self::Bool(vec![v; len]),
            Value::Ref(v) => Self::Ref(vec![v; len]),
        }
    }

    pub(crate) fn kind(&self) -> FieldKind {
        match self {
            Self::F32(_) => FieldKind::F32,
            Self::F64(_) => FieldKind::F64,
            Self::I8(_) => FieldKind::I8,
            Self::I16(_) => FieldKind::I16,
            Self::I32(_) => FieldKind::I32,
            Self::I64(_) => FieldKind::I64,
            Self::U8(_) => FieldKind::U8,
            Self::U16(_) => FieldKind::U16,
            Self::U32(_) => FieldKind::U32,
            Self::U64(_) => FieldKind::U64,
            Self::Bool(_) => FieldKind::Bool,
            Self::Ref(_) => FieldKind::Ref,
        }
    }

    pub(crate) fn len(&self) -> usize { dispatch!(self, vec => vec.len()) }

    /// Extends the column to `len` cells, filling new cells with the default.
    pub(crate) fn grow(&mut self, default: &Value, len: usize) {
        debug_assert_eq!(self.kind(), default.kind(), "column default kind mismatch");
        match (self, default) {
            (Self::F32(vec), Value::F32(v)) => vec.resize(len, *v),
            (Self::F64(vec), Value::F64(v)) => vec.resize(len, *v),
            (Self::I8(vec), Value::I8(v)) => vec.resize(len, *v),
            (Self::I16(vec), Value::I16(v)) => vec.resize(len, *v),
            (Self::I32(vec), Value::I32(v)) => vec.resize(len, *v),
            (Self::I64(vec), Value::I64(v)) => vec.resize(len, *v),
            (Self::U8(vec), Value::U8(v)) => vec.resize(len, *v),
            (Self::U16(vec), Value::U16(v)) => vec.resize(len, *v),
            (Self::U32(vec), Value::U32(v)) => vec.resize(len, *v),
            (Self::U64(vec), Value::U64(v)) => vec.resize(len, *v),
            (Self::Bool(vec), Value::Bool(v)) => vec.resize(len, *v),
            (Self::Ref(vec), Value::Ref(v)) => vec.resize(len, *v),
            _ => unreachable!("column default kind mismatch"),
        }
    }

    pub(crate) fn get(&self, slot: usize) -> Value {
        match self {
            Self::F32(vec) => Value::F32(vec[slot]),
            Self::F64(vec) => Value::F64(vec[slot]),
            Self::I8(vec) => Value::I8(vec[slot]),
            Self::I16(vec) => Value::I16(vec[slot]),
            Self::I32(vec) => Value::I32(vec[slot]),
            Self::I64(vec) => Value::I64(vec[slot]),
            Self::U8(vec) => Value::U8(vec[slot]),
            Self::U16(vec) => Value::U16(vec[slot]),
            Self::U32(vec) => Value::U32(vec[slot]),
            Self::U64(vec) => Value::U64(vec[slot]),
            Self::Bool(vec) => Value::Bool(vec[slot]),
            Self::Ref(vec) => Value::Ref(vec[slot]),
        }
    }

    /// Writes a cell; `Err` signals a kind mismatch, reported by the caller
    /// with schema context.
    pub(crate) fn set(&mut self, slot: usize, value: &Value) -> Result<(), ()> {
        match (self, value) {
            (Self::F32(vec), Value::F32(v)) => vec[slot] = *v,
            (Self::F64(vec), Value::F64(v)) => vec[slot] = *v,
            (Self::I8(vec), Value::I8(v)) => vec[slot] = *v,
            (Self::I16(vec), Value::I16(v)) => vec[slot] = *v,
            (Self::I32(vec), Value::I32(v)) => vec[slot] = *v,
            (Self::I64(vec), Value::I64(v)) => vec[slot] = *v,
            (Self::U8(vec), Value::U8(v)) => vec[slot] = *v,
            (Self::U16(vec), Value::U16(v)) => vec[slot] = *v,
            (Self::U32(vec), Value::U32(v)) => vec[slot] = *v,
            (Self::U64(vec), Value::U64(v)) => vec[slot] = *v,
            (Self::Bool(vec), Value::Bool(v)) => vec[slot] = *v,
            (Self::Ref(vec), Value::Ref(v)) => vec[slot] = *v,
            _ => return Err(()),
        }
        Ok(())
    }

    /// Shorthand for reading a ref cell.
    pub(crate) fn get_ref(&self, slot: usize) -> Option<Entity> {
        match self {
            Self::Ref(vec) => vec[slot],
            _ => unreachable!("get_ref on a non-ref column"),
        }
    }

    /// Shorthand for writing a ref cell.
    pub(crate) fn set_ref(&mut self, slot: usize, value: Option<Entity>) {
        match self {
            Self::Ref(vec) => vec[slot] = value,
            _ => unreachable!("set_ref on a non-ref column"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_fills_defaults_and_grow_preserves() {
        let mut column = Column::new(&Value::U8(7), 2);
        assert_eq!(column.get(1), Value::U8(7));

        column.set(0, &Value::U8(3)).unwrap();
        column.grow(&Value::U8(7), 4);
        assert_eq!(column.get(0), Value::U8(3));
        assert_eq!(column.get(3), Value::U8(7));
        assert_eq!(column.len(), 4);
    }

    #[test]
    fn set_rejects_kind_mismatch() {
        let mut column = Column::new(&Value::F64(0.), 1);
        assert!(column.set(0, &Value::I32(1)).is_err());
        assert_eq!(column.get(0), Value::F64(0.));
    }
}
