use tokio_postgres::types::Type;
use tokio_util::bytes::Bytes;

use crate::codec::FORMAT_BINARY;

/// Encoded parameters in the shape the wire protocol wants: parallel type,
/// value, length and format arrays.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParameterBuffer {
    types: Vec<Type>,
    values: Vec<Option<Bytes>>,
}

impl ParameterBuffer {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, ty: Type, value: Option<Bytes>) {
        self.types.push(ty);
        self.values.push(value);
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.types.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.types.is_empty()
    }

    #[must_use]
    pub fn types(&self) -> &[Type] {
        &self.types
    }

    #[must_use]
    pub fn type_oids(&self) -> Vec<u32> {
        self.types.iter().map(Type::oid).collect()
    }

    #[must_use]
    pub fn values(&self) -> &[Option<Bytes>] {
        &self.values
    }

    /// Byte lengths, `-1` for NULL.
    #[must_use]
    pub fn lengths(&self) -> Vec<i32> {
        self.values
            .iter()
            .map(|v| {
                v.as_ref()
                    .map_or(-1, |b| i32::try_from(b.len()).unwrap_or(i32::MAX))
            })
            .collect()
    }

    /// Every parameter is sent in binary.
    #[must_use]
    pub fn formats(&self) -> Vec<i16> {
        vec![FORMAT_BINARY; self.types.len()]
    }

    /// Lay the buffer out so that entry `k` is the parameter at `order[k]`;
    /// positions not named in `order` follow in their original order.
    #[must_use]
    pub fn reordered(&self, order: &[usize]) -> ParameterBuffer {
        let mut taken = vec![false; self.len()];
        let mut out = ParameterBuffer::new();
        for &idx in order {
            if idx < self.len() && !taken[idx] {
                taken[idx] = true;
                out.push(self.types[idx].clone(), self.values[idx].clone());
            }
        }
        for (idx, used) in taken.iter().enumerate() {
            if !used {
                out.push(self.types[idx].clone(), self.values[idx].clone());
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn buffer() -> ParameterBuffer {
        let mut buf = ParameterBuffer::new();
        buf.push(Type::INT8, Some(Bytes::from_static(&[0, 0, 0, 0, 0, 0, 0, 1])));
        buf.push(Type::TEXT, None);
        buf.push(Type::BOOL, Some(Bytes::from_static(&[1])));
        buf
    }

    #[test]
    fn lengths_mark_null() {
        assert_eq!(buffer().lengths(), vec![8, -1, 1]);
        assert_eq!(buffer().formats(), vec![1, 1, 1]);
        assert_eq!(buffer().type_oids(), vec![20, 25, 16]);
    }

    #[test]
    fn reorder_puts_referenced_first() {
        let out = buffer().reordered(&[2, 0]);
        assert_eq!(out.types(), &[Type::BOOL, Type::INT8, Type::TEXT]);
        assert_eq!(out.lengths(), vec![1, 8, -1]);
    }

    #[test]
    fn identity_order_is_noop() {
        assert_eq!(buffer().reordered(&[]), buffer());
        assert_eq!(buffer().reordered(&[0, 1, 2]), buffer());
    }
}
