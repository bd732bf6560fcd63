/// A single write inside a [`WriteBatch`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchOp {
    Set { key: String, value: Vec<u8> },
    Delete { key: String },
}

impl BatchOp {
    pub fn key(&self) -> &str {
        match self {
            BatchOp::Set { key, .. } | BatchOp::Delete { key } => key,
        }
    }
}

/// Ordered list of writes applied atomically by [`crate::KVStore::write`].
///
/// Operations are applied in insertion order, so a later set of the same
/// key wins over an earlier delete and vice versa.
#[derive(Debug, Clone, Default)]
pub struct WriteBatch {
    ops: Vec<BatchOp>,
}

impl WriteBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, key: &str, value: Vec<u8>) -> &mut Self {
        self.ops.push(BatchOp::Set {
            key: key.to_string(),
            value,
        });
        self
    }

    pub fn delete(&mut self, key: &str) -> &mut Self {
        self.ops.push(BatchOp::Delete {
            key: key.to_string(),
        });
        self
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn ops(&self) -> &[BatchOp] {
        &self.ops
    }

    pub fn into_ops(self) -> Vec<BatchOp> {
        self.ops
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn batch_keeps_insertion_order() {
        let mut batch = WriteBatch::new();
        batch.set("a", b"1".to_vec()).delete("a").set("b", b"2".to_vec());

        let keys: Vec<&str> = batch.ops().iter().map(|op| op.key()).collect();
        assert_eq!(keys, vec!["a", "a", "b"]);
        assert!(matches!(batch.ops()[1], BatchOp::Delete { .. }));
        assert_eq!(batch.len(), 3);
    }

    #[test]
    fn empty_batch() {
        let batch = WriteBatch::new();
        assert!(batch.is_empty());
        assert!(batch.into_ops().is_empty());
    }
}
