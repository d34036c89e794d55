//! Execution context codecs.

use batchrepo_core::ExecutionContext;

use crate::error::{RepositoryError, RepositoryResult};

/// Turns an execution context into bytes and back.
///
/// The repository never looks inside the bytes; swapping the codec only
/// requires that `deserialize(serialize(ctx)) == ctx`.
pub trait ExecutionContextSerializer: Send + Sync {
    fn serialize(&self, context: &ExecutionContext) -> RepositoryResult<Vec<u8>>;

    fn deserialize(&self, bytes: &[u8]) -> RepositoryResult<ExecutionContext>;
}

/// JSON codec, one tagged object per entry:
/// `{"count": {"type": "long", "value": 3}}`.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonExecutionContextSerializer;

impl ExecutionContextSerializer for JsonExecutionContextSerializer {
    fn serialize(&self, context: &ExecutionContext) -> RepositoryResult<Vec<u8>> {
        // serde_json writes NaN and infinities as `null`, which does not read back as a double.
        context
            .validate()
            .map_err(|e| RepositoryError::Serialization(e.to_string()))?;
        serde_json::to_vec(context).map_err(|e| RepositoryError::Serialization(e.to_string()))
    }

    fn deserialize(&self, bytes: &[u8]) -> RepositoryResult<ExecutionContext> {
        serde_json::from_slice(bytes).map_err(|e| RepositoryError::Serialization(e.to_string()))
    }
}
