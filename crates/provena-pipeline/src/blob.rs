//! Opaque byte payload data

use crate::data::{Data, DataCore, DataType};
use crate::storage::FetchContext;

/// Data holding an opaque byte payload, stored verbatim
#[derive(Debug)]
pub struct BlobData {
    core: DataCore,
    bytes: Option<Vec<u8>>,
}

impl BlobData {
    pub fn new(data_type: impl Into<DataType>, bytes: Vec<u8>) -> Self {
        Self {
            core: DataCore::new(data_type),
            bytes: Some(bytes),
        }
    }

    /// Invalid data waiting to be fetched or computed
    pub fn empty(data_type: impl Into<DataType>) -> Self {
        Self {
            core: DataCore::new(data_type),
            bytes: None,
        }
    }

    pub fn with_dependencies<I, T>(mut self, dependencies: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<DataType>,
    {
        self.core = self.core.with_dependencies(dependencies);
        self
    }

    pub fn bytes(&self) -> Option<&[u8]> {
        self.bytes.as_deref()
    }

    pub fn set_bytes(&mut self, bytes: Vec<u8>) {
        self.bytes = Some(bytes);
        self.core.touch();
    }
}

impl Data for BlobData {
    fn core(&self) -> &DataCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut DataCore {
        &mut self.core
    }

    fn is_valid(&self) -> bool {
        self.bytes.is_some()
    }

    fn invalidate(&mut self) {
        self.bytes = None;
    }

    fn fetch_data_impl(&mut self, context: &FetchContext) -> bool {
        match context.read() {
            Ok(bytes) => {
                self.bytes = Some(bytes);
                true
            }
            Err(e) => {
                tracing::debug!(key = context.key(), "fetch failed: {}", e);
                false
            }
        }
    }

    fn snapshot(&self) -> Option<Vec<u8>> {
        self.bytes.clone()
    }

    fn memory_usage(&self) -> usize {
        self.bytes.as_ref().map_or(0, Vec::len)
    }
}
