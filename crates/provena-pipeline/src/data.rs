//! Typed data held by outputs

use std::any::Any;
use std::fmt;
use std::sync::{Arc, Weak};

use serde::{Deserialize, Serialize};

use crate::output::Output;
use crate::storage::FetchContext;
use crate::timestamp::{next_timestamp, TimeStamp};
use provena_core::{Bounds, PipelineError, Spacing};

/// Tag identifying a kind of data within an output, e.g. `"Raster"`
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DataType(String);

impl DataType {
    pub fn new(tag: impl Into<String>) -> Self {
        Self(tag.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DataType {
    fn from(tag: &str) -> Self {
        Self::new(tag)
    }
}

/// State shared by every [`Data`] implementation
#[derive(Debug)]
pub struct DataCore {
    data_type: DataType,
    timestamp: TimeStamp,
    dependencies: Vec<DataType>,
    edited_regions: Vec<Bounds>,
    fetch: Option<FetchContext>,
    needs_fetch: bool,
    output: Weak<Output>,
}

impl DataCore {
    pub fn new(data_type: impl Into<DataType>) -> Self {
        Self {
            data_type: data_type.into(),
            timestamp: next_timestamp(),
            dependencies: Vec::new(),
            edited_regions: Vec::new(),
            fetch: None,
            needs_fetch: false,
            output: Weak::new(),
        }
    }

    pub fn with_dependencies<I, T>(mut self, dependencies: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<DataType>,
    {
        for dependency in dependencies {
            self.add_dependency(dependency.into());
        }
        self
    }

    pub fn data_type(&self) -> &DataType {
        &self.data_type
    }

    pub fn timestamp(&self) -> TimeStamp {
        self.timestamp
    }

    /// Record a modification
    pub fn touch(&mut self) {
        self.timestamp = next_timestamp();
    }

    pub fn dependencies(&self) -> &[DataType] {
        &self.dependencies
    }

    pub fn add_dependency(&mut self, dependency: DataType) {
        if !self.dependencies.contains(&dependency) {
            self.dependencies.push(dependency);
        }
    }

    pub fn remove_dependency(&mut self, dependency: &DataType) -> Result<(), PipelineError> {
        let position = self
            .dependencies
            .iter()
            .position(|d| d == dependency)
            .ok_or_else(|| PipelineError::UnknownDependency {
                data_type: self.data_type.to_string(),
                dependency: dependency.to_string(),
            })?;
        self.dependencies.remove(position);
        Ok(())
    }

    pub fn edited_regions(&self) -> &[Bounds] {
        &self.edited_regions
    }

    /// Record an edited region. Inverted bounds are ignored.
    pub fn add_edited_region(&mut self, region: Bounds) {
        if !region.are_valid() {
            tracing::warn!(data_type = %self.data_type, "ignoring invalid edited region {:?}", region.0);
            return;
        }
        self.edited_regions.push(region);
    }

    pub fn set_edited_regions(&mut self, regions: Vec<Bounds>) {
        self.edited_regions = regions;
    }

    pub fn clear_edited_regions(&mut self) {
        self.edited_regions.clear();
    }

    pub fn is_edited(&self) -> bool {
        !self.edited_regions.is_empty()
    }

    /// Arm the data to fetch its content from storage on the next update
    pub fn set_fetch_context(&mut self, context: FetchContext) {
        self.fetch = Some(context);
        self.needs_fetch = true;
    }

    pub fn fetch_context(&self) -> Option<&FetchContext> {
        self.fetch.as_ref()
    }

    pub fn needs_fetch(&self) -> bool {
        self.needs_fetch && self.fetch.is_some()
    }

    /// Output holding this data, while it is alive
    pub fn output(&self) -> Option<Arc<Output>> {
        self.output.upgrade()
    }

    pub(crate) fn set_output(&mut self, output: Weak<Output>) {
        self.output = output;
    }
}

/// Upcast helper so trait objects can be downcast to their concrete type
pub trait AsAny {
    fn as_any(&self) -> &dyn Any;
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

impl<T: Any> AsAny for T {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// One cached representation inside an output
pub trait Data: AsAny + Send + Sync + 'static {
    fn core(&self) -> &DataCore;

    fn core_mut(&mut self) -> &mut DataCore;

    /// Content is present and current
    fn is_valid(&self) -> bool;

    /// Drop derived content so the data has to be regenerated
    fn invalidate(&mut self);

    /// Load content from storage. Returns whether the data became valid.
    fn fetch_data_impl(&mut self, context: &FetchContext) -> bool;

    /// Serialized content, or `None` when there is nothing to store
    fn snapshot(&self) -> Option<Vec<u8>>;

    fn data_type(&self) -> DataType {
        self.core().data_type().clone()
    }

    /// Other data types whose refresh may make this data derivable
    fn dependencies(&self) -> Vec<DataType> {
        self.core().dependencies().to_vec()
    }

    /// Fetch from storage if armed to. Each fetch context is tried once.
    fn fetch_data(&mut self) -> bool {
        if !self.core().needs_fetch() {
            return false;
        }
        let Some(context) = self.core().fetch_context().cloned() else {
            return false;
        };

        let fetched = self.fetch_data_impl(&context);
        let core = self.core_mut();
        core.needs_fetch = false;
        if fetched {
            core.touch();
        }
        fetched
    }

    fn edited_regions_snapshot(&self) -> Vec<Bounds> {
        self.core().edited_regions().to_vec()
    }

    fn restore_edited_regions(&mut self, regions: Vec<Bounds>) {
        self.core_mut().set_edited_regions(regions);
    }

    /// Spacing changes invalidate derived content unless overridden
    fn set_spacing(&mut self, _spacing: Spacing) {
        self.invalidate();
        self.core_mut().touch();
    }

    /// Approximate heap usage in bytes
    fn memory_usage(&self) -> usize {
        0
    }
}

impl dyn Data {
    pub fn downcast_ref<T: Data>(&self) -> Option<&T> {
        self.as_any().downcast_ref::<T>()
    }

    pub fn downcast_mut<T: Data>(&mut self) -> Option<&mut T> {
        self.as_any_mut().downcast_mut::<T>()
    }
}

impl fmt::Debug for dyn Data {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Data")
            .field("data_type", self.core().data_type())
            .field("valid", &self.is_valid())
            .field("timestamp", &self.core().timestamp())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blob::BlobData;
    use crate::storage::{DirStorage, TemporalStorage};
    use tempfile::TempDir;

    #[test]
    fn test_dependencies() {
        let mut core = DataCore::new("Mesh").with_dependencies(["Raster", "Raster"]);
        assert_eq!(core.dependencies(), &[DataType::from("Raster")]);

        core.add_dependency(DataType::from("Skeleton"));
        core.remove_dependency(&DataType::from("Raster")).unwrap();
        assert_eq!(core.dependencies(), &[DataType::from("Skeleton")]);
    }

    #[test]
    fn test_remove_unknown_dependency_fails() {
        let mut core = DataCore::new("Mesh");
        let err = core.remove_dependency(&DataType::from("Raster")).unwrap_err();
        assert!(matches!(
            err,
            PipelineError::UnknownDependency { ref data_type, ref dependency }
                if data_type == "Mesh" && dependency == "Raster"
        ));
    }

    #[test]
    fn test_edited_regions() {
        let mut core = DataCore::new("Raster");
        assert!(!core.is_edited());

        core.add_edited_region(Bounds::new(0.0, 1.0, 1.0, 0.0, 0.0, 1.0));
        assert!(!core.is_edited());

        core.add_edited_region(Bounds::new(0.0, 1.0, 0.0, 1.0, 0.0, 1.0));
        assert!(core.is_edited());
        assert_eq!(core.edited_regions().len(), 1);

        core.clear_edited_regions();
        assert!(!core.is_edited());
    }

    #[test]
    fn test_fetch_is_attempted_once() {
        let temp = TempDir::new().unwrap();
        let storage: Arc<dyn TemporalStorage> = Arc::new(DirStorage::new(temp.path()));
        let mut data: Box<dyn Data> = Box::new(BlobData::empty("Raster"));

        assert!(!data.fetch_data());

        data.core_mut()
            .set_fetch_context(FetchContext::new(storage.clone(), "Filters/x/Raster_0"));
        assert!(data.core().needs_fetch());
        assert!(!data.fetch_data());
        assert!(!data.core().needs_fetch());

        storage.write("Filters/x/Raster_0", b"abc").unwrap();
        assert!(!data.fetch_data());

        data.core_mut()
            .set_fetch_context(FetchContext::new(storage, "Filters/x/Raster_0"));
        let before = data.core().timestamp();
        assert!(data.fetch_data());
        assert!(data.is_valid());
        assert!(data.core().timestamp() > before);
    }

    #[test]
    fn test_downcast() {
        let mut data: Box<dyn Data> = Box::new(BlobData::new("Raster", vec![1, 2, 3]));

        assert!(data.downcast_ref::<BlobData>().is_some());
        data.downcast_mut::<BlobData>().unwrap().set_bytes(vec![4]);
        assert_eq!(data.downcast_ref::<BlobData>().unwrap().bytes(), Some(&[4u8][..]));
    }

    #[test]
    fn test_set_spacing_invalidates() {
        let mut data = BlobData::new("Raster", vec![1]);
        assert!(data.is_valid());
        data.set_spacing(Spacing::new(2.0, 2.0, 2.0));
        assert!(!data.is_valid());
    }
}
