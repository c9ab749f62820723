//! Filter outputs and on-demand data resolution

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::{ReentrantMutex, ReentrantMutexGuard, RwLock};
use tracing::{debug, trace};

use crate::data::{Data, DataType};
use crate::filter::Filter;
use crate::snapshot::{DataManifest, OutputManifest};
use crate::storage::{checksum, data_key, FetchContext, TemporalStorage};
use crate::timestamp::{next_timestamp, TimeStamp};
use provena_core::{PipelineError, Spacing, StorageError};

/// Index of an output within its filter
pub type OutputId = u32;

/// Shared, lockable handle to one data object
pub type DataRef = Arc<RwLock<Box<dyn Data>>>;

/// Named result slot of a filter, holding one data object per type
pub struct Output {
    id: OutputId,
    filter: Weak<Filter>,
    this: Weak<Output>,
    spacing: RwLock<Spacing>,
    timestamp: AtomicU64,
    data: RwLock<BTreeMap<DataType, DataRef>>,
    update_lock: ReentrantMutex<()>,
}

impl Output {
    /// Create an output. Outputs without an owning filter cannot recompute
    /// missing data.
    pub fn new(filter: Weak<Filter>, id: OutputId, spacing: Spacing) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            id,
            filter,
            this: this.clone(),
            spacing: RwLock::new(spacing),
            timestamp: AtomicU64::new(next_timestamp()),
            data: RwLock::new(BTreeMap::new()),
            update_lock: ReentrantMutex::new(()),
        })
    }

    pub fn id(&self) -> OutputId {
        self.id
    }

    pub fn filter(&self) -> Option<Arc<Filter>> {
        self.filter.upgrade()
    }

    pub fn spacing(&self) -> Spacing {
        *self.spacing.read()
    }

    /// Change the spacing of the output and every data it holds
    pub fn set_spacing(&self, spacing: Spacing) {
        *self.spacing.write() = spacing;
        for data in self.datas() {
            data.write().set_spacing(spacing);
        }
        self.touch();
    }

    /// Timestamp of the last modification
    pub fn last_modified(&self) -> TimeStamp {
        self.timestamp.load(Ordering::Acquire)
    }

    /// Never moves the timestamp backwards when touched concurrently
    pub(crate) fn touch(&self) {
        self.timestamp.fetch_max(next_timestamp(), Ordering::AcqRel);
    }

    /// Store `data`, replacing any data of the same type
    pub fn set_data<D: Data>(&self, data: D) -> DataRef {
        self.set_boxed_data(Box::new(data))
    }

    pub fn set_boxed_data(&self, mut data: Box<dyn Data>) -> DataRef {
        data.core_mut().set_output(self.this.clone());
        let data_type = data.data_type();
        let entry: DataRef = Arc::new(RwLock::new(data));
        self.data.write().insert(data_type, Arc::clone(&entry));
        self.touch();
        entry
    }

    pub fn remove_data(&self, data_type: &DataType) -> Result<DataRef, PipelineError> {
        let removed = self
            .data
            .write()
            .remove(data_type)
            .ok_or_else(|| self.unknown_type(data_type))?;
        self.touch();
        Ok(removed)
    }

    pub fn has_data(&self, data_type: &DataType) -> bool {
        self.data.read().contains_key(data_type)
    }

    pub fn data(&self, data_type: &DataType) -> Option<DataRef> {
        self.data.read().get(data_type).cloned()
    }

    pub fn data_types(&self) -> Vec<DataType> {
        self.data.read().keys().cloned().collect()
    }

    pub fn datas(&self) -> Vec<DataRef> {
        self.data.read().values().cloned().collect()
    }

    /// Number of valid data objects
    pub fn number_of_datas(&self) -> usize {
        self.datas().iter().filter(|data| data.read().is_valid()).count()
    }

    /// Holds at least one data object and all of them are valid
    pub fn is_valid(&self) -> bool {
        let datas = self.datas();
        !datas.is_empty() && datas.iter().all(|data| data.read().is_valid())
    }

    pub fn is_edited(&self) -> bool {
        self.datas().iter().any(|data| data.read().core().is_edited())
    }

    pub fn clear_edited_regions(&self) {
        for data in self.datas() {
            data.write().core_mut().clear_edited_regions();
        }
    }

    pub fn memory_usage(&self) -> usize {
        self.datas().iter().map(|data| data.read().memory_usage()).sum()
    }

    /// Run `f` on the data of `data_type` if it is a `T`
    pub fn read_data<T: Data, R>(&self, data_type: &DataType, f: impl FnOnce(&T) -> R) -> Option<R> {
        let entry = self.data(data_type)?;
        let data = entry.read();
        data.downcast_ref::<T>().map(f)
    }

    /// Run `f` on the data of `data_type` if it is a `T`, recording a
    /// modification
    pub fn write_data<T: Data, R>(
        &self,
        data_type: &DataType,
        f: impl FnOnce(&mut T) -> R,
    ) -> Option<R> {
        let entry = self.data(data_type)?;
        let mut data = entry.write();
        let result = data.downcast_mut::<T>().map(f)?;
        data.core_mut().touch();
        drop(data);
        self.touch();
        Some(result)
    }

    /// Make every data of the output valid. An empty output asks its filter
    /// to produce it.
    pub fn update(&self) -> Result<bool, PipelineError> {
        let _guard = self.update_lock.lock();

        let data_types = self.data_types();
        if data_types.is_empty() {
            return self.update_from_filter(None);
        }

        let mut valid = true;
        for data_type in &data_types {
            valid &= self.update_data(data_type)?;
        }
        Ok(valid)
    }

    /// Make the data of `data_type` valid, returning whether it is.
    ///
    /// Tries memory, then storage. Data declaring dependencies gets them
    /// refreshed and is checked once more; data without dependencies is
    /// regenerated by a full update of the owning filter. Dependencies must
    /// not form a cycle.
    pub fn update_data(&self, data_type: &DataType) -> Result<bool, PipelineError> {
        let mut guard = self.update_lock.lock();

        if self.resolve_locally(data_type)? {
            return Ok(true);
        }

        let dependencies = self.require(data_type)?.read().dependencies();
        if dependencies.is_empty() {
            return self.update_from_filter(Some(data_type));
        }

        debug!(
            output = self.id,
            data_type = %data_type,
            "refreshing {} dependencies",
            dependencies.len()
        );
        ReentrantMutexGuard::unlocked(&mut guard, || {
            for dependency in &dependencies {
                match self.update_data(dependency) {
                    Ok(true) => {}
                    Ok(false) => {
                        debug!(output = self.id, dependency = %dependency, "dependency still invalid")
                    }
                    Err(e) => debug!(output = self.id, dependency = %dependency, "skipping dependency: {}", e),
                }
            }
        });

        let valid = self.resolve_locally(data_type)?;
        if !valid {
            debug!(output = self.id, data_type = %data_type, "still invalid after dependency refresh");
        }
        Ok(valid)
    }

    fn require(&self, data_type: &DataType) -> Result<DataRef, PipelineError> {
        self.data(data_type)
            .ok_or_else(|| self.unknown_type(data_type))
    }

    fn unknown_type(&self, data_type: &DataType) -> PipelineError {
        PipelineError::UnknownDataType {
            output: self.id,
            data_type: data_type.to_string(),
        }
    }

    /// Memory hit or storage hit
    fn resolve_locally(&self, data_type: &DataType) -> Result<bool, PipelineError> {
        let data = self.require(data_type)?;

        if data.read().is_valid() {
            trace!(output = self.id, data_type = %data_type, "memory hit");
            return Ok(true);
        }

        let fetched = data.write().fetch_data();
        if fetched {
            debug!(output = self.id, data_type = %data_type, "storage hit");
            self.touch();
        }
        Ok(fetched)
    }

    fn update_from_filter(&self, data_type: Option<&DataType>) -> Result<bool, PipelineError> {
        let Some(filter) = self.filter() else {
            debug!(output = self.id, "no owning filter to recompute from");
            return Ok(false);
        };

        debug!(output = self.id, filter = %filter.type_name(), "full filter update");
        filter.update()?;

        Ok(match data_type {
            Some(data_type) => self
                .data(data_type)
                .map_or(false, |data| data.read().is_valid()),
            None => self.is_valid(),
        })
    }

    /// Arm every data to fetch from `<base>/<type>_<id>`
    pub(crate) fn arm_fetch(
        &self,
        storage: &Arc<dyn TemporalStorage>,
        base: &str,
        manifest: Option<&OutputManifest>,
        verify_checksums: bool,
    ) {
        for (data_type, entry) in self.data.read().iter() {
            let checksum = manifest
                .and_then(|m| m.data(data_type))
                .and_then(|d| d.checksum.clone())
                .filter(|_| verify_checksums);
            let context = FetchContext::new(Arc::clone(storage), data_key(base, data_type, self.id))
                .with_checksum(checksum);
            entry.write().core_mut().set_fetch_context(context);
        }
    }

    /// Store every data's content under `base` and describe it
    pub fn snapshot(
        &self,
        storage: &dyn TemporalStorage,
        base: &str,
    ) -> Result<OutputManifest, StorageError> {
        let mut manifest = OutputManifest {
            id: self.id,
            spacing: self.spacing(),
            data: Vec::new(),
        };

        for (data_type, entry) in self.data.read().iter() {
            let data = entry.read();
            let checksum = match data.snapshot() {
                Some(bytes) => {
                    storage.write(&data_key(base, data_type, self.id), &bytes)?;
                    Some(checksum(&bytes))
                }
                None => None,
            };
            manifest.data.push(DataManifest {
                data_type: data_type.clone(),
                dependencies: data.dependencies(),
                edited_regions: data.edited_regions_snapshot(),
                checksum,
            });
        }

        Ok(manifest)
    }

    pub(crate) fn restore_edited_regions(&self, manifest: &OutputManifest) {
        for data in &manifest.data {
            if let Some(entry) = self.data(&data.data_type) {
                entry
                    .write()
                    .restore_edited_regions(data.edited_regions.clone());
            }
        }
    }
}

impl fmt::Debug for Output {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Output")
            .field("id", &self.id)
            .field("spacing", &self.spacing())
            .field("data_types", &self.data_types())
            .field("last_modified", &self.last_modified())
            .finish()
    }
}
