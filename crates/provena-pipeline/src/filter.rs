//! Filters: schedulable computations producing outputs

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use anyhow::anyhow;
use parking_lot::{ReentrantMutex, RwLock};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::data::{Data, DataType};
use crate::output::{Output, OutputId};
use crate::snapshot::FilterManifest;
use crate::storage::StorageContext;
use provena_core::{PipelineError, Priority, SchedulerError, Spacing, TaskClass};
use provena_tasks::{Runnable, Scheduler, Task, TaskId};

/// The computation performed by a filter
pub trait FilterKernel: Send + Sync + 'static {
    /// Type name, used in logs and snapshot manifests
    fn type_name(&self) -> &str;

    /// Produce every output. Results are staged in `context` and committed
    /// only when this returns `Ok` and the task was not aborted.
    fn execute(&self, context: &mut ExecutionContext<'_>) -> anyhow::Result<()>;

    /// Produce a single output. Defaults to a full execution.
    fn execute_output(
        &self,
        output: OutputId,
        context: &mut ExecutionContext<'_>,
    ) -> anyhow::Result<()> {
        let _ = output;
        self.execute(context)
    }

    /// Skip stored content, e.g. because the parameters changed since the
    /// snapshot was taken
    fn ignore_storage_content(&self) -> bool {
        false
    }

    /// Empty data of `data_type`, used when restoring outputs from storage
    fn create_data(&self, data_type: &DataType) -> Option<Box<dyn Data>> {
        let _ = data_type;
        None
    }
}

/// An upstream output consumed by a filter
#[derive(Debug, Clone)]
pub struct Input {
    filter: Arc<Filter>,
    output: OutputId,
}

impl Input {
    pub fn new(filter: Arc<Filter>, output: OutputId) -> Self {
        Self { filter, output }
    }

    pub fn filter(&self) -> &Arc<Filter> {
        &self.filter
    }

    pub fn output_id(&self) -> OutputId {
        self.output
    }

    pub fn output(&self) -> Result<Arc<Output>, PipelineError> {
        self.filter.output(self.output)
    }

    /// Make the upstream output valid, running its filter if the output does
    /// not exist yet. An upstream execution that produced nothing leaves the
    /// input invalid rather than failing.
    pub fn update(&self) -> Result<bool, PipelineError> {
        if !self.filter.has_output(self.output) {
            self.filter.update()?;
            if !self.filter.has_output(self.output) {
                debug!(
                    filter = %self.filter.type_name(),
                    output = self.output,
                    "upstream produced no output"
                );
                return Ok(false);
            }
        }
        self.output()?.update()
    }
}

#[derive(Default)]
struct StagedOutput {
    spacing: Option<Spacing>,
    data: Vec<Box<dyn Data>>,
}

/// Access to inputs and staging area for results during an execution
pub struct ExecutionContext<'a> {
    filter: &'a Filter,
    inputs: Vec<Arc<Output>>,
    staged: BTreeMap<OutputId, StagedOutput>,
}

impl<'a> ExecutionContext<'a> {
    fn new(filter: &'a Filter, inputs: Vec<Arc<Output>>) -> Self {
        Self {
            filter,
            inputs,
            staged: BTreeMap::new(),
        }
    }

    pub fn filter(&self) -> &Filter {
        self.filter
    }

    pub fn inputs(&self) -> &[Arc<Output>] {
        &self.inputs
    }

    pub fn input(&self, index: usize) -> anyhow::Result<&Arc<Output>> {
        self.inputs.get(index).ok_or_else(|| {
            anyhow!(
                "{} has {} inputs, no input {}",
                self.filter.type_name(),
                self.inputs.len(),
                index
            )
        })
    }

    /// Output as it exists before this execution commits
    pub fn current_output(&self, id: OutputId) -> Option<Arc<Output>> {
        self.filter.output(id).ok()
    }

    /// Cooperative checkpoint of the owning task
    pub fn can_execute(&self) -> bool {
        self.filter.task.can_execute()
    }

    pub fn report_progress(&self, progress: u8) {
        self.filter.task.report_progress(progress);
    }

    pub fn set_output_spacing(&mut self, output: OutputId, spacing: Spacing) {
        self.staged.entry(output).or_default().spacing = Some(spacing);
    }

    pub fn set_output_data<D: Data>(&mut self, output: OutputId, data: D) {
        self.set_output_boxed_data(output, Box::new(data));
    }

    pub fn set_output_boxed_data(&mut self, output: OutputId, data: Box<dyn Data>) {
        self.staged.entry(output).or_default().data.push(data);
    }

    fn commit(self) {
        let default_spacing = self
            .inputs
            .first()
            .map(|input| input.spacing())
            .unwrap_or_default();

        for (id, staged) in self.staged {
            let output = self
                .filter
                .output_or_create(id, staged.spacing.unwrap_or(default_spacing));
            if let Some(spacing) = staged.spacing {
                if output.spacing() != spacing {
                    output.set_spacing(spacing);
                }
            }
            for data in staged.data {
                output.set_boxed_data(data);
            }
        }
    }
}

/// Builder for [`Filter`]
pub struct FilterBuilder {
    kernel: Box<dyn FilterKernel>,
    inputs: Vec<Input>,
    uuid: Option<Uuid>,
    category: String,
    description: Option<String>,
    priority: Priority,
    class: TaskClass,
    hidden: bool,
}

impl FilterBuilder {
    pub fn new(kernel: impl FilterKernel) -> Self {
        Self {
            kernel: Box::new(kernel),
            inputs: Vec::new(),
            uuid: None,
            category: provena_core::config::defaults::DEFAULT_CATEGORY.to_string(),
            description: None,
            priority: Priority::default(),
            class: TaskClass::default(),
            hidden: false,
        }
    }

    pub fn with_input(mut self, input: Input) -> Self {
        self.inputs.push(input);
        self
    }

    pub fn with_inputs(mut self, inputs: impl IntoIterator<Item = Input>) -> Self {
        self.inputs.extend(inputs);
        self
    }

    /// Reuse the identity of a previously stored filter
    pub fn with_uuid(mut self, uuid: Uuid) -> Self {
        self.uuid = Some(uuid);
        self
    }

    pub fn with_category(mut self, category: impl Into<String>) -> Self {
        self.category = category.into();
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_class(mut self, class: TaskClass) -> Self {
        self.class = class;
        self
    }

    pub fn hidden(mut self) -> Self {
        self.hidden = true;
        self
    }

    /// Build the filter. Without a scheduler its task runs on the submitting
    /// thread.
    pub fn build(self, scheduler: Option<&Scheduler>) -> Arc<Filter> {
        let description = self
            .description
            .unwrap_or_else(|| self.kernel.type_name().to_string());
        let mut task = Task::new(scheduler)
            .with_description(description)
            .with_priority(self.priority)
            .with_class(self.class);
        if self.hidden {
            task = task.hidden();
        }

        Arc::new_cyclic(|this| Filter {
            task,
            uuid: self.uuid.unwrap_or_else(Uuid::new_v4),
            category: self.category,
            kernel: self.kernel,
            inputs: self.inputs,
            outputs: RwLock::new(BTreeMap::new()),
            storage: RwLock::new(None),
            execution: ReentrantMutex::new(()),
            executions: AtomicUsize::new(0),
            this: this.clone(),
        })
    }
}

/// Computation node consuming upstream outputs and producing its own
pub struct Filter {
    task: Task,
    uuid: Uuid,
    category: String,
    kernel: Box<dyn FilterKernel>,
    inputs: Vec<Input>,
    outputs: RwLock<BTreeMap<OutputId, Arc<Output>>>,
    storage: RwLock<Option<StorageContext>>,
    execution: ReentrantMutex<()>,
    executions: AtomicUsize,
    this: Weak<Filter>,
}

impl Filter {
    pub fn builder(kernel: impl FilterKernel) -> FilterBuilder {
        FilterBuilder::new(kernel)
    }

    pub fn uuid(&self) -> Uuid {
        self.uuid
    }

    pub fn type_name(&self) -> &str {
        self.kernel.type_name()
    }

    pub fn category(&self) -> &str {
        &self.category
    }

    pub fn inputs(&self) -> &[Input] {
        &self.inputs
    }

    /// Number of times the kernel has been executed
    pub fn execution_count(&self) -> usize {
        self.executions.load(Ordering::Relaxed)
    }

    /// Submit the filter's task
    pub fn submit(self: &Arc<Self>) -> Result<TaskId, SchedulerError> {
        let runnable: Arc<dyn Runnable> = self.clone();
        provena_tasks::submit(runnable)
    }

    pub fn output(&self, id: OutputId) -> Result<Arc<Output>, PipelineError> {
        self.outputs
            .read()
            .get(&id)
            .cloned()
            .ok_or_else(|| PipelineError::UnknownOutput {
                filter: self.type_name().to_string(),
                id,
            })
    }

    pub fn has_output(&self, id: OutputId) -> bool {
        self.outputs.read().contains_key(&id)
    }

    pub fn output_ids(&self) -> Vec<OutputId> {
        self.outputs.read().keys().copied().collect()
    }

    pub fn outputs(&self) -> Vec<Arc<Output>> {
        self.outputs.read().values().cloned().collect()
    }

    pub fn number_of_outputs(&self) -> usize {
        self.outputs.read().len()
    }

    fn output_or_create(&self, id: OutputId, spacing: Spacing) -> Arc<Output> {
        Arc::clone(
            self.outputs
                .write()
                .entry(id)
                .or_insert_with(|| Output::new(self.this.clone(), id, spacing)),
        )
    }

    /// Pre-create an output whose data will be fetched from storage on demand
    pub fn restore_output(&self, id: OutputId, spacing: Spacing) -> Result<Arc<Output>, PipelineError> {
        let output = self.output_or_create(id, spacing);
        let context = self.storage.read().clone();
        if let Some(context) = context {
            let base = self.storage_key(&context);
            let manifest = FilterManifest::load(context.storage().as_ref(), &base)?;
            self.arm_output(&output, &context, &base, manifest.as_ref());
        }
        Ok(output)
    }

    /// Pre-create every output listed in the stored manifest. Returns how
    /// many outputs were restored; zero without a fetch context or manifest.
    pub fn restore_outputs(&self) -> Result<usize, PipelineError> {
        let Some(context) = self.storage_context() else {
            return Ok(0);
        };
        let base = self.storage_key(&context);
        let Some(manifest) = FilterManifest::load(context.storage().as_ref(), &base)? else {
            return Ok(0);
        };

        for output_manifest in &manifest.outputs {
            let output = self.output_or_create(output_manifest.id, output_manifest.spacing);
            self.arm_output(&output, &context, &base, Some(&manifest));
        }
        debug!(
            filter = %self.type_name(),
            outputs = manifest.outputs.len(),
            "restored outputs from {}",
            base
        );
        Ok(manifest.outputs.len())
    }

    /// Fetch data from `context` from now on, arming every existing output
    pub fn set_fetch_context(&self, context: StorageContext) -> Result<(), PipelineError> {
        let base = self.storage_key(&context);
        let manifest = FilterManifest::load(context.storage().as_ref(), &base)?;
        for output in self.outputs() {
            self.arm_output(&output, &context, &base, manifest.as_ref());
        }
        debug!(filter = %self.type_name(), base, "fetch context set");
        *self.storage.write() = Some(context);
        Ok(())
    }

    pub fn storage_context(&self) -> Option<StorageContext> {
        self.storage.read().clone()
    }

    fn storage_key(&self, context: &StorageContext) -> String {
        context.filter_key(&self.category, &self.uuid)
    }

    fn arm_output(
        &self,
        output: &Output,
        context: &StorageContext,
        base: &str,
        manifest: Option<&FilterManifest>,
    ) {
        let output_manifest = manifest.and_then(|m| m.output(output.id()));
        if let Some(output_manifest) = output_manifest {
            for data in &output_manifest.data {
                if output.has_data(&data.data_type) {
                    continue;
                }
                match self.kernel.create_data(&data.data_type) {
                    Some(created) => {
                        output.set_boxed_data(created);
                    }
                    None => warn!(
                        filter = %self.type_name(),
                        data_type = %data.data_type,
                        "cannot restore data of unknown type"
                    ),
                }
            }
        }
        output.arm_fetch(
            context.storage(),
            base,
            output_manifest,
            context.verifies_checksums(),
        );
    }

    /// Store every output and a manifest describing them
    pub fn snapshot(&self, context: &StorageContext) -> Result<FilterManifest, PipelineError> {
        let base = self.storage_key(context);
        let storage = context.storage().as_ref();

        let outputs = self
            .outputs()
            .iter()
            .map(|output| output.snapshot(storage, &base))
            .collect::<Result<Vec<_>, _>>()?;

        let manifest = FilterManifest {
            filter: self.type_name().to_string(),
            uuid: self.uuid,
            created_at: chrono::Utc::now().to_rfc3339(),
            outputs,
        };
        manifest.store(storage, &base)?;
        info!(
            filter = %self.type_name(),
            outputs = manifest.outputs.len(),
            "stored snapshot under {}",
            base
        );
        Ok(manifest)
    }

    /// Restore edited regions of every output from the stored manifest.
    /// Returns `false` when there is no fetch context or no manifest.
    pub fn restore_edited_regions(&self) -> Result<bool, PipelineError> {
        let Some(context) = self.storage_context() else {
            return Ok(false);
        };
        let base = self.storage_key(&context);
        let Some(manifest) = FilterManifest::load(context.storage().as_ref(), &base)? else {
            return Ok(false);
        };

        for output_manifest in &manifest.outputs {
            if let Ok(output) = self.output(output_manifest.id) {
                output.restore_edited_regions(output_manifest);
            }
        }
        Ok(true)
    }

    /// Some output is missing or invalid
    pub fn need_update(&self) -> bool {
        let outputs = self.outputs();
        outputs.is_empty() || outputs.iter().any(|output| !output.is_valid())
    }

    pub fn need_update_output(&self, id: OutputId) -> Result<bool, PipelineError> {
        Ok(!self.output(id)?.is_valid())
    }

    /// Make every output valid, executing once if no output exists yet
    pub fn update(&self) -> Result<bool, PipelineError> {
        let _execution = self.execution.lock();

        let ids = self.output_ids();
        if ids.is_empty() {
            debug!(filter = %self.type_name(), "no outputs yet, executing");
            for input in &self.inputs {
                input.update()?;
            }
            self.run_kernel(None)?;
        } else {
            for id in ids {
                self.update_output(id)?;
            }
        }

        Ok(!self.need_update())
    }

    /// Make one output valid, preferring stored content over execution
    pub fn update_output(&self, id: OutputId) -> Result<bool, PipelineError> {
        let _execution = self.execution.lock();

        let output = self.output(id)?;
        if output.is_valid() {
            return Ok(true);
        }

        if self.kernel.ignore_storage_content() {
            debug!(filter = %self.type_name(), output = id, "ignoring storage content");
        } else if self.fetch_output_data(id)? {
            return Ok(true);
        }

        for input in &self.inputs {
            input.update()?;
        }
        self.run_kernel(Some(id))?;
        Ok(output.is_valid())
    }

    /// Fetch every invalid data of an output from storage
    pub fn fetch_output_data(&self, id: OutputId) -> Result<bool, PipelineError> {
        let output = self.output(id)?;

        let mut fetched = false;
        for data in output.datas() {
            let mut data = data.write();
            if !data.is_valid() && data.fetch_data() {
                fetched = true;
            }
        }
        if fetched {
            output.touch();
        }
        Ok(output.is_valid())
    }

    fn run_kernel(&self, target: Option<OutputId>) -> Result<bool, PipelineError> {
        if self.task.is_aborted() {
            debug!(filter = %self.type_name(), "aborted, not executing");
            return Ok(false);
        }

        let mut inputs = Vec::with_capacity(self.inputs.len());
        for input in &self.inputs {
            match input.output() {
                Ok(output) => inputs.push(output),
                Err(PipelineError::UnknownOutput { filter, id }) => {
                    debug!(
                        filter = %self.type_name(),
                        "input {} of '{}' missing, not executing",
                        id,
                        filter
                    );
                    return Ok(false);
                }
                Err(e) => return Err(e),
            }
        }
        let mut context = ExecutionContext::new(self, inputs);

        self.executions.fetch_add(1, Ordering::Relaxed);
        let result = match target {
            Some(id) => self.kernel.execute_output(id, &mut context),
            None => self.kernel.execute(&mut context),
        };

        match result {
            Ok(()) if self.task.is_aborted() => {
                debug!(filter = %self.type_name(), "discarding results of aborted execution");
                Ok(false)
            }
            Ok(()) => {
                context.commit();
                Ok(true)
            }
            Err(e) => {
                error!(filter = %self.type_name(), "execution failed: {:#}", e);
                Ok(false)
            }
        }
    }
}

impl Runnable for Filter {
    fn task(&self) -> &Task {
        &self.task
    }

    fn run(&self) {
        if !self.need_update() {
            debug!(filter = %self.type_name(), "outputs up to date");
            return;
        }

        self.task.report_progress(0);
        match self.update() {
            Ok(true) => self.task.report_progress(100),
            Ok(false) => debug!(filter = %self.type_name(), "outputs left invalid"),
            Err(e) => warn!(filter = %self.type_name(), "update failed: {}", e),
        }
    }

    fn on_abort(&self) {
        debug!(filter = %self.type_name(), task = %self.task.id(), "abort requested");
    }
}

impl fmt::Debug for Filter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Filter")
            .field("type_name", &self.type_name())
            .field("uuid", &self.uuid)
            .field("category", &self.category)
            .field("outputs", &self.output_ids())
            .field("task", &self.task)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blob::BlobData;
    use crate::storage::{DirStorage, TemporalStorage};
    use provena_core::{SchedulerConfig, StorageError};
    use provena_tasks::{CollectingReporter, TaskEvent};
    use std::thread;
    use std::time::{Duration, Instant};
    use tempfile::TempDir;

    fn raster() -> DataType {
        DataType::from("Raster")
    }

    /// Produces a "Raster" on each configured output
    #[derive(Default)]
    struct Source {
        outputs: Vec<OutputId>,
        delay: Duration,
        fail: bool,
        ignore_storage: bool,
        abort_during_execution: bool,
    }

    impl Source {
        fn new(outputs: &[OutputId]) -> Self {
            Self {
                outputs: outputs.to_vec(),
                ..Default::default()
            }
        }
    }

    impl FilterKernel for Source {
        fn type_name(&self) -> &str {
            "Source"
        }

        fn execute(&self, context: &mut ExecutionContext<'_>) -> anyhow::Result<()> {
            thread::sleep(self.delay);
            if self.fail {
                anyhow::bail!("acquisition failed");
            }
            if self.abort_during_execution {
                context.filter().task().abort();
            }
            for &id in &self.outputs {
                context.set_output_data(id, BlobData::new("Raster", vec![id as u8 + 1; 4]));
            }
            Ok(())
        }

        fn ignore_storage_content(&self) -> bool {
            self.ignore_storage
        }

        fn create_data(&self, data_type: &DataType) -> Option<Box<dyn Data>> {
            Some(Box::new(BlobData::empty(data_type.clone())))
        }
    }

    /// Inverts the raster of its first input
    struct Invert;

    impl FilterKernel for Invert {
        fn type_name(&self) -> &str {
            "Invert"
        }

        fn execute(&self, context: &mut ExecutionContext<'_>) -> anyhow::Result<()> {
            let bytes = context
                .input(0)?
                .read_data::<BlobData, _>(&raster(), |b| b.bytes().map(<[u8]>::to_vec))
                .flatten()
                .ok_or_else(|| anyhow!("input raster unavailable"))?;
            let inverted = bytes.iter().map(|b| !b).collect();
            context.set_output_data(0, BlobData::new("Raster", inverted));
            Ok(())
        }
    }

    /// Counts reads of data entries, ignoring manifests
    #[derive(Debug)]
    struct CountingStorage {
        inner: DirStorage,
        reads: AtomicUsize,
    }

    impl TemporalStorage for CountingStorage {
        fn read(&self, key: &str) -> Result<Vec<u8>, StorageError> {
            if !key.ends_with(crate::snapshot::MANIFEST_FILE) {
                self.reads.fetch_add(1, Ordering::SeqCst);
            }
            self.inner.read(key)
        }

        fn write(&self, key: &str, bytes: &[u8]) -> Result<(), StorageError> {
            self.inner.write(key, bytes)
        }

        fn exists(&self, key: &str) -> bool {
            self.inner.exists(key)
        }

        fn remove(&self, key: &str) -> Result<(), StorageError> {
            self.inner.remove(key)
        }
    }

    #[test]
    fn test_zero_output_filter_executes_once() {
        let filter = Filter::builder(Source::new(&[0, 1])).build(None);
        assert!(filter.need_update());

        assert!(filter.update().unwrap());

        assert_eq!(filter.execution_count(), 1);
        assert_eq!(filter.output_ids(), vec![0, 1]);
        assert!(filter.output(0).unwrap().is_valid());
        assert!(filter.output(1).unwrap().is_valid());
        assert!(!filter.need_update());
    }

    #[test]
    fn test_unknown_output_is_an_error() {
        let filter = Filter::builder(Source::new(&[0])).build(None);
        filter.update().unwrap();

        let err = filter.output(7).unwrap_err();
        assert_eq!(err.to_string(), "Filter 'Source' has no output 7");
        assert!(filter.update_output(7).is_err());
        assert!(filter.need_update_output(7).is_err());
    }

    #[test]
    fn test_update_is_idempotent() {
        let filter = Filter::builder(Source::new(&[0])).build(None);
        filter.update().unwrap();
        let output = filter.output(0).unwrap();

        assert!(output.update_data(&raster()).unwrap());
        assert!(output.update_data(&raster()).unwrap());
        assert!(output.update().unwrap());

        assert_eq!(filter.execution_count(), 1);
    }

    #[test]
    fn test_invalid_data_without_dependencies_runs_full_update() {
        let filter = Filter::builder(Source::new(&[0])).build(None);
        filter.update().unwrap();
        let output = filter.output(0).unwrap();

        output.set_spacing(Spacing::new(2.0, 2.0, 2.0));
        assert!(!output.is_valid());

        assert!(output.update_data(&raster()).unwrap());
        assert!(output.is_valid());
        assert_eq!(filter.execution_count(), 2);
    }

    #[test]
    fn test_concurrent_update_executes_once() {
        let filter = Filter::builder(Source {
            delay: Duration::from_millis(50),
            ..Source::new(&[0])
        })
        .build(None);
        filter.update().unwrap();
        let output = filter.output(0).unwrap();
        output.set_spacing(Spacing::new(3.0, 3.0, 3.0));

        let handles: Vec<_> = (0..2)
            .map(|_| {
                let output = Arc::clone(&output);
                thread::spawn(move || output.update_data(&raster()).unwrap())
            })
            .collect();
        for handle in handles {
            assert!(handle.join().unwrap());
        }

        assert_eq!(filter.execution_count(), 2);
    }

    #[test]
    fn test_failed_execution_leaves_outputs_invalid() {
        let filter = Filter::builder(Source {
            fail: true,
            ..Source::new(&[0])
        })
        .build(None);

        assert!(!filter.update().unwrap());
        assert_eq!(filter.number_of_outputs(), 0);
        assert_eq!(filter.execution_count(), 1);
    }

    #[test]
    fn test_aborted_execution_is_discarded() {
        let filter = Filter::builder(Source {
            abort_during_execution: true,
            ..Source::new(&[0])
        })
        .build(None);

        assert!(!filter.update().unwrap());
        assert_eq!(filter.number_of_outputs(), 0);

        // Aborted filters do not execute again
        assert!(!filter.update().unwrap());
        assert_eq!(filter.execution_count(), 1);
    }

    #[test]
    fn test_inputs_are_updated_first() {
        let source = Filter::builder(Source::new(&[0])).build(None);
        let invert = Filter::builder(Invert)
            .with_input(Input::new(Arc::clone(&source), 0))
            .build(None);

        assert!(invert.update().unwrap());

        assert_eq!(source.execution_count(), 1);
        let bytes = invert
            .output(0)
            .unwrap()
            .read_data::<BlobData, _>(&raster(), |b| b.bytes().map(<[u8]>::to_vec))
            .flatten();
        assert_eq!(bytes, Some(vec![!1u8; 4]));
    }

    #[test]
    fn test_failed_upstream_leaves_consumer_invalid() {
        let source = Filter::builder(Source {
            fail: true,
            ..Source::new(&[0])
        })
        .build(None);
        let invert = Filter::builder(Invert)
            .with_input(Input::new(Arc::clone(&source), 0))
            .build(None);

        assert!(!invert.update().unwrap());
        assert_eq!(source.execution_count(), 1);
        assert_eq!(invert.execution_count(), 0);
        assert!(invert.need_update());

        assert!(!Input::new(Arc::clone(&source), 0).update().unwrap());
    }

    #[test]
    fn test_restore_fetches_without_executing() {
        let temp = TempDir::new().unwrap();
        let storage = Arc::new(CountingStorage {
            inner: DirStorage::new(temp.path()),
            reads: AtomicUsize::new(0),
        });
        let context = StorageContext::new(storage.clone(), "session");

        let original = Filter::builder(Source::new(&[0])).build(None);
        original.update().unwrap();
        let manifest = original.snapshot(&context).unwrap();
        assert_eq!(manifest.outputs.len(), 1);
        assert_eq!(manifest.filter, "Source");

        let restored = Filter::builder(Source::new(&[0]))
            .with_uuid(original.uuid())
            .build(None);
        restored.set_fetch_context(context).unwrap();
        let output = restored.restore_output(0, manifest.outputs[0].spacing).unwrap();
        assert!(output.has_data(&raster()));
        assert!(!output.is_valid());

        assert!(output.update_data(&raster()).unwrap());
        assert!(output.update_data(&raster()).unwrap());

        assert_eq!(restored.execution_count(), 0);
        assert_eq!(storage.reads.load(Ordering::SeqCst), 1);
        assert_eq!(
            output.read_data::<BlobData, _>(&raster(), |b| b.bytes().map(<[u8]>::to_vec)),
            Some(Some(vec![1u8; 4]))
        );
    }

    #[test]
    fn test_corrupted_entry_falls_back_to_execution() {
        let temp = TempDir::new().unwrap();
        let storage: Arc<dyn TemporalStorage> = Arc::new(DirStorage::new(temp.path()));
        let context = StorageContext::new(storage.clone(), "");

        let original = Filter::builder(Source::new(&[0])).build(None);
        original.update().unwrap();
        original.snapshot(&context).unwrap();

        let key = format!("Filters/{}/Raster_0", original.uuid());
        storage.write(&key, b"tampered").unwrap();

        let restored = Filter::builder(Source::new(&[0]))
            .with_uuid(original.uuid())
            .build(None);
        restored.set_fetch_context(context).unwrap();
        restored.restore_output(0, Spacing::default()).unwrap();

        assert!(restored.update().unwrap());
        assert_eq!(restored.execution_count(), 1);
    }

    #[test]
    fn test_ignore_storage_content_executes() {
        let temp = TempDir::new().unwrap();
        let storage: Arc<dyn TemporalStorage> = Arc::new(DirStorage::new(temp.path()));
        let context = StorageContext::new(storage, "");

        let original = Filter::builder(Source::new(&[0])).build(None);
        original.update().unwrap();
        original.snapshot(&context).unwrap();

        let restored = Filter::builder(Source {
            ignore_storage: true,
            ..Source::new(&[0])
        })
        .with_uuid(original.uuid())
        .build(None);
        restored.set_fetch_context(context).unwrap();
        restored.restore_output(0, Spacing::default()).unwrap();

        assert!(restored.update().unwrap());
        assert_eq!(restored.execution_count(), 1);
    }

    #[test]
    fn test_restore_outputs_from_manifest() {
        let temp = TempDir::new().unwrap();
        let storage: Arc<dyn TemporalStorage> = Arc::new(DirStorage::new(temp.path()));
        let context = StorageContext::new(storage, "");

        let original = Filter::builder(Source::new(&[0, 2])).build(None);
        original.update().unwrap();
        original.snapshot(&context).unwrap();

        let restored = Filter::builder(Source::new(&[0, 2]))
            .with_uuid(original.uuid())
            .build(None);
        assert_eq!(restored.restore_outputs().unwrap(), 0);

        restored.set_fetch_context(context).unwrap();
        assert_eq!(restored.restore_outputs().unwrap(), 2);
        assert_eq!(restored.output_ids(), vec![0, 2]);

        assert!(restored.update().unwrap());
        assert_eq!(restored.execution_count(), 0);
    }

    #[test]
    fn test_restore_edited_regions() {
        let temp = TempDir::new().unwrap();
        let storage: Arc<dyn TemporalStorage> = Arc::new(DirStorage::new(temp.path()));
        let context = StorageContext::new(storage, "");
        let region = provena_core::Bounds::new(1.0, 2.0, 1.0, 2.0, 0.0, 1.0);

        let original = Filter::builder(Source::new(&[0])).build(None);
        original.update().unwrap();
        original
            .output(0)
            .unwrap()
            .write_data::<BlobData, _>(&raster(), |b| b.core_mut().add_edited_region(region));
        original.snapshot(&context).unwrap();

        let restored = Filter::builder(Source::new(&[0]))
            .with_uuid(original.uuid())
            .build(None);
        assert!(!restored.restore_edited_regions().unwrap());

        restored.set_fetch_context(context).unwrap();
        let output = restored.restore_output(0, Spacing::default()).unwrap();
        assert!(!output.is_edited());

        assert!(restored.restore_edited_regions().unwrap());
        assert!(output.is_edited());
    }

    #[test]
    fn test_scheduled_filter_populates_outputs() {
        let reporter = Arc::new(CollectingReporter::default());
        let config = SchedulerConfig {
            period_ms: 5,
            ..SchedulerConfig::default()
        };
        let scheduler = Scheduler::new(&config, reporter.clone());
        scheduler.start().unwrap();

        let filter = Filter::builder(Source::new(&[0]))
            .with_priority(Priority::High)
            .build(Some(&scheduler));
        let id = filter.submit().unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        while !filter.task().has_finished() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(2));
        }

        assert!(filter.task().has_finished());
        assert!(filter.output(0).unwrap().is_valid());
        assert!(reporter
            .events_for(id)
            .contains(&TaskEvent::Progress { id, progress: 100 }));
        scheduler.abort();
    }
}
