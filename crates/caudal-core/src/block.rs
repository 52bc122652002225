//! The block execution contract and its runtime wrapper.
//!
//! A [`Block`] is a user-authored processing node: typed ports, a `work()`
//! entry point, introspectable fields, and optional settings hooks. The
//! graph wraps every block in a [`BlockModel`], which owns the block's
//! [`Settings`] store, its installed ports, and the glue that runs between
//! scheduler and block on every invocation: ingest input tags, apply staged
//! settings, forward the resulting tag downstream, then call `work()`.

use crate::fields::BlockFields;
use crate::pmt::{Pmt, PropertyMap};
use crate::port::PortDescriptor;
use crate::settings::{ApplyStagedResult, Settings, SettingsError};

pub use crate::port::WorkIo;

/// Outcome category of one `work()` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkStatus {
    /// Samples moved; call again.
    Ok,
    /// Not enough input queued — ordinary back-pressure, not an error.
    InsufficientInputItems,
    /// Not enough downstream space — ordinary back-pressure.
    InsufficientOutputItems,
    /// The stream has ended for this block.
    Done,
    /// Fatal; the scheduler aborts the run.
    Error,
}

/// Result of one `work()` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkResult {
    pub requested_work: u64,
    pub performed_work: u64,
    pub status: WorkStatus,
}

impl WorkResult {
    pub fn new(requested_work: u64, performed_work: u64, status: WorkStatus) -> Self {
        Self {
            requested_work,
            performed_work,
            status,
        }
    }

    pub fn ok(requested_work: u64, performed_work: u64) -> Self {
        Self::new(requested_work, performed_work, WorkStatus::Ok)
    }

    pub fn done(requested_work: u64) -> Self {
        Self::new(requested_work, 0, WorkStatus::Done)
    }

    pub fn insufficient_input(requested_work: u64) -> Self {
        Self::new(requested_work, 0, WorkStatus::InsufficientInputItems)
    }

    pub fn insufficient_output(requested_work: u64) -> Self {
        Self::new(requested_work, 0, WorkStatus::InsufficientOutputItems)
    }

    pub fn error(requested_work: u64) -> Self {
        Self::new(requested_work, 0, WorkStatus::Error)
    }
}

/// A processing node.
///
/// Implementations are driven by one scheduler worker at a time: a given
/// instance is never called concurrently, but distinct instances run in
/// parallel, hence `Send`.
///
/// `work()` must not block: probe inputs with the non-blocking span getters
/// and outputs with `try_reserve`, and report back-pressure through the
/// `Insufficient*` statuses instead of waiting.
pub trait Block: BlockFields + Send {
    /// Type name used for unique names and registry lookups.
    fn type_name(&self) -> &'static str;

    /// One-line description folded into the block's meta information.
    fn description(&self) -> &'static str {
        ""
    }

    /// Declared input ports, in index order.
    fn inputs(&self) -> Vec<PortDescriptor> {
        Vec::new()
    }

    /// Declared output ports, in index order.
    fn outputs(&self) -> Vec<PortDescriptor> {
        Vec::new()
    }

    /// Advances the stream by up to `requested_work` samples.
    fn work(&mut self, io: &mut WorkIo, requested_work: u64) -> WorkResult;

    /// Whether the block may have latent work even after reporting `Done`
    /// (external I/O): the scheduler then also checks for queued input
    /// before concluding quiescence.
    fn is_blocking(&self) -> bool {
        false
    }

    /// Hook invoked by [`Settings::apply_staged`] after parameters were
    /// written, at most once per apply, on the calling thread. `forward`
    /// may be amended to influence what propagates downstream.
    fn settings_changed(
        &mut self,
        _old: &PropertyMap,
        _applied: &PropertyMap,
        _forward: &mut PropertyMap,
    ) {
    }

    /// Hook invoked after a defaults reset.
    fn reset(&mut self) {}
}

/// Runtime wrapper owning a block together with its settings store, its
/// installed ports and its meta information.
pub struct BlockModel {
    block: Box<dyn Block>,
    io: WorkIo,
    settings: Settings,
    meta: PropertyMap,
    unique_name: String,
}

impl BlockModel {
    pub(crate) fn new(block: Box<dyn Block>, index: usize) -> Self {
        let settings = Settings::for_block(&*block);
        let mut meta = PropertyMap::new();
        if !block.description().is_empty() {
            meta.insert(
                "description".to_owned(),
                Pmt::Str(block.description().to_owned()),
            );
        }
        let unique_name = format!("{}#{}", block.type_name(), index);
        Self {
            block,
            io: WorkIo::default(),
            settings,
            meta,
            unique_name,
        }
    }

    /// `"TypeName#index"`, unique within one graph.
    pub fn unique_name(&self) -> &str {
        &self.unique_name
    }

    pub fn type_name(&self) -> &'static str {
        self.block.type_name()
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn meta_information(&self) -> &PropertyMap {
        &self.meta
    }

    /// Stages parameters on the block. Unmatched keys are folded into the
    /// meta information and returned.
    pub fn set_settings(&mut self, parameters: &PropertyMap) -> Result<PropertyMap, SettingsError> {
        let unmatched = self.settings.set(&*self.block, parameters)?;
        for (key, value) in &unmatched {
            self.meta.insert(key.clone(), value.clone());
        }
        Ok(unmatched)
    }

    /// Applies staged parameters now and forwards the resulting tag map on
    /// every output port.
    pub fn apply_staged_settings(&mut self) -> ApplyStagedResult {
        let result = self.settings.apply_staged(self.block.as_mut());
        if !result.forward.is_empty() {
            self.io.forward_tags(&result.forward);
        }
        result
    }

    /// One scheduler-driven invocation: ingest tags visible on the inputs
    /// (auto-updating eligible parameters), apply staged settings, then run
    /// the block's `work()`.
    pub fn work(&mut self, requested_work: u64) -> WorkResult {
        let tag_parameters = self.io.collect_input_tags();
        if !tag_parameters.is_empty() {
            self.settings.auto_update(&*self.block, &tag_parameters);
        }
        if self.settings.changed() {
            self.apply_staged_settings();
        }
        self.block.work(&mut self.io, requested_work)
    }

    pub fn is_blocking(&self) -> bool {
        self.block.is_blocking()
    }

    /// Queued samples on every input port.
    pub fn available_input_samples(&self) -> Vec<usize> {
        self.io.inputs_available()
    }

    pub(crate) fn declared_inputs(&self) -> Vec<PortDescriptor> {
        self.block.inputs()
    }

    pub(crate) fn declared_outputs(&self) -> Vec<PortDescriptor> {
        self.block.outputs()
    }

    pub(crate) fn install_io(&mut self, io: WorkIo) {
        self.io = io;
    }

    /// The wrapped block, for inspection.
    pub fn as_block(&self) -> &dyn Block {
        &*self.block
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fields::FieldDescriptor;
    use crate::pmt::property_map;

    struct NullBlock;

    impl BlockFields for NullBlock {
        fn field_count(&self) -> usize {
            0
        }

        fn field_info(&self, _index: usize) -> Option<FieldDescriptor> {
            None
        }

        fn field_value(&self, _index: usize) -> Option<Pmt> {
            None
        }

        fn set_field_value(&mut self, _index: usize, _value: &Pmt) -> bool {
            false
        }
    }

    impl Block for NullBlock {
        fn type_name(&self) -> &'static str {
            "NullBlock"
        }

        fn description(&self) -> &'static str {
            "does nothing"
        }

        fn work(&mut self, _io: &mut WorkIo, requested: u64) -> WorkResult {
            WorkResult::done(requested)
        }
    }

    #[test]
    fn test_unique_name_and_meta() {
        let model = BlockModel::new(Box::new(NullBlock), 3);
        assert_eq!(model.unique_name(), "NullBlock#3");
        assert_eq!(
            model.meta_information().get("description"),
            Some(&Pmt::Str("does nothing".to_owned()))
        );
    }

    #[test]
    fn test_unmatched_settings_fold_into_meta() {
        let mut model = BlockModel::new(Box::new(NullBlock), 0);
        let unmatched = model
            .set_settings(&property_map([("color", Pmt::Str("teal".into()))]))
            .unwrap();
        assert_eq!(unmatched.len(), 1);
        assert_eq!(
            model.meta_information().get("color"),
            Some(&Pmt::Str("teal".to_owned()))
        );
    }

    #[test]
    fn test_work_delegates() {
        let mut model = BlockModel::new(Box::new(NullBlock), 0);
        let result = model.work(u64::MAX);
        assert_eq!(result.status, WorkStatus::Done);
        assert!(model.available_input_samples().is_empty());
        assert!(!model.is_blocking());
    }
}
