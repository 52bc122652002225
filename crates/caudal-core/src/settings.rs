//! Transactional parameter staging for blocks.
//!
//! Every block carries a [`Settings`] store: a map-based overlay over its
//! introspectable fields. Writes stage into a pending map and only reach the
//! fields when [`Settings::apply_staged`] runs (the block model does this at
//! the top of `work()`), so a block never observes a half-written parameter
//! set mid-stream.
//!
//! Parameter life cycle: unknown → staged (via [`set`](Settings::set) or
//! [`auto_update`](Settings::auto_update)) → applied (via
//! [`apply_staged`](Settings::apply_staged)).
//!
//! Two reserved keys drive snapshots: staging [`STORE_DEFAULTS`] snapshots
//! the active parameters as the new defaults, staging [`RESET_DEFAULTS`]
//! restores them (and invokes the block's `reset()` hook).

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::{SystemTime, UNIX_EPOCH};

use thiserror::Error;
use tracing::warn;

use crate::block::Block;
use crate::fields::BlockFields;
use crate::pmt::{hash_combine, hash_str, Pmt, PropertyMap};
use crate::tag::{DEFAULT_TAG_KEYS, RESET_DEFAULTS, STORE_DEFAULTS};

/// Errors surfaced by the settings engine.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SettingsError {
    /// A key matched a writable field but the value kind did not.
    #[error("value for key '{key}' has the wrong type: expected {expected}, got {actual}")]
    TypeMismatch {
        key: String,
        expected: crate::pmt::PmtKind,
        actual: crate::pmt::PmtKind,
    },
}

/// Validity context for a staged parameter set: an optional activation time
/// plus a user-defined multiplexing context.
///
/// Ordering is by time alone: a context without a time sorts before any
/// timed one.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SettingsCtx {
    pub time: Option<SystemTime>,
    pub context: PropertyMap,
}

impl SettingsCtx {
    pub fn at(time: SystemTime) -> Self {
        Self {
            time: Some(time),
            context: PropertyMap::new(),
        }
    }

    /// Order-sensitive hash over the activation time and every context
    /// entry (key, then base-64 of the value's canonical encoding).
    pub fn hash(&self) -> u64 {
        let mut seed = 0u64;
        if let Some(time) = self.time {
            let nanos = time
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_nanos() as u64)
                .unwrap_or(0);
            hash_combine(&mut seed, nanos);
        }
        for (key, value) in &self.context {
            hash_str(&mut seed, key);
            hash_str(&mut seed, &value.to_base64());
        }
        seed
    }
}

impl PartialOrd for SettingsCtx {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(match (&self.time, &other.time) {
            (None, None) => std::cmp::Ordering::Equal,
            (None, Some(_)) => std::cmp::Ordering::Less,
            (Some(_), None) => std::cmp::Ordering::Greater,
            (Some(a), Some(b)) => a.cmp(b),
        })
    }
}

/// Outcome of [`Settings::apply_staged`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ApplyStagedResult {
    /// Parameters that were written into block fields.
    pub applied: PropertyMap,
    /// Parameters to forward downstream as a stream tag. Forwarding is
    /// independent of local acceptance: a rejected value still propagates.
    pub forward: PropertyMap,
}

#[derive(Debug, Default)]
struct State {
    /// Mirror of the block's field values after the last apply.
    active: PropertyMap,
    /// Writes waiting for the next apply.
    staged: PropertyMap,
    defaults: PropertyMap,
    /// Keys still eligible for tag-driven updates. An explicit `set` removes
    /// its key here: user intent overrides the stream.
    auto_update: BTreeSet<String>,
    /// Keys re-emitted downstream after an apply.
    auto_forward: BTreeSet<String>,
}

/// Staged-settings store for one block.
///
/// The mutex guards the staging maps, never the block fields themselves —
/// fields are only written from `apply_staged`, which the owning thread
/// calls between `work()` invocations.
#[derive(Debug)]
pub struct Settings {
    state: Mutex<State>,
    changed: AtomicBool,
}

impl Settings {
    /// Builds the store from a block's reflected fields: every writable
    /// field starts auto-updatable, and fields named after a well-known
    /// stream-tag key start auto-forwarded. The construction-time field
    /// values double as the initial defaults.
    pub fn for_block<B: BlockFields + ?Sized>(block: &B) -> Self {
        let mut state = State::default();
        for index in 0..block.field_count() {
            let Some(info) = block.field_info(index) else {
                continue;
            };
            if info.readable {
                if let Some(value) = block.field_value(index) {
                    state.active.insert(info.name.to_owned(), value);
                }
            }
            if info.writable {
                state.auto_update.insert(info.name.to_owned());
                if DEFAULT_TAG_KEYS.contains(&info.name) {
                    state.auto_forward.insert(info.name.to_owned());
                }
            }
        }
        state.defaults = state.active.clone();
        Self {
            state: Mutex::new(state),
            changed: AtomicBool::new(false),
        }
    }

    /// Whether staged parameters are waiting for an apply (acquire load;
    /// pairs with the release store made when staging).
    pub fn changed(&self) -> bool {
        self.changed.load(Ordering::Acquire)
    }

    /// Stages new parameter values.
    ///
    /// Keys matching a writable field are staged (and withdrawn from the
    /// auto-update set). Unknown keys are echoed back so the caller can fold
    /// them into the block's meta information.
    ///
    /// # Errors
    ///
    /// [`SettingsError::TypeMismatch`] when a key names a writable field but
    /// carries the wrong value kind. Keys staged before the offending one
    /// remain staged.
    pub fn set<B: BlockFields + ?Sized>(
        &self,
        block: &B,
        parameters: &PropertyMap,
    ) -> Result<PropertyMap, SettingsError> {
        self.set_ctx(block, parameters, &SettingsCtx::default())
    }

    /// [`set`](Self::set) with an explicit validity context.
    pub fn set_ctx<B: BlockFields + ?Sized>(
        &self,
        block: &B,
        parameters: &PropertyMap,
        _ctx: &SettingsCtx,
    ) -> Result<PropertyMap, SettingsError> {
        let mut state = self.lock();
        let mut unmatched = PropertyMap::new();
        for (key, value) in parameters {
            if key == RESET_DEFAULTS || key == STORE_DEFAULTS {
                state.staged.insert(key.clone(), value.clone());
                self.changed.store(true, Ordering::Release);
                continue;
            }
            let Some(index) = block.field_index(key) else {
                unmatched.insert(key.clone(), value.clone());
                continue;
            };
            let Some(info) = block.field_info(index) else {
                unmatched.insert(key.clone(), value.clone());
                continue;
            };
            if !info.writable {
                unmatched.insert(key.clone(), value.clone());
                continue;
            }
            if value.kind() != info.kind {
                return Err(SettingsError::TypeMismatch {
                    key: key.clone(),
                    expected: info.kind,
                    actual: value.kind(),
                });
            }
            state.auto_update.remove(key);
            state.staged.insert(key.clone(), value.clone());
            self.changed.store(true, Ordering::Release);
        }
        Ok(unmatched)
    }

    /// Stages tag-driven updates for keys still in the auto-update set.
    /// Unknown keys and kind mismatches are dropped silently; this path
    /// never fails.
    pub fn auto_update<B: BlockFields + ?Sized>(&self, block: &B, parameters: &PropertyMap) {
        let mut state = self.lock();
        for (key, value) in parameters {
            if !state.auto_update.contains(key) {
                continue;
            }
            let Some(index) = block.field_index(key) else {
                continue;
            };
            let Some(info) = block.field_info(index) else {
                continue;
            };
            if info.writable && value.kind() == info.kind {
                state.staged.insert(key.clone(), value.clone());
                self.changed.store(true, Ordering::Release);
            }
        }
    }

    /// Synchronises the staged overlay into the block's fields.
    ///
    /// Runs under the engine's mutex, in this order: a staged
    /// [`RESET_DEFAULTS`] replaces the staged set with the defaults; each
    /// staged value is validated and written (rejections are logged and
    /// skipped; auto-forward keys propagate regardless); `active` is rebuilt
    /// from the fields; the block's `settings_changed` hook fires at most
    /// once, and only when something was applied; a staged
    /// [`STORE_DEFAULTS`] snapshots the new active set; a reset invokes the
    /// block's `reset()` hook. The staged set and the changed flag are
    /// always cleared.
    pub fn apply_staged<B: Block + ?Sized>(&self, block: &mut B) -> ApplyStagedResult {
        let mut state = self.lock();
        let mut result = ApplyStagedResult::default();

        let old_active = snapshot_fields(block);

        let reset_requested = state.staged.contains_key(RESET_DEFAULTS);
        if reset_requested {
            state.staged.clear();
            let defaults = state.defaults.clone();
            state.staged = defaults;
        }
        let store_requested = state.staged.contains_key(STORE_DEFAULTS);

        for (key, value) in &state.staged {
            if let Some(index) = block.field_index(key) {
                let writable = block
                    .field_info(index)
                    .map(|info| info.writable && value.kind() == info.kind)
                    .unwrap_or(false);
                if writable {
                    if block.set_field_value(index, value) {
                        result.applied.insert(key.clone(), value.clone());
                    } else {
                        warn!(key = %key, "staged value rejected by field constraints");
                    }
                }
            }
            if state.auto_forward.contains(key) {
                result.forward.insert(key.clone(), value.clone());
            }
        }

        state.active = snapshot_fields(block);

        if !result.applied.is_empty() {
            block.settings_changed(&old_active, &result.applied, &mut result.forward);
        }

        if store_requested {
            state.defaults = state.active.clone();
        }
        if reset_requested {
            block.reset();
        }

        state.staged.clear();
        self.changed.store(false, Ordering::Release);
        result
    }

    /// Snapshots the current field values as the defaults restored by
    /// [`RESET_DEFAULTS`].
    pub fn store_defaults<B: BlockFields + ?Sized>(&self, block: &B) {
        let snapshot = snapshot_fields(block);
        self.lock().defaults = snapshot;
    }

    /// Restores the stored defaults immediately (stages [`RESET_DEFAULTS`]
    /// and applies).
    pub fn reset_defaults<B: Block + ?Sized>(&self, block: &mut B) -> ApplyStagedResult {
        self.lock()
            .staged
            .insert(RESET_DEFAULTS.to_owned(), Pmt::Bool(true));
        self.changed.store(true, Ordering::Release);
        self.apply_staged(block)
    }

    /// Re-reads every readable field into the active map. Call after
    /// mutating fields behind the engine's back.
    pub fn update_active<B: BlockFields + ?Sized>(&self, block: &B) {
        let snapshot = snapshot_fields(block);
        self.lock().active = snapshot;
    }

    /// All active parameters.
    pub fn get(&self) -> PropertyMap {
        self.lock().active.clone()
    }

    /// Active parameters for the given keys (missing keys are omitted).
    pub fn get_keys(&self, keys: &[&str]) -> PropertyMap {
        let state = self.lock();
        keys.iter()
            .filter_map(|key| {
                state
                    .active
                    .get(*key)
                    .map(|value| ((*key).to_owned(), value.clone()))
            })
            .collect()
    }

    /// A single active parameter.
    pub fn get_one(&self, key: &str) -> Option<Pmt> {
        self.lock().active.get(key).cloned()
    }

    /// The staged, not-yet-applied parameters.
    pub fn staged_parameters(&self) -> PropertyMap {
        self.lock().staged.clone()
    }

    /// Keys still eligible for tag-driven updates.
    pub fn auto_update_keys(&self) -> BTreeSet<String> {
        self.lock().auto_update.clone()
    }

    /// Keys forwarded downstream after an apply.
    pub fn auto_forward_keys(&self) -> BTreeSet<String> {
        self.lock().auto_forward.clone()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().expect("settings mutex poisoned")
    }
}

fn snapshot_fields<B: BlockFields + ?Sized>(block: &B) -> PropertyMap {
    let mut map = PropertyMap::new();
    for index in 0..block.field_count() {
        let Some(info) = block.field_info(index) else {
            continue;
        };
        if !info.readable {
            continue;
        }
        if let Some(value) = block.field_value(index) {
            map.insert(info.name.to_owned(), value);
        }
    }
    map
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::{Block, WorkIo, WorkResult};
    use crate::fields::{Annotated, FieldDescriptor};
    use crate::pmt::{property_map, PmtKind};
    use crate::tag::SAMPLE_RATE;

    struct TestBlock {
        sample_rate: Annotated<f32>,
        gain: f64,
        changed_calls: usize,
        reset_calls: usize,
    }

    impl TestBlock {
        fn new() -> Self {
            Self {
                sample_rate: Annotated::new(1000.0).with_limits(1.0, 192_000.0),
                gain: 0.0,
                changed_calls: 0,
                reset_calls: 0,
            }
        }
    }

    impl BlockFields for TestBlock {
        fn field_count(&self) -> usize {
            2
        }

        fn field_info(&self, index: usize) -> Option<FieldDescriptor> {
            match index {
                0 => Some(FieldDescriptor::new(SAMPLE_RATE, PmtKind::F32).with_unit("Hz")),
                1 => Some(FieldDescriptor::new("gain", PmtKind::F64).with_unit("dB")),
                _ => None,
            }
        }

        fn field_value(&self, index: usize) -> Option<Pmt> {
            match index {
                0 => Some(Pmt::F32(*self.sample_rate)),
                1 => Some(Pmt::F64(self.gain)),
                _ => None,
            }
        }

        fn set_field_value(&mut self, index: usize, value: &Pmt) -> bool {
            match (index, value) {
                (0, Pmt::F32(v)) => self.sample_rate.validate_and_set(*v),
                (1, Pmt::F64(v)) => {
                    self.gain = *v;
                    true
                }
                _ => false,
            }
        }
    }

    impl Block for TestBlock {
        fn type_name(&self) -> &'static str {
            "TestBlock"
        }

        fn work(&mut self, _io: &mut WorkIo, requested: u64) -> WorkResult {
            WorkResult::done(requested)
        }

        fn settings_changed(
            &mut self,
            _old: &PropertyMap,
            _new: &PropertyMap,
            _forward: &mut PropertyMap,
        ) {
            self.changed_calls += 1;
        }

        fn reset(&mut self) {
            self.reset_calls += 1;
        }
    }

    #[test]
    fn test_construction_seeds_sets() {
        let block = TestBlock::new();
        let settings = Settings::for_block(&block);

        assert!(!settings.changed());
        assert!(settings.auto_update_keys().contains(SAMPLE_RATE));
        assert!(settings.auto_update_keys().contains("gain"));
        assert!(settings.auto_forward_keys().contains(SAMPLE_RATE));
        assert!(!settings.auto_forward_keys().contains("gain"));
        assert_eq!(settings.get_one(SAMPLE_RATE), Some(Pmt::F32(1000.0)));
    }

    #[test]
    fn test_set_then_apply_round_trip() {
        let mut block = TestBlock::new();
        let settings = Settings::for_block(&block);

        let unmatched = settings
            .set(&block, &property_map([(SAMPLE_RATE, Pmt::F32(2000.0))]))
            .unwrap();
        assert!(unmatched.is_empty());
        assert!(settings.changed());
        assert_eq!(
            settings.staged_parameters(),
            property_map([(SAMPLE_RATE, Pmt::F32(2000.0))])
        );

        let result = settings.apply_staged(&mut block);
        assert_eq!(
            result.applied,
            property_map([(SAMPLE_RATE, Pmt::F32(2000.0))])
        );
        assert_eq!(
            result.forward,
            property_map([(SAMPLE_RATE, Pmt::F32(2000.0))])
        );
        assert_eq!(*block.sample_rate, 2000.0);
        assert_eq!(settings.get_one(SAMPLE_RATE), Some(Pmt::F32(2000.0)));
        assert!(!settings.changed());
        assert!(settings.staged_parameters().is_empty());
        assert_eq!(block.changed_calls, 1);
    }

    #[test]
    fn test_apply_is_idempotent_when_nothing_staged() {
        let mut block = TestBlock::new();
        let settings = Settings::for_block(&block);

        settings
            .set(&block, &property_map([("gain", Pmt::F64(3.0))]))
            .unwrap();
        let first = settings.apply_staged(&mut block);
        assert!(!first.applied.is_empty());

        let second = settings.apply_staged(&mut block);
        assert!(second.applied.is_empty());
        assert!(second.forward.is_empty());
        assert!(!settings.changed());
        assert_eq!(block.changed_calls, 1);
    }

    #[test]
    fn test_type_mismatch_is_an_error() {
        let block = TestBlock::new();
        let settings = Settings::for_block(&block);

        let err = settings
            .set(&block, &property_map([(SAMPLE_RATE, Pmt::F64(2000.0))]))
            .unwrap_err();
        assert_eq!(
            err,
            SettingsError::TypeMismatch {
                key: SAMPLE_RATE.to_owned(),
                expected: PmtKind::F32,
                actual: PmtKind::F64,
            }
        );
    }

    #[test]
    fn test_unknown_keys_are_echoed() {
        let block = TestBlock::new();
        let settings = Settings::for_block(&block);

        let unmatched = settings
            .set(&block, &property_map([("unknown", Pmt::U32(1))]))
            .unwrap();
        assert_eq!(unmatched, property_map([("unknown", Pmt::U32(1))]));
    }

    #[test]
    fn test_explicit_set_overrides_auto_update() {
        let mut block = TestBlock::new();
        let settings = Settings::for_block(&block);

        settings
            .set(&block, &property_map([(SAMPLE_RATE, Pmt::F32(2000.0))]))
            .unwrap();
        assert!(!settings.auto_update_keys().contains(SAMPLE_RATE));
        settings.apply_staged(&mut block);

        // Tag-driven updates are now ignored for this key.
        settings.auto_update(&block, &property_map([(SAMPLE_RATE, Pmt::F32(48000.0))]));
        assert!(!settings.changed());
        settings.apply_staged(&mut block);
        assert_eq!(*block.sample_rate, 2000.0);
    }

    #[test]
    fn test_auto_update_stages_known_keys() {
        let mut block = TestBlock::new();
        let settings = Settings::for_block(&block);

        settings.auto_update(
            &block,
            &property_map([(SAMPLE_RATE, Pmt::F32(48000.0)), ("bogus", Pmt::U8(1))]),
        );
        assert!(settings.changed());
        let result = settings.apply_staged(&mut block);
        assert_eq!(*block.sample_rate, 48000.0);
        assert_eq!(
            result.forward,
            property_map([(SAMPLE_RATE, Pmt::F32(48000.0))])
        );
    }

    #[test]
    fn test_rejected_value_still_forwards() {
        let mut block = TestBlock::new();
        let settings = Settings::for_block(&block);

        // 0.5 is below the field's lower limit of 1.0.
        settings
            .set(&block, &property_map([(SAMPLE_RATE, Pmt::F32(0.5))]))
            .unwrap();
        let result = settings.apply_staged(&mut block);
        assert!(result.applied.is_empty());
        assert_eq!(result.forward, property_map([(SAMPLE_RATE, Pmt::F32(0.5))]));
        assert_eq!(*block.sample_rate, 1000.0);
        assert_eq!(block.changed_calls, 0);
    }

    #[test]
    fn test_store_and_reset_defaults() {
        let mut block = TestBlock::new();
        let settings = Settings::for_block(&block);

        settings
            .set(&block, &property_map([("gain", Pmt::F64(-6.0))]))
            .unwrap();
        settings.apply_staged(&mut block);
        settings.store_defaults(&block);

        settings
            .set(&block, &property_map([("gain", Pmt::F64(12.0))]))
            .unwrap();
        settings.apply_staged(&mut block);
        assert_eq!(block.gain, 12.0);

        settings.reset_defaults(&mut block);
        assert_eq!(block.gain, -6.0);
        assert_eq!(settings.get_one("gain"), Some(Pmt::F64(-6.0)));
        assert_eq!(block.reset_calls, 1);
    }

    #[test]
    fn test_reset_defaults_via_reserved_key() {
        let mut block = TestBlock::new();
        let settings = Settings::for_block(&block);

        settings
            .set(&block, &property_map([("gain", Pmt::F64(4.0))]))
            .unwrap();
        settings.apply_staged(&mut block);

        settings
            .set(
                &block,
                &property_map([(crate::tag::RESET_DEFAULTS, Pmt::Bool(true))]),
            )
            .unwrap();
        settings.apply_staged(&mut block);
        assert_eq!(block.gain, 0.0);
        assert_eq!(block.reset_calls, 1);
    }

    #[test]
    fn test_ctx_ordering_and_hash() {
        let untimed = SettingsCtx::default();
        let earlier = SettingsCtx::at(UNIX_EPOCH);
        let later = SettingsCtx::at(UNIX_EPOCH + std::time::Duration::from_secs(1));

        assert!(untimed < earlier);
        assert!(earlier < later);

        let mut ctx = SettingsCtx::at(UNIX_EPOCH);
        ctx.context = property_map([("channel", Pmt::U8(1))]);
        let same = ctx.clone();
        assert_eq!(ctx.hash(), same.hash());

        let mut other = ctx.clone();
        other.context = property_map([("channel", Pmt::U8(2))]);
        assert_ne!(ctx.hash(), other.hash());
    }
}
