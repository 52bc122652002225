//! Stream tags: metadata attached to individual sample positions.
//!
//! Tags travel in a side-channel ring paired with each sample ring. A tag at
//! `index` logically precedes the sample with the same sequence and must be
//! consumed no later than that sample. The well-known keys below drive the
//! settings engine's auto-update/auto-forward machinery.

use serde::{Deserialize, Serialize};

use crate::pmt::PropertyMap;

/// Reserved key: staging it resets all parameters to their stored defaults.
pub const RESET_DEFAULTS: &str = "reset_defaults";

/// Reserved key: staging it snapshots the active parameters as the new
/// defaults.
pub const STORE_DEFAULTS: &str = "store_defaults";

/// Well-known stream-tag key: sample rate in Hz.
pub const SAMPLE_RATE: &str = "sample_rate";
/// Well-known stream-tag key: human-readable signal name.
pub const SIGNAL_NAME: &str = "signal_name";
/// Well-known stream-tag key: physical unit of the samples.
pub const SIGNAL_UNIT: &str = "signal_unit";
/// Well-known stream-tag key: expected minimum sample value.
pub const SIGNAL_MIN: &str = "signal_min";
/// Well-known stream-tag key: expected maximum sample value.
pub const SIGNAL_MAX: &str = "signal_max";
/// Well-known stream-tag key: trigger name.
pub const TRIGGER_NAME: &str = "trigger_name";
/// Well-known stream-tag key: trigger timestamp.
pub const TRIGGER_TIME: &str = "trigger_time";
/// Well-known stream-tag key: trigger offset in samples.
pub const TRIGGER_OFFSET: &str = "trigger_offset";
/// Well-known stream-tag key: multiplexing context.
pub const CONTEXT: &str = "context";

/// Keys a block field may auto-forward downstream when it carries the same
/// name (e.g. a `sample_rate` field re-emits its value as a tag).
pub const DEFAULT_TAG_KEYS: &[&str] = &[
    SAMPLE_RATE,
    SIGNAL_NAME,
    SIGNAL_UNIT,
    SIGNAL_MIN,
    SIGNAL_MAX,
    TRIGGER_NAME,
    TRIGGER_TIME,
    TRIGGER_OFFSET,
    CONTEXT,
];

/// A property map pinned to a sample sequence.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Tag {
    /// Sequence of the sample this tag precedes.
    pub index: i64,
    pub map: PropertyMap,
}

impl Tag {
    pub fn new(index: i64, map: PropertyMap) -> Self {
        Self { index, map }
    }
}
