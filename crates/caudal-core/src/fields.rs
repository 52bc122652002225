//! Field introspection for blocks.
//!
//! The settings engine never sees a block's concrete type; it programs
//! against [`BlockFields`], an index-based member iterator the block author
//! implements by hand (a match per field). Each field is described by a
//! [`FieldDescriptor`] carrying the name, value kind, capabilities and
//! display metadata.
//!
//! [`Annotated`] wraps a field value with limits and an optional validator;
//! `set_field_value` implementations route writes through
//! [`Annotated::validate_and_set`] so out-of-range values are rejected
//! without touching the field.
//!
//! # Example
//!
//! ```rust
//! use caudal_core::fields::{Annotated, BlockFields, FieldDescriptor};
//! use caudal_core::pmt::{Pmt, PmtKind};
//!
//! struct Oscillator {
//!     sample_rate: Annotated<f32>,
//!     label: String,
//! }
//!
//! impl BlockFields for Oscillator {
//!     fn field_count(&self) -> usize {
//!         2
//!     }
//!
//!     fn field_info(&self, index: usize) -> Option<FieldDescriptor> {
//!         match index {
//!             0 => Some(FieldDescriptor::new("sample_rate", PmtKind::F32).with_unit("Hz")),
//!             1 => Some(FieldDescriptor::new("label", PmtKind::Str)),
//!             _ => None,
//!         }
//!     }
//!
//!     fn field_value(&self, index: usize) -> Option<Pmt> {
//!         match index {
//!             0 => Some(Pmt::F32(*self.sample_rate)),
//!             1 => Some(Pmt::Str(self.label.clone())),
//!             _ => None,
//!         }
//!     }
//!
//!     fn set_field_value(&mut self, index: usize, value: &Pmt) -> bool {
//!         match (index, value) {
//!             (0, Pmt::F32(v)) => self.sample_rate.validate_and_set(*v),
//!             (1, Pmt::Str(v)) => {
//!                 self.label = v.clone();
//!                 true
//!             }
//!             _ => false,
//!         }
//!     }
//! }
//! ```

use crate::pmt::{Pmt, PmtKind};

/// Metadata describing one introspectable block field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldDescriptor {
    /// Field name; doubles as the settings key and the stream-tag key.
    pub name: &'static str,
    /// Value kind accepted by the field.
    pub kind: PmtKind,
    pub readable: bool,
    pub writable: bool,
    /// One-line description for UIs and generated documentation.
    pub description: &'static str,
    /// Display unit (e.g. `"Hz"`, `"dB"`). Empty when dimensionless.
    pub unit: &'static str,
    /// Whether generic UIs should show the field.
    pub visible: bool,
}

impl FieldDescriptor {
    /// A readable, writable, visible field with no extra metadata.
    pub const fn new(name: &'static str, kind: PmtKind) -> Self {
        Self {
            name,
            kind,
            readable: true,
            writable: true,
            description: "",
            unit: "",
            visible: true,
        }
    }

    pub const fn with_description(mut self, description: &'static str) -> Self {
        self.description = description;
        self
    }

    pub const fn with_unit(mut self, unit: &'static str) -> Self {
        self.unit = unit;
        self
    }

    pub const fn read_only(mut self) -> Self {
        self.writable = false;
        self
    }

    pub const fn hidden(mut self) -> Self {
        self.visible = false;
        self
    }
}

/// Index-based member iterator over a block's parameter fields.
///
/// Indices must be stable for the lifetime of the block instance; valid
/// indices are `0..field_count()`.
pub trait BlockFields {
    /// Number of introspectable fields.
    fn field_count(&self) -> usize;

    /// Descriptor for the field at `index`, or `None` past the end.
    fn field_info(&self, index: usize) -> Option<FieldDescriptor>;

    /// Current value of the field at `index` as a property value.
    fn field_value(&self, index: usize) -> Option<Pmt>;

    /// Writes a value into the field at `index`.
    ///
    /// Returns `false` when the index is out of range, the value kind does
    /// not match, or a validator/limit rejected the value. The field is left
    /// untouched in every `false` case.
    fn set_field_value(&mut self, index: usize, value: &Pmt) -> bool;

    /// Finds a field index by name.
    fn field_index(&self, name: &str) -> Option<usize> {
        (0..self.field_count()).find(|&i| self.field_info(i).is_some_and(|d| d.name == name))
    }
}

/// A field value carrying limits and an optional validator.
///
/// Dereferences to the inner value, so DSP code reads it like a plain field.
#[derive(Debug, Clone)]
pub struct Annotated<T> {
    value: T,
    limits: Option<(T, T)>,
    validator: Option<fn(&T) -> bool>,
}

impl<T: PartialOrd> Annotated<T> {
    pub fn new(value: T) -> Self {
        Self {
            value,
            limits: None,
            validator: None,
        }
    }

    /// Restricts accepted values to `[min, max]`.
    pub fn with_limits(mut self, min: T, max: T) -> Self {
        self.limits = Some((min, max));
        self
    }

    /// Adds a custom acceptance predicate, checked after the limits.
    pub fn with_validator(mut self, validator: fn(&T) -> bool) -> Self {
        self.validator = Some(validator);
        self
    }

    /// Writes `value` if the limits and validator accept it.
    pub fn validate_and_set(&mut self, value: T) -> bool {
        if let Some((min, max)) = &self.limits {
            if value < *min || value > *max {
                return false;
            }
        }
        if let Some(validator) = self.validator {
            if !validator(&value) {
                return false;
            }
        }
        self.value = value;
        true
    }

    pub fn get(&self) -> &T {
        &self.value
    }
}

impl<T> std::ops::Deref for Annotated<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.value
    }
}

impl<T: PartialOrd + Default> Default for Annotated<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Probe {
        gain: Annotated<f64>,
        enabled: bool,
    }

    impl BlockFields for Probe {
        fn field_count(&self) -> usize {
            2
        }

        fn field_info(&self, index: usize) -> Option<FieldDescriptor> {
            match index {
                0 => Some(FieldDescriptor::new("gain", PmtKind::F64).with_unit("dB")),
                1 => Some(FieldDescriptor::new("enabled", PmtKind::Bool)),
                _ => None,
            }
        }

        fn field_value(&self, index: usize) -> Option<Pmt> {
            match index {
                0 => Some(Pmt::F64(*self.gain)),
                1 => Some(Pmt::Bool(self.enabled)),
                _ => None,
            }
        }

        fn set_field_value(&mut self, index: usize, value: &Pmt) -> bool {
            match (index, value) {
                (0, Pmt::F64(v)) => self.gain.validate_and_set(*v),
                (1, Pmt::Bool(v)) => {
                    self.enabled = *v;
                    true
                }
                _ => false,
            }
        }
    }

    fn probe() -> Probe {
        Probe {
            gain: Annotated::new(0.0).with_limits(-60.0, 12.0),
            enabled: true,
        }
    }

    #[test]
    fn test_field_lookup() {
        let probe = probe();
        assert_eq!(probe.field_index("gain"), Some(0));
        assert_eq!(probe.field_index("enabled"), Some(1));
        assert_eq!(probe.field_index("missing"), None);
        assert!(probe.field_info(2).is_none());
    }

    #[test]
    fn test_limits_reject_out_of_range() {
        let mut probe = probe();
        assert!(probe.set_field_value(0, &Pmt::F64(-10.0)));
        assert_eq!(probe.field_value(0), Some(Pmt::F64(-10.0)));

        assert!(!probe.set_field_value(0, &Pmt::F64(100.0)));
        assert_eq!(probe.field_value(0), Some(Pmt::F64(-10.0)));
    }

    #[test]
    fn test_kind_mismatch_rejected() {
        let mut probe = probe();
        assert!(!probe.set_field_value(0, &Pmt::I32(3)));
        assert!(!probe.set_field_value(1, &Pmt::F64(1.0)));
    }

    #[test]
    fn test_validator_runs_after_limits() {
        let mut value = Annotated::new(2.0f64)
            .with_limits(0.0, 10.0)
            .with_validator(|v| *v != 5.0);
        assert!(value.validate_and_set(3.0));
        assert!(!value.validate_and_set(5.0));
        assert!(!value.validate_and_set(11.0));
        assert_eq!(*value, 3.0);
    }

    #[test]
    fn test_descriptor_builders() {
        let desc = FieldDescriptor::new("x", PmtKind::F32)
            .with_description("probe")
            .read_only()
            .hidden();
        assert!(!desc.writable);
        assert!(!desc.visible);
        assert_eq!(desc.description, "probe");
    }
}
