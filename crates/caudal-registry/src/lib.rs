//! Block registry and factory for caudal processing blocks.
//!
//! This crate provides a centralized registry for discovering and
//! instantiating processing blocks. It enables dynamic block selection by
//! name — from configuration files, plugins, or user interfaces — and
//! provides metadata for building those interfaces.
//!
//! # Example
//!
//! ```rust
//! use caudal_registry::{BlockCategory, BlockDescriptor, BlockRegistry};
//! use caudal_core::pmt::PropertyMap;
//!
//! let mut registry = BlockRegistry::new();
//! # struct Osc;
//! # impl caudal_core::BlockFields for Osc {
//! #     fn field_count(&self) -> usize { 0 }
//! #     fn field_info(&self, _: usize) -> Option<caudal_core::FieldDescriptor> { None }
//! #     fn field_value(&self, _: usize) -> Option<caudal_core::Pmt> { None }
//! #     fn set_field_value(&mut self, _: usize, _: &caudal_core::Pmt) -> bool { false }
//! # }
//! # impl caudal_core::Block for Osc {
//! #     fn type_name(&self) -> &'static str { "osc" }
//! #     fn work(&mut self, _: &mut caudal_core::WorkIo, r: u64) -> caudal_core::WorkResult {
//! #         caudal_core::WorkResult::done(r)
//! #     }
//! # }
//! registry.register(
//!     BlockDescriptor {
//!         id: "osc",
//!         name: "Oscillator",
//!         description: "Fixed-frequency test source",
//!         category: BlockCategory::Source,
//!     },
//!     |_params| Box::new(Osc),
//! );
//!
//! let block = registry.create("osc", &PropertyMap::new());
//! assert!(block.is_some());
//! ```

use caudal_core::pmt::PropertyMap;
use caudal_core::Block;

/// Category of processing block for organization and filtering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BlockCategory {
    /// Stream origins (signal generators, file readers, hardware input).
    Source,
    /// Stream ends (file writers, hardware output, probes).
    Sink,
    /// Sample-in/sample-out processing.
    Transform,
    /// Measurement and inspection blocks.
    Analysis,
    /// Glue blocks (throttles, converters, multiplexers).
    Utility,
}

impl BlockCategory {
    /// Returns a human-readable name for the category.
    pub const fn name(&self) -> &'static str {
        match self {
            BlockCategory::Source => "Source",
            BlockCategory::Sink => "Sink",
            BlockCategory::Transform => "Transform",
            BlockCategory::Analysis => "Analysis",
            BlockCategory::Utility => "Utility",
        }
    }
}

/// Describes a block type in the registry.
#[derive(Debug, Clone)]
pub struct BlockDescriptor {
    /// Unique identifier (lowercase, no spaces).
    pub id: &'static str,
    /// Human-readable name.
    pub name: &'static str,
    /// Brief description of the block.
    pub description: &'static str,
    /// Category for organization.
    pub category: BlockCategory,
}

/// Factory function type for creating blocks from construction parameters.
pub type BlockFactory = fn(&PropertyMap) -> Box<dyn Block>;

struct RegistryEntry {
    descriptor: BlockDescriptor,
    factory: BlockFactory,
}

/// Registry of available block types.
///
/// Unlike an effect chain, the registry starts empty: block providers
/// (built-in libraries, plugins) register their types at load time.
#[derive(Default)]
pub struct BlockRegistry {
    entries: Vec<RegistryEntry>,
}

impl BlockRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    /// Registers a block type. A duplicate id replaces the earlier entry.
    pub fn register(&mut self, descriptor: BlockDescriptor, factory: BlockFactory) {
        self.entries.retain(|e| e.descriptor.id != descriptor.id);
        self.entries.push(RegistryEntry {
            descriptor,
            factory,
        });
    }

    /// Returns descriptors for all registered block types.
    pub fn all_blocks(&self) -> Vec<&BlockDescriptor> {
        self.entries.iter().map(|e| &e.descriptor).collect()
    }

    /// Returns the ids of all registered block types.
    pub fn provided_blocks(&self) -> Vec<&'static str> {
        self.entries.iter().map(|e| e.descriptor.id).collect()
    }

    /// Returns descriptors for block types in a specific category.
    pub fn blocks_in_category(&self, category: BlockCategory) -> Vec<&BlockDescriptor> {
        self.entries
            .iter()
            .filter(|e| e.descriptor.category == category)
            .map(|e| &e.descriptor)
            .collect()
    }

    /// Get a descriptor by block id.
    pub fn get(&self, id: &str) -> Option<&BlockDescriptor> {
        self.entries
            .iter()
            .find(|e| e.descriptor.id == id)
            .map(|e| &e.descriptor)
    }

    /// Create a block instance by id, passing construction parameters
    /// through to the factory. Returns `None` for an unknown id.
    pub fn create(&self, id: &str, parameters: &PropertyMap) -> Option<Box<dyn Block>> {
        self.entries
            .iter()
            .find(|e| e.descriptor.id == id)
            .map(|e| (e.factory)(parameters))
    }

    /// Returns the number of registered block types.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if no block types are registered.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use caudal_core::pmt::{property_map, Pmt};
    use caudal_core::{
        Annotated, BlockFields, FieldDescriptor, PmtKind, WorkIo, WorkResult,
    };

    struct ToneSource {
        frequency: Annotated<f64>,
    }

    impl ToneSource {
        fn from_params(parameters: &PropertyMap) -> Self {
            let frequency = match parameters.get("frequency") {
                Some(Pmt::F64(v)) => *v,
                _ => 440.0,
            };
            Self {
                frequency: Annotated::new(frequency).with_limits(0.0, 20_000.0),
            }
        }
    }

    impl BlockFields for ToneSource {
        fn field_count(&self) -> usize {
            1
        }

        fn field_info(&self, index: usize) -> Option<FieldDescriptor> {
            (index == 0).then(|| FieldDescriptor::new("frequency", PmtKind::F64).with_unit("Hz"))
        }

        fn field_value(&self, index: usize) -> Option<Pmt> {
            (index == 0).then(|| Pmt::F64(*self.frequency))
        }

        fn set_field_value(&mut self, index: usize, value: &Pmt) -> bool {
            match (index, value) {
                (0, Pmt::F64(v)) => self.frequency.validate_and_set(*v),
                _ => false,
            }
        }
    }

    impl caudal_core::Block for ToneSource {
        fn type_name(&self) -> &'static str {
            "ToneSource"
        }

        fn work(&mut self, _io: &mut WorkIo, requested: u64) -> WorkResult {
            WorkResult::done(requested)
        }
    }

    fn tone_descriptor() -> BlockDescriptor {
        BlockDescriptor {
            id: "tone",
            name: "Tone Source",
            description: "Fixed-frequency test source",
            category: BlockCategory::Source,
        }
    }

    #[test]
    fn test_register_and_create() {
        let mut registry = BlockRegistry::new();
        assert!(registry.is_empty());

        registry.register(tone_descriptor(), |p| Box::new(ToneSource::from_params(p)));
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.provided_blocks(), vec!["tone"]);

        let block = registry
            .create("tone", &property_map([("frequency", Pmt::F64(1000.0))]))
            .expect("tone is registered");
        assert_eq!(block.type_name(), "ToneSource");
        assert_eq!(block.field_value(0), Some(Pmt::F64(1000.0)));

        assert!(registry.create("missing", &PropertyMap::new()).is_none());
    }

    #[test]
    fn test_construction_params_fall_back_to_defaults() {
        let mut registry = BlockRegistry::new();
        registry.register(tone_descriptor(), |p| Box::new(ToneSource::from_params(p)));

        let block = registry
            .create("tone", &PropertyMap::new())
            .expect("registered");
        assert_eq!(block.field_value(0), Some(Pmt::F64(440.0)));
    }

    #[test]
    fn test_category_filter() {
        let mut registry = BlockRegistry::new();
        registry.register(tone_descriptor(), |p| Box::new(ToneSource::from_params(p)));

        assert_eq!(registry.blocks_in_category(BlockCategory::Source).len(), 1);
        assert!(registry.blocks_in_category(BlockCategory::Sink).is_empty());
        assert_eq!(BlockCategory::Source.name(), "Source");
    }

    #[test]
    fn test_duplicate_id_replaces() {
        let mut registry = BlockRegistry::new();
        registry.register(tone_descriptor(), |p| Box::new(ToneSource::from_params(p)));
        registry.register(tone_descriptor(), |p| Box::new(ToneSource::from_params(p)));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_get_descriptor() {
        let mut registry = BlockRegistry::new();
        registry.register(tone_descriptor(), |p| Box::new(ToneSource::from_params(p)));

        let descriptor = registry.get("tone").expect("registered");
        assert_eq!(descriptor.name, "Tone Source");
        assert_eq!(descriptor.category, BlockCategory::Source);
        assert!(registry.get("missing").is_none());
    }
}
