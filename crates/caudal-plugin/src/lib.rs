//! Dynamic plugin ABI for caudal block providers.
//!
//! A plugin is a shared library exposing two C symbols:
//!
//! - `plugin_make() -> *mut Plugin` — returns the provider instance
//! - `plugin_free(*mut Plugin)` — releases it
//!
//! The [`Plugin`] object carries metadata, an ABI version, and a
//! [`BlockRegistry`] of the block types it provides. Hosts load plugins with
//! [`LoadedPlugin::load`], which refuses any library whose ABI version does
//! not match [`PLUGIN_ABI_VERSION`].
//!
//! Plugin authors use [`declare_plugin!`] to export the symbols:
//!
//! ```rust,ignore
//! use caudal_plugin::declare_plugin;
//! use caudal_registry::{BlockCategory, BlockDescriptor};
//!
//! declare_plugin! {
//!     name: "demo-blocks",
//!     author: "Example Author",
//!     license: "MIT",
//!     version: "0.1.0",
//!     register: |plugin| {
//!         plugin.register(
//!             BlockDescriptor {
//!                 id: "noise",
//!                 name: "Noise Source",
//!                 description: "Uniform white noise",
//!                 category: BlockCategory::Source,
//!             },
//!             |params| Box::new(NoiseSource::from_params(params)),
//!         );
//!     }
//! }
//! ```

use std::path::Path;

use thiserror::Error;

use caudal_core::pmt::PropertyMap;
use caudal_core::Block;
use caudal_registry::{BlockDescriptor, BlockFactory, BlockRegistry};

/// Current plugin ABI version. Hosts refuse plugins reporting anything else.
pub const PLUGIN_ABI_VERSION: u8 = 1;

/// Short descriptive strings identifying a plugin.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PluginMetadata {
    pub name: &'static str,
    pub author: &'static str,
    pub license: &'static str,
    pub version: &'static str,
}

/// A block provider: metadata plus a registry of provided block types.
pub struct Plugin {
    abi_version: u8,
    metadata: PluginMetadata,
    registry: BlockRegistry,
}

impl Plugin {
    pub fn new(metadata: PluginMetadata) -> Self {
        Self {
            abi_version: PLUGIN_ABI_VERSION,
            metadata,
            registry: BlockRegistry::new(),
        }
    }

    /// ABI version baked in at build time.
    pub fn abi_version(&self) -> u8 {
        self.abi_version
    }

    pub fn metadata(&self) -> &PluginMetadata {
        &self.metadata
    }

    /// Registers a provided block type.
    pub fn register(&mut self, descriptor: BlockDescriptor, factory: BlockFactory) {
        self.registry.register(descriptor, factory);
    }

    /// Ids of all provided block types.
    pub fn provided_blocks(&self) -> Vec<&'static str> {
        self.registry.provided_blocks()
    }

    /// Instantiates a provided block type with construction parameters.
    pub fn create_block(&self, id: &str, parameters: &PropertyMap) -> Option<Box<dyn Block>> {
        self.registry.create(id, parameters)
    }

    pub fn registry(&self) -> &BlockRegistry {
        &self.registry
    }
}

/// Plugin loading failures.
#[derive(Debug, Error)]
pub enum PluginError {
    #[error("failed to load plugin library: {0}")]
    Load(#[from] libloading::Error),

    #[error("plugin is missing the '{0}' entry symbol")]
    MissingSymbol(&'static str),

    #[error("incompatible plugin abi: host={host}, plugin={plugin}")]
    AbiMismatch { host: u8, plugin: u8 },

    #[error("plugin entry returned a null provider")]
    NullPlugin,
}

type PluginMakeFn = unsafe extern "C" fn() -> *mut Plugin;
type PluginFreeFn = unsafe extern "C" fn(*mut Plugin);

/// A plugin loaded from a shared library. Dereferences to [`Plugin`];
/// dropping it frees the provider and unloads the library.
#[derive(Debug)]
pub struct LoadedPlugin {
    // Field order matters: the provider must be freed before the library
    // is unloaded.
    plugin: *mut Plugin,
    free: PluginFreeFn,
    _library: libloading::Library,
}

impl LoadedPlugin {
    /// Loads a plugin from `path`, resolving the entry symbols and checking
    /// the ABI version.
    pub fn load(path: &Path) -> Result<Self, PluginError> {
        // SAFETY: loading a shared object runs its initialisers; the path is
        // operator-provided, which is the trust boundary of any plugin host.
        let library = unsafe { libloading::Library::new(path)? };

        let make: libloading::Symbol<'_, PluginMakeFn> = unsafe {
            library
                .get(b"plugin_make\0")
                .map_err(|_| PluginError::MissingSymbol("plugin_make"))?
        };
        let free: libloading::Symbol<'_, PluginFreeFn> = unsafe {
            library
                .get(b"plugin_free\0")
                .map_err(|_| PluginError::MissingSymbol("plugin_free"))?
        };
        let free = *free;

        // SAFETY: symbol signatures are fixed by the ABI contract.
        let plugin = unsafe { make() };
        if plugin.is_null() {
            return Err(PluginError::NullPlugin);
        }

        // SAFETY: non-null, just produced by the plugin.
        let abi = unsafe { (*plugin).abi_version() };
        if abi != PLUGIN_ABI_VERSION {
            unsafe { free(plugin) };
            return Err(PluginError::AbiMismatch {
                host: PLUGIN_ABI_VERSION,
                plugin: abi,
            });
        }

        Ok(Self {
            plugin,
            free,
            _library: library,
        })
    }
}

impl std::ops::Deref for LoadedPlugin {
    type Target = Plugin;

    fn deref(&self) -> &Plugin {
        // SAFETY: non-null for the lifetime of self; the provider outlives
        // every borrow of it.
        unsafe { &*self.plugin }
    }
}

impl Drop for LoadedPlugin {
    fn drop(&mut self) {
        // SAFETY: owned pointer, freed exactly once, before the library.
        unsafe { (self.free)(self.plugin) };
    }
}

// SAFETY: the provider is immutable after construction and all registry
// state is `Send`.
unsafe impl Send for LoadedPlugin {}

/// Exports the `plugin_make`/`plugin_free` C symbols for a plugin crate.
///
/// `register` receives the fresh [`Plugin`] and adds the provided block
/// types to it.
#[macro_export]
macro_rules! declare_plugin {
    (
        name: $name:expr,
        author: $author:expr,
        license: $license:expr,
        version: $version:expr,
        register: $register:expr $(,)?
    ) => {
        #[no_mangle]
        pub extern "C" fn plugin_make() -> *mut $crate::Plugin {
            let mut plugin = $crate::Plugin::new($crate::PluginMetadata {
                name: $name,
                author: $author,
                license: $license,
                version: $version,
            });
            let register: fn(&mut $crate::Plugin) = $register;
            register(&mut plugin);
            Box::into_raw(Box::new(plugin))
        }

        #[no_mangle]
        pub extern "C" fn plugin_free(plugin: *mut $crate::Plugin) {
            if !plugin.is_null() {
                // SAFETY: pointer produced by `plugin_make` above.
                drop(unsafe { Box::from_raw(plugin) });
            }
        }
    };
}

#[cfg(test)]
mod tests {
    use super::*;
    use caudal_core::pmt::property_map;
    use caudal_core::{BlockFields, FieldDescriptor, Pmt, WorkIo, WorkResult};
    use caudal_registry::BlockCategory;

    struct NullSource;

    impl BlockFields for NullSource {
        fn field_count(&self) -> usize {
            0
        }
        fn field_info(&self, _: usize) -> Option<FieldDescriptor> {
            None
        }
        fn field_value(&self, _: usize) -> Option<Pmt> {
            None
        }
        fn set_field_value(&mut self, _: usize, _: &Pmt) -> bool {
            false
        }
    }

    impl Block for NullSource {
        fn type_name(&self) -> &'static str {
            "NullSource"
        }

        fn work(&mut self, _io: &mut WorkIo, requested: u64) -> WorkResult {
            WorkResult::done(requested)
        }
    }

    fn demo_plugin() -> Plugin {
        let mut plugin = Plugin::new(PluginMetadata {
            name: "demo",
            author: "tests",
            license: "MIT",
            version: "0.0.1",
        });
        plugin.register(
            BlockDescriptor {
                id: "null",
                name: "Null Source",
                description: "Emits nothing",
                category: BlockCategory::Source,
            },
            |_| Box::new(NullSource),
        );
        plugin
    }

    #[test]
    fn test_plugin_provides_blocks() {
        let plugin = demo_plugin();
        assert_eq!(plugin.abi_version(), PLUGIN_ABI_VERSION);
        assert_eq!(plugin.metadata().name, "demo");
        assert_eq!(plugin.provided_blocks(), vec!["null"]);

        let block = plugin
            .create_block("null", &property_map([("ignored", Pmt::Bool(true))]))
            .expect("null is provided");
        assert_eq!(block.type_name(), "NullSource");
        assert!(plugin.create_block("missing", &PropertyMap::new()).is_none());
    }

    // The C entry points, exercised in-process: the same round trip a host
    // performs after dlopen.
    mod exported {
        use super::*;

        declare_plugin! {
            name: "in-process",
            author: "tests",
            license: "MIT",
            version: "0.0.1",
            register: |plugin| {
                plugin.register(
                    BlockDescriptor {
                        id: "null",
                        name: "Null Source",
                        description: "Emits nothing",
                        category: BlockCategory::Source,
                    },
                    |_| Box::new(NullSource),
                );
            },
        }
    }

    #[test]
    fn test_exported_symbols_round_trip() {
        let plugin = exported::plugin_make();
        assert!(!plugin.is_null());
        let provided = unsafe { (*plugin).provided_blocks() };
        assert_eq!(provided, vec!["null"]);
        assert_eq!(unsafe { (*plugin).abi_version() }, PLUGIN_ABI_VERSION);
        exported::plugin_free(plugin);
    }

    #[test]
    fn test_load_rejects_missing_file() {
        let error = LoadedPlugin::load(Path::new("/nonexistent/libdemo.so")).unwrap_err();
        assert!(matches!(error, PluginError::Load(_)));
    }
}
