//! Block ownership and topology.
//!
//! A [`Graph`] owns its blocks and edges; blocks never hold references back.
//! [`connect`](Graph::connect) only records a deferred connection
//! definition — nothing is type-checked or allocated until
//! [`init`](Graph::init) resolves every definition, installs the shared
//! rings, and clears the definition list. The topology is frozen from then
//! on; mutation after `init` is not supported.

use thiserror::Error;
use tracing::debug;

use crate::block::{Block, BlockModel};
use crate::port::{DynInput, DynOutput, WorkIo, DEFAULT_EDGE_CAPACITY};
use crate::ring::BufferError;

/// Handle to a block owned by a graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlockId(pub(crate) usize);

impl BlockId {
    pub fn index(self) -> usize {
        self.0
    }
}

/// Wiring failures surfaced by [`Graph::init`].
#[derive(Debug, Error)]
pub enum GraphError {
    #[error("block {0:?} does not exist in this graph")]
    BlockNotFound(BlockId),

    #[error("block '{block}' has no {direction} port named '{port}'")]
    PortNotFound {
        block: String,
        port: String,
        direction: &'static str,
    },

    #[error(
        "cannot connect '{src_port}' ({src_type}) to '{dst_port}' ({dst_type}): element types differ"
    )]
    TypeMismatch {
        src_port: String,
        dst_port: String,
        src_type: &'static str,
        dst_type: &'static str,
    },

    #[error("port '{port}' of block '{block}' is already connected")]
    PortAlreadyConnected { block: String, port: String },

    #[error("port '{port}' of block '{block}' was declared but never connected")]
    PortNotConnected { block: String, port: String },

    #[error(transparent)]
    Buffer(#[from] BufferError),
}

/// A resolved directed link between two ports.
#[derive(Debug, Clone)]
pub struct Edge {
    pub src: BlockId,
    pub src_port: &'static str,
    pub dst: BlockId,
    pub dst_port: &'static str,
}

struct ConnectionDefinition {
    src: BlockId,
    src_port: String,
    dst: BlockId,
    dst_port: String,
}

/// Owner of blocks, edges and pending connection definitions.
#[derive(Default)]
pub struct Graph {
    blocks: Vec<BlockModel>,
    edges: Vec<Edge>,
    pending: Vec<ConnectionDefinition>,
    edge_capacity: usize,
    initialised: bool,
}

impl Graph {
    pub fn new() -> Self {
        Self {
            blocks: Vec::new(),
            edges: Vec::new(),
            pending: Vec::new(),
            edge_capacity: DEFAULT_EDGE_CAPACITY,
            initialised: false,
        }
    }

    /// Overrides the sample-ring capacity installed per edge.
    pub fn with_edge_capacity(mut self, capacity: usize) -> Self {
        self.edge_capacity = capacity;
        self
    }

    /// Takes ownership of a block. The returned id stays valid for the
    /// graph's lifetime.
    pub fn add_block(&mut self, block: Box<dyn Block>) -> BlockId {
        let id = BlockId(self.blocks.len());
        self.blocks.push(BlockModel::new(block, id.0));
        id
    }

    /// Records a deferred connection from `src`'s output port to `dst`'s
    /// input port. Resolution (type checking, ring allocation) happens in
    /// [`init`](Self::init).
    pub fn connect(&mut self, src: BlockId, src_port: &str, dst: BlockId, dst_port: &str) {
        self.pending.push(ConnectionDefinition {
            src,
            src_port: src_port.to_owned(),
            dst,
            dst_port: dst_port.to_owned(),
        });
    }

    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }

    pub fn blocks(&self) -> &[BlockModel] {
        &self.blocks
    }

    pub fn blocks_mut(&mut self) -> &mut [BlockModel] {
        &mut self.blocks
    }

    pub fn block(&self, id: BlockId) -> Option<&BlockModel> {
        self.blocks.get(id.0)
    }

    pub fn block_mut(&mut self, id: BlockId) -> Option<&mut BlockModel> {
        self.blocks.get_mut(id.0)
    }

    pub fn edges(&self) -> &[Edge] {
        &self.edges
    }

    /// Whether every connection definition has been resolved.
    pub fn is_initialised(&self) -> bool {
        self.initialised
    }

    /// Resolves every pending connection definition: validates endpoints
    /// and element types, allocates the shared rings, and installs the
    /// endpoints on the blocks. Only on success is the definition list
    /// cleared. Subsequent calls are no-ops.
    pub fn init(&mut self) -> Result<(), GraphError> {
        if self.initialised {
            return Ok(());
        }
        // One slot per declared port; filled as definitions resolve.
        let mut input_slots: Vec<Vec<Option<Box<dyn DynInput>>>> = self
            .blocks
            .iter()
            .map(|b| b.declared_inputs().iter().map(|_| None).collect())
            .collect();
        let mut output_slots: Vec<Vec<Option<Box<dyn DynOutput>>>> = self
            .blocks
            .iter()
            .map(|b| b.declared_outputs().iter().map(|_| None).collect())
            .collect();

        for definition in &self.pending {
            let src_block = self
                .blocks
                .get(definition.src.0)
                .ok_or(GraphError::BlockNotFound(definition.src))?;
            let dst_block = self
                .blocks
                .get(definition.dst.0)
                .ok_or(GraphError::BlockNotFound(definition.dst))?;

            let src_ports = src_block.declared_outputs();
            let (src_index, src_desc) = src_ports
                .iter()
                .enumerate()
                .find(|(_, d)| d.name == definition.src_port)
                .ok_or_else(|| GraphError::PortNotFound {
                    block: src_block.unique_name().to_owned(),
                    port: definition.src_port.clone(),
                    direction: "output",
                })?;
            let dst_ports = dst_block.declared_inputs();
            let (dst_index, dst_desc) = dst_ports
                .iter()
                .enumerate()
                .find(|(_, d)| d.name == definition.dst_port)
                .ok_or_else(|| GraphError::PortNotFound {
                    block: dst_block.unique_name().to_owned(),
                    port: definition.dst_port.clone(),
                    direction: "input",
                })?;

            if src_desc.element_type() != dst_desc.element_type() {
                return Err(GraphError::TypeMismatch {
                    src_port: definition.src_port.clone(),
                    dst_port: definition.dst_port.clone(),
                    src_type: src_desc.type_name,
                    dst_type: dst_desc.type_name,
                });
            }
            if output_slots[definition.src.0][src_index].is_some() {
                return Err(GraphError::PortAlreadyConnected {
                    block: src_block.unique_name().to_owned(),
                    port: definition.src_port.clone(),
                });
            }
            if input_slots[definition.dst.0][dst_index].is_some() {
                return Err(GraphError::PortAlreadyConnected {
                    block: dst_block.unique_name().to_owned(),
                    port: definition.dst_port.clone(),
                });
            }

            let parts = src_desc.make_edge(self.edge_capacity)?;
            output_slots[definition.src.0][src_index] = Some(parts.output);
            input_slots[definition.dst.0][dst_index] = Some(parts.input);
            self.edges.push(Edge {
                src: definition.src,
                src_port: src_desc.name,
                dst: definition.dst,
                dst_port: dst_desc.name,
            });
            debug!(
                src = src_block.unique_name(),
                src_port = src_desc.name,
                dst = dst_block.unique_name(),
                dst_port = dst_desc.name,
                "edge resolved"
            );
        }

        // Every declared port must have received an endpoint.
        for (block_index, (inputs, outputs)) in
            input_slots.iter_mut().zip(output_slots.iter_mut()).enumerate()
        {
            let block = &self.blocks[block_index];
            let declared_inputs = block.declared_inputs();
            let declared_outputs = block.declared_outputs();
            for (port_index, slot) in inputs.iter().enumerate() {
                if slot.is_none() {
                    return Err(GraphError::PortNotConnected {
                        block: block.unique_name().to_owned(),
                        port: declared_inputs[port_index].name.to_owned(),
                    });
                }
            }
            for (port_index, slot) in outputs.iter().enumerate() {
                if slot.is_none() {
                    return Err(GraphError::PortNotConnected {
                        block: block.unique_name().to_owned(),
                        port: declared_outputs[port_index].name.to_owned(),
                    });
                }
            }
            let io = WorkIo::new(
                declared_inputs
                    .iter()
                    .zip(inputs.drain(..))
                    .map(|(desc, slot)| {
                        (desc.name.to_owned(), slot.expect("checked above"))
                    })
                    .collect(),
                declared_outputs
                    .iter()
                    .zip(outputs.drain(..))
                    .map(|(desc, slot)| {
                        (desc.name.to_owned(), slot.expect("checked above"))
                    })
                    .collect(),
            );
            self.blocks[block_index].install_io(io);
        }

        self.pending.clear();
        self.initialised = true;
        debug!(
            blocks = self.blocks.len(),
            edges = self.edges.len(),
            "graph initialised"
        );
        Ok(())
    }

    pub(crate) fn drain_blocks(&mut self) -> Vec<BlockModel> {
        std::mem::take(&mut self.blocks)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::{WorkIo, WorkResult};
    use crate::fields::{BlockFields, FieldDescriptor};
    use crate::pmt::Pmt;
    use crate::port::PortDescriptor;

    macro_rules! fieldless {
        ($ty:ty) => {
            impl BlockFields for $ty {
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
        };
    }

    struct FloatSource;
    fieldless!(FloatSource);
    impl Block for FloatSource {
        fn type_name(&self) -> &'static str {
            "FloatSource"
        }
        fn outputs(&self) -> Vec<PortDescriptor> {
            vec![PortDescriptor::stream::<f32>("out")]
        }
        fn work(&mut self, _io: &mut WorkIo, requested: u64) -> WorkResult {
            WorkResult::done(requested)
        }
    }

    struct FloatSink;
    fieldless!(FloatSink);
    impl Block for FloatSink {
        fn type_name(&self) -> &'static str {
            "FloatSink"
        }
        fn inputs(&self) -> Vec<PortDescriptor> {
            vec![PortDescriptor::stream::<f32>("in")]
        }
        fn work(&mut self, _io: &mut WorkIo, requested: u64) -> WorkResult {
            WorkResult::done(requested)
        }
    }

    struct IntSink;
    fieldless!(IntSink);
    impl Block for IntSink {
        fn type_name(&self) -> &'static str {
            "IntSink"
        }
        fn inputs(&self) -> Vec<PortDescriptor> {
            vec![PortDescriptor::stream::<i32>("in")]
        }
        fn work(&mut self, _io: &mut WorkIo, requested: u64) -> WorkResult {
            WorkResult::done(requested)
        }
    }

    #[test]
    fn test_connect_and_init() {
        let mut graph = Graph::new();
        let src = graph.add_block(Box::new(FloatSource));
        let dst = graph.add_block(Box::new(FloatSink));
        graph.connect(src, "out", dst, "in");

        assert!(!graph.is_initialised());
        graph.init().unwrap();
        assert!(graph.is_initialised());
        assert_eq!(graph.edges().len(), 1);
        assert_eq!(graph.edges()[0].src, src);
        assert_eq!(graph.edges()[0].dst, dst);
    }

    #[test]
    fn test_type_mismatch_rejected() {
        let mut graph = Graph::new();
        let src = graph.add_block(Box::new(FloatSource));
        let dst = graph.add_block(Box::new(IntSink));
        graph.connect(src, "out", dst, "in");

        assert!(matches!(
            graph.init(),
            Err(GraphError::TypeMismatch { .. })
        ));
    }

    #[test]
    fn test_unknown_port_rejected() {
        let mut graph = Graph::new();
        let src = graph.add_block(Box::new(FloatSource));
        let dst = graph.add_block(Box::new(FloatSink));
        graph.connect(src, "nope", dst, "in");

        assert!(matches!(graph.init(), Err(GraphError::PortNotFound { .. })));
    }

    #[test]
    fn test_unconnected_port_rejected() {
        let mut graph = Graph::new();
        graph.add_block(Box::new(FloatSource));

        assert!(matches!(
            graph.init(),
            Err(GraphError::PortNotConnected { .. })
        ));
    }

    #[test]
    fn test_double_connection_rejected() {
        let mut graph = Graph::new();
        let src = graph.add_block(Box::new(FloatSource));
        let a = graph.add_block(Box::new(FloatSink));
        let b = graph.add_block(Box::new(FloatSink));
        graph.connect(src, "out", a, "in");
        graph.connect(src, "out", b, "in");

        assert!(matches!(
            graph.init(),
            Err(GraphError::PortAlreadyConnected { .. })
        ));
    }
}
