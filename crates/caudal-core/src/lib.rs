//! Caudal Core - runtime of the caudal streaming signal-processing framework
//!
//! This crate provides everything needed to assemble a directed graph of
//! processing blocks connected by typed sample ports and drive it to
//! quiescence across one or more worker threads:
//!
//! - [`CircularBuffer`] lock-free ring with mirrored (double-mapped where
//!   possible) storage backing every edge
//! - [`Sequence`] cursors and [`WaitStrategy`] parking policies
//! - [`ProducerSpan`] / [`ConsumerSpan`] scoped reservations with explicit
//!   publish/consume and release policies
//! - [`Block`] work contract, typed [`PortDescriptor`] ports and stream
//!   [`Tag`]s
//! - [`Settings`] staged parameter engine with auto-update (tag-driven) and
//!   auto-forward (downstream propagation)
//! - [`Graph`] topology and the quiescence-driven [`Scheduler`]
//!
//! ## Example
//!
//! ```rust,ignore
//! use caudal_core::{ExecutionPolicy, Graph, Scheduler};
//!
//! let mut graph = Graph::new();
//! let src = graph.add_block(Box::new(MySource::new(48_000.0)));
//! let dst = graph.add_block(Box::new(MySink::new()));
//! graph.connect(src, "out", dst, "in");
//!
//! let mut scheduler = Scheduler::new(graph)
//!     .with_execution_policy(ExecutionPolicy::MultiThreaded);
//! scheduler.run_and_wait()?;
//! ```

pub mod block;
pub mod fields;
pub mod graph;
pub mod history;
pub mod pmt;
pub mod pool;
pub mod port;
pub mod ring;
pub mod scheduler;
pub mod sequence;
pub mod settings;
pub mod tag;
pub mod wait;

// Re-export main types at crate root
pub use block::{Block, BlockModel, WorkIo, WorkResult, WorkStatus};
pub use fields::{Annotated, BlockFields, FieldDescriptor};
pub use graph::{BlockId, Edge, Graph, GraphError};
pub use history::HistoryBuffer;
pub use pmt::{property_map, Pmt, PmtKind, PropertyMap};
pub use port::{PortDescriptor, StreamInput, StreamOutput};
pub use ring::{
    BufferError, BufferReader, BufferWriter, CircularBuffer, ConsumerSpan, ProducerKind,
    ProducerSpan, SpanReleasePolicy,
};
pub use scheduler::{
    ExecutionPolicy, OrderingPolicy, Scheduler, SchedulerError, SchedulerState,
};
pub use sequence::{minimum_sequence, Sequence, INITIAL_CURSOR_VALUE};
pub use settings::{ApplyStagedResult, Settings, SettingsCtx, SettingsError};
pub use tag::Tag;
pub use wait::{WaitStrategy, WaitTimeout};
