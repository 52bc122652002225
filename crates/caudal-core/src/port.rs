//! Typed stream endpoints and the per-block I/O bundle.
//!
//! Blocks declare their ports as [`PortDescriptor`]s; the graph resolves a
//! connection at `init()` by matching the declared element types and
//! installing a shared sample ring plus a paired tag ring (the side channel
//! for [`Tag`]s). Inside `work()`, a block reaches its endpoints through
//! [`WorkIo`] with the element type it declared.

use std::any::{Any, TypeId};

use tracing::warn;

use crate::pmt::PropertyMap;
use crate::ring::{
    BufferError, BufferReader, BufferWriter, CircularBuffer, ConsumerSpan, ProducerSpan,
    RingElement, SpanReleasePolicy,
};
use crate::tag::Tag;

/// Default sample-ring capacity installed per edge.
pub const DEFAULT_EDGE_CAPACITY: usize = 4096;

/// Capacity of the tag side-channel ring paired with each edge.
pub const DEFAULT_TAG_CAPACITY: usize = 256;

/// Declares one stream port of a block: a name plus the element type, and a
/// factory the graph uses to build the edge when the connection resolves.
#[derive(Clone, Copy)]
pub struct PortDescriptor {
    pub name: &'static str,
    pub type_name: &'static str,
    type_id: TypeId,
    make_edge: fn(usize) -> Result<EdgeParts, BufferError>,
}

impl PortDescriptor {
    /// A stream port carrying elements of type `T`.
    pub fn stream<T: RingElement>(name: &'static str) -> Self {
        Self {
            name,
            type_name: std::any::type_name::<T>(),
            type_id: TypeId::of::<T>(),
            make_edge: make_edge_parts::<T>,
        }
    }

    pub(crate) fn element_type(&self) -> TypeId {
        self.type_id
    }

    pub(crate) fn make_edge(&self, capacity: usize) -> Result<EdgeParts, BufferError> {
        (self.make_edge)(capacity)
    }
}

impl std::fmt::Debug for PortDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PortDescriptor")
            .field("name", &self.name)
            .field("type", &self.type_name)
            .finish()
    }
}

pub(crate) struct EdgeParts {
    pub(crate) output: Box<dyn DynOutput>,
    pub(crate) input: Box<dyn DynInput>,
}

fn make_edge_parts<T: RingElement>(capacity: usize) -> Result<EdgeParts, BufferError> {
    let samples = CircularBuffer::<T>::new(capacity)?;
    let tags = CircularBuffer::<Tag>::new(DEFAULT_TAG_CAPACITY)?;
    let input = StreamInput {
        reader: samples.new_reader(),
        tags: tags.new_reader(),
    };
    let output = StreamOutput {
        writer: samples.new_writer(),
        tags: tags.new_writer(),
    };
    Ok(EdgeParts {
        output: Box::new(output),
        input: Box::new(input),
    })
}

/// Consumer endpoint of an edge: the sample reader plus its tag reader.
pub struct StreamInput<T: RingElement> {
    reader: BufferReader<T>,
    tags: BufferReader<Tag>,
}

impl<T: RingElement> StreamInput<T> {
    /// Samples available to read right now.
    pub fn available(&self) -> usize {
        self.reader.available()
    }

    /// Sequence of the last consumed sample.
    pub fn position(&self) -> i64 {
        self.reader.position()
    }

    /// Non-blocking view over everything available.
    pub fn get(&self) -> ConsumerSpan<'_, T> {
        self.reader.get()
    }

    /// Non-blocking view over at most `n` samples.
    pub fn get_n(&self, n: usize) -> ConsumerSpan<'_, T> {
        self.reader.get_n(n)
    }

    /// View with an explicit release policy.
    pub fn get_with(&self, policy: SpanReleasePolicy, n: Option<usize>) -> ConsumerSpan<'_, T> {
        self.reader.get_with(policy, n)
    }

    /// Direct access to the underlying reader.
    pub fn reader(&self) -> &BufferReader<T> {
        &self.reader
    }

    /// Drains tags attached to samples up to and including `sequence`.
    /// A tag must be taken no later than the sample it precedes; the block
    /// model calls this for the window it is about to hand to `work()`.
    pub fn take_tags_up_to(&self, sequence: i64) -> Vec<Tag> {
        let pending = {
            let view = self.tags.get_with(SpanReleasePolicy::ProcessNone, None);
            view.iter()
                .take_while(|tag| tag.index <= sequence)
                .cloned()
                .collect::<Vec<_>>()
        };
        if !pending.is_empty() {
            let view = self.tags.get_n(pending.len());
            let taken = view.len();
            if let Err(error) = view.consume(taken) {
                warn!(%error, "failed to consume tag side channel");
            }
        }
        pending
    }
}

/// Producer endpoint of an edge: the sample writer plus its tag writer.
pub struct StreamOutput<T: RingElement> {
    writer: BufferWriter<T>,
    tags: BufferWriter<Tag>,
}

impl<T: RingElement> StreamOutput<T> {
    /// Slots reservable right now without waiting.
    pub fn space(&self) -> usize {
        self.writer.available()
    }

    /// Sequence of the last published sample.
    pub fn position(&self) -> i64 {
        self.writer.position()
    }

    /// Reserves `n` slots, waiting for downstream headroom.
    pub fn reserve(&mut self, n: usize) -> Result<ProducerSpan<'_, T>, BufferError> {
        self.writer.reserve(n)
    }

    /// Non-blocking reserve.
    pub fn try_reserve(&mut self, n: usize) -> Result<ProducerSpan<'_, T>, BufferError> {
        self.writer.try_reserve(n)
    }

    /// Direct access to the underlying writer.
    pub fn writer_mut(&mut self) -> &mut BufferWriter<T> {
        &mut self.writer
    }

    /// Attaches a tag at sample `index`. A full tag ring drops the tag with
    /// a warning rather than stalling the stream.
    pub fn publish_tag(&mut self, index: i64, map: PropertyMap) {
        match self.tags.try_reserve(1) {
            Ok(mut span) => {
                span[0] = Tag::new(index, map);
                span.publish(1);
            }
            Err(_) => warn!(index, "tag ring full, dropping tag"),
        }
    }
}

pub(crate) trait DynInput: Send {
    fn available(&self) -> usize;
    /// Sequence of the newest currently visible sample.
    fn visible_end(&self) -> i64;
    fn take_tags_up_to(&self, sequence: i64) -> Vec<Tag>;
    fn as_any(&mut self) -> &mut dyn Any;
}

impl<T: RingElement> DynInput for StreamInput<T> {
    fn available(&self) -> usize {
        StreamInput::available(self)
    }

    fn visible_end(&self) -> i64 {
        self.reader.position() + self.reader.available() as i64
    }

    fn take_tags_up_to(&self, sequence: i64) -> Vec<Tag> {
        StreamInput::take_tags_up_to(self, sequence)
    }

    fn as_any(&mut self) -> &mut dyn Any {
        self
    }
}

pub(crate) trait DynOutput: Send {
    /// Sequence the next published sample will carry.
    fn next_position(&self) -> i64;
    fn publish_tag(&mut self, index: i64, map: PropertyMap);
    fn as_any(&mut self) -> &mut dyn Any;
}

impl<T: RingElement> DynOutput for StreamOutput<T> {
    fn next_position(&self) -> i64 {
        self.writer.position() + 1
    }

    fn publish_tag(&mut self, index: i64, map: PropertyMap) {
        StreamOutput::publish_tag(self, index, map)
    }

    fn as_any(&mut self) -> &mut dyn Any {
        self
    }
}

/// The ports installed on one block, in declaration order.
///
/// Accessors take the element type the block declared; asking for a
/// different type is a programming error (the graph validated the wiring at
/// `init()`) and panics with the port name.
#[derive(Default)]
pub struct WorkIo {
    inputs: Vec<(String, Box<dyn DynInput>)>,
    outputs: Vec<(String, Box<dyn DynOutput>)>,
}

impl WorkIo {
    pub(crate) fn new(
        inputs: Vec<(String, Box<dyn DynInput>)>,
        outputs: Vec<(String, Box<dyn DynOutput>)>,
    ) -> Self {
        Self { inputs, outputs }
    }

    pub fn input_count(&self) -> usize {
        self.inputs.len()
    }

    pub fn output_count(&self) -> usize {
        self.outputs.len()
    }

    /// The input at `index`, typed as declared.
    pub fn input<T: RingElement>(&mut self, index: usize) -> &mut StreamInput<T> {
        downcast_input(&mut self.inputs[index])
    }

    /// The output at `index`, typed as declared.
    pub fn output<T: RingElement>(&mut self, index: usize) -> &mut StreamOutput<T> {
        downcast_output(&mut self.outputs[index])
    }

    /// One input and one output at once — the common shape of a transform
    /// block's `work()`.
    pub fn io_pair<I: RingElement, O: RingElement>(
        &mut self,
        input: usize,
        output: usize,
    ) -> (&mut StreamInput<I>, &mut StreamOutput<O>) {
        (
            downcast_input(&mut self.inputs[input]),
            downcast_output(&mut self.outputs[output]),
        )
    }

    /// Samples queued on every input port, in declaration order.
    pub fn inputs_available(&self) -> Vec<usize> {
        self.inputs.iter().map(|(_, port)| port.available()).collect()
    }

    /// Merges the tag maps attached to the currently visible window of every
    /// input, draining them from the side channels.
    pub(crate) fn collect_input_tags(&self) -> PropertyMap {
        let mut merged = PropertyMap::new();
        for (_, port) in &self.inputs {
            for tag in port.take_tags_up_to(port.visible_end()) {
                merged.extend(tag.map);
            }
        }
        merged
    }

    /// Publishes `map` as a tag at the next write position of every output.
    pub(crate) fn forward_tags(&mut self, map: &PropertyMap) {
        for (_, port) in &mut self.outputs {
            let index = port.next_position();
            port.publish_tag(index, map.clone());
        }
    }
}

fn downcast_input<T: RingElement>(slot: &mut (String, Box<dyn DynInput>)) -> &mut StreamInput<T> {
    let (name, port) = slot;
    let name = name.as_str();
    match port.as_any().downcast_mut::<StreamInput<T>>() {
        Some(input) => input,
        None => panic!(
            "input port '{name}' does not carry {}",
            std::any::type_name::<T>()
        ),
    }
}

fn downcast_output<T: RingElement>(
    slot: &mut (String, Box<dyn DynOutput>),
) -> &mut StreamOutput<T> {
    let (name, port) = slot;
    let name = name.as_str();
    match port.as_any().downcast_mut::<StreamOutput<T>>() {
        Some(output) => output,
        None => panic!(
            "output port '{name}' does not carry {}",
            std::any::type_name::<T>()
        ),
    }
}
