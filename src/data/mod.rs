//! Typed facades over the transport fabric: sources publish, sinks consume,
//! and generic buffers carry records whose shape is data, not code.

mod buffer;
mod sink;
mod source;

pub use buffer::{
    read_value, write_value, BufferValue, DataDescription, DataField, FieldType, GenericBuffer,
};
pub use sink::{BufferSink, DataSink, SinkPolicy};
pub use source::{BufferSource, DataSource};
