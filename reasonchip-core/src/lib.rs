//! Pipeline interpreter, variable context, and wire packets shared by the
//! broker, worker, and client halves of ReasonChip.

pub mod async_handle;
pub mod chips;
pub mod context;
pub mod engine;
pub mod error;
pub mod expr;
pub mod flow;
pub mod packet;
pub mod pipeline;
pub mod processor;
pub mod registry;
pub mod transport;
pub mod value;

pub use context::VariableContext;
pub use engine::Engine;
pub use error::{ReasonChipError, Result};
pub use packet::{Cookie, Packet, Rc};
pub use pipeline::{Pipeline, PipelineCollection, Task};
pub use processor::{PipelineResult, Processor, Signal};
pub use registry::{Chip, ChipRegistry};
pub use value::Value;
