//! nagent-proto - wire protocol shared by the node agent and its clients.
//!
//! ## Layers
//!
//! - **pack**: big-endian pack/unpack primitives with bounded buffers
//! - **message**: versioned header plus typed message bodies
//! - **io_stream**: header opening each task I/O connection
//! - **transport**: datagram message engine and byte-stream helpers

pub mod io_stream;
pub mod message;
pub mod pack;
pub mod rc;
pub mod transport;

pub use io_stream::{IO_HEADER_LEN, IoStreamHeader, StreamKind};
pub use message::{
    Header, KillTasksRequest, LaunchTasksRequest, Message, MsgType, ProtocolError, StepId,
    StepStatusResponse, TaskExitMsg, TaskState, TaskStatusEntry,
};
pub use pack::{PackError, Packer, Unpacker};
pub use rc::ReturnCode;
pub use transport::{MessageEngine, TransportError, init_message_engine};
