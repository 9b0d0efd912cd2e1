pub mod codec;
pub mod frame;

pub use codec::{FrameCodec, MAX_MESSAGE_LEN};
pub use frame::{Frame, FrameError, Opcode, MAX_PAYLOAD_LEN};
