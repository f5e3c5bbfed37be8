pub mod model;
pub mod protocol;

pub use model::{new_id, ChatMessage, ChatSession, LlmConfig, MessageId, Role};
pub use protocol::{FrameError, InboundFrame, OutboundFrame};
