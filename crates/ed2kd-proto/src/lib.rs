pub mod codec;
pub mod constants;
pub mod cursor;
pub mod error;
pub mod messages;
pub mod opcode;
pub mod packet;
pub mod tag;
