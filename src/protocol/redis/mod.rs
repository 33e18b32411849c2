mod codec;
mod command;
mod types;

pub use codec::RespCodec;
pub use command::{Blacklist, RedisCommand, SLOT_COUNT};
pub use types::RespValue;
