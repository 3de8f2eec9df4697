pub mod codec;
pub mod sink;
