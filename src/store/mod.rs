pub mod acks;
pub mod atomic;
pub mod lock;
pub mod message_log;
