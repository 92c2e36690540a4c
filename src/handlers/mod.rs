pub mod chat;
pub mod meta;
pub mod verify;
