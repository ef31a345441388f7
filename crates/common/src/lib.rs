// easel-common: wire protocol and shared types for the easel collaboration relay

pub mod protocol;
pub mod reconnect;
pub mod types;
