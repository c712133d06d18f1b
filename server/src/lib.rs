pub mod agent;
pub mod channel;
pub mod clients;
pub mod clock;
pub mod config;
pub mod heartbeat;
pub mod lobby;
pub mod protocol;
pub mod room;
