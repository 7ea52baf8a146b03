pub mod config;
pub mod coordinator;
pub mod events;
pub mod lifecycle;
pub mod limits;
pub mod lock;
pub mod model;
pub mod monitor;
pub mod notify;
pub mod observability;
pub mod reaper;
pub mod store;
pub mod wal;
pub mod wire;
pub mod write;
