pub mod auth;
pub mod calendar;
pub mod clock;
pub mod config;
pub mod engine;
pub mod limits;
pub mod model;
pub mod notify;
pub mod observability;
pub mod policy;
pub mod sql;
pub mod sweeper;
pub mod tenant;
pub mod tls;
pub mod wal;
pub mod wire;
