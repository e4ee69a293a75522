pub mod auth;
pub mod compactor;
pub mod engine;
pub mod limits;
pub mod model;
pub mod notify;
pub mod observability;
pub mod pattern;
pub mod sql;
pub mod tenant;
pub mod tls;
pub mod wal;
pub mod wire;
