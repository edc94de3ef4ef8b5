pub mod checksum;
pub mod cluster;
pub mod config;
pub mod index;
pub mod persistence;
pub mod server;

pub use index::Index;
pub use persistence::{PersistError, Persistence, PersistenceConfig, SharedIndex};
