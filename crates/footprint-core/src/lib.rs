pub mod buffer;
pub mod capture;
pub mod compress;
pub mod config;
pub mod db;
pub mod error;
pub mod event;
pub mod recorder;
pub mod report;
pub mod repository;
pub mod resolver;
pub mod schema;
pub mod storage;
pub mod writer;

pub use config::AppConfig;
pub use db::Database;
pub use error::{CoreError, Result};
pub use recorder::{Preferences, Recorder, Transition};
pub use storage::StorageRoot;
