pub mod db;
pub mod dispatcher;
pub mod forge;
pub mod hub;
pub mod http;
pub mod log_mux;
pub mod logstore;
pub mod migrations;
pub mod session;
pub mod status_reconciler;
pub mod storage;

pub use db::Database;
pub use dispatcher::Dispatcher;
pub use forge::ForgeRegistry;
pub use hub::Hub;
pub use http::{router, AppState};
pub use log_mux::LogMultiplexer;
pub use logstore::{FsLogStore, LogStore};
pub use migrations::{load_migrations_from_dir, Migration, MigrationRunner};
pub use session::WorkerSession;
pub use status_reconciler::StatusReconciler;
pub use storage::{PgStorage, Storage};
