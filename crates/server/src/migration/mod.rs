/// 迁移编排
///
/// begin -> sync (可重复) -> switch，支持暂停、中止与自动串联

pub mod orchestrator;
pub mod progress;
pub mod state;
pub mod watch;

pub use orchestrator::{MigrateOptions, MigrateResponse, MigrationService};
pub use watch::WatchHub;
