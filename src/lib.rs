pub mod build;
pub mod compaction;
pub mod conductor_config;
pub mod config;
pub mod errors;
pub mod fallback;
pub mod logging;
pub mod orchestrator;
pub mod phase;
pub mod plan;
pub mod process;
pub mod retry;
pub mod stream;
pub mod tracker;
pub mod ui;
pub mod util;
