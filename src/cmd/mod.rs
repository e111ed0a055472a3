//! CLI command implementations.
//!
//! | Module   | Commands handled    |
//! |----------|---------------------|
//! | `run`    | `Run`               |
//! | `plan`   | `Plan`              |
//! | `status` | `Status`, `Reset`   |
//! | `config` | `Config`            |

pub mod config;
pub mod plan;
pub mod run;
pub mod status;

pub use config::cmd_config;
pub use plan::cmd_plan;
pub use run::cmd_run;
pub use status::{cmd_reset, cmd_status};
