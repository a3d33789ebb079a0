// Wingman binaries share the launcher and the logging setup through this
// library; the orchestration itself lives in the workspace crates.

pub mod launcher;
pub mod logging;

pub use launcher::{LaunchError, LaunchSettings, Launcher, LauncherEvent};
