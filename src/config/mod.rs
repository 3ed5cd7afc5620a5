//! Configuration: launch options, AM container environment and the
//! staged backing-service site file. Everything is read once at boot
//! and passed to components as values.

mod options;
mod site;

pub use options::{AmEnvironment, LaunchOptions};
pub use site::{SiteConfig, SITE_FILE_NAME};
