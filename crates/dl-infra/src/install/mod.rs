mod command;

pub use command::{CommandInstaller, InstallerPaths};
