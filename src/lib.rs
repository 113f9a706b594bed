pub mod clienv;
pub mod config;
pub mod daemon;
pub mod error;
pub mod nameserver;
pub mod service;
pub mod settings;
pub mod shutdown;
pub mod supervisor;
pub mod transport;

pub use config::{ConfigLoader, LabConfig, ProfileKind};
pub use error::{ErrorKind, LabError, Result};
pub use settings::SupervisorSettings;
