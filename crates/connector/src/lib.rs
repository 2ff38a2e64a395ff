//! slideshow-connector: request/response bridge to slideshow helper processes.
//!
//! A helper is a platform- and application-specific script that speaks one
//! JSON object per line over stdin/stdout. This crate resolves which helper
//! to run, installs it where it can execute, spawns it, and correlates its
//! replies with requests.

mod version;

pub mod bridge;
pub mod install;
pub mod platform;
pub mod registry;

pub use bridge::channel::{CommandSpawner, HelperSpawner, SpawnError};
pub use bridge::correlator::{Correlator, Dispatch, FifoCorrelator};
pub use bridge::protocol::{Message, RequestError};
pub use bridge::{Bridge, BridgeConfig, BridgeError, CONNECTOR_ENV, ResponseFuture};
pub use install::{BundledInstaller, InstallError, Installer, PackagedInstaller, ResolvedPath};
pub use platform::{ExecMode, host_platform};
pub use registry::{HelperDescriptor, HelperKey, Registry, RegistryError};
pub use version::CONNECTOR_VERSION;
