pub mod errors;
pub mod ids;
pub mod manifest;
pub mod value;
pub mod wire;

pub use errors::BridgeError;
pub use manifest::{Manifest, ManifestEntry, Parameter, Scope};
pub use value::{HostObject, HostValue};
