pub mod demo;
pub mod engine;
pub mod registry;
pub mod resolve;
pub mod scene;
pub mod server;

pub use engine::{Engine, ProgressSink};
pub use registry::{InvokerCtx, InvokerRegistry};
pub use resolve::{resolve_target, Target};
pub use scene::{EventHub, Scene};
pub use server::{start, ServerConfig, ServerHandle};
