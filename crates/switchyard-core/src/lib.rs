pub mod circuit;
pub mod collaborators;
pub mod config;
pub mod dispatch;
pub mod duration;
pub mod error;
pub mod event_bus;
pub mod failover;
pub mod reflection;
pub mod routing;
pub mod smart_dispatch;
pub mod template;
pub mod text;
pub mod tool_loop;
pub mod trust;
pub mod webhook;
pub mod workspace;

pub use circuit::*;
pub use collaborators::*;
pub use config::*;
pub use dispatch::*;
pub use duration::*;
pub use error::*;
pub use event_bus::*;
pub use failover::*;
pub use reflection::*;
pub use routing::*;
pub use smart_dispatch::*;
pub use template::*;
pub use tool_loop::*;
pub use trust::*;
pub use webhook::*;
pub use workspace::*;
