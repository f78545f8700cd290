pub mod event;
pub mod provider;
pub mod route;
pub mod task;
pub mod tool;

pub use event::*;
pub use provider::*;
pub use route::*;
pub use task::*;
pub use tool::*;
