pub mod config;
pub mod handler;
pub mod plugin;
pub mod response;
pub mod sentinel;
pub mod wire;

pub use config::{Config, ConfigChange, ConfigError};
pub use handler::{CancelFlag, HandlerCall, HandlerKind, HandlerSet, HandlerSpec};
pub use response::{CommandResponse, ErrorInfo};
pub use wire::{Envelope, FrameError, Msg};
