pub mod config;
pub mod error;
pub mod frame;
pub mod keepalive;
pub mod protocol;
pub mod reconnect;

pub use config::*;
pub use error::*;
pub use frame::*;
pub use keepalive::*;
pub use reconnect::*;
