/// Client liveness tracking with inactivity detection
pub mod connection_registry;

pub use connection_registry::{
    Connection, ConnectionRegistry, ConnectionStatus, InactivityCallback,
};
