pub mod connection;
pub mod protocol;

pub use connection::{ConnCommand, ConnEvent, Connection, ConnectionConfig, ConnectionState};
