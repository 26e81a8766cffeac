//! ZRE node over TCP with UDP beacon discovery, built on `zre-core`.

mod actor;
pub mod config;
pub mod discovery;
pub mod node;
pub mod transport;

pub use config::Config;
pub use node::{Node, NodeError};
pub use zre_core::{CommandError, Event, PeerId};
