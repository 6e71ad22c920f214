//! `kite`: the peer library shared by every process that speaks the Kite
//! RPC protocol. Ordinary kites, `kontrold` (the registry), and
//! `tunnel-proxy` (the NAT-traversal proxy) all depend on this crate for the
//! wire codec, transports, identity/query model, key and token handling, and
//! the symmetric duplex peer itself.

pub mod config;
pub mod dnode;
pub mod error;
pub mod identity;
pub mod keys;
pub mod kontrol_client;
pub mod orchestrator;
pub mod peer;
pub mod pool;
pub mod transport;

pub use config::Config;
pub use error::{ErrorKind, KiteError, Result};
pub use identity::{Identity, Query};
pub use peer::{Connection, ConnectionState, Kite};
