//! kontrold's internals, split out from the binary so other processes in
//! this workspace (the demo programs) can stand up an in-memory registry
//! without shelling out to a separate server.

pub mod config;
pub mod error;
pub mod registry;
pub mod storage;
