//! Core orchestration for snapshot-backed function microVMs.
//!
//! A function revision either cold-boots from a container image or restores
//! from a previously captured snapshot (guest memory, machine state, and a
//! filesystem delta over the image rootfs). This crate owns the coupled
//! lifecycles of the per-VM network, the copy-on-write container snapshot,
//! and the snapshot artifacts on disk, and drives the external container
//! runtime and hypervisor services over their RPC sockets.

mod command;
mod uds;

pub mod devmapper;
pub mod hypervisor;
pub mod network;
pub mod orchestrator;
pub mod patch;
pub mod runtime;
pub mod snapshots;
pub mod test_utils;

pub use orchestrator::{FuncInstance, Orchestrator};
pub use snapshots::{Snapshot, SnapshotInfo, SnapshotManager};
