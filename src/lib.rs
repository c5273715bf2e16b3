//! Device-event monitor: joins the kernel's uevent multicast group or a peer device manager's
//! rebroadcast group, filters datagrams in-kernel with a compiled BPF program, and hands back
//! fully-formed devices via the [`Device`] trait.
//!
//! Uses the [`libc`](https://crates.io/crates/libc) crate directly for every socket, netlink, and
//! BPF syscall, and [`log`](https://crates.io/crates/log) for diagnostics.

mod context;
mod device;
mod error;
mod filter;
mod hash;
mod header;
mod log;
mod monitor;
mod socket;

pub use context::*;
pub use device::*;
pub use error::*;
pub use filter::*;
pub use hash::*;
pub use header::*;
pub use log::*;
pub use monitor::*;
pub use socket::*;
