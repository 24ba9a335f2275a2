//! Host network setup for domains.
//!
//! Each domain's virtio NIC attaches to a host bridge `vbr<N>`, where `N` is
//! the domain's bridge index. The host side of the bridge carries the
//! domain's IPv6 gateway address (`<gateway>/64`).
//!
//! Bridges must exist and be up before the domain that references them is
//! defined.

mod bridge;

pub use bridge::{bridge_exists, ensure_bridge, remove_bridge, BridgeConfig, BridgeError};
