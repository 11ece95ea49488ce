#![no_std]

// Table contract shared between userspace and the kernel-resident filter.
// Keep this crate `no_std` so an eBPF-side implementation can depend on it.

/// Name of the control table inside the compiled image.
pub const BLOCKED_PORT_MAP: &str = "blocked_port_map";

/// The only key ever written to the control table.
pub const BLOCKED_PORT_KEY: PortKey = 0;

/// Key type of the control table (`__u32` on the kernel side).
pub type PortKey = u32;

/// Value type of the control table (`__u16` on the kernel side). Host byte order.
pub type PortValue = u16;

/// A stored value of zero means "no port configured".
pub const UNSET_PORT: PortValue = 0;

/// Compiled image looked up in the working directory.
pub const DEFAULT_OBJECT_FILE: &str = "xdp-drop.o";

/// Where the control table is republished for later invocations.
pub const DEFAULT_PIN_PATH: &str = "/sys/fs/bpf/blocked_port_map";
