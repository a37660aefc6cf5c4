//! QEMU process management: argv construction, firmware resolution, overlay
//! and cloud-init seed preparation, port picking, and the boot sequence.

pub mod args;
pub mod boot;
pub mod firmware;
pub mod ports;
pub mod seed;

pub use args::{build_args, VmLaunchSpec};
pub use boot::{start_vm, VmProc};
