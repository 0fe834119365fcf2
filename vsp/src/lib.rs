//! VSP: dataplane control daemon for SmartNIC/DPU platforms.
//!
//! The daemon runs on both sides of the PCIe boundary. In DPU mode it
//! provisions veth pairs and a forwarding domain and attaches SR-IOV VFs
//! to it; in host mode it controls the host PF's VF count. Both sides
//! expose the same gRPC services over a unix socket and bootstrap an
//! IPv6 link-local comm channel between each other at `Init`.

pub mod comm;
pub mod config;
pub mod daemon;
pub mod dataplane;
pub mod links;
pub mod netdev;
pub mod platform;
pub mod registry;
pub mod service;
pub mod test_util;
pub mod vf;

pub mod proto {
    tonic::include_proto!("vsp.v1");
}

pub use tonic;
