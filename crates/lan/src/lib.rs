//! Local network helpers for picking the address a pairing descriptor advertises.

pub mod model;
pub mod net;

pub use model::InterfaceIp;
pub use net::{list_interface_ips_result, select_advertised_ip};
