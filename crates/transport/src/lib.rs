//! Transport security for the gantry plugin runtime.
//!
//! Every runner instance generates a fresh private certificate authority and
//! issues short-lived leaf credentials from it: one server credential per
//! plugin subprocess and one client credential per runner-side channel. The
//! credentials only ever travel over the process boundary (serialized into
//! the child's argument vector) and are never persisted, so a leaked
//! credential dies with the runner that minted it.

mod error;
mod generator;
mod pki;
mod tls;

pub use error::TransportError;
pub use generator::TransportGenerator;
pub use pki::{LeafCredential, PrivateCa, Role};
