//! Core rule management functionality
//!
//! - [`firewall`]: Rule model and port specification parsing
//! - [`compiler`]: Rule to iptables command compilation
//! - [`gateway`]: Execution of iptables commands
//! - [`store`]: Ordered rule store and rule file persistence
//! - [`manager`]: Rule operations and the reconciliation pass
//! - [`error`]: Error types and iptables diagnostic translation

pub mod compiler;
pub mod error;
pub mod firewall;
pub mod gateway;
pub mod manager;
pub mod store;

#[cfg(test)]
pub mod test_helpers;
