//! phoque - a small iptables rule manager
//!
//! Rules are declared in a persisted, ordered list and reconciled with the
//! kernel's filter table through the iptables command-line tool. Every live
//! entry phoque creates carries a `phoque-<id>` comment tag, so a pass can
//! find and remove its own entries no matter how the rule was edited since.
//!
//! # Architecture
//!
//! - [`core`] - Rule model, command compiler, backend gateway, store and manager
//! - [`audit`] - Audit trail of privileged operations
//! - [`validators`] - Port and interface input validation
//! - [`config`] - Configuration persistence
//! - [`elevation`] - Privilege escalation for the iptables process
//! - [`utils`] - XDG directories
//!
//! # Example
//!
//! ```no_run
//! use phoque::core::firewall::{Action, Direction, Protocol, RuleSpec};
//! use phoque::core::gateway::IptablesGateway;
//! use phoque::core::manager::FirewallManager;
//! use phoque::core::store::JsonRuleFile;
//!
//! # async fn run() -> phoque::Result<()> {
//! let gateway = IptablesGateway::new("iptables");
//! let file = JsonRuleFile::new("/tmp/rules.json");
//! let mut manager = FirewallManager::open(gateway, file, true).await?;
//!
//! let rule = manager
//!     .add(RuleSpec {
//!         action: Action::Allow,
//!         direction: Direction::Inbound,
//!         protocol: Protocol::Tcp,
//!         port: Some("22".into()),
//!         interface: None,
//!     })
//!     .await?
//!     .value;
//! let outcome = manager.toggle(&rule.id).await?;
//! assert!(outcome.value.report.is_success());
//! # Ok(())
//! # }
//! ```

// Allow pedantic clippy warnings that are not worth fixing for this codebase
#![allow(clippy::must_use_candidate)]
#![allow(clippy::return_self_not_must_use)]
#![allow(clippy::uninlined_format_args)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::future_not_send)]

pub mod audit;
pub mod config;
pub mod core;
pub mod elevation;
pub mod utils;
pub mod validators;

// Re-export commonly used types
pub use core::error::{Error, Result};
pub use core::firewall::{Action, Direction, PortSpec, Protocol, Rule, RuleSpec};
pub use core::manager::FirewallManager;
