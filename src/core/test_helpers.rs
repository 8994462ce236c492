//! Shared test utilities for core module tests
//!
//! Provides a recording gateway that simulates the live chains, an in-memory
//! repository and rule builders. This module is only compiled in test mode.

use crate::core::compiler::{IptablesCommand, Verb};
use crate::core::error::{Error, Result};
use crate::core::firewall::{Action, Chain, Direction, PortSpec, Protocol, Rule, RuleSpec};
use crate::core::gateway::{ExecOutcome, Gateway};
use crate::core::store::{PersistenceError, RuleRepository};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use uuid::Uuid;

/// Mutex for tests that need exclusive access to environment variables.
///
/// # Example
///
/// ```ignore
/// let _guard = ENV_VAR_MUTEX.lock().unwrap();
/// unsafe {
///     std::env::set_var("PHOQUE_ELEVATION_METHOD", "sudo");
/// }
/// // ... test with custom env state ...
/// unsafe {
///     std::env::remove_var("PHOQUE_ELEVATION_METHOD");
/// }
/// ```
pub static ENV_VAR_MUTEX: Mutex<()> = Mutex::new(());

type FailPredicate = Box<dyn Fn(&IptablesCommand) -> bool + Send + Sync>;

#[derive(Default)]
struct MockState {
    executed: Vec<IptablesCommand>,
    listings: usize,
    /// Live entries as `(chain, rule args)`, in chain order
    live: Vec<(Chain, Vec<String>)>,
    fail_when: Option<FailPredicate>,
    fail_listing: bool,
}

/// In-memory stand-in for iptables.
///
/// Appends add a live entry, deletes remove the first identical entry or
/// report [`ExecOutcome::Missing`]. Clones share state, so a test can keep a
/// handle after moving one into a manager.
#[derive(Clone, Default)]
pub struct MockGateway {
    state: Arc<Mutex<MockState>>,
}

impl MockGateway {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every command passed to `execute`, in order
    pub fn executed(&self) -> Vec<IptablesCommand> {
        self.state.lock().unwrap().executed.clone()
    }

    pub fn executed_with(&self, verb: Verb) -> Vec<IptablesCommand> {
        self.executed()
            .into_iter()
            .filter(|c| c.verb() == verb)
            .collect()
    }

    pub fn clear_executed(&self) {
        self.state.lock().unwrap().executed.clear();
    }

    pub fn listings(&self) -> usize {
        self.state.lock().unwrap().listings
    }

    /// Live entries rendered as `-A CHAIN ...` lines
    pub fn live(&self) -> Vec<String> {
        self.state
            .lock()
            .unwrap()
            .live
            .iter()
            .map(|(chain, args)| format!("-A {chain} {}", args.join(" ")))
            .collect()
    }

    /// Adds a live entry as if some earlier process had appended it.
    pub fn seed_live(&self, command: &IptablesCommand) {
        self.state
            .lock()
            .unwrap()
            .live
            .push((command.chain(), command.rule_args().to_vec()));
    }

    /// Makes matching commands fail with a permission error.
    pub fn fail_on(&self, predicate: impl Fn(&IptablesCommand) -> bool + Send + Sync + 'static) {
        self.state.lock().unwrap().fail_when = Some(Box::new(predicate));
    }

    pub fn fail_listing(&self, fail: bool) {
        self.state.lock().unwrap().fail_listing = fail;
    }

    fn denied(command: String) -> Error {
        Error::Backend {
            command,
            exit_code: Some(4),
            stderr: "iptables v1.8.10 (legacy): can't initialize iptables table `filter': Permission denied (you must be root)".to_string(),
        }
    }
}

impl std::fmt::Debug for MockGateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockGateway")
            .field("live", &self.live())
            .finish_non_exhaustive()
    }
}

impl Gateway for MockGateway {
    async fn execute(&self, command: &IptablesCommand) -> Result<ExecOutcome> {
        let mut state = self.state.lock().unwrap();
        state.executed.push(command.clone());

        if state.fail_when.as_ref().is_some_and(|f| f(command)) {
            return Err(Self::denied(format!("iptables {command}")));
        }

        match command.verb() {
            Verb::Append => {
                state
                    .live
                    .push((command.chain(), command.rule_args().to_vec()));
                Ok(ExecOutcome::Applied)
            }
            Verb::Delete => {
                let position = state.live.iter().position(|(chain, args)| {
                    *chain == command.chain() && args.as_slice() == command.rule_args()
                });
                match position {
                    Some(index) => {
                        state.live.remove(index);
                        Ok(ExecOutcome::Applied)
                    }
                    None => Ok(ExecOutcome::Missing),
                }
            }
        }
    }

    async fn list_chain(&self, chain: Chain) -> Result<Vec<String>> {
        let mut state = self.state.lock().unwrap();
        state.listings += 1;
        if state.fail_listing {
            return Err(Self::denied(format!("iptables -S {chain}")));
        }

        let mut lines = vec![format!("-P {chain} ACCEPT")];
        lines.extend(
            state
                .live
                .iter()
                .filter(|(c, _)| *c == chain)
                .map(|(c, args)| format!("-A {c} {}", listed_args(args))),
        );
        Ok(lines)
    }
}

/// Joins arguments the way `iptables -S` prints them: values containing
/// spaces are double-quoted.
fn listed_args(args: &[String]) -> String {
    args.iter()
        .map(|a| {
            if a.contains(' ') {
                format!("\"{a}\"")
            } else {
                a.clone()
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

/// Rule repository kept in memory. Clones share state.
#[derive(Debug, Clone, Default)]
pub struct MemoryRepository {
    rules: Arc<Mutex<Vec<Rule>>>,
    saves: Arc<AtomicUsize>,
    fail_save: Arc<AtomicBool>,
}

impl MemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_rules(rules: Vec<Rule>) -> Self {
        let repo = Self::default();
        *repo.rules.lock().unwrap() = rules;
        repo
    }

    /// Rules as last saved
    pub fn stored(&self) -> Vec<Rule> {
        self.rules.lock().unwrap().clone()
    }

    pub fn saves(&self) -> usize {
        self.saves.load(Ordering::SeqCst)
    }

    pub fn fail_saves(&self, fail: bool) {
        self.fail_save.store(fail, Ordering::SeqCst);
    }
}

impl RuleRepository for MemoryRepository {
    async fn load(&self) -> std::result::Result<Vec<Rule>, PersistenceError> {
        Ok(self.stored())
    }

    async fn save(&self, rules: &[Rule]) -> std::result::Result<(), PersistenceError> {
        if self.fail_save.load(Ordering::SeqCst) {
            return Err(PersistenceError::Io(std::io::Error::new(
                std::io::ErrorKind::PermissionDenied,
                "read-only file system",
            )));
        }
        *self.rules.lock().unwrap() = rules.to_vec();
        self.saves.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Inactive Allow/Inbound/TCP rule on `port` with a fresh id
pub fn create_test_rule(port: u16) -> Rule {
    Rule {
        id: Uuid::new_v4(),
        action: Action::Allow,
        direction: Direction::Inbound,
        protocol: Protocol::Tcp,
        port: Some(PortSpec::Single(port)),
        interface: None,
        active: false,
    }
}

/// Inactive Deny/Inbound/ICMP rule
pub fn icmp_rule() -> Rule {
    Rule {
        id: Uuid::new_v4(),
        action: Action::Deny,
        direction: Direction::Inbound,
        protocol: Protocol::Icmp,
        port: None,
        interface: None,
        active: false,
    }
}

pub fn tcp_spec(port: &str) -> RuleSpec {
    RuleSpec {
        action: Action::Allow,
        direction: Direction::Inbound,
        protocol: Protocol::Tcp,
        port: Some(port.to_string()),
        interface: None,
    }
}

/// proptest strategies for rules
pub mod strategies {
    use super::*;
    use proptest::prelude::*;

    pub fn arb_port_spec() -> impl Strategy<Value = PortSpec> {
        prop_oneof![
            (1u16..=65535).prop_map(PortSpec::Single),
            Just(PortSpec::Wildcard),
            (1u16..=65535, 1u16..=65535).prop_map(|(a, b)| PortSpec::Range(a.min(b), a.max(b))),
        ]
    }

    pub fn arb_rule() -> impl Strategy<Value = Rule> {
        (
            prop_oneof![Just(Action::Allow), Just(Action::Deny), Just(Action::Reject)],
            prop_oneof![
                Just(Direction::Inbound),
                Just(Direction::Outbound),
                Just(Direction::Forward)
            ],
            prop_oneof![Just(Protocol::Tcp), Just(Protocol::Udp), Just(Protocol::Icmp)],
            arb_port_spec(),
            proptest::option::of("[a-z]{2,6}[0-9]{0,2}"),
            any::<bool>(),
            any::<u128>(),
        )
            .prop_map(|(action, direction, protocol, port, interface, active, id)| Rule {
                id: Uuid::from_u128(id),
                action,
                direction,
                protocol,
                port: protocol.supports_ports().then_some(port),
                interface,
                active,
            })
    }

    /// Rules with distinct ids
    pub fn arb_rules(max: usize) -> impl Strategy<Value = Vec<Rule>> {
        proptest::collection::vec(arb_rule(), 0..max).prop_map(|rules| {
            let mut seen = std::collections::HashSet::new();
            rules.into_iter().filter(|r| seen.insert(r.id)).collect()
        })
    }
}
