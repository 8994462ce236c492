//! Rule to iptables command compilation
//!
//! [`compile`] turns a [`Rule`] and its tag into a mirrored pair of iptables
//! invocations: an append (`-A`) used when inserting and a delete (`-D`) used
//! when cleaning. Both carry exactly the same match and target arguments so a
//! delete always addresses the entry its insert created.
//!
//! Argument layout:
//!
//! ```text
//! -A|-D <CHAIN> -p <proto> [-i|-o <iface>] [--dport <n>|<lo>:<hi>] -m comment --comment <tag> -j <VERDICT>
//! ```
//!
//! Compilation is pure: no I/O, no clock, no randomness.

use crate::core::firewall::{Chain, Rule, rule_id_from_tag};
use std::fmt;
use uuid::Uuid;

/// iptables operation verb
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Verb {
    /// Append at the end of the chain (`-A`)
    Append,
    /// Delete the first matching entry (`-D`)
    Delete,
}

impl Verb {
    pub const fn flag(self) -> &'static str {
        match self {
            Verb::Append => "-A",
            Verb::Delete => "-D",
        }
    }
}

/// One iptables invocation, without the program name
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct IptablesCommand {
    verb: Verb,
    chain: Chain,
    rule_args: Vec<String>,
}

impl IptablesCommand {
    pub fn verb(&self) -> Verb {
        self.verb
    }

    pub fn chain(&self) -> Chain {
        self.chain
    }

    /// Match and target arguments following `<verb> <chain>`
    pub fn rule_args(&self) -> &[String] {
        &self.rule_args
    }

    /// Full argument list passed to the iptables binary
    pub fn to_args(&self) -> Vec<String> {
        let mut args = Vec::with_capacity(self.rule_args.len() + 2);
        args.push(self.verb.flag().to_string());
        args.push(self.chain.as_str().to_string());
        args.extend(self.rule_args.iter().cloned());
        args
    }

    /// Comment tag carried by this command, if any
    pub fn tag(&self) -> Option<&str> {
        self.rule_args
            .windows(2)
            .find(|pair| pair[0] == "--comment")
            .map(|pair| pair[1].as_str())
    }

    /// Rule id of a well-formed `phoque-<uuid>` tag on this command
    pub fn rule_id(&self) -> Option<Uuid> {
        self.tag().and_then(rule_id_from_tag)
    }

    /// Builds the delete form of an entry printed by `iptables -S <CHAIN>`.
    ///
    /// Returns `None` for lines that are not `-A` entries of a built-in chain
    /// (policies, user chains). Double-quoted values are kept as one
    /// argument with the quotes removed, as iptables prints comments that
    /// contain spaces.
    pub fn delete_from_listing(line: &str) -> Option<Self> {
        let mut tokens = split_listing(line).into_iter();
        if tokens.next()? != Verb::Append.flag() {
            return None;
        }
        let chain = match tokens.next()?.as_str() {
            "INPUT" => Chain::Input,
            "OUTPUT" => Chain::Output,
            "FORWARD" => Chain::Forward,
            _ => return None,
        };
        let rule_args = tokens.collect::<Vec<_>>();
        if rule_args.is_empty() {
            return None;
        }
        Some(Self {
            verb: Verb::Delete,
            chain,
            rule_args,
        })
    }
}

/// Splits an `iptables -S` line into arguments, honouring double quotes and
/// backslash escapes inside them.
fn split_listing(line: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut started = false;
    let mut quoted = false;
    let mut chars = line.chars();

    while let Some(c) = chars.next() {
        match c {
            '"' => {
                quoted = !quoted;
                started = true;
            }
            '\\' if quoted => {
                if let Some(escaped) = chars.next() {
                    current.push(escaped);
                }
            }
            c if c.is_whitespace() && !quoted => {
                if started {
                    tokens.push(std::mem::take(&mut current));
                    started = false;
                }
            }
            c => {
                current.push(c);
                started = true;
            }
        }
    }
    if started {
        tokens.push(current);
    }
    tokens
}

impl fmt::Display for IptablesCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.verb.flag(), self.chain)?;
        for arg in &self.rule_args {
            write!(f, " {arg}")?;
        }
        Ok(())
    }
}

/// Insert and delete forms of one rule
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompiledRule {
    pub insert: IptablesCommand,
    pub delete: IptablesCommand,
}

/// Compiles a rule into its mirrored insert/delete iptables commands.
pub fn compile(rule: &Rule, tag: &str) -> CompiledRule {
    // Pre-allocate for protocol + iface + dport + comment + target
    let mut args = Vec::with_capacity(12);

    args.push("-p".to_string());
    args.push(rule.protocol.as_str().to_string());

    if let Some(ref iface) = rule.interface {
        args.push(rule.direction.interface_flag().to_string());
        args.push(iface.clone());
    }

    if rule.protocol.supports_ports()
        && let Some(dport) = rule.port.as_ref().and_then(|p| p.dport_arg())
    {
        args.push("--dport".to_string());
        args.push(dport);
    }

    args.extend(
        ["-m", "comment", "--comment", tag]
            .into_iter()
            .map(String::from),
    );

    args.push("-j".to_string());
    args.push(rule.action.verdict().to_string());

    let chain = rule.direction.chain();
    CompiledRule {
        insert: IptablesCommand {
            verb: Verb::Append,
            chain,
            rule_args: args.clone(),
        },
        delete: IptablesCommand {
            verb: Verb::Delete,
            chain,
            rule_args: args,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::firewall::{Action, Direction, PortSpec, Protocol};
    use uuid::Uuid;

    fn rule(
        action: Action,
        direction: Direction,
        protocol: Protocol,
        port: Option<PortSpec>,
        interface: Option<&str>,
    ) -> Rule {
        Rule {
            id: Uuid::nil(),
            action,
            direction,
            protocol,
            port,
            interface: interface.map(String::from),
            active: true,
        }
    }

    fn joined(cmd: &IptablesCommand) -> String {
        cmd.to_args().join(" ")
    }

    #[test]
    fn test_allow_inbound_tcp_single_port() {
        let r = rule(Action::Allow, Direction::Inbound, Protocol::Tcp, Some(PortSpec::Single(80)), None);
        let compiled = compile(&r, "phoque-x");
        assert_eq!(
            joined(&compiled.insert),
            "-A INPUT -p tcp --dport 80 -m comment --comment phoque-x -j ACCEPT"
        );
        assert_eq!(
            joined(&compiled.delete),
            "-D INPUT -p tcp --dport 80 -m comment --comment phoque-x -j ACCEPT"
        );
    }

    #[test]
    fn test_deny_outbound_udp_range_with_interface() {
        let r = rule(
            Action::Deny,
            Direction::Outbound,
            Protocol::Udp,
            Some(PortSpec::Range(1000, 2000)),
            Some("wlan0"),
        );
        let compiled = compile(&r, "phoque-y");
        assert_eq!(
            joined(&compiled.insert),
            "-A OUTPUT -p udp -o wlan0 --dport 1000:2000 -m comment --comment phoque-y -j DROP"
        );
    }

    #[test]
    fn test_reject_forward_uses_input_interface_flag() {
        let r = rule(
            Action::Reject,
            Direction::Forward,
            Protocol::Tcp,
            Some(PortSpec::Single(25)),
            Some("br0"),
        );
        let compiled = compile(&r, "t");
        assert_eq!(compiled.insert.chain(), Chain::Forward);
        assert!(joined(&compiled.insert).contains("-i br0"));
        assert!(joined(&compiled.insert).ends_with("-j REJECT"));
    }

    #[test]
    fn test_wildcard_port_omits_dport() {
        let r = rule(Action::Allow, Direction::Inbound, Protocol::Udp, Some(PortSpec::Wildcard), None);
        let compiled = compile(&r, "t");
        assert!(!compiled.insert.rule_args().iter().any(|a| a == "--dport"));
    }

    #[test]
    fn test_icmp_never_emits_dport() {
        // A stray port on an ICMP rule (hand-edited file) is ignored
        let r = rule(Action::Deny, Direction::Inbound, Protocol::Icmp, Some(PortSpec::Single(7)), None);
        let compiled = compile(&r, "t");
        assert_eq!(
            joined(&compiled.insert),
            "-A INPUT -p icmp -m comment --comment t -j DROP"
        );
    }

    #[test]
    fn test_tag_extraction() {
        let r = rule(Action::Allow, Direction::Inbound, Protocol::Icmp, None, None);
        let compiled = compile(&r, "phoque-abc");
        assert_eq!(compiled.insert.tag(), Some("phoque-abc"));
        assert_eq!(compiled.delete.tag(), Some("phoque-abc"));
    }

    #[test]
    fn test_delete_from_listing() {
        let line = r#"-A INPUT -i eth0 -p tcp -m tcp --dport 22 -m comment --comment "phoque-1234" -j ACCEPT"#;
        let cmd = IptablesCommand::delete_from_listing(line).unwrap();
        assert_eq!(cmd.verb(), Verb::Delete);
        assert_eq!(cmd.chain(), Chain::Input);
        assert_eq!(cmd.tag(), Some("phoque-1234"));
        assert_eq!(
            cmd.to_string(),
            "-D INPUT -i eth0 -p tcp -m tcp --dport 22 -m comment --comment phoque-1234 -j ACCEPT"
        );
    }

    #[test]
    fn test_delete_from_listing_ignores_policies_and_user_chains() {
        assert!(IptablesCommand::delete_from_listing("-P INPUT ACCEPT").is_none());
        assert!(IptablesCommand::delete_from_listing("-N DOCKER").is_none());
        assert!(IptablesCommand::delete_from_listing("-A DOCKER -j RETURN").is_none());
        assert!(IptablesCommand::delete_from_listing("-A INPUT").is_none());
        assert!(IptablesCommand::delete_from_listing("").is_none());
    }

    #[test]
    fn test_quoted_comment_with_spaces_stays_one_argument() {
        let line = r#"-A INPUT -p tcp -m comment --comment "phoque- note" -j ACCEPT"#;
        let cmd = IptablesCommand::delete_from_listing(line).unwrap();
        assert_eq!(cmd.tag(), Some("phoque- note"));
        assert_eq!(cmd.rule_id(), None);
        assert_eq!(cmd.rule_args().last().map(String::as_str), Some("ACCEPT"));
    }

    #[test]
    fn test_rule_id_requires_uuid_tag() {
        let id = Uuid::new_v4();
        let r = rule(Action::Allow, Direction::Inbound, Protocol::Icmp, None, None);
        assert_eq!(compile(&r, &format!("phoque-{id}")).insert.rule_id(), Some(id));
        assert_eq!(compile(&r, "phoque-1234").insert.rule_id(), None);
        assert_eq!(compile(&r, "phoque-").insert.rule_id(), None);
        assert_eq!(compile(&r, &id.to_string()).insert.rule_id(), None);
        assert_eq!(compile(&r, &format!("phoque-{}", id.simple())).insert.rule_id(), None);
    }

    #[test]
    fn test_escaped_quote_inside_comment() {
        let line = r#"-A OUTPUT -p udp -m comment --comment "say "hi"" -j DROP"#;
        let cmd = IptablesCommand::delete_from_listing(line).unwrap();
        assert_eq!(cmd.tag(), Some(r#"say "hi""#));
    }

    #[test]
    fn test_listing_of_compiled_insert_roundtrips_to_delete() {
        let r = rule(Action::Allow, Direction::Outbound, Protocol::Tcp, Some(PortSpec::Single(443)), Some("eth1"));
        let compiled = compile(&r, "phoque-z");
        let listed = compiled.insert.to_string();
        assert_eq!(
            IptablesCommand::delete_from_listing(&listed).unwrap(),
            compiled.delete
        );
    }
}
