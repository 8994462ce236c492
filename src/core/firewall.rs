//! Firewall rule data structures and port specification parsing
//!
//! A [`Rule`] is one declarative filter intent: a verdict ([`Action`]), the
//! traffic it applies to ([`Direction`], [`Protocol`], [`PortSpec`], interface)
//! and whether it should currently be enforced (`active`).
//!
//! The rule `id` never changes after creation. It is embedded in every live
//! iptables entry as a comment tag (see [`Rule::tag`]), which is how a
//! reconciliation pass attributes live entries back to rules regardless of
//! how their fields were edited since.
//!
//! # Example
//!
//! ```
//! use phoque::core::firewall::{Action, Direction, PortSpec, Protocol, RuleSpec};
//!
//! let spec = RuleSpec {
//!     action: Action::Allow,
//!     direction: Direction::Inbound,
//!     protocol: Protocol::Tcp,
//!     port: Some("1000:2000".to_string()),
//!     interface: None,
//! };
//! let rule = spec.into_rule(uuid::Uuid::new_v4()).unwrap();
//! assert_eq!(rule.port, Some(PortSpec::Range(1000, 2000)));
//! assert!(!rule.active);
//! ```

use crate::core::error::{Error, Result};
use crate::validators::{parse_port_number, validate_interface, validate_port_range};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Prefix of the comment tag attached to every live entry phoque creates
pub const TAG_PREFIX: &str = "phoque-";

/// Rule id carried by a `phoque-<uuid>` tag.
///
/// Only the hyphenated form phoque writes is accepted, so comments that
/// merely start with the prefix are not attributed to any rule.
pub fn rule_id_from_tag(tag: &str) -> Option<Uuid> {
    let id = tag.strip_prefix(TAG_PREFIX)?;
    if id.len() != 36 {
        return None;
    }
    Uuid::parse_str(id).ok()
}

/// Maximum number of rules allowed in the store
///
/// Limit prevents memory exhaustion from malformed rule files.
pub const MAX_RULES: usize = 1000;

/// Filter verdict of a rule
#[derive(
    Debug,
    Clone,
    Copy,
    Serialize,
    Deserialize,
    PartialEq,
    Eq,
    Hash,
    strum::Display,
    strum::EnumString,
    strum::EnumIter,
    strum::AsRefStr,
)]
#[serde(rename_all = "lowercase")]
#[strum(ascii_case_insensitive)]
pub enum Action {
    /// Let the packet through
    #[strum(serialize = "allow")]
    Allow,
    /// Drop the packet silently
    #[strum(serialize = "deny")]
    Deny,
    /// Drop the packet and answer with an ICMP error
    #[strum(serialize = "reject")]
    Reject,
}

impl Action {
    /// Returns the iptables jump target
    pub const fn verdict(self) -> &'static str {
        match self {
            Action::Allow => "ACCEPT",
            Action::Deny => "DROP",
            Action::Reject => "REJECT",
        }
    }

    pub const fn display_name(self) -> &'static str {
        match self {
            Action::Allow => "ALLOW",
            Action::Deny => "DENY",
            Action::Reject => "REJECT",
        }
    }
}

/// Traffic direction, which selects the built-in chain
#[derive(
    Debug,
    Clone,
    Copy,
    Serialize,
    Deserialize,
    PartialEq,
    Eq,
    Hash,
    strum::Display,
    strum::EnumString,
    strum::EnumIter,
    strum::AsRefStr,
)]
#[strum(ascii_case_insensitive)]
pub enum Direction {
    #[serde(rename = "in")]
    #[strum(to_string = "in", serialize = "inbound")]
    Inbound,
    #[serde(rename = "out")]
    #[strum(to_string = "out", serialize = "outbound")]
    Outbound,
    #[serde(rename = "forward")]
    #[strum(serialize = "forward")]
    Forward,
}

impl Direction {
    pub const fn chain(self) -> Chain {
        match self {
            Direction::Inbound => Chain::Input,
            Direction::Outbound => Chain::Output,
            Direction::Forward => Chain::Forward,
        }
    }

    /// Interface flag for this direction: outbound traffic matches the output
    /// interface, everything else the input interface.
    pub const fn interface_flag(self) -> &'static str {
        match self {
            Direction::Outbound => "-o",
            Direction::Inbound | Direction::Forward => "-i",
        }
    }

    pub const fn display_name(self) -> &'static str {
        match self {
            Direction::Inbound => "IN",
            Direction::Outbound => "OUT",
            Direction::Forward => "FORWARD",
        }
    }
}

/// Built-in iptables filter chains phoque writes to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display)]
pub enum Chain {
    #[strum(serialize = "INPUT")]
    Input,
    #[strum(serialize = "OUTPUT")]
    Output,
    #[strum(serialize = "FORWARD")]
    Forward,
}

impl Chain {
    pub const ALL: [Chain; 3] = [Chain::Input, Chain::Output, Chain::Forward];

    pub const fn as_str(self) -> &'static str {
        match self {
            Chain::Input => "INPUT",
            Chain::Output => "OUTPUT",
            Chain::Forward => "FORWARD",
        }
    }
}

/// Transport protocol matched by a rule
#[derive(
    Debug,
    Clone,
    Copy,
    Serialize,
    Deserialize,
    PartialEq,
    Eq,
    Hash,
    strum::Display,
    strum::EnumString,
    strum::EnumIter,
    strum::AsRefStr,
)]
#[serde(rename_all = "lowercase")]
#[strum(ascii_case_insensitive)]
pub enum Protocol {
    #[strum(serialize = "tcp")]
    Tcp,
    #[strum(serialize = "udp")]
    Udp,
    #[strum(serialize = "icmp")]
    Icmp,
}

impl Protocol {
    /// Returns the value passed to `-p`
    pub const fn as_str(self) -> &'static str {
        match self {
            Protocol::Tcp => "tcp",
            Protocol::Udp => "udp",
            Protocol::Icmp => "icmp",
        }
    }

    pub const fn display_name(self) -> &'static str {
        match self {
            Protocol::Tcp => "TCP",
            Protocol::Udp => "UDP",
            Protocol::Icmp => "ICMP",
        }
    }

    /// Only TCP and UDP carry a destination port.
    pub const fn supports_ports(self) -> bool {
        matches!(self, Protocol::Tcp | Protocol::Udp)
    }
}

/// Destination port selector, backend-agnostic
///
/// Serialized in its textual form (`"80"`, `"*"`, `"1000-2000"`), which is
/// also what [`PortSpec::from_str`] accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum PortSpec {
    Single(u16),
    Wildcard,
    Range(u16, u16),
}

impl PortSpec {
    /// Value for `--dport`, or `None` when no port match should be emitted.
    pub fn dport_arg(&self) -> Option<String> {
        match self {
            PortSpec::Single(port) => Some(port.to_string()),
            PortSpec::Wildcard => None,
            PortSpec::Range(lo, hi) => Some(format!("{lo}:{hi}")),
        }
    }
}

/// Parses user-facing port text.
///
/// Accepted forms: `*`, `<n>`, `<a>-<b>`, `<a>:<b>` with ports in 1-65535 and
/// `a <= b`. Surrounding whitespace is ignored.
///
/// # Errors
///
/// Returns [`Error::InvalidPortSpec`] for anything else.
pub fn parse_port_spec(text: &str) -> Result<PortSpec> {
    let invalid = |reason: String| Error::InvalidPortSpec {
        input: text.to_string(),
        reason,
    };
    let trimmed = text.trim();

    if trimmed == "*" {
        return Ok(PortSpec::Wildcard);
    }

    if let Some((lo, hi)) = trimmed.split_once(['-', ':']) {
        let lo = parse_port_number(lo).map_err(invalid)?;
        let hi = parse_port_number(hi).map_err(invalid)?;
        let (lo, hi) = validate_port_range(lo, hi).map_err(invalid)?;
        return Ok(PortSpec::Range(lo, hi));
    }

    parse_port_number(trimmed)
        .map(PortSpec::Single)
        .map_err(invalid)
}

impl FromStr for PortSpec {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        parse_port_spec(s)
    }
}

impl TryFrom<String> for PortSpec {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        parse_port_spec(&value)
    }
}

impl From<PortSpec> for String {
    fn from(value: PortSpec) -> Self {
        value.to_string()
    }
}

impl fmt::Display for PortSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PortSpec::Single(port) => write!(f, "{port}"),
            PortSpec::Wildcard => f.write_str("*"),
            PortSpec::Range(lo, hi) => write!(f, "{lo}-{hi}"),
        }
    }
}

/// One declarative filter intent, as stored and persisted
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Rule {
    pub id: Uuid,
    pub action: Action,
    pub direction: Direction,
    pub protocol: Protocol,
    /// Present for TCP/UDP, always `None` for ICMP
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<PortSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interface: Option<String>,
    #[serde(default)]
    pub active: bool,
}

impl Rule {
    /// Comment tag identifying this rule's live entries: `phoque-<id>`
    pub fn tag(&self) -> String {
        format!("{TAG_PREFIX}{}", self.id)
    }

    /// First hyphen-separated segment of the id, for display
    pub fn short_id(&self) -> String {
        let mut id = self.id.to_string();
        id.truncate(8);
        id
    }

    /// One-line human description, e.g. `ALLOW IN TCP port 80 @eth0`
    pub fn summary(&self) -> String {
        let mut out = format!(
            "{} {} {}",
            self.action.display_name(),
            self.direction.display_name(),
            self.protocol.display_name()
        );
        if let Some(port) = self.port.filter(|_| self.protocol.supports_ports()) {
            out.push_str(&format!(" port {port}"));
        }
        if let Some(ref iface) = self.interface {
            out.push_str(&format!(" @{iface}"));
        }
        out
    }

    /// Checks the field invariants a persisted record must satisfy.
    ///
    /// # Errors
    ///
    /// Returns a validation error when a TCP/UDP rule has no port or the
    /// interface name is malformed.
    pub fn validate(&self) -> Result<()> {
        if self.protocol.supports_ports() && self.port.is_none() {
            return Err(Error::validation(
                "port",
                format!("Port is required for {} rules", self.protocol.display_name()),
            ));
        }
        if let Some(ref iface) = self.interface {
            validate_interface(iface).map_err(|e| Error::validation("interface", e))?;
        }
        Ok(())
    }

    /// Overwrites the editable fields from a validated spec.
    /// `id` and `active` are left untouched.
    pub(crate) fn overwrite(&mut self, fields: RuleFields) {
        self.action = fields.action;
        self.direction = fields.direction;
        self.protocol = fields.protocol;
        self.port = fields.port;
        self.interface = fields.interface;
    }
}

/// Unvalidated rule input, as entered by the user
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleSpec {
    pub action: Action,
    pub direction: Direction,
    pub protocol: Protocol,
    /// Raw port text; required for TCP/UDP, ignored for ICMP
    pub port: Option<String>,
    /// Empty strings are treated as "no interface"
    pub interface: Option<String>,
}

/// Validated editable fields of a rule
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct RuleFields {
    action: Action,
    direction: Direction,
    protocol: Protocol,
    port: Option<PortSpec>,
    interface: Option<String>,
}

impl RuleSpec {
    pub(crate) fn validate(&self) -> Result<RuleFields> {
        let port = if self.protocol.supports_ports() {
            let text = self
                .port
                .as_deref()
                .map(str::trim)
                .filter(|t| !t.is_empty())
                .ok_or_else(|| {
                    Error::validation(
                        "port",
                        format!("Port is required for {} rules", self.protocol.display_name()),
                    )
                })?;
            Some(parse_port_spec(text)?)
        } else {
            None
        };

        let interface = match self.interface.as_deref().map(str::trim) {
            None | Some("") => None,
            Some(name) => {
                Some(validate_interface(name).map_err(|e| Error::validation("interface", e))?)
            }
        };

        Ok(RuleFields {
            action: self.action,
            direction: self.direction,
            protocol: self.protocol,
            port,
            interface,
        })
    }

    /// Validates the spec and builds an inactive rule with the given identity.
    ///
    /// # Errors
    ///
    /// Returns a validation error (including [`Error::InvalidPortSpec`]) when
    /// any field is invalid.
    pub fn into_rule(self, id: Uuid) -> Result<Rule> {
        let fields = self.validate()?;
        Ok(Rule {
            id,
            action: fields.action,
            direction: fields.direction,
            protocol: fields.protocol,
            port: fields.port,
            interface: fields.interface,
            active: false,
        })
    }
}

impl From<&Rule> for RuleSpec {
    fn from(rule: &Rule) -> Self {
        Self {
            action: rule.action,
            direction: rule.direction,
            protocol: rule.protocol,
            port: rule.port.map(|p| p.to_string()),
            interface: rule.interface.clone(),
        }
    }
}
