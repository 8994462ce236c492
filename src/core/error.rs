use crate::core::store::PersistenceError;
use thiserror::Error;

/// Core error types for phoque
#[derive(Debug, Error)]
pub enum Error {
    /// I/O operation failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization failed
    #[error("JSON error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Input validation failed
    #[error("Validation error in {field}: {message}")]
    Validation { field: String, message: String },

    /// Port text did not match `*`, `<n>`, `<a>-<b>` or `<a>:<b>`
    #[error("Invalid port specification '{input}': {reason}")]
    InvalidPortSpec { input: String, reason: String },

    /// Operation referenced an unknown rule identity
    #[error("Rule not found: {0}")]
    NotFound(String),

    /// iptables exited with a non-zero status
    #[error("iptables error ({}): {stderr}", describe_exit(.exit_code))]
    Backend {
        command: String,
        exit_code: Option<i32>,
        stderr: String,
    },

    /// Rule file could not be loaded or saved
    #[error("Persistence error: {0}")]
    Persistence(#[from] PersistenceError),

    /// Privilege escalation failed
    #[error("Elevation error: {0}")]
    Elevation(String),

    /// Internal logic error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    pub(crate) fn validation(field: &str, message: impl Into<String>) -> Self {
        Error::Validation {
            field: field.to_string(),
            message: message.into(),
        }
    }

    /// Returns `true` for errors caused by user input (rejected before any mutation).
    pub fn is_validation(&self) -> bool {
        matches!(self, Error::Validation { .. } | Error::InvalidPortSpec { .. })
    }

    /// Returns the diagnostic text of a backend failure, if this is one.
    pub fn backend_stderr(&self) -> Option<&str> {
        match self {
            Error::Backend { stderr, .. } => Some(stderr),
            _ => None,
        }
    }
}

/// Represents a translated error with helpful context
#[derive(Debug, Clone)]
pub struct ErrorTranslation {
    pub user_message: String,
    pub suggestions: Vec<String>,
    pub help_url: Option<String>,
}

impl ErrorTranslation {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            user_message: message.into(),
            suggestions: Vec::new(),
            help_url: None,
        }
    }

    pub fn with_suggestion(mut self, suggestion: impl Into<String>) -> Self {
        self.suggestions.push(suggestion.into());
        self
    }

    pub fn with_help(mut self, url: impl Into<String>) -> Self {
        self.help_url = Some(url.into());
        self
    }
}

/// Database of iptables error patterns and their translations
pub struct IptablesErrorPattern;

impl IptablesErrorPattern {
    /// Matches an error message against known patterns and returns a user-friendly translation.
    pub fn match_error(msg: &str) -> ErrorTranslation {
        let lower = msg.to_lowercase();

        // Permission errors
        if lower.contains("permission denied")
            || lower.contains("operation not permitted")
            || lower.contains("you must be root")
        {
            return ErrorTranslation::new("Insufficient permissions to modify firewall rules")
                .with_suggestion("Run phoque from a terminal so sudo can prompt for a password")
                .with_suggestion("Or force a method: PHOQUE_ELEVATION_METHOD=sudo phoque apply")
                .with_suggestion("Check if CAP_NET_ADMIN capability is available")
                .with_help("https://wiki.archlinux.org/title/Iptables");
        }

        // Comment match module missing (checked before the generic "no such file")
        if lower.contains("couldn't load match `comment'") {
            return ErrorTranslation::new("The iptables comment match is unavailable")
                .with_suggestion("Load the module: sudo modprobe xt_comment")
                .with_suggestion("phoque tags every rule with a comment and cannot work without it");
        }

        // Missing iptables
        if lower.contains("no such file") || lower.contains("command not found") {
            return ErrorTranslation::new("iptables is not installed or not found in PATH")
                .with_suggestion("Install iptables: sudo apt install iptables  (Debian/Ubuntu)")
                .with_suggestion("Or: sudo dnf install iptables-nft  (Fedora/RHEL)")
                .with_suggestion("Or: sudo pacman -S iptables-nft  (Arch)")
                .with_suggestion("Or point iptables_command in config.json at the binary");
        }

        // xtables lock held by another process
        if lower.contains("xtables lock") || lower.contains("another app is currently holding") {
            return ErrorTranslation::new("Another process is modifying iptables")
                .with_suggestion("Wait a moment and try again")
                .with_suggestion(
                    "Check for conflicting firewall managers: sudo systemctl status firewalld ufw",
                );
        }

        // Unknown chain or target
        if lower.contains("no chain/target/match by that name") {
            return ErrorTranslation::new("Chain, target or match not found")
                .with_suggestion("Check kernel modules: lsmod | grep -E 'x_tables|ip_tables'")
                .with_suggestion("REJECT needs the ipt_REJECT module: sudo modprobe ipt_REJECT");
        }

        // Rule did not match on delete
        if lower.contains("bad rule") || lower.contains("does a matching rule exist") {
            return ErrorTranslation::new("No matching rule exists in that chain")
                .with_suggestion("The rule was probably removed outside phoque")
                .with_suggestion("Run 'phoque apply' to rebuild the tagged rules");
        }

        // Argument errors
        if lower.contains("bad argument") || lower.contains("unknown option") || lower.contains("invalid port") {
            return ErrorTranslation::new("iptables rejected the rule arguments")
                .with_suggestion("Verify port numbers are between 1 and 65535")
                .with_suggestion("For port ranges, ensure start <= end")
                .with_suggestion("Check that ICMP rules don't specify port numbers")
                .with_help("https://ipset.netfilter.org/iptables.man.html");
        }

        // Invalid interface
        if lower.contains("interface") && lower.contains("invalid") {
            return ErrorTranslation::new("Network interface name is invalid")
                .with_suggestion("Check available interfaces: ip link show")
                .with_suggestion("Interface names are case-sensitive and max 15 chars");
        }

        // Generic fallback
        ErrorTranslation::new(format!("Firewall error: {msg}"))
            .with_suggestion("Check the detailed error message for more information")
            .with_suggestion("Verify iptables is working: sudo iptables -S")
    }
}

#[allow(clippy::ref_option)]
fn describe_exit(code: &Option<i32>) -> String {
    code.map_or_else(|| "killed by signal".to_string(), |c| format!("exit {c}"))
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_iptables_missing_command() {
        let translation = IptablesErrorPattern::match_error("command not found: iptables");
        assert!(translation.user_message.contains("not installed"));
        assert!(translation.suggestions.len() >= 3); // Multiple distro options
    }

    #[test]
    fn test_permission_denied() {
        let translation = IptablesErrorPattern::match_error(
            "iptables v1.8.9 (nf_tables): Could not fetch rule set generation id: Permission denied (you must be root)",
        );
        assert!(translation.user_message.contains("permissions"));
        assert!(translation.help_url.is_some());
    }

    #[test]
    fn test_xtables_lock() {
        let translation = IptablesErrorPattern::match_error(
            "Another app is currently holding the xtables lock. Perhaps you want to use the -w option?",
        );
        assert!(translation.user_message.contains("Another process"));
    }

    #[test]
    fn test_bad_rule() {
        let translation = IptablesErrorPattern::match_error(
            "iptables: Bad rule (does a matching rule exist in that chain?).",
        );
        assert!(translation.user_message.contains("No matching rule"));
    }

    #[test]
    fn test_unknown_target() {
        let translation =
            IptablesErrorPattern::match_error("iptables: No chain/target/match by that name.");
        assert!(translation.suggestions.iter().any(|s| s.contains("modprobe")));
    }

    #[test]
    fn test_generic_fallback_keeps_message() {
        let translation = IptablesErrorPattern::match_error("something odd");
        assert!(translation.user_message.contains("something odd"));
    }

    #[test]
    fn test_validation_classification() {
        assert!(Error::validation("port", "required").is_validation());
        assert!(
            Error::InvalidPortSpec {
                input: "abc".into(),
                reason: "not a number".into()
            }
            .is_validation()
        );
        assert!(!Error::NotFound("x".into()).is_validation());
    }

    #[test]
    fn test_backend_display_includes_exit_code() {
        let err = Error::Backend {
            command: "iptables -A INPUT".into(),
            exit_code: Some(4),
            stderr: "resource problem".into(),
        };
        assert_eq!(err.to_string(), "iptables error (exit 4): resource problem");
        assert_eq!(err.backend_stderr(), Some("resource problem"));
    }
}
