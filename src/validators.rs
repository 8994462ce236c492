//! Input validation for phoque
//!
//! Every value that ends up on an iptables command line passes through here
//! first. Arguments are never shell-interpolated, but iptables itself rejects
//! malformed values with unhelpful messages, so they are caught early.

/// Validates a single port number.
///
/// # Errors
///
/// Returns `Err` if port is 0 (reserved).
pub fn validate_port(port: u16) -> Result<u16, String> {
    if port == 0 {
        Err("Port must be between 1 and 65535".to_string())
    } else {
        Ok(port)
    }
}

/// Validates a port range.
///
/// # Errors
///
/// Returns `Err` if:
/// - Either port is 0
/// - Start port is greater than end port
pub fn validate_port_range(start: u16, end: u16) -> Result<(u16, u16), String> {
    validate_port(start)?;
    validate_port(end)?;

    if start > end {
        Err("Start port must be less than or equal to end port".to_string())
    } else {
        Ok((start, end))
    }
}

/// Parses a decimal port number, accepting digits only.
///
/// `u16::from_str` tolerates a leading `+`, which iptables does not.
///
/// # Errors
///
/// Returns `Err` for empty input, non-digit characters, or values outside 1-65535.
pub fn parse_port_number(text: &str) -> Result<u16, String> {
    if text.is_empty() {
        return Err("Port number is missing".to_string());
    }
    if !text.bytes().all(|b| b.is_ascii_digit()) {
        return Err(format!("'{text}' is not a port number"));
    }
    let port = text
        .parse::<u16>()
        .map_err(|_| "Port must be between 1 and 65535".to_string())?;
    validate_port(port)
}

/// Validates a network interface name.
///
/// Linux kernel interface name rules:
/// - Max 15 characters (IFNAMSIZ - 1)
/// - Alphanumeric, dot, dash, underscore only
/// - Cannot be "." or ".."
///
/// A trailing `+` is accepted as the iptables interface wildcard (`eth+`).
///
/// # Errors
///
/// Returns `Err` if interface name violates kernel constraints.
pub fn validate_interface(name: &str) -> Result<String, String> {
    if name.is_empty() {
        return Err("Interface name cannot be empty".to_string());
    }

    if name.len() > 15 {
        return Err("Interface name too long (max 15 characters)".to_string());
    }

    if name == "." || name == ".." {
        return Err("Invalid interface name".to_string());
    }

    let body = name.strip_suffix('+').unwrap_or(name);

    // Check for valid characters (ASCII alphanumeric only, plus dot, dash, underscore)
    if body.is_empty()
        || !body
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_'))
    {
        return Err("Interface name contains invalid characters".to_string());
    }

    Ok(name.to_string())
}
