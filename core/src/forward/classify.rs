//! Classification of helper process output lines.
//!
//! kubectl and socat only talk to us through their stdout/stderr, so the
//! supervisor feeds every line through `classify` to decide whether it is
//! routine chatter, a failure, or a local port bind conflict.

/// Classification of a single line of helper output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineClass {
    /// Routine output, e.g. "Forwarding from 127.0.0.1:8080 -> 80".
    Normal,
    /// Recognized failure phrasing without a usable port number.
    ErrorLine,
    /// A bind failed because the given local port is taken.
    PortConflict(u16),
}

/// Classifies one line of kubectl/socat output.
///
/// Pure function; patterns track the phrasing the helper tools actually emit.
pub fn classify(line: &str) -> LineClass {
    if let Some(port) = detect_port_conflict(line) {
        return LineClass::PortConflict(port);
    }
    if is_error_line(line) {
        return LineClass::ErrorLine;
    }
    LineClass::Normal
}

fn is_error_line(line: &str) -> bool {
    let line_lower = line.to_lowercase();
    line_lower.contains("error")
        || line_lower.contains("failed")
        || line_lower.contains("unable to")
        || line_lower.contains("connection refused")
        || line_lower.contains("lost connection")
        || line_lower.contains("an error occurred")
}

/// Extracts the conflicting port from an "address already in use" line.
fn detect_port_conflict(line: &str) -> Option<u16> {
    // kubectl: "listen tcp4 127.0.0.1:8080: bind: address already in use"
    // socat:   "socat[12345] E bind(5, {AF=2 0.0.0.0:9090}, 16): Address already in use"

    if !line.to_lowercase().contains("address already in use") {
        return None;
    }

    // The port follows an address pattern (x.x.x.x:PORT or [::]:PORT), so
    // take the first colon-delimited leading number that cannot be an octet.
    for (i, part) in line.split(':').enumerate() {
        if i == 0 {
            continue;
        }

        let digits: String = part.chars().take_while(|c| c.is_ascii_digit()).collect();
        if digits.is_empty() {
            continue;
        }

        if let Ok(port) = digits.parse::<u16>() {
            // Values <= 255 are usually IP octets, not ports.
            if port > 255 {
                return Some(port);
            }
        }
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normal_lines() {
        assert_eq!(classify("Forwarding from 127.0.0.1:8080 -> 80"), LineClass::Normal);
        assert_eq!(classify("Handling connection for 8080"), LineClass::Normal);
        assert_eq!(classify(""), LineClass::Normal);
    }

    #[test]
    fn test_error_lines() {
        assert_eq!(classify("Error: connection refused"), LineClass::ErrorLine);
        assert_eq!(classify("Failed to connect"), LineClass::ErrorLine);
        assert_eq!(classify("Unable to establish connection"), LineClass::ErrorLine);
        assert_eq!(classify("Lost connection to server"), LineClass::ErrorLine);
        assert_eq!(
            classify("E0101 an error occurred forwarding 8080 -> 80"),
            LineClass::ErrorLine
        );
    }

    #[test]
    fn test_port_conflict_kubectl() {
        let line = "listen tcp4 127.0.0.1:8080: bind: address already in use";
        assert_eq!(classify(line), LineClass::PortConflict(8080));
    }

    #[test]
    fn test_port_conflict_socat() {
        let line = "socat[12345] E bind(5, {AF=2 0.0.0.0:9090}, 16): Address already in use";
        assert_eq!(classify(line), LineClass::PortConflict(9090));
    }

    #[test]
    fn test_port_conflict_postgres_port() {
        let line = "listen tcp4 127.0.0.1:5432: bind: address already in use";
        assert_eq!(classify(line), LineClass::PortConflict(5432));
    }

    #[test]
    fn test_conflict_wins_over_error() {
        // "bind" conflict lines also match the generic error phrasing; the
        // conflict classification must take precedence.
        let line = "unable to listen: 127.0.0.1:3000: address already in use";
        assert_eq!(classify(line), LineClass::PortConflict(3000));
    }

    #[test]
    fn test_conflict_without_usable_port() {
        // Octets only, nothing above 255 to treat as a port.
        let line = "unable to bind 10.0.0.1: address already in use";
        assert_eq!(classify(line), LineClass::ErrorLine);
    }
}
