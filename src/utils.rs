//! Small helpers shared by the services and adapters.

use core::fmt;

/// Returns `true` if every byte of `s` is in the printable ASCII range
/// `0x20..=0x7E` (space through tilde, inclusive).
///
/// Used to validate WiFi SSIDs, broker credentials and bridge usernames
/// before they are persisted.
pub fn is_printable_ascii(s: &str) -> bool {
    s.bytes().all(|b| (0x20..=0x7E).contains(&b))
}

/// Display wrapper that shows only the first four characters of a secret.
///
/// ```text
/// info!("Hue: paired as {}", Redacted(&username));   // "Hue: paired as 3fA9…(40)"
/// ```
pub struct Redacted<'a>(pub &'a str);

impl fmt::Display for Redacted<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let shown: String = self.0.chars().take(4).collect();
        if self.0.len() <= 4 {
            write!(f, "****")
        } else {
            write!(f, "{}…({})", shown, self.0.len())
        }
    }
}
