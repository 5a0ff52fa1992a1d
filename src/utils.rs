//! Small shared helpers: identifier/version validation and octal mode
//! parsing used by the manifest validator, plus a millisecond timestamp
//! helper used when stamping snapshots.

use chrono::Utc;

/// `[A-Za-z0-9_-]+`, used for package names.
pub fn is_package_name(s: &str) -> bool {
    !s.is_empty()
        && s.chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

/// `[A-Za-z_][A-Za-z0-9_-]*`, used for usernames.
pub fn is_username(s: &str) -> bool {
    let mut chars = s.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

/// `MAJOR.MINOR.PATCH[-PRERELEASE]`.
pub fn is_semver(s: &str) -> bool {
    let (core, _prerelease) = match s.split_once('-') {
        Some((core, pre)) => (core, Some(pre)),
        None => (s, None),
    };
    let parts: Vec<&str> = core.split('.').collect();
    parts.len() == 3
        && parts
            .iter()
            .all(|p| !p.is_empty() && p.chars().all(|c| c.is_ascii_digit()))
}

/// Octal file mode, 3-4 digits (e.g. `"644"`, `"0755"`).
pub fn parse_octal_mode(s: &str) -> Option<u32> {
    if s.len() < 3 || s.len() > 4 || !s.chars().all(|c| c.is_digit(8)) {
        return None;
    }
    u32::from_str_radix(s, 8).ok()
}

/// Current time in milliseconds since the Unix epoch, for snapshot stamps.
pub fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}
