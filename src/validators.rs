//! Pure format validators used across configuration and auth handling.

use std::net::IpAddr;
use std::sync::LazyLock;

use regex::Regex;

/// This regular expression comes from the HTML5 specs and is used by web
/// browsers to validate "email" input fields.
static EMAIL_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^[a-zA-Z0-9.!#$%&'*+/=?^_`{|}~-]+@[a-zA-Z0-9](?:[a-zA-Z0-9-]{0,61}[a-zA-Z0-9])?(?:\.[a-zA-Z0-9](?:[a-zA-Z0-9-]{0,61}[a-zA-Z0-9])?)*$",
    )
    .expect("email regex is valid")
});

/// Returns true if the string is a valid email address.
#[must_use]
pub fn email(val: &str) -> bool {
    EMAIL_RE.is_match(val)
}

/// Returns true if the string is a valid item ID: a 21-character
/// NanoID-style base64-url token.
#[must_use]
pub fn item_id(val: &str) -> bool {
    base64_url(val, 21)
}

/// Returns true if the argument matches `[a-zA-Z0-9_-]` and has exactly the
/// given length.
#[must_use]
pub fn base64_url(val: &str, expect_len: usize) -> bool {
    val.len() == expect_len
        && val
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-')
}

/// Returns true if the argument is a valid IPv4 or IPv6 address.
#[must_use]
pub fn is_ip(val: &str) -> bool {
    val.parse::<IpAddr>().is_ok()
}

/// Returns true if a string is a valid hostname per RFC 1035 / RFC 3696
/// presentation format.
#[must_use]
pub fn is_hostname(s: &str) -> bool {
    // The root domain name is valid.
    if s == "." {
        return true;
    }

    // Effective maximum is 253 octets, but 254 is accepted if the last
    // character is a dot (fully-qualified input).
    let bytes = s.as_bytes();
    let l = bytes.len();
    if l == 0 || l > 254 || (l == 254 && bytes[l - 1] != b'.') {
        return false;
    }

    let mut last = b'.';
    let mut non_numeric = false; // true once we've seen a letter or hyphen
    let mut part_len = 0usize;
    for &c in bytes {
        match c {
            b'a'..=b'z' | b'A'..=b'Z' | b'_' => {
                non_numeric = true;
                part_len += 1;
            }
            b'0'..=b'9' => {
                part_len += 1;
            }
            b'-' => {
                // Byte before dash cannot be dot.
                if last == b'.' {
                    return false;
                }
                part_len += 1;
                non_numeric = true;
            }
            b'.' => {
                // Byte before dot cannot be dot or dash.
                if last == b'.' || last == b'-' {
                    return false;
                }
                if part_len > 63 || part_len == 0 {
                    return false;
                }
                part_len = 0;
            }
            _ => return false,
        }
        last = c;
    }
    if last == b'-' || part_len > 63 {
        return false;
    }

    non_numeric
}
