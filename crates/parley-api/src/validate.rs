//! Input validators for registration and profile updates.

use std::sync::OnceLock;

use regex::Regex;

/// Usernames and group names: 4–50 characters, alphanumeric plus
/// underscore.
pub fn valid_username(s: &str) -> bool {
    (4..=50).contains(&s.len())
        && s.bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'_')
}

/// Passwords: 8–20 characters with at least one uppercase letter, one
/// lowercase letter, one digit, and one special character.
pub fn valid_password(s: &str) -> bool {
    if !(8..=20).contains(&s.len()) {
        return false;
    }
    let has_upper = s.chars().any(|c| c.is_ascii_uppercase());
    let has_lower = s.chars().any(|c| c.is_ascii_lowercase());
    let has_digit = s.chars().any(|c| c.is_ascii_digit());
    let has_special = s
        .chars()
        .any(|c| !c.is_ascii_alphanumeric() && !c.is_whitespace());
    has_upper && has_lower && has_digit && has_special
}

/// Phone numbers: optional country prefix followed by a 10-digit
/// subscriber number, with optional single separators.
pub fn valid_phonenumber(s: &str) -> bool {
    static PHONE_RE: OnceLock<Regex> = OnceLock::new();
    let re = PHONE_RE.get_or_init(|| {
        Regex::new(r"^(?:(?:\+\d{1,3}|0)?[ -]?)?(?:\d{2,4}[ -]?\d{6,8}|\d{10})$")
            .expect("phonenumber regex must compile")
    });
    re.is_match(s)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn usernames_require_length_and_charset() {
        assert!(valid_username("ana_b"));
        assert!(valid_username("user1234"));
        assert!(!valid_username("abc"), "too short");
        assert!(!valid_username(&"a".repeat(51)), "too long");
        assert!(!valid_username("has space"));
        assert!(!valid_username("dash-ed"));
    }

    #[test]
    fn passwords_require_all_character_classes() {
        assert!(valid_password("Str0ng!pw"));
        assert!(!valid_password("short1!"), "too short");
        assert!(!valid_password("alllowercase1!"), "no uppercase");
        assert!(!valid_password("ALLUPPERCASE1!"), "no lowercase");
        assert!(!valid_password("NoDigits!!"), "no digit");
        assert!(!valid_password("NoSpecial12"), "no special");
        assert!(
            !valid_password(&format!("Aa1!{}", "x".repeat(20))),
            "too long"
        );
    }

    #[test]
    fn phonenumbers_accept_common_shapes() {
        assert!(valid_phonenumber("9876543210"));
        assert!(valid_phonenumber("+91 9876543210"));
        assert!(valid_phonenumber("0 9876543210"));
        assert!(valid_phonenumber("022 66778899"));
        assert!(!valid_phonenumber("12345"));
        assert!(!valid_phonenumber("not-a-number"));
    }
}
