//! Input format validation for bucket keys and passwords.
//!
//! Both checks run before any network traffic so a typo never burns a
//! round trip or a multi-second key derivation.

use crate::error::{Result, XferError};

/// Minimum password length.
const PASSWORD_MIN_LEN: usize = 12;

/// Maximum password length.
const PASSWORD_MAX_LEN: usize = 64;

/// Longest permitted run of one repeated character.
const MAX_CHAR_RUN: usize = 3;

/// Validates the `AAA-BBB-NN` bucket key format.
///
/// Three ASCII uppercase letters, dash, three letters, dash, two digits.
pub fn verify_bucket_key_format(key: &str) -> Result<()> {
    let bytes = key.as_bytes();
    let well_formed = bytes.len() == 10
        && bytes[0..3].iter().all(|b| b.is_ascii_uppercase())
        && bytes[3] == b'-'
        && bytes[4..7].iter().all(|b| b.is_ascii_uppercase())
        && bytes[7] == b'-'
        && bytes[8..10].iter().all(|b| b.is_ascii_digit());

    if well_formed {
        Ok(())
    } else {
        Err(XferError::InputInvalid(
            "bucket key must look like AAA-BBB-01".into(),
        ))
    }
}

/// Validates the password policy.
///
/// 12-64 printable ASCII characters with at least one uppercase letter,
/// one lowercase letter, one digit and one symbol; no whitespace or
/// control characters; no run of more than three identical characters.
pub fn verify_password_format(password: &[u8]) -> Result<()> {
    let reject = |reason: &str| Err(XferError::InputInvalid(format!("password {}", reason)));

    if password.len() < PASSWORD_MIN_LEN {
        return reject("is too short (minimum 12 characters)");
    }
    if password.len() > PASSWORD_MAX_LEN {
        return reject("is too long (maximum 64 characters)");
    }

    let mut has_upper = false;
    let mut has_lower = false;
    let mut has_digit = false;
    let mut has_symbol = false;
    let mut run_char = 0u8;
    let mut run_len = 0usize;

    for &b in password {
        if !(0x21..=0x7e).contains(&b) {
            // Space, control bytes and anything non-ASCII land here.
            return reject("must be printable ASCII without whitespace");
        }

        match b {
            b'A'..=b'Z' => has_upper = true,
            b'a'..=b'z' => has_lower = true,
            b'0'..=b'9' => has_digit = true,
            _ => has_symbol = true,
        }

        if b == run_char {
            run_len += 1;
            if run_len > MAX_CHAR_RUN {
                return reject("must not repeat a character more than three times in a row");
            }
        } else {
            run_char = b;
            run_len = 1;
        }
    }

    if !has_upper {
        return reject("needs an uppercase letter");
    }
    if !has_lower {
        return reject("needs a lowercase letter");
    }
    if !has_digit {
        return reject("needs a digit");
    }
    if !has_symbol {
        return reject("needs a symbol");
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bucket_key_accepts_well_formed() {
        assert!(verify_bucket_key_format("ABC-DEF-01").is_ok());
        assert!(verify_bucket_key_format("ZZZ-AAA-99").is_ok());
    }

    #[test]
    fn test_bucket_key_rejects_malformed() {
        for key in [
            "",
            "abc-def-01",     // lowercase
            "ABC-DEF-0A",     // letter in digits
            "AB-DEF-01",      // short group
            "ABCD-EF-01",     // misplaced dash
            "ABC_DEF_01",     // wrong separator
            "ABC-DEF-012",    // too long
            "ÀBC-DEF-01",     // non-ASCII
        ] {
            assert!(verify_bucket_key_format(key).is_err(), "{:?}", key);
        }
    }

    #[test]
    fn test_password_accepts_policy_compliant() {
        for pwd in ["Abcd!1Abcd!1", "pw2-Strong!X", "A1b2-C3d4+E5f6"] {
            assert!(verify_password_format(pwd.as_bytes()).is_ok(), "{:?}", pwd);
        }
    }

    #[test]
    fn test_password_rejects_length_violations() {
        assert!(verify_password_format(b"Ab1!short").is_err());
        let long = "Ab1!".repeat(17); // 68 chars
        assert!(verify_password_format(long.as_bytes()).is_err());
    }

    #[test]
    fn test_password_rejects_missing_classes() {
        assert!(verify_password_format(b"abcd!1abcd!1").is_err()); // no upper
        assert!(verify_password_format(b"ABCD!1ABCD!1").is_err()); // no lower
        assert!(verify_password_format(b"Abcd!xAbcd!x").is_err()); // no digit
        assert!(verify_password_format(b"Abcd11Abcd11").is_err()); // no symbol
    }

    #[test]
    fn test_password_rejects_whitespace_and_control() {
        assert!(verify_password_format(b"Abcd!1 Abcd!1").is_err());
        assert!(verify_password_format(b"Abcd!1\tAbcd!1").is_err());
        assert!(verify_password_format(b"Abcd!1\x00Abcd!1").is_err());
    }

    #[test]
    fn test_password_rejects_long_runs() {
        // Four identical characters in a row is one too many.
        assert!(verify_password_format(b"Abcd!1aaaaB2").is_err());
        // Three is allowed.
        assert!(verify_password_format(b"Abcd!1aaaB2c").is_ok());
    }
}
