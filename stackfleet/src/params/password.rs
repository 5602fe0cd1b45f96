//! Random value generators used by parameter directives.

use rand::seq::SliceRandom;
use rand::Rng;
use std::fmt;

const LOWERCASE: &[u8] = b"abcdefghijklmnopqrstuvwxyz";
const UPPERCASE: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ";
const DIGITS: &[u8] = b"1234567890";
const SPECIALS: &[u8] = b"!#$&{*:[=,]-_%@+";

/// Character mix of a generated password.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PasswordKind {
    /// Lowercase, uppercase and digits.
    #[default]
    Alphanumeric,
    /// Lowercase, uppercase, digits and specials.
    Special,
}

impl PasswordKind {
    /// Parses the optional type suffix of a `genpass` directive.
    ///
    /// `A` selects alphanumeric, `S` adds special characters, anything else
    /// falls back to the alphanumeric default.
    #[must_use]
    pub fn from_suffix(suffix: Option<&str>) -> Self {
        match suffix {
            Some(s) if s.eq_ignore_ascii_case("s") => Self::Special,
            _ => Self::Alphanumeric,
        }
    }

    fn classes(self) -> &'static [&'static [u8]] {
        match self {
            Self::Alphanumeric => &[LOWERCASE, UPPERCASE, DIGITS],
            Self::Special => &[LOWERCASE, UPPERCASE, DIGITS, SPECIALS],
        }
    }
}

impl fmt::Display for PasswordKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Alphanumeric => write!(f, "alphanumeric"),
            Self::Special => write!(f, "special"),
        }
    }
}

/// Generates a password of exactly `length` characters.
///
/// Characters cycle through the classes of `kind` so every class is
/// represented once the length covers a full cycle.
#[must_use]
pub fn generate_password(length: usize, kind: PasswordKind) -> String {
    let mut rng = rand::thread_rng();
    kind.classes()
        .iter()
        .cycle()
        .take(length)
        .filter_map(|class| class.choose(&mut rng).copied())
        .map(char::from)
        .collect()
}

/// Generates a string of `length` random lowercase letters.
#[must_use]
pub fn random_lowercase(length: usize) -> String {
    random_from(LOWERCASE, length)
}

/// Generates a string of `length` random digits.
#[must_use]
pub fn random_digits(length: usize) -> String {
    random_from(DIGITS, length)
}

fn random_from(alphabet: &[u8], length: usize) -> String {
    let mut rng = rand::thread_rng();
    (0..length)
        .map(|_| char::from(alphabet[rng.gen_range(0..alphabet.len())]))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_password_exact_length() {
        for length in [1, 2, 3, 7, 8, 16, 32, 99] {
            assert_eq!(generate_password(length, PasswordKind::Alphanumeric).len(), length);
            assert_eq!(generate_password(length, PasswordKind::Special).len(), length);
        }
    }

    #[test]
    fn test_alphanumeric_has_no_specials() {
        let password = generate_password(64, PasswordKind::Alphanumeric);
        assert!(password.chars().all(|c| c.is_ascii_alphanumeric()));
    }

    #[test]
    fn test_special_cycles_classes() {
        let password = generate_password(8, PasswordKind::Special);
        let chars: Vec<char> = password.chars().collect();
        assert!(chars[0].is_ascii_lowercase());
        assert!(chars[1].is_ascii_uppercase());
        assert!(chars[2].is_ascii_digit());
        assert!(SPECIALS.contains(&(chars[3] as u8)));
    }

    #[test]
    fn test_kind_from_suffix() {
        assert_eq!(PasswordKind::from_suffix(Some("S")), PasswordKind::Special);
        assert_eq!(PasswordKind::from_suffix(Some("s")), PasswordKind::Special);
        assert_eq!(PasswordKind::from_suffix(Some("A")), PasswordKind::Alphanumeric);
        assert_eq!(PasswordKind::from_suffix(Some("x")), PasswordKind::Alphanumeric);
        assert_eq!(PasswordKind::from_suffix(None), PasswordKind::Alphanumeric);
    }

    #[test]
    fn test_random_generators() {
        let digits = random_digits(20);
        assert_eq!(digits.len(), 20);
        assert!(digits.chars().all(|c| c.is_ascii_digit()));

        let letters = random_lowercase(20);
        assert_eq!(letters.len(), 20);
        assert!(letters.chars().all(|c| c.is_ascii_lowercase()));
    }
}
