//! Phone numbers in E.164 form

use std::fmt;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{ExcommsError, Result};

// Country code may not start with 0; 8 to 15 digits overall.
static E164_REGEX: Lazy<Regex> = Lazy::new(|| Regex::new(r"^\+[1-9]\d{7,14}$").unwrap());
static DIALABLE_REGEX: Lazy<Regex> = Lazy::new(|| Regex::new(r"^\+?[\d\s().-]+$").unwrap());

/// A validated E.164 phone number such as `+14155550100`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, sqlx::Type)]
#[serde(try_from = "String", into = "String")]
#[sqlx(transparent)]
pub struct PhoneNumber(String);

impl PhoneNumber {
    /// Parse a number, accepting common punctuation and bare 10-digit
    /// North American numbers.
    pub fn parse(raw: &str) -> Result<Self> {
        let trimmed = raw.trim();
        let plus = trimmed.starts_with('+');
        let digits: String = trimmed.chars().filter(|c| c.is_ascii_digit()).collect();

        if !DIALABLE_REGEX.is_match(trimmed) {
            return Err(ExcommsError::invalid_argument(format!("invalid phone number '{}'", raw)));
        }

        let candidate = if plus {
            format!("+{}", digits)
        } else if digits.len() == 10 {
            format!("+1{}", digits)
        } else if digits.len() == 11 && digits.starts_with('1') {
            format!("+{}", digits)
        } else {
            return Err(ExcommsError::invalid_argument(format!("invalid phone number '{}'", raw)));
        };

        if !E164_REGEX.is_match(&candidate) {
            return Err(ExcommsError::invalid_argument(format!("invalid phone number '{}'", raw)));
        }
        Ok(Self(candidate))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Spoken-friendly national form: `+12061111111` becomes `206 111 1111`.
    /// Numbers outside the North American plan are returned without the `+`.
    pub fn national(&self) -> String {
        let digits = &self.0[1..];
        match digits.strip_prefix('1') {
            Some(rest) if rest.len() == 10 => {
                format!("{} {} {}", &rest[0..3], &rest[3..6], &rest[6..])
            }
            _ => digits.to_string(),
        }
    }
}

impl fmt::Display for PhoneNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for PhoneNumber {
    type Error = ExcommsError;

    fn try_from(value: String) -> Result<Self> {
        Self::parse(&value)
    }
}

impl From<PhoneNumber> for String {
    fn from(value: PhoneNumber) -> Self {
        value.0
    }
}

impl AsRef<str> for PhoneNumber {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Caller ids the network substitutes when the caller withholds theirs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallerIdSentinel {
    Restricted,
    Blocked,
    Unknown,
    Anonymous,
}

impl CallerIdSentinel {
    pub fn detect(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "+7378742833" | "restricted" => Some(Self::Restricted),
            "+2562533" | "blocked" => Some(Self::Blocked),
            "+8656696" | "unknown" => Some(Self::Unknown),
            "anonymous" => Some(Self::Anonymous),
            _ => None,
        }
    }

    pub fn describe(&self) -> &'static str {
        match self {
            Self::Restricted => "restricted",
            Self::Blocked => "blocked",
            Self::Unknown => "unknown",
            Self::Anonymous => "anonymous",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_common_forms() {
        assert_eq!(PhoneNumber::parse("+12065551234").unwrap().as_str(), "+12065551234");
        assert_eq!(PhoneNumber::parse("(206) 555-1234").unwrap().as_str(), "+12065551234");
        assert_eq!(PhoneNumber::parse("1 206 555 1234").unwrap().as_str(), "+12065551234");
        assert_eq!(PhoneNumber::parse("+442071838750").unwrap().as_str(), "+442071838750");
    }

    #[test]
    fn rejects_garbage() {
        assert!(PhoneNumber::parse("").is_err());
        assert!(PhoneNumber::parse("12345").is_err());
        assert!(PhoneNumber::parse("+0123456789").is_err());
        assert!(PhoneNumber::parse("206-555-CALL").is_err());
    }

    #[test]
    fn national_format_groups_nanp_digits() {
        let n = PhoneNumber::parse("+11234567890").unwrap();
        assert_eq!(n.national(), "123 456 7890");
        let uk = PhoneNumber::parse("+442071838750").unwrap();
        assert_eq!(uk.national(), "442071838750");
    }

    #[test]
    fn sentinel_detection() {
        assert_eq!(CallerIdSentinel::detect("+2562533"), Some(CallerIdSentinel::Blocked));
        assert_eq!(CallerIdSentinel::detect("Anonymous"), Some(CallerIdSentinel::Anonymous));
        assert_eq!(CallerIdSentinel::detect("+7378742833"), Some(CallerIdSentinel::Restricted));
        assert_eq!(CallerIdSentinel::detect("+14155550100"), None);
    }
}
