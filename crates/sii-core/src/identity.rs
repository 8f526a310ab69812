//! # Taxpayer Identity
//!
//! [`Rut`] is the Chilean taxpayer identifier: a body number plus a
//! modulo-11 check digit (`0-9` or `K`). Construction validates the check
//! digit so a `Rut` in hand is always well formed.

use serde::{Deserialize, Serialize};

use crate::error::{ErrorKind, SiiError};

/// Validated taxpayer identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Rut {
    body: u32,
    dv: char,
}

impl Rut {
    /// Parse `12345678-5`, `12.345.678-5` or `123456785`.
    pub fn parse(input: &str) -> Result<Self, SiiError> {
        let cleaned: String = input
            .chars()
            .filter(|c| !matches!(c, '.' | ' '))
            .collect::<String>()
            .to_ascii_uppercase();

        let (body, dv) = match cleaned.split_once('-') {
            Some((body, dv)) => (body.to_string(), dv.to_string()),
            None if cleaned.len() >= 2 => {
                let (body, dv) = cleaned.split_at(cleaned.len() - 1);
                (body.to_string(), dv.to_string())
            }
            None => return Err(invalid(input, "too short")),
        };

        let mut dv_chars = dv.chars();
        let dv = match (dv_chars.next(), dv_chars.next()) {
            (Some(c), None) if c.is_ascii_digit() || c == 'K' => c,
            _ => return Err(invalid(input, "check digit must be 0-9 or K")),
        };

        if body.is_empty() || body.len() > 9 || !body.chars().all(|c| c.is_ascii_digit()) {
            return Err(invalid(input, "body must be 1-9 digits"));
        }
        let body: u32 = body
            .parse()
            .map_err(|_| invalid(input, "body out of range"))?;
        if body == 0 {
            return Err(invalid(input, "body must be positive"));
        }

        let expected = check_digit(body);
        if expected != dv {
            return Err(invalid(
                input,
                &format!("check digit mismatch: expected {expected}"),
            ));
        }
        Ok(Self { body, dv })
    }

    /// Build from a body number, computing the check digit.
    pub fn from_body(body: u32) -> Result<Self, SiiError> {
        if body == 0 {
            return Err(invalid("0", "body must be positive"));
        }
        Ok(Self {
            body,
            dv: check_digit(body),
        })
    }

    /// Numeric body without the check digit.
    pub fn body(&self) -> u32 {
        self.body
    }

    /// The check digit.
    pub fn dv(&self) -> char {
        self.dv
    }
}

/// Modulo-11 check digit for a RUT body.
pub fn check_digit(body: u32) -> char {
    let mut sum = 0u32;
    let mut factor = 2u32;
    let mut rest = body;
    while rest > 0 {
        sum += (rest % 10) * factor;
        rest /= 10;
        factor = if factor == 7 { 2 } else { factor + 1 };
    }
    match 11 - (sum % 11) {
        11 => '0',
        10 => 'K',
        d => char::from_digit(d, 10).unwrap_or('0'),
    }
}

fn invalid(input: &str, reason: &str) -> SiiError {
    SiiError::new(
        ErrorKind::DocumentoInvalido,
        format!("invalid RUT {input:?}: {reason}"),
    )
}

impl std::fmt::Display for Rut {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}-{}", self.body, self.dv)
    }
}

impl std::str::FromStr for Rut {
    type Err = SiiError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for Rut {
    type Error = SiiError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<Rut> for String {
    fn from(rut: Rut) -> Self {
        rut.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn parses_common_formats() {
        for input in ["76192083-9", "76.192.083-9", "761920839", " 76192083-9 "] {
            let rut = Rut::parse(input).unwrap();
            assert_eq!(rut.to_string(), "76192083-9");
        }
    }

    #[test]
    fn authority_rut_has_k_check_digit() {
        let rut = Rut::parse("60803000-k").unwrap();
        assert_eq!(rut.dv(), 'K');
        assert_eq!(rut.body(), 60_803_000);
    }

    #[test]
    fn rejects_wrong_check_digit() {
        let err = Rut::parse("76192083-1").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::DocumentoInvalido);
    }

    #[test]
    fn rejects_garbage() {
        assert!(Rut::parse("").is_err());
        assert!(Rut::parse("-").is_err());
        assert!(Rut::parse("abc-1").is_err());
        assert!(Rut::parse("0-0").is_err());
    }

    #[test]
    fn serde_uses_display_form() {
        let rut = Rut::parse("11111111-1").unwrap();
        let json = serde_json::to_string(&rut).unwrap();
        assert_eq!(json, "\"11111111-1\"");
        let back: Rut = serde_json::from_str(&json).unwrap();
        assert_eq!(back, rut);
    }

    proptest! {
        #[test]
        fn computed_check_digit_always_parses(body in 1u32..100_000_000) {
            let rut = Rut::from_body(body).unwrap();
            let reparsed = Rut::parse(&rut.to_string()).unwrap();
            prop_assert_eq!(reparsed, rut);
        }
    }
}
