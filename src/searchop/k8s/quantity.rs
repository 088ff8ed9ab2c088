/*
 * Copyright (C) 2024 The Nanocloud Authors
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 * http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

//! Kubernetes resource quantities (`500m`, `2Gi`, `1.5`, `1e3`).
//!
//! Quantities are normalised to nano-units so that equivalent spellings such
//! as `1Gi` and `1024Mi` compare equal. Fractions below a nano-unit round up.

use std::collections::BTreeMap;
use std::error::Error;
use std::fmt;
use std::str::FromStr;

const NANO_EXPONENT: i32 = 9;
const MAX_MANTISSA_DIGITS: usize = 30;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Quantity {
    nanos: i128,
}

impl Quantity {
    pub fn as_nanos(&self) -> i128 {
        self.nanos
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuantityError {
    pub input: String,
    pub reason: &'static str,
}

impl QuantityError {
    fn new(input: &str, reason: &'static str) -> Self {
        Self {
            input: input.to_string(),
            reason,
        }
    }
}

impl fmt::Display for QuantityError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid quantity '{}': {}", self.input, self.reason)
    }
}

impl Error for QuantityError {}

impl FromStr for Quantity {
    type Err = QuantityError;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let trimmed = input.trim();
        if trimmed.is_empty() {
            return Err(QuantityError::new(input, "empty quantity"));
        }

        let (negative, unsigned) = match trimmed.as_bytes()[0] {
            b'-' => (true, &trimmed[1..]),
            b'+' => (false, &trimmed[1..]),
            _ => (false, trimmed),
        };
        let number_end = unsigned
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .unwrap_or(unsigned.len());
        let (number, suffix) = unsigned.split_at(number_end);

        let (whole, fraction) = number.split_once('.').unwrap_or((number, ""));
        if fraction.contains('.') {
            return Err(QuantityError::new(input, "multiple decimal points"));
        }
        let digits = format!("{whole}{fraction}");
        if digits.is_empty() {
            return Err(QuantityError::new(input, "missing numeric value"));
        }
        if digits.len() > MAX_MANTISSA_DIGITS {
            return Err(QuantityError::new(input, "too many digits"));
        }
        let mantissa: i128 = digits
            .parse()
            .map_err(|_| QuantityError::new(input, "missing numeric value"))?;

        let (exponent, binary_power) =
            parse_suffix(suffix).ok_or_else(|| QuantityError::new(input, "unknown suffix"))?;
        let scale = i32::try_from(fraction.len())
            .map_err(|_| QuantityError::new(input, "too many digits"))?;

        let out_of_range = || QuantityError::new(input, "value out of range");
        let binary_factor = 1024i128.checked_pow(binary_power).ok_or_else(out_of_range)?;
        let mut nanos = mantissa
            .checked_mul(binary_factor)
            .ok_or_else(out_of_range)?;

        let shift = NANO_EXPONENT - scale + exponent;
        if shift >= 0 {
            let factor = pow10(shift).ok_or_else(out_of_range)?;
            nanos = nanos.checked_mul(factor).ok_or_else(out_of_range)?;
        } else {
            let divisor = pow10(-shift).ok_or_else(out_of_range)?;
            let rounded_up = nanos % divisor != 0;
            nanos /= divisor;
            if rounded_up {
                nanos += 1;
            }
        }

        Ok(Quantity {
            nanos: if negative { -nanos } else { nanos },
        })
    }
}

fn pow10(exponent: i32) -> Option<i128> {
    u32::try_from(exponent)
        .ok()
        .and_then(|exp| 10i128.checked_pow(exp))
}

/// Returns the decimal exponent and the power of 1024 a suffix stands for.
fn parse_suffix(suffix: &str) -> Option<(i32, u32)> {
    let parsed = match suffix {
        "" => (0, 0),
        "n" => (-9, 0),
        "u" => (-6, 0),
        "m" => (-3, 0),
        "k" => (3, 0),
        "M" => (6, 0),
        "G" => (9, 0),
        "T" => (12, 0),
        "P" => (15, 0),
        "E" => (18, 0),
        "Ki" => (0, 1),
        "Mi" => (0, 2),
        "Gi" => (0, 3),
        "Ti" => (0, 4),
        "Pi" => (0, 5),
        "Ei" => (0, 6),
        _ => {
            let exponent = suffix
                .strip_prefix('e')
                .or_else(|| suffix.strip_prefix('E'))?;
            (exponent.parse::<i32>().ok()?, 0)
        }
    };
    Some(parsed)
}

pub fn parse_quantity(input: &str) -> Result<Quantity, QuantityError> {
    input.parse()
}

/// Compares two request or limit maps by quantity value rather than spelling.
///
/// Malformed `desired` values are errors. A malformed `live` value never
/// equals anything, so a broken live object reads as drift and gets
/// overwritten.
pub fn resource_lists_equivalent(
    desired: &BTreeMap<String, String>,
    live: &BTreeMap<String, String>,
) -> Result<bool, QuantityError> {
    let mut parsed_desired = BTreeMap::new();
    for (name, value) in desired {
        parsed_desired.insert(name.as_str(), parse_quantity(value)?);
    }
    let mut parsed_live = BTreeMap::new();
    for (name, value) in live {
        match parse_quantity(value) {
            Ok(quantity) => {
                parsed_live.insert(name.as_str(), quantity);
            }
            Err(_) => return Ok(false),
        }
    }
    Ok(parsed_desired == parsed_live)
}
