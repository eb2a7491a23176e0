//! Access events and their canonical line encoding
//!
//! An `AccessEvent` records one debit against a user's entitlement. The
//! overflow log stores events one per line in a semicolon-separated form:
//!
//! ```text
//! entitlementID;productID;userID;occurredAtMillis;sourceAddress;k1=v1&k2=v2
//! ```

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use thiserror::Error;

/// Number of `;`-separated fields in a canonical event line
pub const FIELD_COUNT: usize = 6;

/// Errors produced while decoding a canonical event line
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EventCodecError {
    #[error("expected 6 ';'-separated fields, found {found}")]
    FieldCount { found: usize },

    #[error("invalid number for {field}: {value:?}")]
    InvalidNumber { field: &'static str, value: String },
}

/// Result type for event decoding
pub type EventCodecResult<T> = Result<T, EventCodecError>;

/// One access/debit occurrence against an entitlement
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct AccessEvent {
    pub entitlement_id: i64,
    pub product_id: i32,
    pub user_id: i32,
    /// Epoch milliseconds when the access happened
    pub occurred_at_millis: i64,
    pub source_address: String,
    /// Free-form attributes. A `BTreeMap` keeps keys sorted, which is what
    /// makes the encoding deterministic.
    pub attributes: BTreeMap<String, String>,
}

impl AccessEvent {
    /// Create an event stamped with the current time and no attributes
    pub fn new(entitlement_id: i64, product_id: i32, user_id: i32, source_address: &str) -> Self {
        Self {
            entitlement_id,
            product_id,
            user_id,
            occurred_at_millis: crate::utils::now_millis(),
            source_address: source_address.to_string(),
            attributes: BTreeMap::new(),
        }
    }

    /// Set the occurrence time
    pub fn at(mut self, occurred_at_millis: i64) -> Self {
        self.occurred_at_millis = occurred_at_millis;
        self
    }

    /// Add an attribute
    pub fn with_attribute(mut self, key: &str, value: &str) -> Self {
        self.attributes.insert(key.to_string(), value.to_string());
        self
    }

    /// Attributes rendered as `k1=v1&k2=v2`, keys ascending
    pub fn attributes_csv(&self) -> String {
        let mut out = String::new();
        for (i, (key, value)) in self.attributes.iter().enumerate() {
            if i > 0 {
                out.push('&');
            }
            out.push_str(key);
            out.push('=');
            out.push_str(value);
        }
        out
    }

    /// Encode as a canonical line, without the trailing newline
    pub fn to_line(&self) -> String {
        format!(
            "{};{};{};{};{};{}",
            self.entitlement_id,
            self.product_id,
            self.user_id,
            self.occurred_at_millis,
            self.source_address,
            self.attributes_csv()
        )
    }

    /// Decode a canonical line.
    ///
    /// Leading whitespace and the line terminator are ignored; trailing
    /// spaces belong to the last attribute value. Any of the four numeric
    /// fields failing to parse fails the whole line. Attribute pairs that do
    /// not contain exactly one `=` are dropped.
    pub fn from_line(line: &str) -> EventCodecResult<Self> {
        let line = line.trim_start().trim_end_matches(['\r', '\n']);
        let fields: Vec<&str> = line.split(';').collect();
        if fields.len() != FIELD_COUNT {
            return Err(EventCodecError::FieldCount {
                found: fields.len(),
            });
        }

        Ok(Self {
            entitlement_id: parse_number("entitlementID", fields[0])?,
            product_id: parse_number("productID", fields[1])?,
            user_id: parse_number("userID", fields[2])?,
            occurred_at_millis: parse_number("occurredAtMillis", fields[3])?,
            source_address: fields[4].to_string(),
            attributes: parse_attributes(fields[5]),
        })
    }

    /// Check that the text fields survive a trip through the line format.
    ///
    /// Returns a description of the first offending field.
    pub fn check_encodable(&self) -> Result<(), String> {
        if self.source_address.contains([';', '\n', '\r']) {
            return Err(format!(
                "sourceAddress {:?} contains a reserved character",
                self.source_address
            ));
        }
        for (key, value) in &self.attributes {
            if key.contains(RESERVED_IN_ATTRIBUTES) || value.contains(RESERVED_IN_ATTRIBUTES) {
                return Err(format!(
                    "attribute {:?}={:?} contains a reserved character",
                    key, value
                ));
            }
        }
        Ok(())
    }
}

const RESERVED_IN_ATTRIBUTES: [char; 5] = [';', '&', '=', '\n', '\r'];

impl fmt::Display for AccessEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_line())
    }
}

impl FromStr for AccessEvent {
    type Err = EventCodecError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_line(s)
    }
}

fn parse_number<T: FromStr>(field: &'static str, value: &str) -> EventCodecResult<T> {
    value.parse().map_err(|_| EventCodecError::InvalidNumber {
        field,
        value: value.to_string(),
    })
}

fn parse_attributes(csv: &str) -> BTreeMap<String, String> {
    csv.split('&')
        .filter_map(|pair| {
            let mut parts = pair.split('=');
            match (parts.next(), parts.next(), parts.next()) {
                (Some(key), Some(value), None) => Some((key.to_string(), value.to_string())),
                _ => None,
            }
        })
        .collect()
}
