use std::fmt;

/// Decimal rendered as `integer.fraction` with the fraction left-padded to a
/// fixed width. Integer arithmetic only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FixedPoint {
    pub integer: u64,
    pub fraction: u64,
    pub width: usize,
}

impl FixedPoint {
    pub fn new(integer: u64, fraction: u64, width: usize) -> Self {
        Self {
            integer,
            fraction,
            width,
        }
    }

    /// Splits a milli-unit accumulator into whole units and a 3-digit fraction.
    pub fn milli(value: u64) -> Self {
        Self::new(value / 1000, value % 1000, 3)
    }
}

impl fmt::Display for FixedPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}.{:0width$}",
            self.integer,
            self.fraction,
            width = self.width
        )
    }
}

/// `key=value` pairs joined with `&`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueryBody {
    fields: Vec<(String, String)>,
    terminated: bool,
}

impl QueryBody {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn field(mut self, key: &str, value: impl fmt::Display) -> Self {
        self.fields.push((key.to_string(), value.to_string()));
        self
    }

    /// Emit a trailing `&` after the last field.
    pub fn terminated(mut self) -> Self {
        self.terminated = true;
        self
    }
}

impl fmt::Display for QueryBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (index, (key, value)) in self.fields.iter().enumerate() {
            if index > 0 {
                f.write_str("&")?;
            }
            write!(f, "{key}={value}")?;
        }
        if self.terminated && !self.fields.is_empty() {
            f.write_str("&")?;
        }
        Ok(())
    }
}

/// Parses a query body into pairs. Missing `=` yields an empty value.
pub fn parse_query(body: &str) -> Vec<(&str, &str)> {
    body.split('&')
        .filter(|pair| !pair.is_empty())
        .map(|pair| pair.split_once('=').unwrap_or((pair, "")))
        .collect()
}

/// `&` is the field separator, so it is percent-escaped inside an SSID.
pub fn escape_ssid(ssid: &str) -> String {
    ssid.replace('&', "%26")
}

pub fn format_bssid(bssid: &[u8; 6]) -> String {
    bssid
        .iter()
        .map(|octet| format!("{octet:02x}"))
        .collect::<Vec<_>>()
        .join(":")
}

/// Leading optional sign and digits; anything else stops the parse. Returns 0
/// when no digits are present.
pub fn parse_leading_int(text: &str) -> i64 {
    let trimmed = text.trim_start();
    let (negative, digits) = match trimmed.as_bytes().first() {
        Some(b'-') => (true, &trimmed[1..]),
        Some(b'+') => (false, &trimmed[1..]),
        _ => (false, trimmed),
    };

    let mut value: i64 = 0;
    for byte in digits.bytes().take_while(u8::is_ascii_digit) {
        value = value
            .saturating_mul(10)
            .saturating_add(i64::from(byte - b'0'));
    }

    if negative {
        -value
    } else {
        value
    }
}

/// Command bodies may carry a C-style terminator; strip it before use.
pub fn body_text(cleartext: &[u8]) -> String {
    let end = cleartext
        .iter()
        .position(|byte| *byte == 0)
        .unwrap_or(cleartext.len());
    String::from_utf8_lossy(&cleartext[..end]).into_owned()
}
