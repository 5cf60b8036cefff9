//! Lenient number parsing and fixed-precision formatting shared by the
//! telemetry normalizer and the nutrient aggregator.
//!
//! Values arrive as free-form strings typed by operators ("15", "5.2 kW",
//! " 7.25") or pushed by the telemetry API, so parsing accepts the longest
//! leading numeric prefix and ignores whatever follows.

/// Parse the leading decimal number of `s`, skipping leading whitespace.
///
/// Returns `None` when no digits are found or the result is not finite.
/// `"45 L/min"` parses as `45.0`, `"abc"` and `""` do not parse.
pub fn parse_lenient(s: &str) -> Option<f64> {
    let s = s.trim_start();
    let bytes = s.as_bytes();
    let mut pos = 0;

    let negative = match bytes.first() {
        Some(b'-') => {
            pos += 1;
            true
        }
        Some(b'+') => {
            pos += 1;
            false
        }
        _ => false,
    };

    let int_start = pos;
    while pos < bytes.len() && bytes[pos].is_ascii_digit() {
        pos += 1;
    }
    let int_digits = &s[int_start..pos];

    let mut frac_digits = "";
    if pos < bytes.len() && bytes[pos] == b'.' {
        let frac_start = pos + 1;
        let mut end = frac_start;
        while end < bytes.len() && bytes[end].is_ascii_digit() {
            end += 1;
        }
        frac_digits = &s[frac_start..end];
        pos = end;
    }

    if int_digits.is_empty() && frac_digits.is_empty() {
        return None;
    }

    // Exponent only counts when at least one digit follows the marker.
    let mut exponent = "";
    if pos < bytes.len() && (bytes[pos] == b'e' || bytes[pos] == b'E') {
        let mut end = pos + 1;
        if end < bytes.len() && (bytes[end] == b'+' || bytes[end] == b'-') {
            end += 1;
        }
        let digits_start = end;
        while end < bytes.len() && bytes[end].is_ascii_digit() {
            end += 1;
        }
        if end > digits_start {
            exponent = &s[pos..end];
        }
    }

    let mut normalized = String::with_capacity(pos + 2);
    if negative {
        normalized.push('-');
    }
    normalized.push_str(if int_digits.is_empty() { "0" } else { int_digits });
    if !frac_digits.is_empty() {
        normalized.push('.');
        normalized.push_str(frac_digits);
    }
    normalized.push_str(exponent);

    normalized.parse::<f64>().ok().filter(|v| v.is_finite())
}

/// Lenient parse that treats anything unparsable as zero.
pub fn parse_or_zero(s: &str) -> f64 {
    parse_lenient(s).unwrap_or(0.0)
}

/// Format `value` with exactly `decimals` fractional digits, rounding ties
/// away from zero (`7.25` → `"7.3"`, `229.5` → `"230"`).
pub fn to_fixed(value: f64, decimals: usize) -> String {
    let factor = 10f64.powi(decimals as i32);
    let scaled = value * factor;
    if !scaled.is_finite() {
        // Too large to scale; no fractional digits left to round anyway.
        return format!("{:.*}", decimals, value);
    }
    format!("{:.*}", decimals, scaled.round() / factor)
}

// ===========================================================================
// Tests
// ===========================================================================
