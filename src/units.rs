//
// Human readable sizes, like "10GB", "512m" or "1.5GiB".
// Units are powers of 1024.
//
use std::fmt;

use regex::Regex;

lazy_static! {
    static ref SIZE_RE: Regex = Regex::new(r"(?i)^(\d+(?:\.\d+)?) ?(?:([kmgtp])i?)?b?$").unwrap();
}

#[derive(Debug, PartialEq)]
pub struct SizeError(String);

impl fmt::Display for SizeError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "invalid size: {}", self.0)
    }
}

impl std::error::Error for SizeError {}

/// Parse a size into bytes.
pub fn parse_size(s: &str) -> Result<u64, SizeError> {
    let caps = match SIZE_RE.captures(s.trim()) {
        Some(caps) => caps,
        None => return Err(SizeError(s.to_string())),
    };
    let number = &caps[1];
    let shift = match caps.get(2).map(|m| m.as_str().to_ascii_lowercase()) {
        None => 0,
        Some(ref u) if u == "k" => 10,
        Some(ref u) if u == "m" => 20,
        Some(ref u) if u == "g" => 30,
        Some(ref u) if u == "t" => 40,
        _ => 50,
    };

    // whole numbers stay exact, fractions go through f64.
    if let Ok(n) = number.parse::<u64>() {
        return n.checked_mul(1u64 << shift).ok_or_else(|| SizeError(s.to_string()));
    }
    let n = number.parse::<f64>().map_err(|_| SizeError(s.to_string()))?;
    let bytes = n * (1u64 << shift) as f64;
    if bytes >= u64::MAX as f64 {
        return Err(SizeError(s.to_string()));
    }
    Ok(bytes as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sizes() {
        assert_eq!(parse_size("0"), Ok(0));
        assert_eq!(parse_size("512"), Ok(512));
        assert_eq!(parse_size("512b"), Ok(512));
        assert_eq!(parse_size("10k"), Ok(10 * 1024));
        assert_eq!(parse_size("10GB"), Ok(10737418240));
        assert_eq!(parse_size("10 GiB"), Ok(10737418240));
        assert_eq!(parse_size("1.5m"), Ok(1572864));
        assert_eq!(parse_size("2T"), Ok(2 << 40));
        assert_eq!(parse_size("1p"), Ok(1 << 50));
    }

    #[test]
    fn bad_sizes() {
        assert!(parse_size("").is_err());
        assert!(parse_size("ten").is_err());
        assert!(parse_size("-1G").is_err());
        assert!(parse_size("10X").is_err());
        assert!(parse_size("100000000p").is_err());
    }
}
