use crate::error::ValidationError;
use std::ops::RangeInclusive;

/// Every TCP port.
pub const FULL_RANGE: RangeInclusive<u16> = 1..=65535;

/// Parse a port range specification into an inclusive range of TCP ports (1..=65535).
///
/// Supported formats:
/// - single port number: `80`
/// - inclusive range: `8000-8010`
/// - surrounding whitespace is ignored
/// - empty input means the full range
pub fn parse_port_range(s: &str) -> Result<RangeInclusive<u16>, ValidationError> {
    let spec = s.trim();
    if spec.is_empty() {
        return Ok(FULL_RANGE);
    }

    if let Some((a, b)) = spec.split_once('-') {
        let start = parse_port_str(a.trim())?;
        let end = parse_port_str(b.trim())?;
        if start > end {
            return Err(ValidationError::InvertedRange { start, end });
        }
        return Ok(start..=end);
    }

    let p = parse_port_str(spec)?;
    Ok(p..=p)
}

fn parse_port_str(s: &str) -> Result<u16, ValidationError> {
    let val: u32 = s.parse::<u32>().map_err(|_| ValidationError::InvalidPort {
        value: s.to_string(),
    })?;
    if val == 0 || val > 65535 {
        return Err(ValidationError::PortOutOfRange { port: val });
    }
    Ok(val as u16)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_single_port() {
        assert_eq!(parse_port_range(" 443 ").unwrap(), 443..=443);
    }

    #[test]
    fn parse_inclusive_range() {
        assert_eq!(parse_port_range("7000-7003").unwrap(), 7000..=7003);
        assert_eq!(parse_port_range("7000 - 7003").unwrap(), 7000..=7003);
    }

    #[test]
    fn empty_means_everything() {
        assert_eq!(parse_port_range("").unwrap(), 1..=65535);
    }

    #[test]
    fn invalid_values_error() {
        assert_eq!(
            parse_port_range("70000"),
            Err(ValidationError::PortOutOfRange { port: 70000 })
        );
        assert_eq!(
            parse_port_range("0-10"),
            Err(ValidationError::PortOutOfRange { port: 0 })
        );
        assert!(matches!(
            parse_port_range("http"),
            Err(ValidationError::InvalidPort { .. })
        ));
        assert!(matches!(
            parse_port_range("1-2-3"),
            Err(ValidationError::InvalidPort { .. })
        ));
    }

    #[test]
    fn inverted_range_rejected() {
        assert_eq!(
            parse_port_range("90-80"),
            Err(ValidationError::InvertedRange { start: 90, end: 80 })
        );
    }
}
