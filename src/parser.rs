/// Throughput extraction from measurement stdout lines.
///
/// iperf prints one line per reporting interval, e.g.:
/// - `[  5]   0.00-1.00   sec  1.10 MBytes  9.23 Mbits/sec`
/// - `[  5]   0.00-10.00  sec  11.0 MBytes  9.22 Mbits/sec  0  sender`
///
/// The bitrate column is converted to whole bits per second.
use regex::Regex;
use std::sync::LazyLock;

static BITRATE_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?P<value>\d+(?:\.\d+)?)\s*(?P<unit>[KMGT]?)bits/sec").unwrap()
});

/// Errors produced when a line carries no usable throughput value.
#[derive(Debug, Clone, PartialEq)]
pub enum ParseError {
    /// The line does not contain a bitrate column.
    NoMatch,
    /// The bitrate column is present but not a finite, non-negative number.
    InvalidNumber(String),
    /// The unit prefix is not one of K, M, G, T.
    UnknownUnit(String),
}

impl std::fmt::Display for ParseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ParseError::NoMatch => write!(f, "line has no bitrate"),
            ParseError::InvalidNumber(raw) => write!(f, "invalid bitrate value: {raw}"),
            ParseError::UnknownUnit(unit) => write!(f, "unknown bitrate unit: {unit}"),
        }
    }
}

impl std::error::Error for ParseError {}

/// Extracts one bits-per-second sample from one stdout line.
pub trait SpeedParser: Send + Sync {
    fn parse_speed(&self, line: &str) -> Result<u64, ParseError>;
}

impl<F> SpeedParser for F
where
    F: Fn(&str) -> Result<u64, ParseError> + Send + Sync,
{
    fn parse_speed(&self, line: &str) -> Result<u64, ParseError> {
        self(line)
    }
}

/// Parser for iperf's human-readable interval report.
#[derive(Debug, Default, Clone, Copy)]
pub struct IperfOutputParser;

impl IperfOutputParser {
    pub fn new() -> Self {
        IperfOutputParser
    }
}

impl SpeedParser for IperfOutputParser {
    fn parse_speed(&self, line: &str) -> Result<u64, ParseError> {
        let caps = BITRATE_PATTERN
            .captures(line)
            .ok_or(ParseError::NoMatch)?;
        let raw = &caps["value"];
        let value: f64 = raw
            .parse()
            .map_err(|_| ParseError::InvalidNumber(raw.to_string()))?;
        let multiplier = unit_multiplier(&caps["unit"])?;

        let bits = value * multiplier;
        if !bits.is_finite() || bits < 0.0 || bits > u64::MAX as f64 {
            return Err(ParseError::InvalidNumber(raw.to_string()));
        }
        Ok(bits.round() as u64)
    }
}

/// Decimal multiplier for an iperf rate prefix.
fn unit_multiplier(unit: &str) -> Result<f64, ParseError> {
    match unit {
        "" => Ok(1.0),
        "K" => Ok(1e3),
        "M" => Ok(1e6),
        "G" => Ok(1e9),
        "T" => Ok(1e12),
        other => Err(ParseError::UnknownUnit(other.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(line: &str) -> Result<u64, ParseError> {
        IperfOutputParser::new().parse_speed(line)
    }

    #[test]
    fn test_parse_mbits_interval_line() {
        assert_eq!(
            parse("[  5]   0.00-1.00   sec  1.10 MBytes  9.23 Mbits/sec"),
            Ok(9_230_000)
        );
    }

    #[test]
    fn test_parse_summary_line_with_retransmits() {
        assert_eq!(
            parse("[  5]   0.00-10.00  sec  11.0 MBytes  9.22 Mbits/sec    0             sender"),
            Ok(9_220_000)
        );
    }

    #[test]
    fn test_parse_each_unit() {
        assert_eq!(parse("[  5] 0.00-1.00 sec 0 Bytes 512 bits/sec"), Ok(512));
        assert_eq!(parse("[  5] 0.00-1.00 sec 1 KBytes 8.5 Kbits/sec"), Ok(8_500));
        assert_eq!(parse("[  5] 0.00-1.00 sec 1 GBytes 1.5 Gbits/sec"), Ok(1_500_000_000));
        assert_eq!(parse("[  5] 0.00-1.00 sec 1 TBytes 2 Tbits/sec"), Ok(2_000_000_000_000));
    }

    #[test]
    fn test_parse_udp_line_with_jitter_and_loss() {
        assert_eq!(
            parse("[  5]   0.00-1.00   sec   129 KBytes  1.05 Mbits/sec  0.016 ms  0/91 (0%)"),
            Ok(1_050_000)
        );
    }

    #[test]
    fn test_header_and_banner_lines_do_not_match() {
        assert_eq!(parse("Connecting to host 10.0.0.2, port 5201"), Err(ParseError::NoMatch));
        assert_eq!(
            parse("[ ID] Interval           Transfer     Bitrate"),
            Err(ParseError::NoMatch)
        );
        assert_eq!(parse(""), Err(ParseError::NoMatch));
    }

    #[test]
    fn test_closure_is_a_parser() {
        let parser = |line: &str| -> Result<u64, ParseError> {
            line.strip_prefix("rate=")
                .and_then(|rest| rest.strip_suffix("bps"))
                .ok_or(ParseError::NoMatch)?
                .parse()
                .map_err(|_| ParseError::InvalidNumber(line.to_string()))
        };
        assert_eq!(parser.parse_speed("rate=1000bps"), Ok(1000));
        assert_eq!(parser.parse_speed("garbage"), Err(ParseError::NoMatch));
    }

    #[test]
    fn test_error_display() {
        assert_eq!(ParseError::NoMatch.to_string(), "line has no bitrate");
        assert!(ParseError::InvalidNumber("x".into()).to_string().contains("x"));
    }
}
