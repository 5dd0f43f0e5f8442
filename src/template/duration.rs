use std::time::Duration;

const UNITS: &[(&str, u128)] = &[
    ("ns", 1),
    ("us", 1_000),
    ("µs", 1_000),
    ("μs", 1_000),
    ("ms", 1_000_000),
    ("s", 1_000_000_000),
    ("m", 60 * 1_000_000_000),
    ("h", 60 * 60 * 1_000_000_000),
];

/// Parses durations such as `300ms`, `1.5s` or `1h30m`: a sequence of
/// decimal numbers, each with a unit. A bare `0` is accepted.
pub fn parse_duration(s: &str) -> Result<Duration, String> {
    let input = s.trim();
    let rest = input.strip_prefix('+').unwrap_or(input);
    if rest.starts_with('-') {
        return Err(format!("negative duration {:?}", s));
    }
    if rest == "0" {
        return Ok(Duration::ZERO);
    }
    if rest.is_empty() {
        return Err(format!("invalid duration {:?}", s));
    }

    let mut total: u128 = 0;
    let mut rest = rest;
    while !rest.is_empty() {
        let int_len = rest.bytes().take_while(u8::is_ascii_digit).count();
        let int_part = &rest[..int_len];
        rest = &rest[int_len..];

        let mut frac_part = "";
        if let Some(after_dot) = rest.strip_prefix('.') {
            let frac_len = after_dot.bytes().take_while(u8::is_ascii_digit).count();
            frac_part = &after_dot[..frac_len];
            rest = &after_dot[frac_len..];
        }
        if int_part.is_empty() && frac_part.is_empty() {
            return Err(format!("invalid duration {:?}", s));
        }

        let unit_len = rest
            .char_indices()
            .find(|(_, c)| c.is_ascii_digit() || *c == '.')
            .map(|(i, _)| i)
            .unwrap_or(rest.len());
        let unit = &rest[..unit_len];
        rest = &rest[unit_len..];

        let scale = UNITS
            .iter()
            .find(|(name, _)| *name == unit)
            .map(|(_, scale)| *scale)
            .ok_or_else(|| {
                if unit.is_empty() {
                    format!("missing unit in duration {:?}", s)
                } else {
                    format!("unknown unit {:?} in duration {:?}", unit, s)
                }
            })?;

        let whole: u128 = if int_part.is_empty() {
            0
        } else {
            int_part
                .parse()
                .map_err(|_| format!("invalid duration {:?}", s))?
        };
        let mut nanos = whole
            .checked_mul(scale)
            .ok_or_else(|| format!("duration {:?} overflows", s))?;

        if !frac_part.is_empty() {
            // Digits beyond nanosecond precision do not change the result.
            let digits = &frac_part[..frac_part.len().min(18)];
            let frac: u128 = digits
                .parse()
                .map_err(|_| format!("invalid duration {:?}", s))?;
            nanos += frac * scale / 10u128.pow(digits.len() as u32);
        }

        total = total
            .checked_add(nanos)
            .ok_or_else(|| format!("duration {:?} overflows", s))?;
    }

    let total = u64::try_from(total).map_err(|_| format!("duration {:?} overflows", s))?;
    Ok(Duration::from_nanos(total))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_simple_units() {
        assert_eq!(parse_duration("5s"), Ok(Duration::from_secs(5)));
        assert_eq!(parse_duration("250ms"), Ok(Duration::from_millis(250)));
        assert_eq!(parse_duration("10us"), Ok(Duration::from_micros(10)));
        assert_eq!(parse_duration("7ns"), Ok(Duration::from_nanos(7)));
        assert_eq!(parse_duration("2m"), Ok(Duration::from_secs(120)));
        assert_eq!(parse_duration("1h"), Ok(Duration::from_secs(3600)));
    }

    #[test]
    fn test_compound() {
        assert_eq!(parse_duration("1h30m"), Ok(Duration::from_secs(5400)));
        assert_eq!(parse_duration("1m0.5s"), Ok(Duration::from_millis(60_500)));
    }

    #[test]
    fn test_fractional() {
        assert_eq!(parse_duration("1.5s"), Ok(Duration::from_millis(1500)));
        assert_eq!(parse_duration(".5s"), Ok(Duration::from_millis(500)));
        assert_eq!(parse_duration("2.s"), Ok(Duration::from_secs(2)));
    }

    #[test]
    fn test_zero() {
        assert_eq!(parse_duration("0"), Ok(Duration::ZERO));
        assert_eq!(parse_duration("0s"), Ok(Duration::ZERO));
    }

    #[test]
    fn test_surrounding_whitespace() {
        assert_eq!(parse_duration("  3s \n"), Ok(Duration::from_secs(3)));
    }

    #[test]
    fn test_invalid() {
        assert!(parse_duration("").is_err());
        assert!(parse_duration("notaduration").is_err());
        assert!(parse_duration("10").is_err());
        assert!(parse_duration("5 s").is_err());
        assert!(parse_duration("3d").is_err());
        assert!(parse_duration(".s").is_err());
    }

    #[test]
    fn test_negative_rejected() {
        assert!(parse_duration("-1s").is_err());
    }
}
