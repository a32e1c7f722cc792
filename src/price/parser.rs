//! Convert a locale-variant price string into a decimal.
//!
//! Pure, total function: malformed input yields `None`, it never panics
//! or raises.

use rust_decimal::Decimal;
use std::str::FromStr;

const CURRENCY_GLYPHS: [char; 4] = ['$', '€', '£', '¥'];
const MIN_PRICE: &str = "1";
const MAX_PRICE: &str = "100000";

/// Whether a pure-digit run with no separators should be read as cents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ParseMode {
    /// Treat bare digit runs as whole units (the common case — prose,
    /// visible page text).
    #[default]
    Normal,
    /// Treat a pure-digit run of 5+ digits with no separators as cents
    /// (divide by 100). Used for `data-price`-style HTML attributes.
    DataAttribute,
}

/// Parse a price string in `ParseMode::Normal`.
pub fn parse(input: &str) -> Option<Decimal> {
    parse_with_mode(input, ParseMode::Normal)
}

/// Parse a price string, honoring the given interpretation mode for
/// unseparated digit runs.
pub fn parse_with_mode(input: &str, mode: ParseMode) -> Option<Decimal> {
    let cleaned: String = input
        .chars()
        .filter(|c| !CURRENCY_GLYPHS.contains(c))
        .collect();
    let cleaned = cleaned.trim();

    let run = first_numeric_run(cleaned)?;
    let normalized = disambiguate(&run)?;
    let mut value = Decimal::from_str(&normalized).ok()?;

    if mode == ParseMode::DataAttribute && is_pure_digit_run(&run) && run.len() >= 5 {
        value /= Decimal::from(100);
    }

    let min = Decimal::from_str(MIN_PRICE).unwrap();
    let max = Decimal::from_str(MAX_PRICE).unwrap();
    if value < min || value > max {
        return None;
    }

    Some(value)
}

/// First contiguous run of digits, commas, and dots in `s`.
fn first_numeric_run(s: &str) -> Option<String> {
    let chars: Vec<char> = s.chars().collect();
    let start = chars.iter().position(|c| c.is_ascii_digit())?;
    let mut end = start;
    while end < chars.len() && (chars[end].is_ascii_digit() || chars[end] == ',' || chars[end] == '.')
    {
        end += 1;
    }
    // Trim a trailing separator with nothing after it (e.g. "1,849." scanned
    // past a sentence-ending period).
    let mut run: String = chars[start..end].iter().collect();
    while run.ends_with(',') || run.ends_with('.') {
        run.pop();
    }
    if run.is_empty() {
        None
    } else {
        Some(run)
    }
}

fn is_pure_digit_run(run: &str) -> bool {
    run.chars().all(|c| c.is_ascii_digit())
}

/// Disambiguate which separator (if any) is the decimal point, per
/// SPEC_FULL.md §4.1, and return a plain `123.45`-shaped string.
fn disambiguate(run: &str) -> Option<String> {
    let has_comma = run.contains(',');
    let has_dot = run.contains('.');

    let result = if has_comma && has_dot {
        let last_comma = run.rfind(',').unwrap();
        let last_dot = run.rfind('.').unwrap();
        if last_dot > last_comma {
            // Dot is the decimal separator; commas are thousands grouping.
            run.replace(',', "")
        } else {
            // Comma is the decimal separator; dots are thousands grouping.
            run.replace('.', "").replacen(',', ".", 1).replace(',', "")
        }
    } else if has_comma {
        let last_comma = run.rfind(',').unwrap();
        let digits_after = run.len() - last_comma - 1;
        if digits_after == 2 {
            run.replacen(',', ".", 1).replace(',', "")
        } else {
            run.replace(',', "")
        }
    } else if has_dot {
        // Only dots present: the rightmost is the decimal separator; any
        // earlier dots are thousands grouping ("1.234.567" style).
        let last_dot = run.rfind('.').unwrap();
        let (head, tail) = run.split_at(last_dot);
        let tail = &tail[1..];
        format!("{}.{}", head.replace('.', ""), tail)
    } else {
        run.to_string()
    };

    if result.is_empty() || result == "." {
        None
    } else {
        Some(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn strips_currency_glyphs_and_whitespace() {
        assert_eq!(parse("  $1,849.00  "), Some(dec!(1849.00)));
        assert_eq!(parse("€2.399,50"), Some(dec!(2399.50)));
        assert_eq!(parse("£999"), Some(dec!(999)));
        assert_eq!(parse("¥5000"), Some(dec!(5000)));
    }

    #[test]
    fn both_separators_rightmost_is_decimal() {
        assert_eq!(parse("1,849.00"), Some(dec!(1849.00)));
        assert_eq!(parse("2.399,50"), Some(dec!(2399.50)));
    }

    #[test]
    fn comma_only_two_trailing_digits_is_decimal() {
        assert_eq!(parse("36,99"), Some(dec!(36.99)));
    }

    #[test]
    fn comma_only_three_trailing_digits_is_thousands() {
        assert_eq!(parse("1,849"), Some(dec!(1849)));
        assert_eq!(parse("12,345"), Some(dec!(12345)));
    }

    #[test]
    fn dot_only_is_decimal() {
        assert_eq!(parse("1849.00"), Some(dec!(1849.00)));
        assert_eq!(parse("99.5"), Some(dec!(99.5)));
    }

    #[test]
    fn rejects_out_of_range() {
        assert_eq!(parse("0.50"), None);
        assert_eq!(parse("250000"), None);
    }

    #[test]
    fn data_attribute_mode_treats_long_digit_runs_as_cents() {
        assert_eq!(
            parse_with_mode("184900", ParseMode::DataAttribute),
            Some(dec!(1849.00))
        );
        // Normal mode leaves it as whole units (and out of range here).
        assert_eq!(parse_with_mode("184900", ParseMode::Normal), None);
    }

    #[test]
    fn data_attribute_mode_does_not_affect_separated_runs() {
        assert_eq!(
            parse_with_mode("1,849.00", ParseMode::DataAttribute),
            Some(dec!(1849.00))
        );
    }

    #[test]
    fn malformed_input_returns_none_not_panic() {
        assert_eq!(parse(""), None);
        assert_eq!(parse("no digits here"), None);
        assert_eq!(parse("$.,"), None);
        assert_eq!(parse("free"), None);
    }

    #[test]
    fn takes_first_run_when_multiple_numbers_present() {
        assert_eq!(parse("was $4,589.00 now $3,059.00"), Some(dec!(4589.00)));
    }

    /// A deterministic sweep over representative currency prefixes,
    /// whitespace, and separator combinations. Every case either parses
    /// to the intended value or correctly returns `None`.
    #[test]
    fn fuzz_sweep_separator_and_prefix_combinations() {
        let cases: &[(&str, Option<Decimal>)] = &[
            ("$1849", Some(dec!(1849))),
            (" $ 1849.00 ", Some(dec!(1849.00))),
            ("EUR 1.234,56", Some(dec!(1234.56))), // run starts at the first digit: "1.234,56"
            ("1.234,56", Some(dec!(1234.56))),
            ("1234,56", Some(dec!(1234.56))),
            ("1234,567", Some(dec!(1234567))),
            ("  ", None),
            ("¥100000", Some(dec!(100000))),
            ("¥100001", None),
            ("$0.99", None),
            ("$1.00", Some(dec!(1.00))),
        ];
        for (input, expected) in cases {
            assert_eq!(parse(input), *expected, "input={input:?}");
        }
    }

    #[test]
    fn idempotent_for_two_decimal_values_in_range() {
        for raw in ["1.00", "99.99", "1849.00", "12345.67", "100000.00"] {
            let parsed = parse(raw).expect("should parse");
            let reformatted = parsed.to_string();
            let reparsed = parse(&reformatted).expect("should reparse");
            assert_eq!(parsed, reparsed);
        }
    }
}
