//! Tokenizing and typed argument parsing.

use crate::error::{BenchError, BenchResult};
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::BTreeMap;

static NUMBER: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^([+-]?(?:\d+\.?\d*|\.\d+)(?:[eE][+-]?\d+)?)\s*([pnuµmkMG]?)(?:Vpp|V|A|Hz|s|Ohm|ohm)?$")
        .expect("number pattern is valid")
});

static VARIABLE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").expect("variable pattern is valid"));

/// Split a line on whitespace; single or double quotes group text.
pub fn tokenize(line: &str) -> BenchResult<Vec<String>> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut in_token = false;
    let mut quote: Option<char> = None;

    for c in line.chars() {
        match quote {
            Some(q) if c == q => quote = None,
            Some(_) => current.push(c),
            None if c == '"' || c == '\'' => {
                quote = Some(c);
                in_token = true;
            }
            None if c.is_whitespace() => {
                if in_token {
                    tokens.push(std::mem::take(&mut current));
                    in_token = false;
                }
            }
            None => {
                current.push(c);
                in_token = true;
            }
        }
    }
    if let Some(q) = quote {
        return Err(BenchError::Usage(format!("unterminated {q} quote")));
    }
    if in_token {
        tokens.push(current);
    }
    Ok(tokens)
}

/// Positional and `key=value` arguments.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Args {
    /// Arguments without `=`, in order
    pub positional: Vec<String>,
    /// `key=value` arguments, keys lowercased
    pub named: BTreeMap<String, String>,
}

impl Args {
    /// Split tokens into positional and named arguments.
    pub fn parse(tokens: &[String]) -> Self {
        let mut args = Args::default();
        for token in tokens {
            match token.split_once('=') {
                Some((key, value))
                    if !key.is_empty()
                        && key.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
                        && key.chars().next().is_some_and(|c| c.is_ascii_alphabetic() || c == '_') =>
                {
                    args.named.insert(key.to_ascii_lowercase(), value.to_string());
                }
                _ => args.positional.push(token.clone()),
            }
        }
        args
    }

    /// Positional argument `index`, or a usage error naming `what`.
    pub fn required(&self, index: usize, what: &str) -> BenchResult<&str> {
        self.positional
            .get(index)
            .map(String::as_str)
            .ok_or_else(|| BenchError::Usage(format!("missing {what}")))
    }

    /// Named argument parsed as a number.
    pub fn number(&self, key: &str) -> BenchResult<Option<f64>> {
        self.named.get(key).map(|v| parse_number(v)).transpose()
    }

    /// Reject named arguments outside `allowed`.
    pub fn only(&self, allowed: &[&str]) -> BenchResult<()> {
        match self.named.keys().find(|k| !allowed.contains(&k.as_str())) {
            Some(key) => Err(BenchError::Usage(format!(
                "unknown parameter '{key}' (expected {})",
                allowed.join(", ")
            ))),
            None => Ok(()),
        }
    }
}

fn prefix_exponent(prefix: &str) -> i32 {
    match prefix {
        "p" => -12,
        "n" => -9,
        "u" | "µ" => -6,
        "m" => -3,
        "k" => 3,
        "M" => 6,
        "G" => 9,
        _ => 0,
    }
}

/// Parse a number with an optional engineering prefix and unit.
///
/// `5`, `2.5V`, `200m`, `1.5k`, `1kHz`, `10MHz`, `100uA`, `2Vpp`. Prefixes are
/// case-sensitive: `m` is milli, `M` is mega.
pub fn parse_number(text: &str) -> BenchResult<f64> {
    let caps = NUMBER
        .captures(text.trim())
        .ok_or_else(|| BenchError::Usage(format!("'{text}' is not a number")))?;
    let mantissa: f64 = caps[1]
        .parse()
        .map_err(|_| BenchError::Usage(format!("'{text}' is not a number")))?;
    // Dividing keeps values like 500m exact.
    let exponent = prefix_exponent(caps.get(2).map_or("", |m| m.as_str()));
    Ok(if exponent < 0 {
        mantissa / 10f64.powi(-exponent)
    } else {
        mantissa * 10f64.powi(exponent)
    })
}

/// Parse `name=value` variable bindings for record and replay.
///
/// Names keep their case and must be valid placeholder names.
pub fn parse_bindings(tokens: &[String]) -> BenchResult<BTreeMap<String, String>> {
    let mut bindings = BTreeMap::new();
    for token in tokens {
        let (name, value) = token
            .split_once('=')
            .ok_or_else(|| BenchError::Usage(format!("expected name=value, got '{token}'")))?;
        if !VARIABLE.is_match(name) {
            return Err(BenchError::Usage(format!("'{name}' is not a valid variable name")));
        }
        bindings.insert(name.to_string(), value.to_string());
    }
    Ok(bindings)
}

/// Parse `on`/`off` style switches.
pub fn parse_bool(text: &str) -> BenchResult<bool> {
    match text.to_ascii_lowercase().as_str() {
        "on" | "1" | "true" | "yes" | "enable" => Ok(true),
        "off" | "0" | "false" | "no" | "disable" => Ok(false),
        _ => Err(BenchError::Usage(format!("expected on or off, got '{text}'"))),
    }
}

/// Parse a 1-based channel number, `2` or `ch2`.
pub fn parse_channel(text: &str) -> BenchResult<u8> {
    let lower = text.to_ascii_lowercase();
    let digits = lower.strip_prefix("ch").unwrap_or(&lower);
    match digits.parse::<u8>() {
        Ok(n) if n > 0 => Ok(n),
        _ => Err(BenchError::Usage(format!("'{text}' is not a channel number"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn toks(line: &str) -> Vec<String> {
        tokenize(line).unwrap()
    }

    #[test]
    fn tokenizes_with_quotes() {
        assert_eq!(toks("psu set p6v 5.0"), vec!["psu", "set", "p6v", "5.0"]);
        assert_eq!(toks("raw dmm \"CONF:VOLT:DC 10\""), vec!["raw", "dmm", "CONF:VOLT:DC 10"]);
        assert_eq!(toks("  a  'b c'd  "), vec!["a", "b cd"]);
        assert_eq!(toks("x \"\""), vec!["x", ""]);
        assert!(toks("").is_empty());
        assert!(matches!(tokenize("raw \"open"), Err(BenchError::Usage(_))));
    }

    #[test]
    fn separates_named_arguments() {
        let args = Args::parse(&toks("1 sine freq=1k AMP=2 x==y"));
        assert_eq!(args.positional, vec!["1", "sine", "x==y"]);
        assert_eq!(args.named.get("freq").map(String::as_str), Some("1k"));
        assert_eq!(args.number("amp").unwrap(), Some(2.0));
        assert!(args.only(&["freq", "amp"]).is_ok());
        assert!(args.only(&["freq"]).is_err());
    }

    #[test]
    fn engineering_suffixes() {
        let close = |text: &str, expected: f64| {
            let value = parse_number(text).unwrap();
            assert!((value - expected).abs() <= expected.abs() * 1e-12, "{text} -> {value}");
        };
        close("5", 5.0);
        close("2.5V", 2.5);
        close("200m", 0.2);
        close("200mV", 0.2);
        close("1.5k", 1500.0);
        close("1kHz", 1000.0);
        close("10MHz", 10e6);
        close("100uA", 100e-6);
        close("-12", -12.0);
        close("1e3", 1000.0);
        close("2Vpp", 2.0);
        close(".5", 0.5);
        assert!(parse_number("five").is_err());
        assert!(parse_number("5x").is_err());
        assert!(parse_number("").is_err());
    }

    #[test]
    fn bindings_keep_case() {
        let bindings = parse_bindings(&toks("Freq=2k f=2000 note=")).unwrap();
        assert_eq!(bindings.get("Freq").map(String::as_str), Some("2k"));
        assert_eq!(bindings.get("f").map(String::as_str), Some("2000"));
        assert_eq!(bindings.get("note").map(String::as_str), Some(""));
        assert!(parse_bindings(&toks("2f=1")).is_err());
        assert!(parse_bindings(&toks("loose")).is_err());
    }

    #[test]
    fn switches_and_channels() {
        assert!(parse_bool("ON").unwrap());
        assert!(!parse_bool("off").unwrap());
        assert!(parse_bool("maybe").is_err());
        assert_eq!(parse_channel("2").unwrap(), 2);
        assert_eq!(parse_channel("CH1").unwrap(), 1);
        assert!(parse_channel("0").is_err());
        assert!(parse_channel("p6v").is_err());
    }
}
