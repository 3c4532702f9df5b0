use anyhow::Result;
use async_trait::async_trait;
use regex::Regex;
use serde_json::json;
use std::sync::LazyLock;

use super::{SupportTool, ToolKind, ToolOutput};

static CONVERSION_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\$?\s*(\d+(?:,\d{3})*(?:\.\d+)?)\s*([a-z$€£₹¥]+)?\s+(?:to|in|into|ot)\s+([a-z$€£₹¥]+)")
        .expect("conversion regex is valid")
});

/// Units per US dollar. Indicative only.
const RATES_PER_USD: &[(&str, f64)] = &[
    ("USD", 1.0),
    ("EUR", 0.92),
    ("GBP", 0.79),
    ("INR", 83.0),
    ("NPR", 132.8),
    ("JPY", 149.5),
    ("CAD", 1.36),
    ("AUD", 1.52),
    ("CHF", 0.88),
    ("CNY", 7.24),
    ("SGD", 1.34),
];

fn currency_code(token: &str) -> Option<&'static str> {
    let code = match token.trim().to_lowercase().as_str() {
        "usd" | "us" | "$" | "dollar" | "dollars" => "USD",
        "eur" | "euro" | "euros" | "€" => "EUR",
        "gbp" | "pound" | "pounds" | "£" => "GBP",
        "inr" | "rupee" | "rupees" | "rs" | "₹" => "INR",
        "npr" | "nepali" => "NPR",
        "jpy" | "yen" | "¥" => "JPY",
        "cad" => "CAD",
        "aud" => "AUD",
        "chf" | "franc" | "francs" => "CHF",
        "cny" | "yuan" | "rmb" => "CNY",
        "sgd" => "SGD",
        _ => return None,
    };
    Some(code)
}

fn rate_per_usd(code: &str) -> Option<f64> {
    RATES_PER_USD.iter().find(|(c, _)| *c == code).map(|(_, r)| *r)
}

#[derive(Debug, Clone, PartialEq)]
struct Conversion {
    amount: f64,
    from: &'static str,
    to: &'static str,
    rate: f64,
}

impl Conversion {
    fn result(&self) -> f64 {
        self.amount * self.rate
    }
}

fn parse_conversion(query: &str) -> Option<Conversion> {
    for caps in CONVERSION_RE.captures_iter(query) {
        let amount: f64 = caps[1].replace(',', "").parse().ok()?;
        let from = match caps.get(2) {
            Some(unit) => currency_code(unit.as_str()),
            None if caps[0].trim_start().starts_with('$') => Some("USD"),
            None => None,
        };
        let (Some(from), Some(to)) = (from, currency_code(&caps[3])) else {
            continue;
        };
        let rate = rate_per_usd(to)? / rate_per_usd(from)?;
        return Some(Conversion { amount, from, to, rate });
    }
    None
}

pub struct CurrencyConverterTool;

impl CurrencyConverterTool {
    pub fn new() -> Self {
        Self
    }
}

impl Default for CurrencyConverterTool {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SupportTool for CurrencyConverterTool {
    fn name(&self) -> &str {
        ToolKind::CurrencyConverter.id()
    }

    fn description(&self) -> &str {
        ToolKind::CurrencyConverter.description()
    }

    fn should_use(&self, query: &str) -> bool {
        ToolKind::CurrencyConverter.matches(query)
    }

    async fn execute(&self, query: &str) -> Result<ToolOutput> {
        let Some(conversion) = parse_conversion(query) else {
            return Ok(ToolOutput::failure(
                "No currency conversion found (try \"100 usd to eur\")",
            ));
        };

        let result = conversion.result();
        let message = format!(
            "{:.2} {} = {:.2} {} (indicative rate {:.4})",
            conversion.amount, conversion.from, result, conversion.to, conversion.rate
        );
        let data = json!({
            "amount": conversion.amount,
            "from": conversion.from,
            "to": conversion.to,
            "rate": conversion.rate,
            "result": result,
            "rateSource": "static",
        });
        Ok(ToolOutput::success(0.85, message, data))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_codes_and_names() {
        let c = parse_conversion("convert 100 usd to eur").unwrap();
        assert_eq!((c.from, c.to), ("USD", "EUR"));
        assert!((c.result() - 92.0).abs() < 1e-9);

        let c = parse_conversion("what is 1,000 rupees in dollars").unwrap();
        assert_eq!((c.from, c.to), ("INR", "USD"));
        assert!((c.result() - 1000.0 / 83.0).abs() < 1e-9);
    }

    #[test]
    fn test_dollar_sign_amount() {
        let c = parse_conversion("$50 to gbp").unwrap();
        assert_eq!(c.from, "USD");
        assert_eq!(c.to, "GBP");
    }

    #[tokio::test]
    async fn test_unknown_currency_is_handled_miss() {
        let out = CurrencyConverterTool::new()
            .execute("convert 10 bananas to apples")
            .await
            .unwrap();
        assert!(!out.success);
    }
}
