use anyhow::Result;
use async_trait::async_trait;
use regex::Regex;
use serde_json::json;
use std::sync::LazyLock;

use super::{SupportTool, ToolKind, ToolOutput};

static ENDPOINT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"/v1/([a-z_]+)(/[A-Za-z0-9_{}.\-]+)*").expect("endpoint regex is valid"));
static LIVE_SECRET_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b(sk|rk)_live_[A-Za-z0-9]+").expect("live key regex is valid"));
static TEST_SECRET_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b(sk|rk)_test_[A-Za-z0-9]+").expect("test key regex is valid"));
static CURL_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\bcurl\b").expect("curl regex is valid"));

const KNOWN_RESOURCES: &[&str] = &[
    "accounts",
    "balance",
    "balance_transactions",
    "charges",
    "checkout",
    "coupons",
    "customers",
    "disputes",
    "events",
    "invoices",
    "payment_intents",
    "payment_links",
    "payment_methods",
    "payouts",
    "prices",
    "products",
    "refunds",
    "setup_intents",
    "subscriptions",
    "subscription_items",
    "tokens",
    "transfers",
    "webhook_endpoints",
];

#[derive(Debug, Default)]
struct Findings {
    endpoints: Vec<(String, bool)>,
    errors: Vec<String>,
    warnings: Vec<String>,
}

impl Findings {
    fn checked_anything(&self) -> bool {
        !self.endpoints.is_empty() || !self.errors.is_empty() || !self.warnings.is_empty()
    }
}

fn analyze(input: &str) -> Findings {
    let mut findings = Findings::default();

    for m in ENDPOINT_RE.captures_iter(input) {
        let path = m[0].to_string();
        let valid = KNOWN_RESOURCES.contains(&&m[1]);
        if !valid {
            findings
                .errors
                .push(format!("Unknown API resource '{}' in {}", &m[1], path));
        }
        if !findings.endpoints.iter().any(|(p, _)| p == &path) {
            findings.endpoints.push((path, valid));
        }
    }

    if LIVE_SECRET_RE.is_match(input) {
        findings
            .errors
            .push("A live secret key is exposed. Roll it in the dashboard and keep it server-side.".into());
    }
    if TEST_SECRET_RE.is_match(input) {
        findings
            .warnings
            .push("Test secret key present. Load keys from the environment instead of inlining them.".into());
    }
    if input.contains("pk_live_") && input.to_lowercase().contains("server") {
        findings
            .warnings
            .push("Publishable keys cannot authenticate server-side requests.".into());
    }

    if CURL_RE.is_match(input)
        && !input.contains(" -u ")
        && !input.to_lowercase().contains("authorization")
    {
        findings
            .warnings
            .push("curl request has no credentials (-u or Authorization header).".into());
    }

    if input.matches("```").count() % 2 != 0 {
        findings.errors.push("Unclosed code fence".into());
    }
    for (open, close) in [('(', ')'), ('{', '}'), ('[', ']')] {
        let balance = input.chars().fold(0i32, |acc, c| {
            if c == open {
                acc + 1
            } else if c == close {
                acc - 1
            } else {
                acc
            }
        });
        if balance != 0 {
            findings
                .errors
                .push(format!("Unbalanced '{}{}' in snippet", open, close));
        }
    }

    findings
}

pub struct CodeValidatorTool;

impl CodeValidatorTool {
    pub fn new() -> Self {
        Self
    }
}

impl Default for CodeValidatorTool {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SupportTool for CodeValidatorTool {
    fn name(&self) -> &str {
        ToolKind::CodeValidator.id()
    }

    fn description(&self) -> &str {
        ToolKind::CodeValidator.description()
    }

    fn should_use(&self, query: &str) -> bool {
        ToolKind::CodeValidator.matches(query)
    }

    async fn execute(&self, query: &str) -> Result<ToolOutput> {
        let findings = analyze(query);
        if !findings.checked_anything() {
            return Ok(ToolOutput::failure("No endpoints or code found to validate"));
        }

        let mut lines = Vec::new();
        for (path, valid) in &findings.endpoints {
            lines.push(format!(
                "{} {}",
                if *valid { "Valid endpoint:" } else { "Invalid endpoint:" },
                path
            ));
        }
        lines.extend(findings.errors.iter().map(|e| format!("Error: {}", e)));
        lines.extend(findings.warnings.iter().map(|w| format!("Warning: {}", w)));
        if findings.errors.is_empty() && findings.warnings.is_empty() {
            lines.push("No problems found.".into());
        }

        let data = json!({
            "valid": findings.errors.is_empty(),
            "endpoints": findings.endpoints.iter().map(|(p, v)| json!({"path": p, "valid": v})).collect::<Vec<_>>(),
            "errors": findings.errors,
            "warnings": findings.warnings,
        });
        Ok(ToolOutput::success(0.85, lines.join("\n"), data))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_and_unknown_endpoints() {
        let findings = analyze("POST /v1/payment_intents then GET /v1/paymentz/123");
        assert_eq!(findings.endpoints.len(), 2);
        assert!(findings.endpoints[0].1);
        assert!(!findings.endpoints[1].1);
        assert_eq!(findings.errors.len(), 1);
    }

    #[test]
    fn test_live_key_is_error() {
        let findings = analyze("curl https://api.stripe.com/v1/charges -u sk_live_abc123:");
        assert!(findings.errors.iter().any(|e| e.contains("live secret key")));
        assert!(findings.warnings.is_empty());
    }

    #[test]
    fn test_unbalanced_snippet() {
        let findings = analyze("```js\nstripe.charges.create({ amount: 100 ```");
        assert!(findings.errors.iter().any(|e| e.contains("Unbalanced")));
    }

    #[tokio::test]
    async fn test_nothing_to_validate() {
        let out = CodeValidatorTool::new().execute("hello there").await.unwrap();
        assert!(!out.success);
    }
}
