//! Support tools hosted by the tool server process.
//!
//! Each tool answers one kind of question directly (fee math, API status,
//! endpoint validation, time, currency, web lookup) and reports how confident
//! it is in its own answer.

use anyhow::Result;
use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, LazyLock};

pub mod calculator;
pub mod code_validator;
pub mod config;
pub mod currency;
pub mod datetime;
pub mod status;
pub mod web_search;

pub use calculator::CalculatorTool;
pub use code_validator::CodeValidatorTool;
pub use config::{ToolConfigFile, ToolConfigManager, ToolDescriptor, ToolStatusSummary};
pub use currency::CurrencyConverterTool;
pub use datetime::DateTimeTool;
pub use status::StatusCheckerTool;
pub use web_search::WebSearchTool;

/// The closed set of tools this system ships.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolKind {
    Calculator,
    StatusChecker,
    WebSearch,
    CodeValidator,
    Datetime,
    CurrencyConverter,
}

static CALCULATOR_TRIGGERS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    compile(&[
        r"\d+(\.\d+)?\s*%",
        r"\$\s?\d+",
        r"\b(calculate|compute|math)\b",
        r"\b(fees?|cost|price|pricing)\b",
        r"\d\s*[+\-*/]\s*\(?\d",
        r"\bpercent(age)?\b",
    ])
});

static STATUS_TRIGGERS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    compile(&[
        r"\bdown\b|not working|broken",
        r"\b(status|outage|incident)\b",
        r"\b(maintenance|scheduled)\b",
        r"\b(issue|problem|errors?)\b",
    ])
});

static CODE_TRIGGERS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    compile(&[
        r"/v1/",
        r"api\.stripe\.com",
        r"\b(curl|fetch|axios)\b",
        r"\b(sk|pk|rk)_",
        r"```|`[^`]+`",
        r"\b(javascript|node\.js|python)\b",
        r"\b(validate|verify)\b.*\b(endpoint|code|request)\b",
    ])
});

static DATETIME_TRIGGERS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    compile(&[
        r"\b(now|currently)\b",
        r"\b(today|yesterday|tomorrow)\b",
        r"\b(time|date|when)\b",
        r"business hours|\bweekend\b",
    ])
});

static CURRENCY_TRIGGERS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    compile(&[
        r"\bconvert\b.*\b(to|into|in)\b",
        r"\bcurrenc(y|ies)\b|exchange rate",
        r"\d+(\.\d+)?\s*(usd|eur|gbp|inr|jpy|cad|aud|npr|dollars?|euros?|pounds?|rupees?|yen)\b",
    ])
});

static WEB_SEARCH_TRIGGERS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    compile(&[
        r"\b(latest|recent|recently|new|updated|breaking)\b",
        r"\b20[2-9]\d\b",
    ])
});

fn compile(patterns: &[&str]) -> Vec<Regex> {
    patterns
        .iter()
        .map(|p| Regex::new(p).expect("tool trigger regex is valid"))
        .collect()
}

impl ToolKind {
    pub const ALL: [ToolKind; 6] = [
        ToolKind::Calculator,
        ToolKind::StatusChecker,
        ToolKind::WebSearch,
        ToolKind::CodeValidator,
        ToolKind::Datetime,
        ToolKind::CurrencyConverter,
    ];

    pub fn id(&self) -> &'static str {
        match self {
            ToolKind::Calculator => "calculator",
            ToolKind::StatusChecker => "status_checker",
            ToolKind::WebSearch => "web_search",
            ToolKind::CodeValidator => "code_validator",
            ToolKind::Datetime => "datetime",
            ToolKind::CurrencyConverter => "currency_converter",
        }
    }

    pub fn parse(id: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.id() == id)
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            ToolKind::Calculator => "Calculator",
            ToolKind::StatusChecker => "Status Checker",
            ToolKind::WebSearch => "Web Search",
            ToolKind::CodeValidator => "Code Validator",
            ToolKind::Datetime => "Date & Time",
            ToolKind::CurrencyConverter => "Currency Converter",
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            ToolKind::Calculator => "Calculate processing fees, percentages, and arithmetic expressions",
            ToolKind::StatusChecker => "Check the payment API's operational status by probing its endpoints",
            ToolKind::WebSearch => "Search the web for recent updates and information missing from the docs",
            ToolKind::CodeValidator => "Validate API endpoints, request snippets, and key usage",
            ToolKind::Datetime => "Report the current time, business hours, and relative dates",
            ToolKind::CurrencyConverter => "Convert amounts between currencies using indicative rates",
        }
    }

    /// Libraries or services the tool relies on, shown in the tool catalog.
    pub fn dependencies(&self) -> &'static [&'static str] {
        match self {
            ToolKind::Calculator => &["expression-evaluator"],
            ToolKind::StatusChecker => &["payments-api"],
            ToolKind::WebSearch => &["google-custom-search"],
            ToolKind::CodeValidator => &[],
            ToolKind::Datetime => &["chrono"],
            ToolKind::CurrencyConverter => &["rate-table"],
        }
    }

    /// Environment variables that must be set for the tool to be usable.
    pub fn required_secrets(&self) -> &'static [&'static str] {
        match self {
            ToolKind::StatusChecker => &["STRIPE_SECRET_KEY"],
            ToolKind::WebSearch => &["GOOGLE_SEARCH_API_KEY", "GOOGLE_SEARCH_ENGINE_ID"],
            _ => &[],
        }
    }

    fn triggers(&self) -> &'static [Regex] {
        match self {
            ToolKind::Calculator => &CALCULATOR_TRIGGERS,
            ToolKind::StatusChecker => &STATUS_TRIGGERS,
            ToolKind::WebSearch => &WEB_SEARCH_TRIGGERS,
            ToolKind::CodeValidator => &CODE_TRIGGERS,
            ToolKind::Datetime => &DATETIME_TRIGGERS,
            ToolKind::CurrencyConverter => &CURRENCY_TRIGGERS,
        }
    }

    /// Whether the query carries this tool's cues. Shared by the tools
    /// themselves and the rule-based selector.
    pub fn matches(&self, query: &str) -> bool {
        let lower = query.to_lowercase();
        self.triggers().iter().any(|re| re.is_match(&lower))
    }
}

impl std::fmt::Display for ToolKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.id())
    }
}

/// What a tool returns. Serialized as the text payload of a tool call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolOutput {
    pub success: bool,
    pub confidence: f32,
    pub message: String,
    #[serde(default)]
    pub data: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ToolOutput {
    pub fn success(confidence: f32, message: impl Into<String>, data: Value) -> Self {
        Self {
            success: true,
            confidence: confidence.clamp(0.0, 1.0),
            message: message.into(),
            data,
            error: None,
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        let error = error.into();
        Self {
            success: false,
            confidence: 0.0,
            message: error.clone(),
            data: Value::Null,
            error: Some(error),
        }
    }
}

#[async_trait]
pub trait SupportTool: Send + Sync {
    fn name(&self) -> &str;

    fn description(&self) -> &str;

    fn should_use(&self, query: &str) -> bool;

    /// `Err` means the tool itself broke. A handled miss (nothing to compute,
    /// missing credential) is `Ok` with `success: false`.
    async fn execute(&self, query: &str) -> Result<ToolOutput>;
}

/// Tools by name, in registration order.
#[derive(Default)]
pub struct ToolRegistry {
    tools: Vec<Arc<dyn SupportTool>>,
    index: HashMap<String, usize>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// All six shipped tools, sharing one HTTP client.
    pub fn with_default_tools(http: reqwest::Client) -> Self {
        let mut registry = Self::new();
        for kind in ToolKind::ALL {
            let tool: Arc<dyn SupportTool> = match kind {
                ToolKind::Calculator => Arc::new(CalculatorTool::new()),
                ToolKind::StatusChecker => Arc::new(StatusCheckerTool::from_env(http.clone())),
                ToolKind::WebSearch => Arc::new(WebSearchTool::from_env(http.clone())),
                ToolKind::CodeValidator => Arc::new(CodeValidatorTool::new()),
                ToolKind::Datetime => Arc::new(DateTimeTool::new()),
                ToolKind::CurrencyConverter => Arc::new(CurrencyConverterTool::new()),
            };
            registry.register(tool);
        }
        registry
    }

    /// Registering a name twice replaces the earlier tool in place.
    pub fn register(&mut self, tool: Arc<dyn SupportTool>) {
        let name = tool.name().to_string();
        match self.index.get(&name) {
            Some(&pos) => self.tools[pos] = tool,
            None => {
                self.index.insert(name, self.tools.len());
                self.tools.push(tool);
            }
        }
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn SupportTool>> {
        self.index.get(name).map(|&pos| Arc::clone(&self.tools[pos]))
    }

    pub fn list(&self) -> &[Arc<dyn SupportTool>] {
        &self.tools
    }

    pub fn names(&self) -> Vec<String> {
        self.tools.iter().map(|t| t.name().to_string()).collect()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}
