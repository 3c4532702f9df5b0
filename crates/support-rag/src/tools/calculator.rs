use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use regex::Regex;
use serde_json::json;
use std::sync::LazyLock;

use super::{SupportTool, ToolKind, ToolOutput};

/// "2.9% + $0.30", optionally "on $100"
static FEE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(\d+(?:\.\d+)?)\s*%\s*\+\s*\$?\s*(\d+(?:\.\d+)?)(?:\s*(?:on|for|of|per)\s*(?:a\s+)?\$?\s*(\d+(?:\.\d+)?))?")
        .expect("fee regex is valid")
});

/// "3% of $250"
static PERCENT_OF_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(\d+(?:\.\d+)?)\s*%\s*of\s*\$?\s*(\d+(?:\.\d+)?)").expect("percent-of regex is valid")
});

static EXPRESSION_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[\d.\s+\-*/()%]+").expect("expression regex is valid"));

/// Charge amount assumed when a fee is given without one.
const EXAMPLE_CHARGE: f64 = 100.0;

/// Longest expression the evaluator accepts, in characters.
const MAX_EXPRESSION_LEN: usize = 256;
/// Deepest nesting of parentheses and unary signs.
const MAX_DEPTH: usize = 64;

#[derive(Debug, Clone, PartialEq)]
struct Calculation {
    expression: String,
    value: f64,
    money: bool,
}

pub struct CalculatorTool;

impl CalculatorTool {
    pub fn new() -> Self {
        Self
    }

    fn extract(query: &str) -> Vec<Calculation> {
        let mut calculations = Vec::new();

        for caps in FEE_RE.captures_iter(query) {
            let (Ok(percent), Ok(fixed)) = (caps[1].parse::<f64>(), caps[2].parse::<f64>()) else {
                continue;
            };
            let amount = caps
                .get(3)
                .and_then(|m| m.as_str().parse::<f64>().ok())
                .unwrap_or(EXAMPLE_CHARGE);
            calculations.push(Calculation {
                expression: format!("{}% of ${} + ${}", percent, amount, fixed),
                value: amount * percent / 100.0 + fixed,
                money: true,
            });
        }

        for caps in PERCENT_OF_RE.captures_iter(query) {
            let (Ok(percent), Ok(amount)) = (caps[1].parse::<f64>(), caps[2].parse::<f64>()) else {
                continue;
            };
            calculations.push(Calculation {
                expression: format!("{}% of {}", percent, amount),
                value: amount * percent / 100.0,
                money: caps[0].contains('$'),
            });
        }

        if calculations.is_empty() {
            for m in EXPRESSION_RE.find_iter(query) {
                let candidate = m.as_str().trim();
                let has_operator = candidate.chars().any(|c| "+-*/".contains(c));
                let digit_runs = candidate
                    .split(|c: char| !c.is_ascii_digit() && c != '.')
                    .filter(|s| !s.is_empty())
                    .count();
                if !has_operator || digit_runs < 2 {
                    continue;
                }
                if let Ok(value) = evaluate(candidate) {
                    calculations.push(Calculation {
                        expression: candidate.to_string(),
                        value,
                        money: false,
                    });
                }
            }
        }

        calculations.dedup_by(|a, b| a.expression == b.expression);
        calculations
    }

    fn confidence(calc: &Calculation) -> f32 {
        let mut confidence: f32 = 0.8;
        if calc.expression.len() < 20 {
            confidence += 0.1;
        }
        if calc.value > 0.0 && calc.value < 1_000_000.0 {
            confidence += 0.1;
        }
        if calc.value > 1_000_000.0 || (calc.value > 0.0 && calc.value < 0.001) {
            confidence -= 0.2;
        }
        confidence.clamp(0.0, 1.0)
    }

    fn format(calc: &Calculation) -> String {
        let number = if calc.value.fract() == 0.0 {
            format!("{:.0}", calc.value)
        } else {
            format!("{:.2}", calc.value)
        };
        if calc.money {
            format!("${}", number)
        } else {
            number
        }
    }
}

impl Default for CalculatorTool {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SupportTool for CalculatorTool {
    fn name(&self) -> &str {
        ToolKind::Calculator.id()
    }

    fn description(&self) -> &str {
        ToolKind::Calculator.description()
    }

    fn should_use(&self, query: &str) -> bool {
        ToolKind::Calculator.matches(query)
    }

    async fn execute(&self, query: &str) -> Result<ToolOutput> {
        let calculations = Self::extract(query);
        if calculations.is_empty() {
            return Ok(ToolOutput::failure("No mathematical expressions found in query"));
        }

        let confidence = calculations.iter().map(Self::confidence).sum::<f32>()
            / calculations.len() as f32;

        let message = if calculations.len() == 1 {
            let calc = &calculations[0];
            format!("The result is {} ({})", Self::format(calc), calc.expression)
        } else {
            let lines: Vec<String> = calculations
                .iter()
                .enumerate()
                .map(|(i, c)| format!("{}. {} ({})", i + 1, Self::format(c), c.expression))
                .collect();
            format!("Here are the calculations:\n{}", lines.join("\n"))
        };

        let data = json!({
            "calculations": calculations.iter().map(|c| json!({
                "expression": c.expression,
                "result": c.value,
                "formatted": Self::format(c),
                "confidence": Self::confidence(c),
            })).collect::<Vec<_>>(),
        });

        Ok(ToolOutput::success(confidence, message, data))
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Token {
    Number(f64),
    Plus,
    Minus,
    Star,
    Slash,
    Percent,
    LParen,
    RParen,
}

fn tokenize(input: &str) -> Result<Vec<Token>> {
    let mut tokens = Vec::new();
    let chars: Vec<char> = input.chars().collect();
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        match c {
            ' ' | '\t' | '\n' => {}
            '+' => tokens.push(Token::Plus),
            '-' => tokens.push(Token::Minus),
            '*' => tokens.push(Token::Star),
            '/' => tokens.push(Token::Slash),
            '%' => tokens.push(Token::Percent),
            '(' => tokens.push(Token::LParen),
            ')' => tokens.push(Token::RParen),
            d if d.is_ascii_digit() || d == '.' => {
                let start = i;
                while i + 1 < chars.len() && (chars[i + 1].is_ascii_digit() || chars[i + 1] == '.') {
                    i += 1;
                }
                let literal: String = chars[start..=i].iter().collect();
                let value = literal
                    .parse::<f64>()
                    .map_err(|_| anyhow!("invalid number '{}'", literal))?;
                tokens.push(Token::Number(value));
            }
            other => bail!("unexpected character '{}'", other),
        }
        i += 1;
    }
    Ok(tokens)
}

/// Recursive-descent evaluator for `+ - * / ( )` with postfix `%` (divide by 100).
struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    depth: usize,
}

impl Parser {
    fn peek(&self) -> Option<Token> {
        self.tokens.get(self.pos).copied()
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.peek();
        self.pos += 1;
        token
    }

    fn expression(&mut self) -> Result<f64> {
        let mut value = self.term()?;
        while let Some(op @ (Token::Plus | Token::Minus)) = self.peek() {
            self.pos += 1;
            let rhs = self.term()?;
            value = if op == Token::Plus { value + rhs } else { value - rhs };
        }
        Ok(value)
    }

    fn term(&mut self) -> Result<f64> {
        let mut value = self.factor()?;
        while let Some(op @ (Token::Star | Token::Slash)) = self.peek() {
            self.pos += 1;
            let rhs = self.factor()?;
            if op == Token::Star {
                value *= rhs;
            } else {
                if rhs == 0.0 {
                    bail!("division by zero");
                }
                value /= rhs;
            }
        }
        Ok(value)
    }

    fn factor(&mut self) -> Result<f64> {
        self.depth += 1;
        if self.depth > MAX_DEPTH {
            bail!("expression nested deeper than {}", MAX_DEPTH);
        }
        let value = self.factor_inner();
        self.depth -= 1;
        value
    }

    fn factor_inner(&mut self) -> Result<f64> {
        let mut value = match self.next() {
            Some(Token::Number(n)) => n,
            Some(Token::Minus) => -self.factor()?,
            Some(Token::Plus) => self.factor()?,
            Some(Token::LParen) => {
                let inner = self.expression()?;
                match self.next() {
                    Some(Token::RParen) => inner,
                    _ => bail!("missing closing parenthesis"),
                }
            }
            other => bail!("unexpected token {:?}", other),
        };
        while self.peek() == Some(Token::Percent) {
            self.pos += 1;
            value /= 100.0;
        }
        Ok(value)
    }
}

fn evaluate(input: &str) -> Result<f64> {
    if input.len() > MAX_EXPRESSION_LEN {
        bail!("expression longer than {} characters", MAX_EXPRESSION_LEN);
    }
    let tokens = tokenize(input)?;
    if tokens.is_empty() {
        bail!("empty expression");
    }
    let mut parser = Parser {
        tokens,
        pos: 0,
        depth: 0,
    };
    let value = parser.expression()?;
    if parser.pos != parser.tokens.len() {
        bail!("trailing input in expression");
    }
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_evaluate_precedence_and_parens() {
        assert_eq!(evaluate("2 + 3 * 4").unwrap(), 14.0);
        assert_eq!(evaluate("(2 + 3) * 4").unwrap(), 20.0);
        assert_eq!(evaluate("-3 + 5").unwrap(), 2.0);
        assert!((evaluate("50%").unwrap() - 0.5).abs() < 1e-12);
        assert!(evaluate("1 / 0").is_err());
        assert!(evaluate("(1 + 2").is_err());
    }

    #[test]
    fn test_evaluate_rejects_deep_nesting() {
        let nested = format!("{}1{}", "(".repeat(70), ")".repeat(70));
        let err = evaluate(&nested).unwrap_err();
        assert!(err.to_string().contains("nested"), "{}", err);
        assert!(evaluate(&format!("{}1", "- ".repeat(70))).is_err());

        let shallow = format!("{}1{}", "(".repeat(10), ")".repeat(10));
        assert_eq!(evaluate(&shallow).unwrap(), 1.0);
    }

    #[tokio::test]
    async fn test_huge_nested_query_is_handled_miss() {
        let query = format!("calculate 1 + {}1{}", "(".repeat(100_000), ")".repeat(100_000));
        let out = CalculatorTool::new().execute(&query).await.unwrap();
        assert!(!out.success);
    }

    #[tokio::test]
    async fn test_fee_on_amount() {
        let tool = CalculatorTool::new();
        let out = tool.execute("What's the fee for 2.9% + $0.30 on $100?").await.unwrap();
        assert!(out.success);
        assert!(out.message.contains("$3.20"), "{}", out.message);
        assert!(out.confidence > 0.8);
    }

    #[tokio::test]
    async fn test_percent_of() {
        let tool = CalculatorTool::new();
        let out = tool.execute("what is 3% of $250").await.unwrap();
        assert!(out.message.contains("$7.50"), "{}", out.message);
    }

    #[tokio::test]
    async fn test_plain_arithmetic() {
        let tool = CalculatorTool::new();
        let out = tool.execute("compute 12 * (3 + 1)").await.unwrap();
        assert!(out.success);
        assert!(out.message.contains("48"));
    }

    #[tokio::test]
    async fn test_no_expression_is_handled_miss() {
        let tool = CalculatorTool::new();
        let out = tool.execute("how do refunds work").await.unwrap();
        assert!(!out.success);
        assert_eq!(out.confidence, 0.0);
    }

    #[test]
    fn test_confidence_penalizes_extreme_results() {
        let small = Calculation {
            expression: "1 / 100000".into(),
            value: 0.00001,
            money: false,
        };
        let huge = Calculation {
            expression: "9999999 * 9999999 + 1".into(),
            value: 9.9e13,
            money: false,
        };
        assert!((CalculatorTool::confidence(&small) - 0.8).abs() < 1e-6);
        assert!((CalculatorTool::confidence(&huge) - 0.6).abs() < 1e-6);
    }
}
