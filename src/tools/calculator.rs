//! Arithmetic calculator tool.
//!
//! Recursive-descent evaluator over `+ - * / % ^` and parentheses. No
//! names, no functions, no side effects.

use async_trait::async_trait;
use serde_json::{json, Value};

use super::{Tool, ToolContext};
use crate::error::{Error, Result};

/// Evaluates arithmetic expressions.
#[derive(Debug, Clone, Copy, Default)]
pub struct CalculatorTool;

impl CalculatorTool {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Tool for CalculatorTool {
    fn name(&self) -> &'static str {
        "calculator"
    }

    fn description(&self) -> &'static str {
        "Evaluates an arithmetic expression (+, -, *, /, %, ^, parentheses)."
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "required": ["expression"],
            "properties": {"expression": {"type": "string"}}
        })
    }

    fn output_schema(&self) -> Value {
        json!({
            "type": "object",
            "required": ["result"],
            "properties": {"result": {"type": "number"}}
        })
    }

    async fn execute(&self, input: Value, _ctx: &ToolContext) -> Result<Value> {
        let expression = input["expression"]
            .as_str()
            .ok_or_else(|| Error::validation("expression", "must be a string"))?;
        let result = evaluate(expression)
            .map_err(|reason| Error::tool("calculator", reason))?;
        if !result.is_finite() {
            return Err(Error::tool("calculator", "result is not finite"));
        }
        Ok(json!({"result": result, "expression": expression}))
    }
}

struct Parser<'a> {
    chars: std::iter::Peekable<std::str::Chars<'a>>,
}

/// Evaluate an expression, or explain why it is malformed.
fn evaluate(expression: &str) -> std::result::Result<f64, String> {
    let mut parser = Parser {
        chars: expression.chars().peekable(),
    };
    let value = parser.expr()?;
    parser.skip_whitespace();
    match parser.chars.peek() {
        None => Ok(value),
        Some(c) => Err(format!("unexpected character '{}'", c)),
    }
}

impl Parser<'_> {
    fn skip_whitespace(&mut self) {
        while matches!(self.chars.peek(), Some(c) if c.is_whitespace()) {
            self.chars.next();
        }
    }

    fn expr(&mut self) -> std::result::Result<f64, String> {
        let mut value = self.term()?;
        loop {
            self.skip_whitespace();
            match self.chars.peek() {
                Some('+') => {
                    self.chars.next();
                    value += self.term()?;
                }
                Some('-') => {
                    self.chars.next();
                    value -= self.term()?;
                }
                _ => return Ok(value),
            }
        }
    }

    fn term(&mut self) -> std::result::Result<f64, String> {
        let mut value = self.power()?;
        loop {
            self.skip_whitespace();
            match self.chars.peek() {
                Some('*') => {
                    self.chars.next();
                    value *= self.power()?;
                }
                Some('/') => {
                    self.chars.next();
                    let divisor = self.power()?;
                    if divisor == 0.0 {
                        return Err("division by zero".to_string());
                    }
                    value /= divisor;
                }
                Some('%') => {
                    self.chars.next();
                    let divisor = self.power()?;
                    if divisor == 0.0 {
                        return Err("division by zero".to_string());
                    }
                    value %= divisor;
                }
                _ => return Ok(value),
            }
        }
    }

    fn power(&mut self) -> std::result::Result<f64, String> {
        let base = self.unary()?;
        self.skip_whitespace();
        if matches!(self.chars.peek(), Some('^')) {
            self.chars.next();
            // Right associative.
            let exponent = self.power()?;
            return Ok(base.powf(exponent));
        }
        Ok(base)
    }

    fn unary(&mut self) -> std::result::Result<f64, String> {
        self.skip_whitespace();
        match self.chars.peek() {
            Some('-') => {
                self.chars.next();
                Ok(-self.unary()?)
            }
            Some('+') => {
                self.chars.next();
                self.unary()
            }
            _ => self.atom(),
        }
    }

    fn atom(&mut self) -> std::result::Result<f64, String> {
        self.skip_whitespace();
        match self.chars.peek() {
            Some('(') => {
                self.chars.next();
                let value = self.expr()?;
                self.skip_whitespace();
                match self.chars.next() {
                    Some(')') => Ok(value),
                    _ => Err("missing closing parenthesis".to_string()),
                }
            }
            Some(c) if c.is_ascii_digit() || *c == '.' => {
                let mut number = String::new();
                while matches!(self.chars.peek(), Some(c) if c.is_ascii_digit() || *c == '.') {
                    number.push(self.chars.next().expect("peeked"));
                }
                number
                    .parse::<f64>()
                    .map_err(|_| format!("bad number '{}'", number))
            }
            Some(c) => Err(format!("unexpected character '{}'", c)),
            None => Err("unexpected end of expression".to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::access::UserContext;
    use std::time::Duration;
    use uuid::Uuid;

    fn ctx() -> ToolContext {
        ToolContext::new(UserContext::new(Uuid::new_v4()), Duration::from_secs(5))
    }

    #[test]
    fn test_precedence_and_parentheses() {
        assert_eq!(evaluate("2 + 3 * 4").unwrap(), 14.0);
        assert_eq!(evaluate("(2 + 3) * 4").unwrap(), 20.0);
        assert_eq!(evaluate("10 - 4 - 3").unwrap(), 3.0);
        assert_eq!(evaluate("2 ^ 3 ^ 2").unwrap(), 512.0);
        assert_eq!(evaluate("-3 + 5").unwrap(), 2.0);
        assert_eq!(evaluate("10 % 3").unwrap(), 1.0);
    }

    #[test]
    fn test_malformed_expressions() {
        assert!(evaluate("2 +").is_err());
        assert!(evaluate("(1 + 2").is_err());
        assert!(evaluate("1 / 0").is_err());
        assert!(evaluate("two plus two").is_err());
        assert!(evaluate("1 2").is_err());
    }

    #[tokio::test]
    async fn test_tool_contract() {
        let tool = CalculatorTool::new();
        let output = tool
            .execute(serde_json::json!({"expression": "6 * 7"}), &ctx())
            .await
            .unwrap();
        assert_eq!(output["result"], 42.0);
    }

    #[tokio::test]
    async fn test_tool_surfaces_malformed_input() {
        let tool = CalculatorTool::new();
        let err = tool
            .execute(serde_json::json!({"expression": "what?"}), &ctx())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ToolExecution { .. }));
    }
}
