//! Query analysis.
//!
//! Classifies a query as simple or complex, names the tools it needs, and
//! decomposes complex questions into sub-queries. The LLM does the
//! classification when available; a deterministic keyword classifier is
//! both the fallback and the test surface.

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::{Arc, LazyLock};
use tracing::{debug, warn};

use crate::llm::{parse_structured, GenerateRequest, LlmClient};

/// Query complexity classes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Complexity {
    Simple,
    Complex,
}

/// Analyzer output driving the planner.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryAnalysis {
    pub complexity: Complexity,
    /// Subset of registered tool names the query needs.
    pub requires_tools: Vec<String>,
    /// Decomposed sub-queries for complex questions.
    pub sub_queries: Vec<String>,
    pub reasoning: Option<String>,
    /// True when the LLM was unusable and the keyword classifier answered.
    pub fallback: bool,
}

static ARITHMETIC_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\d+(?:\.\d+)?\s*[-+*/%^]\s*\d+(?:\.\d+)?").expect("static regex")
});
static CALC_WORDS_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(calculate|compute|sum of|average of|how much is)\b").expect("static regex")
});
static DATABASE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(how many documents|list (?:my )?documents|my corpus|document count|analytics)\b")
        .expect("static regex")
});
static MULTI_PART_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(?:and also|as well as|compare|versus|vs\.?)\b").expect("static regex")
});

/// LLM-backed analyzer with a deterministic fallback.
pub struct QueryAnalyzer {
    llm: Arc<dyn LlmClient>,
}

impl QueryAnalyzer {
    pub fn new(llm: Arc<dyn LlmClient>) -> Self {
        Self { llm }
    }

    pub async fn analyze(&self, query: &str, available_tools: &[String]) -> QueryAnalysis {
        let schema = json!({
            "type": "object",
            "required": ["complexity", "requires_tools"],
            "properties": {
                "complexity": {"type": "string", "enum": ["simple", "complex"]},
                "requires_tools": {"type": "array", "items": {"type": "string"}},
                "sub_queries": {"type": "array", "items": {"type": "string"}},
                "reasoning": {"type": "string"}
            }
        });

        let request = GenerateRequest::new(format!(
            "Classify this query for a retrieval-augmented answering system.\n\
             Available tools: {}.\n\
             A query is complex when it needs multiple tools or multiple \
             retrieval passes; otherwise simple.\n\
             Respond with JSON: {{\"complexity\": \"simple\"|\"complex\", \
             \"requires_tools\": [names], \"sub_queries\": [strings], \
             \"reasoning\": \"...\"}}.\n\nQuery: {}",
            available_tools.join(", "),
            query
        ))
        .with_system("You analyze queries. Respond with JSON only.")
        .with_format(schema.clone());

        match self.llm.generate(request).await {
            Ok(response) => {
                let parsed = parse_structured(&response.text, &schema);
                if let Some(value) = parsed.value {
                    if let Some(analysis) = analysis_from_value(&value, available_tools) {
                        debug!(complexity = ?analysis.complexity, "analyzer classified query");
                        return analysis;
                    }
                }
                warn!("analyzer output unusable, using keyword classifier");
                classify_by_keywords(query, available_tools)
            }
            Err(e) => {
                warn!(error = %e, "analyzer LLM call failed, using keyword classifier");
                classify_by_keywords(query, available_tools)
            }
        }
    }
}

fn analysis_from_value(value: &serde_json::Value, available: &[String]) -> Option<QueryAnalysis> {
    let complexity = match value["complexity"].as_str()? {
        "simple" => Complexity::Simple,
        "complex" => Complexity::Complex,
        _ => return None,
    };
    let requires_tools: Vec<String> = value["requires_tools"]
        .as_array()?
        .iter()
        .filter_map(|v| v.as_str())
        .filter(|name| available.iter().any(|a| a == name))
        .map(String::from)
        .collect();
    let sub_queries = value["sub_queries"]
        .as_array()
        .map(|array| {
            array
                .iter()
                .filter_map(|v| v.as_str())
                .map(String::from)
                .collect()
        })
        .unwrap_or_default();
    Some(QueryAnalysis {
        complexity,
        requires_tools,
        sub_queries,
        reasoning: value["reasoning"].as_str().map(String::from),
        fallback: false,
    })
}

/// Deterministic classification from query surface patterns.
pub fn classify_by_keywords(query: &str, available_tools: &[String]) -> QueryAnalysis {
    let mut tools = Vec::new();
    let has = |name: &str| available_tools.iter().any(|t| t == name);

    if has("rag") {
        tools.push("rag".to_string());
    }
    if has("calculator") && (ARITHMETIC_RE.is_match(query) || CALC_WORDS_RE.is_match(query)) {
        tools.push("calculator".to_string());
    }
    if has("database") && DATABASE_RE.is_match(query) {
        tools.push("database".to_string());
    }

    let multi_part = MULTI_PART_RE.is_match(query);
    let sub_queries: Vec<String> = if multi_part {
        query
            .split(|c| c == '?' || c == ';')
            .map(str::trim)
            .filter(|part| !part.is_empty())
            .map(String::from)
            .collect()
    } else {
        Vec::new()
    };

    let complexity = if tools.len() > 1 || multi_part || sub_queries.len() > 1 {
        Complexity::Complex
    } else {
        Complexity::Simple
    };

    QueryAnalysis {
        complexity,
        requires_tools: tools,
        sub_queries,
        reasoning: Some("keyword classification".to_string()),
        fallback: true,
    }
}
