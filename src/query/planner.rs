//! Query planner.
//!
//! Turns an analysis into an ordered step list: tool invocations followed
//! by a terminal synthesize step. Steps reference the plan by index, and
//! later steps may reference earlier outputs as "output of step k"; the
//! executor owns the cursor and the substitution.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::warn;
use uuid::Uuid;

use super::analyzer::{Complexity, QueryAnalysis};
use crate::tools::ToolRegistry;

/// Step kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepType {
    Tool,
    Synthesize,
}

/// One plan step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanStep {
    pub index: usize,
    pub step_type: StepType,
    /// Tool name for tool steps.
    pub tool: Option<String>,
    /// Input template; strings of the form "output of step k" are
    /// substituted by the executor.
    pub input: Value,
    pub description: String,
    /// Whether a synthesize step also consumes the chat history.
    #[serde(default)]
    pub use_history: bool,
}

/// An ordered plan for one query.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryPlan {
    pub id: Uuid,
    pub owner_id: Uuid,
    pub query: String,
    pub steps: Vec<PlanStep>,
    /// Executor's iteration cursor.
    pub cursor: usize,
    /// Per-step results, filled in execution order.
    pub results: Vec<Option<Value>>,
    pub completed: bool,
    /// Tools the analyzer wanted but the caller may not use.
    pub dropped_tools: Vec<String>,
}

impl QueryPlan {
    pub fn tool_steps(&self) -> impl Iterator<Item = &PlanStep> {
        self.steps.iter().filter(|s| s.step_type == StepType::Tool)
    }
}

/// Builds plans from analyses.
pub struct Planner {
    top_k: usize,
}

impl Planner {
    pub fn new(top_k: usize) -> Self {
        Self { top_k }
    }

    /// Emit the ordered step list.
    ///
    /// Simple: one `rag` step plus synthesize. Complex: per-tool steps in
    /// declared order, one `rag` step per sub-query, then a synthesize
    /// step flagged to consume history. Tools outside `permitted` are
    /// dropped with a warning recorded on the plan.
    pub fn build(
        &self,
        owner_id: Uuid,
        query: &str,
        analysis: &QueryAnalysis,
        registry: &ToolRegistry,
        permitted: &[String],
    ) -> QueryPlan {
        let mut steps = Vec::new();
        let mut dropped = Vec::new();

        let mut usable = Vec::new();
        for tool in &analysis.requires_tools {
            if !registry.contains(tool) || !permitted.iter().any(|p| p == tool) {
                warn!(tool = %tool, "tool dropped from plan");
                dropped.push(tool.clone());
            } else {
                usable.push(tool.clone());
            }
        }
        if !usable.iter().any(|t| t == "rag")
            && permitted.iter().any(|p| p == "rag")
            && registry.contains("rag")
        {
            // Retrieval is the backbone; a plan without context is only
            // acceptable when rag itself is forbidden.
            usable.insert(0, "rag".to_string());
        }

        // Simple plans run each tool once over the whole query; complex
        // plans additionally fan rag out over the sub-queries.
        let rag_queries: Vec<&str> = match analysis.complexity {
            Complexity::Complex if !analysis.sub_queries.is_empty() => {
                analysis.sub_queries.iter().map(String::as_str).collect()
            }
            _ => vec![query],
        };

        for tool in &usable {
            match tool.as_str() {
                "rag" => {
                    for sub_query in &rag_queries {
                        steps.push(PlanStep {
                            index: steps.len(),
                            step_type: StepType::Tool,
                            tool: Some("rag".to_string()),
                            input: json!({"query": sub_query, "top_k": self.top_k}),
                            description: format!("retrieve context for: {}", sub_query),
                            use_history: false,
                        });
                    }
                }
                "calculator" => {
                    steps.push(PlanStep {
                        index: steps.len(),
                        step_type: StepType::Tool,
                        tool: Some("calculator".to_string()),
                        input: json!({"expression": extract_expression(query)}),
                        description: "evaluate the arithmetic in the query".to_string(),
                        use_history: false,
                    });
                }
                other => {
                    steps.push(PlanStep {
                        index: steps.len(),
                        step_type: StepType::Tool,
                        tool: Some(other.to_string()),
                        input: json!({"entity": "documents"}),
                        description: format!("query structured data via {}", other),
                        use_history: false,
                    });
                }
            }
        }

        steps.push(PlanStep {
            index: steps.len(),
            step_type: StepType::Synthesize,
            tool: None,
            input: json!({"query": query}),
            description: "synthesize the final answer".to_string(),
            use_history: analysis.complexity == Complexity::Complex,
        });

        let step_count = steps.len();
        QueryPlan {
            id: Uuid::new_v4(),
            owner_id,
            query: query.to_string(),
            steps,
            cursor: 0,
            results: vec![None; step_count],
            completed: false,
            dropped_tools: dropped,
        }
    }
}

/// Pull the arithmetic expression out of a prose query, or hand the whole
/// query to the calculator to reject.
fn extract_expression(query: &str) -> String {
    let candidate: String = query
        .chars()
        .filter(|c| c.is_ascii_digit() || "+-*/%^(). ".contains(*c))
        .collect();
    let trimmed = candidate.trim();
    if trimmed.chars().any(|c| c.is_ascii_digit()) {
        trimmed.to_string()
    } else {
        query.to_string()
    }
}

/// Substitute "output of step k" references against collected results.
pub fn substitute_references(input: &Value, results: &[Option<Value>]) -> Value {
    match input {
        Value::String(s) => {
            let trimmed = s.trim();
            if let Some(rest) = trimmed.strip_prefix("output of step ") {
                if let Ok(index) = rest.trim().parse::<usize>() {
                    if let Some(Some(result)) = results.get(index) {
                        return result.clone();
                    }
                }
            }
            input.clone()
        }
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), substitute_references(v, results)))
                .collect(),
        ),
        Value::Array(items) => Value::Array(
            items
                .iter()
                .map(|v| substitute_references(v, results))
                .collect(),
        ),
        other => other.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::analyzer::classify_by_keywords;
    use crate::tools::{CalculatorTool, ToolRegistry};
    use std::sync::Arc;

    fn registry() -> ToolRegistry {
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(CalculatorTool::new()));
        registry
    }

    fn full_registry() -> ToolRegistry {
        registry()
    }

    fn analysis_simple() -> QueryAnalysis {
        QueryAnalysis {
            complexity: Complexity::Simple,
            requires_tools: vec!["rag".into()],
            sub_queries: vec![],
            reasoning: None,
            fallback: false,
        }
    }

    #[test]
    fn test_simple_plan_shape() {
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(CalculatorTool::new()));
        // rag missing from the registry: dropped, plan is synthesize-only.
        let plan = Planner::new(5).build(
            Uuid::new_v4(),
            "what is x?",
            &analysis_simple(),
            &registry,
            &["rag".to_string()],
        );
        assert_eq!(plan.steps.last().unwrap().step_type, StepType::Synthesize);
        assert_eq!(plan.dropped_tools, vec!["rag"]);
    }

    #[test]
    fn test_forbidden_tool_dropped_with_warning() {
        let registry = full_registry();
        let analysis = QueryAnalysis {
            complexity: Complexity::Complex,
            requires_tools: vec!["calculator".into()],
            sub_queries: vec![],
            reasoning: None,
            fallback: false,
        };
        let plan = Planner::new(5).build(
            Uuid::new_v4(),
            "compute 2 + 2",
            &analysis,
            &registry,
            &[], // nothing permitted
        );
        assert_eq!(plan.dropped_tools, vec!["calculator"]);
        assert_eq!(plan.tool_steps().count(), 0);
    }

    struct StubRag;

    #[async_trait::async_trait]
    impl crate::tools::Tool for StubRag {
        fn name(&self) -> &'static str {
            "rag"
        }

        fn description(&self) -> &'static str {
            "stub"
        }

        fn input_schema(&self) -> Value {
            json!({})
        }

        fn output_schema(&self) -> Value {
            json!({})
        }

        async fn execute(
            &self,
            _input: Value,
            _ctx: &crate::tools::ToolContext,
        ) -> crate::error::Result<Value> {
            Ok(json!({"chunks": []}))
        }
    }

    #[test]
    fn test_complex_plan_has_rag_per_sub_query_and_history_flag() {
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(CalculatorTool::new()));
        registry.register(Arc::new(StubRag));
        let analysis = QueryAnalysis {
            complexity: Complexity::Complex,
            requires_tools: vec!["calculator".into(), "rag".into()],
            sub_queries: vec!["first part".into(), "second part".into()],
            reasoning: None,
            fallback: false,
        };
        let plan = Planner::new(3).build(
            Uuid::new_v4(),
            "compare 1 + 1 and 2 + 2",
            &analysis,
            &registry,
            &["calculator".to_string(), "rag".to_string()],
        );
        let rag_steps: Vec<_> = plan
            .tool_steps()
            .filter(|s| s.tool.as_deref() == Some("rag"))
            .collect();
        assert_eq!(rag_steps.len(), 2, "one rag step per sub-query");
        assert_eq!(rag_steps[0].input["query"], "first part");
        assert_eq!(rag_steps[0].input["top_k"], 3);
        let calc_steps = plan
            .tool_steps()
            .filter(|s| s.tool.as_deref() == Some("calculator"))
            .count();
        assert_eq!(calc_steps, 1);
        let last = plan.steps.last().unwrap();
        assert_eq!(last.step_type, StepType::Synthesize);
        assert!(last.use_history);
    }

    #[test]
    fn test_keyword_analysis_to_plan_round_trip() {
        let registry = full_registry();
        let analysis = classify_by_keywords(
            "what is 6 * 7?",
            &["calculator".to_string()],
        );
        let plan = Planner::new(5).build(
            Uuid::new_v4(),
            "what is 6 * 7?",
            &analysis,
            &registry,
            &["calculator".to_string()],
        );
        assert!(plan
            .tool_steps()
            .any(|s| s.tool.as_deref() == Some("calculator")));
    }

    #[test]
    fn test_extract_expression() {
        assert_eq!(extract_expression("what is 12 * 7?"), "12 * 7");
        assert_eq!(extract_expression("no math here"), "no math here");
    }

    #[test]
    fn test_reference_substitution() {
        let results = vec![Some(json!({"result": 42}))];
        let input = json!({"value": "output of step 0", "other": "literal"});
        let substituted = substitute_references(&input, &results);
        assert_eq!(substituted["value"]["result"], 42);
        assert_eq!(substituted["other"], "literal");
    }

    #[test]
    fn test_unresolved_reference_left_verbatim() {
        let input = json!("output of step 9");
        let substituted = substitute_references(&input, &[]);
        assert_eq!(substituted, json!("output of step 9"));
    }

    #[test]
    fn test_step_indices_are_dense() {
        let registry = full_registry();
        let analysis = QueryAnalysis {
            complexity: Complexity::Complex,
            requires_tools: vec!["calculator".into()],
            sub_queries: vec![],
            reasoning: None,
            fallback: false,
        };
        let plan = Planner::new(5).build(
            Uuid::new_v4(),
            "compute 1+1",
            &analysis,
            &registry,
            &["calculator".to_string()],
        );
        for (i, step) in plan.steps.iter().enumerate() {
            assert_eq!(step.index, i);
        }
        assert_eq!(plan.results.len(), plan.steps.len());
    }
}
