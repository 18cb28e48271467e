//! The default research topology.
//!
//! Five research topics, each a producer followed by its compactor, ending
//! in a decision stage that reads only the five summaries:
//!
//! ```text
//! user_query ─▶ market_agent ─▶ market_raw ─▶ market_summarizer ─▶ market_summary ─┐
//! user_query ─▶ finance_agent ─▶ ...                                                ├─▶ decision_agent ─▶ decision
//! ...                                                                              ─┘
//! ```
//!
//! The instruction texts are what [`ChatLogic`](crate::logic::ChatLogic)
//! sends as the system message for each stage.

use super::controller::PipelineBuilder;
use super::stage::{StageDescriptor, StageKind, StageLogic};
use crate::QUERY_KEY;
use crate::error::PipelineError;
use std::sync::Arc;

/// Output cap for every research compactor, in tokens.
pub const SUMMARY_TOKEN_CAP: usize = 180;

/// Key the decision stage writes.
pub const DECISION_KEY: &str = "decision";

/// Research topics in execution order.
pub const RESEARCH_TOPICS: [&str; 5] = ["market", "finance", "policy", "tech", "risk"];

pub fn raw_key(topic: &str) -> String {
    format!("{topic}_raw")
}

pub fn summary_key(topic: &str) -> String {
    format!("{topic}_summary")
}

/// The eleven stages of the research pipeline, with `cap` on every compactor.
pub fn research_stages(cap: usize) -> Vec<StageDescriptor> {
    let mut stages = Vec::with_capacity(RESEARCH_TOPICS.len() * 2 + 1);
    for topic in RESEARCH_TOPICS {
        stages.push(StageDescriptor::producer(
            format!("{topic}_agent"),
            [QUERY_KEY],
            raw_key(topic),
        ));
        stages.push(StageDescriptor::compactor(
            format!("{topic}_summarizer"),
            raw_key(topic),
            summary_key(topic),
            cap,
        ));
    }
    stages.push(StageDescriptor::synthesis(
        "decision_agent",
        RESEARCH_TOPICS.iter().map(|t| summary_key(t)),
        DECISION_KEY,
        None,
    ));
    stages
}

/// Builder preloaded with the research stages, every stage backed by the
/// logic `logic_for` picks for it.
pub fn research_pipeline<F>(cap: usize, logic_for: F) -> Result<PipelineBuilder, PipelineError>
where
    F: FnMut(&StageDescriptor) -> Option<Arc<dyn StageLogic>>,
{
    PipelineBuilder::new().descriptors(research_stages(cap), logic_for)
}

// ── Instructions ───────────────────────────────────────────────────

const MARKET_INSTRUCTION: &str = "\
You are a market research analyst.

Your job:
- Understand the user's topic.
- Research market size, growth rate, trends, major players, and demand drivers.
- Return clear, structured findings.";

const FINANCE_INSTRUCTION: &str = "\
You are a financial analyst.

Your job:
- Identify cost structure, margins, revenue models, and ROI for the topic.
- Explain assumptions clearly.
- Output practical, business-oriented insights.";

const POLICY_INSTRUCTION: &str = "\
You are a policy research analyst.

Research government, state, and regulatory policies for the given topic.
Focus on subsidies and incentives, regulations and compliance, national and
state programs, and risks from policy changes. Write in clear bullet points.";

const TECH_INSTRUCTION: &str = "\
You are a technology market analyst.

Research technology and infrastructure trends for the topic.
Focus on infrastructure, core technology, manufacturing processes, and
innovation or cost reductions.";

const RISK_INSTRUCTION: &str = "\
You are a risk analyst.

Identify major risks for the given business topic: market, financial,
regulatory, and technology or execution risks.";

const DECISION_INSTRUCTION: &str = "\
You are the final decision maker. You receive compressed research summaries.

Task:
1. Decide if the business or topic is viable.
2. Give a verdict (Yes/No/Maybe), the top 3 reasons, and clear next steps.

Write a short, structured decision.";

/// System instruction for a research stage.
///
/// Compactor instructions embed the stage's cap; unknown producer names get
/// a generic research instruction.
pub fn instruction_for(stage: &str, kind: StageKind, max_output_tokens: Option<usize>) -> String {
    match kind {
        StageKind::Compactor => format!(
            "You compress research output.\n\n\
             Rules:\n\
             - Keep only facts, numbers, trends\n\
             - Remove fluff and duplication\n\
             - <= {} tokens",
            max_output_tokens.unwrap_or(SUMMARY_TOKEN_CAP)
        ),
        StageKind::Synthesis => DECISION_INSTRUCTION.to_string(),
        StageKind::Producer => {
            let topic = stage.strip_suffix("_agent").unwrap_or(stage);
            match topic {
                "market" => MARKET_INSTRUCTION,
                "finance" => FINANCE_INSTRUCTION,
                "policy" => POLICY_INSTRUCTION,
                "tech" => TECH_INSTRUCTION,
                "risk" => RISK_INSTRUCTION,
                _ => "You are a research analyst. Return clear, structured findings on the topic.",
            }
            .to_string()
        }
    }
}
