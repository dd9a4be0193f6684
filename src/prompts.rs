//! Embedded prompts and response schemas
//!
//! Compiled into the binary; the LLM CLI receives the schemas for
//! constrained decoding.

/// Role preamble for think cycles
pub const THINK_PREAMBLE: &str = r#"You are the supervisor brain for a personal compute host running a portfolio of software projects. You observe system state and recommend actions on coding sessions. You never execute anything yourself: every recommendation is validated against an autonomy policy before anything happens.

Recommend conservatively. Prefer skip over action when evidence is thin. One session per project; respect the concurrency and memory limits shown in the state below."#;

/// Extra instructions appended per autonomy level
pub fn autonomy_instructions(level: crate::domain::AutonomyLevel) -> &'static str {
    use crate::domain::AutonomyLevel;
    match level {
        AutonomyLevel::Observe => {
            "Autonomy level: observe. Nothing you recommend will execute; recommendations are surfaced to the operator as information only."
        }
        AutonomyLevel::Cautious => {
            "Autonomy level: cautious. Only start and notify will execute; stop and restart are blocked by policy."
        }
        AutonomyLevel::Moderate => "Autonomy level: moderate. start, stop, restart and notify may execute.",
        AutonomyLevel::Full => "Autonomy level: full. All actions may execute.",
    }
}

/// Scoring rubric for session evaluation
pub const EVAL_RUBRIC: &str = r#"Score this coding session 1-5 against the rubric:
5 - Excellent: clear goal achieved, multiple meaningful commits, tests or verification visible in output.
4 - Good: solid progress, at least one substantive commit, no signs of thrashing.
3 - Mixed: some progress but incomplete, or commits of unclear value.
2 - Poor: little progress, repeated errors in output, no useful commits.
1 - Failed: no commits and output shows the session stuck, crashed, or off-task.

Judge on the objective evidence first (commits, diff stats), the captured output second. If the project has no git repository, judge on output alone.
Recommendation: continue (more sessions useful), retry (same goal, fresh attempt), escalate (needs the operator), complete (goal done)."#;

/// JSON schema for the think-cycle response (constrained decoding)
pub fn think_response_schema() -> serde_json::Value {
    serde_json::json!({
        "type": "object",
        "required": ["summary", "recommendations"],
        "properties": {
            "summary": { "type": "string" },
            "recommendations": {
                "type": "array",
                "items": {
                    "type": "object",
                    "required": ["project", "action", "reason"],
                    "properties": {
                        "project": { "type": "string" },
                        "action": { "type": "string", "enum": ["start", "stop", "restart", "notify", "skip"] },
                        "reason": { "type": "string" },
                        "prompt": { "type": "string" },
                        "confidence": { "type": "number", "minimum": 0, "maximum": 1 },
                        "notificationTier": { "type": "integer", "minimum": 1, "maximum": 4 }
                    }
                }
            },
            "nextThinkInSec": { "type": "integer", "minimum": 0 }
        }
    })
}

/// JSON schema for the evaluation response (constrained decoding)
pub fn eval_response_schema() -> serde_json::Value {
    serde_json::json!({
        "type": "object",
        "required": ["score", "recommendation", "reasoning"],
        "properties": {
            "score": { "type": "integer", "minimum": 1, "maximum": 5 },
            "recommendation": { "type": "string", "enum": ["continue", "retry", "escalate", "complete"] },
            "accomplishments": { "type": "array", "items": { "type": "string" } },
            "failures": { "type": "array", "items": { "type": "string" } },
            "reasoning": { "type": "string" }
        }
    })
}

/// Response-format section appended to every think prompt
pub const RESPONSE_FORMAT: &str = r#"Respond with JSON only, matching:
{
  "summary": "one-line situation summary",
  "recommendations": [
    {"project": "name", "action": "start|stop|restart|notify|skip", "reason": "why", "prompt": "optional seed prompt", "confidence": 0.0, "notificationTier": 3}
  ],
  "nextThinkInSec": 600
}
Omit nextThinkInSec to keep the default cadence. An empty recommendations array is a valid answer."#;
