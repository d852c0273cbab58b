//! Intent router (C7), a full port of `agent_router.py::AgentRouter`.
//! Routes free-text task descriptions to one of five static agent roles
//! using keyword classification, skill-match scoring, and cost
//! optimization, with a short-TTL decision cache and delegation-marker
//! parsing for downstream agent hand-offs.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use md5::{Digest, Md5};
use regex::Regex;
use serde::{Deserialize, Serialize};

const CACHE_TTL: Duration = Duration::from_secs(300);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Intent {
    Security,
    ComplexDevelopment,
    Development,
    Database,
    Planning,
    General,
}

impl Intent {
    fn description(self) -> &'static str {
        match self {
            Intent::Security => "Security audit requested",
            Intent::ComplexDevelopment => {
                "Complex coding task routed to the elite coder (SOTA benchmarks)"
            }
            Intent::Development => "Development task",
            Intent::Planning => "Planning/coordination task",
            Intent::Database => "Database query",
            Intent::General => "General inquiry",
        }
    }

    fn is_simple(self) -> bool {
        matches!(self, Intent::Database | Intent::General)
    }
}

struct AgentSpec {
    id: &'static str,
    name: &'static str,
    model: &'static str,
    cost_per_token: f64,
    skills: &'static [&'static str],
}

/// Five static roles, renamed from the original's chat-persona names
/// (`project_manager`/`coder_agent`/`elite_coder`/`hacker_agent`/
/// `database_agent`) to role names that describe what each does.
const AGENTS: &[AgentSpec] = &[
    AgentSpec {
        id: "planner",
        name: "Planner",
        model: "claude-opus-4-6",
        cost_per_token: 0.015,
        skills: &[
            "task_decomposition", "timeline_estimation", "quality_assurance",
            "client_communication", "team_coordination", "agent_coordination",
            "workflow_optimization",
        ],
    },
    AgentSpec {
        id: "simple-coder",
        name: "Simple Coder",
        model: "claude-sonnet-4-20250514",
        cost_per_token: 0.003,
        skills: &[
            "nextjs", "fastapi", "typescript", "tailwind", "postgresql",
            "supabase", "clean_code", "testing", "code_analysis",
            "function_calling", "git_automation",
        ],
    },
    AgentSpec {
        id: "elite-coder",
        name: "Elite Coder",
        model: "m2.5",
        cost_per_token: 0.0003,
        skills: &[
            "complex_coding", "multi_file_refactor", "architecture_implementation",
            "nextjs", "fastapi", "typescript", "python", "full_stack",
            "swe_bench", "deep_reasoning", "code_review", "system_design",
            "large_codebase", "debugging_complex",
        ],
    },
    AgentSpec {
        id: "security-auditor",
        name: "Security Auditor",
        model: "claude-sonnet-4-20250514",
        cost_per_token: 0.003,
        skills: &[
            "security_scanning", "vulnerability_assessment", "penetration_testing",
            "owasp", "security_best_practices", "threat_modeling",
            "secure_architecture", "rls_audit", "database_security",
        ],
    },
    AgentSpec {
        id: "data-agent",
        name: "Data Agent",
        model: "claude-haiku-4-5-20251001",
        cost_per_token: 0.0005,
        skills: &[
            "supabase_queries", "query_database", "sql_execution", "data_analysis",
            "schema_exploration", "rls_policy_analysis", "real_time_subscriptions",
            "transaction_handling", "data_validation",
        ],
    },
];

const SECURITY_KEYWORDS: &[&str] = &[
    "security", "vulnerability", "exploit", "penetration", "audit",
    "xss", "csrf", "injection", "pentest", "hack", "breach",
    "secure", "threat", "attack", "threat_modeling", "risk",
    "malware", "payload", "sanitize", "encrypt", "cryptography",
    "authentication", "authorization", "access control", "sql injection",
    "rls", "row_level_security", "policy",
];

const DEVELOPMENT_KEYWORDS: &[&str] = &[
    "code", "implement", "function", "fix", "bug", "api", "endpoint",
    "build", "typescript", "fastapi", "python", "javascript", "react",
    "nextjs", "database", "query", "schema", "testing", "test",
    "deploy", "deployment", "frontend", "backend", "full-stack",
    "refactor", "refactoring", "clean_code", "git", "repository",
    "json", "yaml", "xml", "rest", "graphql", "websocket",
    "console", "log", "debug", "print", "component", "page", "route",
    "css", "html", "style", "render", "hook", "state", "props",
];

const DATABASE_KEYWORDS: &[&str] = &[
    "query", "fetch", "select", "insert", "update", "delete", "table",
    "column", "row", "data", "supabase", "postgresql", "postgres", "sql",
    "database", "appointments", "clients", "services", "transactions",
    "orders", "customers", "call_logs", "schema", "rls", "subscription",
    "real_time",
];

const PLANNING_KEYWORDS: &[&str] = &[
    "plan", "timeline", "schedule", "roadmap", "strategy", "architecture",
    "design", "approach", "workflow", "process", "milestone", "deadline",
    "estimate", "estimation", "breakdown", "decompose", "coordinate",
    "manage", "organize", "project", "phase", "sprint", "agile",
];

const COMPLEX_CODE_KEYWORDS: &[&str] = &[
    "refactor", "architecture", "redesign", "multi-file", "system design",
    "complex", "large", "rewrite", "migrate", "optimize", "performance",
    "algorithm", "data structure", "design pattern", "abstraction",
    "inheritance", "polymorphism", "interface", "module", "package",
    "monorepo", "microservice", "integration", "full-stack", "end-to-end",
    "debug complex", "race condition", "memory leak", "deadlock",
    "concurrent", "async", "parallel", "distributed",
];

fn is_word_char(c: char) -> bool {
    c.is_alphanumeric() || c == '_'
}

/// Keyword matching rule (case-insensitive, `query` must already be
/// lowercased): a keyword containing a space is a plain substring match; a
/// keyword of length ≤ 3 requires word boundaries on both sides; anything
/// longer only requires a word boundary before it (left-anchored prefix).
pub fn match_keyword(query: &str, keyword: &str) -> bool {
    if keyword.contains(' ') {
        return query.contains(keyword);
    }
    let mut start = 0;
    while let Some(rel) = query[start..].find(keyword) {
        let abs = start + rel;
        let before_ok = abs == 0 || !is_word_char(query[..abs].chars().next_back().unwrap());
        let end = abs + keyword.len();
        if before_ok {
            if keyword.len() <= 3 {
                let after_ok = end == query.len() || !is_word_char(query[end..].chars().next().unwrap());
                if after_ok {
                    return true;
                }
            } else {
                return true;
            }
        }
        start = abs + 1;
    }
    false
}

fn count_matches(query: &str, keywords: &[&str]) -> usize {
    keywords.iter().filter(|kw| match_keyword(query, kw)).count()
}

/// Tie-break order, ported 1:1 from `_classify_intent`.
fn classify_intent(query: &str) -> Intent {
    let security_count = count_matches(query, SECURITY_KEYWORDS);
    let dev_count = count_matches(query, DEVELOPMENT_KEYWORDS);
    let db_count = count_matches(query, DATABASE_KEYWORDS);
    let planning_count = count_matches(query, PLANNING_KEYWORDS);
    let complex_count = count_matches(query, COMPLEX_CODE_KEYWORDS);

    if complex_count >= 2 {
        return Intent::ComplexDevelopment;
    }
    if db_count > 0 && db_count >= dev_count && db_count >= security_count {
        Intent::Database
    } else if security_count > 0 && security_count >= dev_count && security_count >= planning_count {
        Intent::Security
    } else if dev_count > 0 && dev_count >= planning_count {
        if complex_count > 0 {
            Intent::ComplexDevelopment
        } else {
            Intent::Development
        }
    } else if complex_count > 0 {
        Intent::ComplexDevelopment
    } else if planning_count > 0 {
        Intent::Planning
    } else {
        Intent::General
    }
}

fn extract_keywords(query: &str) -> Vec<String> {
    SECURITY_KEYWORDS
        .iter()
        .chain(DEVELOPMENT_KEYWORDS)
        .chain(DATABASE_KEYWORDS)
        .chain(PLANNING_KEYWORDS)
        .chain(COMPLEX_CODE_KEYWORDS)
        .filter(|kw| match_keyword(query, kw))
        .map(|kw| kw.to_string())
        .collect()
}

fn intent_match(agent_id: &str, intent: Intent) -> f64 {
    match intent {
        Intent::General => if agent_id == "planner" { 1.0 } else { 0.3 },
        Intent::Database => match agent_id {
            "data-agent" => 1.0,
            "simple-coder" => 0.6,
            "security-auditor" => 0.4,
            _ => 0.1,
        },
        Intent::Security => match agent_id {
            "security-auditor" => 1.0,
            "simple-coder" => 0.5,
            "data-agent" => 0.4,
            _ => 0.2,
        },
        Intent::ComplexDevelopment => match agent_id {
            "elite-coder" => 0.95,
            "simple-coder" => 0.5,
            "planner" => 0.4,
            "security-auditor" => 0.3,
            _ => 0.2,
        },
        Intent::Development => match agent_id {
            "simple-coder" => 1.0,
            "elite-coder" => 0.4,
            "data-agent" => 0.5,
            "security-auditor" => 0.4,
            _ => 0.3,
        },
        Intent::Planning => match agent_id {
            "planner" => 1.0,
            "simple-coder" => 0.4,
            _ => 0.2,
        },
    }
}

fn skill_match(agent: &AgentSpec, keywords: &[String]) -> f64 {
    if keywords.is_empty() {
        return 0.0;
    }
    let matches = keywords
        .iter()
        .filter(|kw| agent.skills.iter().any(|skill| kw.contains(skill) || skill.contains(kw.as_str())))
        .count();
    (matches as f64 / keywords.len() as f64).min(1.0)
}

fn score_agents(intent: Intent, keywords: &[String]) -> HashMap<&'static str, f64> {
    AGENTS
        .iter()
        .map(|agent| {
            let score = intent_match(agent.id, intent) * 0.6 + skill_match(agent, keywords) * 0.3 + 1.0 * 0.1;
            (agent.id, score.clamp(0.0, 1.0))
        })
        .collect()
}

fn cost_scores(intent: Option<Intent>, keyword_count: usize) -> HashMap<&'static str, f64> {
    let is_simple = keyword_count <= 2 && intent.map(Intent::is_simple).unwrap_or(false);
    let is_moderate = keyword_count <= 5;

    AGENTS
        .iter()
        .map(|agent| {
            let cost_factor = 1.0 / (1.0 + agent.cost_per_token * 1000.0);
            let score = if is_simple && agent.id == "data-agent" {
                0.95 * cost_factor
            } else if is_moderate && matches!(agent.id, "simple-coder" | "security-auditor" | "elite-coder") {
                0.85 * cost_factor
            } else if agent.id == "planner" {
                0.80 * cost_factor
            } else {
                0.5 * cost_factor
            };
            (agent.id, score)
        })
        .collect()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutingDecision {
    pub agent_role: String,
    pub confidence: f64,
    pub reason: String,
    pub intent: Intent,
    pub keywords: Vec<String>,
    pub cost_score: f64,
    pub semantic_score: f64,
    pub cached: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Delegation {
    pub agent_role: String,
    pub task: String,
    pub source: String,
}

struct CacheEntry {
    decision: RoutingDecision,
    inserted_at: Instant,
}

/// Routes task text to an agent role. Keyword scoring is always available;
/// semantic scoring is left at 0 since no embedding backend is wired in
/// (the original falls back to keyword-only routing identically when
/// embeddings are unavailable).
pub struct IntentRouter {
    cache: Mutex<HashMap<String, CacheEntry>>,
}

impl IntentRouter {
    pub fn new() -> Self {
        Self {
            cache: Mutex::new(HashMap::new()),
        }
    }

    pub fn route(&self, query: &str) -> RoutingDecision {
        let normalized = query.to_lowercase();

        if let Some(cached) = self.cached_decision(&normalized) {
            let mut decision = cached;
            decision.cached = true;
            return decision;
        }

        let intent = classify_intent(&normalized);
        let keywords = extract_keywords(&normalized);
        let keyword_scores = score_agents(intent, &keywords);
        let costs = cost_scores(Some(intent), keywords.len());

        let mut combined: Vec<(&'static str, f64)> = AGENTS
            .iter()
            .map(|agent| {
                let keyword_score = keyword_scores.get(agent.id).copied().unwrap_or(0.0);
                let cost_score = costs.get(agent.id).copied().unwrap_or(0.0);
                (agent.id, keyword_score * 0.60 + cost_score * 0.15)
            })
            .collect();
        combined.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap());

        let (agent_id, raw_confidence) = combined.first().copied().unwrap_or(("planner", 0.5));
        let confidence = (raw_confidence * 100.0).round() / 100.0;
        // Matches the original's quirk of recomputing the cost score with
        // no intent/keyword context for the decision's reported field.
        let cost_score = cost_scores(None, 0).get(agent_id).copied().unwrap_or(0.0);
        let reason = build_reason(intent, &keywords, agent_id, confidence);

        let decision = RoutingDecision {
            agent_role: agent_id.to_string(),
            confidence,
            reason,
            intent,
            keywords,
            cost_score,
            semantic_score: 0.0,
            cached: false,
        };

        self.cache_decision(&normalized, decision.clone());
        decision
    }

    fn cached_decision(&self, normalized: &str) -> Option<RoutingDecision> {
        let key = query_hash(normalized);
        let mut cache = self.cache.lock().expect("routing cache poisoned");
        let entry = cache.get(&key)?;
        if entry.inserted_at.elapsed() > CACHE_TTL {
            cache.remove(&key);
            return None;
        }
        Some(entry.decision.clone())
    }

    fn cache_decision(&self, normalized: &str, decision: RoutingDecision) {
        let key = query_hash(normalized);
        let mut cache = self.cache.lock().expect("routing cache poisoned");
        cache.insert(
            key,
            CacheEntry {
                decision,
                inserted_at: Instant::now(),
            },
        );
    }

    /// Recovers `[DELEGATE:<id>]...[/DELEGATE]` markers from an upstream
    /// agent's free-text response.
    pub fn parse_delegations(&self, text: &str) -> Vec<Delegation> {
        let pattern = Regex::new(r"(?s)\[DELEGATE:(\w+)\](.*?)\[/DELEGATE\]").expect("valid regex");
        let valid_roles: Vec<&str> = AGENTS.iter().map(|a| a.id).collect();

        pattern
            .captures_iter(text)
            .filter_map(|caps| {
                let role = caps.get(1)?.as_str().trim().to_string();
                let task = caps.get(2)?.as_str().trim().to_string();
                if task.is_empty() || !valid_roles.contains(&role.as_str()) {
                    return None;
                }
                Some(Delegation {
                    agent_role: role,
                    task,
                    source: "delegation".to_string(),
                })
            })
            .collect()
    }
}

impl Default for IntentRouter {
    fn default() -> Self {
        Self::new()
    }
}

fn query_hash(query: &str) -> String {
    let mut hasher = Md5::new();
    hasher.update(query.as_bytes());
    format!("{:x}", hasher.finalize())
}

fn build_reason(intent: Intent, keywords: &[String], agent_id: &str, confidence: f64) -> String {
    let agent_name = AGENTS.iter().find(|a| a.id == agent_id).map(|a| a.name).unwrap_or(agent_id);
    let intent_desc = intent.description();
    if keywords.is_empty() {
        format!("{intent_desc} (no keywords) -> {agent_name} (confidence: {:.0}%)", confidence * 100.0)
    } else {
        let shown = keywords.iter().take(3).cloned().collect::<Vec<_>>().join(", ");
        let suffix = if keywords.len() > 3 {
            format!(" +{} more", keywords.len() - 3)
        } else {
            String::new()
        };
        format!(
            "{intent_desc} with keywords [{shown}{suffix}] -> {agent_name} (confidence: {:.0}%)",
            confidence * 100.0
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keyword_matching_modes() {
        assert!(match_keyword("run a sql injection test", "sql injection"));
        assert!(match_keyword("check the api", "api"));
        assert!(!match_keyword("therapist", "api"));
        assert!(match_keyword("refactoring the module", "refactor"));
        assert!(!match_keyword("prefixed", "fix"));
    }

    #[test]
    fn classifies_security_intent() {
        let intent = classify_intent("run a penetration test and check for xss vulnerability");
        assert_eq!(intent, Intent::Security);
    }

    #[test]
    fn two_complex_keywords_wins_regardless_of_other_counts() {
        let intent = classify_intent("refactor this large architecture, query the database");
        assert_eq!(intent, Intent::ComplexDevelopment);
    }

    #[test]
    fn routes_database_query_to_data_agent() {
        let router = IntentRouter::new();
        let decision = router.route("select rows from the customers table");
        assert_eq!(decision.agent_role, "data-agent");
        assert!(!decision.cached);
    }

    #[test]
    fn second_identical_query_is_served_from_cache() {
        let router = IntentRouter::new();
        router.route("plan the roadmap for next sprint");
        let decision = router.route("plan the roadmap for next sprint");
        assert!(decision.cached);
    }

    #[test]
    fn parses_delegation_markers() {
        let router = IntentRouter::new();
        let text = "[DELEGATE:security-auditor]audit the login endpoint[/DELEGATE] some prose [DELEGATE:bogus-role]ignored[/DELEGATE]";
        let delegations = router.parse_delegations(text);
        assert_eq!(delegations.len(), 1);
        assert_eq!(delegations[0].agent_role, "security-auditor");
        assert_eq!(delegations[0].task, "audit the login endpoint");
    }
}
