//! Configuration surface (semantic, not a loader).
//!
//! Loading these structs from a file or environment is explicitly out of
//! scope for this crate; this module owns only their shape plus validation
//! helpers such as "chain has zero stages". Builder methods follow a
//! `with_*`-consuming-`self` convention (e.g.
//! `Orchestration::new(...).with_mode(...)`).

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::model::SuccessPolicy;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorGuardrails {
    pub max_concurrent_sub_agents: u32,
    pub per_agent_timeout_secs: u64,
    pub total_budget_secs: u64,
}

impl Default for OrchestratorGuardrails {
    fn default() -> Self {
        OrchestratorGuardrails {
            max_concurrent_sub_agents: 4,
            per_agent_timeout_secs: 120,
            total_budget_secs: 600,
        }
    }
}

impl OrchestratorGuardrails {
    /// All `<= 0` values fall back to positive defaults (§5 Timeouts).
    pub fn clamped(&self) -> OrchestratorGuardrails {
        let d = OrchestratorGuardrails::default();
        OrchestratorGuardrails {
            max_concurrent_sub_agents: if self.max_concurrent_sub_agents == 0 {
                d.max_concurrent_sub_agents
            } else {
                self.max_concurrent_sub_agents
            },
            per_agent_timeout_secs: if self.per_agent_timeout_secs == 0 {
                d.per_agent_timeout_secs
            } else {
                self.per_agent_timeout_secs
            },
            total_budget_secs: if self.total_budget_secs == 0 {
                d.total_budget_secs
            } else {
                self.total_budget_secs
            },
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GlobalDefaults {
    pub llm_provider: String,
    pub backend: String,
    pub iteration_strategy: String,
    pub max_iterations: u32,
    pub success_policy: SuccessPolicy,
    pub orchestrator_guardrails: OrchestratorGuardrails,
    pub runbook_content: String,
}

impl Default for GlobalDefaults {
    fn default() -> Self {
        GlobalDefaults {
            llm_provider: "default-provider".into(),
            backend: "default-backend".into(),
            iteration_strategy: "react".into(),
            max_iterations: 10,
            success_policy: SuccessPolicy::Any,
            orchestrator_guardrails: OrchestratorGuardrails::default(),
            runbook_content: String::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AgentKind {
    React,
    Native,
    Synthesis,
    Orchestrator,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    pub name: String,
    pub kind: AgentKind,
    pub llm_provider: Option<String>,
    pub backend: Option<String>,
    pub iteration_strategy: Option<String>,
    pub sub_agents: Option<Vec<String>>,
    pub orchestrator_guardrails: Option<OrchestratorGuardrails>,
}

impl AgentConfig {
    pub fn new(name: impl Into<String>, kind: AgentKind) -> Self {
        AgentConfig {
            name: name.into(),
            kind,
            llm_provider: None,
            backend: None,
            iteration_strategy: None,
            sub_agents: None,
            orchestrator_guardrails: None,
        }
    }

    pub fn with_sub_agents(mut self, sub_agents: Vec<String>) -> Self {
        self.sub_agents = Some(sub_agents);
        self
    }

    pub fn with_guardrails(mut self, g: OrchestratorGuardrails) -> Self {
        self.orchestrator_guardrails = Some(g);
        self
    }

    pub fn is_orchestrator(&self) -> bool {
        self.kind == AgentKind::Orchestrator
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmProviderConfig {
    pub name: String,
    pub backend: String,
    pub native_tools: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct McpServerConfig {
    pub name: String,
    pub tools: Option<Vec<String>>,
}

/// Per-agent overrides attached to a stage entry in a chain.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StageAgentOverride {
    pub llm_provider: Option<String>,
    pub backend: Option<String>,
    pub iteration_strategy: Option<String>,
    pub sub_agents: Option<Vec<String>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageConfig {
    pub name: String,
    /// Declared agent names; ignored when `replicas > 1`.
    pub agents: Vec<String>,
    pub replicas: u32,
    pub success_policy: Option<SuccessPolicy>,
    pub sub_agents_override: Option<Vec<String>>,
    /// Applies to every agent launched in this stage; lower precedence
    /// than an entry in `per_agent_overrides` keyed by that agent's name.
    #[serde(default)]
    pub overrides: Option<StageAgentOverride>,
    #[serde(default)]
    pub per_agent_overrides: HashMap<String, StageAgentOverride>,
}

impl StageConfig {
    pub fn single(name: impl Into<String>, agent: impl Into<String>) -> Self {
        StageConfig {
            name: name.into(),
            agents: vec![agent.into()],
            replicas: 1,
            success_policy: None,
            sub_agents_override: None,
            overrides: None,
            per_agent_overrides: HashMap::new(),
        }
    }

    pub fn multi_agent(name: impl Into<String>, agents: Vec<String>) -> Self {
        StageConfig {
            name: name.into(),
            agents,
            replicas: 1,
            success_policy: None,
            sub_agents_override: None,
            overrides: None,
            per_agent_overrides: HashMap::new(),
        }
    }

    pub fn replicated(name: impl Into<String>, agent: impl Into<String>, replicas: u32) -> Self {
        StageConfig {
            name: name.into(),
            agents: vec![agent.into()],
            replicas,
            success_policy: None,
            sub_agents_override: None,
            overrides: None,
            per_agent_overrides: HashMap::new(),
        }
    }

    pub fn with_success_policy(mut self, policy: SuccessPolicy) -> Self {
        self.success_policy = Some(policy);
        self
    }

    pub fn with_sub_agents_override(mut self, sub_agents: Vec<String>) -> Self {
        self.sub_agents_override = Some(sub_agents);
        self
    }

    pub fn with_overrides(mut self, overrides: StageAgentOverride) -> Self {
        self.overrides = Some(overrides);
        self
    }

    pub fn with_per_agent_override(mut self, agent_name: impl Into<String>, overrides: StageAgentOverride) -> Self {
        self.per_agent_overrides.insert(agent_name.into(), overrides);
        self
    }

    /// Boundary behavior (§8): replicas=1 is indistinguishable from
    /// single-agent — no parallel tag.
    pub fn is_replicated(&self) -> bool {
        self.replicas > 1
    }

    pub fn declared_agent_count(&self) -> u32 {
        if self.is_replicated() {
            self.replicas
        } else {
            self.agents.len() as u32
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChainConfig {
    pub id: String,
    pub stages: Vec<StageConfig>,
    pub default_success_policy: Option<SuccessPolicy>,
    pub sub_agents_override: Option<Vec<String>>,
}

impl ChainConfig {
    pub fn new(id: impl Into<String>) -> Self {
        ChainConfig {
            id: id.into(),
            stages: Vec::new(),
            default_success_policy: None,
            sub_agents_override: None,
        }
    }

    pub fn stage(mut self, stage: StageConfig) -> Self {
        self.stages.push(stage);
        self
    }

    pub fn has_stages(&self) -> bool {
        !self.stages.is_empty()
    }

    /// Number of progress steps the chain will report: one per stage, one
    /// extra per multi-agent/replicated stage (its synthesis step), and
    /// one for the executive summary (§4.4 step 3).
    pub fn total_expected_steps(&self) -> u32 {
        let mut total = self.stages.len() as u32;
        for stage in &self.stages {
            if stage.declared_agent_count() > 1 {
                total += 1;
            }
        }
        total + 1
    }
}

#[derive(Debug, Clone, Default)]
pub struct Registries {
    pub agents: HashMap<String, AgentConfig>,
    pub llm_providers: HashMap<String, LlmProviderConfig>,
    pub chains: HashMap<String, ChainConfig>,
    pub mcp_servers: HashMap<String, McpServerConfig>,
}

impl Registries {
    pub fn chain(&self, id: &str) -> Option<&ChainConfig> {
        self.chains.get(id)
    }

    pub fn agent(&self, name: &str) -> Option<&AgentConfig> {
        self.agents.get(name)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    pub worker_count: u32,
    pub max_concurrent_sessions: u32,
    pub poll_interval_ms: u64,
    /// Symmetric jitter bound; `<= 0` yields exactly the base interval.
    pub poll_interval_jitter_ms: i64,
    pub session_timeout_secs: u64,
    pub graceful_shutdown_timeout_secs: u64,
    pub orphan_detection_interval_secs: u64,
    pub orphan_threshold_secs: u64,
    pub heartbeat_interval_secs: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        QueueConfig {
            worker_count: 4,
            max_concurrent_sessions: 16,
            poll_interval_ms: 1000,
            poll_interval_jitter_ms: 200,
            session_timeout_secs: 1800,
            graceful_shutdown_timeout_secs: 30,
            orphan_detection_interval_secs: 60,
            orphan_threshold_secs: 300,
            heartbeat_interval_secs: 10,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn total_expected_steps_counts_synthesis_and_summary() {
        let chain = ChainConfig::new("c1")
            .stage(StageConfig::single("Triage", "triage-agent"))
            .stage(StageConfig::multi_agent(
                "Diagnose",
                vec!["a".into(), "b".into()],
            ));
        // 2 stages + 1 synthesis (for the multi-agent stage) + 1 exec summary.
        assert_eq!(chain.total_expected_steps(), 4);
    }

    #[test]
    fn replicas_one_is_not_parallel() {
        let stage = StageConfig::replicated("Solo", "agent", 1);
        assert_eq!(stage.declared_agent_count(), 1);
    }

    #[test]
    fn guardrails_clamp_non_positive_values() {
        let g = OrchestratorGuardrails {
            max_concurrent_sub_agents: 0,
            per_agent_timeout_secs: 0,
            total_budget_secs: 0,
        };
        let clamped = g.clamped();
        assert!(clamped.max_concurrent_sub_agents > 0);
        assert!(clamped.per_agent_timeout_secs > 0);
        assert!(clamped.total_budget_secs > 0);
    }

    #[test]
    fn jitter_non_positive_yields_base_interval() {
        let cfg = QueueConfig {
            poll_interval_jitter_ms: 0,
            ..QueueConfig::default()
        };
        assert_eq!(cfg.poll_interval_jitter_ms, 0);
    }
}
