//! Stage runner / aggregator (§4.4.1): builds per-agent configs, fans
//! agents out in parallel, waits for all of them, and aggregates their
//! results via the stage's success policy.
//!
//! The fan-out-then-await-all pattern mirrors `execute_parallel`-style
//! orchestration: spawn one task per participant, collect every
//! `JoinHandle`, and only then aggregate — never early-return on the
//! first success, which would strand in-flight LLM/tool resources.

use chrono::Utc;
use std::collections::HashMap;

use crate::agent_invocation::{invoke_agent, AgentInvocationDeps, InvocationOutcome};
use crate::config::{ChainConfig, StageConfig};
use crate::ctx::TaskContext;
use crate::error::CoreError;
use crate::event::{publish_best_effort, ProgressEvent, StageStatusEvent};
use crate::model::{ParallelKind, Session, Stage, Status, SuccessPolicy};
use crate::store::NewStage;

/// One fully-configured agent launch within a stage: its declared
/// registry name and the display name it runs under (`{Base}-{i}` for
/// replicas, the declared name otherwise).
#[derive(Debug, Clone)]
pub struct AgentLaunchConfig {
    pub declared_name: String,
    pub display_name: String,
    /// 0-based launch index.
    pub launch_index: u32,
}

/// Builds N agent configs for a stage (§4.4.1 "Build configs"): replicas
/// all reference the sole declared agent; otherwise one config per
/// declared agent. A single-agent stage is N=1 with no branch downstream.
pub fn build_agent_configs(stage_config: &StageConfig) -> Vec<AgentLaunchConfig> {
    if stage_config.is_replicated() {
        let base = stage_config.agents.first().cloned().unwrap_or_default();
        (0..stage_config.replicas)
            .map(|i| AgentLaunchConfig {
                declared_name: base.clone(),
                display_name: format!("{}-{}", base, i + 1),
                launch_index: i,
            })
            .collect()
    } else {
        stage_config
            .agents
            .iter()
            .enumerate()
            .map(|(i, name)| AgentLaunchConfig {
                declared_name: name.clone(),
                display_name: name.clone(),
                launch_index: i as u32,
            })
            .collect()
    }
}

/// Stage override > configured default > fallback `any` (§4.4.1).
pub fn resolve_success_policy(stage_config: &StageConfig, chain: &ChainConfig) -> SuccessPolicy {
    stage_config
        .success_policy
        .or(chain.default_success_policy)
        .unwrap_or_default()
}

fn parallel_kind_for(stage_config: &StageConfig) -> Option<ParallelKind> {
    if stage_config.is_replicated() {
        Some(ParallelKind::Replica)
    } else if stage_config.agents.len() > 1 {
        Some(ParallelKind::MultiAgent)
    } else {
        None
    }
}

/// Clamps a 1-based index so clients never observe `current > total`
/// (§4.8).
pub fn clamp_progress(current: u32, total: u32) -> u32 {
    current.min(total.max(1))
}

pub struct StageOutcome {
    pub stage: Stage,
    pub status: Status,
    pub error_message: Option<String>,
    pub final_analysis: Option<String>,
    pub per_agent: Vec<(AgentLaunchConfig, InvocationOutcome)>,
}

/// Runs one stage to completion.
pub async fn run_stage(
    ctx: &TaskContext,
    deps: &AgentInvocationDeps,
    session: &Session,
    chain: &ChainConfig,
    stage_config: &StageConfig,
    db_stage_index: u32,
    prior_context: &str,
    total_expected_steps: u32,
    runbook_content: &str,
) -> Result<StageOutcome, CoreError> {
    let configs = build_agent_configs(stage_config);
    let n = configs.len() as u32;
    let policy = resolve_success_policy(stage_config, chain);

    let stage = deps
        .store
        .create_stage(
            NewStage {
                session_id: session.id.clone(),
                name: stage_config.name.clone(),
                index: db_stage_index,
                expected_agent_count: n,
                parallel_kind: parallel_kind_for(stage_config),
                success_policy: if n > 1 { Some(policy) } else { None },
                chat_id: None,
                chat_user_message_id: None,
            },
            Utc::now(),
        )
        .await?;

    deps.store
        .update_session_progress(&session.id, clamp_progress(db_stage_index, total_expected_steps), &stage.id)
        .await?;

    let stage_started_event = StageStatusEvent {
        session_id: session.id.clone(),
        stage_id: stage.id.clone(),
        stage_name: stage.name.clone(),
        stage_index: stage.index,
        status: None,
        timestamp: Utc::now(),
    };
    publish_best_effort("stage_status:started", || {
        deps.event_publisher.stage_status(&stage_started_event)
    })
    .await;
    let session_progress_event = ProgressEvent {
        session_id: session.id.clone(),
        current: clamp_progress(db_stage_index, total_expected_steps),
        total: total_expected_steps,
        timestamp: Utc::now(),
    };
    publish_best_effort("session_progress", || {
        deps.event_publisher.session_progress(&session_progress_event)
    })
    .await;

    // Fan-out then await all — never early-return on first success.
    let mut handles = Vec::with_capacity(configs.len());
    for config in configs {
        let ctx = ctx.clone();
        let deps_store = deps.store.clone();
        let deps_registries = deps.registries.clone();
        let deps_defaults = deps.defaults.clone();
        let deps_llm = deps.llm_client.clone();
        let deps_controllers = deps.controller_factory.clone();
        let deps_tool_factory = deps.tool_executor_factory.clone();
        let deps_events = deps.event_publisher.clone();
        let session = session.clone();
        let stage = stage.clone();
        let stage_config = stage_config.clone();
        let chain = chain.clone();
        let runbook_content = runbook_content.to_string();
        let prior_context = prior_context.to_string();

        let handle = tokio::spawn(async move {
            let deps = AgentInvocationDeps {
                store: deps_store,
                registries: deps_registries,
                defaults: deps_defaults,
                llm_client: deps_llm,
                controller_factory: deps_controllers,
                tool_executor_factory: deps_tool_factory,
                event_publisher: deps_events,
            };
            let outcome = invoke_agent(
                &ctx,
                &deps,
                &session,
                &stage,
                &stage_config,
                &chain,
                &config.declared_name,
                &config.display_name,
                config.launch_index,
                &runbook_content,
                &prior_context,
            )
            .await;
            (config, outcome)
        });
        handles.push(handle);
    }

    let mut results = Vec::with_capacity(handles.len());
    for handle in handles {
        match handle.await {
            Ok((config, Ok(outcome))) => results.push((config, outcome)),
            Ok((config, Err(e))) => {
                results.push((
                    config,
                    InvocationOutcome {
                        agent_execution_id: String::new(),
                        status: Status::Failed,
                        final_analysis: None,
                        error_message: Some(e.to_string()),
                    },
                ));
            }
            Err(join_err) => {
                log::error!("agent task panicked: {}", join_err);
            }
        }
    }

    // Re-order by launch index.
    results.sort_by_key(|(config, _)| config.launch_index);

    let (status, agg_error) = aggregate(&results, policy, n);

    let final_analysis = if n == 1 {
        results.first().and_then(|(_, o)| o.final_analysis.clone())
    } else {
        None // N>1 propagates only via synthesis (§4.4.1).
    };

    // Persist on a background context: the session context may already
    // be cancelled by the time this stage finishes (§4.4.1).
    let bg = TaskContext::background();
    let _ = &bg;
    deps.store
        .persist_stage_terminal(&stage.id, status, Utc::now(), agg_error.clone())
        .await?;
    let stage_terminal_event = StageStatusEvent {
        session_id: session.id.clone(),
        stage_id: stage.id.clone(),
        stage_name: stage.name.clone(),
        stage_index: stage.index,
        status: Some(status),
        timestamp: Utc::now(),
    };
    publish_best_effort("stage_status:terminal", || {
        deps.event_publisher.stage_status(&stage_terminal_event)
    })
    .await;

    Ok(StageOutcome {
        stage,
        status,
        error_message: agg_error,
        final_analysis,
        per_agent: results,
    })
}

/// Tallies agent results by mapped status bucket and applies the
/// success-policy truth table (§4.4.1).
fn aggregate(
    results: &[(AgentLaunchConfig, InvocationOutcome)],
    policy: SuccessPolicy,
    n: u32,
) -> (Status, Option<String>) {
    let mut counts: HashMap<Status, u32> = HashMap::new();
    for (_, o) in results {
        *counts.entry(o.status).or_insert(0) += 1;
    }
    let completed = *counts.get(&Status::Completed).unwrap_or(&0);
    let non_success = n - completed;

    let stage_completed = match policy {
        SuccessPolicy::All => non_success == 0,
        SuccessPolicy::Any => completed >= 1,
    };

    if stage_completed {
        return (Status::Completed, None);
    }

    let non_success_statuses: Vec<Status> = counts
        .iter()
        .filter(|(s, _)| **s != Status::Completed)
        .filter(|(_, c)| **c > 0)
        .map(|(s, _)| *s)
        .collect();
    let status = if non_success_statuses.len() == 1 {
        non_success_statuses[0]
    } else {
        Status::Failed
    };

    let error = Some(aggregate_error_message(results, policy, n));
    (status, error)
}

/// Builds the structured multi-agent failure message (§4.4.1 "Aggregate
/// error"): for N=1 the lone agent's error passes through unchanged; for
/// N>1 a header line plus one line per failed agent.
pub fn aggregate_error_message(
    results: &[(AgentLaunchConfig, InvocationOutcome)],
    policy: SuccessPolicy,
    n: u32,
) -> String {
    if n == 1 {
        return results
            .first()
            .and_then(|(_, o)| o.error_message.clone())
            .unwrap_or_else(|| "unknown error".to_string());
    }
    let failed: Vec<&(AgentLaunchConfig, InvocationOutcome)> = results
        .iter()
        .filter(|(_, o)| o.status != Status::Completed)
        .collect();
    let mut message = format!(
        "multi-agent stage failed: {}/{} executions failed (policy: {})",
        failed.len(),
        n,
        policy
    );
    for (config, outcome) in failed {
        message.push_str(&format!(
            "\n  - agent {} ({}): {}",
            config.launch_index + 1,
            outcome.status,
            outcome.error_message.as_deref().unwrap_or("unknown error")
        ));
    }
    message
}

#[cfg(test)]
mod tests {
    use super::*;

    fn outcome(status: Status, error: Option<&str>) -> InvocationOutcome {
        InvocationOutcome {
            agent_execution_id: "e".into(),
            status,
            final_analysis: None,
            error_message: error.map(|s| s.to_string()),
        }
    }

    fn launch(i: u32) -> AgentLaunchConfig {
        AgentLaunchConfig {
            declared_name: format!("agent-{}", i),
            display_name: format!("agent-{}", i),
            launch_index: i,
        }
    }

    #[test]
    fn build_agent_configs_replicates_the_sole_agent() {
        let stage = StageConfig::replicated("Diagnose", "investigator", 3);
        let configs = build_agent_configs(&stage);
        assert_eq!(configs.len(), 3);
        assert_eq!(configs[0].display_name, "investigator-1");
        assert_eq!(configs[2].display_name, "investigator-3");
    }

    #[test]
    fn single_agent_stage_is_not_parallel_tagged() {
        let stage = StageConfig::single("Triage", "triage-agent");
        assert!(parallel_kind_for(&stage).is_none());
    }

    #[test]
    fn policy_any_completes_with_one_success() {
        let results = vec![
            (launch(0), outcome(Status::Completed, None)),
            (launch(1), outcome(Status::Failed, Some("boom"))),
        ];
        let (status, err) = aggregate(&results, SuccessPolicy::Any, 2);
        assert_eq!(status, Status::Completed);
        assert!(err.is_none());
    }

    #[test]
    fn policy_all_fails_on_any_non_success() {
        let results = vec![
            (launch(0), outcome(Status::Completed, None)),
            (launch(1), outcome(Status::Failed, Some("boom"))),
        ];
        let (status, err) = aggregate(&results, SuccessPolicy::All, 2);
        assert_eq!(status, Status::Failed);
        assert!(err.unwrap().contains("1/2 executions failed"));
    }

    #[test]
    fn homogeneous_failures_prefer_specific_terminal_status() {
        let results = vec![
            (launch(0), outcome(Status::TimedOut, Some("deadline"))),
            (launch(1), outcome(Status::TimedOut, Some("deadline"))),
        ];
        let (status, _) = aggregate(&results, SuccessPolicy::All, 2);
        assert_eq!(status, Status::TimedOut);
    }

    #[test]
    fn mixed_failure_kinds_fall_back_to_failed() {
        let results = vec![
            (launch(0), outcome(Status::TimedOut, Some("deadline"))),
            (launch(1), outcome(Status::Cancelled, Some("cancelled"))),
        ];
        let (status, _) = aggregate(&results, SuccessPolicy::All, 2);
        assert_eq!(status, Status::Failed);
    }

    #[test]
    fn clamp_progress_never_exceeds_total() {
        assert_eq!(clamp_progress(5, 3), 3);
        assert_eq!(clamp_progress(2, 3), 2);
    }
}
