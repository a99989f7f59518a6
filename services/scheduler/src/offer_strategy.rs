//! Offer evaluation.
//!
//! An offer is tested against an ordered list of decline rules; the first
//! rule that matches declines the offer with its reason. An offer no rule
//! matches is accepted.
//!
//! Deployment modes differ only in their rule list:
//! - Normal: every rule
//! - External storage: no disk rule (volumes are sized by the driver)

use std::sync::Arc;

use tracing::{debug, info};

use crate::config::Configuration;
use crate::model::{ClusterTask, ResourceOffer};

pub const HOST_ALREADY_RUNNING: &str = "Host already running task";
pub const CLUSTER_FULFILLED: &str = "Cluster size already fulfilled";
pub const NOT_TWO_PORTS: &str = "Offer did not have 2 ports";
pub const MISSING_PINNED_PORTS: &str = "The offer does not contain the user specified ports";
pub const NOT_ENOUGH_CPU: &str = "Offer did not have enough CPU resources";
pub const NOT_ENOUGH_MEM: &str = "Offer did not have enough RAM resources";
pub const NOT_ENOUGH_DISK: &str = "Offer did not have enough disk resources";

/// Outcome of evaluating one offer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OfferResult {
    Accept,
    Decline(&'static str),
}

impl OfferResult {
    pub fn is_accepted(&self) -> bool {
        matches!(self, Self::Accept)
    }
}

/// Everything a rule may look at.
pub struct RuleInput<'a> {
    pub offer: &'a ResourceOffer,
    pub tasks: &'a [ClusterTask],
    pub config: &'a Configuration,
}

/// A named decline rule. `declines` returns true to reject the offer.
#[derive(Clone, Copy)]
pub struct OfferRule {
    pub name: &'static str,
    pub reason: &'static str,
    pub declines: fn(&RuleInput<'_>) -> bool,
}

impl std::fmt::Debug for OfferRule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OfferRule")
            .field("name", &self.name)
            .field("reason", &self.reason)
            .finish()
    }
}

// =============================================================================
// Rules
// =============================================================================

fn host_already_running(input: &RuleInput<'_>) -> bool {
    input
        .tasks
        .iter()
        .any(|task| task.descriptor.agent_id == input.offer.agent_id)
}

fn cluster_fulfilled(input: &RuleInput<'_>) -> bool {
    let current = input.tasks.len();
    esfm_reconcile::CapacityStatus::of(current, input.config.elasticsearch_nodes).is_fulfilled()
}

fn not_two_ports(input: &RuleInput<'_>) -> bool {
    input.offer.resources.select_two_ports().is_none()
}

fn missing_pinned_ports(input: &RuleInput<'_>) -> bool {
    match input.config.pinned_ports() {
        Some((client, transport)) => {
            let resources = &input.offer.resources;
            !(resources.has_port(client) && resources.has_port(transport))
        }
        None => false,
    }
}

fn not_enough_cpu(input: &RuleInput<'_>) -> bool {
    input.offer.resources.cpus < input.config.cpus
}

fn not_enough_mem(input: &RuleInput<'_>) -> bool {
    input.offer.resources.mem < input.config.mem
}

fn not_enough_disk(input: &RuleInput<'_>) -> bool {
    input.offer.resources.disk < input.config.disk
}

const fn rule(
    name: &'static str,
    reason: &'static str,
    declines: fn(&RuleInput<'_>) -> bool,
) -> OfferRule {
    OfferRule {
        name,
        reason,
        declines,
    }
}

/// Rules for deployments whose data lives on the agent's disk.
pub fn normal_rules() -> Vec<OfferRule> {
    vec![
        rule("host_already_running", HOST_ALREADY_RUNNING, host_already_running),
        rule("cluster_fulfilled", CLUSTER_FULFILLED, cluster_fulfilled),
        rule("two_ports", NOT_TWO_PORTS, not_two_ports),
        rule("pinned_ports", MISSING_PINNED_PORTS, missing_pinned_ports),
        rule("cpu", NOT_ENOUGH_CPU, not_enough_cpu),
        rule("mem", NOT_ENOUGH_MEM, not_enough_mem),
        rule("disk", NOT_ENOUGH_DISK, not_enough_disk),
    ]
}

/// Rules for deployments backed by external volumes.
pub fn external_storage_rules() -> Vec<OfferRule> {
    normal_rules()
        .into_iter()
        .filter(|r| r.name != "disk")
        .collect()
}

// =============================================================================
// Strategy
// =============================================================================

/// Decides whether to accept resource offers.
#[derive(Debug)]
pub struct OfferStrategy {
    config: Arc<Configuration>,
    rules: Vec<OfferRule>,
}

impl OfferStrategy {
    /// Strategy for the configured deployment mode.
    pub fn new(config: Arc<Configuration>) -> Self {
        let rules = if config.uses_external_volumes() {
            external_storage_rules()
        } else {
            normal_rules()
        };
        Self::with_rules(config, rules)
    }

    pub fn with_rules(config: Arc<Configuration>, rules: Vec<OfferRule>) -> Self {
        Self { config, rules }
    }

    pub fn rules(&self) -> &[OfferRule] {
        &self.rules
    }

    /// Evaluate `offer` against the tasks currently in the cluster.
    pub fn evaluate(&self, offer: &ResourceOffer, tasks: &[ClusterTask]) -> OfferResult {
        let input = RuleInput {
            offer,
            tasks,
            config: &self.config,
        };

        for rule in &self.rules {
            if (rule.declines)(&input) {
                info!(
                    offer_id = %offer.id,
                    hostname = %offer.hostname,
                    rule = rule.name,
                    reason = rule.reason,
                    "Declining offer"
                );
                return OfferResult::Decline(rule.reason);
            }
            debug!(offer_id = %offer.id, rule = rule.name, "Offer passed rule");
        }

        info!(offer_id = %offer.id, hostname = %offer.hostname, "Accepting offer");
        OfferResult::Accept
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{fixtures, PortRange};
    use rstest::rstest;

    fn config() -> Configuration {
        Configuration {
            elasticsearch_nodes: 3,
            cpus: 0.2,
            mem: 256.0,
            disk: 250.0,
            ..Configuration::default()
        }
    }

    fn good_offer() -> ResourceOffer {
        let mut offer = fixtures::offer(
            "offer-1",
            "host1",
            "agent-1",
            vec![PortRange::single(9200), PortRange::single(9300)],
        );
        offer.resources.cpus = 1.0;
        offer.resources.mem = 256.0;
        offer.resources.disk = 250.0;
        offer
    }

    fn strategy(config: Configuration) -> OfferStrategy {
        OfferStrategy::new(Arc::new(config))
    }

    #[test]
    fn test_accepts_good_offer() {
        let result = strategy(config()).evaluate(&good_offer(), &[]);
        assert_eq!(result, OfferResult::Accept);
    }

    #[test]
    fn test_declines_when_host_already_running() {
        let tasks = vec![fixtures::task("task-1", "agent-1")];
        let result = strategy(config()).evaluate(&good_offer(), &tasks);
        assert_eq!(result, OfferResult::Decline(HOST_ALREADY_RUNNING));
    }

    #[test]
    fn test_declines_when_cluster_fulfilled() {
        let tasks = vec![
            fixtures::task("task-1", "agent-a"),
            fixtures::task("task-2", "agent-b"),
            fixtures::task("task-3", "agent-c"),
        ];
        let result = strategy(config()).evaluate(&good_offer(), &tasks);
        assert_eq!(result, OfferResult::Decline(CLUSTER_FULFILLED));
    }

    #[test]
    fn test_host_rule_wins_over_fulfilled() {
        let tasks = vec![
            fixtures::task("task-1", "agent-1"),
            fixtures::task("task-2", "agent-b"),
            fixtures::task("task-3", "agent-c"),
        ];
        let result = strategy(config()).evaluate(&good_offer(), &tasks);
        assert_eq!(result, OfferResult::Decline(HOST_ALREADY_RUNNING));
    }

    #[rstest]
    #[case::single_port(vec![PortRange::single(9200)])]
    #[case::no_ports(vec![])]
    fn test_declines_without_two_ports(#[case] ports: Vec<PortRange>) {
        let mut offer = good_offer();
        offer.resources.ports = ports;
        let result = strategy(config()).evaluate(&offer, &[]);
        assert_eq!(result, OfferResult::Decline(NOT_TWO_PORTS));
    }

    #[test]
    fn test_declines_without_pinned_ports() {
        let config = Configuration {
            elasticsearch_ports: vec![9201, 9301],
            ..config()
        };
        let result = strategy(config).evaluate(&good_offer(), &[]);
        assert_eq!(result, OfferResult::Decline(MISSING_PINNED_PORTS));
    }

    #[test]
    fn test_accepts_pinned_ports_inside_range() {
        let config = Configuration {
            elasticsearch_ports: vec![31005, 31010],
            ..config()
        };
        let mut offer = good_offer();
        offer.resources.ports = vec![PortRange::new(31000, 31100)];
        assert!(strategy(config).evaluate(&offer, &[]).is_accepted());
    }

    #[rstest]
    #[case::cpu(0.1, 256.0, 250.0, NOT_ENOUGH_CPU)]
    #[case::mem(1.0, 255.0, 250.0, NOT_ENOUGH_MEM)]
    #[case::disk(1.0, 256.0, 249.0, NOT_ENOUGH_DISK)]
    #[case::cpu_first(0.1, 1.0, 1.0, NOT_ENOUGH_CPU)]
    fn test_declines_short_resources(
        #[case] cpus: f64,
        #[case] mem: f64,
        #[case] disk: f64,
        #[case] reason: &'static str,
    ) {
        let mut offer = good_offer();
        offer.resources.cpus = cpus;
        offer.resources.mem = mem;
        offer.resources.disk = disk;
        let result = strategy(config()).evaluate(&offer, &[]);
        assert_eq!(result, OfferResult::Decline(reason));
    }

    #[test]
    fn test_external_storage_ignores_disk() {
        let config = Configuration {
            external_volume_driver: Some("rexray".to_string()),
            ..config()
        };
        let mut offer = good_offer();
        offer.resources.disk = 0.0;

        let strategy = strategy(config);
        assert!(strategy.rules().iter().all(|r| r.reason != NOT_ENOUGH_DISK));
        assert!(strategy.evaluate(&offer, &[]).is_accepted());
    }

    #[test]
    fn test_custom_rule_list() {
        let rules = vec![rule("never", "Never accept", |_| true)];
        let strategy = OfferStrategy::with_rules(Arc::new(config()), rules);
        assert_eq!(
            strategy.evaluate(&good_offer(), &[]),
            OfferResult::Decline("Never accept")
        );
    }
}
