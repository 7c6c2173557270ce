//! Node ranking and advisory scaling recommendations.
//!
//! Nothing here provisions or removes nodes; `recommended_node_count` and
//! [`LoadReport`] are advice for an operator or an autoscaler.

use serde::Serialize;
use tracing::debug;

use crate::descriptor::NodeDescriptor;
use crate::membership::NodeDirectory;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum BalancerError {
    #[error("no active node available for work class {0:?}")]
    NoNodeAvailable(String),
}

/// Thresholds for scaling advice.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScalingPolicy {
    /// Average load above which more nodes are recommended.
    pub scale_out_threshold: f64,
    /// Average load below which one node fewer is recommended.
    pub scale_in_threshold: f64,
    /// Load variance above which the cluster counts as imbalanced.
    pub imbalance_variance: f64,
}

impl Default for ScalingPolicy {
    fn default() -> Self {
        Self {
            scale_out_threshold: 0.8,
            scale_in_threshold: 0.2,
            imbalance_variance: 0.04,
        }
    }
}

/// Cluster-wide load summary.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LoadReport {
    pub node_count: usize,
    pub average_load: f64,
    pub variance: f64,
    pub min_load: f64,
    pub max_load: f64,
    pub recommended_node_count: usize,
    pub is_imbalanced: bool,
}

pub struct LoadBalancer<D: NodeDirectory> {
    directory: D,
    policy: ScalingPolicy,
}

impl<D: NodeDirectory> LoadBalancer<D> {
    pub fn new(directory: D) -> Self {
        Self::with_policy(directory, ScalingPolicy::default())
    }

    pub fn with_policy(directory: D, policy: ScalingPolicy) -> Self {
        Self { directory, policy }
    }

    pub fn policy(&self) -> &ScalingPolicy {
        &self.policy
    }

    /// Least-loaded live node that is not draining.
    ///
    /// Ties go to the node with fewer processed tasks, then the lower id, so
    /// the choice is stable across callers.
    pub fn select_best_node(&self, work_class: &str) -> Result<NodeDescriptor, BalancerError> {
        let best = self
            .directory
            .active_nodes()
            .into_iter()
            .filter(|n| !n.is_draining())
            .min_by(|a, b| {
                a.load_score
                    .total_cmp(&b.load_score)
                    .then(a.processed_task_count.cmp(&b.processed_task_count))
                    .then_with(|| a.node_id.cmp(&b.node_id))
            })
            .ok_or_else(|| BalancerError::NoNodeAvailable(work_class.to_string()))?;

        debug!(work_class, node_id = %best.node_id, load = best.load_score, "selected node");
        Ok(best)
    }

    /// Scale out proportionally above the high threshold, by one node below
    /// the low threshold (never below one node), otherwise keep the count.
    pub fn recommended_node_count(&self, avg_load: f64, current_nodes: usize) -> usize {
        let policy = &self.policy;
        if !avg_load.is_finite() {
            return current_nodes;
        }

        if avg_load > policy.scale_out_threshold {
            let needed = (current_nodes as f64 * avg_load / policy.scale_out_threshold).ceil() as usize;
            needed.max(current_nodes + 1)
        } else if avg_load < policy.scale_in_threshold && current_nodes > 1 {
            current_nodes - 1
        } else {
            current_nodes
        }
    }

    /// Average, variance and spread of load across live nodes.
    pub fn cluster_load_report(&self) -> LoadReport {
        let loads: Vec<f64> = self
            .directory
            .active_nodes()
            .iter()
            .map(|n| n.load_score)
            .collect();

        let node_count = loads.len();
        if node_count == 0 {
            return LoadReport {
                node_count: 0,
                average_load: 0.0,
                variance: 0.0,
                min_load: 0.0,
                max_load: 0.0,
                recommended_node_count: 0,
                is_imbalanced: false,
            };
        }

        let n = node_count as f64;
        let average_load = loads.iter().sum::<f64>() / n;
        let variance = loads.iter().map(|l| (l - average_load).powi(2)).sum::<f64>() / n;

        LoadReport {
            node_count,
            average_load,
            variance,
            min_load: loads.iter().copied().fold(f64::INFINITY, f64::min),
            max_load: loads.iter().copied().fold(f64::NEG_INFINITY, f64::max),
            recommended_node_count: self.recommended_node_count(average_load, node_count),
            is_imbalanced: variance > self.policy.imbalance_variance,
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;
    use crate::descriptor::NodeStatus;

    struct FixedDirectory(Vec<NodeDescriptor>);

    impl NodeDirectory for FixedDirectory {
        fn active_nodes(&self) -> Vec<NodeDescriptor> {
            self.0.clone()
        }
    }

    fn node(id: &str, load: f64, processed: u64) -> NodeDescriptor {
        let mut n = NodeDescriptor::new(id.parse().unwrap(), "10.0.0.1", 80, Utc::now());
        n.load_score = load;
        n.processed_task_count = processed;
        n
    }

    #[test]
    fn selects_least_loaded_node() {
        let balancer = LoadBalancer::new(FixedDirectory(vec![
            node("a", 0.7, 0),
            node("b", 0.2, 10),
            node("c", 0.5, 0),
        ]));
        assert_eq!(balancer.select_best_node("retry").unwrap().node_id.as_str(), "b");
    }

    #[test]
    fn ties_prefer_fewer_processed_tasks() {
        let balancer = LoadBalancer::new(FixedDirectory(vec![node("a", 0.3, 9), node("b", 0.3, 2)]));
        assert_eq!(balancer.select_best_node("retry").unwrap().node_id.as_str(), "b");
    }

    #[test]
    fn draining_nodes_are_skipped() {
        let mut draining = node("a", 0.0, 0);
        draining.status = NodeStatus::Draining;
        let balancer = LoadBalancer::new(FixedDirectory(vec![draining, node("b", 0.9, 0)]));
        assert_eq!(balancer.select_best_node("retry").unwrap().node_id.as_str(), "b");
    }

    #[test]
    fn empty_cluster_fails_explicitly() {
        let balancer = LoadBalancer::new(FixedDirectory(vec![]));
        assert_eq!(
            balancer.select_best_node("compensation"),
            Err(BalancerError::NoNodeAvailable("compensation".to_string()))
        );
    }

    #[test]
    fn scaling_recommendations() {
        let balancer = LoadBalancer::new(FixedDirectory(vec![]));

        // Proportional to the overage, at least one more node.
        assert_eq!(balancer.recommended_node_count(0.9, 4), 5);
        assert_eq!(balancer.recommended_node_count(1.0, 8), 10);
        assert_eq!(balancer.recommended_node_count(0.81, 1), 2);

        assert_eq!(balancer.recommended_node_count(0.1, 3), 2);
        assert_eq!(balancer.recommended_node_count(0.1, 1), 1);

        assert_eq!(balancer.recommended_node_count(0.5, 3), 3);
        assert_eq!(balancer.recommended_node_count(0.8, 3), 3);
        assert_eq!(balancer.recommended_node_count(0.2, 3), 3);
        assert_eq!(balancer.recommended_node_count(f64::NAN, 3), 3);
    }

    #[test]
    fn load_report_summarises_cluster() {
        let balancer = LoadBalancer::new(FixedDirectory(vec![
            node("a", 0.1, 0),
            node("b", 0.5, 0),
            node("c", 0.9, 0),
        ]));
        let report = balancer.cluster_load_report();

        assert_eq!(report.node_count, 3);
        assert!((report.average_load - 0.5).abs() < 1e-9);
        assert!((report.variance - 0.32 / 3.0).abs() < 1e-9);
        assert_eq!(report.min_load, 0.1);
        assert_eq!(report.max_load, 0.9);
        assert_eq!(report.recommended_node_count, 3);
        assert!(report.is_imbalanced);

        let empty = LoadBalancer::new(FixedDirectory(vec![])).cluster_load_report();
        assert_eq!(empty.node_count, 0);
        assert!(!empty.is_imbalanced);
    }
}
