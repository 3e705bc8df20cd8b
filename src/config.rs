use std::time::Duration;

/// Fail-mode for the readiness gate and for driver-evaluation errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailMode {
    /// Reject requests rather than risk a false pass against a cold cache.
    FailClosed,
    /// Admit without referential evaluation rather than block traffic.
    FailOpen,
}

/// What happens when the pipeline time budget expires.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutPolicy {
    Deny,
    Allow,
}

/// The operating mode a process was started with (`--operation`, repeatable).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Webhook,
    Audit,
    Status,
    MutationWebhook,
    MutationStatus,
}

/// Single immutable, process-wide configuration struct.
///
/// Built once at startup from CLI flags/env and threaded
/// through every constructor by reference. Nothing in this crate reads a
/// global after init.
#[derive(Debug, Clone)]
pub struct Config {
    pub webhook_port: u16,
    pub metrics_port: u16,
    pub audit_interval: Duration,
    pub audit_workers: usize,
    pub audit_max_violations_per_constraint: usize,
    pub audit_chunk_size: usize,
    pub operations: Vec<Operation>,
    pub disable_cert_rotation: bool,
    pub disable_enforcementaction_validation: bool,
    pub log_level: String,
    pub enable_external_data: bool,
    pub readiness_fail_mode: FailMode,
    pub timeout_policy: TimeoutPolicy,
    pub error_is_deny: bool,
    pub pipeline_budget: Duration,
    pub mutation_max_iterations: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            webhook_port: 8443,
            metrics_port: 8888,
            audit_interval: Duration::from_secs(60),
            audit_workers: 4,
            audit_max_violations_per_constraint: 20,
            audit_chunk_size: 500,
            operations: vec![Operation::Webhook, Operation::Audit, Operation::Status],
            disable_cert_rotation: false,
            disable_enforcementaction_validation: false,
            log_level: "info".to_string(),
            enable_external_data: false,
            readiness_fail_mode: FailMode::FailClosed,
            timeout_policy: TimeoutPolicy::Deny,
            error_is_deny: false,
            pipeline_budget: Duration::from_millis(3000),
            // Capped at 3 passes: enough for the partition/depth/name
            // ordering to converge for any mutator set that doesn't
            // genuinely oscillate, while still failing fast on a
            // misconfigured mutator pair.
            mutation_max_iterations: 3,
        }
    }
}

impl Config {
    pub fn has_operation(&self, op: Operation) -> bool {
        self.operations.contains(&op)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_fail_closed() {
        let cfg = Config::default();
        assert_eq!(cfg.readiness_fail_mode, FailMode::FailClosed);
        assert_eq!(cfg.timeout_policy, TimeoutPolicy::Deny);
    }

    #[test]
    fn test_has_operation() {
        let cfg = Config::default();
        assert!(cfg.has_operation(Operation::Webhook));
        assert!(!cfg.has_operation(Operation::MutationWebhook));
    }

    #[test]
    fn test_mutation_max_iterations_documented_default() {
        assert_eq!(Config::default().mutation_max_iterations, 3);
    }
}
