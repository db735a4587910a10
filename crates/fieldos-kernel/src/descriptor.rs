//! Static description of a managed service.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use fieldos_types::RestartPolicyKind;
use serde::{Deserialize, Serialize};

use crate::circuit_breaker::CircuitBreaker;
use crate::restart::RestartPolicy;

/// How to launch a service process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceCommand {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub working_dir: Option<PathBuf>,
}

impl ServiceCommand {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: BTreeMap::new(),
            working_dir: None,
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ServiceDescriptor {
    pub service_id: String,
    pub service_type: Option<String>,
    pub dependencies: Vec<String>,
    /// A critical service failing permanently puts the system in `ERROR`.
    pub critical: bool,
    pub enabled: bool,
    pub restart_policy: RestartPolicyKind,
    pub max_restarts: u32,
    pub restart_delay_base: Duration,
    pub restart_delay_max: Duration,
    /// Sliding window in which failures count towards the breaker.
    pub restart_window: Duration,
    pub circuit_breaker_threshold: u32,
    pub circuit_cooldown: Duration,
    pub startup_timeout: Duration,
    pub stop_grace: Duration,
    pub heartbeat_interval: Duration,
    pub command: Option<ServiceCommand>,
}

impl ServiceDescriptor {
    pub fn new(service_id: impl Into<String>) -> Self {
        Self {
            service_id: service_id.into(),
            service_type: None,
            dependencies: Vec::new(),
            critical: false,
            enabled: true,
            restart_policy: RestartPolicyKind::OnFailure,
            max_restarts: 3,
            restart_delay_base: Duration::from_secs(1),
            restart_delay_max: Duration::from_secs(60),
            restart_window: Duration::from_secs(300),
            circuit_breaker_threshold: 3,
            circuit_cooldown: Duration::from_secs(60),
            startup_timeout: Duration::from_secs(30),
            stop_grace: Duration::from_secs(10),
            heartbeat_interval: Duration::from_secs(30),
            command: None,
        }
    }

    pub fn depends_on<I, S>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.dependencies = deps.into_iter().map(Into::into).collect();
        self
    }

    pub fn critical(mut self, critical: bool) -> Self {
        self.critical = critical;
        self
    }

    /// Set `max_restarts` and the breaker threshold together.
    pub fn with_max_restarts(mut self, max_restarts: u32) -> Self {
        self.max_restarts = max_restarts;
        self.circuit_breaker_threshold = max_restarts;
        self
    }

    pub fn with_command(mut self, command: ServiceCommand) -> Self {
        self.command = Some(command);
        self
    }

    pub fn policy(&self) -> RestartPolicy {
        RestartPolicy {
            kind: self.restart_policy,
            max_restarts: self.max_restarts,
            base_delay: self.restart_delay_base,
            max_delay: self.restart_delay_max,
        }
    }

    /// The breaker opens at the lower of `max_restarts` and the explicit
    /// threshold.
    pub fn breaker_threshold(&self) -> u32 {
        self.max_restarts.min(self.circuit_breaker_threshold).max(1)
    }

    pub fn breaker(&self) -> CircuitBreaker {
        CircuitBreaker::new(self.breaker_threshold(), self.restart_window, self.circuit_cooldown)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn breaker_threshold_is_the_tighter_limit() {
        let d = ServiceDescriptor::new("vision").with_max_restarts(5);
        assert_eq!(d.breaker_threshold(), 5);

        let mut d = d;
        d.circuit_breaker_threshold = 2;
        assert_eq!(d.breaker_threshold(), 2);
        assert_eq!(d.breaker().threshold(), 2);
    }
}
