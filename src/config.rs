//! Configuration for the two peers. Endpoints are given as a ZeroMQ URL
//! prefix plus two ports; the controller binds both, workers connect to both.

use std::time::Duration;

/// Configuration of the controller distributing work among workers.
#[derive(Clone, Debug)]
pub struct ControllerConfig {
    /// URL prefix to bind, e.g. `"tcp://*"`.
    pub server_url: String,
    /// Port of the broadcast command endpoint.
    pub command_port: u16,
    /// Port of the request/reply endpoint.
    pub request_port: u16,
    /// Number of environment slots, `N`.
    pub number_of_environments: usize,
    /// Name handed to workers so they can instantiate the right simulator.
    pub environment_name: String,
    /// Protocol version workers must match.
    pub server_version: u32,
    /// Wall-clock bound on one gathering round before recovery kicks in.
    pub step_timeout: Duration,
    /// Bound on a single request-endpoint poll.
    pub poll_interval: Duration,
    /// Socket linger on close.
    pub linger: Duration,
    /// When set, a `done` slot is released and reset out-of-band instead of
    /// being auto-reset inside the worker.
    pub reset_compensation: bool,
}

impl ControllerConfig {
    pub fn new(
        server_url: impl Into<String>,
        command_port: u16,
        request_port: u16,
        number_of_environments: usize,
        environment_name: impl Into<String>,
    ) -> Self {
        ControllerConfig {
            server_url: server_url.into(),
            command_port,
            request_port,
            number_of_environments,
            environment_name: environment_name.into(),
            server_version: 1,
            step_timeout: Duration::from_secs(30),
            poll_interval: Duration::from_millis(50),
            linger: Duration::from_secs(1),
            reset_compensation: false,
        }
    }
}

/// Configuration of a worker evaluating one environment.
#[derive(Clone, Debug)]
pub struct WorkerConfig {
    /// URL prefix to connect to, e.g. `"tcp://localhost"`.
    pub server_url: String,
    pub command_port: u16,
    pub request_port: u16,
    /// Protocol version; a mismatch with the controller is fatal.
    pub server_version: u32,
    /// Bound on request-reply exchanges and command polls.
    pub timeout: Duration,
    /// Sleep between connect retries while all slots are taken.
    pub wait_period: Duration,
    /// Socket linger on close.
    pub linger: Duration,
    /// Consecutive empty command polls before the subscription socket is
    /// refreshed and the controller is probed with a heartbeat.
    pub polling_limit: u32,
}

impl WorkerConfig {
    pub fn new(server_url: impl Into<String>, command_port: u16, request_port: u16) -> Self {
        WorkerConfig {
            server_url: server_url.into(),
            command_port,
            request_port,
            server_version: 1,
            timeout: Duration::from_secs(30),
            wait_period: Duration::from_secs(10),
            linger: Duration::from_secs(1),
            polling_limit: 10,
        }
    }
}

pub(crate) fn endpoint(url: &str, port: u16) -> String {
    format!("{}:{}", url, port)
}

pub(crate) fn millis(duration: Duration) -> i32 {
    i32::try_from(duration.as_millis()).unwrap_or(i32::MAX)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn endpoints_are_joined_from_url_and_port() {
        assert_eq!(endpoint("tcp://*", 9991), "tcp://*:9991");
        assert_eq!(endpoint("tcp://localhost", 9992), "tcp://localhost:9992");
    }

    #[test]
    fn defaults_match_protocol_version_one() {
        let config = ControllerConfig::new("tcp://*", 9991, 9992, 4, "CartPole-v1");
        assert_eq!(config.server_version, 1);
        assert!(!config.reset_compensation);
        let config = WorkerConfig::new("tcp://localhost", 9991, 9992);
        assert_eq!(config.server_version, 1);
        assert_eq!(config.polling_limit, 10);
    }
}
