//! Utilities for tests: a deterministic counter environment, loopback port
//! allocation, and a scripted protocol peer for driving the controller one
//! message at a time.

use std::sync::atomic::{AtomicU16, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use crate::config::{ControllerConfig, WorkerConfig};
use crate::controller::Controller;
use crate::env::{EnvFactory, EnvStep, Environment, SpaceKind, SpacePair, SpaceSpec};
use crate::error::FabricError;
use crate::proto::{
    self, ActionBatch, ConnectRequest, ConnectResponse, Frame, MasterRequest, MasterResponse,
    NameResponse, RequestKind, ResponseKind, Tensor, WorkerCommand,
};
use crate::worker::Worker;

static NEXT_PORT: AtomicU16 = AtomicU16::new(24600);

/// A loopback endpoint pair no other test is using.
pub struct TestPorts {
    pub request_port: u16,
    pub command_port: u16,
}

pub fn controller_ports() -> TestPorts {
    let base = NEXT_PORT.fetch_add(2, Ordering::SeqCst);
    TestPorts {
        request_port: base,
        command_port: base + 1,
    }
}

impl TestPorts {
    pub fn controller_config(&self, number_of_environments: usize) -> ControllerConfig {
        let mut config = ControllerConfig::new(
            "tcp://127.0.0.1",
            self.command_port,
            self.request_port,
            number_of_environments,
            "Counter-v0",
        );
        config.poll_interval = Duration::from_millis(10);
        config.step_timeout = Duration::from_secs(2);
        config.linger = Duration::from_millis(100);
        config
    }

    pub fn worker_config(&self) -> WorkerConfig {
        let mut config = WorkerConfig::new("tcp://127.0.0.1", self.command_port, self.request_port);
        config.timeout = Duration::from_millis(500);
        config.wait_period = Duration::from_millis(50);
        config.linger = Duration::from_millis(100);
        config.polling_limit = 4;
        config
    }
}

pub fn controller_fixture(
    number_of_environments: usize,
    tweak: impl FnOnce(&mut ControllerConfig),
) -> (Controller, TestPorts) {
    let ports = controller_ports();
    let mut config = ports.controller_config(number_of_environments);
    tweak(&mut config);
    (Controller::new(config).unwrap(), ports)
}

/// Rebinding the same endpoints can race the previous sockets' teardown.
pub fn retry_bind(config: ControllerConfig) -> Controller {
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        match Controller::new(config.clone()) {
            Ok(controller) => return controller,
            Err(error) => {
                assert!(Instant::now() < deadline, "could not rebind: {}", error);
                thread::sleep(Duration::from_millis(50));
            }
        }
    }
}

pub fn spawn_worker(
    ports: &TestPorts,
    factory: CounterFactory,
    tweak: impl FnOnce(&mut WorkerConfig),
) -> thread::JoinHandle<Result<(), FabricError>> {
    let mut config = ports.worker_config();
    tweak(&mut config);
    thread::spawn(move || {
        let mut worker = Worker::new(config, factory)?;
        worker.run()
    })
}

/// A worker whose endpoints lead nowhere, for exercising the state machine
/// without a controller.
pub fn unbound_worker(factory: CounterFactory) -> Worker<CounterFactory> {
    let ports = controller_ports();
    Worker::new(ports.worker_config(), factory).unwrap()
}

pub fn encode_actions(actions: &[i64]) -> Vec<u8> {
    proto::encode(&ActionBatch {
        actions: actions.iter().copied().map(Tensor::scalar).collect(),
    })
}

pub fn counter_spaces() -> SpacePair {
    SpacePair {
        observation: SpaceSpec {
            kind: SpaceKind::Box,
            shape: vec![1],
            dtype: "i64".to_string(),
        },
        action: SpaceSpec {
            kind: SpaceKind::Discrete,
            shape: vec![],
            dtype: "i64".to_string(),
        },
    }
}

/// A deterministic environment: the observation is a single counter that
/// starts at the seed and advances by `action + 1`; the reward echoes the
/// action. With `done_after`, episodes terminate after that many steps.
pub struct CounterEnv {
    seed: i64,
    value: i64,
    episode_steps: u32,
    done_after: Option<u32>,
    pub resets: u32,
    pub closed: bool,
}

impl Environment for CounterEnv {
    fn space_payload(&self) -> Result<Vec<u8>, FabricError> {
        counter_spaces().to_payload()
    }

    fn reset(&mut self) -> Result<Tensor, FabricError> {
        self.episode_steps = 0;
        self.value = self.seed;
        self.resets += 1;
        Tensor::from_values(vec![1], &[self.value])
    }

    fn step(&mut self, action: &Tensor) -> Result<EnvStep, FabricError> {
        let action = action.to_scalar::<i64>()?;
        self.value += action + 1;
        self.episode_steps += 1;
        let done = self.done_after.map_or(false, |n| self.episode_steps >= n);
        Ok(EnvStep {
            observation: Tensor::from_values(vec![1], &[self.value])?,
            reward: action as f64,
            done,
            info: Vec::new(),
        })
    }

    fn close(&mut self) {
        self.closed = true;
    }
}

#[derive(Clone, Default)]
pub struct CounterFactory {
    pub done_after: Option<u32>,
}

impl EnvFactory for CounterFactory {
    type Env = CounterEnv;

    fn instantiate(&mut self, _name: &str, seed: i64) -> Result<CounterEnv, FabricError> {
        Ok(CounterEnv {
            seed,
            value: seed,
            episode_steps: 0,
            done_after: self.done_after,
            resets: 0,
            closed: false,
        })
    }
}

/// A scripted peer speaking the raw wire protocol, driven from the test
/// thread: each exchange pumps the controller until this client's reply is
/// back, so requests from concurrently running workers are serviced too.
pub struct RawClient {
    pub client_id: u32,
    pub instance_id: i64,
    pub environment_id: u32,
    request: zmq::Socket,
    command: zmq::Socket,
    _context: zmq::Context,
}

impl RawClient {
    pub fn attach(ports: &TestPorts) -> RawClient {
        let context = zmq::Context::new();
        let request = context.socket(zmq::REQ).unwrap();
        request.set_linger(0).unwrap();
        request.set_rcvtimeo(2_000).unwrap();
        request
            .connect(&format!("tcp://127.0.0.1:{}", ports.request_port))
            .unwrap();
        let command = context.socket(zmq::SUB).unwrap();
        command.set_linger(0).unwrap();
        command.set_subscribe(b"").unwrap();
        command
            .connect(&format!("tcp://127.0.0.1:{}", ports.command_port))
            .unwrap();
        RawClient {
            client_id: 0,
            instance_id: 0,
            environment_id: 0,
            request,
            command,
            _context: context,
        }
    }

    fn exchange(&mut self, controller: &mut Controller, request: &MasterRequest) -> MasterResponse {
        self.request.send(proto::encode(request), 0).unwrap();
        let deadline = Instant::now() + Duration::from_secs(2);
        loop {
            controller.poll_request(Duration::from_millis(10)).unwrap();
            if self.request.poll(zmq::POLLIN, 0).unwrap() > 0 {
                break;
            }
            assert!(Instant::now() < deadline, "no reply from the controller");
        }
        proto::decode(&self.request.recv_bytes(0).unwrap()).unwrap()
    }

    /// `Initialize` handshake; adopts the returned identity.
    pub fn initialize(&mut self, controller: &mut Controller) -> NameResponse {
        let request = MasterRequest {
            command: RequestKind::Initialize as i32,
            ..Default::default()
        };
        let response = self.exchange(controller, &request);
        assert_eq!(response.kind(), Some(ResponseKind::Ok));
        let name = response.name_response.expect("initialize reply without a name");
        self.client_id = name.client_id;
        self.instance_id = name.instance_id;
        name
    }

    /// `Connect` handshake; adopts the slot when one is granted.
    pub fn connect(
        &mut self,
        controller: &mut Controller,
    ) -> (ResponseKind, Option<ConnectResponse>) {
        let request = MasterRequest {
            command: RequestKind::Connect as i32,
            client_id: self.client_id,
            instance_id: self.instance_id,
            connect_payload: Some(ConnectRequest {
                spaces: counter_spaces().to_payload().unwrap(),
            }),
            frame: None,
        };
        let response = self.exchange(controller, &request);
        let kind = response.kind().unwrap();
        let connect = response.connect_response;
        if let Some(connect) = &connect {
            self.environment_id = connect.environment_id;
        }
        (kind, connect)
    }

    pub fn handshake(&mut self, controller: &mut Controller) {
        self.initialize(controller);
        let (kind, connect) = self.connect(controller);
        assert!(
            kind == ResponseKind::Ok || kind == ResponseKind::OkEncourage,
            "handshake refused with {:?}",
            kind
        );
        assert!(connect.is_some());
    }

    pub fn send_frame(
        &mut self,
        controller: &mut Controller,
        nonce: i64,
        observation: Tensor,
        reward: f64,
        done: bool,
    ) -> ResponseKind {
        let request = MasterRequest {
            command: RequestKind::Frame as i32,
            client_id: self.client_id,
            instance_id: self.instance_id,
            connect_payload: None,
            frame: Some(Frame {
                observation: Some(observation),
                reward,
                done,
                info: Vec::new(),
                nonce,
            }),
        };
        self.exchange(controller, &request).kind().unwrap()
    }

    pub fn heartbeat(&mut self, controller: &mut Controller) -> ResponseKind {
        let request = MasterRequest {
            command: RequestKind::Heartbeat as i32,
            client_id: self.client_id,
            instance_id: self.instance_id,
            ..Default::default()
        };
        self.exchange(controller, &request).kind().unwrap()
    }

    /// Sends raw bytes without pumping the controller.
    pub fn send_raw(&self, bytes: &[u8]) {
        self.request.send(bytes, 0).unwrap();
    }

    pub fn recv_kind(&self) -> ResponseKind {
        let response: MasterResponse =
            proto::decode(&self.request.recv_bytes(0).unwrap()).unwrap();
        response.kind().unwrap()
    }

    pub fn recv_command(&self, timeout: Duration) -> Option<WorkerCommand> {
        let timeout = i64::try_from(timeout.as_millis()).unwrap_or(i64::MAX);
        if self.command.poll(zmq::POLLIN, timeout).unwrap() == 0 {
            return None;
        }
        Some(proto::decode(&self.command.recv_bytes(0).unwrap()).unwrap())
    }
}
