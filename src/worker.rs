//! The worker: a remote peer that owns exactly one environment and services
//! commands broadcast by the controller.
//!
//! The loop is single-threaded and cooperative: it suspends only on the two
//! poll sites (command subscription, request reply) and runs to completion
//! between them. The controller is authoritative; on any confusion the worker
//! heals itself by tearing its session down and re-entering the handshake.

use std::time::{Duration, Instant};

use log::{debug, info, warn};

use crate::config::{self, WorkerConfig};
use crate::env::{EnvFactory, Environment};
use crate::error::FabricError;
use crate::proto::{
    self, ActionBatch, CommandKind, ConnectRequest, Frame, MasterRequest, MasterResponse,
    RequestKind, ResponseKind, Tensor, WorkerCommand,
};

/// Handshake-scoped state, discarded wholesale on every client reset.
#[derive(Debug, Default)]
struct Session {
    initialized: bool,
    client_id: Option<u32>,
    server_instance_id: Option<i64>,
    environment_id: Option<u32>,
    environment_name: Option<String>,
    environment_seed: i64,
    reset_compensation: bool,
    command_nonce: i64,
    idle_since: Option<Instant>,
}

/// Client side of the fabric, generic over the injected simulator.
pub struct Worker<F: EnvFactory> {
    config: WorkerConfig,
    factory: F,
    context: zmq::Context,
    command_socket: zmq::Socket,
    request_socket: zmq::Socket,
    env: Option<F::Env>,
    session: Session,
    /// Observation of a locally performed episode reset, served on the next
    /// reset demand instead of resetting again.
    reset_cache: Option<Tensor>,
    poll_misses: u32,
    closed: bool,
}

impl<F: EnvFactory> Worker<F> {
    pub fn new(config: WorkerConfig, factory: F) -> Result<Worker<F>, FabricError> {
        let context = zmq::Context::new();
        let command_socket = open_command_socket(&context, &config)?;
        let request_socket = open_request_socket(&context, &config)?;
        Ok(Worker {
            config,
            factory,
            context,
            command_socket,
            request_socket,
            env: None,
            session: Session::default(),
            reset_cache: None,
            poll_misses: 0,
            closed: false,
        })
    }

    pub fn client_id(&self) -> Option<u32> {
        self.session.client_id
    }

    pub fn environment_id(&self) -> Option<u32> {
        self.session.environment_id
    }

    pub fn is_initialized(&self) -> bool {
        self.session.initialized
    }

    /// Runs until the controller broadcasts `Close` or a fatal error occurs.
    /// A version mismatch during the handshake is fatal; everything else the
    /// worker recovers from by itself.
    pub fn run(&mut self) -> Result<(), FabricError> {
        info!("worker: connecting to {}", self.config.server_url);
        while !self.closed {
            if !self.session.initialized {
                if self.init()? {
                    self.drain_commands()?;
                }
            } else {
                match self.fetch_command(self.config.timeout)? {
                    Some(command) => {
                        self.poll_misses = 0;
                        self.run_command(command)?;
                    }
                    None => self.note_poll_miss()?,
                }
            }
        }
        Ok(())
    }

    /// The handshake dance: obtain a client id, then bind a slot. Returns
    /// whether the worker came out of it fully initialised.
    fn init(&mut self) -> Result<bool, FabricError> {
        if self.session.client_id.is_none() {
            debug!("worker: requesting a name");
            if !self.send_initialize_request()? {
                return Ok(false);
            }
            if self.env.is_none() {
                let name = self.session.environment_name.clone().unwrap_or_default();
                let seed = self.session.environment_seed;
                self.env = Some(self.factory.instantiate(&name, seed)?);
            }
        }
        self.send_connect_request()
    }

    fn send_initialize_request(&mut self) -> Result<bool, FabricError> {
        let request = MasterRequest {
            command: RequestKind::Initialize as i32,
            ..Default::default()
        };
        let Some(response) = self.request(&request)? else {
            self.reset_client()?;
            return Ok(false);
        };
        match response.kind() {
            Some(ResponseKind::Ok) => {
                let name = response
                    .name_response
                    .ok_or_else(|| FabricError::protocol("initialize reply without a name"))?;
                if name.server_version != self.config.server_version {
                    return Err(FabricError::VersionMismatch {
                        server: name.server_version,
                        worker: self.config.server_version,
                    });
                }
                info!(
                    "worker {}: named '{}' by instance {}",
                    name.client_id, name.name, name.instance_id
                );
                self.session.client_id = Some(name.client_id);
                self.session.server_instance_id = Some(name.instance_id);
                self.session.environment_name = Some(name.name);
                self.session.environment_seed = name.seed;
                self.session.reset_compensation = name.reset_compensation;
                Ok(true)
            }
            _ => {
                self.reset_client()?;
                Ok(false)
            }
        }
    }

    fn send_connect_request(&mut self) -> Result<bool, FabricError> {
        let client_id = self
            .session
            .client_id
            .ok_or_else(|| FabricError::protocol("connect before a client id was assigned"))?;
        let spaces = self
            .env
            .as_ref()
            .ok_or_else(|| FabricError::protocol("connect without an environment"))?
            .space_payload()?;
        let request = MasterRequest {
            command: RequestKind::Connect as i32,
            client_id,
            instance_id: self.session.server_instance_id.unwrap_or_default(),
            connect_payload: Some(ConnectRequest { spaces }),
            frame: None,
        };
        let Some(response) = self.request(&request)? else {
            self.reset_client()?;
            return Ok(false);
        };
        match response.kind() {
            Some(ResponseKind::Ok) => {
                let connect = response
                    .connect_response
                    .ok_or_else(|| FabricError::protocol("connect reply without a slot"))?;
                self.bind(connect.environment_id);
                Ok(true)
            }
            Some(ResponseKind::OkEncourage) => {
                let connect = response
                    .connect_response
                    .ok_or_else(|| FabricError::protocol("connect reply without a slot"))?;
                self.bind(connect.environment_id);
                // A round is in flight. Adopt its nonce and push a fresh
                // episode so the controller's slot fills without waiting for
                // the next broadcast.
                if let Some(command) = connect.last_command {
                    self.session.command_nonce = command.nonce;
                    self.push_fresh_episode()?;
                }
                Ok(true)
            }
            Some(ResponseKind::Wait) => {
                self.idle_wait()?;
                Ok(false)
            }
            _ => {
                self.reset_client()?;
                Ok(false)
            }
        }
    }

    fn bind(&mut self, environment_id: u32) {
        info!(
            "worker {}: bound to slot {}",
            self.session.client_id.unwrap_or_default(),
            environment_id
        );
        self.session.environment_id = Some(environment_id);
        self.session.idle_since = None;
        self.session.initialized = true;
    }

    /// Dispatches one broadcast command. `Step` and `Reset` carry nonce
    /// semantics and are filtered for staleness; the rest act regardless,
    /// since `ResetClient` in particular must cross controller generations.
    fn run_command(&mut self, command: WorkerCommand) -> Result<(), FabricError> {
        let kind = command.kind().ok_or_else(|| {
            FabricError::protocol(format!("unknown command kind {}", command.command))
        })?;
        match kind {
            CommandKind::Step => {
                if command.nonce < self.session.command_nonce {
                    debug!("worker: ignoring stale step (nonce {})", command.nonce);
                    return Ok(());
                }
                self.session.command_nonce = command.nonce;
                self.step(&command.actions)
            }
            CommandKind::Reset => {
                if command.nonce < self.session.command_nonce {
                    debug!("worker: ignoring stale reset (nonce {})", command.nonce);
                    return Ok(());
                }
                self.session.command_nonce = command.nonce;
                self.session.idle_since = None;
                self.reset()
            }
            CommandKind::Close => {
                self.close();
                Ok(())
            }
            CommandKind::ResetClient => {
                if self.session.initialized
                    && self.session.server_instance_id != Some(command.instance_id)
                {
                    info!("worker: controller generation changed, resetting");
                    self.reset_client()
                } else {
                    Ok(())
                }
            }
            CommandKind::WakeUp => {
                self.session.idle_since = None;
                Ok(())
            }
            CommandKind::NoCommand => Ok(()),
        }
    }

    /// Replays commands buffered on the subscription socket while the
    /// handshake ran. Anything already covered by an adopted nonce is
    /// skipped, and generation checks are meaningless without a binding.
    fn run_command_simple(&mut self, command: WorkerCommand) -> Result<(), FabricError> {
        match command.kind() {
            Some(CommandKind::Step) | Some(CommandKind::Reset)
                if command.nonce <= self.session.command_nonce =>
            {
                debug!("worker: drained command already covered (nonce {})", command.nonce);
                Ok(())
            }
            Some(CommandKind::ResetClient) if !self.session.initialized => Ok(()),
            _ => self.run_command(command),
        }
    }

    fn drain_commands(&mut self) -> Result<(), FabricError> {
        // A drained command can itself end the session (a done frame under
        // reset compensation); the rest of the backlog then belongs to a
        // binding this worker no longer holds.
        while !self.closed && self.session.initialized {
            match self.fetch_command(Duration::ZERO)? {
                Some(command) => self.run_command_simple(command)?,
                None => break,
            }
        }
        Ok(())
    }

    fn step(&mut self, actions: &[u8]) -> Result<(), FabricError> {
        let env_id = self
            .session
            .environment_id
            .ok_or_else(|| FabricError::protocol("step without a slot"))? as usize;
        let batch: ActionBatch = proto::decode(actions)?;
        let action = batch
            .actions
            .get(env_id)
            .ok_or_else(|| {
                FabricError::protocol(format!("step payload holds no action for slot {}", env_id))
            })?
            .clone();
        let env = self
            .env
            .as_mut()
            .ok_or_else(|| FabricError::protocol("step without an environment"))?;
        let step = env.step(&action)?;
        let observation = if step.done && !self.session.reset_compensation {
            // Auto-reset: the controller sees a continuous stream, so the
            // terminal frame carries the next episode's first observation.
            env.reset()?
        } else {
            step.observation
        };
        self.send_frame(Frame {
            observation: Some(observation),
            reward: step.reward,
            done: step.done,
            info: step.info,
            nonce: 0,
        })
    }

    fn reset(&mut self) -> Result<(), FabricError> {
        let observation = match self.reset_cache.take() {
            Some(observation) => observation,
            None => self
                .env
                .as_mut()
                .ok_or_else(|| FabricError::protocol("reset without an environment"))?
                .reset()?,
        };
        self.send_frame(Frame {
            observation: Some(observation),
            reward: 0.0,
            done: false,
            info: Vec::new(),
            nonce: 0,
        })
    }

    /// The `OkEncourage` compensation: a fresh (or cached) episode start is
    /// pushed immediately, tagged with the adopted round nonce.
    fn push_fresh_episode(&mut self) -> Result<(), FabricError> {
        self.reset()
    }

    /// Stamps the session nonce onto the frame and delivers it, reacting to
    /// the controller's verdict.
    fn send_frame(&mut self, mut frame: Frame) -> Result<(), FabricError> {
        frame.nonce = self.session.command_nonce;
        let request = MasterRequest {
            command: RequestKind::Frame as i32,
            client_id: self.session.client_id.unwrap_or_default(),
            instance_id: self.session.server_instance_id.unwrap_or_default(),
            connect_payload: None,
            frame: Some(frame),
        };
        let Some(response) = self.request(&request)? else {
            return self.reset_client();
        };
        match response.kind() {
            Some(ResponseKind::Ok) => Ok(()),
            Some(ResponseKind::SoftError) => {
                debug!("worker: frame dropped by the controller");
                Ok(())
            }
            Some(ResponseKind::Reset) => self.compensated_reset(),
            _ => self.reset_client(),
        }
    }

    /// The controller released our slot after a terminal frame. Reset the
    /// episode now, keep its first observation for the next bind, and go
    /// back through the handshake. The environment survives.
    fn compensated_reset(&mut self) -> Result<(), FabricError> {
        info!(
            "worker {}: slot released, re-entering the handshake",
            self.session.client_id.unwrap_or_default()
        );
        if let Some(env) = self.env.as_mut() {
            self.reset_cache = Some(env.reset()?);
        }
        self.session = Session::default();
        Ok(())
    }

    /// All slots are taken. Sleep on the command socket until the wait
    /// period elapses or the controller nudges idle workers awake.
    fn idle_wait(&mut self) -> Result<(), FabricError> {
        if self.session.idle_since.is_none() {
            info!(
                "worker {}: no free slot, idling",
                self.session.client_id.unwrap_or_default()
            );
            self.session.idle_since = Some(Instant::now());
        }
        let deadline = Instant::now() + self.config.wait_period;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            match self.fetch_command(remaining)? {
                Some(command) => match command.kind() {
                    Some(CommandKind::WakeUp) => {
                        debug!("worker: woken up early");
                        break;
                    }
                    Some(CommandKind::Close) => {
                        self.close();
                        return Ok(());
                    }
                    // Everything else addresses bound workers.
                    _ => {}
                },
                None => break,
            }
        }
        self.session.idle_since = None;
        Ok(())
    }

    /// One lock-step request/reply exchange. `None` means the exchange timed
    /// out; the caller decides how to recover.
    fn request(&mut self, request: &MasterRequest) -> Result<Option<MasterResponse>, FabricError> {
        match self.request_socket.send(proto::encode(request), 0) {
            Ok(()) => {}
            Err(zmq::Error::EAGAIN) => return Ok(None),
            Err(error) => return Err(error.into()),
        }
        let timeout = i64::from(config::millis(self.config.timeout));
        if self.request_socket.poll(zmq::POLLIN, timeout)? == 0 {
            warn!("worker: request timed out");
            return Ok(None);
        }
        let raw = self.request_socket.recv_bytes(0)?;
        Ok(Some(proto::decode(&raw)?))
    }

    fn fetch_command(&mut self, timeout: Duration) -> Result<Option<WorkerCommand>, FabricError> {
        if self
            .command_socket
            .poll(zmq::POLLIN, i64::from(config::millis(timeout)))?
            == 0
        {
            return Ok(None);
        }
        let raw = self.command_socket.recv_bytes(0)?;
        match proto::decode::<WorkerCommand>(&raw) {
            Ok(command) => Ok(Some(command)),
            Err(error) => {
                warn!("worker: dropping undecodable command: {}", error);
                Ok(None)
            }
        }
    }

    /// The pub/sub layer may silently drop a slow subscriber. After enough
    /// consecutive empty polls the subscription is rebuilt and the controller
    /// probed; a dead controller triggers a full client reset.
    fn note_poll_miss(&mut self) -> Result<(), FabricError> {
        self.poll_misses += 1;
        if self.poll_misses < self.config.polling_limit {
            return Ok(());
        }
        self.poll_misses = 0;
        debug!(
            "worker {}: {} empty polls, refreshing the command subscription",
            self.session.client_id.unwrap_or_default(),
            self.config.polling_limit
        );
        self.command_socket = open_command_socket(&self.context, &self.config)?;
        let request = MasterRequest {
            command: RequestKind::Heartbeat as i32,
            client_id: self.session.client_id.unwrap_or_default(),
            instance_id: self.session.server_instance_id.unwrap_or_default(),
            ..Default::default()
        };
        match self.request(&request)? {
            Some(response) if response.kind() == Some(ResponseKind::Ok) => Ok(()),
            _ => self.reset_client(),
        }
    }

    /// The single hard-teardown routine: environment, cached state and both
    /// sockets all go; the next loop iteration starts the handshake from
    /// scratch.
    fn reset_client(&mut self) -> Result<(), FabricError> {
        warn!(
            "worker {}: resetting client state",
            self.session.client_id.unwrap_or_default()
        );
        if let Some(mut env) = self.env.take() {
            env.close();
        }
        self.reset_cache = None;
        self.session = Session::default();
        self.poll_misses = 0;
        self.command_socket = open_command_socket(&self.context, &self.config)?;
        self.request_socket = open_request_socket(&self.context, &self.config)?;
        Ok(())
    }

    /// Terminal: close the environment and stop the loop. The sockets close
    /// with the worker, honouring the configured linger.
    fn close(&mut self) {
        info!(
            "worker {}: closing",
            self.session.client_id.unwrap_or_default()
        );
        if let Some(mut env) = self.env.take() {
            env.close();
        }
        self.closed = true;
    }
}

fn open_command_socket(
    context: &zmq::Context,
    config: &WorkerConfig,
) -> Result<zmq::Socket, FabricError> {
    let socket = context.socket(zmq::SUB)?;
    socket.set_linger(config::millis(config.linger))?;
    socket.set_subscribe(b"")?;
    socket.connect(&config::endpoint(&config.server_url, config.command_port))?;
    Ok(socket)
}

fn open_request_socket(
    context: &zmq::Context,
    config: &WorkerConfig,
) -> Result<zmq::Socket, FabricError> {
    let socket = context.socket(zmq::REQ)?;
    socket.set_linger(config::millis(config.linger))?;
    socket.set_sndtimeo(config::millis(config.timeout))?;
    socket.connect(&config::endpoint(&config.server_url, config.request_port))?;
    Ok(socket)
}
