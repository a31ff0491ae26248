//! The controller: the authoritative peer that federates N workers into one
//! synchronous vector of environments.
//!
//! It binds two endpoints. The request endpoint (REP) serves one worker
//! request at a time: handshakes, frames, heartbeats. The command endpoint
//! (PUB) fans commands out to every worker. A step is one broadcast followed
//! by a rendezvous: exactly one fresh frame per slot must arrive before the
//! caller unblocks, with timeout-driven recovery for slow or dead workers.

pub mod frames;
pub mod slots;

use std::time::{Duration, Instant};

use log::{debug, info, warn};
use rand::Rng;

use crate::config::{self, ControllerConfig};
use crate::error::FabricError;
use crate::proto::{
    self, CommandKind, ConnectResponse, MasterRequest, MasterResponse, NameResponse, RequestKind,
    ResponseKind, Tensor, WorkerCommand,
};
use frames::{FrameBuffer, StoreOutcome};
use slots::{SlotDecision, SlotTable};

pub use frames::StepBatch;

/// Server side of the fabric. Single-threaded: every mutation happens on the
/// caller's thread between two polls.
pub struct Controller {
    config: ControllerConfig,
    instance_id: i64,
    request_socket: zmq::Socket,
    command_socket: zmq::Socket,
    // Keeps the sockets' io threads alive for the controller's lifetime.
    _context: zmq::Context,
    slots: SlotTable,
    frames: FrameBuffer,
    current_nonce: i64,
    last_command: Option<WorkerCommand>,
    spaces_payload: Option<Vec<u8>>,
    is_closed: bool,
}

impl Controller {
    /// Binds both endpoints and announces a new controller generation so that
    /// workers of a previous instance discard their state and re-handshake.
    pub fn new(config: ControllerConfig) -> Result<Controller, FabricError> {
        let context = zmq::Context::new();
        let linger = config::millis(config.linger);

        let request_socket = context.socket(zmq::REP)?;
        request_socket.set_linger(linger)?;
        request_socket.bind(&config::endpoint(&config.server_url, config.request_port))?;

        let command_socket = context.socket(zmq::PUB)?;
        command_socket.set_linger(linger)?;
        command_socket.bind(&config::endpoint(&config.server_url, config.command_port))?;

        let instance_id = rand::thread_rng().gen::<i64>();
        info!(
            "controller {}: listening on ports {}/{} for {} environments",
            instance_id, config.request_port, config.command_port, config.number_of_environments
        );

        let capacity = config.number_of_environments;
        let mut controller = Controller {
            config,
            instance_id,
            request_socket,
            command_socket,
            _context: context,
            slots: SlotTable::new(capacity),
            frames: FrameBuffer::new(capacity),
            current_nonce: 0,
            last_command: None,
            spaces_payload: None,
            is_closed: false,
        };
        controller.publish(CommandKind::ResetClient, Vec::new())?;
        Ok(controller)
    }

    pub fn instance_id(&self) -> i64 {
        self.instance_id
    }

    pub fn current_nonce(&self) -> i64 {
        self.current_nonce
    }

    pub fn connected_workers(&self) -> usize {
        self.slots.occupied()
    }

    pub fn number_of_environments(&self) -> usize {
        self.config.number_of_environments
    }

    pub fn is_closed(&self) -> bool {
        self.is_closed
    }

    /// Pumps the request endpoint until every slot is occupied and the space
    /// descriptors are known, then returns the opaque spaces payload.
    pub fn initialize(&mut self) -> Result<Vec<u8>, FabricError> {
        self.ensure_open()?;
        info!(
            "controller {}: awaiting {} workers",
            self.instance_id, self.config.number_of_environments
        );
        while !self.slots.is_full() || self.spaces_payload.is_none() {
            self.poll_request(self.config.poll_interval)?;
        }
        info!("controller {}: all workers connected", self.instance_id);
        self.spaces_payload
            .clone()
            .ok_or_else(|| FabricError::protocol("spaces payload vanished after rendezvous"))
    }

    /// Resets every environment and returns the batch of first observations.
    pub fn reset_environments(&mut self) -> Result<Vec<Tensor>, FabricError> {
        self.ensure_open()?;
        self.publish(CommandKind::Reset, Vec::new())?;
        self.frames.clear();
        Ok(self.gather_frames()?.observations)
    }

    /// Broadcasts one step's actions. Pair with [`Controller::gather_frames`].
    pub fn send_actions(&mut self, actions: Vec<u8>) -> Result<(), FabricError> {
        self.ensure_open()?;
        self.publish(CommandKind::Step, actions)?;
        self.frames.clear();
        Ok(())
    }

    /// Blocks until every slot has delivered one fresh frame, recovering from
    /// silent slots at each step-timeout boundary.
    pub fn gather_frames(&mut self) -> Result<StepBatch, FabricError> {
        self.ensure_open()?;
        let mut round_started = Instant::now();
        while !self.frames.is_ready() {
            self.poll_request(self.config.poll_interval)?;
            if round_started.elapsed() >= self.config.step_timeout {
                self.recover_round()?;
                round_started = Instant::now();
            }
        }
        Ok(self.frames.take_batch())
    }

    /// Broadcasts `Close` and shuts the connection down. Further calls on any
    /// operation fail with [`FabricError::Closed`].
    pub fn close_environments(&mut self) -> Result<(), FabricError> {
        self.ensure_open()?;
        info!("controller {}: closing", self.instance_id);
        self.publish(CommandKind::Close, Vec::new())?;
        self.is_closed = true;
        Ok(())
    }

    /// Services at most one request within `timeout`. Returns whether a
    /// request was handled. Public so an embedding event loop can interleave
    /// its own work with the fabric's.
    pub fn poll_request(&mut self, timeout: Duration) -> Result<bool, FabricError> {
        if self
            .request_socket
            .poll(zmq::POLLIN, i64::from(config::millis(timeout)))?
            == 0
        {
            return Ok(false);
        }
        let raw = self.request_socket.recv_bytes(0)?;
        let (reply, failure) = match proto::decode::<MasterRequest>(&raw) {
            Ok(request) => match self.handle_request(request) {
                Ok(reply) => (reply, None),
                Err(error) => (MasterResponse::plain(ResponseKind::Error), Some(error)),
            },
            Err(error) => {
                warn!("controller {}: dropping undecodable request: {}", self.instance_id, error);
                (MasterResponse::plain(ResponseKind::Error), None)
            }
        };
        self.request_socket.send(proto::encode(&reply), 0)?;
        match failure {
            Some(error) => Err(error),
            None => Ok(true),
        }
    }

    fn ensure_open(&self) -> Result<(), FabricError> {
        if self.is_closed {
            Err(FabricError::Closed)
        } else {
            Ok(())
        }
    }

    /// Stamps, records and emits one command. Every broadcast consumes a
    /// nonce, but only the frame-expecting commands define a round: replaying
    /// a `WakeUp` or a generation announcement to a late joiner would make it
    /// push a frame nobody asked for.
    fn publish(&mut self, kind: CommandKind, actions: Vec<u8>) -> Result<(), FabricError> {
        let nonce = self.current_nonce + 1;
        let command = WorkerCommand {
            command: kind as i32,
            nonce,
            actions,
            instance_id: self.instance_id,
        };
        if matches!(kind, CommandKind::Step | CommandKind::Reset) {
            self.last_command = Some(command.clone());
        }
        self.current_nonce = nonce;
        debug!("controller {}: broadcasting {:?} nonce {}", self.instance_id, kind, nonce);
        self.command_socket.send(proto::encode(&command), 0)?;
        Ok(())
    }

    /// Nonce of the in-flight round, if any. Frames are matched against this.
    fn round_nonce(&self) -> Option<i64> {
        self.last_command.as_ref().map(|command| command.nonce)
    }

    /// Step-timeout recovery: release and substitute every silent occupied
    /// slot. When nothing could be released, the broadcast itself is presumed
    /// lost and the round command is replayed under a fresh nonce.
    fn recover_round(&mut self) -> Result<(), FabricError> {
        let mut released = 0;
        for env_id in 0..self.config.number_of_environments as u32 {
            if !self.frames.is_empty_cell(env_id) {
                continue;
            }
            if let Some(client_id) = self.slots.unregister(env_id) {
                warn!(
                    "controller {}: client {} on slot {} missed the step deadline",
                    self.instance_id, client_id, env_id
                );
                self.frames.substitute(env_id);
                released += 1;
            }
        }
        if released == 0 {
            if let Some(command) = self.last_command.clone() {
                let kind = command.kind().unwrap_or(CommandKind::NoCommand);
                warn!(
                    "controller {}: nothing to release, replaying {:?}",
                    self.instance_id, kind
                );
                self.publish(kind, command.actions)?;
            }
        }
        Ok(())
    }

    fn handle_request(&mut self, request: MasterRequest) -> Result<MasterResponse, FabricError> {
        let kind = request.kind().ok_or_else(|| {
            FabricError::protocol(format!("unknown request kind {}", request.command))
        })?;
        // A worker of another controller generation gets a hard error on
        // everything except the one request that cannot know our id yet.
        if kind != RequestKind::Initialize && request.instance_id != self.instance_id {
            info!(
                "controller {}: rejecting client {} bound to instance {}",
                self.instance_id, request.client_id, request.instance_id
            );
            return Ok(MasterResponse::plain(ResponseKind::Error));
        }
        match kind {
            RequestKind::Initialize => Ok(self.handle_initialize()),
            RequestKind::Connect => Ok(self.handle_connect(request)),
            RequestKind::Frame => self.handle_frame(request),
            RequestKind::Heartbeat => Ok(MasterResponse::plain(ResponseKind::Ok)),
        }
    }

    fn handle_initialize(&mut self) -> MasterResponse {
        let client_id = self.slots.assign_client_id();
        info!("controller {}: assigned client id {}", self.instance_id, client_id);
        MasterResponse {
            response: ResponseKind::Ok as i32,
            name_response: Some(NameResponse {
                name: self.config.environment_name.clone(),
                seed: i64::from(client_id),
                server_version: self.config.server_version,
                client_id,
                instance_id: self.instance_id,
                reset_compensation: self.config.reset_compensation,
            }),
            connect_response: None,
        }
    }

    fn handle_connect(&mut self, request: MasterRequest) -> MasterResponse {
        if self.spaces_payload.is_none() {
            if let Some(payload) = &request.connect_payload {
                if !payload.spaces.is_empty() {
                    self.spaces_payload = Some(payload.spaces.clone());
                }
            }
        }
        match self.slots.bind(request.client_id) {
            SlotDecision::Full => {
                debug!(
                    "controller {}: no free slot for client {}",
                    self.instance_id, request.client_id
                );
                MasterResponse::plain(ResponseKind::Wait)
            }
            SlotDecision::Bound(environment_id) => {
                info!(
                    "controller {}: client {} occupies slot {}",
                    self.instance_id, request.client_id, environment_id
                );
                // A mid-step joiner gets the in-flight command so it can
                // catch up without waiting for the next broadcast.
                let last_command = self.last_command.clone();
                let response = if last_command.is_some() {
                    ResponseKind::OkEncourage
                } else {
                    ResponseKind::Ok
                };
                MasterResponse {
                    response: response as i32,
                    name_response: None,
                    connect_response: Some(ConnectResponse {
                        environment_id,
                        last_command,
                    }),
                }
            }
        }
    }

    fn handle_frame(&mut self, request: MasterRequest) -> Result<MasterResponse, FabricError> {
        let Some(env_id) = self.slots.env_of(request.client_id) else {
            warn!(
                "controller {}: frame from unregistered client {}",
                self.instance_id, request.client_id
            );
            return Ok(MasterResponse::plain(ResponseKind::Error));
        };
        let Some(frame) = request.frame else {
            warn!("controller {}: frame request without a frame", self.instance_id);
            return Ok(MasterResponse::plain(ResponseKind::Error));
        };
        match self.round_nonce() {
            Some(round) if round == frame.nonce => {}
            round => {
                debug!(
                    "controller {}: dropping frame with nonce {} (round {:?})",
                    self.instance_id, frame.nonce, round
                );
                return Ok(MasterResponse::plain(ResponseKind::SoftError));
            }
        }
        let Some(observation) = frame.observation else {
            warn!(
                "controller {}: frame from client {} without an observation",
                self.instance_id, request.client_id
            );
            return Ok(MasterResponse::plain(ResponseKind::Error));
        };
        match self
            .frames
            .store(env_id, observation, frame.reward, frame.done, frame.info)
        {
            StoreOutcome::AlreadyFilled => Ok(MasterResponse::plain(ResponseKind::SoftError)),
            StoreOutcome::Stored => {
                debug!(
                    "controller {}: slot {} delivered (done = {})",
                    self.instance_id, env_id, frame.done
                );
                if frame.done && self.config.reset_compensation {
                    // The episode ended; release the slot so a fresh worker
                    // can take it while this one resets out-of-band.
                    self.slots.unregister(env_id);
                    info!(
                        "controller {}: slot {} released for out-of-band reset",
                        self.instance_id, env_id
                    );
                    self.publish(CommandKind::WakeUp, Vec::new())?;
                    Ok(MasterResponse::plain(ResponseKind::Reset))
                } else {
                    Ok(MasterResponse::plain(ResponseKind::Ok))
                }
            }
        }
    }
}
