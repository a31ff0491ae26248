//! Wire schema shared by the controller and its workers.
//!
//! Every ZeroMQ message body is exactly one encoded record from this module.
//! Length delimiting comes from the transport framing, so records are encoded
//! and decoded whole. Field tags are part of the protocol contract and must
//! not be reassigned.

use prost::Message;

use crate::error::FabricError;

/// Request kinds a worker may issue on the request endpoint.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, ::prost::Enumeration)]
#[repr(i32)]
pub enum RequestKind {
    Initialize = 0,
    Connect = 1,
    Frame = 2,
    Heartbeat = 3,
}

/// Reply kinds the controller may answer with.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, ::prost::Enumeration)]
#[repr(i32)]
pub enum ResponseKind {
    Ok = 0,
    /// `Ok` plus the in-flight command, so a late joiner can catch up.
    OkEncourage = 1,
    /// All slots are taken; retry after the wait period.
    Wait = 2,
    /// The worker's slot was released; it must re-enter the handshake.
    Reset = 3,
    /// Recoverable; the offending message is simply dropped.
    SoftError = 4,
    /// Unrecoverable from the worker's current state; full client reset.
    Error = 5,
}

/// Command kinds broadcast on the command endpoint.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, ::prost::Enumeration)]
#[repr(i32)]
pub enum CommandKind {
    NoCommand = 0,
    Step = 1,
    Reset = 2,
    Close = 3,
    ResetClient = 4,
    WakeUp = 5,
}

/// A numeric array: row-major raw bytes plus dtype name and shape.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Tensor {
    #[prost(bytes = "vec", tag = "1")]
    pub data: Vec<u8>,
    #[prost(uint32, repeated, tag = "2")]
    pub shape: Vec<u32>,
    #[prost(string, tag = "3")]
    pub dtype: String,
}

/// One worker reply to a `Step` or `Reset` command.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Frame {
    #[prost(message, optional, tag = "1")]
    pub observation: Option<Tensor>,
    #[prost(double, tag = "2")]
    pub reward: f64,
    #[prost(bool, tag = "3")]
    pub done: bool,
    #[prost(bytes = "vec", tag = "4")]
    pub info: Vec<u8>,
    /// Nonce of the command this frame answers.
    #[prost(int64, tag = "5")]
    pub nonce: i64,
}

/// Opaque environment-space descriptors, encoded by the facade.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ConnectRequest {
    #[prost(bytes = "vec", tag = "1")]
    pub spaces: Vec<u8>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ConnectResponse {
    #[prost(uint32, tag = "1")]
    pub environment_id: u32,
    #[prost(message, optional, tag = "2")]
    pub last_command: Option<WorkerCommand>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct NameResponse {
    #[prost(string, tag = "1")]
    pub name: String,
    #[prost(int64, tag = "2")]
    pub seed: i64,
    #[prost(uint32, tag = "3")]
    pub server_version: u32,
    #[prost(uint32, tag = "4")]
    pub client_id: u32,
    #[prost(int64, tag = "5")]
    pub instance_id: i64,
    #[prost(bool, tag = "6")]
    pub reset_compensation: bool,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct MasterRequest {
    #[prost(enumeration = "RequestKind", tag = "1")]
    pub command: i32,
    #[prost(uint32, tag = "2")]
    pub client_id: u32,
    #[prost(int64, tag = "3")]
    pub instance_id: i64,
    #[prost(message, optional, tag = "4")]
    pub connect_payload: Option<ConnectRequest>,
    #[prost(message, optional, tag = "5")]
    pub frame: Option<Frame>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct MasterResponse {
    #[prost(enumeration = "ResponseKind", tag = "1")]
    pub response: i32,
    #[prost(message, optional, tag = "2")]
    pub name_response: Option<NameResponse>,
    #[prost(message, optional, tag = "3")]
    pub connect_response: Option<ConnectResponse>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct WorkerCommand {
    #[prost(enumeration = "CommandKind", tag = "1")]
    pub command: i32,
    #[prost(int64, tag = "2")]
    pub nonce: i64,
    /// Per-slot actions, encoded as an [`ActionBatch`] and indexed by env id.
    #[prost(bytes = "vec", tag = "3")]
    pub actions: Vec<u8>,
    #[prost(int64, tag = "4")]
    pub instance_id: i64,
}

/// The actions payload of a `Step` command, one entry per environment slot.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ActionBatch {
    #[prost(message, repeated, tag = "1")]
    pub actions: Vec<Tensor>,
}

impl MasterRequest {
    pub fn kind(&self) -> Option<RequestKind> {
        RequestKind::from_i32(self.command)
    }
}

impl MasterResponse {
    pub fn kind(&self) -> Option<ResponseKind> {
        ResponseKind::from_i32(self.response)
    }

    pub fn plain(kind: ResponseKind) -> Self {
        MasterResponse {
            response: kind as i32,
            ..Default::default()
        }
    }
}

impl WorkerCommand {
    pub fn kind(&self) -> Option<CommandKind> {
        CommandKind::from_i32(self.command)
    }
}

/// Decodes one transport message body into a record.
pub fn decode<M: Message + Default>(bytes: &[u8]) -> Result<M, FabricError> {
    Ok(M::decode(bytes)?)
}

/// Encodes a record into one transport message body.
pub fn encode<M: Message>(message: &M) -> Vec<u8> {
    message.encode_to_vec()
}
