//! camstream core
//!
//! Transport-agnostic pieces of the camera restreaming service:
//!
//! - [`command`]: start/stop requests, credentials and the state vocabulary
//! - [`ports`]: process-wide reservation of local UDP ports
//! - [`sdp`]: rewriting remote descriptions into transcoder input
//! - [`transcoder`]: supervision of the external transcoder process
//! - [`pool`]: worker slots, least-loaded scheduling and state relay
//!
//! Concrete sessions plug into the pool through [`SessionLauncher`].

pub mod command;
pub mod config;
pub mod error;
pub mod pool;
pub mod ports;
pub mod registry;
pub mod sdp;
pub mod session;
pub mod timer;
pub mod transcoder;

pub use command::{
    Command, Credential, DeviceId, DeviceIdentity, SessionOutcome, SessionSource, StartRequest,
    StateUpdate, StopRequest, StreamKind, StreamStatus,
};
pub use config::{OutputConfig, PoolConfig, PortConfig, TranscoderConfig};
pub use error::{Error, ErrorClass, Result};
pub use pool::WorkerPool;
pub use ports::{PortPool, PortReservation};
pub use registry::{SessionId, SessionRegistry};
pub use session::{SessionContext, SessionControl, SessionLauncher, StopSignal};
pub use timer::RepeatingTimer;
pub use transcoder::{ExitReason, TranscodeJob, TranscoderProcess};
