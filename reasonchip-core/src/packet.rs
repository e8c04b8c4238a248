//! Wire-level messages exchanged between client, broker, and worker:
//! REGISTER, RUN, CANCEL, RESULT, SHUTDOWN.

use crate::value::Value;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Correlates a RUN with its eventual RESULT and any CANCEL in between.
pub type Cookie = Uuid;

/// Outcome code carried on a RESULT packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Rc {
    Ok,
    Error,
    Cancelled,
    NoWorkerAvailable,
    WorkerLost,
    BrokerLost,
}

impl std::fmt::Display for Rc {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Rc::Ok => "OK",
            Rc::Error => "ERROR",
            Rc::Cancelled => "CANCELLED",
            Rc::NoWorkerAvailable => "NO_WORKER_AVAILABLE",
            Rc::WorkerLost => "WORKER_LOST",
            Rc::BrokerLost => "BROKER_LOST",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Packet {
    /// Worker -> broker: "I have `capacity` free run slots."
    Register { capacity: u32 },
    /// Client -> broker -> worker: run `pipeline` with `variables`.
    Run {
        cookie: Cookie,
        pipeline: String,
        variables: Value,
    },
    /// Client -> broker -> worker: cancel the run under `cookie`, if any.
    Cancel { cookie: Cookie },
    /// Worker -> broker -> client: the run under `cookie` finished.
    Result {
        cookie: Cookie,
        rc: Rc,
        value: Value,
        error: Option<String>,
    },
    /// Either direction: the peer is about to close the connection.
    Shutdown,
}

impl Packet {
    pub fn kind_name(&self) -> &'static str {
        match self {
            Packet::Register { .. } => "REGISTER",
            Packet::Run { .. } => "RUN",
            Packet::Cancel { .. } => "CANCEL",
            Packet::Result { .. } => "RESULT",
            Packet::Shutdown => "SHUTDOWN",
        }
    }

    pub fn cookie(&self) -> Option<Cookie> {
        match self {
            Packet::Run { cookie, .. } | Packet::Cancel { cookie, .. } | Packet::Result { cookie, .. } => Some(*cookie),
            Packet::Register { .. } | Packet::Shutdown => None,
        }
    }
}
