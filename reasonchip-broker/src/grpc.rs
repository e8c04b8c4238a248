//! gRPC transport: the wire encoding of [`reasonchip_core::packet::Packet`]
//! as `Envelope` protobuf messages over one bidirectional `Channel` stream,
//! plus the server-side connection handler that feeds received packets
//! into the [`crate::broker::Broker`].

use std::sync::Arc;

use reasonchip_core::error::ReasonChipError;
use reasonchip_core::packet::{Cookie, Packet, Rc};
use reasonchip_core::transport::ClientTransport;
use reasonchip_core::value::Value;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tonic::{Request, Response, Status, Streaming};
use uuid::Uuid;

use crate::broker::Broker;

#[allow(clippy::enum_variant_names)]
pub mod proto {
    tonic::include_proto!("reasonchip.v1");
}

use proto::proto_value::Kind as ProtoKind;
use proto::{Envelope, ProtoMapping, ProtoRc, ProtoSequence, ProtoValue};

// ─────────────────────────── Value <-> ProtoValue ─────────────────────────

pub fn value_to_proto(v: &Value) -> ProtoValue {
    let kind = match v {
        Value::Null => ProtoKind::NullValue(true),
        Value::Bool(b) => ProtoKind::BoolValue(*b),
        Value::Int(n) => ProtoKind::IntValue(*n),
        Value::Float(f) => ProtoKind::FloatValue(*f),
        Value::Str(s) => ProtoKind::StrValue(s.clone()),
        Value::Bytes(b) => ProtoKind::BytesValue(b.clone()),
        Value::Sequence(items) => ProtoKind::SequenceValue(ProtoSequence {
            items: items.iter().map(value_to_proto).collect(),
        }),
        Value::Mapping(m) => ProtoKind::MappingValue(ProtoMapping {
            entries: m.iter().map(|(k, v)| (k.clone(), value_to_proto(v))).collect(),
        }),
    };
    ProtoValue { kind: Some(kind) }
}

pub fn proto_to_value(pv: &ProtoValue) -> Value {
    match &pv.kind {
        None | Some(ProtoKind::NullValue(_)) => Value::Null,
        Some(ProtoKind::BoolValue(b)) => Value::Bool(*b),
        Some(ProtoKind::IntValue(n)) => Value::Int(*n),
        Some(ProtoKind::FloatValue(f)) => Value::Float(*f),
        Some(ProtoKind::StrValue(s)) => Value::Str(s.clone()),
        Some(ProtoKind::BytesValue(b)) => Value::Bytes(b.clone()),
        Some(ProtoKind::SequenceValue(seq)) => Value::Sequence(seq.items.iter().map(proto_to_value).collect()),
        Some(ProtoKind::MappingValue(map)) => {
            Value::Mapping(map.entries.iter().map(|(k, v)| (k.clone(), proto_to_value(v))).collect())
        }
    }
}

fn rc_to_proto(rc: Rc) -> i32 {
    match rc {
        Rc::Ok => ProtoRc::ProtoRcOk as i32,
        Rc::Error => ProtoRc::ProtoRcError as i32,
        Rc::Cancelled => ProtoRc::ProtoRcCancelled as i32,
        Rc::NoWorkerAvailable => ProtoRc::ProtoRcNoWorkerAvailable as i32,
        Rc::WorkerLost => ProtoRc::ProtoRcWorkerLost as i32,
        Rc::BrokerLost => ProtoRc::ProtoRcBrokerLost as i32,
    }
}

fn proto_to_rc(rc: i32) -> Rc {
    match ProtoRc::try_from(rc).unwrap_or(ProtoRc::ProtoRcError) {
        ProtoRc::ProtoRcOk => Rc::Ok,
        ProtoRc::ProtoRcCancelled => Rc::Cancelled,
        ProtoRc::ProtoRcNoWorkerAvailable => Rc::NoWorkerAvailable,
        ProtoRc::ProtoRcWorkerLost => Rc::WorkerLost,
        ProtoRc::ProtoRcBrokerLost => Rc::BrokerLost,
        ProtoRc::ProtoRcError | ProtoRc::ProtoRcUnspecified => Rc::Error,
    }
}

// ─────────────────────────── Packet <-> Envelope ───────────────────────────

pub fn packet_to_envelope(packet: &Packet) -> Envelope {
    use proto::envelope::Packet as EnvPacket;
    let inner = match packet {
        Packet::Register { capacity } => EnvPacket::Register(proto::RegisterPacket { capacity: *capacity }),
        Packet::Run { cookie, pipeline, variables } => EnvPacket::Run(proto::RunPacket {
            cookie: cookie.to_string(),
            pipeline: pipeline.clone(),
            variables: Some(value_to_proto(variables)),
        }),
        Packet::Cancel { cookie } => EnvPacket::Cancel(proto::CancelPacket { cookie: cookie.to_string() }),
        Packet::Result { cookie, rc, value, error } => EnvPacket::Result(proto::ResultPacket {
            cookie: cookie.to_string(),
            rc: rc_to_proto(*rc),
            value: Some(value_to_proto(value)),
            error: error.clone(),
        }),
        Packet::Shutdown => EnvPacket::Shutdown(proto::ShutdownPacket {}),
    };
    Envelope { packet: Some(inner) }
}

fn parse_cookie(s: &str) -> Result<Cookie, ReasonChipError> {
    Uuid::parse_str(s).map_err(|e| ReasonChipError::Framing(format!("invalid cookie `{s}`: {e}")))
}

pub fn envelope_to_packet(envelope: &Envelope) -> Result<Packet, ReasonChipError> {
    use proto::envelope::Packet as EnvPacket;
    match &envelope.packet {
        Some(EnvPacket::Register(r)) => Ok(Packet::Register { capacity: r.capacity }),
        Some(EnvPacket::Run(r)) => Ok(Packet::Run {
            cookie: parse_cookie(&r.cookie)?,
            pipeline: r.pipeline.clone(),
            variables: r.variables.as_ref().map(proto_to_value).unwrap_or(Value::Null),
        }),
        Some(EnvPacket::Cancel(c)) => Ok(Packet::Cancel { cookie: parse_cookie(&c.cookie)? }),
        Some(EnvPacket::Result(r)) => Ok(Packet::Result {
            cookie: parse_cookie(&r.cookie)?,
            rc: proto_to_rc(r.rc),
            value: r.value.as_ref().map(proto_to_value).unwrap_or(Value::Null),
            error: r.error.clone(),
        }),
        Some(EnvPacket::Shutdown(_)) => Ok(Packet::Shutdown),
        None => Err(ReasonChipError::Framing("envelope with no packet set".to_string())),
    }
}

// ─────────────────────────── Client-side transport ─────────────────────────

/// A live gRPC connection dialed out to a broker, implementing
/// [`ClientTransport`] so [`crate::worker::TaskManager`] and
/// [`crate::client::Multiplexor`] don't need to know they're on the wire.
pub struct GrpcClientTransport {
    outbound: mpsc::Sender<Envelope>,
    inbound: Streaming<Envelope>,
}

impl GrpcClientTransport {
    pub async fn connect(addr: String) -> Result<Self, ReasonChipError> {
        let mut client = proto::reasonchip_client::ReasonchipClient::connect(addr)
            .await
            .map_err(|e| ReasonChipError::ConnectionRefused(e.to_string()))?;
        let (tx, rx) = mpsc::channel(64);
        let response = client
            .channel(ReceiverStream::new(rx))
            .await
            .map_err(|e| ReasonChipError::ConnectionRefused(e.to_string()))?;
        Ok(Self {
            outbound: tx,
            inbound: response.into_inner(),
        })
    }
}

#[tonic::async_trait]
impl ClientTransport for GrpcClientTransport {
    async fn recv(&mut self) -> Result<Option<Packet>, ReasonChipError> {
        match self.inbound.message().await {
            Ok(Some(env)) => Ok(Some(envelope_to_packet(&env)?)),
            Ok(None) => Ok(None),
            Err(status) => Err(ReasonChipError::Disconnected(status.to_string())),
        }
    }

    async fn send(&mut self, packet: Packet) -> Result<(), ReasonChipError> {
        self.outbound
            .send(packet_to_envelope(&packet))
            .await
            .map_err(|_| ReasonChipError::Disconnected("broker connection closed".to_string()))
    }
}

// ─────────────────────────── Server-side service ───────────────────────────

pub struct ReasonchipService {
    pub broker: Arc<Broker>,
}

async fn handle_client_packet(broker: &Broker, client_id: Uuid, packet: Packet) {
    match packet {
        Packet::Run { cookie, pipeline, variables } => {
            if let Err(e) = broker.submit_run(client_id, cookie, pipeline, variables).await {
                tracing::warn!(error = %e, %cookie, "failed to submit run");
            }
        }
        Packet::Cancel { cookie } => {
            let _ = broker.handle_cancel(cookie).await;
        }
        Packet::Shutdown => {}
        Packet::Register { .. } | Packet::Result { .. } => {
            tracing::warn!(%client_id, "client connection sent a worker-only packet");
        }
    }
}

#[tonic::async_trait]
impl proto::reasonchip_server::Reasonchip for ReasonchipService {
    type ChannelStream = ReceiverStream<Result<Envelope, Status>>;

    async fn channel(&self, request: Request<Streaming<Envelope>>) -> Result<Response<Self::ChannelStream>, Status> {
        let mut inbound = request.into_inner();
        let (response_tx, response_rx) = mpsc::channel::<Result<Envelope, Status>>(64);
        let (packet_tx, mut packet_rx) = mpsc::channel::<Packet>(64);

        // Relay Packets the broker wants delivered on this connection into
        // the gRPC response stream.
        tokio::spawn(async move {
            while let Some(packet) = packet_rx.recv().await {
                if response_tx.send(Ok(packet_to_envelope(&packet))).await.is_err() {
                    break;
                }
            }
        });

        let broker = self.broker.clone();
        tokio::spawn(async move {
            let Ok(Some(first)) = inbound.message().await else {
                return;
            };
            let Ok(first_packet) = envelope_to_packet(&first) else {
                return;
            };

            if let Packet::Register { capacity } = first_packet {
                let worker_id = Uuid::new_v4();
                broker.register_worker(worker_id, packet_tx).await;
                broker.worker_registered_capacity(worker_id, capacity).await;
                loop {
                    match inbound.message().await {
                        Ok(Some(env)) => match envelope_to_packet(&env) {
                            Ok(Packet::Result { cookie, rc, value, error }) => {
                                let _ = broker.handle_result(worker_id, cookie, rc, value, error).await;
                            }
                            Ok(Packet::Register { capacity }) => {
                                broker.worker_registered_capacity(worker_id, capacity).await;
                            }
                            Ok(Packet::Shutdown) | Err(_) => break,
                            Ok(_) => {}
                        },
                        _ => break,
                    }
                }
                broker.worker_disconnected(worker_id).await;
            } else {
                let client_id = Uuid::new_v4();
                broker.register_client(client_id, packet_tx).await;
                handle_client_packet(&broker, client_id, first_packet).await;
                loop {
                    match inbound.message().await {
                        Ok(Some(env)) => match envelope_to_packet(&env) {
                            Ok(packet) => handle_client_packet(&broker, client_id, packet).await,
                            Err(_) => break,
                        },
                        _ => break,
                    }
                }
                broker.client_disconnected(client_id).await;
            }
        });

        Ok(Response::new(ReceiverStream::new(response_rx)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn value_round_trips_through_proto() {
        let mut m = std::collections::BTreeMap::new();
        m.insert("a".to_string(), Value::Int(1));
        m.insert("b".to_string(), Value::Sequence(vec![Value::Str("x".into()), Value::Null]));
        let v = Value::Mapping(m);
        assert_eq!(proto_to_value(&value_to_proto(&v)), v);
    }

    #[test]
    fn packet_round_trips_through_envelope() {
        let cookie = Uuid::new_v4();
        let packet = Packet::Result {
            cookie,
            rc: Rc::Cancelled,
            value: Value::Bool(true),
            error: Some("cancelled by caller".to_string()),
        };
        let env = packet_to_envelope(&packet);
        let back = envelope_to_packet(&env).unwrap();
        assert!(matches!(back, Packet::Result { cookie: c, rc: Rc::Cancelled, .. } if c == cookie));
    }
}
