//! Client-side multiplexor: one connection to the broker shared by many
//! concurrent `run_pipeline` callers, demultiplexed by cookie.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use reasonchip_core::error::ReasonChipError;
use reasonchip_core::packet::{Cookie, Packet, Rc};
use reasonchip_core::transport::ClientTransport;
use reasonchip_core::value::Value;
use tokio::sync::{mpsc, Mutex};
use uuid::Uuid;

struct Inner {
    sessions: Mutex<HashMap<Cookie, mpsc::Sender<Packet>>>,
    outbound: mpsc::Sender<Packet>,
    poisoned: AtomicBool,
}

/// Demultiplexes RESULT packets by cookie back to whichever
/// `run_pipeline` call is waiting on them, over a single shared
/// connection to the broker.
#[derive(Clone)]
pub struct Multiplexor {
    inner: Arc<Inner>,
}

impl Multiplexor {
    /// Spawns the reader loop that pumps `transport` and returns once the
    /// Multiplexor is ready to accept `run_pipeline` calls.
    pub fn spawn<T: ClientTransport + 'static>(mut transport: T) -> Self {
        let (outbound_tx, mut outbound_rx) = mpsc::channel::<Packet>(64);
        let inner = Arc::new(Inner {
            sessions: Mutex::new(HashMap::new()),
            outbound: outbound_tx,
            poisoned: AtomicBool::new(false),
        });

        let reader_inner = inner.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    incoming = transport.recv() => {
                        match incoming {
                            Ok(Some(packet)) => Self::dispatch(&reader_inner, packet).await,
                            Ok(None) | Err(_) => {
                                reader_inner.poisoned.store(true, Ordering::SeqCst);
                                break;
                            }
                        }
                    }
                    Some(packet) = outbound_rx.recv() => {
                        if transport.send(packet).await.is_err() {
                            reader_inner.poisoned.store(true, Ordering::SeqCst);
                            break;
                        }
                    }
                }
            }
        });

        Self { inner }
    }

    async fn dispatch(inner: &Inner, packet: Packet) {
        if let Packet::Result { cookie, .. } = &packet {
            let sender = inner.sessions.lock().await.remove(cookie);
            if let Some(sender) = sender {
                let _ = sender.send(packet).await;
            }
        }
    }

    fn check_alive(&self) -> Result<(), ReasonChipError> {
        if self.inner.poisoned.load(Ordering::SeqCst) {
            Err(ReasonChipError::BrokerLost)
        } else {
            Ok(())
        }
    }

    /// Send RUN and await the matching RESULT, translating a non-OK
    /// outcome into an error.
    pub async fn run_pipeline(&self, pipeline: impl Into<String>, variables: Value) -> Result<Value, ReasonChipError> {
        self.check_alive()?;
        let cookie = Uuid::new_v4();
        let (tx, mut rx) = mpsc::channel(1);
        self.inner.sessions.lock().await.insert(cookie, tx);

        self.inner
            .outbound
            .send(Packet::Run { cookie, pipeline: pipeline.into(), variables })
            .await
            .map_err(|_| ReasonChipError::BrokerLost)?;

        let result = rx.recv().await.ok_or(ReasonChipError::BrokerLost)?;
        match result {
            Packet::Result { rc: Rc::Ok, value, .. } => Ok(value),
            Packet::Result { rc, error, .. } => Err(ReasonChipError::RemoteRunFailed {
                rc: rc.to_string(),
                detail: error.unwrap_or_default(),
            }),
            other => Err(ReasonChipError::UnexpectedPacket(other.kind_name().to_string())),
        }
    }

    pub async fn cancel(&self, cookie: Cookie) -> Result<(), ReasonChipError> {
        self.check_alive()?;
        self.inner.outbound.send(Packet::Cancel { cookie }).await.map_err(|_| ReasonChipError::BrokerLost)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reasonchip_core::transport::{InMemoryTransport, ServerTransport};

    #[tokio::test]
    async fn run_pipeline_resolves_on_matching_result() {
        let (mut broker_side, client_side) = InMemoryTransport::pair(8);
        let mux = Multiplexor::spawn(client_side);

        let broker_task = tokio::spawn(async move {
            let run = broker_side.recv().await.unwrap().unwrap();
            let cookie = run.cookie().unwrap();
            ServerTransport::send(&mut broker_side, Packet::Result { cookie, rc: Rc::Ok, value: Value::Int(9), error: None })
                .await
                .unwrap();
            broker_side
        });

        let value = mux.run_pipeline("main", Value::Null).await.unwrap();
        assert_eq!(value, Value::Int(9));
        broker_task.await.unwrap();
    }

    #[tokio::test]
    async fn broker_loss_poisons_future_calls() {
        let (broker_side, client_side) = InMemoryTransport::pair(8);
        let mux = Multiplexor::spawn(client_side);
        drop(broker_side);

        // Give the reader task a chance to observe the closed channel.
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;

        let err = mux.run_pipeline("main", Value::Null).await.unwrap_err();
        assert!(matches!(err, ReasonChipError::BrokerLost));
    }
}
