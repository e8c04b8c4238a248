//! Worker-side task manager: bounded-concurrency pipeline execution, fed
//! RUN/CANCEL from the broker over a [`ClientTransport`] and replenishing
//! its own capacity with a REGISTER after every completed run.

use std::collections::HashMap;
use std::sync::Arc;

use reasonchip_core::engine::Engine;
use reasonchip_core::error::ReasonChipError;
use reasonchip_core::packet::{Cookie, Packet, Rc};
use reasonchip_core::transport::ClientTransport;
use tokio::sync::{mpsc, Mutex};
use tokio::task::AbortHandle;

/// Runs pipelines on behalf of a broker, never more than `capacity` at
/// once. Each run is its own tokio task so a CANCEL can abort it without
/// touching the others.
pub struct TaskManager {
    capacity: u32,
    engine: Arc<Engine>,
    running: Mutex<HashMap<Cookie, AbortHandle>>,
}

impl TaskManager {
    pub fn new(capacity: u32, engine: Arc<Engine>) -> Arc<Self> {
        Arc::new(Self {
            capacity,
            engine,
            running: Mutex::new(HashMap::new()),
        })
    }

    /// Drive one connection to the broker until it closes or sends
    /// SHUTDOWN. Announces the full capacity up front, then one more
    /// slot each time a run finishes.
    pub async fn run<T: ClientTransport>(self: Arc<Self>, mut transport: T) -> Result<(), ReasonChipError> {
        transport.send(Packet::Register { capacity: self.capacity }).await?;

        let (done_tx, mut done_rx) = mpsc::channel::<Packet>(self.capacity.max(1) as usize * 2);

        loop {
            tokio::select! {
                incoming = transport.recv() => {
                    match incoming? {
                        Some(Packet::Run { cookie, pipeline, variables }) => {
                            self.clone().spawn_run(cookie, pipeline, variables, done_tx.clone()).await;
                        }
                        Some(Packet::Cancel { cookie }) => {
                            self.cancel(cookie, done_tx.clone()).await;
                        }
                        Some(Packet::Shutdown) | None => break,
                        Some(other) => {
                            tracing::warn!(kind = other.kind_name(), "worker received an unexpected packet");
                        }
                    }
                }
                Some(outbound) = done_rx.recv() => {
                    transport.send(outbound).await?;
                }
            }
        }
        Ok(())
    }

    async fn spawn_run(
        self: Arc<Self>,
        cookie: Cookie,
        pipeline: String,
        variables: reasonchip_core::value::Value,
        done_tx: mpsc::Sender<Packet>,
    ) {
        let engine = self.engine.clone();
        let manager = self.clone();
        let handle = tokio::spawn(async move {
            let result = engine.run(&pipeline, variables).await;
            let packet = match result {
                Ok(value) => Packet::Result { cookie, rc: Rc::Ok, value, error: None },
                Err(e) => Packet::Result {
                    cookie,
                    rc: Rc::Error,
                    value: reasonchip_core::value::Value::Null,
                    error: Some(e.to_string()),
                },
            };
            manager.running.lock().await.remove(&cookie);
            let _ = done_tx.send(packet).await;
            let _ = done_tx.send(Packet::Register { capacity: 1 }).await;
        });
        self.running.lock().await.insert(cookie, handle.abort_handle());
    }

    async fn cancel(&self, cookie: Cookie, done_tx: mpsc::Sender<Packet>) {
        let handle = self.running.lock().await.remove(&cookie);
        if let Some(handle) = handle {
            handle.abort();
            let _ = done_tx
                .send(Packet::Result {
                    cookie,
                    rc: Rc::Cancelled,
                    value: reasonchip_core::value::Value::Null,
                    error: Some("cancelled".to_string()),
                })
                .await;
            let _ = done_tx.send(Packet::Register { capacity: 1 }).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reasonchip_core::pipeline::{Pipeline, PipelineCollection};
    use reasonchip_core::transport::InMemoryTransport;
    use reasonchip_core::value::Value;
    use uuid::Uuid;

    fn engine_with(name: &str, yaml: &str) -> Arc<Engine> {
        let mut engine = Engine::new();
        let pipeline: Pipeline = serde_yaml::from_str(yaml).unwrap();
        let mut coll = PipelineCollection::new();
        coll.insert(name.to_string(), pipeline);
        struct OneShotLoader(PipelineCollection);
        impl reasonchip_core::pipeline::PipelineLoader for OneShotLoader {
            fn load(&self) -> Result<PipelineCollection, ReasonChipError> {
                Ok(self.0.clone())
            }
        }
        engine.load(&OneShotLoader(coll)).unwrap();
        Arc::new(engine)
    }

    #[tokio::test]
    async fn run_executes_and_replenishes_capacity() {
        let engine = engine_with("main", "tasks:\n  - return: 42\n");
        let manager = TaskManager::new(2, engine);
        let (mut broker_side, worker_side) = InMemoryTransport::pair(8);

        let handle = tokio::spawn(manager.run(worker_side));

        let register = reasonchip_core::transport::ServerTransport::recv(&mut broker_side).await.unwrap().unwrap();
        assert!(matches!(register, Packet::Register { capacity: 2 }));

        let cookie = Uuid::new_v4();
        reasonchip_core::transport::ServerTransport::send(
            &mut broker_side,
            Packet::Run { cookie, pipeline: "main".to_string(), variables: Value::Null },
        )
        .await
        .unwrap();

        let result = reasonchip_core::transport::ServerTransport::recv(&mut broker_side).await.unwrap().unwrap();
        assert!(matches!(result, Packet::Result { rc: Rc::Ok, value: Value::Int(42), .. }));

        let replenish = reasonchip_core::transport::ServerTransport::recv(&mut broker_side).await.unwrap().unwrap();
        assert!(matches!(replenish, Packet::Register { capacity: 1 }));

        reasonchip_core::transport::ServerTransport::send(&mut broker_side, Packet::Shutdown).await.unwrap();
        handle.await.unwrap().unwrap();
    }
}
