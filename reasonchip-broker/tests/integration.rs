//! Scenario tests for Broker + Switchboard + TaskManager + Multiplexor
//! wired together end to end over [`InMemoryTransport`] pairs — no socket,
//! no gRPC, exercising exactly the packet-routing contract the wire
//! encoding in `src/grpc.rs` is responsible for carrying faithfully.

use std::sync::Arc;

use reasonchip_broker::broker::Broker;
use reasonchip_broker::client::Multiplexor;
use reasonchip_broker::worker::TaskManager;
use reasonchip_core::engine::Engine;
use reasonchip_core::packet::{Packet, Rc};
use reasonchip_core::pipeline::{Pipeline, PipelineCollection, PipelineLoader};
use reasonchip_core::transport::{InMemoryTransport, ServerTransport};
use reasonchip_core::value::Value;
use uuid::Uuid;

struct OneShotLoader(PipelineCollection);
impl PipelineLoader for OneShotLoader {
    fn load(&self) -> Result<PipelineCollection, reasonchip_core::error::ReasonChipError> {
        Ok(self.0.clone())
    }
}

fn engine_with(pipelines: &[(&str, &str)]) -> Arc<Engine> {
    let mut engine = Engine::new();
    let mut coll = PipelineCollection::new();
    for (name, yaml) in pipelines {
        let pipeline: Pipeline = serde_yaml::from_str(yaml).unwrap();
        coll.insert(name.to_string(), pipeline);
    }
    engine.load(&OneShotLoader(coll)).unwrap();
    Arc::new(engine)
}

/// Wires one broker connection server-side: accepts the transport and
/// drives its reader/writer loop the way `ReasonchipService::channel`
/// would, but in-process so tests don't need a real listener.
async fn pump_server_side(broker: Arc<Broker>, mut transport: InMemoryTransport, is_worker_first: bool) {
    tokio::spawn(async move {
        let id = Uuid::new_v4();
        if is_worker_first {
            let (tx, mut rx) = tokio::sync::mpsc::channel::<Packet>(32);
            broker.register_worker(id, tx).await;
            loop {
                tokio::select! {
                    incoming = ServerTransport::recv(&mut transport) => {
                        match incoming {
                            Ok(Some(Packet::Register { capacity })) => broker.worker_registered_capacity(id, capacity).await,
                            Ok(Some(Packet::Result { cookie, rc, value, error })) => {
                                let _ = broker.handle_result(id, cookie, rc, value, error).await;
                            }
                            _ => break,
                        }
                    }
                    Some(outbound) = rx.recv() => {
                        if ServerTransport::send(&mut transport, outbound).await.is_err() { break; }
                    }
                }
            }
            broker.worker_disconnected(id).await;
        } else {
            let (tx, mut rx) = tokio::sync::mpsc::channel::<Packet>(32);
            broker.register_client(id, tx).await;
            loop {
                tokio::select! {
                    incoming = ServerTransport::recv(&mut transport) => {
                        match incoming {
                            Ok(Some(Packet::Run { cookie, pipeline, variables })) => {
                                let _ = broker.submit_run(id, cookie, pipeline, variables).await;
                            }
                            Ok(Some(Packet::Cancel { cookie })) => {
                                let _ = broker.handle_cancel(cookie).await;
                            }
                            _ => break,
                        }
                    }
                    Some(outbound) = rx.recv() => {
                        if ServerTransport::send(&mut transport, outbound).await.is_err() { break; }
                    }
                }
            }
            broker.client_disconnected(id).await;
        }
    });
}

#[tokio::test]
async fn run_completes_end_to_end_through_broker() {
    let broker = Arc::new(Broker::new());

    let (worker_server_side, worker_client_side) = InMemoryTransport::pair(16);
    let (client_server_side, client_client_side) = InMemoryTransport::pair(16);
    pump_server_side(broker.clone(), worker_server_side, true).await;
    pump_server_side(broker.clone(), client_server_side, false).await;

    let engine = engine_with(&[("main", "tasks:\n  - return: 7\n")]);
    let manager = TaskManager::new(2, engine);
    tokio::spawn(manager.run(worker_client_side));

    // Let the worker's REGISTER land before the client submits a run.
    tokio::time::sleep(std::time::Duration::from_millis(20)).await;

    let mux = Multiplexor::spawn(client_client_side);
    let value = mux.run_pipeline("main", Value::Null).await.unwrap();
    assert_eq!(value, Value::Int(7));
}

#[tokio::test]
async fn run_with_no_worker_reports_no_worker_available() {
    let broker = Arc::new(Broker::new());
    let (client_server_side, client_client_side) = InMemoryTransport::pair(16);
    pump_server_side(broker.clone(), client_server_side, false).await;

    let mux = Multiplexor::spawn(client_client_side);
    let err = mux.run_pipeline("main", Value::Null).await.unwrap_err();
    assert!(matches!(
        err,
        reasonchip_core::error::ReasonChipError::RemoteRunFailed { rc, .. } if rc == Rc::NoWorkerAvailable.to_string()
    ));
}

#[tokio::test]
async fn worker_capacity_replenishes_after_each_run() {
    let broker = Arc::new(Broker::new());
    let (worker_server_side, worker_client_side) = InMemoryTransport::pair(16);
    let (client_server_side, client_client_side) = InMemoryTransport::pair(16);
    pump_server_side(broker.clone(), worker_server_side, true).await;
    pump_server_side(broker.clone(), client_server_side, false).await;

    let engine = engine_with(&[("main", "tasks:\n  - return: 1\n")]);
    let manager = TaskManager::new(1, engine);
    tokio::spawn(manager.run(worker_client_side));
    tokio::time::sleep(std::time::Duration::from_millis(20)).await;

    let mux = Multiplexor::spawn(client_client_side);
    // Capacity is exactly 1: two sequential runs both need to succeed,
    // proving the slot freed by the first run's REGISTER makes it back
    // to the broker before the second submit_run is issued.
    assert_eq!(mux.run_pipeline("main", Value::Null).await.unwrap(), Value::Int(1));
    assert_eq!(mux.run_pipeline("main", Value::Null).await.unwrap(), Value::Int(1));
}

#[tokio::test]
async fn cancel_on_a_cookie_with_no_route_is_a_silent_no_op() {
    let broker = Broker::new();
    broker.handle_cancel(Uuid::new_v4()).await.unwrap();
}

#[tokio::test]
async fn worker_loss_mid_run_surfaces_as_worker_lost() {
    let broker = Arc::new(Broker::new());
    let (worker_tx, _worker_rx) = tokio::sync::mpsc::channel(4);
    let (client_server_side, client_client_side) = InMemoryTransport::pair(16);
    pump_server_side(broker.clone(), client_server_side, false).await;

    let worker_id = Uuid::new_v4();
    broker.register_worker(worker_id, worker_tx).await;
    broker.worker_registered_capacity(worker_id, 1).await;

    let mux = Multiplexor::spawn(client_client_side);
    let run = tokio::spawn({
        let mux = mux.clone();
        async move { mux.run_pipeline("main", Value::Null).await }
    });

    tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    broker.worker_disconnected(worker_id).await;

    let err = run.await.unwrap().unwrap_err();
    assert!(matches!(
        err,
        reasonchip_core::error::ReasonChipError::RemoteRunFailed { rc, .. } if rc == Rc::WorkerLost.to_string()
    ));
}
