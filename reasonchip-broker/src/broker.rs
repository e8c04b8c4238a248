//! The Switchboard: FIFO worker availability, cookie -> route bookkeeping,
//! and delivery of packets to whichever connection owns the other end of
//! a route. All route-affecting state sits behind one
//! [`std::sync::Mutex`] so a critical section is always a handful of map
//! operations, never an `.await`.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use reasonchip_core::error::ReasonChipError;
use reasonchip_core::packet::{Cookie, Packet, Rc};
use reasonchip_core::value::Value;
use tokio::sync::mpsc::Sender;
use uuid::Uuid;

pub type WorkerId = Uuid;
pub type ClientId = Uuid;

#[derive(Clone, Copy)]
struct Route {
    client_id: ClientId,
    worker_id: WorkerId,
}

#[derive(Default)]
struct Inner {
    available_workers: VecDeque<WorkerId>,
    worker_senders: HashMap<WorkerId, Sender<Packet>>,
    client_senders: HashMap<ClientId, Sender<Packet>>,
    routes: HashMap<Cookie, Route>,
}

/// Routes RUN/CANCEL from clients to workers and RESULT from workers back
/// to the client that asked for it. Knows nothing about pipeline
/// execution itself — that's the worker's [`crate::worker::TaskManager`].
pub struct Broker {
    inner: Mutex<Inner>,
}

impl Default for Broker {
    fn default() -> Self {
        Self::new()
    }
}

impl Broker {
    pub fn new() -> Self {
        Self { inner: Mutex::new(Inner::default()) }
    }

    pub async fn register_worker(&self, worker_id: WorkerId, sender: Sender<Packet>) {
        let mut inner = self.inner.lock().expect("broker lock poisoned");
        inner.worker_senders.insert(worker_id, sender);
        tracing::info!(%worker_id, "worker connected");
    }

    /// A worker announced `capacity` free run slots; make that many slots
    /// available for `submit_run` to hand out.
    pub async fn worker_registered_capacity(&self, worker_id: WorkerId, capacity: u32) {
        let mut inner = self.inner.lock().expect("broker lock poisoned");
        if !inner.worker_senders.contains_key(&worker_id) {
            return;
        }
        for _ in 0..capacity {
            inner.available_workers.push_back(worker_id);
        }
    }

    pub async fn register_client(&self, client_id: ClientId, sender: Sender<Packet>) {
        let mut inner = self.inner.lock().expect("broker lock poisoned");
        inner.client_senders.insert(client_id, sender);
        tracing::info!(%client_id, "client connected");
    }

    /// Pop the next available worker and hand it the run. Replies
    /// `NO_WORKER_AVAILABLE` straight back to the client if none are free.
    pub async fn submit_run(
        &self,
        client_id: ClientId,
        cookie: Cookie,
        pipeline: String,
        variables: Value,
    ) -> Result<(), ReasonChipError> {
        let outcome = {
            let mut inner = self.inner.lock().expect("broker lock poisoned");
            match inner.available_workers.pop_front() {
                Some(worker_id) => {
                    inner.routes.insert(cookie, Route { client_id, worker_id });
                    Ok(inner.worker_senders.get(&worker_id).cloned())
                }
                None => Err(inner.client_senders.get(&client_id).cloned()),
            }
        };

        match outcome {
            Ok(Some(worker_sender)) => worker_sender
                .send(Packet::Run { cookie, pipeline, variables })
                .await
                .map_err(|_| ReasonChipError::WorkerLost),
            Ok(None) => Err(ReasonChipError::OrphanCookie(cookie.to_string())),
            Err(Some(client_sender)) => {
                let _ = client_sender
                    .send(Packet::Result {
                        cookie,
                        rc: Rc::NoWorkerAvailable,
                        value: Value::Null,
                        error: Some("no worker available".to_string()),
                    })
                    .await;
                Ok(())
            }
            Err(None) => Err(ReasonChipError::OrphanCookie(cookie.to_string())),
        }
    }

    /// Forward a CANCEL to whichever worker owns `cookie`. A cookie with
    /// no route is treated as already finished — cancelling it is a no-op.
    pub async fn handle_cancel(&self, cookie: Cookie) -> Result<(), ReasonChipError> {
        let worker_sender = {
            let inner = self.inner.lock().expect("broker lock poisoned");
            match inner.routes.get(&cookie) {
                Some(route) => inner.worker_senders.get(&route.worker_id).cloned(),
                None => return Ok(()),
            }
        };
        if let Some(sender) = worker_sender {
            let _ = sender.send(Packet::Cancel { cookie }).await;
        }
        Ok(())
    }

    /// A worker finished (or gave up on) `cookie`. Forward the result to
    /// the originating client and retire the route. Replenishing the
    /// worker's capacity is the worker's own job (it sends a fresh
    /// REGISTER after this).
    pub async fn handle_result(
        &self,
        worker_id: WorkerId,
        cookie: Cookie,
        rc: Rc,
        value: Value,
        error: Option<String>,
    ) -> Result<(), ReasonChipError> {
        let client_sender = {
            let mut inner = self.inner.lock().expect("broker lock poisoned");
            match inner.routes.remove(&cookie) {
                Some(route) if route.worker_id == worker_id => inner.client_senders.get(&route.client_id).cloned(),
                Some(stale) => {
                    // Route pointed elsewhere; put it back, this worker
                    // isn't the one we were waiting on.
                    inner.routes.insert(cookie, stale);
                    None
                }
                None => None,
            }
        };
        if let Some(sender) = client_sender {
            let _ = sender.send(Packet::Result { cookie, rc, value, error }).await;
        }
        Ok(())
    }

    /// The worker's connection dropped. Fail every route still pointing
    /// at it with `WORKER_LOST` and stop handing it new runs.
    pub async fn worker_disconnected(&self, worker_id: WorkerId) {
        let orphaned: Vec<(Cookie, Sender<Packet>)> = {
            let mut inner = self.inner.lock().expect("broker lock poisoned");
            inner.worker_senders.remove(&worker_id);
            inner.available_workers.retain(|w| *w != worker_id);
            let cookies: Vec<Cookie> = inner
                .routes
                .iter()
                .filter(|(_, r)| r.worker_id == worker_id)
                .map(|(c, _)| *c)
                .collect();
            cookies
                .into_iter()
                .filter_map(|cookie| {
                    let route = inner.routes.remove(&cookie)?;
                    let sender = inner.client_senders.get(&route.client_id).cloned()?;
                    Some((cookie, sender))
                })
                .collect()
        };
        for (cookie, sender) in orphaned {
            let _ = sender
                .send(Packet::Result {
                    cookie,
                    rc: Rc::WorkerLost,
                    value: Value::Null,
                    error: Some("worker connection lost mid-run".to_string()),
                })
                .await;
        }
        tracing::warn!(%worker_id, "worker disconnected");
    }

    /// The client's connection dropped. Every route it still owns is
    /// cancelled at the worker and retired — there is no one left to
    /// deliver a RESULT to.
    pub async fn client_disconnected(&self, client_id: ClientId) {
        let cancelled: Vec<(Cookie, Sender<Packet>)> = {
            let mut inner = self.inner.lock().expect("broker lock poisoned");
            inner.client_senders.remove(&client_id);
            let cookies: Vec<Cookie> = inner
                .routes
                .iter()
                .filter(|(_, r)| r.client_id == client_id)
                .map(|(c, _)| *c)
                .collect();
            cookies
                .into_iter()
                .filter_map(|cookie| {
                    let route = inner.routes.remove(&cookie)?;
                    let sender = inner.worker_senders.get(&route.worker_id).cloned()?;
                    Some((cookie, sender))
                })
                .collect()
        };
        for (cookie, sender) in cancelled {
            let _ = sender.send(Packet::Cancel { cookie }).await;
        }
        tracing::info!(%client_id, "client disconnected");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    #[tokio::test]
    async fn submit_run_routes_to_an_available_worker() {
        let broker = Broker::new();
        let (worker_tx, mut worker_rx) = mpsc::channel(4);
        let (client_tx, _client_rx) = mpsc::channel(4);
        let worker_id = Uuid::new_v4();
        let client_id = Uuid::new_v4();
        broker.register_worker(worker_id, worker_tx).await;
        broker.worker_registered_capacity(worker_id, 1).await;
        broker.register_client(client_id, client_tx).await;

        let cookie = Uuid::new_v4();
        broker.submit_run(client_id, cookie, "main".to_string(), Value::Null).await.unwrap();

        let received = worker_rx.recv().await.unwrap();
        assert!(matches!(received, Packet::Run { cookie: c, .. } if c == cookie));
    }

    #[tokio::test]
    async fn submit_run_with_no_worker_replies_no_worker_available() {
        let broker = Broker::new();
        let (client_tx, mut client_rx) = mpsc::channel(4);
        let client_id = Uuid::new_v4();
        broker.register_client(client_id, client_tx).await;

        let cookie = Uuid::new_v4();
        broker.submit_run(client_id, cookie, "main".to_string(), Value::Null).await.unwrap();

        let received = client_rx.recv().await.unwrap();
        assert!(matches!(received, Packet::Result { rc: Rc::NoWorkerAvailable, .. }));
    }

    #[tokio::test]
    async fn worker_disconnect_fails_outstanding_routes() {
        let broker = Broker::new();
        let (worker_tx, _worker_rx) = mpsc::channel(4);
        let (client_tx, mut client_rx) = mpsc::channel(4);
        let worker_id = Uuid::new_v4();
        let client_id = Uuid::new_v4();
        broker.register_worker(worker_id, worker_tx).await;
        broker.worker_registered_capacity(worker_id, 1).await;
        broker.register_client(client_id, client_tx).await;

        let cookie = Uuid::new_v4();
        broker.submit_run(client_id, cookie, "main".to_string(), Value::Null).await.unwrap();
        broker.worker_disconnected(worker_id).await;

        let received = client_rx.recv().await.unwrap();
        assert!(matches!(received, Packet::Result { rc: Rc::WorkerLost, .. }));
    }

    #[tokio::test]
    async fn handle_result_forwards_and_retires_the_route() {
        let broker = Broker::new();
        let (worker_tx, _worker_rx) = mpsc::channel(4);
        let (client_tx, mut client_rx) = mpsc::channel(4);
        let worker_id = Uuid::new_v4();
        let client_id = Uuid::new_v4();
        broker.register_worker(worker_id, worker_tx).await;
        broker.worker_registered_capacity(worker_id, 1).await;
        broker.register_client(client_id, client_tx).await;

        let cookie = Uuid::new_v4();
        broker.submit_run(client_id, cookie, "main".to_string(), Value::Null).await.unwrap();
        broker.handle_result(worker_id, cookie, Rc::Ok, Value::Int(7), None).await.unwrap();

        let received = client_rx.recv().await.unwrap();
        assert!(matches!(received, Packet::Result { rc: Rc::Ok, value: Value::Int(7), .. }));

        // Route is gone: a second result for the same cookie is dropped.
        broker.handle_result(worker_id, cookie, Rc::Ok, Value::Int(9), None).await.unwrap();
        assert!(client_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn cancel_on_unknown_cookie_is_a_no_op() {
        let broker = Broker::new();
        broker.handle_cancel(Uuid::new_v4()).await.unwrap();
    }

    #[tokio::test]
    async fn client_disconnect_cancels_its_outstanding_routes() {
        let broker = Broker::new();
        let (worker_tx, mut worker_rx) = mpsc::channel(4);
        let (client_tx, _client_rx) = mpsc::channel(4);
        let worker_id = Uuid::new_v4();
        let client_id = Uuid::new_v4();
        broker.register_worker(worker_id, worker_tx).await;
        broker.worker_registered_capacity(worker_id, 1).await;
        broker.register_client(client_id, client_tx).await;

        let cookie = Uuid::new_v4();
        broker.submit_run(client_id, cookie, "main".to_string(), Value::Null).await.unwrap();
        broker.client_disconnected(client_id).await;

        let received = worker_rx.recv().await.unwrap();
        assert!(matches!(received, Packet::Cancel { cookie: c } if c == cookie));

        // Route is gone: a late RESULT for the cookie finds no route.
        broker.handle_result(worker_id, cookie, Rc::Ok, Value::Int(1), None).await.unwrap();
    }
}
