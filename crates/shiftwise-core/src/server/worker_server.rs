// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! TCP server remote workers connect to.
//!
//! A worker opens a connection and sends a [`WorkerHello`]. From then on the
//! server pushes work orders as they are enqueued and the worker answers each
//! with a task response on the same connection. Orders enqueued while no
//! worker is connected wait in a backlog. Orders a worker received but never
//! answered go back to the hub when its connection ends.

use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use shiftwise_protocol::{
    Frame, FrameError, FramedStream, MessageType, TaskResponse, WorkOrder, WorkerHello,
};
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Mutex, mpsc, watch};
use tokio::time::{Instant, interval_at, timeout};
use tracing::{debug, error, info, instrument, warn};

use crate::dispatcher::TaskQueue;

/// How long a new connection has to identify itself.
pub const HELLO_TIMEOUT: Duration = Duration::from_secs(10);

/// Keepalive period on idle connections.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

struct WorkerSlot {
    connection_id: u64,
    worker_id: String,
    tx: mpsc::UnboundedSender<WorkOrder>,
}

#[derive(Default)]
struct HubState {
    workers: Vec<WorkerSlot>,
    next: usize,
    backlog: VecDeque<WorkOrder>,
}

impl HubState {
    /// Hand an order to the next live worker, or give it back.
    fn route(&mut self, mut order: WorkOrder) -> Option<WorkOrder> {
        while !self.workers.is_empty() {
            let index = self.next % self.workers.len();
            match self.workers[index].tx.send(order) {
                Ok(()) => {
                    self.next = index + 1;
                    return None;
                }
                Err(mpsc::error::SendError(returned)) => {
                    order = returned;
                    self.workers.remove(index);
                }
            }
        }
        Some(order)
    }
}

/// Routes work orders to connected workers round-robin.
#[derive(Default)]
pub struct WorkerHub {
    state: Mutex<HubState>,
    next_connection: AtomicU64,
}

impl WorkerHub {
    /// Create an empty hub.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a worker and drain the backlog to it.
    pub async fn attach(&self, worker_id: &str) -> (u64, mpsc::UnboundedReceiver<WorkOrder>) {
        let connection_id = self.next_connection.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();

        let mut state = self.state.lock().await;
        let backlog: Vec<WorkOrder> = state.backlog.drain(..).collect();
        for order in backlog {
            // the receiver is alive, so this cannot fail
            let _ = tx.send(order);
        }
        state.workers.push(WorkerSlot {
            connection_id,
            worker_id: worker_id.to_string(),
            tx,
        });

        info!(worker_id, connection_id, workers = state.workers.len(), "Worker attached");
        (connection_id, rx)
    }

    /// Remove a worker and reroute orders it never received or never answered.
    pub async fn detach(&self, connection_id: u64, undelivered: Vec<WorkOrder>) {
        let mut state = self.state.lock().await;
        if let Some(pos) = state
            .workers
            .iter()
            .position(|w| w.connection_id == connection_id)
        {
            let slot = state.workers.remove(pos);
            info!(worker_id = %slot.worker_id, connection_id, "Worker detached");
        }
        for order in undelivered {
            if let Some(order) = state.route(order) {
                state.backlog.push_back(order);
            }
        }
    }

    /// Connected workers.
    pub async fn worker_count(&self) -> usize {
        self.state.lock().await.workers.len()
    }

    /// Orders waiting for a worker.
    pub async fn backlog_len(&self) -> usize {
        self.state.lock().await.backlog.len()
    }
}

#[async_trait]
impl TaskQueue for WorkerHub {
    async fn enqueue(&self, order: WorkOrder) -> crate::error::Result<()> {
        let mut state = self.state.lock().await;
        if let Some(order) = state.route(order) {
            debug!(activity_id = %order.activity_id, "No worker connected, order backlogged");
            state.backlog.push_back(order);
        }
        Ok(())
    }
}

/// Accept worker connections until shutdown.
pub async fn run_worker_server(
    listener: TcpListener,
    hub: Arc<WorkerHub>,
    responses: mpsc::Sender<TaskResponse>,
    mut shutdown_rx: watch::Receiver<bool>,
) -> Result<()> {
    info!(addr = %listener.local_addr()?, "Worker server starting");

    loop {
        tokio::select! {
            biased;

            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    info!("Worker server received shutdown signal");
                    break;
                }
            }

            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, remote)) => {
                        let hub = hub.clone();
                        let responses = responses.clone();
                        let shutdown_rx = shutdown_rx.clone();
                        tokio::spawn(async move {
                            if let Err(e) = handle_connection(stream, remote, hub, responses, shutdown_rx).await {
                                warn!(%remote, error = %e, "Worker connection ended with error");
                            }
                        });
                    }
                    Err(e) => {
                        error!(error = %e, "Failed to accept worker connection");
                    }
                }
            }
        }
    }

    info!("Worker server stopped");
    Ok(())
}

#[instrument(skip(stream, hub, responses, shutdown_rx))]
async fn handle_connection(
    stream: TcpStream,
    remote: SocketAddr,
    hub: Arc<WorkerHub>,
    responses: mpsc::Sender<TaskResponse>,
    mut shutdown_rx: watch::Receiver<bool>,
) -> Result<()> {
    let (read_half, write_half) = stream.into_split();
    let mut reader = FramedStream::new(read_half);
    let mut writer = FramedStream::new(write_half);

    let hello: WorkerHello = timeout(HELLO_TIMEOUT, reader.read_frame())
        .await
        .map_err(|_| anyhow::anyhow!("worker did not send hello within {:?}", HELLO_TIMEOUT))??
        .decode_as(MessageType::Hello)?;
    info!(worker_id = %hello.worker_id, version = %hello.version, "Worker connected");

    let (connection_id, mut orders) = hub.attach(&hello.worker_id).await;
    let (ack_tx, mut acks) = mpsc::unbounded_channel();
    let mut reader_task = tokio::spawn(forward_responses(reader, responses, ack_tx));
    let mut heartbeat = interval_at(Instant::now() + HEARTBEAT_INTERVAL, HEARTBEAT_INTERVAL);
    let mut undelivered = Vec::new();
    // pushed to this worker, keyed by activity id, until answered
    let mut unanswered: HashMap<String, WorkOrder> = HashMap::new();

    loop {
        tokio::select! {
            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    break;
                }
            }

            _ = &mut reader_task => {
                debug!("Worker stopped sending");
                break;
            }

            Some(correlation_id) = acks.recv() => {
                unanswered.remove(&correlation_id);
            }

            order = orders.recv() => {
                let Some(order) = order else { break };
                if let Err(e) = writer.send(MessageType::WorkOrder, &order).await {
                    warn!(activity_id = %order.activity_id, error = %e, "Failed to push work order");
                    undelivered.push(order);
                    break;
                }
                debug!(activity_id = %order.activity_id, "Work order pushed");
                unanswered.insert(order.activity_id.clone(), order);
            }

            _ = heartbeat.tick() => {
                if let Err(e) = writer.write_frame(&Frame::heartbeat()).await {
                    debug!(error = %e, "Heartbeat failed");
                    break;
                }
            }
        }
    }

    reader_task.abort();
    while let Ok(correlation_id) = acks.try_recv() {
        unanswered.remove(&correlation_id);
    }
    if !unanswered.is_empty() {
        info!(
            worker_id = %hello.worker_id,
            unanswered = unanswered.len(),
            "Rerouting orders the worker did not answer"
        );
    }
    undelivered.extend(unanswered.into_values());

    orders.close();
    while let Ok(order) = orders.try_recv() {
        undelivered.push(order);
    }
    hub.detach(connection_id, undelivered).await;
    Ok(())
}

/// Feed task responses from the worker into the inbound channel.
///
/// Each forwarded response is acknowledged by correlation id.
async fn forward_responses(
    mut reader: FramedStream<OwnedReadHalf>,
    responses: mpsc::Sender<TaskResponse>,
    acks: mpsc::UnboundedSender<String>,
) {
    loop {
        let frame = match reader.read_frame().await {
            Ok(frame) => frame,
            Err(FrameError::ConnectionClosed) => return,
            Err(e) => {
                warn!(error = %e, "Failed to read frame from worker");
                return;
            }
        };

        match frame.message_type {
            MessageType::TaskResponse => match frame.decode::<TaskResponse>() {
                Ok(response) => {
                    let correlation_id = response.correlation_id.clone();
                    if responses.send(response).await.is_err() {
                        return;
                    }
                    let _ = acks.send(correlation_id);
                }
                Err(e) => warn!(error = %e, "Malformed task response"),
            },
            MessageType::Heartbeat => {}
            other => warn!(message_type = ?other, "Unexpected frame from worker"),
        }
    }
}
