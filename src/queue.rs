//! Background metadata fetch queue.
//!
//! A single actor task owns the pending ids, the armed flag and the in-flight
//! fetch. At most one fetch runs at a time, and each one starts no earlier
//! than `spacing` after the previous one finished. Disarming only stops new
//! fetches from starting; an in-flight fetch is cancelled explicitly.

use std::{collections::VecDeque, sync::Arc, time::Duration};

use async_trait::async_trait;
use futures_util::future::{abortable, AbortHandle};
use serde::Serialize;
use tokio::{
    sync::{mpsc, watch},
    task::JoinHandle,
    time::{sleep_until, Instant},
};
use tracing::debug;

/// Work performed for each queued mint id.
#[async_trait]
pub trait MetadataJob: Send + Sync + 'static {
    /// Whether cached metadata is recent enough to skip this id.
    fn is_fresh(&self, mint_id: &str) -> bool;

    /// Fetch and record metadata. Must not fail; degrade instead.
    async fn refresh(&self, mint_id: &str);
}

/// Application views relevant to arming the queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum View {
    Home,
    AllMints,
    Other(String),
}

impl View {
    pub fn parse(name: &str) -> Self {
        match name {
            "home" | "" => View::Home,
            "all-mints" => View::AllMints,
            other => View::Other(other.to_string()),
        }
    }

    /// Whether metadata fetching is useful while this view is shown.
    pub fn arms_queue(&self) -> bool {
        matches!(self, View::Home | View::AllMints)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct QueueStatus {
    pub armed: bool,
    pub pending: usize,
    pub in_flight: Option<String>,
    pub completed: u64,
}

enum Command {
    Enqueue(Vec<String>),
    SetArmed(bool),
    CancelInFlight,
    Shutdown,
}

/// Cheap handle to the queue actor.
#[derive(Clone)]
pub struct MetadataQueueHandle {
    tx: mpsc::UnboundedSender<Command>,
    status: watch::Receiver<QueueStatus>,
}

impl MetadataQueueHandle {
    /// Queue ids not already pending or fresh.
    pub fn enqueue(&self, ids: Vec<String>) {
        let _ = self.tx.send(Command::Enqueue(ids));
    }

    pub fn arm(&self) {
        let _ = self.tx.send(Command::SetArmed(true));
    }

    pub fn disarm(&self) {
        let _ = self.tx.send(Command::SetArmed(false));
    }

    /// Arm or disarm according to the view being shown.
    pub fn set_view(&self, view: &View) {
        let _ = self.tx.send(Command::SetArmed(view.arms_queue()));
    }

    /// Abort the running fetch, if any. Pending ids stay queued.
    pub fn cancel_in_flight(&self) {
        let _ = self.tx.send(Command::CancelInFlight);
    }

    pub fn shutdown(&self) {
        let _ = self.tx.send(Command::Shutdown);
    }

    pub fn status(&self) -> QueueStatus {
        self.status.borrow().clone()
    }

    /// Receiver notified whenever the status changes.
    pub fn watch(&self) -> watch::Receiver<QueueStatus> {
        self.status.clone()
    }
}

struct InFlight {
    seq: u64,
    id: String,
    abort: AbortHandle,
}

struct Worker {
    job: Arc<dyn MetadataJob>,
    spacing: Duration,
    queue: VecDeque<String>,
    armed: bool,
    in_flight: Option<InFlight>,
    next_at: Instant,
    seq: u64,
    completed: u64,
    done_tx: mpsc::UnboundedSender<u64>,
    status: watch::Sender<QueueStatus>,
}

/// Start the queue actor, initially disarmed.
pub fn spawn_metadata_queue(
    job: Arc<dyn MetadataJob>,
    spacing: Duration,
) -> (MetadataQueueHandle, JoinHandle<()>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let (done_tx, done_rx) = mpsc::unbounded_channel();
    let (status_tx, status_rx) = watch::channel(QueueStatus::default());
    let worker = Worker {
        job,
        spacing,
        queue: VecDeque::new(),
        armed: false,
        in_flight: None,
        next_at: Instant::now(),
        seq: 0,
        completed: 0,
        done_tx,
        status: status_tx,
    };
    let task = tokio::spawn(worker.run(rx, done_rx));
    (
        MetadataQueueHandle {
            tx,
            status: status_rx,
        },
        task,
    )
}

impl Worker {
    async fn run(
        mut self,
        mut rx: mpsc::UnboundedReceiver<Command>,
        mut done_rx: mpsc::UnboundedReceiver<u64>,
    ) {
        loop {
            let ready = self.armed && self.in_flight.is_none() && !self.queue.is_empty();
            tokio::select! {
                cmd = rx.recv() => match cmd {
                    Some(Command::Enqueue(ids)) => self.enqueue(ids),
                    Some(Command::SetArmed(armed)) => {
                        debug!(armed, "metadata queue armed state changed");
                        self.armed = armed;
                    }
                    Some(Command::CancelInFlight) => self.cancel(),
                    Some(Command::Shutdown) | None => {
                        self.cancel();
                        break;
                    }
                },
                Some(seq) = done_rx.recv() => self.finished(seq),
                _ = sleep_until(self.next_at), if ready => self.start_next(),
            }
            self.publish_status();
        }
    }

    fn enqueue(&mut self, ids: Vec<String>) {
        for id in ids {
            let in_flight = self.in_flight.as_ref().is_some_and(|f| f.id == id);
            if in_flight || self.queue.contains(&id) || self.job.is_fresh(&id) {
                continue;
            }
            self.queue.push_back(id);
        }
    }

    fn start_next(&mut self) {
        // Entries can turn fresh while waiting; skip those without a delay.
        while let Some(id) = self.queue.pop_front() {
            if self.job.is_fresh(&id) {
                continue;
            }
            self.seq += 1;
            let seq = self.seq;
            let job = self.job.clone();
            let done = self.done_tx.clone();
            let fetch_id = id.clone();
            let (fetch, abort) = abortable(async move { job.refresh(&fetch_id).await });
            tokio::spawn(async move {
                let _ = fetch.await;
                let _ = done.send(seq);
            });
            debug!(mint = %id, "metadata fetch started");
            self.in_flight = Some(InFlight { seq, id, abort });
            return;
        }
    }

    fn finished(&mut self, seq: u64) {
        if self.in_flight.as_ref().is_some_and(|f| f.seq == seq) {
            if let Some(f) = self.in_flight.take() {
                debug!(mint = %f.id, "metadata fetch finished");
            }
            self.completed += 1;
            self.next_at = Instant::now() + self.spacing;
        }
    }

    fn cancel(&mut self) {
        if let Some(f) = self.in_flight.take() {
            debug!(mint = %f.id, "metadata fetch cancelled");
            f.abort.abort();
            self.next_at = Instant::now() + self.spacing;
        }
    }

    fn publish_status(&self) {
        let status = QueueStatus {
            armed: self.armed,
            pending: self.queue.len(),
            in_flight: self.in_flight.as_ref().map(|f| f.id.clone()),
            completed: self.completed,
        };
        self.status.send_if_modified(|cur| {
            if *cur == status {
                false
            } else {
                *cur = status;
                true
            }
        });
    }
}
