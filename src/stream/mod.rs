//! Per-job event stream with replay-then-live delivery.
//!
//! Every applied task transition and job state change is appended to the
//! job's history and broadcast to live subscribers under one lock, so all
//! subscribers observe the same order. A new subscriber first receives the
//! history, then live events. The stream completes once the job finishes.
//!
//! Publication never waits on subscribers. Each live subscriber reads from a
//! bounded ring; one that falls further behind than the ring size receives
//! [`StreamError::Overflow`] and is disconnected.

use std::collections::VecDeque;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio_stream::wrappers::ReceiverStream;

use crate::model::{FinishReason, JobId, JobState, TaskId, TaskState};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskTransition {
    pub task_id: TaskId,
    pub index: u32,
    /// `None` for the record announcing a newly created task.
    pub from: Option<TaskState>,
    pub to: TaskState,
    pub reason: Option<FinishReason>,
    pub message: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobTransition {
    pub from: Option<JobState>,
    pub to: JobState,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EventKind {
    Task(TaskTransition),
    Job(JobTransition),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobEvent {
    /// Position in the job's stream, starting at 1.
    pub seq: u64,
    pub job_id: JobId,
    pub timestamp: DateTime<Utc>,
    pub kind: EventKind,
}

impl JobEvent {
    pub fn as_task(&self) -> Option<&TaskTransition> {
        match &self.kind {
            EventKind::Task(t) => Some(t),
            EventKind::Job(_) => None,
        }
    }

    pub fn as_job(&self) -> Option<&JobTransition> {
        match &self.kind {
            EventKind::Job(j) => Some(j),
            EventKind::Task(_) => None,
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StreamError {
    #[error("subscriber fell behind by {skipped} events and was disconnected")]
    Overflow { skipped: u64 },
}

struct StreamInner {
    history: Vec<JobEvent>,
    /// Dropped on completion, which ends every live subscription.
    live: Option<broadcast::Sender<JobEvent>>,
    next_seq: u64,
}

/// Shared handle to one job's event stream.
#[derive(Clone)]
pub struct EventStream {
    job_id: JobId,
    inner: Arc<Mutex<StreamInner>>,
}

impl EventStream {
    pub fn new(job_id: JobId, subscriber_buffer: usize) -> Self {
        let (tx, _) = broadcast::channel(subscriber_buffer.max(1));
        Self {
            job_id,
            inner: Arc::new(Mutex::new(StreamInner {
                history: Vec::new(),
                live: Some(tx),
                next_seq: 1,
            })),
        }
    }

    pub fn job_id(&self) -> JobId {
        self.job_id
    }

    /// Append an event. Returns its sequence number, or `None` if the stream
    /// has already completed.
    pub async fn publish(&self, kind: EventKind) -> Option<u64> {
        let mut inner = self.inner.lock().await;
        let tx = inner.live.clone()?;

        let seq = inner.next_seq;
        inner.next_seq += 1;
        let event = JobEvent {
            seq,
            job_id: self.job_id,
            timestamp: Utc::now(),
            kind,
        };
        inner.history.push(event.clone());
        // No receivers is fine; the event is in the history.
        let _ = tx.send(event);
        Some(seq)
    }

    /// Close the stream. Subscribers drain what they have and then see the end.
    pub async fn complete(&self) {
        let mut inner = self.inner.lock().await;
        if inner.live.take().is_some() {
            tracing::debug!(job_id = %self.job_id, events = inner.history.len(), "Event stream completed");
        }
    }

    pub async fn is_completed(&self) -> bool {
        self.inner.lock().await.live.is_none()
    }

    pub async fn history(&self) -> Vec<JobEvent> {
        self.inner.lock().await.history.clone()
    }

    /// Subscribe with full replay. History snapshot and live registration
    /// happen under the same lock, so no event is missed or duplicated.
    pub async fn subscribe(&self) -> Subscription {
        let inner = self.inner.lock().await;
        Subscription {
            replay: inner.history.iter().cloned().collect(),
            live: inner.live.as_ref().map(|tx| tx.subscribe()),
        }
    }
}

/// A single subscriber's view of a job's stream.
pub struct Subscription {
    replay: VecDeque<JobEvent>,
    live: Option<broadcast::Receiver<JobEvent>>,
}

impl Subscription {
    /// Next event, `Some(Err(..))` once on overflow, `None` at end of stream.
    pub async fn recv(&mut self) -> Option<Result<JobEvent, StreamError>> {
        if let Some(event) = self.replay.pop_front() {
            return Some(Ok(event));
        }

        let rx = self.live.as_mut()?;
        match rx.recv().await {
            Ok(event) => Some(Ok(event)),
            Err(RecvError::Closed) => {
                self.live = None;
                None
            }
            Err(RecvError::Lagged(skipped)) => {
                self.live = None;
                Some(Err(StreamError::Overflow { skipped }))
            }
        }
    }

    /// Collect every remaining event until the stream ends or overflows.
    pub async fn collect_all(mut self) -> Result<Vec<JobEvent>, StreamError> {
        let mut events = Vec::new();
        while let Some(item) = self.recv().await {
            events.push(item?);
        }
        Ok(events)
    }

    /// Adapt into a `Stream`, forwarding through a small channel.
    pub fn into_stream(mut self) -> ReceiverStream<Result<JobEvent, StreamError>> {
        let (tx, rx) = mpsc::channel(32);
        tokio::spawn(async move {
            while let Some(item) = self.recv().await {
                if tx.send(item).await.is_err() {
                    // Consumer dropped
                    break;
                }
            }
        });
        ReceiverStream::new(rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::JobFinishReason;
    use tokio_stream::StreamExt;

    fn task_event(index: u32, from: Option<TaskState>, to: TaskState) -> EventKind {
        EventKind::Task(TaskTransition {
            task_id: TaskId::new(),
            index,
            from,
            to,
            reason: to.finish_reason(),
            message: None,
        })
    }

    fn job_finished() -> EventKind {
        EventKind::Job(JobTransition {
            from: Some(JobState::Active),
            to: JobState::Finished(JobFinishReason::Normal),
        })
    }

    #[tokio::test]
    async fn replay_then_live() {
        let stream = EventStream::new(JobId::new(), 16);
        stream
            .publish(task_event(0, None, TaskState::Accepted))
            .await
            .unwrap();

        let mut sub = stream.subscribe().await;
        stream
            .publish(task_event(0, Some(TaskState::Accepted), TaskState::Launched))
            .await
            .unwrap();
        stream.publish(job_finished()).await.unwrap();
        stream.complete().await;

        let seqs: Vec<u64> = {
            let mut seqs = Vec::new();
            while let Some(event) = sub.recv().await {
                seqs.push(event.unwrap().seq);
            }
            seqs
        };
        assert_eq!(seqs, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn late_subscriber_gets_history_and_end() {
        let stream = EventStream::new(JobId::new(), 16);
        stream
            .publish(task_event(0, None, TaskState::Accepted))
            .await
            .unwrap();
        stream.publish(job_finished()).await.unwrap();
        stream.complete().await;

        let events = stream.subscribe().await.collect_all().await.unwrap();
        assert_eq!(events.len(), 2);
        assert!(events[1].as_job().is_some());
    }

    #[tokio::test]
    async fn publish_after_complete_is_dropped() {
        let stream = EventStream::new(JobId::new(), 16);
        stream.complete().await;
        assert!(stream.is_completed().await);
        assert!(stream
            .publish(task_event(0, None, TaskState::Accepted))
            .await
            .is_none());
        assert!(stream.history().await.is_empty());
    }

    #[tokio::test]
    async fn slow_subscriber_is_disconnected() {
        let stream = EventStream::new(JobId::new(), 2);
        let mut slow = stream.subscribe().await;

        for i in 0..5 {
            stream
                .publish(task_event(i, None, TaskState::Accepted))
                .await
                .unwrap();
        }

        match slow.recv().await {
            Some(Err(StreamError::Overflow { skipped })) => assert_eq!(skipped, 3),
            other => panic!("expected overflow, got {:?}", other),
        }
        assert!(slow.recv().await.is_none());

        // The producer is unaffected and fresh subscribers still replay everything.
        stream.complete().await;
        let events = stream.subscribe().await.collect_all().await.unwrap();
        assert_eq!(events.len(), 5);
    }

    #[tokio::test]
    async fn into_stream_forwards_events() {
        let stream = EventStream::new(JobId::new(), 16);
        stream
            .publish(task_event(0, None, TaskState::Accepted))
            .await
            .unwrap();
        stream.complete().await;

        let items: Vec<_> = stream.subscribe().await.into_stream().collect().await;
        assert_eq!(items.len(), 1);
        assert!(items[0].is_ok());
    }
}
