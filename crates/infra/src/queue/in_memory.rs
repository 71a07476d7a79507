use std::collections::{HashMap, VecDeque};
use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use tracing::debug;
use uuid::Uuid;

use mediagraph_core::JobDescriptor;

use super::{AckHandle, Delivery, QueueError, WorkQueue};

pub const DEFAULT_VISIBILITY_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Clone)]
struct Message {
    id: String,
    descriptor: JobDescriptor,
    deliveries: u32,
}

#[derive(Debug)]
struct InFlight {
    message: Message,
    deadline: Instant,
}

#[derive(Debug, Default)]
struct State {
    ready: VecDeque<Message>,
    in_flight: HashMap<AckHandle, InFlight>,
    dead: Vec<Message>,
}

impl State {
    /// Move in-flight messages whose visibility timeout lapsed back to the front.
    fn reclaim_expired(&mut self, now: Instant) {
        let expired: Vec<AckHandle> = self
            .in_flight
            .iter()
            .filter(|(_, f)| f.deadline <= now)
            .map(|(h, _)| h.clone())
            .collect();

        for handle in expired {
            if let Some(flight) = self.in_flight.remove(&handle) {
                debug!(
                    job_id = %flight.message.descriptor.job_id,
                    deliveries = flight.message.deliveries,
                    "visibility timeout lapsed, redelivering"
                );
                self.ready.push_front(flight.message);
            }
        }
    }

    fn next_deadline(&self) -> Option<Instant> {
        self.in_flight.values().map(|f| f.deadline).min()
    }
}

/// In-memory work queue for tests/dev.
///
/// Same delivery semantics as the broker-backed queue: messages are invisible
/// while in flight and come back after the visibility timeout.
#[derive(Debug)]
pub struct InMemoryWorkQueue {
    state: Mutex<State>,
    available: Condvar,
    visibility_timeout: Duration,
}

impl Default for InMemoryWorkQueue {
    fn default() -> Self {
        Self::new(DEFAULT_VISIBILITY_TIMEOUT)
    }
}

impl InMemoryWorkQueue {
    pub fn new(visibility_timeout: Duration) -> Self {
        Self {
            state: Mutex::new(State::default()),
            available: Condvar::new(),
            visibility_timeout,
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, State>, QueueError> {
        self.state
            .lock()
            .map_err(|_| QueueError::Backend("lock poisoned".to_string()))
    }

    /// Messages waiting to be delivered.
    pub fn ready_len(&self) -> usize {
        self.lock().map(|s| s.ready.len()).unwrap_or(0)
    }

    /// Messages delivered but not yet acked or nacked.
    pub fn in_flight_len(&self) -> usize {
        self.lock().map(|s| s.in_flight.len()).unwrap_or(0)
    }

    /// Descriptors nacked without requeue.
    pub fn dead_letters(&self) -> Vec<JobDescriptor> {
        self.lock()
            .map(|s| s.dead.iter().map(|m| m.descriptor.clone()).collect())
            .unwrap_or_default()
    }

    fn take_in_flight(&self, state: &mut State, handle: &AckHandle) -> Result<Message, QueueError> {
        state
            .in_flight
            .remove(handle)
            .map(|f| f.message)
            .ok_or_else(|| QueueError::UnknownHandle(handle.to_string()))
    }
}

impl WorkQueue for InMemoryWorkQueue {
    fn enqueue(&self, descriptor: &JobDescriptor) -> Result<String, QueueError> {
        let id = Uuid::now_v7().to_string();
        let mut state = self.lock()?;
        state.ready.push_back(Message {
            id: id.clone(),
            descriptor: descriptor.clone(),
            deliveries: 0,
        });
        drop(state);

        self.available.notify_one();
        Ok(id)
    }

    fn dequeue(&self, wait: Duration) -> Result<Option<Delivery>, QueueError> {
        let give_up = Instant::now() + wait;
        let mut state = self.lock()?;

        loop {
            let now = Instant::now();
            state.reclaim_expired(now);

            if let Some(mut message) = state.ready.pop_front() {
                message.deliveries += 1;
                let handle = AckHandle::new(format!("{}#{}", message.id, message.deliveries));
                let delivery = Delivery {
                    descriptor: message.descriptor.clone(),
                    handle: handle.clone(),
                    delivery_count: message.deliveries,
                };
                state.in_flight.insert(
                    handle,
                    InFlight {
                        message,
                        deadline: now + self.visibility_timeout,
                    },
                );
                return Ok(Some(delivery));
            }

            if now >= give_up {
                return Ok(None);
            }

            // Wake for whichever comes first: the caller's deadline or the next
            // in-flight message becoming visible again.
            let wake_at = state.next_deadline().map_or(give_up, |d| d.min(give_up));
            let timeout = wake_at.saturating_duration_since(now).max(Duration::from_millis(1));
            state = self
                .available
                .wait_timeout(state, timeout)
                .map_err(|_| QueueError::Backend("lock poisoned".to_string()))?
                .0;
        }
    }

    fn ack(&self, handle: &AckHandle) -> Result<(), QueueError> {
        let mut state = self.lock()?;
        self.take_in_flight(&mut state, handle)?;
        Ok(())
    }

    fn nack(&self, handle: &AckHandle, requeue: bool) -> Result<(), QueueError> {
        let mut state = self.lock()?;
        let message = self.take_in_flight(&mut state, handle)?;
        if requeue {
            state.ready.push_back(message);
            drop(state);
            self.available.notify_one();
        } else {
            state.dead.push(message);
        }
        Ok(())
    }

    fn extend(&self, handle: &AckHandle) -> Result<(), QueueError> {
        let mut state = self.lock()?;
        let flight = state
            .in_flight
            .get_mut(handle)
            .ok_or_else(|| QueueError::UnknownHandle(handle.to_string()))?;
        flight.deadline = Instant::now() + self.visibility_timeout;
        Ok(())
    }
}
