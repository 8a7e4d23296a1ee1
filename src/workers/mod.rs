use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use crate::wire::codec::{self, CodecError, CodecLimits, EncodedFrame};
use crate::wire::frame::Frame;

#[derive(Debug)]
pub enum SubmitError {
    /// The queued payload bytes would exceed the pool budget; the caller
    /// should run the codec inline instead of waiting.
    BudgetExceeded {
        queued_bytes: usize,
        budget_bytes: usize,
    },
    PoolStopped,
}

impl fmt::Display for SubmitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BudgetExceeded {
                queued_bytes,
                budget_bytes,
            } => write!(
                f,
                "codec queue holds {queued_bytes} bytes, budget is {budget_bytes}"
            ),
            Self::PoolStopped => write!(f, "codec worker pool is stopped"),
        }
    }
}

impl std::error::Error for SubmitError {}

pub enum JobOutcome {
    Encoded(Result<EncodedFrame, CodecError>),
    Decoded(Result<Frame, CodecError>),
}

struct Job {
    cost_bytes: usize,
    kind: JobKind,
    result_tx: Sender<JobOutcome>,
}

enum JobKind {
    Encode(Frame),
    Decode(Vec<u8>),
}

/// Fixed-size pool of codec threads. Serialization and deserialization of
/// large payloads run here so the polling loop never stalls on a single
/// oversized frame. The queue is bounded by payload bytes rather than job
/// count; when the budget is exhausted submissions are refused and the
/// caller falls back to inline codec work.
pub struct CodecWorkerPool {
    job_tx: Option<Sender<Job>>,
    handles: Vec<JoinHandle<()>>,
    queued_bytes: Arc<AtomicUsize>,
    budget_bytes: usize,
    limits: CodecLimits,
}

impl CodecWorkerPool {
    pub fn new(worker_count: usize, budget_bytes: usize, limits: CodecLimits) -> Self {
        let worker_count = worker_count.max(1);
        let (job_tx, job_rx) = channel::<Job>();
        let job_rx = Arc::new(Mutex::new(job_rx));
        let queued_bytes = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::with_capacity(worker_count);
        for index in 0..worker_count {
            let job_rx = Arc::clone(&job_rx);
            let queued_bytes = Arc::clone(&queued_bytes);
            let handle = thread::Builder::new()
                .name(format!("codec-worker-{index}"))
                .spawn(move || worker_loop(job_rx, queued_bytes, limits))
                .expect("codec worker thread should spawn");
            handles.push(handle);
        }

        Self {
            job_tx: Some(job_tx),
            handles,
            queued_bytes,
            budget_bytes,
            limits,
        }
    }

    pub fn queued_bytes(&self) -> usize {
        self.queued_bytes.load(Ordering::SeqCst)
    }

    /// Refusals hand the frame back so the caller can encode it inline.
    pub fn submit_encode(&self, frame: Frame) -> Result<Receiver<JobOutcome>, (Frame, SubmitError)> {
        let cost = codec::estimated_payload_size(&frame);
        match self.submit(cost, JobKind::Encode(frame)) {
            Ok(receiver) => Ok(receiver),
            Err((JobKind::Encode(frame), error)) => Err((frame, error)),
            Err((JobKind::Decode(_), _)) => unreachable!("encode submissions stay encode jobs"),
        }
    }

    /// Refusals hand the payload back so the caller can decode it inline.
    pub fn submit_decode(
        &self,
        payload: Vec<u8>,
    ) -> Result<Receiver<JobOutcome>, (Vec<u8>, SubmitError)> {
        let cost = payload.len();
        match self.submit(cost, JobKind::Decode(payload)) {
            Ok(receiver) => Ok(receiver),
            Err((JobKind::Decode(payload), error)) => Err((payload, error)),
            Err((JobKind::Encode(_), _)) => unreachable!("decode submissions stay decode jobs"),
        }
    }

    fn submit(
        &self,
        cost_bytes: usize,
        kind: JobKind,
    ) -> Result<Receiver<JobOutcome>, (JobKind, SubmitError)> {
        let Some(job_tx) = &self.job_tx else {
            return Err((kind, SubmitError::PoolStopped));
        };

        let queued = self.queued_bytes.load(Ordering::SeqCst);
        if queued + cost_bytes > self.budget_bytes {
            return Err((
                kind,
                SubmitError::BudgetExceeded {
                    queued_bytes: queued,
                    budget_bytes: self.budget_bytes,
                },
            ));
        }
        self.queued_bytes.fetch_add(cost_bytes, Ordering::SeqCst);

        let (result_tx, result_rx) = channel();
        let job = Job {
            cost_bytes,
            kind,
            result_tx,
        };
        if let Err(send_error) = job_tx.send(job) {
            self.queued_bytes.fetch_sub(cost_bytes, Ordering::SeqCst);
            return Err((send_error.0.kind, SubmitError::PoolStopped));
        }

        Ok(result_rx)
    }

    pub fn limits(&self) -> CodecLimits {
        self.limits
    }
}

impl Drop for CodecWorkerPool {
    fn drop(&mut self) {
        // Dropping the sender disconnects the channel; workers drain what
        // is queued and exit.
        self.job_tx.take();
        for handle in self.handles.drain(..) {
            let _ = handle.join();
        }
    }
}

fn worker_loop(
    job_rx: Arc<Mutex<Receiver<Job>>>,
    queued_bytes: Arc<AtomicUsize>,
    limits: CodecLimits,
) {
    loop {
        let job = {
            let receiver = job_rx.lock().expect("codec job receiver lock poisoned");
            receiver.recv()
        };
        let Ok(job) = job else {
            return;
        };

        let outcome = match job.kind {
            JobKind::Encode(frame) => JobOutcome::Encoded(codec::encode(&frame, &limits)),
            JobKind::Decode(payload) => JobOutcome::Decoded(codec::decode_payload(&payload, &limits)),
        };

        queued_bytes.fetch_sub(job.cost_bytes, Ordering::SeqCst);
        let _ = job.result_tx.send(outcome);
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use rmpv::Value;
    use uuid::Uuid;

    use crate::wire::codec::{self, CodecLimits};
    use crate::wire::frame::Frame;

    use super::{CodecWorkerPool, JobOutcome, SubmitError};

    fn binary_frame(size: usize) -> Frame {
        Frame::new(
            Uuid::new_v4(),
            "Files.put",
            Value::Array(vec![Value::Binary(vec![0x5a; size])]),
        )
    }

    #[test]
    fn offloaded_encode_matches_inline_encode() {
        let limits = CodecLimits::default();
        let pool = CodecWorkerPool::new(2, 64 * 1024 * 1024, limits);
        let frame = binary_frame(100 * 1024);

        let receiver = pool
            .submit_encode(frame.clone())
            .expect("submission should be accepted");
        let outcome = receiver
            .recv_timeout(Duration::from_secs(5))
            .expect("worker should complete");

        let JobOutcome::Encoded(result) = outcome else {
            panic!("expected an encode outcome");
        };
        let offloaded = result.expect("encode should succeed");
        let inline = codec::encode(&frame, &limits).expect("inline encode should succeed");
        assert_eq!(offloaded, inline);
    }

    #[test]
    fn offloaded_decode_returns_original_frame() {
        let limits = CodecLimits::default();
        let pool = CodecWorkerPool::new(2, 64 * 1024 * 1024, limits);
        let frame = binary_frame(50 * 1024);
        let payload = codec::encode_payload(&frame, &limits).expect("payload should encode");

        let receiver = pool
            .submit_decode(payload)
            .expect("submission should be accepted");
        let outcome = receiver
            .recv_timeout(Duration::from_secs(5))
            .expect("worker should complete");

        let JobOutcome::Decoded(result) = outcome else {
            panic!("expected a decode outcome");
        };
        assert_eq!(result.expect("decode should succeed"), frame);
    }

    #[test]
    fn submissions_over_budget_are_refused() {
        let limits = CodecLimits::default();
        let pool = CodecWorkerPool::new(1, 1024, limits);

        let (payload, error) = pool
            .submit_decode(vec![0_u8; 4096])
            .expect_err("oversized submission should be refused");
        assert_eq!(payload.len(), 4096);
        assert!(matches!(error, SubmitError::BudgetExceeded { .. }));
    }

    #[test]
    fn queued_bytes_drop_back_to_zero_after_completion() {
        let limits = CodecLimits::default();
        let pool = CodecWorkerPool::new(2, 64 * 1024 * 1024, limits);

        let receiver = pool
            .submit_encode(binary_frame(40 * 1024))
            .expect("submission should be accepted");
        receiver
            .recv_timeout(Duration::from_secs(5))
            .expect("worker should complete");

        for _ in 0..100 {
            if pool.queued_bytes() == 0 {
                return;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        panic!("queued bytes never returned to zero");
    }

    #[test]
    fn pool_drains_jobs_before_stopping() {
        let limits = CodecLimits::default();
        let pool = CodecWorkerPool::new(2, 64 * 1024 * 1024, limits);
        let receivers: Vec<_> = (0..8)
            .map(|_| {
                pool.submit_encode(binary_frame(32 * 1024))
                    .expect("submission should be accepted")
            })
            .collect();
        drop(pool);

        for receiver in receivers {
            let outcome = receiver
                .recv_timeout(Duration::from_secs(5))
                .expect("queued job should still complete");
            assert!(matches!(outcome, JobOutcome::Encoded(Ok(_))));
        }
    }
}
