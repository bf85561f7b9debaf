//! `StubEngine`: deterministic in-process generation backend.
//!
//! Greedy, single beam. Each request runs on its own worker thread: per step
//! a caller-supplied scorer produces the raw score row from the token
//! history, the request's decode hook masks it, and the best finite token is
//! taken. Lets the orchestrator and streaming pipeline run end-to-end
//! without a model server.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;

use ndarray::Array2;
use parking_lot::{Condvar, Mutex};
use tracing::{debug, warn};

use crate::decode::DecodeConstraints;
use crate::error::{HarkError, Result};
use crate::inference::{GenerationRequest, GenerationResponse, InferenceEngine, RequestId};
use crate::vocab::TokenId;

/// Raw next-token scores for a history (prompt + generated so far).
pub type Scorer = dyn Fn(&[TokenId]) -> Vec<f32> + Send + Sync;

type Mailbox = HashMap<RequestId, VecDeque<Result<GenerationResponse>>>;

#[derive(Default)]
struct Responses {
    mailbox: Mutex<Mailbox>,
    ready: Condvar,
}

impl Responses {
    fn deliver(&self, id: RequestId, response: Result<GenerationResponse>) {
        let mut mailbox = self.mailbox.lock();
        if let Some(queue) = mailbox.get_mut(&id) {
            queue.push_back(response);
            self.ready.notify_all();
        }
    }
}

pub struct StubEngine {
    constraints: Arc<DecodeConstraints>,
    scorer: Arc<Scorer>,
    next_id: AtomicU64,
    responses: Arc<Responses>,
    /// Emit a non-final response after every step.
    streaming: bool,
}

impl StubEngine {
    pub fn new<F>(constraints: Arc<DecodeConstraints>, scorer: F) -> Self
    where
        F: Fn(&[TokenId]) -> Vec<f32> + Send + Sync + 'static,
    {
        Self {
            constraints,
            scorer: Arc::new(scorer),
            next_id: AtomicU64::new(1),
            responses: Arc::new(Responses::default()),
            streaming: false,
        }
    }

    pub fn with_streaming(mut self, streaming: bool) -> Self {
        self.streaming = streaming;
        self
    }
}

impl InferenceEngine for StubEngine {
    fn reserve_request_id(&self) -> Result<RequestId> {
        Ok(RequestId(self.next_id.fetch_add(1, Ordering::Relaxed)))
    }

    fn enqueue_request(&self, id: RequestId, request: GenerationRequest) -> Result<()> {
        {
            let mut mailbox = self.responses.mailbox.lock();
            if mailbox.contains_key(&id) {
                return Err(HarkError::Inference(format!("request {id} is already in flight")));
            }
            mailbox.insert(id, VecDeque::new());
        }

        let constraints = Arc::clone(&self.constraints);
        let scorer = Arc::clone(&self.scorer);
        let responses = Arc::clone(&self.responses);
        let streaming = self.streaming;

        let spawned = thread::Builder::new()
            .name(format!("stub-engine-{id}"))
            .spawn(move || {
                let result = generate(&constraints, scorer.as_ref(), id, &request, |partial| {
                    if streaming {
                        responses.deliver(id, Ok(partial));
                    }
                });
                if let Err(e) = &result {
                    warn!(request = %id, error = %e, "stub generation failed");
                }
                responses.deliver(id, result);
            });

        if let Err(e) = spawned {
            self.responses.mailbox.lock().remove(&id);
            return Err(HarkError::Io(e));
        }
        debug!(request = %id, "stub request enqueued");
        Ok(())
    }

    fn await_response(&self, id: RequestId) -> Result<GenerationResponse> {
        let mut mailbox = self.responses.mailbox.lock();
        loop {
            let queue = mailbox.get_mut(&id).ok_or(HarkError::UnknownRequest(id))?;
            if let Some(response) = queue.pop_front() {
                let done = match &response {
                    Ok(r) => r.is_final,
                    Err(_) => true,
                };
                if done {
                    mailbox.remove(&id);
                }
                return response;
            }
            self.responses.ready.wait(&mut mailbox);
        }
    }

    fn num_responses_ready(&self, id: RequestId) -> Result<usize> {
        self.responses
            .mailbox
            .lock()
            .get(&id)
            .map(VecDeque::len)
            .ok_or(HarkError::UnknownRequest(id))
    }
}

fn generate(
    constraints: &DecodeConstraints,
    scorer: &Scorer,
    id: RequestId,
    request: &GenerationRequest,
    mut on_step: impl FnMut(GenerationResponse),
) -> Result<GenerationResponse> {
    let mut history = request.input_tokens.clone();
    let mut generated = Vec::with_capacity(request.max_new_tokens);
    let mut cum_log_prob = 0.0f32;

    for _ in 0..request.max_new_tokens {
        let row = scorer(&history);
        let width = row.len();
        let mut scores = Array2::from_shape_vec((1, width), row)
            .map_err(|e| HarkError::Inference(e.to_string()))?;
        constraints.apply(request.hook, id, scores.view_mut(), &[&history]);

        let Some((token, log_prob)) = greedy_pick(scores.row(0).iter().copied()) else {
            // Every continuation masked: the beam cannot move this step.
            break;
        };
        history.push(token);
        generated.push(token);
        cum_log_prob += log_prob;

        if token == request.end_id {
            break;
        }
        on_step(GenerationResponse {
            is_final: false,
            is_sequence_final: false,
            output_tokens: generated.clone(),
            cum_log_prob,
            generated_len: generated.len(),
        });
    }

    Ok(GenerationResponse {
        is_final: true,
        is_sequence_final: true,
        generated_len: generated.len(),
        output_tokens: generated,
        cum_log_prob,
    })
}

/// Highest finite score (first on ties) and its log-softmax probability.
fn greedy_pick(scores: impl Iterator<Item = f32> + Clone) -> Option<(TokenId, f32)> {
    let (best, best_score) = scores
        .clone()
        .enumerate()
        .filter(|(_, v)| v.is_finite())
        .fold(None, |acc: Option<(usize, f32)>, (i, v)| match acc {
            Some((_, b)) if b >= v => acc,
            _ => Some((i, v)),
        })?;
    let sum: f32 = scores
        .filter(|v| v.is_finite())
        .map(|v| (v - best_score).exp())
        .sum();
    Some((best as TokenId, -sum.ln()))
}
