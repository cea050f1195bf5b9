use crate::protocol::IceCandidate;

/// Remote ICE candidates that arrived before the remote description.
///
/// Owned by exactly one negotiation and dropped with it, so candidates from a
/// closed session can never be applied to the next one.
#[derive(Debug, Default)]
pub struct CandidateQueue {
    pending: Vec<IceCandidate>,
}

impl CandidateQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enqueue(&mut self, candidate: IceCandidate) {
        self.pending.push(candidate);
    }

    /// Drain everything buffered so far in arrival order.
    pub fn flush(&mut self) -> Vec<IceCandidate> {
        std::mem::take(&mut self.pending)
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Consume the queue, returning how many candidates were never applied.
    pub fn discard(self) -> usize {
        self.pending.len()
    }
}
