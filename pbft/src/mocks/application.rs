//! A replicated log whose state digest chains every applied request.

use crate::{types::Request, Executor, Sequence};
use commonware_cryptography::{sha256::Digest, Hasher, Sha256};

/// Records every execution and folds it into a running state digest.
#[derive(Clone, Debug)]
pub struct Application {
    state: Digest,
    executed: Vec<(Sequence, Option<Digest>)>,

    // Mixed into every transition to simulate a non-deterministic (faulty) application.
    salt: Option<u8>,
}

impl Default for Application {
    fn default() -> Self {
        Self {
            state: Digest::from([0u8; 32]),
            executed: Vec::new(),
            salt: None,
        }
    }
}

impl Application {
    /// An application that computes a different state than every other replica.
    pub fn corrupted() -> Self {
        Self {
            salt: Some(0xff),
            ..Self::default()
        }
    }

    /// Every sequence number applied or skipped, with the digest of the applied request.
    pub fn executed(&self) -> &[(Sequence, Option<Digest>)] {
        &self.executed
    }

    fn transition(&mut self, sequence: Sequence, digest: Option<Digest>) {
        let mut hasher = Sha256::default();
        hasher.update(&self.state);
        hasher.update(&sequence.to_be_bytes());
        if let Some(digest) = &digest {
            hasher.update(digest);
        }
        if let Some(salt) = self.salt {
            hasher.update(&[salt]);
        }
        self.state = hasher.finalize();
        self.executed.push((sequence, digest));
    }
}

impl Executor for Application {
    fn execute(&mut self, sequence: Sequence, request: &Request) {
        self.transition(sequence, Some(request.digest()));
    }

    fn skip(&mut self, sequence: Sequence) {
        self.transition(sequence, None);
    }

    fn state_digest(&self) -> Digest {
        self.state
    }

    fn restore(&mut self, _: Sequence, digest: Digest) {
        self.state = digest;
    }
}
