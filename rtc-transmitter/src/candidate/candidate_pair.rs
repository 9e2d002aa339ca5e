use super::*;

/// The (local, remote) candidate combination used to send and receive for a
/// component.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CandidatePair {
    pub local: Candidate,
    pub remote: Candidate,
}

impl fmt::Display for CandidatePair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}) <-> ({})", self.local, self.remote)
    }
}

impl CandidatePair {
    pub fn new(local: Candidate, remote: Candidate) -> Self {
        Self { local, remote }
    }

    pub fn component(&self) -> u16 {
        self.local.component
    }
}
