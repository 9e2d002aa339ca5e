use super::*;

/// The config required to create a candidate derived from another transport
/// address: server reflexive, peer reflexive or relayed.
#[derive(Default)]
pub struct CandidateRelatedConfig {
    pub base_config: CandidateConfig,

    pub rel_addr: String,
    pub rel_port: u16,
}

impl CandidateRelatedConfig {
    /// Creates a new server reflexive candidate.
    pub fn new_candidate_server_reflexive(self) -> Result<Candidate> {
        self.new_candidate(CandidateType::ServerReflexive)
    }

    /// Creates a new peer reflexive candidate.
    pub fn new_candidate_peer_reflexive(self) -> Result<Candidate> {
        self.new_candidate(CandidateType::PeerReflexive)
    }

    /// Creates a new relay candidate.
    pub fn new_candidate_relay(self) -> Result<Candidate> {
        self.new_candidate(CandidateType::Relay)
    }

    fn new_candidate(self, candidate_type: CandidateType) -> Result<Candidate> {
        self.base_config.into_candidate(
            candidate_type,
            Some((self.rel_addr, self.rel_port)),
            None,
        )
    }
}
