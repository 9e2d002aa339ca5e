use super::*;

pub(crate) const DEFAULT_MULTICAST_TTL: u8 = 1;

/// The config required to create a new multicast candidate.
pub struct CandidateMulticastConfig {
    pub base_config: CandidateConfig,

    pub ttl: u8,
}

impl Default for CandidateMulticastConfig {
    fn default() -> Self {
        Self {
            base_config: CandidateConfig::default(),
            ttl: DEFAULT_MULTICAST_TTL,
        }
    }
}

impl CandidateMulticastConfig {
    /// Creates a new multicast candidate. For a remote candidate the address
    /// is the group, for a local one it is the interface joining the group.
    pub fn new_candidate_multicast(self) -> Result<Candidate> {
        self.base_config
            .into_candidate(CandidateType::Multicast, None, Some(self.ttl))
    }
}
