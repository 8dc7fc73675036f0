//! Connectivity-check transport seam.
//!
//! Candidate gathering and path validation are an external collaborator;
//! the engine consumes an agent through [CandidateAgent] and only reacts
//! to its events. [DirectAgent] is the bundled trivial implementation for
//! closed networks and tests: one host candidate, immediate pairing with
//! the first viable remote candidate.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::time::Instant;

use log::debug;

use shared::error::{Error, Result};
use shared::TaggedBytesMut;

use crate::connection::state::{ConnectivityState, GatheringState};
use crate::description::CandidateInit;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AgentEvent {
    StateChange(ConnectivityState),
    GatheringStateChange(GatheringState),
    /// A local candidate ready for the signaling channel
    Candidate(CandidateInit),
    SelectedPair {
        local: SocketAddr,
        remote: SocketAddr,
    },
}

/// Sans-I/O surface of the connectivity-check collaborator.
pub trait CandidateAgent: Send {
    fn start_gathering(&mut self, servers: &[String]) -> Result<()>;

    fn add_remote_candidate(&mut self, candidate: &CandidateInit) -> Result<()>;

    /// Inbound connectivity-check traffic from the demultiplexer
    fn handle_read(&mut self, msg: TaggedBytesMut) -> Result<()>;

    /// Outbound connectivity-check traffic for the wire
    fn poll_write(&mut self) -> Option<TaggedBytesMut>;

    fn poll_event(&mut self) -> Option<AgentEvent>;

    fn handle_timeout(&mut self, now: Instant) -> Result<()>;

    fn poll_timeout(&mut self) -> Option<Instant>;

    fn selected_pair(&self) -> Option<(SocketAddr, SocketAddr)>;

    /// Drop the current pair and renegotiate from fresh candidates
    fn restart(&mut self) -> Result<()>;

    fn close(&mut self) -> Result<()>;
}

/// Direct host-to-host agent: advertises the configured local address and
/// pairs with the first parseable remote candidate.
pub struct DirectAgent {
    local_addr: SocketAddr,
    remote_addr: Option<SocketAddr>,
    state: ConnectivityState,
    gathering: GatheringState,
    events: VecDeque<AgentEvent>,
}

impl DirectAgent {
    pub fn new(local_addr: SocketAddr) -> Self {
        Self {
            local_addr,
            remote_addr: None,
            state: ConnectivityState::New,
            gathering: GatheringState::New,
            events: VecDeque::new(),
        }
    }

    fn set_state(&mut self, state: ConnectivityState) {
        if self.state != state {
            self.state = state;
            self.events.push_back(AgentEvent::StateChange(state));
        }
    }
}

impl CandidateAgent for DirectAgent {
    fn start_gathering(&mut self, servers: &[String]) -> Result<()> {
        if !servers.is_empty() {
            debug!("direct agent ignores {} configured servers", servers.len());
        }
        if self.gathering != GatheringState::New {
            return Ok(());
        }
        self.gathering = GatheringState::InProgress;
        self.events
            .push_back(AgentEvent::GatheringStateChange(GatheringState::InProgress));
        self.events.push_back(AgentEvent::Candidate(CandidateInit {
            candidate: self.local_addr.to_string(),
            mid: "0".to_string(),
        }));
        self.gathering = GatheringState::Complete;
        self.events
            .push_back(AgentEvent::GatheringStateChange(GatheringState::Complete));
        self.set_state(ConnectivityState::Checking);
        Ok(())
    }

    fn add_remote_candidate(&mut self, candidate: &CandidateInit) -> Result<()> {
        let remote: SocketAddr = candidate
            .candidate
            .parse()
            .map_err(|_| Error::ErrInvalidRemoteCandidate)?;
        if self.remote_addr.is_some() {
            return Ok(());
        }
        self.remote_addr = Some(remote);
        self.set_state(ConnectivityState::Connected);
        self.events.push_back(AgentEvent::SelectedPair {
            local: self.local_addr,
            remote,
        });
        self.set_state(ConnectivityState::Completed);
        Ok(())
    }

    fn handle_read(&mut self, _msg: TaggedBytesMut) -> Result<()> {
        // No connectivity checks on a direct path
        Ok(())
    }

    fn poll_write(&mut self) -> Option<TaggedBytesMut> {
        None
    }

    fn poll_event(&mut self) -> Option<AgentEvent> {
        self.events.pop_front()
    }

    fn handle_timeout(&mut self, _now: Instant) -> Result<()> {
        Ok(())
    }

    fn poll_timeout(&mut self) -> Option<Instant> {
        None
    }

    fn selected_pair(&self) -> Option<(SocketAddr, SocketAddr)> {
        self.remote_addr.map(|remote| (self.local_addr, remote))
    }

    fn restart(&mut self) -> Result<()> {
        self.remote_addr = None;
        self.gathering = GatheringState::New;
        self.set_state(ConnectivityState::New);
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        self.set_state(ConnectivityState::Closed);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(s: &str) -> SocketAddr {
        s.parse().unwrap()
    }

    #[test]
    fn test_direct_agent_gathers_one_host_candidate() {
        let mut agent = DirectAgent::new(addr("192.0.2.1:4000"));
        agent.start_gathering(&[]).unwrap();
        let events: Vec<_> = std::iter::from_fn(|| agent.poll_event()).collect();
        assert!(events.iter().any(|e| matches!(
            e,
            AgentEvent::Candidate(c) if c.candidate == "192.0.2.1:4000"
        )));
        assert!(events
            .iter()
            .any(|e| *e == AgentEvent::GatheringStateChange(GatheringState::Complete)));
    }

    #[test]
    fn test_direct_agent_selects_first_remote() {
        let mut agent = DirectAgent::new(addr("192.0.2.1:4000"));
        agent.start_gathering(&[]).unwrap();
        while agent.poll_event().is_some() {}
        agent
            .add_remote_candidate(&CandidateInit {
                candidate: "192.0.2.2:5000".into(),
                mid: "0".into(),
            })
            .unwrap();
        assert_eq!(
            agent.selected_pair(),
            Some((addr("192.0.2.1:4000"), addr("192.0.2.2:5000")))
        );
        let events: Vec<_> = std::iter::from_fn(|| agent.poll_event()).collect();
        assert!(events
            .iter()
            .any(|e| matches!(e, AgentEvent::SelectedPair { .. })));
    }

    #[test]
    fn test_direct_agent_rejects_garbage_candidate() {
        let mut agent = DirectAgent::new(addr("192.0.2.1:4000"));
        let result = agent.add_remote_candidate(&CandidateInit {
            candidate: "not an address".into(),
            mid: "0".into(),
        });
        assert_eq!(result, Err(Error::ErrInvalidRemoteCandidate));
    }
}
