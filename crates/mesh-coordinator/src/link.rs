//! Link state machine for one pairwise connection.
//!
//! ```text
//!          begin_offer            apply_answer
//!   Idle ──────────────► Offering ─────────────► Connected ──► Closed
//!     │                                              ▲
//!     │   begin_answer            answer_sent        │
//!     └──────────────► Answering ────────────────────┘
//!
//!   any non-terminal state ── fail ──► Failed
//! ```
//!
//! A `Link` never talks to the relay or the engine itself; the owning room
//! actor drives it and performs the side effects. The link keeps the parts
//! of negotiation that must not be reordered: remote candidates are queued
//! until a remote description is applied, and the queue is flushed exactly
//! once, right after that point.
//!
//! Renegotiation of a `Connected` link keeps it `Connected`; only the
//! `renegotiating` flag and the deadline change.

use common::types::ParticipantId;
use signaling_protocol::CandidatePayload;
use std::collections::VecDeque;
use std::fmt;
use thiserror::Error;
use tokio::time::Instant;

/// Link lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LinkState {
    /// Created, nothing sent or received yet.
    Idle,
    /// Local offer sent, waiting for the answer.
    Offering,
    /// Remote offer applied, local answer being produced.
    Answering,
    /// Descriptions exchanged on both sides.
    Connected,
    /// Torn down. Never reused.
    Closed,
    /// Gave up after negotiation failure. Never reused.
    Failed,
}

impl LinkState {
    /// Returns the state as a bounded metric label.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            LinkState::Idle => "idle",
            LinkState::Offering => "offering",
            LinkState::Answering => "answering",
            LinkState::Connected => "connected",
            LinkState::Closed => "closed",
            LinkState::Failed => "failed",
        }
    }

    /// Whether the link can no longer change.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, LinkState::Closed | LinkState::Failed)
    }
}

impl fmt::Display for LinkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which side made the initial offer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkRole {
    Offerer,
    Answerer,
}

/// Link state as visible outside the negotiator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkOutcome {
    /// Initial negotiation still in flight.
    Pending,
    Connected,
    Closed,
    Failed,
}

/// Errors from illegal link operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LinkError {
    /// The operation is not valid in the current state.
    #[error("cannot {action} a link in state {from}")]
    InvalidTransition {
        from: LinkState,
        action: &'static str,
    },
}

/// What to do with a remote candidate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CandidateDisposition {
    /// Apply these candidates now, in order. Any previously queued candidates
    /// come first.
    Apply(Vec<CandidatePayload>),
    /// Remote description not set yet; the candidate was queued.
    Queued,
}

/// One negotiated pairwise connection, as seen from the local side.
#[derive(Debug)]
pub struct Link {
    local_id: ParticipantId,
    remote_id: ParticipantId,
    state: LinkState,
    role: Option<LinkRole>,
    pending_candidates: VecDeque<CandidatePayload>,
    remote_description_set: bool,
    renegotiating: bool,
    negotiation_id: Option<String>,
    attempt: u32,
    deadline: Option<Instant>,
    created_at: Instant,
}

impl Link {
    /// Create an idle link to `remote_id`.
    #[must_use]
    pub fn new(local_id: ParticipantId, remote_id: ParticipantId) -> Self {
        Self {
            local_id,
            remote_id,
            state: LinkState::Idle,
            role: None,
            pending_candidates: VecDeque::new(),
            remote_description_set: false,
            renegotiating: false,
            negotiation_id: None,
            attempt: 0,
            deadline: None,
            created_at: Instant::now(),
        }
    }

    #[must_use]
    pub fn local_id(&self) -> &ParticipantId {
        &self.local_id
    }

    #[must_use]
    pub fn remote_id(&self) -> &ParticipantId {
        &self.remote_id
    }

    #[must_use]
    pub fn state(&self) -> LinkState {
        self.state
    }

    #[must_use]
    pub fn role(&self) -> Option<LinkRole> {
        self.role
    }

    /// Offer attempt number (1-based; 0 for links that never offered).
    #[must_use]
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    #[must_use]
    pub fn is_renegotiating(&self) -> bool {
        self.renegotiating
    }

    #[must_use]
    pub fn remote_description_set(&self) -> bool {
        self.remote_description_set
    }

    #[must_use]
    pub fn pending_candidate_count(&self) -> usize {
        self.pending_candidates.len()
    }

    /// Identifier of the offer currently awaiting an answer.
    #[must_use]
    pub fn negotiation_id(&self) -> Option<&str> {
        self.negotiation_id.as_deref()
    }

    #[must_use]
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    #[must_use]
    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    /// Collapse the internal state to what observers may rely on.
    #[must_use]
    pub fn outcome(&self) -> LinkOutcome {
        match self.state {
            LinkState::Idle | LinkState::Offering | LinkState::Answering => LinkOutcome::Pending,
            LinkState::Connected => LinkOutcome::Connected,
            LinkState::Closed => LinkOutcome::Closed,
            LinkState::Failed => LinkOutcome::Failed,
        }
    }

    /// Whether a pending negotiation has run past its deadline.
    #[must_use]
    pub fn deadline_expired(&self, now: Instant) -> bool {
        self.deadline.is_some_and(|deadline| now >= deadline)
    }

    /// `Idle → Offering`: the local offer was sent.
    ///
    /// # Errors
    ///
    /// Returns `LinkError::InvalidTransition` unless the link is `Idle`.
    pub fn begin_offer(
        &mut self,
        negotiation_id: impl Into<String>,
        attempt: u32,
        deadline: Instant,
    ) -> Result<(), LinkError> {
        self.expect_state(LinkState::Idle, "offer on")?;
        self.state = LinkState::Offering;
        self.role = Some(LinkRole::Offerer);
        self.negotiation_id = Some(negotiation_id.into());
        self.attempt = attempt;
        self.deadline = Some(deadline);
        Ok(())
    }

    /// `Idle → Answering`: the remote offer was applied as the remote
    /// description. Returns queued candidates to apply now.
    ///
    /// # Errors
    ///
    /// Returns `LinkError::InvalidTransition` unless the link is `Idle`.
    pub fn begin_answer(&mut self) -> Result<Vec<CandidatePayload>, LinkError> {
        self.expect_state(LinkState::Idle, "answer on")?;
        self.state = LinkState::Answering;
        self.role = Some(LinkRole::Answerer);
        Ok(self.mark_remote_description_set())
    }

    /// `Answering → Connected`: the local answer was published.
    ///
    /// # Errors
    ///
    /// Returns `LinkError::InvalidTransition` unless the link is `Answering`.
    pub fn answer_sent(&mut self) -> Result<(), LinkError> {
        self.expect_state(LinkState::Answering, "complete answer on")?;
        self.state = LinkState::Connected;
        self.deadline = None;
        Ok(())
    }

    /// Apply the remote answer.
    ///
    /// `Offering → Connected` for the initial negotiation; a renegotiating
    /// `Connected` link clears its flag. Returns the queued candidates, which
    /// must be applied right after the description and in order.
    ///
    /// # Errors
    ///
    /// Returns `LinkError::InvalidTransition` if no offer is outstanding.
    pub fn apply_answer(&mut self) -> Result<Vec<CandidatePayload>, LinkError> {
        match self.state {
            LinkState::Offering => {
                self.state = LinkState::Connected;
            }
            LinkState::Connected if self.renegotiating => {
                self.renegotiating = false;
            }
            from => {
                return Err(LinkError::InvalidTransition {
                    from,
                    action: "apply an answer to",
                })
            }
        }
        self.deadline = None;
        self.negotiation_id = None;
        Ok(self.mark_remote_description_set())
    }

    /// Whether `answer_id` answers the outstanding offer.
    ///
    /// An answer without an id is accepted for compatibility with peers that
    /// do not echo it.
    #[must_use]
    pub fn answers_current_offer(&self, answer_id: Option<&str>) -> bool {
        match (self.negotiation_id.as_deref(), answer_id) {
            (Some(current), Some(answer)) => current == answer,
            _ => true,
        }
    }

    /// Route an inbound remote candidate.
    ///
    /// # Errors
    ///
    /// Returns `LinkError::InvalidTransition` on a terminal link.
    pub fn accept_candidate(
        &mut self,
        candidate: CandidatePayload,
    ) -> Result<CandidateDisposition, LinkError> {
        if self.state.is_terminal() {
            return Err(LinkError::InvalidTransition {
                from: self.state,
                action: "add a candidate to",
            });
        }

        if self.remote_description_set {
            let mut ready: Vec<CandidatePayload> = self.pending_candidates.drain(..).collect();
            ready.push(candidate);
            Ok(CandidateDisposition::Apply(ready))
        } else {
            self.pending_candidates.push_back(candidate);
            Ok(CandidateDisposition::Queued)
        }
    }

    /// Start a local renegotiation of a `Connected` link.
    ///
    /// # Errors
    ///
    /// Returns `LinkError::InvalidTransition` unless the link is `Connected`
    /// and not already renegotiating.
    pub fn begin_renegotiation(
        &mut self,
        negotiation_id: impl Into<String>,
        deadline: Instant,
    ) -> Result<(), LinkError> {
        if self.state != LinkState::Connected || self.renegotiating {
            return Err(LinkError::InvalidTransition {
                from: self.state,
                action: "renegotiate",
            });
        }
        self.renegotiating = true;
        self.negotiation_id = Some(negotiation_id.into());
        self.deadline = Some(deadline);
        Ok(())
    }

    /// Accept a renegotiation offer from the remote side. The link stays
    /// `Connected`; a local renegotiation in flight is superseded.
    ///
    /// # Errors
    ///
    /// Returns `LinkError::InvalidTransition` unless the link is `Connected`.
    pub fn accept_remote_renegotiation(&mut self) -> Result<(), LinkError> {
        self.expect_state(LinkState::Connected, "accept a renegotiation on")?;
        self.renegotiating = false;
        self.negotiation_id = None;
        self.deadline = None;
        Ok(())
    }

    /// Close the link. Idempotent; discards queued candidates and returns how
    /// many were discarded.
    pub fn close(&mut self) -> usize {
        if self.state.is_terminal() {
            return 0;
        }
        self.finish(LinkState::Closed)
    }

    /// Mark the link as failed. Idempotent on terminal links.
    pub fn fail(&mut self) -> usize {
        if self.state.is_terminal() {
            return 0;
        }
        self.finish(LinkState::Failed)
    }

    fn finish(&mut self, terminal: LinkState) -> usize {
        let discarded = self.pending_candidates.len();
        self.pending_candidates.clear();
        self.state = terminal;
        self.renegotiating = false;
        self.negotiation_id = None;
        self.deadline = None;
        discarded
    }

    fn mark_remote_description_set(&mut self) -> Vec<CandidatePayload> {
        if self.remote_description_set {
            // Renegotiation: the queue was flushed with the first description
            return Vec::new();
        }
        self.remote_description_set = true;
        self.pending_candidates.drain(..).collect()
    }

    fn expect_state(&self, expected: LinkState, action: &'static str) -> Result<(), LinkError> {
        if self.state == expected {
            Ok(())
        } else {
            Err(LinkError::InvalidTransition {
                from: self.state,
                action,
            })
        }
    }
}
