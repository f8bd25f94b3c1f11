//! Signaling state machine
//!
//! Tracks the progress of an offer/answer exchange as descriptions are set.
//!
//! ```text
//!            set local offer            set remote answer
//!   Stable ─────────────────► HaveLocalOffer ──────────────► Stable
//!     │                          │ set remote pranswer
//!     │                          ▼
//!     │                    HaveRemotePrAnswer ── set local/remote answer ──► Stable
//!     │  set remote offer         set local answer
//!     └──────────────────► HaveRemoteOffer ────────────────► Stable
//!                                │ set local pranswer
//!                                ▼
//!                          HaveLocalPrAnswer ── set remote/local answer ──► Stable
//!
//!   any ── close ──► Closed (terminal)
//! ```

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::sdp::SdpType;
use crate::{Error, Result};

/// Signaling state of a peer connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SignalingState {
    #[default]
    Stable,
    HaveLocalOffer,
    #[serde(rename = "have-local-pranswer")]
    HaveLocalPrAnswer,
    HaveRemoteOffer,
    #[serde(rename = "have-remote-pranswer")]
    HaveRemotePrAnswer,
    Closed,
}

impl fmt::Display for SignalingState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SignalingState::Stable => "stable",
            SignalingState::HaveLocalOffer => "have-local-offer",
            SignalingState::HaveLocalPrAnswer => "have-local-pranswer",
            SignalingState::HaveRemoteOffer => "have-remote-offer",
            SignalingState::HaveRemotePrAnswer => "have-remote-pranswer",
            SignalingState::Closed => "closed",
        };
        f.write_str(s)
    }
}

/// Which side a description is being applied to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DescriptionSource {
    Local,
    Remote,
}

impl fmt::Display for DescriptionSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DescriptionSource::Local => f.write_str("local"),
            DescriptionSource::Remote => f.write_str("remote"),
        }
    }
}

/// Pure transition table; holds no locks of its own
#[derive(Debug, Clone, Default)]
pub struct SignalingStateMachine {
    state: SignalingState,
}

impl SignalingStateMachine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> SignalingState {
        self.state
    }

    pub fn is_closed(&self) -> bool {
        self.state == SignalingState::Closed
    }

    /// Compute the state that applying a description would produce,
    /// without changing anything.
    pub fn next_state(&self, source: DescriptionSource, sdp_type: SdpType) -> Result<SignalingState> {
        use DescriptionSource::{Local, Remote};
        use SdpType::{Answer, Offer, PrAnswer};
        use SignalingState::*;

        let next = match (self.state, source, sdp_type) {
            (Stable, Local, Offer) => HaveLocalOffer,
            (Stable, Remote, Offer) => HaveRemoteOffer,

            // Re-offer replaces the pending offer
            (HaveLocalOffer, Local, Offer) => HaveLocalOffer,
            (HaveRemoteOffer, Remote, Offer) => HaveRemoteOffer,

            (HaveLocalOffer, Remote, Answer) => Stable,
            (HaveLocalOffer, Remote, PrAnswer) => HaveRemotePrAnswer,

            (HaveRemoteOffer, Local, Answer) => Stable,
            (HaveRemoteOffer, Local, PrAnswer) => HaveLocalPrAnswer,

            (HaveLocalPrAnswer, Remote | Local, Answer) => Stable,
            (HaveLocalPrAnswer, Local, PrAnswer) => HaveLocalPrAnswer,

            (HaveRemotePrAnswer, Local | Remote, Answer) => Stable,
            (HaveRemotePrAnswer, Remote, PrAnswer) => HaveRemotePrAnswer,

            (Closed, _, _) => {
                return Err(Error::invalid_state(
                    Closed,
                    format!("cannot set {source} {sdp_type} on a closed connection"),
                ))
            }
            (state, _, _) => {
                return Err(Error::invalid_state(
                    state,
                    format!("cannot set {source} {sdp_type}"),
                ))
            }
        };

        Ok(next)
    }

    /// Apply a description, returning the new state.
    ///
    /// On error the state is left unchanged.
    pub fn apply(&mut self, source: DescriptionSource, sdp_type: SdpType) -> Result<SignalingState> {
        let next = self.next_state(source, sdp_type)?;
        self.state = next;
        Ok(next)
    }

    /// Move to Closed. Returns `false` when already closed.
    pub fn close(&mut self) -> bool {
        if self.state == SignalingState::Closed {
            return false;
        }
        self.state = SignalingState::Closed;
        true
    }

    /// Adopt the state the engine reports. Closed is never left.
    ///
    /// Returns `true` if the state changed.
    pub fn resync(&mut self, state: SignalingState) -> bool {
        if self.state == SignalingState::Closed || self.state == state {
            return false;
        }
        self.state = state;
        true
    }

    /// Check that an offer may be created in the current state
    pub fn check_create_offer(&self) -> Result<()> {
        match self.state {
            SignalingState::Stable | SignalingState::HaveLocalOffer => Ok(()),
            state => Err(Error::invalid_state(state, "cannot create an offer")),
        }
    }

    /// Check that an answer may be created in the current state
    pub fn check_create_answer(&self) -> Result<()> {
        match self.state {
            SignalingState::HaveRemoteOffer | SignalingState::HaveLocalPrAnswer => Ok(()),
            state => Err(Error::invalid_state(
                state,
                "cannot create an answer without a remote offer",
            )),
        }
    }
}
