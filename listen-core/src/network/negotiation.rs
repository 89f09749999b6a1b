//! Perfect negotiation
//!
//! Both ends may start an offer at the same time. The polite side yields
//! (rolls back its own offer and answers the remote one), the impolite side
//! ignores the colliding remote offer and waits for its own to be
//! answered. Which end is which is fixed by role: the caller is impolite.

use super::transport::{SdpType, SignalingState};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Politeness {
    Polite,
    Impolite,
}

/// Where the local side is in an offer/answer round
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationPhase {
    Stable,
    /// Creating and applying a local offer
    MakingOffer,
    /// Local offer sent, waiting for the answer
    AwaitingAnswer,
    /// Applying a remote answer
    ApplyingAnswer,
}

/// What to do with an inbound remote description
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DescriptionAction {
    /// Colliding offer on the impolite side
    Ignore,
    /// Apply it (an answer)
    Apply,
    /// Apply it, then create and send an answer
    ApplyAndAnswer,
}

#[derive(Debug, Clone)]
pub struct Negotiator {
    politeness: Politeness,
    phase: NegotiationPhase,
    /// The last remote offer was discarded as a collision
    ignoring_offer: bool,
}

impl Negotiator {
    pub fn new(politeness: Politeness) -> Self {
        Self {
            politeness,
            phase: NegotiationPhase::Stable,
            ignoring_offer: false,
        }
    }

    pub fn politeness(&self) -> Politeness {
        self.politeness
    }

    pub fn phase(&self) -> NegotiationPhase {
        self.phase
    }

    /// Start a local offer. Returns false if one is already being made.
    pub fn begin_offer(&mut self) -> bool {
        if self.phase == NegotiationPhase::MakingOffer {
            return false;
        }
        self.phase = NegotiationPhase::MakingOffer;
        true
    }

    /// The local description has been applied and sent
    pub fn offer_sent(&mut self, applied: SdpType) {
        self.phase = match applied {
            SdpType::Offer => NegotiationPhase::AwaitingAnswer,
            _ => NegotiationPhase::Stable,
        };
    }

    pub fn offer_failed(&mut self) {
        self.phase = NegotiationPhase::Stable;
    }

    /// Decide how to handle a remote description
    pub fn on_remote_description(
        &mut self,
        sdp_type: SdpType,
        signaling: SignalingState,
    ) -> DescriptionAction {
        let ready_for_offer = self.phase != NegotiationPhase::MakingOffer
            && (signaling == SignalingState::Stable
                || self.phase == NegotiationPhase::ApplyingAnswer);
        let collision = sdp_type == SdpType::Offer && !ready_for_offer;

        self.ignoring_offer = self.politeness == Politeness::Impolite && collision;
        if self.ignoring_offer {
            return DescriptionAction::Ignore;
        }

        match sdp_type {
            SdpType::Offer => {
                // A polite peer abandons its own offer here
                self.phase = NegotiationPhase::Stable;
                DescriptionAction::ApplyAndAnswer
            }
            SdpType::Answer => {
                self.phase = NegotiationPhase::ApplyingAnswer;
                DescriptionAction::Apply
            }
            SdpType::Pranswer | SdpType::Rollback => DescriptionAction::Apply,
        }
    }

    /// A remote description finished applying (successfully or not)
    pub fn remote_applied(&mut self) {
        if self.phase == NegotiationPhase::ApplyingAnswer {
            self.phase = NegotiationPhase::Stable;
        }
    }

    /// Candidate failures are expected noise while an offer is being ignored
    pub fn should_report_candidate_errors(&self) -> bool {
        !self.ignoring_offer
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_offer_in_stable_is_answered() {
        for politeness in [Politeness::Polite, Politeness::Impolite] {
            let mut n = Negotiator::new(politeness);
            assert_eq!(
                n.on_remote_description(SdpType::Offer, SignalingState::Stable),
                DescriptionAction::ApplyAndAnswer
            );
            assert!(n.should_report_candidate_errors());
        }
    }

    #[test]
    fn test_impolite_ignores_colliding_offer() {
        let mut n = Negotiator::new(Politeness::Impolite);
        assert!(n.begin_offer());
        n.offer_sent(SdpType::Offer);
        assert_eq!(n.phase(), NegotiationPhase::AwaitingAnswer);

        assert_eq!(
            n.on_remote_description(SdpType::Offer, SignalingState::HaveLocalOffer),
            DescriptionAction::Ignore
        );
        assert!(!n.should_report_candidate_errors());
        assert_eq!(n.phase(), NegotiationPhase::AwaitingAnswer);

        // Our own offer is still answered normally
        assert_eq!(
            n.on_remote_description(SdpType::Answer, SignalingState::HaveLocalOffer),
            DescriptionAction::Apply
        );
        assert!(n.should_report_candidate_errors());
        n.remote_applied();
        assert_eq!(n.phase(), NegotiationPhase::Stable);
    }

    #[test]
    fn test_polite_yields_to_colliding_offer() {
        let mut n = Negotiator::new(Politeness::Polite);
        assert!(n.begin_offer());
        n.offer_sent(SdpType::Offer);

        assert_eq!(
            n.on_remote_description(SdpType::Offer, SignalingState::HaveLocalOffer),
            DescriptionAction::ApplyAndAnswer
        );
        assert_eq!(n.phase(), NegotiationPhase::Stable);
        assert!(n.should_report_candidate_errors());
    }

    #[test]
    fn test_offer_while_making_offer_collides() {
        let mut n = Negotiator::new(Politeness::Impolite);
        assert!(n.begin_offer());
        assert!(!n.begin_offer());
        assert_eq!(
            n.on_remote_description(SdpType::Offer, SignalingState::Stable),
            DescriptionAction::Ignore
        );
    }

    #[test]
    fn test_failed_offer_returns_to_stable() {
        let mut n = Negotiator::new(Politeness::Polite);
        assert!(n.begin_offer());
        n.offer_failed();
        assert_eq!(n.phase(), NegotiationPhase::Stable);
        assert!(n.begin_offer());
    }
}
