//! Feedback records appended by the router, the scorer and collaborators

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::routing::RoutingDecision;
use crate::scoring::ScoreResult;

/// Realized real-world outcome for a scored lead or a routed task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    /// Deal closed
    Closed,
    /// Seller accepted an offer
    OfferAccepted,
    /// Lead went nowhere
    Dead,
    /// Seller asked not to be contacted
    OptOut,
    /// Nothing heard back yet
    NoResponse,
}

impl Outcome {
    /// Training label: `Some(true)` for successes, `Some(false)` for failures,
    /// `None` when the outcome carries no signal yet
    pub fn label(&self) -> Option<bool> {
        match self {
            Self::Closed | Self::OfferAccepted => Some(true),
            Self::Dead | Self::OptOut => Some(false),
            Self::NoResponse => None,
        }
    }
}

impl std::fmt::Display for Outcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => write!(f, "closed"),
            Self::OfferAccepted => write!(f, "offer_accepted"),
            Self::Dead => write!(f, "dead"),
            Self::OptOut => write!(f, "opt_out"),
            Self::NoResponse => write!(f, "no_response"),
        }
    }
}

impl std::str::FromStr for Outcome {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().replace('-', "_").as_str() {
            "closed" => Ok(Self::Closed),
            "offer_accepted" | "accepted" => Ok(Self::OfferAccepted),
            "dead" => Ok(Self::Dead),
            "opt_out" | "optout" => Ok(Self::OptOut),
            "no_response" => Ok(Self::NoResponse),
            _ => Err(format!("Unknown outcome: {}", s)),
        }
    }
}

/// Latency and error of one `invoke` call against one backend
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvocationFeedback {
    /// Routing decision this call served, if any
    pub decision_id: Option<Uuid>,
    pub model_id: String,
    pub task_type: Option<String>,
    pub latency_ms: u64,
    pub attempts: u32,
    /// Error text when the call failed
    pub error: Option<String>,
}

impl InvocationFeedback {
    pub fn succeeded(&self) -> bool {
        self.error.is_none()
    }
}

/// Something worth remembering for the learning loop
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FeedbackEvent {
    Decision(RoutingDecision),
    Score(ScoreResult),
    Invocation(InvocationFeedback),
    Outcome { subject_id: Uuid, outcome: Outcome },
}

impl FeedbackEvent {
    /// Short name used in logs and storage
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Decision(_) => "decision",
            Self::Score(_) => "score",
            Self::Invocation(_) => "invocation",
            Self::Outcome { .. } => "outcome",
        }
    }
}

/// An appended feedback event with its store-assigned sequence number
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeedbackRecord {
    /// Position in the log, starting at 1; snapshots resume from a sequence number
    pub seq: u64,
    pub recorded_at: DateTime<Utc>,
    pub event: FeedbackEvent,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_outcome_labels() {
        assert_eq!(Outcome::Closed.label(), Some(true));
        assert_eq!(Outcome::OfferAccepted.label(), Some(true));
        assert_eq!(Outcome::Dead.label(), Some(false));
        assert_eq!(Outcome::OptOut.label(), Some(false));
        assert_eq!(Outcome::NoResponse.label(), None);
    }

    #[test]
    fn test_outcome_parse() {
        assert_eq!("Offer-Accepted".parse::<Outcome>().unwrap(), Outcome::OfferAccepted);
        assert_eq!("opt_out".parse::<Outcome>().unwrap(), Outcome::OptOut);
        assert!("maybe".parse::<Outcome>().is_err());
    }

    #[test]
    fn test_event_serializes_with_type_tag() {
        let event = FeedbackEvent::Outcome {
            subject_id: Uuid::nil(),
            outcome: Outcome::Closed,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "outcome");
        assert_eq!(json["outcome"], "closed");
        assert_eq!(event.kind(), "outcome");
    }
}
