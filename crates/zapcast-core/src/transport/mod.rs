//! Transport collaborator - hands one message to one device for delivery
//!
//! The engine treats the transient/permanent distinction reported here as
//! authoritative. How a gateway response maps onto it is a pluggable
//! [`FailureClassifier`].

mod http;

pub use http::HttpTransport;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use zapcast_common::types::{CampaignId, CampaignMessageId};
use zapcast_storage::models::{CampaignMessage, Instance};

/// Message as handed to the transport
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboundMessage {
    pub message_id: CampaignMessageId,
    pub campaign_id: CampaignId,
    pub recipient: String,
    pub content: String,
}

impl From<&CampaignMessage> for OutboundMessage {
    fn from(message: &CampaignMessage) -> Self {
        Self {
            message_id: message.id,
            campaign_id: message.campaign_id,
            recipient: message.recipient.clone(),
            content: message.content.clone(),
        }
    }
}

/// Outcome of one delivery attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendOutcome {
    Delivered { provider_message_id: Option<String> },
    /// Worth retrying later (timeout, device dropped mid-send, gateway overloaded)
    TransientError { error: String },
    /// Retrying cannot help (invalid recipient, rejected content)
    PermanentError { error: String },
}

/// Transport trait
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, instance: &Instance, message: &OutboundMessage) -> SendOutcome;
}

/// Failure class
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    Transient,
    Permanent,
}

/// Request that never produced an HTTP response
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestFailure {
    Timeout,
    Connect,
    Other,
}

/// Maps gateway failures onto [`FailureKind`]
pub trait FailureClassifier: Send + Sync {
    fn classify_status(&self, status: u16) -> FailureKind;
    fn classify_request(&self, failure: RequestFailure) -> FailureKind;
}

/// Default classification: network trouble, 408, 429 and 5xx are transient;
/// every other non-success status is permanent.
#[derive(Debug, Clone, Copy, Default)]
pub struct StatusClassifier;

impl FailureClassifier for StatusClassifier {
    fn classify_status(&self, status: u16) -> FailureKind {
        match status {
            408 | 429 => FailureKind::Transient,
            500..=599 => FailureKind::Transient,
            _ => FailureKind::Permanent,
        }
    }

    fn classify_request(&self, _failure: RequestFailure) -> FailureKind {
        FailureKind::Transient
    }
}
