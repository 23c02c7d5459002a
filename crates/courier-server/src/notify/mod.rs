//! Push notifications for recipients with no live session.
//!
//! The dispatcher builds one [`Notification`] per pushed message and hands
//! the device tokens of offline recipients to a [`PushGateway`].

mod apns;

pub use apns::{ApnsError, ApnsGateway};

use std::collections::HashMap;

use async_trait::async_trait;
use courier_core::errors::ErrorKind;
use courier_core::events::{MessageKind, NewMessage};
use courier_core::options::NotificationOpts;
use courier_store::DeviceToken;
use thiserror::Error;
use tracing::debug;

/// Provider reasons meaning the token will never work again.
const DEAD_TOKEN_REASONS: &[&str] = &["BadDeviceToken", "Unregistered", "DeviceTokenNotForTopic"];

/// A notification ready to send.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Notification {
    /// Alert title. `None` for data-only pushes.
    pub title: Option<String>,
    /// Alert body. `None` for data-only pushes.
    pub body: Option<String>,
    /// Custom fields delivered alongside the alert.
    pub data: HashMap<String, String>,
    /// Groups notifications of one conversation.
    pub thread_id: Option<String>,
}

impl Notification {
    /// Whether this is a data-only push.
    pub fn is_silent(&self) -> bool {
        self.title.is_none() && self.body.is_none()
    }
}

/// Build the notification for a new message.
///
/// The title is `opts.title`, else the conversation name. Media messages get
/// a fixed body. With `opts.silence` the alert is dropped and only the data
/// remains.
pub fn build_notification(message: &NewMessage, opts: &NotificationOpts) -> Notification {
    let mut data = HashMap::new();
    let _ = data.insert("conversationId".to_owned(), message.conversation_id.to_string());
    let _ = data.insert("messageId".to_owned(), message.message_id.to_string());
    if let Some(sender) = &message.sender_id {
        let _ = data.insert("senderId".to_owned(), sender.to_string());
    }

    let (title, body) = if opts.silence {
        (None, None)
    } else {
        let title = opts
            .title
            .clone()
            .or_else(|| message.conversation_name.clone())
            .unwrap_or_default();
        let body = match message.kind {
            MessageKind::Image => "sent an image".to_owned(),
            MessageKind::File => "sent a file".to_owned(),
            MessageKind::Text | MessageKind::System => message.content.clone(),
        };
        (Some(title), Some(body))
    };

    Notification {
        title,
        body,
        data,
        thread_id: Some(message.conversation_id.to_string()),
    }
}

/// Counts for one gateway call.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BatchReport {
    /// Tokens accepted by the provider.
    pub success: usize,
    /// Tokens rejected.
    pub failure: usize,
}

/// One rejected token.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TokenFailure {
    /// The token.
    pub token: String,
    /// Provider status code, if a response arrived.
    pub status: Option<u16>,
    /// Provider reason or transport error.
    pub reason: String,
}

impl TokenFailure {
    /// Whether the provider says the token is permanently invalid.
    pub fn is_dead_token(&self) -> bool {
        self.status == Some(410) || DEAD_TOKEN_REASONS.contains(&self.reason.as_str())
    }
}

/// Gateway failures.
#[derive(Debug, Error)]
pub enum NotificationError {
    /// Some tokens failed; the rest were delivered.
    #[error("{} of {} notifications failed", report.failure, report.success + report.failure)]
    Partial {
        /// Counts.
        report: BatchReport,
        /// Rejected tokens.
        failures: Vec<TokenFailure>,
    },

    /// Nothing could be sent.
    #[error("notification gateway failed: {reason}")]
    Direct {
        /// Cause.
        reason: String,
    },
}

impl NotificationError {
    /// Classification of this failure.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Partial { .. } => ErrorKind::Transient,
            Self::Direct { .. } => ErrorKind::Unavailable,
        }
    }
}

/// Delivers notifications to devices.
#[async_trait]
pub trait PushGateway: Send + Sync {
    /// Send `notification` to every token.
    async fn send(
        &self,
        tokens: &[DeviceToken],
        notification: &Notification,
    ) -> Result<BatchReport, NotificationError>;
}

/// Gateway used when no provider is configured.
#[derive(Clone, Copy, Debug, Default)]
pub struct DisabledGateway;

#[async_trait]
impl PushGateway for DisabledGateway {
    async fn send(
        &self,
        tokens: &[DeviceToken],
        _notification: &Notification,
    ) -> Result<BatchReport, NotificationError> {
        debug!(tokens = tokens.len(), "push gateway disabled, notification skipped");
        Ok(BatchReport::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use courier_core::ids::{ConversationId, MessageId, UserId};

    fn message(kind: MessageKind) -> NewMessage {
        NewMessage {
            conversation_id: ConversationId::from("c1"),
            message_id: MessageId::from("m1"),
            conversation_name: Some("Math 101".into()),
            sender_id: Some(UserId::from("a")),
            content: "see you at 5".into(),
            kind,
            url_media: None,
            local_message_id: None,
            target_user: None,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn text_uses_conversation_name_and_content() {
        let n = build_notification(&message(MessageKind::Text), &NotificationOpts::default());
        assert_eq!(n.title.as_deref(), Some("Math 101"));
        assert_eq!(n.body.as_deref(), Some("see you at 5"));
        assert_eq!(n.data["conversationId"], "c1");
        assert_eq!(n.data["messageId"], "m1");
        assert_eq!(n.thread_id.as_deref(), Some("c1"));
        assert!(!n.is_silent());
    }

    #[test]
    fn explicit_title_wins() {
        let opts = NotificationOpts {
            title: Some("Alice".into()),
            ..NotificationOpts::default()
        };
        let n = build_notification(&message(MessageKind::Text), &opts);
        assert_eq!(n.title.as_deref(), Some("Alice"));
    }

    #[test]
    fn media_bodies() {
        let opts = NotificationOpts::default();
        let image = build_notification(&message(MessageKind::Image), &opts);
        let file = build_notification(&message(MessageKind::File), &opts);
        assert_eq!(image.body.as_deref(), Some("sent an image"));
        assert_eq!(file.body.as_deref(), Some("sent a file"));
    }

    #[test]
    fn silence_is_data_only() {
        let opts = NotificationOpts {
            silence: true,
            ..NotificationOpts::default()
        };
        let n = build_notification(&message(MessageKind::Text), &opts);
        assert!(n.is_silent());
        assert_eq!(n.data["messageId"], "m1");
    }

    #[test]
    fn dead_token_detection() {
        let gone = TokenFailure {
            token: "t".into(),
            status: Some(410),
            reason: "Unregistered".into(),
        };
        let busy = TokenFailure {
            token: "t".into(),
            status: Some(429),
            reason: "TooManyRequests".into(),
        };
        assert!(gone.is_dead_token());
        assert!(!busy.is_dead_token());
    }

    #[test]
    fn partial_error_display() {
        let err = NotificationError::Partial {
            report: BatchReport {
                success: 2,
                failure: 1,
            },
            failures: Vec::new(),
        };
        assert_eq!(err.to_string(), "1 of 3 notifications failed");
        assert_eq!(err.kind(), ErrorKind::Transient);
    }

    #[tokio::test]
    async fn disabled_gateway_is_a_no_op() {
        let n = build_notification(&message(MessageKind::Text), &NotificationOpts::default());
        let report = DisabledGateway.send(&[], &n).await.unwrap();
        assert_eq!(report, BatchReport::default());
    }
}
