//! Outbound mail transports.
//!
//! The engine hands each attempt to a [`Transport`] as an [`Envelope`] and
//! only cares whether the send succeeded. [`SmtpTransport`] is the
//! production implementation; [`mock::ScriptedTransport`] plays back a
//! scripted sequence of outcomes for tests.

use std::{future::Future, pin::Pin, sync::Arc, time::Duration};

use courier_core::DeliveryRecord;
use lettre::{
    message::{header::ContentType, Mailbox},
    transport::smtp::authentication::Credentials,
    AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor,
};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{DeliveryError, TransportError};

/// Sender address used when none is configured.
pub const DEFAULT_SENDER: &str = "noreply@moviereviews.com";

/// Submission port used with STARTTLS when none is configured.
pub const DEFAULT_SMTP_PORT: u16 = 587;

/// One plain-text email to send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    /// Destination address.
    pub recipient: String,
    /// Subject line.
    pub subject: String,
    /// Plain-text body.
    pub body: String,
}

impl From<&DeliveryRecord> for Envelope {
    fn from(record: &DeliveryRecord) -> Self {
        Self {
            recipient: record.recipient.clone(),
            subject: record.subject.clone(),
            body: record.content.clone(),
        }
    }
}

/// Outbound mail transport.
pub trait Transport: Send + Sync + 'static {
    /// Sends one email. Completes once the server accepted or refused it.
    fn send(
        &self,
        envelope: Envelope,
    ) -> Pin<Box<dyn Future<Output = Result<(), TransportError>> + Send + '_>>;
}

/// Connection security for the SMTP relay.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SmtpSecurity {
    /// Plain connection upgraded with STARTTLS.
    #[default]
    Starttls,
    /// Implicit TLS from the first byte.
    Tls,
    /// Unencrypted. Only for local relays and test servers.
    None,
}

/// SMTP relay settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SmtpConfig {
    /// Relay hostname.
    pub host: String,
    /// Relay port.
    pub port: u16,
    /// Connection security.
    pub security: SmtpSecurity,
    /// Optional username for authentication.
    pub username: Option<String>,
    /// Optional password for authentication.
    pub password: Option<String>,
    /// Fixed sender address for every message.
    pub sender: String,
    /// Socket-level timeout for SMTP commands.
    pub command_timeout: Duration,
}

impl Default for SmtpConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: DEFAULT_SMTP_PORT,
            security: SmtpSecurity::default(),
            username: None,
            password: None,
            sender: DEFAULT_SENDER.to_string(),
            command_timeout: Duration::from_secs(10),
        }
    }
}

/// SMTP transport built on lettre's pooled async relay.
#[derive(Clone)]
pub struct SmtpTransport {
    relay: Arc<AsyncSmtpTransport<Tokio1Executor>>,
    sender: Mailbox,
    command_timeout: Duration,
}

impl SmtpTransport {
    /// Builds the relay client. Does not open a connection.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if the sender address is invalid or the
    /// TLS parameters cannot be built.
    pub fn new(config: SmtpConfig) -> crate::Result<Self> {
        let sender: Mailbox = config.sender.parse().map_err(|_| {
            DeliveryError::configuration(format!("invalid sender address '{}'", config.sender))
        })?;

        let mut builder = match config.security {
            SmtpSecurity::None => {
                AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(&config.host)
            },
            SmtpSecurity::Tls => AsyncSmtpTransport::<Tokio1Executor>::relay(&config.host)
                .map_err(|e| DeliveryError::configuration(format!("smtp tls setup: {e}")))?,
            SmtpSecurity::Starttls => {
                AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&config.host).map_err(|e| {
                    DeliveryError::configuration(format!("smtp starttls setup: {e}"))
                })?
            },
        };

        builder = builder.port(config.port).timeout(Some(config.command_timeout));

        if let (Some(username), Some(password)) = (config.username, config.password) {
            builder = builder.credentials(Credentials::new(username, password));
        }

        Ok(Self {
            relay: Arc::new(builder.build()),
            sender,
            command_timeout: config.command_timeout,
        })
    }

    fn build_message(&self, envelope: Envelope) -> Result<Message, TransportError> {
        let to: Mailbox = envelope
            .recipient
            .parse()
            .map_err(|_| TransportError::invalid_address(&envelope.recipient))?;

        Message::builder()
            .from(self.sender.clone())
            .to(to)
            .subject(envelope.subject)
            .header(ContentType::TEXT_PLAIN)
            .body(envelope.body)
            .map_err(|e| TransportError::MessageBuild { message: e.to_string() })
    }

    fn classify(&self, err: &lettre::transport::smtp::Error) -> TransportError {
        if err.is_timeout() {
            TransportError::timeout(self.command_timeout)
        } else if err.is_permanent() {
            TransportError::rejected(err.to_string())
        } else {
            TransportError::unavailable(err.to_string())
        }
    }
}

impl Transport for SmtpTransport {
    fn send(
        &self,
        envelope: Envelope,
    ) -> Pin<Box<dyn Future<Output = Result<(), TransportError>> + Send + '_>> {
        Box::pin(async move {
            let message = self.build_message(envelope)?;
            let response = self.relay.send(message).await.map_err(|e| self.classify(&e))?;
            debug!(code = %response.code(), "smtp relay accepted message");
            Ok(())
        })
    }
}

pub mod mock {
    //! Scripted transport for tests.
    //!
    //! Each call consumes the next [`Step`]; once the script is exhausted the
    //! fallback step repeats. Every envelope handed over is recorded.

    use std::{collections::VecDeque, future::Future, pin::Pin, sync::Arc, time::Duration};

    use tokio::sync::Mutex;

    use super::{Envelope, Transport, TransportError};

    /// Scripted outcome of one send.
    #[derive(Debug, Clone)]
    pub enum Step {
        /// Accept the message.
        Succeed,
        /// Refuse the message with the given error.
        Fail(TransportError),
        /// Wait, then accept the message.
        Delay(Duration),
        /// Never complete.
        Hang,
    }

    #[derive(Debug)]
    struct Script {
        steps: VecDeque<Step>,
        fallback: Step,
        calls: Vec<Envelope>,
    }

    /// Transport that plays back a script of outcomes.
    #[derive(Debug, Clone)]
    pub struct ScriptedTransport {
        script: Arc<Mutex<Script>>,
    }

    impl ScriptedTransport {
        /// Transport that accepts everything.
        pub fn succeeding() -> Self {
            Self::with_fallback(Step::Succeed)
        }

        /// Transport that refuses everything with `error`.
        pub fn failing(error: TransportError) -> Self {
            Self::with_fallback(Step::Fail(error))
        }

        /// Transport whose calls never complete.
        pub fn hanging() -> Self {
            Self::with_fallback(Step::Hang)
        }

        /// Transport repeating `fallback` once the script runs out.
        pub fn with_fallback(fallback: Step) -> Self {
            Self {
                script: Arc::new(Mutex::new(Script {
                    steps: VecDeque::new(),
                    fallback,
                    calls: Vec::new(),
                })),
            }
        }

        /// Queues steps to play before the fallback.
        pub async fn push_steps(&self, steps: impl IntoIterator<Item = Step>) {
            self.script.lock().await.steps.extend(steps);
        }

        /// Number of sends attempted so far.
        pub async fn call_count(&self) -> usize {
            self.script.lock().await.calls.len()
        }

        /// Envelopes handed over so far, in call order.
        pub async fn calls(&self) -> Vec<Envelope> {
            self.script.lock().await.calls.clone()
        }
    }

    impl Transport for ScriptedTransport {
        fn send(
            &self,
            envelope: Envelope,
        ) -> Pin<Box<dyn Future<Output = Result<(), TransportError>> + Send + '_>> {
            Box::pin(async move {
                let step = {
                    let mut script = self.script.lock().await;
                    script.calls.push(envelope);
                    script.steps.pop_front().unwrap_or_else(|| script.fallback.clone())
                };

                match step {
                    Step::Succeed => Ok(()),
                    Step::Fail(error) => Err(error),
                    Step::Delay(duration) => {
                        tokio::time::sleep(duration).await;
                        Ok(())
                    },
                    Step::Hang => std::future::pending().await,
                }
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn envelope(recipient: &str) -> Envelope {
        Envelope {
            recipient: recipient.to_string(),
            subject: "New comment on your review".to_string(),
            body: "Someone replied.".to_string(),
        }
    }

    fn local_relay() -> SmtpConfig {
        SmtpConfig { security: SmtpSecurity::None, port: 25, ..Default::default() }
    }

    #[test]
    fn invalid_sender_is_a_configuration_error() {
        let config = SmtpConfig { sender: "not an address".to_string(), ..Default::default() };
        assert!(matches!(
            SmtpTransport::new(config),
            Err(DeliveryError::ConfigurationError { .. })
        ));
    }

    #[tokio::test]
    async fn invalid_recipient_fails_before_connecting() {
        let transport = SmtpTransport::new(local_relay()).unwrap();

        let err = transport.send(envelope("definitely not an address")).await.unwrap_err();

        assert_eq!(err.kind(), "InvalidAddress");
    }

    #[tokio::test]
    async fn message_uses_fixed_sender_and_plain_text() {
        let transport = SmtpTransport::new(local_relay()).unwrap();

        let message = transport.build_message(envelope("critic@example.com")).unwrap();
        let headers = message.headers().to_string();

        assert!(headers.contains("From: noreply@moviereviews.com"));
        assert!(headers.contains("To: critic@example.com"));
        assert!(headers.contains("Subject: New comment on your review"));
        assert!(headers.contains("text/plain"));
    }

    #[tokio::test]
    async fn scripted_transport_plays_steps_then_fallback() {
        let transport = mock::ScriptedTransport::succeeding();
        transport
            .push_steps([mock::Step::Fail(TransportError::unavailable("421 busy"))])
            .await;

        assert!(transport.send(envelope("a@example.com")).await.is_err());
        assert!(transport.send(envelope("a@example.com")).await.is_ok());
        assert!(transport.send(envelope("a@example.com")).await.is_ok());
        assert_eq!(transport.call_count().await, 3);
    }
}
