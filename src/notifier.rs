//! Email notifications for worker lifecycle events.
use std::sync::Arc;

use lettre::message::header::ContentType;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{Message, SmtpTransport, Transport};
use tracing::{error, info};

use crate::config::EmailConfig;
use crate::error::NotifierError;

/// Fire-and-forget sink for `started`, `stopped` and `exited` events.
///
/// Delivery happens on the blocking thread pool; failures are logged and
/// never reach the worker state machine.
#[derive(Debug, Clone)]
pub struct Notifier {
    email: Arc<EmailConfig>,
}

impl Notifier {
    /// Creates a notifier from validated SMTP settings.
    pub fn new(email: EmailConfig) -> Self {
        Self {
            email: Arc::new(email),
        }
    }

    /// Notifies that a process of `service` started.
    pub fn send_start(&self, service: &str, state: &str) {
        self.dispatch(
            format!("Taskmaster - {service} - process started"),
            format!(
                "We inform you that a process has started in the service {service} \
                 and is now in the state {}.",
                state.to_lowercase()
            ),
        );
    }

    /// Notifies that a process of `service` was stopped.
    pub fn send_stop(&self, service: &str, state: &str) {
        self.dispatch(
            format!("Taskmaster - {service} - process stopped"),
            format!(
                "We inform you that a process has stopped in the service {service} \
                 and is now in the state {}.",
                state.to_lowercase()
            ),
        );
    }

    /// Notifies that a process of `service` exited.
    pub fn send_exited(&self, service: &str, state: &str) {
        self.dispatch(
            format!("Taskmaster - {service} - process exited"),
            format!(
                "We inform you that a process has exited in the service {service} \
                 and is now in the state {}.",
                state.to_lowercase()
            ),
        );
    }

    /// Hands the message to the blocking pool and returns immediately.
    fn dispatch(&self, subject: String, body: String) {
        let email = Arc::clone(&self.email);
        tokio::task::spawn_blocking(move || {
            if let Err(err) = deliver(&email, &subject, &body) {
                error!("failed to send notification email: {err}");
            }
        });
    }
}

/// Builds and sends one email over a STARTTLS relay.
fn deliver(email: &EmailConfig, subject: &str, body: &str) -> Result<(), NotifierError> {
    let message = Message::builder()
        .from(email.smtp_email.parse()?)
        .to(email.to.parse()?)
        .subject(subject)
        .header(ContentType::TEXT_PLAIN)
        .body(body.to_string())?;

    let transport = SmtpTransport::starttls_relay(&email.smtp_server)?
        .port(email.smtp_port)
        .credentials(Credentials::new(
            email.smtp_email.clone(),
            email.smtp_password.clone(),
        ))
        .build();

    info!("sending notification email to {}", email.to);
    transport.send(&message)?;
    Ok(())
}
