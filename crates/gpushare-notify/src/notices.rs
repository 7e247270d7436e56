//! Notice builders
//!
//! Callers resolve users to their full address lists before a notice is
//! built; the notifier only ever sees addresses.

use chrono::{DateTime, Utc};
use gpushare_core::{Gpu, NotificationConfig, Reservation, User};

use crate::traits::Mail;

#[derive(Debug, Clone)]
pub struct Notices {
    subject_prefix: String,
    operators: Vec<String>,
}

impl Notices {
    pub fn new(config: &NotificationConfig) -> Self {
        Self {
            subject_prefix: config.subject_prefix.clone(),
            operators: config.operators.clone(),
        }
    }

    pub fn operators(&self) -> &[String] {
        &self.operators
    }

    fn subject(&self, text: String) -> String {
        if self.subject_prefix.is_empty() {
            text
        } else {
            format!("{} {}", self.subject_prefix, text)
        }
    }

    fn mail(&self, subject: String, body: String, to: Vec<String>) -> Mail {
        Mail {
            subject: self.subject(subject),
            body,
            to,
            cc: Vec::new(),
            bcc: Vec::new(),
        }
    }

    /// Tell the current holder that someone queued behind them
    pub fn reservation_queued(
        &self,
        holder: &User,
        queued: &Reservation,
        model_name: &str,
    ) -> Mail {
        self.mail(
            format!("New reservation for {} on {}", model_name, queued.device),
            format!(
                "Hello {},\n\n{} is now waiting for {} ({}) on {}. \
                 Please release the GPU when you are done.\n",
                holder.username, queued.user, model_name, queued.gpu, queued.device
            ),
            holder.addresses(),
        )
    }

    /// Tell a user their reservation is now active
    pub fn gpu_ready(&self, user: &User, reservation: &Reservation, model_name: &str) -> Mail {
        self.mail(
            format!("{} on {} is now available", model_name, reservation.device),
            format!(
                "Hello {},\n\n{} ({}) on {} is now yours until {}.\n",
                user.username,
                model_name,
                reservation.gpu,
                reservation.device,
                format_time(reservation.usage_expires)
            ),
            user.addresses(),
        )
    }

    /// Tell a user their usage window ran out
    pub fn reservation_expired(
        &self,
        user: &User,
        reservation: &Reservation,
        model_name: &str,
    ) -> Mail {
        self.mail(
            format!("Reservation for {} on {} expired", model_name, reservation.device),
            format!(
                "Hello {},\n\nyour reservation of {} ({}) on {} expired at {} \
                 and has been removed.\n",
                user.username,
                model_name,
                reservation.gpu,
                reservation.device,
                format_time(reservation.usage_expires)
            ),
            user.addresses(),
        )
    }

    /// Tell a user their usage window ends soon and can be extended
    pub fn extension_reminder(
        &self,
        user: &User,
        reservation: &Reservation,
        model_name: &str,
    ) -> Mail {
        self.mail(
            format!(
                "Reservation for {} on {} expires soon",
                model_name, reservation.device
            ),
            format!(
                "Hello {},\n\nyour reservation of {} ({}) on {} expires at {}. \
                 Extend it if you still need the GPU.\n",
                user.username,
                model_name,
                reservation.gpu,
                reservation.device,
                format_time(reservation.usage_expires)
            ),
            user.addresses(),
        )
    }

    /// Report a GPU that stopped reporting
    ///
    /// Goes to the holder with operators in copy, or to the operators alone
    /// when nobody holds the GPU.
    pub fn gpu_failed(&self, holder: Option<&User>, gpu: &Gpu) -> Mail {
        let (to, cc, greeting) = match holder {
            Some(user) => (
                user.addresses(),
                self.operators.clone(),
                format!("Hello {},", user.username),
            ),
            None => (self.operators.clone(), Vec::new(), "Hello,".to_string()),
        };
        Mail {
            subject: self.subject(format!("{} on {} stopped reporting", gpu.model_name, gpu.device)),
            body: format!(
                "{}\n\n{} ({}) on {} has not reported since {} and is marked as failed.\n",
                greeting,
                gpu.model_name,
                gpu.uuid,
                gpu.device,
                gpu.last_updated.to_rfc3339()
            ),
            to,
            cc,
            bcc: Vec::new(),
        }
    }

    /// Message from one user to chosen users, on all their addresses
    ///
    /// The sender is copied on every address they have.
    pub fn user_message(&self, sender: &User, recipients: &[User], subject: &str, body: &str) -> Mail {
        Mail {
            subject: self.subject(subject.to_string()),
            body: body.to_string(),
            to: collect_addresses(recipients),
            cc: sender.addresses(),
            bcc: Vec::new(),
        }
    }

    /// Message from a staff member to every other user
    ///
    /// Recipients are blind copied; the visible recipient is the sender.
    pub fn message_all(&self, sender: &User, everyone: &[User], subject: &str, body: &str) -> Mail {
        let others: Vec<User> = everyone
            .iter()
            .filter(|user| user.username != sender.username)
            .cloned()
            .collect();
        Mail {
            subject: self.subject(subject.to_string()),
            body: body.to_string(),
            to: vec![sender.email.clone()],
            cc: sender.addresses(),
            bcc: collect_addresses(&others),
        }
    }
}

fn collect_addresses(users: &[User]) -> Vec<String> {
    let mut addresses: Vec<String> = Vec::new();
    for address in users.iter().flat_map(User::addresses) {
        if !addresses.contains(&address) {
            addresses.push(address);
        }
    }
    addresses
}

fn format_time(time: Option<DateTime<Utc>>) -> String {
    time.map(|t| t.format("%Y-%m-%d %H:%M UTC").to_string())
        .unwrap_or_else(|| "unknown".to_string())
}
