use lettre::message::header::ContentType;
use lettre::message::{Attachment, Mailbox, MultiPart, SinglePart};
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use rand::Rng;
use tracing::info;

use crate::config::MailConfig;
use crate::error::{Error, Result};
use crate::models::{Attendee, Event};

/// Implicit-TLS submission port; anything else negotiates STARTTLS.
const SMTPS_PORT: u16 = 465;

/// SMTP client for password resets and attendee QR codes.
pub struct Mailer {
    smtp: AsyncSmtpTransport<Tokio1Executor>,
    from: Mailbox,
}

impl std::fmt::Debug for Mailer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Mailer").field("from", &self.from).finish_non_exhaustive()
    }
}

impl Mailer {
    /// Build the transport. No connection is made until the first send.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Mail`] for an unusable host or sender address.
    pub fn new(config: &MailConfig) -> Result<Self> {
        let creds = Credentials::new(config.username.clone(), config.password.clone());

        let builder = if config.port == SMTPS_PORT {
            AsyncSmtpTransport::<Tokio1Executor>::relay(&config.host)
        } else {
            AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&config.host)
        }
        .map_err(mail_error)?;

        let smtp = builder.credentials(creds).port(config.port).build();
        let from = config
            .from
            .parse::<Mailbox>()
            .map_err(|e| Error::Mail(format!("invalid sender address {}: {e}", config.from)))?;

        Ok(Mailer { smtp, from })
    }

    /// # Errors
    ///
    /// Returns [`Error::Mail`] if the message cannot be built or delivered.
    pub async fn send_password_reset(
        &self,
        to_email: &str,
        reset_code: &str,
        valid_minutes: u64,
    ) -> Result<()> {
        let email = self.reset_message(to_email, reset_code, valid_minutes)?;
        self.smtp.send(email).await.map_err(mail_error)?;
        info!(to = to_email, "Sent password reset code");
        Ok(())
    }

    /// Mail an attendee their QR code as a PNG attachment.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Mail`] if the message cannot be built or delivered.
    pub async fn send_attendee_qr(
        &self,
        to_email: &str,
        attendee: &Attendee,
        event: &Event,
        png: Vec<u8>,
    ) -> Result<()> {
        let email = self.qr_message(to_email, attendee, event, png)?;
        self.smtp.send(email).await.map_err(mail_error)?;
        info!(
            to = to_email,
            attendee_id = attendee.id,
            event_id = event.id,
            "Sent QR code"
        );
        Ok(())
    }

    fn reset_message(&self, to_email: &str, reset_code: &str, valid_minutes: u64) -> Result<Message> {
        Message::builder()
            .from(self.from.clone())
            .to(recipient(to_email)?)
            .subject("Mã đặt lại mật khẩu / Password reset code")
            .header(ContentType::TEXT_PLAIN)
            .body(format!(
                "Mã đặt lại mật khẩu của bạn là: {reset_code}\n\
                 Mã có hiệu lực trong {valid_minutes} phút.\n\n\
                 Your password reset code is: {reset_code}\n\
                 This code will expire in {valid_minutes} minutes."
            ))
            .map_err(mail_error)
    }

    fn qr_message(
        &self,
        to_email: &str,
        attendee: &Attendee,
        event: &Event,
        png: Vec<u8>,
    ) -> Result<Message> {
        let when = match &event.start_time {
            Some(start) => format!("{} {start}", event.event_date),
            None => event.event_date.to_string(),
        };
        let place = event.location.as_deref().unwrap_or("-");
        let body = format!(
            "Xin chào {name},\n\n\
             Đây là mã QR điểm danh của bạn cho sự kiện \"{event}\".\n\
             Thời gian: {when}\nĐịa điểm: {place}\n\
             Vui lòng xuất trình mã này khi check-in. Mã dự phòng: {code}\n\n\
             Hello {name},\n\n\
             Attached is your attendance QR code for \"{event}\".\n\
             Time: {when}\nLocation: {place}\n\
             Show it at the door when checking in. Backup code: {code}\n",
            name = attendee.full_name,
            event = event.name,
            code = attendee.qr_code,
        );

        let png_type = ContentType::parse("image/png").map_err(mail_error)?;
        let attachment = Attachment::new(format!("qr-{}.png", attendee.student_id)).body(png, png_type);

        Message::builder()
            .from(self.from.clone())
            .to(recipient(to_email)?)
            .subject(format!("Mã QR điểm danh / Attendance QR code: {}", event.name))
            .multipart(
                MultiPart::mixed()
                    .singlepart(SinglePart::plain(body))
                    .singlepart(attachment),
            )
            .map_err(mail_error)
    }
}

fn recipient(address: &str) -> Result<Mailbox> {
    address
        .trim()
        .parse()
        .map_err(|e| Error::Mail(format!("invalid recipient {address}: {e}")))
}

fn mail_error(err: impl std::fmt::Display) -> Error {
    Error::Mail(err.to_string())
}

/// Eight characters from an unambiguous alphabet.
#[must_use]
pub fn generate_reset_code() -> String {
    const CHARSET: &[u8] = b"ABCDEFGHJKMNPQRSTUVWXYZ23456789";
    let mut rng = rand::thread_rng();

    (0..8)
        .map(|_| {
            let idx = rng.gen_range(0..CHARSET.len());
            CHARSET[idx] as char
        })
        .collect()
}
