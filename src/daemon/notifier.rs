use notify_rust::{Hint, Notification, Timeout};

use crate::config::Locale;
use crate::domain::email::TrackedMessage;

const ICON: &str = "mail-read";

/// Desktop notification for a message that was just found opened.
pub struct Notifier {
    locale: Locale,
}

impl Notifier {
    pub fn new(locale: Locale) -> Self {
        Self { locale }
    }

    pub fn summary(&self, msg: &TrackedMessage) -> String {
        match self.locale {
            Locale::En => format!("Email opened: {}", msg.subject),
            Locale::Fr => format!("E-mail ouvert : {}", msg.subject),
        }
    }

    pub fn body(&self, msg: &TrackedMessage) -> String {
        match (self.locale, msg.has_known_recipient()) {
            (Locale::En, true) => format!("{} opened your message", msg.recipient),
            (Locale::En, false) => "Your message was opened".to_string(),
            (Locale::Fr, true) => format!("{} a ouvert votre message", msg.recipient),
            (Locale::Fr, false) => "Votre message a été ouvert".to_string(),
        }
    }

    pub fn notify_opened(&self, msg: &TrackedMessage) {
        let mut n = Notification::new();
        n.appname("mail_beacon")
            .summary(&self.summary(msg))
            .body(&self.body(msg))
            .icon(ICON)
            .hint(Hint::Category("email".to_string()))
            .timeout(Timeout::Milliseconds(6000));

        // A missing notification server is not worth failing the poll for.
        if let Err(e) = n.show() {
            log::warn!("notification for {} not shown: {e}", msg.id);
        }
    }
}
