//! Field extraction for compose surfaces. Each field has an ordered list of
//! strategies; the first one that yields something wins. Host markup changes
//! between versions and locales, so no single selector is trusted.

use anyhow::Result;

use crate::domain::email::{NO_SUBJECT, UNKNOWN_RECIPIENT};
use crate::dom::{Element, Selector};
use crate::text::normalize_line;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Read {
    /// The live value of a form control.
    Value,
    /// The first of these attributes that is present and non-empty.
    Attr(Vec<&'static str>),
}

/// Locate the first element matching `selector` and read text from it.
#[derive(Debug, Clone)]
pub struct TextStrategy {
    pub selector: Selector,
    pub read: Read,
}

impl TextStrategy {
    pub fn value(selector: &str) -> Result<Self> {
        Ok(Self {
            selector: Selector::parse(selector)?,
            read: Read::Value,
        })
    }

    pub fn attr(selector: &str, names: &[&'static str]) -> Result<Self> {
        Ok(Self {
            selector: Selector::parse(selector)?,
            read: Read::Attr(names.to_vec()),
        })
    }

    pub fn extract(&self, scope: &Element) -> Option<String> {
        let el = scope.select(&self.selector)?;
        let raw = match &self.read {
            Read::Value => el.value(),
            Read::Attr(names) => names
                .iter()
                .filter_map(|n| el.attr(n))
                .find(|v| !v.trim().is_empty()),
        };
        raw.map(|s| s.trim().to_string()).filter(|s| !s.is_empty())
    }
}

pub fn first_text(scope: &Element, strategies: &[TextStrategy]) -> Option<String> {
    strategies.iter().find_map(|s| s.extract(scope))
}

pub fn first_element(scope: &Element, selectors: &[Selector]) -> Option<Element> {
    selectors.iter().find_map(|s| scope.select(s))
}

#[derive(Debug, Clone)]
pub struct ExtractionPolicy {
    pub surface: Selector,
    pub recipient: Vec<TextStrategy>,
    pub subject: Vec<TextStrategy>,
    pub body: Vec<Selector>,
    pub send: Vec<Selector>,
}

fn selectors(list: &[&str]) -> Result<Vec<Selector>> {
    list.iter().map(|s| Selector::parse(s)).collect()
}

impl ExtractionPolicy {
    /// Gmail markup, English and French UI.
    pub fn gmail() -> Result<Self> {
        Ok(Self {
            surface: Selector::parse(r#"[role="dialog"]"#)?,
            recipient: vec![
                TextStrategy::attr(r#"[name="to"] [email]"#, &["email"])?,
                TextStrategy::attr("span[email]", &["email"])?,
                TextStrategy::attr("[email]", &["email", "data-hovercard-id"])?,
                TextStrategy::value(r#"input[type="email"]"#)?,
                TextStrategy::value(r#"textarea[name="to"]"#)?,
                TextStrategy::value(r#"[aria-label*="To"]"#)?,
                TextStrategy::value(r#"[aria-label*="À"]"#)?,
            ],
            subject: vec![
                TextStrategy::value(r#"input[name="subjectbox"]"#)?,
                TextStrategy::value(r#"input[aria-label*="Subject"]"#)?,
                TextStrategy::value(r#"input[aria-label*="Objet"]"#)?,
            ],
            body: selectors(&[
                r#"[role="textbox"][g_editable="true"]"#,
                r#"[aria-label*="Message Body"]"#,
                r#"[aria-label*="Corps du message"]"#,
                r#"div[contenteditable="true"]"#,
            ])?,
            send: selectors(&[
                r#"div[role="button"][aria-label*="Envoyer"]"#,
                r#"div[role="button"][data-tooltip*="Envoyer"]"#,
                r#"div[role="button"][aria-label*="Send"]"#,
                r#"div[role="button"][data-tooltip*="Send"]"#,
                ".T-I.J-J5-Ji.aoO",
                "button[jsname]",
            ])?,
        })
    }

    pub fn recipient(&self, surface: &Element) -> String {
        first_text(surface, &self.recipient).unwrap_or_else(|| {
            log::debug!("no recipient strategy matched");
            UNKNOWN_RECIPIENT.to_string()
        })
    }

    pub fn subject(&self, surface: &Element) -> String {
        first_text(surface, &self.subject)
            .map(|s| normalize_line(&s))
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| {
                log::debug!("no subject strategy matched");
                NO_SUBJECT.to_string()
            })
    }

    pub fn body(&self, surface: &Element) -> Option<Element> {
        first_element(surface, &self.body)
    }

    pub fn send_button(&self, surface: &Element) -> Option<Element> {
        first_element(surface, &self.send)
    }
}
