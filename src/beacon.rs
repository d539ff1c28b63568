use anyhow::{Context, Result};
use url::Url;

use crate::dom::{Document, Element};

/// Zero-size image reference whose fetch tells the remote authority that a
/// message was opened.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Beacon {
    url: Url,
}

/// `{base}/track/open?id={id}`. Pure in `(base, id)`.
pub fn build_beacon(base: &str, id: &str) -> Result<Beacon> {
    let mut url = Url::parse(&format!("{}/track/open", base.trim_end_matches('/')))
        .with_context(|| format!("invalid tracking endpoint '{base}'"))?;
    url.query_pairs_mut().clear().append_pair("id", id);
    Ok(Beacon { url })
}

impl Beacon {
    pub fn url(&self) -> &str {
        self.url.as_str()
    }

    pub fn markup(&self) -> String {
        format!(
            r#"<img src="{}" width="1" height="1" style="display:none;" alt="">"#,
            self.url
        )
    }

    pub fn to_element(&self, doc: &Document) -> Element {
        doc.create_element("img")
            .with_attr("src", self.url.as_str())
            .with_attr("width", "1")
            .with_attr("height", "1")
            .with_attr("style", "display:none;")
            .with_attr("alt", "")
    }
}
