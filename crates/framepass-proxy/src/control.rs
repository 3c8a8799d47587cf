//! Advisory messages exchanged with the embedding surface.
//!
//! Neither message affects correctness of the pipeline: `loading-page`
//! pre-warms the guest token and records the mobile preference,
//! `page-loaded` is echoed back for UI feedback.

use serde::{Deserialize, Serialize};

/// Message sent by the embedding surface.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ControlMessage {
    /// A page load is starting.
    LoadingPage {
        url: String,
        #[serde(rename = "isMobile", default)]
        is_mobile: bool,
    },
    /// A page load finished or failed.
    PageLoaded {
        url: String,
        #[serde(default)]
        success: bool,
        #[serde(default)]
        error: Option<String>,
        #[serde(rename = "isMobile", default)]
        is_mobile: bool,
    },
}

impl ControlMessage {
    pub fn url(&self) -> &str {
        match self {
            ControlMessage::LoadingPage { url, .. } | ControlMessage::PageLoaded { url, .. } => url,
        }
    }

    pub fn is_mobile(&self) -> bool {
        match self {
            ControlMessage::LoadingPage { is_mobile, .. }
            | ControlMessage::PageLoaded { is_mobile, .. } => *is_mobile,
        }
    }
}

/// Reply sent back to the embedding surface.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ControlReply {
    /// Informs the surface how a host will be handled.
    XHandlingInfo { message: String },
    /// Echo of a `page-loaded` report.
    PageLoadStatus {
        success: bool,
        url: String,
        error: Option<String>,
        #[serde(rename = "isMobile")]
        is_mobile: bool,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_loading_page() {
        let msg: ControlMessage = serde_json::from_value(json!({
            "type": "loading-page",
            "url": "https://x.com/",
            "isMobile": true
        }))
        .unwrap();

        assert_eq!(msg.url(), "https://x.com/");
        assert!(msg.is_mobile());
    }

    #[test]
    fn page_loaded_defaults() {
        let msg: ControlMessage = serde_json::from_value(json!({
            "type": "page-loaded",
            "url": "https://example.com/"
        }))
        .unwrap();

        assert_eq!(
            msg,
            ControlMessage::PageLoaded {
                url: "https://example.com/".into(),
                success: false,
                error: None,
                is_mobile: false,
            }
        );
    }

    #[test]
    fn unknown_type_is_rejected() {
        let parsed = serde_json::from_value::<ControlMessage>(json!({"type": "reload", "url": "x"}));
        assert!(parsed.is_err());
    }

    #[test]
    fn replies_use_surface_field_names() {
        let reply = ControlReply::PageLoadStatus {
            success: true,
            url: "https://example.com/".into(),
            error: None,
            is_mobile: true,
        };
        assert_eq!(
            serde_json::to_value(&reply).unwrap(),
            json!({
                "type": "page-load-status",
                "success": true,
                "url": "https://example.com/",
                "error": null,
                "isMobile": true
            })
        );

        let info = ControlReply::XHandlingInfo { message: "m".into() };
        assert_eq!(serde_json::to_value(&info).unwrap()["type"], "x-handling-info");
    }
}
