//! Fire-and-forget dashboard client.
//!
//! Every motion, classification, recognition, and clip event is mirrored
//! to a remote dashboard over HTTP. Nothing here is load-bearing: non-2xx
//! responses and transport errors are logged and dropped, never retried
//! and never propagated into the pipeline. With no URL configured the
//! client is a no-op.

use std::path::Path;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use chrono::Local;
use serde_json::json;

pub struct DashboardClient {
    base_url: Option<String>,
    agent: ureq::Agent,
}

impl DashboardClient {
    pub fn new(base_url: Option<String>) -> Self {
        let agent = ureq::AgentBuilder::new()
            .timeout(Duration::from_secs(5))
            .build();
        Self {
            base_url: base_url.map(|url| url.trim_end_matches('/').to_string()),
            agent,
        }
    }

    pub fn disabled() -> Self {
        Self::new(None)
    }

    pub fn is_enabled(&self) -> bool {
        self.base_url.is_some()
    }

    /// Push a structured log event. Runs on a short-lived thread so the
    /// frame-serving path never waits on the network.
    pub fn send_log(&self, event_type: &str, description: &str, extra: Option<serde_json::Value>) {
        let Some(base) = &self.base_url else { return };
        let url = format!("{}/log_event/", base);
        let payload = log_payload(event_type, description, extra);
        let agent = self.agent.clone();

        std::thread::spawn(move || {
            if let Err(e) = agent.post(&url).send_json(payload) {
                log::warn!("failed to send dashboard log: {}", e);
            }
        });
    }

    /// Push a JPEG snapshot, fire-and-forget.
    pub fn send_image(&self, jpeg: Vec<u8>, description: &str) {
        let Some(base) = &self.base_url else { return };
        let url = format!("{}/upload_image/", base);
        let payload = json!({
            "timestamp": crate::log_stamp(Local::now()),
            "description": description,
            "image": BASE64.encode(&jpeg),
        });
        let agent = self.agent.clone();

        std::thread::spawn(move || {
            if let Err(e) = agent.post(&url).send_json(payload) {
                log::warn!("failed to send dashboard image: {}", e);
            }
        });
    }

    /// Upload a finished clip. Called from the clip thread, so the send is
    /// synchronous; failures are logged and dropped like every other push.
    pub fn send_video(&self, path: &Path, description: &str, thumbnail: Option<&Path>) {
        let Some(base) = &self.base_url else { return };
        let url = format!("{}/upload_video/", base);

        let file = match std::fs::File::open(path) {
            Ok(file) => file,
            Err(e) => {
                log::warn!("dashboard video {} unreadable: {}", path.display(), e);
                return;
            }
        };

        let mut request = self
            .agent
            .post(&url)
            .query("timestamp", &crate::log_stamp(Local::now()))
            .query("description", description)
            .set("Content-Type", "video/mp4");
        if let Some(thumbnail) = thumbnail {
            request = request.query("thumbnail", &thumbnail.to_string_lossy());
        }

        match request.send(file) {
            Ok(_) => log::debug!("dashboard video {} uploaded", path.display()),
            Err(e) => log::warn!("failed to send dashboard video: {}", e),
        }
    }
}

fn log_payload(
    event_type: &str,
    description: &str,
    extra: Option<serde_json::Value>,
) -> serde_json::Value {
    let mut payload = json!({
        "timestamp": crate::log_stamp(Local::now()),
        "event_type": event_type,
        "description": description,
    });
    if let Some(extra) = extra {
        payload["extra_data"] = extra;
    }
    payload
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disabled_client_swallows_everything() {
        let client = DashboardClient::disabled();
        assert!(!client.is_enabled());
        client.send_log("motion", "movement detected", None);
        client.send_image(vec![0xFF, 0xD8], "snapshot");
        client.send_video(Path::new("/nonexistent/clip.mp4"), "clip", None);
    }

    #[test]
    fn log_payload_carries_the_event_shape() {
        let payload = log_payload("recognition", "alice seen", Some(json!({"distance": 0.4})));
        assert_eq!(payload["event_type"], "recognition");
        assert_eq!(payload["description"], "alice seen");
        assert_eq!(payload["extra_data"]["distance"], 0.4);
        assert!(payload["timestamp"].as_str().unwrap().len() >= 19);
    }

    #[test]
    fn trailing_slashes_are_normalized() {
        let client = DashboardClient::new(Some("http://dash.local/api/".to_string()));
        assert!(client.is_enabled());
        assert_eq!(client.base_url.as_deref(), Some("http://dash.local/api"));
    }
}
