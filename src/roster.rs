//! Friend roster with suspicion flags

use crate::api::{ChatBackend, DetectedIdentity};
use crate::credential::Credential;
use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use tracing::{debug, warn};

/// A roster entry. `is_suspicious` is a snapshot taken at compose time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Friend {
    pub username: String,
    #[serde(rename = "isSuspicious")]
    pub is_suspicious: bool,
}

/// Flag every friend that appears among the detected identities.
///
/// Output order follows `friends`.
pub fn compose(friends: &[String], detected: &[DetectedIdentity]) -> Vec<Friend> {
    let flagged: HashSet<&str> = detected.iter().map(|d| d.username.as_str()).collect();

    friends
        .iter()
        .map(|username| Friend {
            username: username.clone(),
            is_suspicious: flagged.contains(username.as_str()),
        })
        .collect()
}

/// Load friends and detections, then compose.
///
/// A failed detection fetch degrades to nobody flagged.
pub async fn fetch_roster(
    backend: &dyn ChatBackend,
    credential: &Credential,
    user_id: &str,
) -> Result<Vec<Friend>> {
    let friends = backend.fetch_friends(credential, user_id).await?;

    let detected = match backend.fetch_detected_identities(credential).await {
        Ok(detected) => detected,
        Err(e) => {
            warn!("Could not load detections, showing roster unflagged: {}", e);
            Vec::new()
        }
    };

    let roster = compose(&friends, &detected);
    debug!(
        "Roster: {} friends, {} flagged",
        roster.len(),
        roster.iter().filter(|f| f.is_suspicious).count()
    );
    Ok(roster)
}
