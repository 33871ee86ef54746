use async_trait::async_trait;
use log::warn;
use serde_json::json;

use crate::common::models::Suggestion;

pub const ICEBREAKER_FALLBACK: &str = "What's everyone working on today? 🚀";

/// Conversational agent behind keyword expansion, community proposals and
/// icebreakers. Implementations must degrade, not fail: every method has a
/// documented fallback and the default trait methods encode them.
#[async_trait]
pub trait ConversationAgent: Send + Sync {
    /// Expand a raw query into related search keywords. Fallback: the raw
    /// query, lowercased, as the sole keyword.
    async fn expand_keywords(&self, query: &str, user_id: &str) -> Vec<String>;

    /// Propose `{name, tags, description}` for a query with no good match.
    async fn community_proposal(&self, query: &str, keywords: &[String]) -> Suggestion;

    /// One conversation starter for a room, seeded with the community's tags.
    async fn icebreaker(&self, tags: &[String]) -> String;
}

/// Deterministic proposal used whenever the agent call fails or is not
/// configured.
pub fn fallback_suggestion(query: &str, keywords: &[String]) -> Suggestion {
    Suggestion {
        name: query.to_string(),
        tags: keywords.to_vec(),
        description: format!("A community for {}", query),
    }
}

/// Lyzr inference agent client. All three calls share the same endpoint; the
/// session id namespaces them so agent-side history stays separated.
pub struct LyzrAgent {
    http: reqwest::Client,
    api_key: Option<String>,
    agent_id: Option<String>,
    base_url: String,
}

impl LyzrAgent {
    pub fn from_env() -> Self {
        let api_key = std::env::var("LYZR_API_KEY").ok().filter(|v| !v.is_empty());
        let agent_id = std::env::var("LYZR_AGENT_ID").ok().filter(|v| !v.is_empty());
        if api_key.is_none() || agent_id.is_none() {
            warn!("[AGENT] Lyzr credentials not configured; agent calls will use fallbacks");
        }
        Self {
            http: reqwest::Client::new(),
            api_key,
            agent_id,
            base_url: "https://agent-prod.studio.lyzr.ai/v3/inference/chat/".to_string(),
        }
    }

    async fn chat(&self, session_suffix: &str, user_id: &str, message: String) -> Option<String> {
        let api_key = self.api_key.as_ref()?;
        let agent_id = self.agent_id.as_ref()?;

        let resp = self
            .http
            .post(&self.base_url)
            .header("x-api-key", api_key)
            .json(&json!({
                "user_id": user_id,
                "agent_id": agent_id,
                "session_id": format!("{}-{}", agent_id, session_suffix),
                "message": message,
            }))
            .timeout(std::time::Duration::from_secs(10))
            .send()
            .await
            .ok()?;

        let body: serde_json::Value = resp.json().await.ok()?;
        body.get("response")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string())
    }
}

/// Pull the first {...} block out of a free-text agent reply and parse it.
fn extract_json_suggestion(reply: &str) -> Option<Suggestion> {
    let start = reply.find('{')?;
    let end = reply.rfind('}')?;
    if end <= start {
        return None;
    }
    serde_json::from_str(&reply[start..=end]).ok()
}

#[async_trait]
impl ConversationAgent for LyzrAgent {
    async fn expand_keywords(&self, query: &str, user_id: &str) -> Vec<String> {
        let reply = self
            .chat("keywords", user_id, format!("Generate keywords for: {}", query))
            .await;

        match reply {
            Some(text) => {
                let keywords: Vec<String> = text
                    .split(',')
                    .map(|k| k.trim().to_lowercase())
                    .filter(|k| !k.is_empty())
                    .collect();
                if keywords.is_empty() {
                    vec![query.to_lowercase()]
                } else {
                    keywords
                }
            }
            None => {
                warn!("[AGENT] Keyword expansion failed for '{}', using raw query", query);
                vec![query.to_lowercase()]
            }
        }
    }

    async fn community_proposal(&self, query: &str, keywords: &[String]) -> Suggestion {
        let message = format!(
            "Generate a community for: \"{}\". Return JSON with: name, tags (array), description.",
            query
        );
        let reply = self.chat("suggest", "system", message).await;

        reply
            .as_deref()
            .and_then(extract_json_suggestion)
            .unwrap_or_else(|| {
                warn!("[AGENT] Community proposal failed for '{}', using fallback", query);
                fallback_suggestion(query, keywords)
            })
    }

    async fn icebreaker(&self, tags: &[String]) -> String {
        let message = format!(
            "Generate an icebreaker for community with tags: {}",
            tags.join(", ")
        );
        match self.chat("icebreaker", "system", message).await {
            Some(text) if !text.trim().is_empty() => text,
            _ => {
                warn!("[AGENT] Icebreaker generation failed, using static fallback");
                ICEBREAKER_FALLBACK.to_string()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fallback_suggestion_is_deterministic() {
        let kw = vec!["chess".to_string(), "openings".to_string()];
        let a = fallback_suggestion("chess club", &kw);
        let b = fallback_suggestion("chess club", &kw);
        assert_eq!(a.name, b.name);
        assert_eq!(a.name, "chess club");
        assert_eq!(a.tags, kw);
        assert_eq!(a.description, "A community for chess club");
    }

    #[test]
    fn extracts_suggestion_json_from_chatty_reply() {
        let reply = r#"Sure! Here you go:
            {"name": "Night Owls", "tags": ["study", "late"], "description": "Late night study crew"}
            Hope that helps."#;
        let s = extract_json_suggestion(reply).expect("should parse");
        assert_eq!(s.name, "Night Owls");
        assert_eq!(s.tags, vec!["study", "late"]);
    }

    #[test]
    fn malformed_reply_yields_none() {
        assert!(extract_json_suggestion("no json here").is_none());
        assert!(extract_json_suggestion("{broken").is_none());
    }
}
