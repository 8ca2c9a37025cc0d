//! Fused spam classification for mail items: provider labels, sender-domain
//! patterns, content keywords, and an optional LLM pass. Rules are a floor —
//! the LLM can only raise the score, and a hard rule match flags the item
//! regardless of what the LLM said.

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::retry::{with_retries, RetryPolicy};
use crate::traits::{ChatMessage, Chatter, ResponseFormat};

#[derive(Debug, Clone, PartialEq)]
pub struct SpamVerdict {
    pub is_spam: bool,
    pub reason: Option<String>,
    pub score: f64,
}

#[derive(Debug, Clone)]
struct RuleVerdict {
    score: f64,
    reasons: Vec<String>,
    /// Provider-label evidence strong enough to flag on its own.
    hard_match: bool,
}

static PROMO_DOMAIN_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    [
        r"^mail\.",
        r"^e-?mail[-.]",
        r"^no-?reply\.",
        r"^marketing\.",
        r"^newsletter\.",
        r"^promo(tions)?\.",
        r"^offers\.",
        r"^deals\.",
        r"^notifications\.",
        r"^updates\.",
        r"^alerts\.",
        r"^info\d*[-.]",
        r"^store[-.]",
        r"^shop\.",
        r"^sales\.",
        r"^news\.",
    ]
    .iter()
    .map(|p| Regex::new(p).unwrap())
    .collect()
});

static PROMO_LOCAL_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    [r"^store-", r"^news-", r"^email-", r"^info\d+", r"^marketing", r"^promo", r"^sales", r"^shop"]
        .iter()
        .map(|p| Regex::new(p).unwrap())
        .collect()
});

const PROMO_KEYWORDS: &[&str] = &[
    "unsubscribe",
    "opt-out",
    "opt out",
    "manage preferences",
    "view in browser",
    "special offer",
    "limited time",
    "limited-time",
    "act now",
    "activate your",
    "activate now",
    "click here",
    "shop now",
    "buy now",
    "discount",
    "coupon",
    "promo code",
    "newsletter",
    "% off",
    "percent off",
    "exclusive offer",
    "last chance",
    "lifetime membership",
    "statement credits",
    "earn back",
];

/// Domain part of a sender like `Name <store-news@shop.example>`.
pub fn sender_domain(sender: &str) -> Option<&str> {
    let email = sender_email(sender)?;
    email.split('@').nth(1)
}

fn sender_email(sender: &str) -> Option<&str> {
    let email = match (sender.find('<'), sender.find('>')) {
        (Some(open), Some(close)) if close > open => &sender[open + 1..close],
        _ => sender.trim(),
    };
    email.contains('@').then_some(email)
}

fn rule_verdict(sender: &str, subject: &str, body: &str, labels: &[String]) -> RuleVerdict {
    let mut score: f64 = 0.0;
    let mut reasons = Vec::new();
    let mut hard_match = false;

    // Provider labels carry the highest confidence.
    if labels.iter().any(|l| l == "SPAM") {
        score = 1.0;
        hard_match = true;
        reasons.push("provider SPAM label".to_string());
    } else if labels.iter().any(|l| l == "PROMOTIONS" || l == "CATEGORY_PROMOTIONS") {
        score = 0.9;
        hard_match = true;
        reasons.push("provider promotions label".to_string());
    } else if labels.iter().any(|l| l == "CATEGORY_UPDATES") {
        score = 0.3;
        reasons.push("provider updates label".to_string());
    }

    if let Some(domain) = sender_domain(sender) {
        let domain = domain.to_lowercase();
        if PROMO_DOMAIN_PATTERNS.iter().any(|re| re.is_match(&domain)) {
            if score < 0.8 {
                score = 0.8;
            }
            reasons.push(format!("promotional sender domain: {}", domain));
        }
    }

    if let Some(email) = sender_email(sender) {
        if let Some(local) = email.to_lowercase().split('@').next() {
            if PROMO_LOCAL_PATTERNS.iter().any(|re| re.is_match(local)) {
                if score < 0.75 {
                    score = 0.75;
                }
                reasons.push(format!("promotional sender address: {}", email));
            }
        }
    }

    let combined = format!("{} {}", subject.to_lowercase(), body.to_lowercase());
    if PROMO_KEYWORDS.iter().any(|kw| combined.contains(kw)) {
        if score < 0.8 {
            score = 0.8;
        }
        reasons.push("promotional content keywords".to_string());
    }

    RuleVerdict {
        score,
        reasons,
        hard_match,
    }
}

/// Spam classifier combining the rule path with an optional LLM pass.
pub struct SpamClassifier {
    chatter: Option<std::sync::Arc<dyn Chatter>>,
    threshold: f64,
    retry: RetryPolicy,
}

impl SpamClassifier {
    pub fn new(
        chatter: Option<std::sync::Arc<dyn Chatter>>,
        threshold: f64,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            chatter,
            threshold,
            retry,
        }
    }

    /// Rules-only classifier for contexts without an LLM.
    pub fn rules_only(threshold: f64) -> Self {
        Self {
            chatter: None,
            threshold,
            retry: RetryPolicy::default(),
        }
    }

    pub async fn classify(&self, mail: &Value, cancel: &CancellationToken) -> SpamVerdict {
        let sender = mail["sender"].as_str().unwrap_or_default();
        let subject = mail["subject"].as_str().unwrap_or_default();
        let body = mail["body_text"].as_str().unwrap_or_default();
        let labels: Vec<String> = mail["labels"]
            .as_array()
            .map(|a| {
                a.iter()
                    .filter_map(|v| v.as_str().map(|s| s.to_string()))
                    .collect()
            })
            .unwrap_or_default();

        let rules = rule_verdict(sender, subject, body, &labels);
        let mut score = rules.score;
        let mut reasons = rules.reasons.clone();

        // A hard rule already decides; the LLM pass is only worth running
        // for the gray zone below the threshold.
        if !rules.hard_match && score < self.threshold {
            if let Some(chatter) = &self.chatter {
                match self.llm_score(chatter.as_ref(), sender, subject, body, cancel).await {
                    Some((llm_spam, llm_reason, llm_score)) if llm_spam && llm_score > score => {
                        score = llm_score;
                        reasons.push(format!("llm: {}", llm_reason));
                    }
                    Some(_) => {}
                    None => {
                        debug!("spam LLM pass unavailable, using rules-only score");
                    }
                }
            }
        }

        let is_spam = rules.hard_match || score >= self.threshold;
        SpamVerdict {
            is_spam,
            reason: (!reasons.is_empty()).then(|| reasons.join("; ")),
            score,
        }
    }

    async fn llm_score(
        &self,
        chatter: &dyn Chatter,
        sender: &str,
        subject: &str,
        body: &str,
        cancel: &CancellationToken,
    ) -> Option<(bool, String, f64)> {
        let messages = vec![
            ChatMessage::system(
                "You classify emails as promotional/spam or legitimate personal/work mail. \
                 Respond with a JSON object: \
                 {\"is_spam\": bool, \"reason\": string, \"score\": number between 0 and 1}.",
            ),
            ChatMessage::user(format!(
                "From: {}\nSubject: {}\nBody:\n{}",
                sender,
                subject,
                crate::utils::truncate_str(body, 2000)
            )),
        ];

        let result = with_retries(self.retry, cancel, "spam_llm", || {
            chatter.chat(&messages, ResponseFormat::JsonObject, cancel)
        })
        .await;

        let text = match result {
            Ok(text) => text,
            Err(err) => {
                warn!("spam LLM call failed, falling back to rules: {}", err);
                return None;
            }
        };

        let parsed: Value = serde_json::from_str(&text).ok()?;
        let is_spam = parsed["is_spam"].as_bool()?;
        let reason = parsed["reason"].as_str().unwrap_or("llm verdict").to_string();
        let score = parsed["score"].as_f64()?.clamp(0.0, 1.0);
        Some((is_spam, reason, score))
    }
}
