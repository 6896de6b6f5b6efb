//! Tone, urgency and safety signals

use crate::actor::Actor;
use crate::config::RoutingSection;
use crate::error::StageError;
use crate::protocol::{keys, Enrichment, Message, Stage};
use async_trait::async_trait;

const NEGATIVE_TERMS: [&str; 14] = [
    "angry",
    "terrible",
    "awful",
    "worst",
    "hate",
    "unacceptable",
    "ridiculous",
    "frustrated",
    "disappointed",
    "broken",
    "scam",
    "useless",
    "never again",
    "still waiting",
];

const POSITIVE_TERMS: [&str; 8] = [
    "thanks",
    "thank you",
    "great",
    "love",
    "awesome",
    "appreciate",
    "happy",
    "excellent",
];

const URGENT_TERMS: [&str; 6] = [
    "urgent",
    "asap",
    "immediately",
    "right now",
    "emergency",
    "right away",
];

const HUMAN_REQUEST_TERMS: [&str; 7] = [
    "speak to a human",
    "talk to a human",
    "real person",
    "human agent",
    "speak to a manager",
    "supervisor",
    "representative",
];

/// Share of uppercase letters above which a message reads as shouting
const SHOUTING_RATIO: f64 = 0.6;
const SHOUTING_MIN_LETTERS: usize = 8;

#[derive(Debug, Clone, PartialEq)]
pub struct SentimentSignals {
    pub label: &'static str,
    pub score: f64,
    pub urgent: bool,
    pub safety_flag: bool,
    pub escalation_required: bool,
}

pub struct SentimentActor {
    safety_keywords: Vec<String>,
}

impl SentimentActor {
    pub fn new(safety_keywords: Vec<String>) -> Self {
        Self {
            safety_keywords: safety_keywords
                .into_iter()
                .map(|keyword| keyword.to_lowercase())
                .collect(),
        }
    }

    pub fn from_config(section: &RoutingSection) -> Self {
        Self::new(section.safety_keywords.clone())
    }

    /// Score a customer message (pure function)
    pub fn analyze(&self, text: &str) -> SentimentSignals {
        let lower = text.to_lowercase();
        let count = |terms: &[&str]| terms.iter().filter(|term| lower.contains(*term)).count();

        let negative = count(&NEGATIVE_TERMS);
        let positive = count(&POSITIVE_TERMS);
        let score = if negative + positive == 0 {
            0.0
        } else {
            (positive as f64 - negative as f64) / (positive + negative) as f64
        };
        let label = if score < 0.0 {
            "negative"
        } else if score > 0.0 {
            "positive"
        } else {
            "neutral"
        };

        let urgent = count(&URGENT_TERMS) > 0 || text.contains("!!") || is_shouting(text);

        SentimentSignals {
            label,
            score,
            urgent,
            safety_flag: self
                .safety_keywords
                .iter()
                .any(|keyword| lower.contains(keyword.as_str())),
            escalation_required: count(&HUMAN_REQUEST_TERMS) > 0,
        }
    }
}

fn is_shouting(text: &str) -> bool {
    let letters: Vec<char> = text.chars().filter(|c| c.is_alphabetic()).collect();
    if letters.len() < SHOUTING_MIN_LETTERS {
        return false;
    }
    let upper = letters.iter().filter(|c| c.is_uppercase()).count();
    upper as f64 / letters.len() as f64 > SHOUTING_RATIO
}

#[async_trait]
impl Actor for SentimentActor {
    fn stage(&self) -> Stage {
        Stage::Sentiment
    }

    async fn process(&self, message: &Message) -> Result<Enrichment, StageError> {
        let signals = self.analyze(message.payload.text());
        Ok(Enrichment::new()
            .with(keys::SENTIMENT, signals.label)
            .with(keys::SENTIMENT_SCORE, signals.score)
            .with(keys::URGENT, signals.urgent)
            .with(keys::SAFETY_FLAG, signals.safety_flag)
            .with(keys::ESCALATION_REQUIRED, signals.escalation_required))
    }
}
