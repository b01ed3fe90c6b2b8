//! Topic naming and insight generation.
//!
//! [`Labeler`] makes two independent calls to a [`TextGenerator`] per
//! topic, each carrying up to five representative fragments (1500 chars
//! each) and asking for a JSON object:
//!
//! - naming: `{name, summary, keywords}`
//! - insights: `{summary, themes, questions, related_concepts}`
//!
//! Responses are deserialized into fixed schemas, then trimmed (name to
//! 255 chars, summaries to 600 chars, lists to 5 non-empty items). A
//! provider error or a response that does not fit the schema yields the
//! deterministic fallback record instead; neither call ever fails.

use serde::Deserialize;
use tracing::{debug, warn};

use crate::embedding::truncate_chars;
use crate::generation::{GenerationRequest, TextGenerator};
use crate::models::TopicInsight;

pub const MAX_NAME_CHARS: usize = 255;
pub const MAX_SUMMARY_CHARS: usize = 600;
pub const MAX_LIST_ITEMS: usize = 5;

const PROMPT_FRAGMENTS: usize = 5;
const PROMPT_FRAGMENT_CHARS: usize = 1500;
const FALLBACK_SOURCE_CHARS: usize = 200;
const FALLBACK_NAME_WORDS: usize = 3;

const NAMING_SYSTEM: &str = "You are assigning a name to a topic derived from clustering text \
documents. Analyze the representative text samples and return a concise, descriptive topic name.";

const INSIGHT_SYSTEM: &str = "You are a helpful research assistant. Generate insights about \
topics derived from document clustering.";

/// Name, one-sentence summary and keywords for one topic.
#[derive(Debug, Clone, PartialEq)]
pub struct TopicLabel {
    pub name: String,
    pub summary: String,
    pub keywords: Vec<String>,
}

// Every field is optional and may be `null`; list fields default to empty.
#[derive(Debug, Deserialize)]
struct LabelResponse {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    summary: Option<String>,
    #[serde(default)]
    keywords: Option<Vec<String>>,
}

#[derive(Debug, Deserialize)]
struct InsightResponse {
    #[serde(default)]
    summary: Option<String>,
    #[serde(default)]
    themes: Option<Vec<String>>,
    #[serde(default)]
    questions: Option<Vec<String>>,
    #[serde(default)]
    related_concepts: Option<Vec<String>>,
}

pub struct Labeler<'a> {
    generator: &'a dyn TextGenerator,
    temperature: f32,
}

impl<'a> Labeler<'a> {
    pub fn new(generator: &'a dyn TextGenerator, temperature: f32) -> Self {
        Self {
            generator,
            temperature,
        }
    }

    /// Name a topic from its representative fragments.
    ///
    /// `ordinal` numbers the topic within its run and only shows up in the
    /// fallback name when the representatives contain no words at all.
    pub async fn label_topic(&self, representatives: &[&str], ordinal: usize) -> TopicLabel {
        let fallback = fallback_label(representatives, ordinal);
        if !self.generator.is_enabled() {
            return fallback;
        }

        let request = GenerationRequest {
            system: NAMING_SYSTEM.to_string(),
            prompt: naming_prompt(representatives),
            temperature: self.temperature,
            json: true,
        };

        let parsed = match self.generator.generate(&request).await {
            Ok(text) => parse_json::<LabelResponse>(&text),
            Err(e) => Err(e),
        };

        match parsed {
            Ok(response) => {
                let label = TopicLabel {
                    name: clean_text(response.name, MAX_NAME_CHARS).unwrap_or(fallback.name),
                    summary: clean_text(response.summary, MAX_SUMMARY_CHARS)
                        .unwrap_or(fallback.summary),
                    keywords: clean_list(response.keywords),
                };
                debug!(topic = %label.name, "topic named");
                label
            }
            Err(e) => {
                warn!(ordinal, error = %e, "topic naming failed; using fallback label");
                fallback
            }
        }
    }

    /// Extended insights for a named topic.
    pub async fn generate_insights(&self, representatives: &[&str], name: &str) -> TopicInsight {
        let fallback = fallback_insight(name);
        if !self.generator.is_enabled() {
            return fallback;
        }

        let request = GenerationRequest {
            system: INSIGHT_SYSTEM.to_string(),
            prompt: insight_prompt(representatives, name),
            temperature: self.temperature,
            json: true,
        };

        let parsed = match self.generator.generate(&request).await {
            Ok(text) => parse_json::<InsightResponse>(&text),
            Err(e) => Err(e),
        };

        match parsed {
            Ok(response) => TopicInsight {
                summary: clean_text(response.summary, MAX_SUMMARY_CHARS)
                    .unwrap_or(fallback.summary),
                themes: clean_list(response.themes),
                questions: clean_list(response.questions),
                related_concepts: clean_list(response.related_concepts),
            },
            Err(e) => {
                warn!(topic = %name, error = %e, "insight generation failed; using fallback");
                fallback
            }
        }
    }
}

/// Label built from the leading words of the first representative.
pub fn fallback_label(representatives: &[&str], ordinal: usize) -> TopicLabel {
    let head = representatives
        .first()
        .map(|r| truncate_chars(r, FALLBACK_SOURCE_CHARS).trim())
        .unwrap_or("");
    let words: Vec<String> = head
        .split_whitespace()
        .take(FALLBACK_NAME_WORDS)
        .map(str::to_string)
        .collect();

    let name = if words.is_empty() {
        format!("Topic {}", ordinal + 1)
    } else {
        truncate_chars(&words.join(" "), MAX_NAME_CHARS).to_string()
    };
    let summary = if head.is_empty() {
        "No summary available".to_string()
    } else {
        head.to_string()
    };

    TopicLabel {
        name,
        summary,
        keywords: words,
    }
}

pub fn fallback_insight(name: &str) -> TopicInsight {
    TopicInsight {
        summary: format!("This topic covers: {}.", name),
        themes: vec![name.to_string()],
        questions: vec![format!("What is {}?", name)],
        related_concepts: Vec::new(),
    }
}

fn naming_prompt(representatives: &[&str]) -> String {
    let samples = representatives
        .iter()
        .take(PROMPT_FRAGMENTS)
        .enumerate()
        .map(|(i, r)| format!("<SAMPLE_{}>\n{}", i + 1, truncate_chars(r, PROMPT_FRAGMENT_CHARS)))
        .collect::<Vec<_>>()
        .join("\n\n");

    format!(
        r#"Here are representative samples of one topic:

{}

Return concise JSON:
{{
  "name": "2-4 word topic title",
  "summary": "One-sentence description",
  "keywords": ["keyword1", "keyword2", "keyword3"]
}}"#,
        samples
    )
}

fn insight_prompt(representatives: &[&str], name: &str) -> String {
    let samples = representatives
        .iter()
        .take(PROMPT_FRAGMENTS)
        .enumerate()
        .map(|(i, r)| format!("<text{}>\n{}", i + 1, truncate_chars(r, PROMPT_FRAGMENT_CHARS)))
        .collect::<Vec<_>>()
        .join("\n\n");

    format!(
        r#"Generate insights about this topic.

Topic: {}

Representative texts:
{}

Return JSON:
{{
  "summary": "2-3 sentences",
  "themes": ["theme1", "theme2", "theme3"],
  "questions": ["question1", "question2", "question3"],
  "related_concepts": ["concept1", "concept2", "concept3"]
}}"#,
        name, samples
    )
}

/// Parse the JSON object in `text`, tolerating surrounding prose or fences.
fn parse_json<T: serde::de::DeserializeOwned>(text: &str) -> anyhow::Result<T> {
    let start = text.find('{');
    let end = text.rfind('}');
    let body = match (start, end) {
        (Some(s), Some(e)) if s < e => &text[s..=e],
        _ => anyhow::bail!("response contains no JSON object"),
    };
    Ok(serde_json::from_str(body)?)
}

fn clean_text(value: Option<String>, max_chars: usize) -> Option<String> {
    let value = value?;
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return None;
    }
    Some(truncate_chars(trimmed, max_chars).trim_end().to_string())
}

fn clean_list(items: Option<Vec<String>>) -> Vec<String> {
    items
        .unwrap_or_default()
        .into_iter()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .take(MAX_LIST_ITEMS)
        .collect()
}
