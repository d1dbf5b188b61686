use std::time::Duration;

use anyhow::{Context, Result};
use reqwest::Url;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::generator::NoteProposer;
use crate::sequence::describe_notes;
use crate::state::MusicParameters;
use crate::BoxFuture;

pub const DEFAULT_BASE_URL: &str = "http://localhost:11434";
pub const DEFAULT_MODEL: &str = "gemma3:4b";

#[derive(Debug, Serialize)]
struct GenerateRequest<'a> {
    model: &'a str,
    prompt: String,
    stream: bool,
    options: SamplingOptions,
}

#[derive(Debug, Serialize)]
struct SamplingOptions {
    temperature: f32,
    top_p: f32,
    repeat_penalty: f32,
}

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    response: String,
}

/// Note proposer backed by an Ollama server's `/api/generate` endpoint.
#[derive(Clone)]
pub struct OllamaClient {
    http: reqwest::Client,
    base_url: Url,
    model: String,
}

impl OllamaClient {
    pub fn new(base_url: &str, model: &str, timeout: Duration) -> Result<Self> {
        let base_url = Url::parse(base_url).context("invalid Ollama base URL")?;
        let http = reqwest::Client::builder()
            .use_rustls_tls()
            .timeout(timeout)
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self { http, base_url, model: model.to_string() })
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub async fn health_check(&self) -> Result<()> {
        let url = self.base_url.join("api/tags").context("failed to build tags URL")?;
        let response = self.http.get(url).send().await.context("Ollama health request failed")?;
        if !response.status().is_success() {
            anyhow::bail!("Ollama responded with status {}", response.status());
        }
        Ok(())
    }

    pub async fn generate(&self, prompt: String) -> Result<String> {
        let url = self.base_url.join("api/generate").context("failed to build generate URL")?;
        let request = GenerateRequest {
            model: &self.model,
            prompt,
            stream: false,
            options: SamplingOptions { temperature: 0.9, top_p: 0.9, repeat_penalty: 1.2 },
        };
        debug!("calling Ollama model {}", self.model);
        let response = self
            .http
            .post(url)
            .json(&request)
            .send()
            .await
            .context("Ollama generate request failed")?;
        if !response.status().is_success() {
            anyhow::bail!("Ollama responded with status {}", response.status());
        }
        let body: GenerateResponse =
            response.json().await.context("failed to decode Ollama response")?;
        Ok(body.response)
    }

    async fn propose_notes(
        &self,
        params: &MusicParameters,
        recent: &[Vec<i32>],
    ) -> Result<Vec<i32>> {
        let response = self.generate(build_prompt(params, recent)).await?;
        let notes = parse_note_list(&response);
        info!("Ollama proposed [{}]", describe_notes(&notes));
        Ok(notes)
    }
}

impl NoteProposer for OllamaClient {
    fn propose<'a>(
        &'a self,
        params: &'a MusicParameters,
        recent: &'a [Vec<i32>],
    ) -> BoxFuture<'a, Result<Vec<i32>>> {
        Box::pin(self.propose_notes(params, recent))
    }
}

fn build_prompt(params: &MusicParameters, recent: &[Vec<i32>]) -> String {
    let length = params.sequence_length;
    let mut prompt = format!(
        "Generate a {length}-note MIDI sequence for KantanPlay.

Available notes:
- Modifiers (53-59): dim, 7th, sus4, swap, add9, M7
- Root notes (60-71): 1, 2b, 2, 3b, 3, 4, 5b, 5, 6b, 6, 7b, 7
- Ghost note: -1 (rest/silence)

Rules:
- Tempo: {tempo} BPM
- Key: {key}
- Mood: {mood}
- Complexity: {complexity}/10
- Higher complexity = more modifiers + fewer rests
- Lower complexity = mostly root notes + more rests
",
        tempo = params.tempo,
        key = params.key,
        mood = params.mood,
        complexity = params.complexity,
    );

    if !recent.is_empty() {
        prompt.push_str("\nDo not repeat any of these recent sequences:\n");
        for notes in recent {
            let line = notes.iter().map(|n| n.to_string()).collect::<Vec<_>>().join(",");
            prompt.push_str(&format!("- {line}\n"));
        }
    }

    prompt.push_str(&format!(
        "\nReturn exactly {length} comma-separated MIDI note numbers.
Example: 60,64,-1,67,71

Output only numbers:"
    ));
    prompt
}

/// Every integer token in a model reply, in order. Range checks are left to
/// the caller.
pub fn parse_note_list(text: &str) -> Vec<i32> {
    text.split(|c: char| c == ',' || c.is_whitespace())
        .map(|token| token.trim_matches(|c: char| !(c.is_ascii_digit() || c == '-')))
        .filter(|token| !token.is_empty())
        .filter_map(|token| token.parse().ok())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{Key, Mood};

    #[test]
    fn parses_comma_and_whitespace_separated_numbers() {
        assert_eq!(parse_note_list("60,64,-1,67,71"), vec![60, 64, -1, 67, 71]);
        assert_eq!(parse_note_list(" 60, 62 ,\n64\n"), vec![60, 62, 64]);
        assert_eq!(parse_note_list("[60, 64, 67]."), vec![60, 64, 67]);
    }

    #[test]
    fn skips_words_and_keeps_out_of_range_numbers() {
        assert_eq!(parse_note_list("Sure! Here: 60, abc, 99, -1"), vec![60, 99, -1]);
        assert!(parse_note_list("no notes here").is_empty());
        assert!(parse_note_list("").is_empty());
    }

    #[test]
    fn prompt_carries_parameters_and_history() {
        let params = MusicParameters {
            tempo: 140,
            key: Key::E,
            mood: Mood::Energetic,
            complexity: 8,
            sequence_length: 12,
        };
        let prompt = build_prompt(&params, &[vec![60, -1, 64]]);
        assert!(prompt.contains("Generate a 12-note"));
        assert!(prompt.contains("Tempo: 140 BPM"));
        assert!(prompt.contains("Key: E"));
        assert!(prompt.contains("Mood: energetic"));
        assert!(prompt.contains("Complexity: 8/10"));
        assert!(prompt.contains("- 60,-1,64"));
        assert!(prompt.contains("Return exactly 12"));

        assert!(!build_prompt(&params, &[]).contains("recent sequences"));
    }

    #[test]
    fn rejects_invalid_base_url() {
        assert!(OllamaClient::new("not a url", DEFAULT_MODEL, Duration::from_secs(1)).is_err());
        let client =
            OllamaClient::new(DEFAULT_BASE_URL, DEFAULT_MODEL, Duration::from_secs(1)).unwrap();
        assert_eq!(client.model(), "gemma3:4b");
    }
}
