//! web_search tool backed by the Serper Google Search API.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::debug;

use crate::{Tool, ToolOutput};

pub const DEFAULT_SERPER_URL: &str = "https://google.serper.dev";

pub struct WebSearchTool {
    api_key: String,
    base_url: String,
    max_results: usize,
    client: reqwest::Client,
}

impl WebSearchTool {
    pub fn new(api_key: String, base_url: Option<String>, max_results: usize) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(15))
            .build()
            .unwrap_or_default();
        Self {
            api_key,
            base_url: base_url.unwrap_or_else(|| DEFAULT_SERPER_URL.to_string()),
            max_results,
            client,
        }
    }
}

#[derive(Deserialize)]
struct Params {
    query: String,
    #[serde(default)]
    num_results: Option<usize>,
}

#[derive(Debug, Serialize, Deserialize, PartialEq)]
struct SearchResult {
    title: String,
    url: String,
    snippet: String,
}

/// Parse a Serper response into the answer box (if any) and organic results.
fn parse_serper_response(body: &serde_json::Value, max: usize) -> (Option<String>, Vec<SearchResult>) {
    let answer = body
        .get("answerBox")
        .and_then(|a| a.get("answer").or_else(|| a.get("snippet")))
        .and_then(|v| v.as_str())
        .map(str::to_string);

    let empty = vec![];
    let results = body["organic"]
        .as_array()
        .unwrap_or(&empty)
        .iter()
        .take(max)
        .filter_map(|r| {
            Some(SearchResult {
                title: r["title"].as_str()?.to_string(),
                url: r["link"].as_str()?.to_string(),
                snippet: r["snippet"].as_str().unwrap_or("").to_string(),
            })
        })
        .collect();

    (answer, results)
}

#[async_trait]
impl Tool for WebSearchTool {
    fn name(&self) -> &str {
        "web_search"
    }

    fn description(&self) -> &str {
        "Search the internet with Google. Use it for recent and accurate information such as \
         store addresses, opening hours, campaigns and prices, then summarize the key details \
         for the user instead of redirecting them to a website."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        json!({
            "type": "object",
            "properties": {
                "query": {
                    "type": "string",
                    "description": "The search query"
                },
                "num_results": {
                    "type": "integer",
                    "description": "Maximum number of results to return (default: 5)"
                }
            },
            "required": ["query"]
        })
    }

    async fn invoke(&self, args: serde_json::Value) -> anyhow::Result<ToolOutput> {
        let p: Params = serde_json::from_value(args)?;
        let max = p.num_results.unwrap_or(self.max_results);
        debug!(query = %p.query, max, "web_search");

        let resp = self
            .client
            .post(format!("{}/search", self.base_url))
            .header("X-API-KEY", &self.api_key)
            .json(&json!({ "q": p.query, "num": max }))
            .send()
            .await?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            anyhow::bail!("Search API error {status}: {body}");
        }

        let body: serde_json::Value = resp.json().await?;
        let (answer, results) = parse_serper_response(&body, max);

        Ok(ToolOutput::Json(json!({
            "answer": answer,
            "results": results,
        })))
    }
}
