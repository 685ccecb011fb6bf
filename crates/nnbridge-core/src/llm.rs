//! Text generation front-end.
//!
//! The reference engine tokenizes at byte level and decodes by echoing the
//! prompt back one token per step. It exists to exercise the generation
//! surface (config, prefill/decode bookkeeping, stop detection) rather than
//! to produce useful text.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Instant;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{Result, RuntimeError};

fn default_max_new_tokens() -> usize {
    512
}

/// Generation settings. Unknown keys are preserved so that a dumped config
/// round-trips.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationConfig {
    #[serde(default = "default_max_new_tokens")]
    pub max_new_tokens: usize,
    #[serde(default)]
    pub stop_token: Option<i32>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            max_new_tokens: default_max_new_tokens(),
            stop_token: None,
            extra: Map::new(),
        }
    }
}

/// Counters and timings of the current conversation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GenerationContext {
    pub prompt_len: usize,
    pub gen_seq_len: usize,
    pub all_seq_len: usize,
    pub load_us: i64,
    pub prefill_us: i64,
    pub decode_us: i64,
    pub sample_us: i64,
    pub current_token: i32,
    pub generate_str: String,
}

#[derive(Debug)]
pub struct GenerationEngine {
    config_path: PathBuf,
    config: GenerationConfig,
    loaded: bool,
    prompt: Vec<i32>,
    cursor: usize,
    stopped: bool,
    context: GenerationContext,
}

impl GenerationEngine {
    /// Create an engine from a JSON config file.
    pub fn new(config_path: impl AsRef<Path>) -> Result<Self> {
        let path = config_path.as_ref();
        if !path.exists() {
            return Err(RuntimeError::FileNotExist(path.to_path_buf()));
        }
        let raw = fs::read(path).map_err(|source| RuntimeError::FileOpenFailed {
            path: path.to_path_buf(),
            source,
        })?;
        let config: GenerationConfig = serde_json::from_slice(&raw)?;
        tracing::debug!(path = %path.display(), max_new_tokens = config.max_new_tokens, "generation engine created");
        Ok(Self {
            config_path: path.to_path_buf(),
            config,
            loaded: false,
            prompt: Vec::new(),
            cursor: 0,
            stopped: false,
            context: GenerationContext::default(),
        })
    }

    pub fn load(&mut self) -> Result<()> {
        let start = Instant::now();
        self.loaded = true;
        self.context.load_us = start.elapsed().as_micros() as i64;
        tracing::info!(path = %self.config_path.display(), "generation engine loaded");
        Ok(())
    }

    pub fn is_loaded(&self) -> bool {
        self.loaded
    }

    pub fn config(&self) -> &GenerationConfig {
        &self.config
    }

    /// Merge a JSON object into the current config.
    pub fn set_config(&mut self, patch: &str) -> Result<()> {
        let patch: Value = serde_json::from_str(patch)?;
        let Value::Object(patch) = patch else {
            return Err(RuntimeError::invalid("config patch must be a JSON object"));
        };
        let mut current = serde_json::to_value(&self.config)?;
        if let Value::Object(map) = &mut current {
            map.extend(patch);
        }
        self.config = serde_json::from_value(current)?;
        Ok(())
    }

    pub fn dump_config(&self) -> Result<String> {
        Ok(serde_json::to_string(&self.config)?)
    }

    pub fn tokenize(&self, text: &str) -> Vec<i32> {
        text.bytes().map(i32::from).collect()
    }

    /// Decode tokens; ids outside the byte range are dropped.
    pub fn detokenize(&self, tokens: &[i32]) -> String {
        let bytes: Vec<u8> = tokens.iter().filter_map(|&t| u8::try_from(t).ok()).collect();
        String::from_utf8_lossy(&bytes).into_owned()
    }

    fn ensure_loaded(&self) -> Result<()> {
        if self.loaded {
            Ok(())
        } else {
            Err(RuntimeError::invalid("generation engine not loaded"))
        }
    }

    /// Prefill `prompt` and decode up to the configured token limit.
    pub fn response(&mut self, prompt: &str, stream: bool) -> Result<String> {
        self.ensure_loaded()?;
        let start = Instant::now();
        self.prompt = self.tokenize(prompt);
        self.cursor = 0;
        self.stopped = false;
        self.context.prompt_len = self.prompt.len();
        self.context.gen_seq_len = 0;
        self.context.all_seq_len = self.prompt.len();
        self.context.prefill_us = start.elapsed().as_micros() as i64;

        let text = self.generate(self.config.max_new_tokens)?;
        if stream {
            tracing::debug!(chars = text.len(), "streamed response");
        }
        Ok(text)
    }

    /// Decode up to `max_tokens` more tokens. The text of this call is
    /// returned and kept in the context until the next call.
    pub fn generate(&mut self, max_tokens: usize) -> Result<String> {
        self.ensure_loaded()?;
        let start = Instant::now();
        let mut produced = Vec::new();
        while produced.len() < max_tokens && !self.stopped {
            let Some(&token) = self.prompt.get(self.cursor) else {
                self.stopped = true;
                break;
            };
            self.cursor += 1;
            if Some(token) == self.config.stop_token {
                self.stopped = true;
                break;
            }
            produced.push(token);
            self.context.current_token = token;
        }
        if self.cursor >= self.prompt.len() {
            self.stopped = true;
        }
        self.context.gen_seq_len += produced.len();
        self.context.all_seq_len = self.context.prompt_len + self.context.gen_seq_len;
        self.context.decode_us = start.elapsed().as_micros() as i64;
        self.context.generate_str = self.detokenize(&produced);
        Ok(self.context.generate_str.clone())
    }

    pub fn reset(&mut self) {
        self.prompt.clear();
        self.cursor = 0;
        self.stopped = false;
        let load_us = self.context.load_us;
        self.context = GenerationContext {
            load_us,
            ..Default::default()
        };
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped
    }

    pub fn context(&self) -> &GenerationContext {
        &self.context
    }
}
