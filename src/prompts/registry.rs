// src/prompts/registry.rs
// Prompt registry backed by files. Content is cached per file and re-read
// only when the mtime changes, so prompt edits take effect without restarts.

use crate::config::{AppConfig, PromptConfig};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::SystemTime;
use tracing::warn;

#[derive(Debug, Clone)]
pub struct PromptSpec {
    pub prompt_id: String,
    pub start_prompt: String,
    pub default_max_chat_uses: i64,
    pub file_path: PathBuf,
}

pub struct PromptRegistry {
    by_id: HashMap<String, PromptConfig>,
    cache: Mutex<HashMap<PathBuf, (SystemTime, String)>>,
}

impl PromptRegistry {
    /// Prompt file paths in `config` are expected to be absolute already
    /// (config loading resolves them against the config directory).
    pub fn new(config: &AppConfig) -> Self {
        let by_id = config
            .prompts
            .iter()
            .map(|p| (p.prompt_id.clone(), p.clone()))
            .collect();
        Self {
            by_id,
            cache: Mutex::new(HashMap::new()),
        }
    }

    pub fn list_prompt_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.by_id.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// None for unknown prompt ids. A known id with a missing file yields an
    /// empty start prompt, which means "do not send a start prompt".
    pub fn get(&self, prompt_id: &str) -> Option<PromptSpec> {
        let cfg = self.by_id.get(prompt_id)?;
        let path = PathBuf::from(&cfg.file);
        let start_prompt = self.read_cached(&path);
        Some(PromptSpec {
            prompt_id: cfg.prompt_id.clone(),
            start_prompt,
            default_max_chat_uses: if cfg.default_max_chat_uses > 0 {
                cfg.default_max_chat_uses
            } else {
                50
            },
            file_path: path,
        })
    }

    fn read_cached(&self, path: &Path) -> String {
        let mtime = match std::fs::metadata(path).and_then(|m| m.modified()) {
            Ok(mtime) => mtime,
            Err(_) => return String::new(),
        };

        let mut cache = self.cache.lock().expect("prompt cache poisoned");
        if let Some((cached_mtime, text)) = cache.get(path) {
            if *cached_mtime == mtime {
                return text.clone();
            }
        }

        let text = match std::fs::read_to_string(path) {
            Ok(text) => text,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "failed to read prompt file");
                String::new()
            }
        };
        cache.insert(path.to_path_buf(), (mtime, text.clone()));
        text
    }
}
