//! Remote checkpoint store and artifact hub access.
//!
//! Checkpoints come from the Hugging Face Hub or a plain HTTPS release URL;
//! converted artifacts can optionally be published back to a Hub repository.
//! All transfers are blocking; a failed transfer aborts the conversion.

use crate::error::{GraftError, Result};
use hf_hub::api::sync::ApiBuilder;
use hf_hub::{Repo, RepoType};
use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};

/// Where an original checkpoint lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Source {
    /// A file inside a Hub model repository.
    Hub {
        /// Repository id in `org/name` form.
        repo: String,
        /// File name within the repository.
        file: String,
    },
    /// A direct HTTP(S) download.
    Url(String),
    /// A file already on disk.
    Local(PathBuf),
}

impl Source {
    /// Hub repository + file name.
    pub fn hub(repo: impl Into<String>, file: impl Into<String>) -> Self {
        Self::Hub {
            repo: repo.into(),
            file: file.into(),
        }
    }

    /// Parse a source string.
    ///
    /// `hf://org/repo/file` selects a Hub file (`default_file` when the file
    /// part is omitted), `http(s)://…` a direct URL, anything else a local
    /// path.
    pub fn parse(source: &str, default_file: &str) -> Result<Self> {
        if let Some(rest) = source.strip_prefix("hf://") {
            let parts: Vec<&str> = rest.split('/').collect();
            if parts.len() < 2 || parts[0].is_empty() || parts[1].is_empty() {
                return Err(GraftError::Download(format!(
                    "invalid hub source {source:?}, expected hf://org/repo[/file]"
                )));
            }
            let repo = format!("{}/{}", parts[0], parts[1]);
            let file = if parts.len() > 2 {
                parts[2..].join("/")
            } else {
                default_file.to_string()
            };
            Ok(Self::Hub { repo, file })
        } else if source.starts_with("http://") || source.starts_with("https://") {
            Ok(Self::Url(source.to_string()))
        } else {
            Ok(Self::Local(PathBuf::from(source)))
        }
    }

    /// Resolve this source to a local file, downloading if necessary.
    pub fn fetch(&self, cache_dir: &Path) -> Result<PathBuf> {
        match self {
            Self::Hub { repo, file } => fetch_hub_file(repo, file, RepoType::Model),
            Self::Url(url) => fetch_url(url, cache_dir),
            Self::Local(path) => {
                if path.is_file() {
                    Ok(path.clone())
                } else {
                    Err(GraftError::Download(format!(
                        "local checkpoint not found: {}",
                        path.display()
                    )))
                }
            }
        }
    }
}

/// Download a single file from a Hub repository into the shared Hub cache.
pub fn fetch_hub_file(repo_id: &str, file: &str, repo_type: RepoType) -> Result<PathBuf> {
    let api = ApiBuilder::new()
        .build()
        .map_err(|e| GraftError::Download(format!("hub api init failed: {e}")))?;
    let repo = api.repo(Repo::new(repo_id.to_string(), repo_type));
    repo.get(file).map_err(|e| {
        GraftError::Download(format!("failed to fetch {file} from {repo_id}: {e}"))
    })
}

/// Download a URL into `cache_dir`, returning the cached path.
///
/// An existing cached file is reused; release checkpoints are immutable.
pub fn fetch_url(url: &str, cache_dir: &Path) -> Result<PathBuf> {
    let name = url
        .rsplit('/')
        .next()
        .filter(|n| !n.is_empty())
        .ok_or_else(|| GraftError::Download(format!("cannot derive a file name from {url}")))?;
    fs::create_dir_all(cache_dir)?;
    let target = cache_dir.join(name);
    if target.is_file() {
        return Ok(target);
    }

    let response = ureq::get(url)
        .call()
        .map_err(|e| GraftError::Download(format!("GET {url} failed: {e}")))?;
    let mut bytes = Vec::new();
    response
        .into_reader()
        .read_to_end(&mut bytes)
        .map_err(|e| GraftError::Download(format!("reading {url} failed: {e}")))?;
    fs::write(&target, bytes)?;
    Ok(target)
}

/// Publishes converted artifacts to a Hub repository.
///
/// Authentication comes from the `HF_TOKEN` environment variable. The
/// commit endpoint takes newline-delimited JSON with base64 file payloads.
#[derive(Debug)]
pub struct Publisher {
    token: String,
    api_base: String,
}

impl Publisher {
    /// Create a publisher from the `HF_TOKEN` environment variable.
    pub fn from_env() -> Result<Self> {
        let token = std::env::var("HF_TOKEN")
            .map_err(|_| GraftError::Publish("HF_TOKEN environment variable not set".into()))?;
        Ok(Self::with_token(token))
    }

    /// Create a publisher with an explicit token.
    pub fn with_token(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            api_base: "https://huggingface.co".to_string(),
        }
    }

    /// Create the target repository if it does not exist yet.
    pub fn create_repo(&self, repo_id: &str) -> Result<()> {
        let (organization, name) = split_repo_id(repo_id)?;
        let body = serde_json::json!({
            "type": "model",
            "name": name,
            "organization": organization,
            "private": false,
        });
        let url = format!("{}/api/repos/create", self.api_base);
        match ureq::post(&url)
            .set("Authorization", &format!("Bearer {}", self.token))
            .send_json(body)
        {
            Ok(_) => Ok(()),
            // Already exists; publishing into it is fine.
            Err(ureq::Error::Status(409, _)) => Ok(()),
            Err(e) => Err(GraftError::Publish(format!(
                "creating {repo_id} failed: {e}"
            ))),
        }
    }

    /// Upload files from `dir` to the repository in a single commit.
    pub fn upload_files(
        &self,
        repo_id: &str,
        dir: &Path,
        files: &[&str],
        commit_message: &str,
    ) -> Result<()> {
        let mut lines = vec![serde_json::json!({
            "key": "header",
            "value": { "summary": commit_message },
        })
        .to_string()];

        for file in files {
            let path = dir.join(file);
            let content = fs::read(&path)?;
            lines.push(
                serde_json::json!({
                    "key": "file",
                    "value": {
                        "path": file,
                        "content": base64_encode(&content),
                        "encoding": "base64",
                    },
                })
                .to_string(),
            );
        }

        let url = format!("{}/api/models/{repo_id}/commit/main", self.api_base);
        ureq::post(&url)
            .set("Authorization", &format!("Bearer {}", self.token))
            .set("Content-Type", "application/x-ndjson")
            .send_string(&lines.join("\n"))
            .map_err(|e| GraftError::Publish(format!("commit to {repo_id} failed: {e}")))?;
        Ok(())
    }
}

fn split_repo_id(repo_id: &str) -> Result<(&str, &str)> {
    let mut parts = repo_id.split('/');
    match (parts.next(), parts.next(), parts.next()) {
        (Some(org), Some(name), None) if !org.is_empty() && !name.is_empty() => Ok((org, name)),
        _ => Err(GraftError::Publish(format!(
            "invalid repo id {repo_id:?}, expected org/name"
        ))),
    }
}

/// Base64 encode a file payload for the commit endpoint.
fn base64_encode(data: &[u8]) -> String {
    const ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789+/";

    let mut result = String::with_capacity(data.len().div_ceil(3) * 4);
    for chunk in data.chunks(3) {
        let mut buf = [0u8; 3];
        buf[..chunk.len()].copy_from_slice(chunk);
        let n = (u32::from(buf[0]) << 16) | (u32::from(buf[1]) << 8) | u32::from(buf[2]);

        result.push(ALPHABET[(n >> 18) as usize & 0x3f] as char);
        result.push(ALPHABET[(n >> 12) as usize & 0x3f] as char);
        if chunk.len() > 1 {
            result.push(ALPHABET[(n >> 6) as usize & 0x3f] as char);
        } else {
            result.push('=');
        }
        if chunk.len() > 2 {
            result.push(ALPHABET[n as usize & 0x3f] as char);
        } else {
            result.push('=');
        }
    }
    result
}
