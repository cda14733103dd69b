//! repo-expert configuration (`repo-expert.yaml`).
//!
//! Two top-level sections: a `provider:` block selecting the memory-service
//! backend, and a `repos:` map declaring the repositories to keep agents
//! for. An optional `defaults:` block supplies per-repo fields that
//! individual repos leave unset. A legacy top-level `letta:` block (model +
//! embedding only) is still accepted and mapped onto the modern provider
//! section.
//!
//! Validation collects every problem before failing, so the operator fixes
//! the whole file in one pass.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;

/// Extensions indexed when neither the repo nor `defaults:` names any.
pub const DEFAULT_EXTENSIONS: &[&str] = &[
    ".rs", ".ts", ".tsx", ".js", ".py", ".go", ".md", ".toml", ".yaml", ".yml", ".json",
];

/// Directory names skipped when neither the repo nor `defaults:` names any.
pub const DEFAULT_IGNORE_DIRS: &[&str] = &[
    ".git",
    "node_modules",
    "target",
    "dist",
    "build",
    ".venv",
    "__pycache__",
];

/// Per-file size ceiling applied when the config does not set one.
pub const DEFAULT_MAX_FILE_SIZE_KB: u64 = 100;

/// Byte limit for each agent memory block when the config does not set one.
pub const DEFAULT_MEMORY_BLOCK_LIMIT: u32 = 4096;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors loading or validating the configuration file.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The config file does not exist.
    #[error("config file not found: {}\n  To fix: create it, or pass --config <path>.", path.display())]
    Missing {
        /// The path that was tried.
        path: PathBuf,
    },

    /// The file exists but is not valid YAML for the expected schema.
    #[error("failed to parse {}: {detail}", path.display())]
    Parse {
        /// Path to the config file.
        path: PathBuf,
        /// Parser error text.
        detail: String,
    },

    /// The file parsed but one or more fields are invalid.
    ///
    /// Rendered one bullet per issue.
    #[error("invalid configuration:{}", issues.iter().map(|i| format!("\n  - {i}")).collect::<String>())]
    Invalid {
        /// Every validation failure found.
        issues: Vec<String>,
    },

    /// Reading the file failed at the OS level.
    #[error("failed to read {}: {source}", path.display())]
    Io {
        /// Path to the config file.
        path: PathBuf,
        /// Underlying error.
        source: std::io::Error,
    },
}

// ---------------------------------------------------------------------------
// Provider section
// ---------------------------------------------------------------------------

/// Which memory-service backend to talk to.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    /// A Letta server (self-hosted or cloud).
    #[default]
    Letta,
    /// A Viking deployment (Letta-compatible wire surface).
    Viking,
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Letta => write!(f, "letta"),
            Self::Viking => write!(f, "viking"),
        }
    }
}

/// Connection and model settings for the memory-service provider.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProviderSettings {
    /// Backend flavor.
    #[serde(rename = "type", default)]
    pub kind: ProviderKind,

    /// Base URL of the service (default: local Letta).
    #[serde(default = "default_base_url")]
    pub base_url: String,

    /// Chat model handle passed through on agent creation.
    pub model: String,

    /// Embedding model handle passed through on agent creation.
    pub embedding: String,

    /// Cheaper model used where full quality is not needed (optional).
    #[serde(default)]
    pub fast_model: Option<String>,

    /// Environment variable holding the API token.
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,
}

fn default_base_url() -> String {
    "http://localhost:8283".to_owned()
}

fn default_api_key_env() -> String {
    "LETTA_API_KEY".to_owned()
}

/// Legacy `letta:` block — model settings only.
#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct LegacyLetta {
    model: String,
    embedding: String,
    #[serde(default)]
    fast_model: Option<String>,
}

// ---------------------------------------------------------------------------
// Chunking strategy selection
// ---------------------------------------------------------------------------

/// Which chunking strategy maps file content to passages.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ChunkStrategy {
    /// One passage per file, prefixed with the `FILE:` header.
    #[default]
    Raw,
    /// Split at top-level AST items via tree-sitter; falls back to raw for
    /// unsupported languages.
    TreeSitter,
}

// ---------------------------------------------------------------------------
// RepoConfig
// ---------------------------------------------------------------------------

/// Immutable view of one repository's indexing policy.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RepoConfig {
    /// Absolute path to the git repository.
    pub path: PathBuf,
    /// Human description, forwarded to the agent on creation.
    pub description: String,
    /// Optional sub-directory whose contents form the agent's logical root.
    pub base_path: Option<String>,
    /// File extensions to index; each starts with `.`.
    pub extensions: Vec<String>,
    /// Directory segment names to skip (no path separators).
    pub ignore_dirs: Vec<String>,
    /// Per-file size ceiling in KB; `None` disables the check.
    pub max_file_size_kb: Option<u64>,
    /// Byte limit for each agent memory block.
    pub memory_block_limit: u32,
    /// Run the bootstrap prompt sequence after the first index.
    pub bootstrap_on_create: bool,
    /// Tags attached to the agent on creation.
    pub tags: Vec<String>,
    /// Persona text for the agent's `persona` block.
    pub persona: Option<String>,
    /// Extension tool names enabled on the agent.
    pub tools: Vec<String>,
    /// Expand initialized submodules when collecting files.
    pub include_submodules: bool,
    /// Chunking strategy for this repo.
    pub chunker: ChunkStrategy,
}

/// Raw per-repo entry as written in YAML — unset fields fall back to
/// `defaults:` and then to built-in defaults.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawRepo {
    #[serde(default)]
    path: PathBuf,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    base_path: Option<String>,
    #[serde(default)]
    extensions: Option<Vec<String>>,
    #[serde(default)]
    ignore_dirs: Option<Vec<String>>,
    #[serde(default)]
    max_file_size_kb: Option<u64>,
    #[serde(default)]
    memory_block_limit: Option<u32>,
    #[serde(default)]
    bootstrap_on_create: Option<bool>,
    #[serde(default)]
    tags: Option<Vec<String>>,
    #[serde(default)]
    persona: Option<String>,
    #[serde(default)]
    tools: Option<Vec<String>>,
    #[serde(default)]
    include_submodules: Option<bool>,
    #[serde(default)]
    chunker: Option<ChunkStrategy>,
}

/// The `defaults:` block — fields merged into every repo that leaves them
/// unset.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawDefaults {
    #[serde(default)]
    extensions: Option<Vec<String>>,
    #[serde(default)]
    ignore_dirs: Option<Vec<String>>,
    #[serde(default)]
    max_file_size_kb: Option<u64>,
    #[serde(default)]
    memory_block_limit: Option<u32>,
    #[serde(default)]
    bootstrap_on_create: Option<bool>,
    #[serde(default)]
    include_submodules: Option<bool>,
    #[serde(default)]
    chunker: Option<ChunkStrategy>,
}

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawConfig {
    #[serde(default)]
    provider: Option<ProviderSettings>,
    #[serde(default)]
    letta: Option<LegacyLetta>,
    #[serde(default)]
    defaults: Option<RawDefaults>,
    #[serde(default)]
    repos: BTreeMap<String, RawRepo>,
}

/// Validated top-level configuration.
#[derive(Clone, Debug)]
pub struct Config {
    /// Provider connection settings.
    pub provider: ProviderSettings,
    /// Repositories, keyed by repo name.
    pub repos: BTreeMap<String, RepoConfig>,
}

impl Config {
    /// Load and validate the config file at `path`.
    ///
    /// # Errors
    /// [`ConfigError::Missing`] if the file does not exist,
    /// [`ConfigError::Parse`] on YAML errors, [`ConfigError::Invalid`] with
    /// one bullet per problem otherwise.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Err(ConfigError::Missing {
                path: path.to_path_buf(),
            });
        }
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml(&text).map_err(|e| match e {
            ConfigError::Parse { detail, .. } => ConfigError::Parse {
                path: path.to_path_buf(),
                detail,
            },
            other => other,
        })
    }

    /// Parse and validate config from YAML text.
    ///
    /// # Errors
    /// Same as [`Config::load`], minus the missing-file case.
    pub fn from_yaml(text: &str) -> Result<Self, ConfigError> {
        let raw: RawConfig = serde_yaml::from_str(text).map_err(|e| ConfigError::Parse {
            path: PathBuf::new(),
            detail: e.to_string(),
        })?;
        resolve(raw)
    }

    /// Look up a repo by name.
    #[must_use]
    pub fn repo(&self, name: &str) -> Option<&RepoConfig> {
        self.repos.get(name)
    }
}

/// Merge defaults, apply built-ins, and validate.
fn resolve(raw: RawConfig) -> Result<Config, ConfigError> {
    let mut issues = Vec::new();

    let provider = match (raw.provider, raw.letta) {
        (Some(p), _) => p,
        (None, Some(legacy)) => ProviderSettings {
            kind: ProviderKind::Letta,
            base_url: default_base_url(),
            model: legacy.model,
            embedding: legacy.embedding,
            fast_model: legacy.fast_model,
            api_key_env: default_api_key_env(),
        },
        (None, None) => {
            issues.push("missing `provider:` section (or legacy `letta:` block)".to_owned());
            // Placeholder so repo validation still runs; the error below wins.
            ProviderSettings {
                kind: ProviderKind::Letta,
                base_url: default_base_url(),
                model: String::new(),
                embedding: String::new(),
                fast_model: None,
                api_key_env: default_api_key_env(),
            }
        }
    };

    if raw.repos.is_empty() {
        issues.push("at least one repo must be declared under `repos:`".to_owned());
    }

    let defaults = raw.defaults.unwrap_or_default();
    let mut repos = BTreeMap::new();
    for (name, entry) in raw.repos {
        let repo = resolve_repo(&name, entry, &defaults, &mut issues);
        repos.insert(name, repo);
    }

    if issues.is_empty() {
        Ok(Config { provider, repos })
    } else {
        Err(ConfigError::Invalid { issues })
    }
}

fn resolve_repo(
    name: &str,
    entry: RawRepo,
    defaults: &RawDefaults,
    issues: &mut Vec<String>,
) -> RepoConfig {
    let extensions = entry
        .extensions
        .or_else(|| defaults.extensions.clone())
        .unwrap_or_else(|| DEFAULT_EXTENSIONS.iter().map(|s| (*s).to_owned()).collect());
    let ignore_dirs = entry
        .ignore_dirs
        .or_else(|| defaults.ignore_dirs.clone())
        .unwrap_or_else(|| DEFAULT_IGNORE_DIRS.iter().map(|s| (*s).to_owned()).collect());

    if entry.path.as_os_str().is_empty() {
        issues.push(format!("repo `{name}`: missing required field `path`"));
    } else if !entry.path.is_absolute() {
        issues.push(format!(
            "repo `{name}`: path must be absolute (got `{}`)",
            entry.path.display()
        ));
    }
    for ext in &extensions {
        if !ext.starts_with('.') {
            issues.push(format!(
                "repo `{name}`: extension `{ext}` must start with `.`"
            ));
        }
    }
    for dir in &ignore_dirs {
        if dir.contains('/') || dir.contains('\\') {
            issues.push(format!(
                "repo `{name}`: ignore_dirs entry `{dir}` must be a single path segment"
            ));
        }
    }
    if let Some(base) = &entry.base_path
        && (base.starts_with('/') || base.contains(".."))
    {
        issues.push(format!(
            "repo `{name}`: base_path `{base}` must be a relative sub-directory"
        ));
    }

    RepoConfig {
        path: entry.path,
        description: entry.description.unwrap_or_default(),
        base_path: entry.base_path,
        extensions,
        ignore_dirs,
        max_file_size_kb: entry
            .max_file_size_kb
            .or(defaults.max_file_size_kb)
            .or(Some(DEFAULT_MAX_FILE_SIZE_KB)),
        memory_block_limit: entry
            .memory_block_limit
            .or(defaults.memory_block_limit)
            .unwrap_or(DEFAULT_MEMORY_BLOCK_LIMIT),
        bootstrap_on_create: entry
            .bootstrap_on_create
            .or(defaults.bootstrap_on_create)
            .unwrap_or(true),
        tags: entry.tags.unwrap_or_default(),
        persona: entry.persona,
        tools: entry.tools.unwrap_or_default(),
        include_submodules: entry
            .include_submodules
            .or(defaults.include_submodules)
            .unwrap_or(false),
        chunker: entry.chunker.or(defaults.chunker).unwrap_or_default(),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r"
provider:
  type: letta
  model: openai/gpt-4.1
  embedding: openai/text-embedding-3-small
repos:
  myrepo:
    path: /tmp/myrepo
";

    #[test]
    fn minimal_config_resolves_with_defaults() {
        let config = Config::from_yaml(MINIMAL).expect("should parse");
        let repo = config.repo("myrepo").expect("repo present");
        assert_eq!(repo.extensions, DEFAULT_EXTENSIONS);
        assert_eq!(repo.max_file_size_kb, Some(DEFAULT_MAX_FILE_SIZE_KB));
        assert!(repo.bootstrap_on_create);
        assert_eq!(repo.chunker, ChunkStrategy::Raw);
    }

    #[test]
    fn legacy_letta_block_maps_to_provider() {
        let yaml = r"
letta:
  model: openai/gpt-4.1
  embedding: openai/text-embedding-3-small
repos:
  r:
    path: /tmp/r
";
        let config = Config::from_yaml(yaml).expect("should parse");
        assert_eq!(config.provider.kind, ProviderKind::Letta);
        assert_eq!(config.provider.model, "openai/gpt-4.1");
    }

    #[test]
    fn defaults_block_applies_to_repos() {
        let yaml = r"
provider:
  model: m
  embedding: e
defaults:
  extensions: ['.rs']
  max_file_size_kb: 64
repos:
  r:
    path: /tmp/r
  s:
    path: /tmp/s
    extensions: ['.py']
";
        let config = Config::from_yaml(yaml).expect("should parse");
        assert_eq!(config.repos["r"].extensions, vec![".rs"]);
        assert_eq!(config.repos["r"].max_file_size_kb, Some(64));
        assert_eq!(config.repos["s"].extensions, vec![".py"]);
    }

    #[test]
    fn validation_collects_every_issue() {
        let yaml = r"
provider:
  model: m
  embedding: e
repos:
  bad:
    path: relative/path
    extensions: ['rs', '.py']
    ignore_dirs: ['a/b']
";
        let err = Config::from_yaml(yaml).expect_err("should fail");
        match err {
            ConfigError::Invalid { issues } => {
                assert_eq!(issues.len(), 3, "issues: {issues:?}");
                let rendered = format!("{}", ConfigError::Invalid { issues });
                assert!(rendered.contains("\n  - "));
            }
            other => panic!("expected Invalid, got {other:?}"),
        }
    }

    #[test]
    fn empty_repos_is_an_error() {
        let yaml = "provider:\n  model: m\n  embedding: e\n";
        let err = Config::from_yaml(yaml).expect_err("should fail");
        assert!(matches!(err, ConfigError::Invalid { .. }));
    }

    #[test]
    fn tree_sitter_strategy_parses() {
        let yaml = r"
provider:
  model: m
  embedding: e
repos:
  r:
    path: /tmp/r
    chunker: tree-sitter
";
        let config = Config::from_yaml(yaml).expect("should parse");
        assert_eq!(config.repos["r"].chunker, ChunkStrategy::TreeSitter);
    }
}
