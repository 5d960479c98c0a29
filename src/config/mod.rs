use std::{
    collections::HashMap,
    env, fs,
    path::PathBuf,
    str::FromStr,
    time::Duration,
};

use directories::BaseDirs;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{key} is not set; export it, put it in .env or add it to {}", path.display())]
    Missing { key: &'static str, path: PathBuf },
    #[error("{key} has invalid value `{value}`: {reason}")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },
}

#[derive(Debug, Clone)]
pub struct Config {
    inner: HashMap<String, String>,
    pub config_path: PathBuf,
}

impl Config {
    /// Defaults, then `.agentrc`, then the process environment.
    pub fn load() -> Self {
        let mut map = default_map();
        let config_path = default_config_path();

        if let Ok(text) = fs::read_to_string(&config_path) {
            map.extend(parse_rc(&text));
        }

        for (k, v) in env::vars() {
            if is_config_key(&k) {
                map.insert(k, v);
            }
        }

        Self { inner: map, config_path }
    }

    /// Defaults overlaid with explicit values; never reads the rc file or the environment.
    pub fn with_values<I, K, V>(values: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let mut map = default_map();
        map.extend(values.into_iter().map(|(k, v)| (k.into(), v.into())));
        Self {
            inner: map,
            config_path: default_config_path(),
        }
    }

    pub fn get(&self, key: &str) -> Option<String> {
        self.inner.get(key).cloned()
    }

    pub fn set(&mut self, key: &str, value: impl Into<String>) {
        self.inner.insert(key.to_string(), value.into());
    }

    pub fn get_bool(&self, key: &str) -> bool {
        self.get(key)
            .map(|v| v.eq_ignore_ascii_case("true"))
            .unwrap_or(false)
    }

    pub fn get_usize(&self, key: &str) -> Option<usize> {
        self.get(key).and_then(|v| v.parse::<usize>().ok())
    }

    pub fn get_path(&self, key: &str) -> Option<PathBuf> {
        self.get(key).filter(|v| !v.trim().is_empty()).map(PathBuf::from)
    }

    /// A required, non-empty value.
    pub fn require(&self, key: &'static str) -> Result<String, ConfigError> {
        self.get(key)
            .filter(|v| !v.trim().is_empty())
            .ok_or_else(|| ConfigError::Missing {
                key,
                path: self.config_path.clone(),
            })
    }

    /// Parses an optional value; empty strings count as unset.
    pub fn parse<T>(&self, key: &'static str) -> Result<Option<T>, ConfigError>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        match self.get(key).filter(|v| !v.trim().is_empty()) {
            None => Ok(None),
            Some(raw) => raw
                .trim()
                .parse::<T>()
                .map(Some)
                .map_err(|e| ConfigError::Invalid {
                    key,
                    value: raw.clone(),
                    reason: e.to_string(),
                }),
        }
    }

    pub fn chat_cache_path(&self) -> PathBuf {
        self.get_path("CHAT_CACHE_PATH")
            .unwrap_or_else(|| env::temp_dir().join("adsorb_agent").join("chat_cache"))
    }

    pub fn output_dir(&self) -> PathBuf {
        self.get_path("OUTPUT_DIR").unwrap_or_else(|| PathBuf::from("outputs"))
    }

    pub fn python_bin(&self) -> String {
        self.get("PYTHON_BIN")
            .filter(|v| !v.trim().is_empty())
            .unwrap_or_else(|| "python3".into())
    }

    /// `EXEC_TIMEOUT` in seconds; 0 disables the limit.
    pub fn exec_timeout(&self) -> Result<Option<Duration>, ConfigError> {
        Ok(self
            .parse::<u64>("EXEC_TIMEOUT")?
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs))
    }

    /// `SANDBOX_MODULES` as `(alias, module)` pairs.
    pub fn sandbox_modules(&self) -> Result<Vec<(String, String)>, ConfigError> {
        let raw = self.get("SANDBOX_MODULES").unwrap_or_default();
        parse_modules(&raw).map_err(|reason| ConfigError::Invalid {
            key: "SANDBOX_MODULES",
            value: raw.clone(),
            reason,
        })
    }
}

/// `KEY=VALUE` lines; blank lines and `#` comments are skipped.
pub fn parse_rc(text: &str) -> HashMap<String, String> {
    text.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .filter_map(|line| line.split_once('='))
        .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
        .collect()
}

fn parse_modules(raw: &str) -> Result<Vec<(String, String)>, String> {
    let mut out = Vec::new();
    for item in raw.split(',').map(str::trim).filter(|s| !s.is_empty()) {
        let (alias, module) = match item.split_once('=') {
            Some((alias, module)) => (alias.trim(), module.trim()),
            None => (item, item),
        };
        if !is_identifier(alias) {
            return Err(format!("`{alias}` is not a valid Python name"));
        }
        if module.is_empty() || !module.split('.').all(is_identifier) {
            return Err(format!("`{module}` is not a valid module path"));
        }
        out.push((alias.to_string(), module.to_string()));
    }
    Ok(out)
}

/// ASCII Python identifier check.
pub fn is_identifier(s: &str) -> bool {
    let mut chars = s.chars();
    match chars.next() {
        Some(c) if c == '_' || c.is_ascii_alphabetic() => {}
        _ => return false,
    }
    chars.all(|c| c == '_' || c.is_ascii_alphanumeric())
}

fn is_config_key(k: &str) -> bool {
    const KEYS: &[&str] = &[
        "OPENROUTER_API_KEY",
        "API_BASE_URL",
        "DEFAULT_MODEL",
        "REQUEST_TIMEOUT",
        "MAX_COMPLETION_TOKENS",
        "SEED",
        "MAX_TURNS",
        "PYTHON_BIN",
        "SANDBOX_MODULES",
        "EXEC_TIMEOUT",
        "OUTPUT_DIR",
        "CHAT_CACHE_PATH",
        "CHAT_CACHE_LENGTH",
        "PROMPT_TEMPLATE_PATH",
        "PRETTIFY_MARKDOWN",
    ];

    KEYS.contains(&k) || k.starts_with("AGENT_") || k.starts_with("OPENROUTER_")
}

fn default_config_path() -> PathBuf {
    let base = BaseDirs::new()
        .map(|b| b.config_dir().to_path_buf())
        .unwrap_or_else(|| PathBuf::from("~/.config"));
    base.join("adsorb_agent").join(".agentrc")
}

fn default_map() -> HashMap<String, String> {
    let mut m = HashMap::new();
    let temp = env::temp_dir().join("adsorb_agent");

    m.insert(
        "CHAT_CACHE_PATH".into(),
        temp.join("chat_cache").to_string_lossy().into_owned(),
    );
    m.insert("OUTPUT_DIR".into(), "outputs".into());

    m.insert("CHAT_CACHE_LENGTH".into(), "100".into());
    m.insert("REQUEST_TIMEOUT".into(), "600".into());
    m.insert("MAX_COMPLETION_TOKENS".into(), "20000".into());
    m.insert("SEED".into(), "420".into());
    m.insert("MAX_TURNS".into(), "25".into());
    m.insert("EXEC_TIMEOUT".into(), "0".into());

    m.insert("API_BASE_URL".into(), "https://openrouter.ai/api/v1".into());
    m.insert("DEFAULT_MODEL".into(), "google/gemini-2.5-pro".into());
    m.insert("PYTHON_BIN".into(), "python3".into());
    m.insert(
        "SANDBOX_MODULES".into(),
        "np=numpy,pd=pandas,scipy=scipy,sklearn=sklearn,math=math,ase=ase,\
         autoadsorbate=autoadsorbate,torch=torch,mace=mace"
            .into(),
    );

    m.insert("PRETTIFY_MARKDOWN".into(), "true".into());

    m
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rc_lines_skip_comments_and_blanks() {
        let map = parse_rc("# model\nDEFAULT_MODEL = x/y\n\nMAX_TURNS=3\nnot a pair\n");
        assert_eq!(map.get("DEFAULT_MODEL").map(String::as_str), Some("x/y"));
        assert_eq!(map.get("MAX_TURNS").map(String::as_str), Some("3"));
        assert_eq!(map.len(), 2);
    }

    #[test]
    fn missing_api_key_is_reported() {
        let cfg = Config::with_values([("OPENROUTER_API_KEY", "  ")]);
        let err = cfg.require("OPENROUTER_API_KEY").unwrap_err();
        assert!(err.to_string().contains("OPENROUTER_API_KEY"));
    }

    #[test]
    fn default_modules_parse() {
        let cfg = Config::with_values(Vec::<(String, String)>::new());
        let modules = cfg.sandbox_modules().unwrap();
        assert_eq!(modules[0], ("np".to_string(), "numpy".to_string()));
        assert!(modules.iter().any(|(alias, _)| alias == "mace"));
    }

    #[test]
    fn bare_and_dotted_modules() {
        let cfg = Config::with_values([("SANDBOX_MODULES", "math, io=ase.io")]);
        assert_eq!(
            cfg.sandbox_modules().unwrap(),
            vec![
                ("math".to_string(), "math".to_string()),
                ("io".to_string(), "ase.io".to_string())
            ]
        );
    }

    #[test]
    fn invalid_alias_is_rejected() {
        let cfg = Config::with_values([("SANDBOX_MODULES", "1np=numpy")]);
        assert!(matches!(
            cfg.sandbox_modules(),
            Err(ConfigError::Invalid { key: "SANDBOX_MODULES", .. })
        ));
    }

    #[test]
    fn zero_timeout_disables_limit() {
        let cfg = Config::with_values(Vec::<(String, String)>::new());
        assert_eq!(cfg.exec_timeout().unwrap(), None);
        let cfg = Config::with_values([("EXEC_TIMEOUT", "30")]);
        assert_eq!(cfg.exec_timeout().unwrap(), Some(Duration::from_secs(30)));
        let cfg = Config::with_values([("EXEC_TIMEOUT", "soon")]);
        assert!(cfg.exec_timeout().is_err());
    }

    #[test]
    fn identifiers() {
        assert!(is_identifier("site_dict"));
        assert!(is_identifier("_x1"));
        assert!(!is_identifier("2x"));
        assert!(!is_identifier("a-b"));
        assert!(!is_identifier(""));
    }
}
