//! Client configuration file (`$XDG_CONFIG_HOME/ojc/config.json`).

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CrawlerConfig {
    /// Base URL of the judge, e.g. `http://127.0.0.1:8000`.
    #[serde(default = "default_oj_base_url")]
    pub oj_base_url: String,
    /// Password shared by all generated accounts.
    #[serde(default = "default_password")]
    pub default_password: String,
    /// Working-pool size for a crawl task.
    #[serde(default = "default_accounts_per_crawl")]
    pub accounts_per_crawl: usize,
    /// Prefix of generated account usernames.
    #[serde(default = "default_username_prefix")]
    pub username_prefix: String,
    /// Domain used for generated registration emails.
    #[serde(default = "default_email_domain")]
    pub email_domain: String,
    /// Captcha recognizer service endpoint; registration fails without one.
    #[serde(default)]
    pub captcha_service_url: Option<String>,
}

fn default_oj_base_url() -> String {
    "http://127.0.0.1:8000".to_string()
}

fn default_password() -> String {
    "orju-shared-pass-1".to_string()
}

fn default_accounts_per_crawl() -> usize {
    3
}

fn default_username_prefix() -> String {
    "orju".to_string()
}

fn default_email_domain() -> String {
    "example.com".to_string()
}

impl Default for CrawlerConfig {
    fn default() -> Self {
        Self {
            oj_base_url: default_oj_base_url(),
            default_password: default_password(),
            accounts_per_crawl: default_accounts_per_crawl(),
            username_prefix: default_username_prefix(),
            email_domain: default_email_domain(),
            captcha_service_url: None,
        }
    }
}

impl CrawlerConfig {
    fn normalize(&mut self) {
        self.oj_base_url = self.oj_base_url.trim().trim_end_matches('/').to_string();
        self.username_prefix = self.username_prefix.trim().to_string();
        self.email_domain = self.email_domain.trim().to_string();
        self.accounts_per_crawl = self.accounts_per_crawl.max(1);

        self.captcha_service_url = self.captcha_service_url.as_ref().map(|s| s.trim().to_string());
        if matches!(self.captcha_service_url.as_deref(), Some(s) if s.is_empty()) {
            self.captcha_service_url = None;
        }
    }
}

fn xdg_config_home() -> anyhow::Result<PathBuf> {
    if let Some(dir) = std::env::var_os("XDG_CONFIG_HOME") {
        let dir = PathBuf::from(dir);
        if dir.as_os_str().is_empty() {
            anyhow::bail!("XDG_CONFIG_HOME is set but empty");
        }
        return Ok(dir);
    }

    let home = std::env::var_os("HOME").ok_or_else(|| anyhow::anyhow!("HOME is not set"))?;
    let home = PathBuf::from(home);
    if home.as_os_str().is_empty() {
        anyhow::bail!("HOME is set but empty");
    }
    Ok(home.join(".config"))
}

pub fn config_path() -> anyhow::Result<PathBuf> {
    Ok(xdg_config_home()?.join("ojc").join("config.json"))
}

pub fn load_config() -> anyhow::Result<Option<CrawlerConfig>> {
    let path = config_path()?;
    if !path.exists() {
        return Ok(None);
    }
    let raw = std::fs::read_to_string(&path)?;
    let mut cfg: CrawlerConfig = serde_json::from_str(&raw)?;
    cfg.normalize();
    Ok(Some(cfg))
}

pub fn save_config(cfg: &CrawlerConfig) -> anyhow::Result<()> {
    let path = config_path()?;
    let dir = path
        .parent()
        .ok_or_else(|| anyhow::anyhow!("invalid config path: {}", path.display()))?;
    std::fs::create_dir_all(dir)?;

    let mut cfg = cfg.clone();
    cfg.normalize();

    let json = serde_json::to_string_pretty(&cfg)?;
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, json)?;
    std::fs::rename(tmp, path)?;
    Ok(())
}
