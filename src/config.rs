use anyhow::{Context, Result};
use serde::Deserialize;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// File được đọc tự động nếu nằm trong working dir.
pub const DEFAULT_CONFIG_FILE: &str = "bulksign.yaml";

const DEFAULT_TOOL_PATH: &str =
    r"C:\Program Files (x86)\Windows Kits\10\bin\10.0.26100.0\x64\signtool.exe";

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct Endpoint {
    pub url: String,
    pub name: String,
}

impl Endpoint {
    fn new(url: &str, name: &str) -> Self {
        Endpoint {
            url: url.to_string(),
            name: name.to_string(),
        }
    }
}

/// Files of `extension` are only picked up when their name starts with `prefix`.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct NameFilter {
    pub extension: String,
    pub prefix: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CredentialCheck {
    pub enabled: bool,
    pub program: String,
    /// `{thumbprint}` is substituted
    pub args: Vec<String>,
}

impl Default for CredentialCheck {
    fn default() -> Self {
        CredentialCheck {
            enabled: true,
            program: "certutil".to_string(),
            args: vec![
                "-user".to_string(),
                "-verifystore".to_string(),
                "My".to_string(),
                "{thumbprint}".to_string(),
            ],
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SignConfig {
    pub tool_path: PathBuf,
    pub thumbprint: String,
    pub digest: String,
    pub log_file: PathBuf,
    pub sign_timeout_secs: u64,
    pub verify_timeout_secs: u64,
    pub worker_multiplier: usize,
    pub endpoints: Vec<Endpoint>,
    pub default_extensions: Vec<String>,
    pub name_filters: Vec<NameFilter>,
    pub search_extensions: Vec<String>,
    pub credential_check: CredentialCheck,
}

impl Default for SignConfig {
    fn default() -> Self {
        SignConfig {
            tool_path: PathBuf::from(DEFAULT_TOOL_PATH),
            thumbprint: String::new(),
            digest: "SHA256".to_string(),
            log_file: PathBuf::from("signing_log.txt"),
            sign_timeout_secs: 60,
            verify_timeout_secs: 10,
            worker_multiplier: 2,
            endpoints: vec![
                Endpoint::new("http://timestamp.digicert.com", "Digicert (Primary)"),
                Endpoint::new("http://timestamp.sectigo.com", "Sectigo"),
                Endpoint::new("http://rfc3161timestamp.globalsign.com/advanced", "GlobalSign"),
                Endpoint::new("http://timestamp.comodoca.com/rfc3161", "Comodo"),
            ],
            default_extensions: vec![".exe".to_string(), ".dll".to_string()],
            name_filters: vec![NameFilter {
                extension: ".dll".to_string(),
                prefix: "MPTS".to_string(),
            }],
            search_extensions: [".exe", ".dll", ".msi", ".sys", ".ocx", ".cab", ".cat"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            credential_check: CredentialCheck::default(),
        }
    }
}

impl SignConfig {
    pub fn sign_timeout(&self) -> Duration {
        Duration::from_secs(self.sign_timeout_secs)
    }

    pub fn verify_timeout(&self) -> Duration {
        Duration::from_secs(self.verify_timeout_secs)
    }

    /// Chuẩn hoá ext về dạng ".xxx" lowercase, bỏ endpoint rỗng.
    fn normalize(mut self) -> Self {
        self.default_extensions = self.default_extensions.iter().map(|e| normalize_extension(e)).collect();
        self.search_extensions = self.search_extensions.iter().map(|e| normalize_extension(e)).collect();
        for f in &mut self.name_filters {
            f.extension = normalize_extension(&f.extension);
        }
        self.endpoints.retain(|e| !e.url.trim().is_empty());
        self.worker_multiplier = self.worker_multiplier.max(1);
        self
    }
}

/// "EXE", "exe", ".exe" => ".exe"
pub fn normalize_extension(raw: &str) -> String {
    let t = raw.trim().to_lowercase();
    if t.starts_with('.') { t } else { format!(".{t}") }
}

/// Explicit path must exist; the default file is optional.
pub fn load_config(explicit: Option<&Path>) -> Result<SignConfig> {
    let path = match explicit {
        Some(p) => p.to_path_buf(),
        None => {
            let p = PathBuf::from(DEFAULT_CONFIG_FILE);
            if !p.exists() {
                return Ok(SignConfig::default().normalize());
            }
            p
        }
    };

    let file = File::open(&path).with_context(|| format!("open config {}", path.display()))?;
    let cfg: SignConfig = serde_yaml::from_reader(file)
        .with_context(|| format!("parse config {}", path.display()))?;
    Ok(cfg.normalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn normalize_extension_forms() {
        assert_eq!(normalize_extension("EXE"), ".exe");
        assert_eq!(normalize_extension(" .Dll "), ".dll");
        assert_eq!(normalize_extension("msi"), ".msi");
    }

    #[test]
    fn partial_yaml_keeps_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cfg.yaml");
        let mut f = File::create(&path).unwrap();
        writeln!(f, "thumbprint: ABC123").unwrap();
        writeln!(f, "worker_multiplier: 0").unwrap();
        writeln!(f, "name_filters:").unwrap();
        writeln!(f, "  - extension: SYS").unwrap();
        writeln!(f, "    prefix: drv").unwrap();
        drop(f);

        let cfg = load_config(Some(&path)).unwrap();
        assert_eq!(cfg.thumbprint, "ABC123");
        assert_eq!(cfg.worker_multiplier, 1);
        assert_eq!(cfg.endpoints.len(), 4);
        assert_eq!(cfg.endpoints[0].name, "Digicert (Primary)");
        assert_eq!(
            cfg.name_filters,
            vec![NameFilter {
                extension: ".sys".to_string(),
                prefix: "drv".to_string()
            }]
        );
        assert_eq!(cfg.sign_timeout(), Duration::from_secs(60));
    }

    #[test]
    fn missing_explicit_config_is_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(load_config(Some(&dir.path().join("nope.yaml"))).is_err());
    }
}
