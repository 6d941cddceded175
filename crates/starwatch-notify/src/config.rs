//! Channel configuration (YAML) and construction of live channels from it.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use secrecy::SecretString;
use serde::Deserialize;

use crate::{ChannelKind, EmailChannel, FileChannel, NotificationChannel, WebhookChannel};

fn default_enabled() -> bool {
    true
}

fn default_smtp_port() -> u16 {
    587
}

/// One entry of `channels.yaml`. Credentials are referenced by environment variable
/// name, never inlined.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ChannelConfig {
    pub name: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(flatten)]
    pub target: ChannelTarget,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ChannelTarget {
    Email {
        smtp_host: String,
        #[serde(default = "default_smtp_port")]
        smtp_port: u16,
        from: String,
        to: Vec<String>,
        username_env: String,
        password_env: String,
    },
    Webhook {
        url_env: String,
    },
    File {
        path: PathBuf,
    },
}

impl ChannelTarget {
    pub fn kind(&self) -> ChannelKind {
        match self {
            Self::Email { .. } => ChannelKind::Email,
            Self::Webhook { .. } => ChannelKind::Webhook,
            Self::File { .. } => ChannelKind::File,
        }
    }
}

#[derive(Debug, Deserialize)]
struct ChannelsFile {
    #[serde(default)]
    channels: Vec<ChannelConfig>,
}

pub fn parse_channel_configs(text: &str) -> anyhow::Result<Vec<ChannelConfig>> {
    let file: ChannelsFile = serde_yaml::from_str(text).context("parsing channel config")?;
    let mut seen = std::collections::BTreeSet::new();
    for channel in &file.channels {
        anyhow::ensure!(
            seen.insert(channel.name.as_str()),
            "duplicate channel name {:?}",
            channel.name
        );
    }
    Ok(file.channels)
}

/// Missing file means no channels.
pub fn load_channel_configs(path: impl AsRef<Path>) -> anyhow::Result<Vec<ChannelConfig>> {
    let path = path.as_ref();
    if !path.exists() {
        return Ok(Vec::new());
    }
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading {}", path.display()))?;
    parse_channel_configs(&text).with_context(|| format!("loading {}", path.display()))
}

/// A configured channel paired with its live transport, or the reason it could not be built.
#[derive(Clone)]
pub struct ConfiguredChannel {
    pub name: String,
    pub kind: ChannelKind,
    pub enabled: bool,
    pub transport: Result<Arc<dyn NotificationChannel>, String>,
}

impl std::fmt::Debug for ConfiguredChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConfiguredChannel")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("enabled", &self.enabled)
            .field("ready", &self.transport.is_ok())
            .finish()
    }
}

fn required_env(lookup: &dyn Fn(&str) -> Option<String>, var: &str) -> Result<String, String> {
    lookup(var)
        .filter(|v| !v.is_empty())
        .ok_or_else(|| format!("env var {var} is not set"))
}

impl ChannelConfig {
    /// Build the live channel, resolving credential references through `lookup`.
    pub fn build(
        &self,
        timeout: Duration,
        lookup: &dyn Fn(&str) -> Option<String>,
    ) -> Result<Arc<dyn NotificationChannel>, String> {
        match &self.target {
            ChannelTarget::Email {
                smtp_host,
                smtp_port,
                from,
                to,
                username_env,
                password_env,
            } => {
                let username = required_env(lookup, username_env)?;
                let password = SecretString::new(required_env(lookup, password_env)?);
                let channel =
                    EmailChannel::new(smtp_host, *smtp_port, from, to, username, password, timeout)?;
                Ok(Arc::new(channel))
            }
            ChannelTarget::Webhook { url_env } => {
                let url = SecretString::new(required_env(lookup, url_env)?);
                Ok(Arc::new(WebhookChannel::new(url, timeout)?))
            }
            ChannelTarget::File { path } => Ok(Arc::new(FileChannel::new(path.clone()))),
        }
    }
}

/// Disabled channels are not built, so their credentials need not be present.
pub fn build_channels(
    configs: &[ChannelConfig],
    timeout: Duration,
    lookup: &dyn Fn(&str) -> Option<String>,
) -> Vec<ConfiguredChannel> {
    configs
        .iter()
        .map(|config| ConfiguredChannel {
            name: config.name.clone(),
            kind: config.target.kind(),
            enabled: config.enabled,
            transport: if config.enabled {
                config.build(timeout, lookup)
            } else {
                Err("channel disabled".to_string())
            },
        })
        .collect()
}
