//! Channel registry and attribution for applicant events.
//!
//! Every applicant event carries three weak signals about where it came
//! from: the sender address of the notification mail, the mail text
//! itself, and whatever raw channel identifier the source stored.
//! [`ChannelResolver`] runs those signals as an ordered cascade and
//! always produces a canonical [`Channel`], falling back to the
//! `Direct` sentinel when nothing matches.

use std::collections::BTreeMap;
use std::path::Path;

use oubo_core::{Channel, RawEvent, DIRECT_KEY};
use regex::Regex;
use serde::Deserialize;
use thiserror::Error;
use tracing::debug;

pub const CRATE_NAME: &str = "oubo-channel";

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("failed to read channel overlay {path}: {source}")]
    OverlayRead {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse channel overlay {path}: {source}")]
    OverlayParse {
        path: String,
        #[source]
        source: serde_yaml::Error,
    },
}

/// Presentation metadata for one known channel.
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelDef {
    pub key: Channel,
    pub label: String,
    pub icon: String,
}

/// Optional on-disk overlay extending the built-in registry.
#[derive(Debug, Clone, Deserialize, Default)]
struct OverlayFile {
    #[serde(default)]
    aliases: BTreeMap<String, String>,
    #[serde(default)]
    channels: Vec<OverlayChannel>,
}

#[derive(Debug, Clone, Deserialize)]
struct OverlayChannel {
    key: String,
    #[serde(default)]
    label: Option<String>,
    #[serde(default)]
    icon: Option<String>,
}

/// The closed set of known channels plus their aliases.
///
/// The built-in set matches the boards the product actually integrates
/// with; deployments add aliases via a YAML overlay rather than a code
/// change.
#[derive(Debug, Clone)]
pub struct ChannelRegistry {
    defs: Vec<ChannelDef>,
    aliases: BTreeMap<String, String>,
}

const BUILTIN_CHANNELS: &[(&str, &str, &str)] = &[
    ("採用係長", "採用係長", "/site_saiyokakaricho.png"),
    ("AirWork", "AirWork", "/site_airwork.png"),
    ("Engage", "エンゲージ", "/site_engage.png"),
    ("Indeed", "indeed", "/site_indeed.png"),
    ("求人BOX", "求人ボックス", "/site_kyujinbox.png"),
    ("はたらきんぐ", "はたらきんぐ", "/site_hataraking.png"),
    ("げんきワーク", "げんきワーク", "/site_genkiwork.png"),
    ("ハローワーク", "ハローワーク", "/site_hellowork.png"),
    ("ジモティー", "ジモティー", "/site_jmty.png"),
    (DIRECT_KEY, DIRECT_KEY, "/site_direct.png"),
];

const BUILTIN_ALIASES: &[(&str, &str)] = &[
    ("求人ボックス", "求人BOX"),
    ("エンゲージ", "Engage"),
    ("ジモティ", "ジモティー"),
    ("indeed", "Indeed"),
    ("airwork", "AirWork"),
    ("air-work", "AirWork"),
    ("engage", "Engage"),
];

impl Default for ChannelRegistry {
    fn default() -> Self {
        Self::builtin()
    }
}

impl ChannelRegistry {
    pub fn builtin() -> Self {
        let defs = BUILTIN_CHANNELS
            .iter()
            .map(|(key, label, icon)| ChannelDef {
                key: Channel::new(*key),
                label: (*label).to_string(),
                icon: (*icon).to_string(),
            })
            .collect();
        let aliases = BUILTIN_ALIASES
            .iter()
            .map(|(a, k)| ((*a).to_string(), (*k).to_string()))
            .collect();
        Self { defs, aliases }
    }

    /// Builtin registry extended with aliases and channels from a YAML
    /// overlay file. A missing file is not an error; the builtin set is
    /// a complete registry on its own.
    pub fn with_overlay(path: impl AsRef<Path>) -> Result<Self, ChannelError> {
        let path = path.as_ref();
        let mut registry = Self::builtin();
        if !path.exists() {
            debug!(path = %path.display(), "no channel overlay, using builtin registry");
            return Ok(registry);
        }
        let raw = std::fs::read_to_string(path).map_err(|source| ChannelError::OverlayRead {
            path: path.display().to_string(),
            source,
        })?;
        let overlay: OverlayFile =
            serde_yaml::from_str(&raw).map_err(|source| ChannelError::OverlayParse {
                path: path.display().to_string(),
                source,
            })?;
        for ch in overlay.channels {
            if registry.defs.iter().any(|d| d.key.as_str() == ch.key) {
                continue;
            }
            registry.defs.push(ChannelDef {
                key: Channel::new(ch.key.clone()),
                label: ch.label.unwrap_or_else(|| ch.key.clone()),
                icon: ch.icon.unwrap_or_default(),
            });
        }
        for (alias, key) in overlay.aliases {
            registry.aliases.insert(alias, key);
        }
        debug!(
            channels = registry.defs.len(),
            aliases = registry.aliases.len(),
            "loaded channel overlay"
        );
        Ok(registry)
    }

    /// Known channels in fixed display order, `Direct` last.
    pub fn display_order(&self) -> impl Iterator<Item = &ChannelDef> {
        self.defs.iter()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.defs.iter().any(|d| d.key.as_str() == key)
    }

    /// Display label for a channel; unknown keys label as themselves.
    pub fn label(&self, channel: &Channel) -> String {
        self.defs
            .iter()
            .find(|d| d.key == *channel)
            .map(|d| d.label.clone())
            .unwrap_or_else(|| channel.as_str().to_string())
    }

    pub fn icon(&self, channel: &Channel) -> Option<&str> {
        self.defs
            .iter()
            .find(|d| d.key == *channel)
            .map(|d| d.icon.as_str())
    }

    /// Map any raw channel string onto a canonical key.
    ///
    /// Idempotent: a canonical key always maps to itself. Unknown
    /// non-empty values pass through unchanged so that a new board
    /// showing up in the data is visible instead of silently folded
    /// into `Direct`.
    pub fn canonicalize(&self, raw: &str) -> Channel {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Channel::direct();
        }
        if let Some(key) = self.aliases.get(trimmed) {
            return Channel::new(key.clone());
        }
        let low = trimmed.to_lowercase();
        if matches!(low.as_str(), "direct" | "unknown" | "undefined" | "null") {
            return Channel::direct();
        }
        if let Some(key) = self.aliases.get(low.as_str()) {
            return Channel::new(key.clone());
        }
        Channel::new(trimmed)
    }
}

/// The textual signals of one event, as seen by an inference rule.
#[derive(Debug, Clone, Copy)]
pub struct MessageView<'a> {
    pub subject: &'a str,
    pub snippet: &'a str,
    pub from_address: &'a str,
}

impl<'a> MessageView<'a> {
    pub fn of(event: &'a RawEvent) -> Self {
        Self {
            subject: &event.subject,
            snippet: event.snippet.as_deref().unwrap_or(""),
            from_address: &event.from_address,
        }
    }
}

/// One stage of the attribution cascade. Returns `None` when the rule
/// has no opinion about the message.
pub trait InferenceRule: Send + Sync {
    fn name(&self) -> &'static str;
    fn infer(&self, msg: MessageView<'_>) -> Option<Channel>;
}

/// Attributes by the sender domain of the notification mail. This is
/// the strongest signal: boards send from their own domains.
pub struct SenderDomainRule {
    address_re: Regex,
}

impl Default for SenderDomainRule {
    fn default() -> Self {
        Self::new()
    }
}

impl SenderDomainRule {
    pub fn new() -> Self {
        Self {
            // Loose on purpose: display-name junk around the address is
            // common in harvested From headers.
            address_re: Regex::new(r"[a-z0-9._%+\-]+@([a-z0-9.\-]+\.[a-z]{2,})")
                .expect("static pattern compiles"),
        }
    }

    fn domain_of(&self, from: &str) -> Option<String> {
        // Prefer the bracketed address when the header carries a
        // display name, e.g. `求人ボックス <no-reply@kyujinbox.com>`.
        let inner = match (from.find('<'), from.rfind('>')) {
            (Some(open), Some(close)) if open < close => &from[open + 1..close],
            _ => from,
        };
        let low = inner.trim().to_lowercase();
        self.address_re
            .captures(&low)
            .and_then(|c| c.get(1))
            .map(|m| m.as_str().to_string())
    }
}

impl InferenceRule for SenderDomainRule {
    fn name(&self) -> &'static str {
        "sender_domain"
    }

    fn infer(&self, msg: MessageView<'_>) -> Option<Channel> {
        // Jimoty relays through shared infrastructure, so the subject
        // brand marker outranks the sender domain for it.
        if msg.subject.contains("ジモティ") {
            return Some(Channel::new("ジモティー"));
        }
        let domain = self.domain_of(msg.from_address)?;
        let key = if domain == "jmty.jp" || domain.ends_with(".jmty.jp") {
            "ジモティー"
        } else if domain == "indeedemail.com" {
            "Indeed"
        } else if domain == "airwork.net" || domain.ends_with(".airwork.net") {
            "AirWork"
        } else if domain == "saiyo-kakaricho.com" {
            "採用係長"
        } else if domain == "en-gage.net" {
            "Engage"
        } else if domain == "hellowork.mhlw.go.jp" || domain.ends_with(".hellowork.mhlw.go.jp") {
            "ハローワーク"
        } else {
            return None;
        };
        Some(Channel::new(key))
    }
}

/// Attributes by brand markers anywhere in the subject, snippet or
/// sender text. Patterns are checked in priority order; specific brands
/// come before generic substrings that would shadow them.
pub struct ContentPatternRule {
    patterns: Vec<(Regex, &'static str)>,
}

const CONTENT_PATTERNS: &[(&str, &str)] = &[
    (r"saiyo-kakaricho\.com|採用係長", "採用係長"),
    (r"en-gage\.net|en-gage|engage|エンゲージ", "Engage"),
    (r"jmty|jimoty|ジモティ", "ジモティー"),
    (r"hellowork|ハローワーク|mhlw", "ハローワーク"),
    (r"kyujinbox|求人box|求人ボックス", "求人BOX"),
    (r"airwork|air-work", "AirWork"),
    (r"indeed", "Indeed"),
];

impl Default for ContentPatternRule {
    fn default() -> Self {
        Self::new()
    }
}

impl ContentPatternRule {
    pub fn new() -> Self {
        let patterns = CONTENT_PATTERNS
            .iter()
            .map(|(pat, key)| {
                let re = Regex::new(pat).expect("static pattern compiles");
                (re, *key)
            })
            .collect();
        Self { patterns }
    }
}

impl InferenceRule for ContentPatternRule {
    fn name(&self) -> &'static str {
        "content_pattern"
    }

    fn infer(&self, msg: MessageView<'_>) -> Option<Channel> {
        let haystack =
            format!("{} {} {}", msg.subject, msg.snippet, msg.from_address).to_lowercase();
        for (re, key) in &self.patterns {
            if re.is_match(&haystack) {
                return Some(Channel::new(*key));
            }
        }
        None
    }
}

/// Resolves every event to exactly one canonical channel.
///
/// The cascade is ordered strongest signal first and short-circuits on
/// the first confident answer:
///
/// 1. sender domain of the notification mail
/// 2. brand markers in the mail text
/// 3. the stored raw channel identifier, canonicalized
///
/// When all three stay silent the event is `Direct`.
pub struct ChannelResolver {
    registry: ChannelRegistry,
    rules: Vec<Box<dyn InferenceRule>>,
}

impl ChannelResolver {
    pub fn new(registry: ChannelRegistry) -> Self {
        let rules: Vec<Box<dyn InferenceRule>> = vec![
            Box::new(SenderDomainRule::new()),
            Box::new(ContentPatternRule::new()),
        ];
        Self { registry, rules }
    }

    pub fn registry(&self) -> &ChannelRegistry {
        &self.registry
    }

    pub fn resolve(&self, event: &RawEvent) -> Channel {
        let msg = MessageView::of(event);
        for rule in &self.rules {
            if let Some(channel) = rule.infer(msg) {
                debug!(rule = rule.name(), channel = %channel, event = %event.id, "attributed");
                return channel;
            }
        }
        self.registry.canonicalize(&event.channel_hint)
    }
}

impl Default for ChannelResolver {
    fn default() -> Self {
        Self::new(ChannelRegistry::builtin())
    }
}
