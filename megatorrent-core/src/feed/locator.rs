//! Content locators carried in feed record payloads.
//!
//! A payload is UTF-8 text holding either a magnet URI with a
//! `xt=urn:btih:<40 hex>` topic or a bare 40-hex info hash.

use std::fmt;

use serde::{Deserialize, Serialize};
use url::Url;

use super::InfoHash;

const BTIH_PREFIX: &str = "urn:btih:";

/// Error returned when a payload does not name any content.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Invalid content locator: {reason}")]
pub struct InvalidLocator {
    pub reason: String,
}

impl InvalidLocator {
    fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

/// Verified pointer to content the transfer subsystem can fetch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ContentLocator {
    raw: String,
    info_hash: InfoHash,
    display_name: Option<String>,
}

impl ContentLocator {
    /// Parses a record payload into a locator.
    ///
    /// # Errors
    ///
    /// - `InvalidLocator` - Payload is not UTF-8, not a magnet URI with a BitTorrent topic, or not a 40-hex hash
    pub fn parse(payload: &[u8]) -> Result<Self, InvalidLocator> {
        let text = std::str::from_utf8(payload)
            .map_err(|_| InvalidLocator::new("payload is not UTF-8"))?
            .trim();

        if text.is_empty() {
            return Err(InvalidLocator::new("payload is empty"));
        }

        if text
            .get(..7)
            .is_some_and(|scheme| scheme.eq_ignore_ascii_case("magnet:"))
        {
            return Self::parse_magnet(text);
        }

        let info_hash = parse_hex_hash(text)?;
        Ok(Self {
            raw: text.to_ascii_lowercase(),
            info_hash,
            display_name: None,
        })
    }

    fn parse_magnet(text: &str) -> Result<Self, InvalidLocator> {
        let url = Url::parse(text).map_err(|e| InvalidLocator::new(e.to_string()))?;

        let mut info_hash = None;
        let mut display_name = None;
        for (key, value) in url.query_pairs() {
            match key.as_ref() {
                "xt" if info_hash.is_none() => {
                    if let Some(hash) = value
                        .get(..BTIH_PREFIX.len())
                        .filter(|prefix| prefix.eq_ignore_ascii_case(BTIH_PREFIX))
                        .map(|_| &value[BTIH_PREFIX.len()..])
                    {
                        info_hash = Some(parse_hex_hash(hash)?);
                    }
                }
                "dn" => display_name = Some(value.into_owned()),
                _ => {}
            }
        }

        let info_hash =
            info_hash.ok_or_else(|| InvalidLocator::new("magnet URI has no btih topic"))?;
        Ok(Self {
            raw: text.to_string(),
            info_hash,
            display_name,
        })
    }

    /// Returns the info hash this locator points at.
    pub fn info_hash(&self) -> InfoHash {
        self.info_hash
    }

    /// Display name from a magnet `dn` parameter, if any.
    pub fn display_name(&self) -> Option<&str> {
        self.display_name.as_deref()
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// Magnet URI suitable for handing to a torrent client.
    pub fn to_magnet(&self) -> String {
        if self.raw.starts_with("magnet:") {
            self.raw.clone()
        } else {
            format!("magnet:?xt={BTIH_PREFIX}{}", self.info_hash)
        }
    }
}

fn parse_hex_hash(text: &str) -> Result<InfoHash, InvalidLocator> {
    if text.len() != 40 {
        return Err(InvalidLocator::new(format!(
            "info hash must be 40 hex characters, got {}",
            text.len()
        )));
    }
    let mut bytes = [0u8; 20];
    hex::decode_to_slice(text, &mut bytes).map_err(|e| InvalidLocator::new(e.to_string()))?;
    Ok(InfoHash::new(bytes))
}

impl fmt::Display for ContentLocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

impl TryFrom<String> for ContentLocator {
    type Error = InvalidLocator;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(value.as_bytes())
    }
}

impl From<ContentLocator> for String {
    fn from(locator: ContentLocator) -> Self {
        locator.raw
    }
}
