//! Common types shared across the governance engine.
use std::fmt;
use std::iter::repeat_with;
use std::str::FromStr;

use localtime::LocalTime;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Timestamp used across all entities. UTC, millisecond precision.
pub type Timestamp = LocalTime;

/// Generate an opaque entity identifier.
pub fn id() -> String {
    let mut rng = fastrand::Rng::new();
    hex::encode(repeat_with(|| rng.u8(..)).take(16).collect::<Vec<u8>>())
}

/// Generate a high-entropy token, eg. for refresh sessions and public links.
pub fn token() -> String {
    let mut rng = fastrand::Rng::new();
    hex::encode(repeat_with(|| rng.u8(..)).take(32).collect::<Vec<u8>>())
}

/// Derive a URL- and ref-safe slug from a human-readable name.
///
/// Lowercases, collapses any run of non-alphanumeric characters into a
/// single `-`, and trims leading and trailing dashes.
pub fn slug(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut dash = true;

    for c in input.chars() {
        if c.is_ascii_alphanumeric() {
            out.extend(c.to_lowercase());
            dash = false;
        } else if !dash {
            out.push('-');
            dash = true;
        }
    }
    while out.ends_with('-') {
        out.pop();
    }
    if out.is_empty() {
        out.push_str("untitled");
    }
    out
}

#[derive(Error, Debug)]
pub enum ReactionError {
    #[error("invalid reaction")]
    InvalidReaction,
}

/// An emoji reaction on a thread.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Reaction {
    emoji: char,
}

impl Reaction {
    /// Create a new reaction from an emoji.
    pub fn new(emoji: char) -> Result<Self, ReactionError> {
        let val = emoji as u32;
        let emoticons = 0x1F600..=0x1F64F;
        let misc = 0x1F300..=0x1F5FF; // Miscellaneous Symbols and Pictographs
        let dingbats = 0x2700..=0x27BF;
        let supp = 0x1F900..=0x1F9FF; // Supplemental Symbols and Pictographs
        let transport = 0x1F680..=0x1F6FF;

        if emoticons.contains(&val)
            || misc.contains(&val)
            || dingbats.contains(&val)
            || supp.contains(&val)
            || transport.contains(&val)
        {
            Ok(Self { emoji })
        } else {
            Err(ReactionError::InvalidReaction)
        }
    }

    /// Get the reaction emoji.
    pub fn emoji(&self) -> char {
        self.emoji
    }
}

impl fmt::Display for Reaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.emoji)
    }
}

impl FromStr for Reaction {
    type Err = ReactionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut chars = s.chars();
        let emoji = chars.next().ok_or(ReactionError::InvalidReaction)?;
        if chars.next().is_some() {
            return Err(ReactionError::InvalidReaction);
        }
        Self::new(emoji)
    }
}
