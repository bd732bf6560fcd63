use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::FacesError;

/// Where an identity assignment came from.
///
/// The variants are ordered by priority. A lower source may only change a
/// subject that was set by an equal or lower source.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Source {
    #[default]
    Auto,
    Image,
    Manual,
}

impl Source {
    /// Anything above `Auto` is never overwritten by matching.
    pub fn is_authoritative(self) -> bool {
        self > Source::Auto
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Source::Auto => "auto",
            Source::Image => "image",
            Source::Manual => "manual",
        }
    }
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Source {
    type Err = FacesError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "" | "auto" => Ok(Source::Auto),
            "image" => Ok(Source::Image),
            "manual" => Ok(Source::Manual),
            other => Err(FacesError::Data(format!("unknown source {other:?}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn priority_order() {
        assert!(Source::Auto < Source::Image);
        assert!(Source::Image < Source::Manual);
        assert!(!Source::Auto.is_authoritative());
        assert!(Source::Image.is_authoritative());
        assert!(Source::Manual.is_authoritative());
    }

    #[test]
    fn parse_and_display() {
        assert_eq!("Manual".parse::<Source>().unwrap(), Source::Manual);
        assert_eq!("".parse::<Source>().unwrap(), Source::Auto);
        assert!("robot".parse::<Source>().is_err());
        assert_eq!(Source::Image.to_string(), "image");
        assert_eq!(serde_json::to_string(&Source::Manual).unwrap(), "\"manual\"");
    }
}
