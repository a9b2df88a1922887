use std::{error::Error, fmt::Display, num::ParseFloatError, ops::Range, str::FromStr};

use serde::{Deserialize, Serialize};

/// An inclusive retention time interval used to restrict the input features
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RtRange {
    pub start: f64,
    pub end: f64,
}

impl RtRange {
    pub fn new(start: f64, end: f64) -> Self {
        Self { start, end }
    }

    pub fn contains(&self, rt: f64) -> bool {
        self.start <= rt && rt <= self.end
    }
}

impl Default for RtRange {
    fn default() -> Self {
        Self {
            start: 0.0,
            end: f64::INFINITY,
        }
    }
}

impl Display for RtRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}-{}", self.start, self.end)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum RtRangeParseError {
    MalformedStart(ParseFloatError),
    MalformedEnd(ParseFloatError),
}

impl Display for RtRangeParseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RtRangeParseError::MalformedStart(e) => {
                write!(f, "Failed to parse retention time range start {e}")
            }
            RtRangeParseError::MalformedEnd(e) => {
                write!(f, "Failed to parse retention time range end {e}")
            }
        }
    }
}

impl Error for RtRangeParseError {}

impl FromStr for RtRange {
    type Err = RtRangeParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let mut tokens = if s.contains(' ') {
            s.split(' ')
        } else if s.contains(':') {
            s.split(':')
        } else {
            s.split('-')
        };
        let start = match tokens.next().unwrap_or_default() {
            "" => 0.0,
            start_s => start_s.parse().map_err(RtRangeParseError::MalformedStart)?,
        };
        let end = match tokens.next().unwrap_or_default() {
            "" => f64::INFINITY,
            end_s => end_s.parse().map_err(RtRangeParseError::MalformedEnd)?,
        };
        Ok(RtRange { start, end })
    }
}

impl TryFrom<String> for RtRange {
    type Error = RtRangeParseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<RtRange> for String {
    fn from(value: RtRange) -> Self {
        value.to_string()
    }
}

impl From<Range<f64>> for RtRange {
    fn from(value: Range<f64>) -> Self {
        Self::new(value.start, value.end)
    }
}

impl From<(f64, f64)> for RtRange {
    fn from(value: (f64, f64)) -> Self {
        Self::new(value.0, value.1)
    }
}
