use crate::error::LiveError;
use crate::model::RunId;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

/// Broadcast channel name: `sample:<no>`, `run:<id>` or `system`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Topic {
    Sample(String),
    Run(RunId),
    System,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TopicKind {
    Sample,
    Run,
    System,
}

impl TopicKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TopicKind::Sample => "sample",
            TopicKind::Run => "run",
            TopicKind::System => "system",
        }
    }
}

impl Topic {
    pub fn kind(&self) -> TopicKind {
        match self {
            Topic::Sample(_) => TopicKind::Sample,
            Topic::Run(_) => TopicKind::Run,
            Topic::System => TopicKind::System,
        }
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Topic::Sample(sample_no) => write!(f, "sample:{}", sample_no),
            Topic::Run(run_id) => write!(f, "run:{}", run_id),
            Topic::System => f.write_str("system"),
        }
    }
}

impl FromStr for Topic {
    type Err = LiveError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let raw = raw.trim();
        if raw == "system" {
            return Ok(Topic::System);
        }
        let (kind, id) = raw
            .split_once(':')
            .ok_or_else(|| LiveError::UnknownTopic(raw.to_string()))?;
        if id.is_empty() || id.chars().any(char::is_whitespace) {
            return Err(LiveError::UnknownTopic(raw.to_string()));
        }
        match kind {
            "sample" => Ok(Topic::Sample(id.to_string())),
            "run" => id
                .parse::<RunId>()
                .map(Topic::Run)
                .map_err(|_| LiveError::UnknownTopic(raw.to_string())),
            _ => Err(LiveError::UnknownTopic(raw.to_string())),
        }
    }
}

impl Serialize for Topic {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Topic {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_the_three_topic_forms() {
        assert_eq!(
            "sample:S1".parse::<Topic>().expect("sample"),
            Topic::Sample("S1".to_string())
        );
        assert_eq!("run:77".parse::<Topic>().expect("run"), Topic::Run(77));
        assert_eq!("system".parse::<Topic>().expect("system"), Topic::System);
    }

    #[test]
    fn display_round_trips_through_parse() {
        for raw in ["sample:TEST-001", "run:12", "system"] {
            let topic: Topic = raw.parse().expect("parse");
            assert_eq!(topic.to_string(), raw);
        }
    }

    #[test]
    fn rejects_malformed_topics() {
        for raw in ["", "sample:", "run:abc", "plate:1", "sample", "system:1", "sample:a b"] {
            let err = raw.parse::<Topic>().expect_err(raw);
            assert_eq!(err.kind(), "unknown_topic", "for {:?}", raw);
        }
    }

    #[test]
    fn serde_uses_the_string_form() {
        let encoded = serde_json::to_string(&Topic::Run(5)).expect("encode");
        assert_eq!(encoded, "\"run:5\"");
        let bad = serde_json::from_str::<Topic>("\"nope\"");
        assert!(bad.is_err());
    }
}
