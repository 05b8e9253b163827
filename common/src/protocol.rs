//! Protocol definition for mood detection and the song list.
//!
use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};

/// Emoji shown for a mood label that has no dedicated one.
pub const FALLBACK_EMOJI: &str = "🙂";

/// Facial expressions a mood can be derived from.
#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Expression {
    Neutral,
    Happy,
    Sad,
    Angry,
    Fearful,
    Disgusted,
    Surprised,
}

impl Expression {
    /// All expressions in scoring order.
    pub const ALL: [Expression; 7] = [
        Expression::Neutral,
        Expression::Happy,
        Expression::Sad,
        Expression::Angry,
        Expression::Fearful,
        Expression::Disgusted,
        Expression::Surprised,
    ];

    /// Label used on the wire, e.g. in `/songs?mood=happy`.
    pub fn label(&self) -> &'static str {
        match self {
            Expression::Neutral => "neutral",
            Expression::Happy => "happy",
            Expression::Sad => "sad",
            Expression::Angry => "angry",
            Expression::Fearful => "fearful",
            Expression::Disgusted => "disgusted",
            Expression::Surprised => "surprised",
        }
    }

    pub fn emoji(&self) -> &'static str {
        match self {
            Expression::Neutral => "😐",
            Expression::Happy => "😄",
            Expression::Sad => "😢",
            Expression::Angry => "😠",
            Expression::Fearful => "😨",
            Expression::Disgusted => "🤢",
            Expression::Surprised => "😲",
        }
    }

    fn index(&self) -> usize {
        *self as usize
    }
}

impl fmt::Display for Expression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Error for labels outside of the known expression set.
#[derive(Debug, Eq, PartialEq)]
pub struct UnknownExpression(pub String);

impl fmt::Display for UnknownExpression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown expression label {:?}", self.0)
    }
}

impl std::error::Error for UnknownExpression {}

impl FromStr for Expression {
    type Err = UnknownExpression;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Expression::ALL
            .into_iter()
            .find(|expression| expression.label() == s)
            .ok_or_else(|| UnknownExpression(s.to_owned()))
    }
}

/// Emoji for an arbitrary mood label.
pub fn emoji_for_label(label: &str) -> &'static str {
    label
        .parse::<Expression>()
        .map(|expression| expression.emoji())
        .unwrap_or(FALLBACK_EMOJI)
}

/// Probabilities of every expression for one face in one frame.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ExpressionScores([f32; 7]);

impl ExpressionScores {
    pub fn new(scores: [f32; 7]) -> Self {
        Self(scores)
    }

    pub fn get(&self, expression: Expression) -> f32 {
        self.0[expression.index()]
    }

    pub fn set(&mut self, expression: Expression, score: f32) {
        self.0[expression.index()] = score;
    }

    /// Iterate over `(expression, score)` pairs in scoring order.
    pub fn iter(&self) -> impl Iterator<Item = (Expression, f32)> + '_ {
        Expression::ALL.into_iter().zip(self.0.iter().copied())
    }

    /// Expression with the highest probability.
    ///
    /// Scores are scanned in [`Expression::ALL`] order and a later expression
    /// only wins when it is strictly greater, so ties go to the earlier one.
    /// `None` if no score is above zero.
    pub fn dominant(&self) -> Option<Expression> {
        let mut best: Option<(Expression, f32)> = None;
        for (expression, score) in self.iter() {
            let current = best.map(|(_, s)| s).unwrap_or(0.0);
            if score > current {
                best = Some((expression, score));
            }
        }
        best.map(|(expression, _)| expression)
    }
}

impl Serialize for ExpressionScores {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        use serde::ser::SerializeMap;

        let mut map = serializer.serialize_map(Some(self.0.len()))?;
        for (expression, score) in self.iter() {
            map.serialize_entry(expression.label(), &score)?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for ExpressionScores {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let map = std::collections::HashMap::<Expression, f32>::deserialize(deserializer)?;
        let mut scores = ExpressionScores::default();
        for (expression, score) in map {
            scores.set(expression, score);
        }
        Ok(scores)
    }
}

/// Song as delivered by the songs backend.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct Song {
    pub title: String,
    pub artist: String,
    /// URL of the audio resource.
    pub audio: String,
}

/// Body of `GET /songs?mood=<label>`.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct SongsResponse {
    pub songs: Vec<Song>,
}

/// Result of a successful mood detection.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct DetectReport {
    pub mood: Expression,
    pub emoji: String,
    pub scores: ExpressionScores,
    pub songs: Vec<Song>,
}

/// Song list together with the index of the song currently playing.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct SongsView {
    pub songs: Vec<Song>,
    pub playing: Option<usize>,
}

/// Detection state as shown next to the video.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct StatusView {
    pub loading: bool,
    pub mood: Option<Expression>,
    pub error: Option<String>,
}

/// Error body returned by the HTTP endpoints.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct ErrorBody {
    pub error: String,
}
