//! Message and channel-name types carried through the relay
//!
//! A [`Message`] is an opaque payload tagged with the channel it arrived on or
//! is destined for. A [`ChannelName`] is validated once at startup and never
//! changes afterwards.

use bytes::Bytes;
use std::fmt;
use thiserror::Error;

/// Direction a channel is used in. Input channels may be topic filters,
/// output channels must be concrete topic names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelDirection {
    Input,
    Output,
}

impl fmt::Display for ChannelDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChannelDirection::Input => write!(f, "input"),
            ChannelDirection::Output => write!(f, "output"),
        }
    }
}

/// Channel name validation errors
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TopicError {
    #[error("topic cannot be empty")]
    Empty,
    #[error("topic cannot contain NUL characters")]
    ContainsNul,
    #[error("topic exceeds 65535 bytes")]
    TooLong,
    #[error("wildcards are not allowed in a publish topic")]
    WildcardInPublishTopic,
    #[error("'#' must be the last level of a topic filter")]
    MisplacedMultiLevelWildcard,
    #[error("'+' must occupy an entire topic level")]
    MisplacedSingleLevelWildcard,
    #[error("shared subscription must be $share/<group>/<filter>")]
    InvalidSharedSubscription,
}

/// Immutable, validated MQTT channel (topic) name
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ChannelName {
    name: String,
    direction: ChannelDirection,
}

impl ChannelName {
    /// Validate a subscription channel; MQTT `+` and `#` wildcards are allowed
    pub fn input(name: impl Into<String>) -> Result<Self, TopicError> {
        let name = name.into();
        validate_common(&name)?;
        match name.strip_prefix(SHARED_PREFIX) {
            Some(shared) => validate_shared(shared)?,
            None => validate_filter(&name)?,
        }
        Ok(Self {
            name,
            direction: ChannelDirection::Input,
        })
    }

    /// Validate a publish channel; wildcards are rejected
    pub fn output(name: impl Into<String>) -> Result<Self, TopicError> {
        let name = name.into();
        validate_common(&name)?;
        if name.contains(['+', '#']) {
            return Err(TopicError::WildcardInPublishTopic);
        }
        Ok(Self {
            name,
            direction: ChannelDirection::Output,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.name
    }

    pub fn direction(&self) -> ChannelDirection {
        self.direction
    }

    /// `$share/<group>/...` subscription, load-balanced across a group
    pub fn is_shared(&self) -> bool {
        self.name.starts_with(SHARED_PREFIX)
    }

    /// MQTT topic-filter matching of a concrete `topic` against this channel
    pub fn matches(&self, topic: &str) -> bool {
        topic_matches(delivery_filter(&self.name), topic)
    }
}

impl fmt::Display for ChannelName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

impl AsRef<str> for ChannelName {
    fn as_ref(&self) -> &str {
        &self.name
    }
}

fn validate_common(name: &str) -> Result<(), TopicError> {
    if name.is_empty() {
        return Err(TopicError::Empty);
    }
    if name.contains('\0') {
        return Err(TopicError::ContainsNul);
    }
    if name.len() > u16::MAX as usize {
        return Err(TopicError::TooLong);
    }
    Ok(())
}

fn validate_shared(shared: &str) -> Result<(), TopicError> {
    let (group, filter) = shared
        .split_once('/')
        .ok_or(TopicError::InvalidSharedSubscription)?;
    if group.is_empty() || filter.is_empty() || group.contains(['+', '#']) {
        return Err(TopicError::InvalidSharedSubscription);
    }
    validate_filter(filter)
}

fn validate_filter(filter: &str) -> Result<(), TopicError> {
    let levels: Vec<&str> = filter.split('/').collect();
    let last = levels.len() - 1;
    for (i, level) in levels.iter().enumerate() {
        if level.contains('#') && (*level != "#" || i != last) {
            return Err(TopicError::MisplacedMultiLevelWildcard);
        }
        if level.contains('+') && *level != "+" {
            return Err(TopicError::MisplacedSingleLevelWildcard);
        }
    }
    Ok(())
}

const SHARED_PREFIX: &str = "$share/";

/// The filter publishes are delivered under. For `$share/<group>/<filter>`
/// the broker delivers on topics matching `<filter>`.
pub fn delivery_filter(filter: &str) -> &str {
    filter
        .strip_prefix(SHARED_PREFIX)
        .and_then(|shared| shared.split_once('/'))
        .map_or(filter, |(_, inner)| inner)
}

/// Match a concrete topic name against an MQTT topic filter
pub fn topic_matches(filter: &str, topic: &str) -> bool {
    // Filters starting with a wildcard never match system topics
    if topic.starts_with('$') && (filter.starts_with('+') || filter.starts_with('#')) {
        return false;
    }

    let mut filter_levels = filter.split('/');
    let mut topic_levels = topic.split('/');

    loop {
        match (filter_levels.next(), topic_levels.next()) {
            (Some("#"), _) => return true,
            (Some("+"), Some(_)) => continue,
            (Some(f), Some(t)) if f == t => continue,
            (None, None) => return true,
            _ => return false,
        }
    }
}

/// Opaque payload plus the channel it belongs to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    topic: String,
    payload: Bytes,
    retain: bool,
}

impl Message {
    pub fn new(topic: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
            retain: false,
        }
    }

    /// Inbound message as delivered by the broker
    pub fn received(topic: impl Into<String>, payload: impl Into<Bytes>, retain: bool) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
            retain,
        }
    }

    /// Build the outbound message for `output`. The new message owns its own
    /// payload buffer and shares nothing with `self`.
    pub fn derive(&self, output: &ChannelName, payload: Vec<u8>) -> Message {
        Message::new(output.as_str(), payload)
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn payload_bytes(&self) -> Bytes {
        self.payload.clone()
    }

    pub fn is_retained(&self) -> bool {
        self.retain
    }

    pub fn len(&self) -> usize {
        self.payload.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }
}
