//! Glob-style channel patterns for pub/sub subscriptions.
//!
//! Follows the subset of Redis `PSUBSCRIBE` syntax the coordination layer
//! uses:
//! - `*` matches any run of characters, including none
//! - `?` matches exactly one character
//! - `\x` matches the literal character `x`

use super::EphemeralStoreError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Token {
    Literal(char),
    AnyOne,
    AnyRun,
}

/// A parsed channel pattern.
///
/// # Examples
///
/// ```
/// use cwmp_coord::api::pattern::ChannelPattern;
///
/// let pattern = ChannelPattern::new("inform:*").unwrap();
/// assert!(pattern.matches("inform:0011AA-Router-SN1"));
/// assert!(!pattern.matches("diagnostic:0011AA-Router-SN1"));
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelPattern {
    tokens: Vec<Token>,
    original: String,
}

impl ChannelPattern {
    pub fn new(pattern: impl Into<String>) -> Result<Self, EphemeralStoreError> {
        let original = pattern.into();
        let tokens = Self::parse(&original)?;
        Ok(Self { tokens, original })
    }

    pub fn as_str(&self) -> &str {
        &self.original
    }

    /// Check whether `channel` matches this pattern.
    pub fn matches(&self, channel: &str) -> bool {
        let chars: Vec<char> = channel.chars().collect();
        Self::matches_from(&self.tokens, &chars)
    }

    fn parse(pattern: &str) -> Result<Vec<Token>, EphemeralStoreError> {
        if pattern.is_empty() {
            return Err(EphemeralStoreError::InvalidPattern {
                pattern: pattern.to_string(),
                reason: "pattern cannot be empty".to_string(),
            });
        }

        let mut tokens = Vec::with_capacity(pattern.len());
        let mut chars = pattern.chars();
        while let Some(ch) = chars.next() {
            let token = match ch {
                '*' => {
                    // Consecutive runs collapse into one.
                    if tokens.last() == Some(&Token::AnyRun) {
                        continue;
                    }
                    Token::AnyRun
                }
                '?' => Token::AnyOne,
                '\\' => match chars.next() {
                    Some(escaped) => Token::Literal(escaped),
                    None => {
                        return Err(EphemeralStoreError::InvalidPattern {
                            pattern: pattern.to_string(),
                            reason: "trailing escape character".to_string(),
                        });
                    }
                },
                other => Token::Literal(other),
            };
            tokens.push(token);
        }
        Ok(tokens)
    }

    fn matches_from(tokens: &[Token], input: &[char]) -> bool {
        match tokens.split_first() {
            None => input.is_empty(),
            Some((Token::AnyRun, rest)) => (0..=input.len()).any(|skip| Self::matches_from(rest, &input[skip..])),
            Some((Token::AnyOne, rest)) => !input.is_empty() && Self::matches_from(rest, &input[1..]),
            Some((Token::Literal(ch), rest)) => input.first() == Some(ch) && Self::matches_from(rest, &input[1..]),
        }
    }
}

impl std::fmt::Display for ChannelPattern {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.original)
    }
}
