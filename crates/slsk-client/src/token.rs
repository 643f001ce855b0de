//! Correlation token generation.

use slsk_proto::Token;

/// Source of correlation tokens.
///
/// Tokens must be unpredictable and collision-resistant within a session;
/// they are the only thing correlating a search or a rendezvous with its
/// responses. The trait exists so tests can substitute a deterministic
/// sequence.
pub trait TokenSource: Send + Sync {
    fn next_token(&self) -> Token;
}

/// The default source: 4 random bytes per token.
#[derive(Debug, Default)]
pub struct RandomTokens;

impl TokenSource for RandomTokens {
    fn next_token(&self) -> Token {
        Token(rand::random())
    }
}
