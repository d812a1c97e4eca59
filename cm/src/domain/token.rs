//! Request token allocation

use std::collections::HashSet;

use tracing::debug;

/// Correlates a context request with its asynchronous responses
pub type RequestToken = u32;

/// Token value meaning "not tied to any request"
pub const NO_TOKEN: RequestToken = 0;

/// Hands out request tokens and tracks which are still in flight
///
/// Tokens increase strictly until the counter overflows. After that the
/// search restarts at 1 and moves forward past every token still live, so a
/// token is never handed out twice while in flight. Panics only when the
/// whole token space is in flight.
#[derive(Debug, Default)]
pub struct TokenAllocator {
    last: RequestToken,
    live: HashSet<RequestToken>,
}

impl TokenAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate the next free token and mark it live
    pub fn allocate(&mut self) -> RequestToken {
        let mut candidate = self.last;
        for _ in 0..RequestToken::MAX {
            candidate = match candidate.checked_add(1) {
                Some(next) => next,
                None => {
                    debug!(live = self.live.len(), "TokenAllocator::allocate: counter wrapped");
                    NO_TOKEN + 1
                }
            };
            if self.live.insert(candidate) {
                self.last = candidate;
                return candidate;
            }
        }
        panic!("request token space exhausted: every token is in flight");
    }

    /// Return a token to the pool once its request is finalized
    pub fn release(&mut self, token: RequestToken) -> bool {
        self.live.remove(&token)
    }

    pub fn is_live(&self, token: RequestToken) -> bool {
        self.live.contains(&token)
    }

    #[cfg(test)]
    pub(crate) fn with_state(last: RequestToken, live: impl IntoIterator<Item = RequestToken>) -> Self {
        Self {
            last,
            live: live.into_iter().collect(),
        }
    }
}
