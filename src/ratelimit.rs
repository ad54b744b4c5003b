//! Sliding-window rate limiting, one counter per (client, endpoint class).

use dashmap::DashMap;
use std::collections::VecDeque;
use std::time::{Duration, Instant};

use crate::error::{TemoaError, TemoaResult};

const WINDOW: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EndpointClass {
    Search,
    Reindex,
}

impl EndpointClass {
    fn name(&self) -> &'static str {
        match self {
            EndpointClass::Search => "search",
            EndpointClass::Reindex => "reindex",
        }
    }
}

pub struct RateLimiter {
    windows: DashMap<(String, EndpointClass), VecDeque<Instant>>,
    search_per_min: u32,
    reindex_per_min: u32,
}

impl RateLimiter {
    pub fn new(search_per_min: u32, reindex_per_min: u32) -> Self {
        Self {
            windows: DashMap::new(),
            search_per_min,
            reindex_per_min,
        }
    }

    /// Record one request and fail if the client exceeded its window.
    pub fn check(&self, client: &str, class: EndpointClass) -> TemoaResult<()> {
        let limit = match class {
            EndpointClass::Search => self.search_per_min,
            EndpointClass::Reindex => self.reindex_per_min,
        };
        let now = Instant::now();
        let mut window = self
            .windows
            .entry((client.to_string(), class))
            .or_default();

        while window.front().is_some_and(|t| now.duration_since(*t) > WINDOW) {
            window.pop_front();
        }
        if window.len() >= limit as usize {
            return Err(TemoaError::RateLimited(format!(
                "{} limit of {}/min exceeded",
                class.name(),
                limit
            )));
        }
        window.push_back(now);
        Ok(())
    }
}
