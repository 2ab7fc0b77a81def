//! Bridges the tmux scraper into the snapshot collector's scraping seam.

use async_trait::async_trait;
use ns_budget::UsageScraper;
use ns_session::scraper::Scraper;
use tracing::debug;

/// Scrapes weekly percentages by driving the provider CLI in tmux. Gemini
/// exposes no status screen, so it never yields a percentage.
pub struct TmuxUsageScraper {
    scraper: Scraper,
}

impl Default for TmuxUsageScraper {
    fn default() -> Self {
        Self::new()
    }
}

impl TmuxUsageScraper {
    pub fn new() -> Self {
        Self {
            scraper: Scraper::new(),
        }
    }
}

#[async_trait]
impl UsageScraper for TmuxUsageScraper {
    async fn scrape_weekly_pct(&self, provider: &str) -> Option<f64> {
        let result = match provider {
            "claude" => self.scraper.scrape_claude_usage().await,
            "codex" => self.scraper.scrape_codex_usage().await,
            _ => return None,
        };
        match result {
            Ok(usage) => Some(usage.weekly_pct),
            Err(e) => {
                // Treated as "no scraped percentage this cycle" upstream.
                debug!(provider, error = %e, "usage scrape unavailable");
                None
            }
        }
    }
}
