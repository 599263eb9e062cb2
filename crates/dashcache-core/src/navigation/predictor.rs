use std::collections::{HashMap, HashSet, VecDeque};

use chrono::{DateTime, Utc};
use tracing::debug;

use crate::config::PreloadConfig;

/// Page id used for the root path.
const ROOT_PAGE: &str = "dashboard";

#[derive(Debug, Clone, PartialEq)]
pub struct NavigationEvent {
    pub path: String,
    pub page_id: String,
    pub timestamp: DateTime<Utc>,
}

/// Result of recording a hover.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HoverOutcome {
    pub count: u32,
    /// True only on the hover that crossed the threshold.
    pub promoted: bool,
    /// True once the page has crossed the threshold, now or earlier.
    pub is_priority: bool,
}

/// Map a route path to its page id: the first path segment, lowercased,
/// ignoring query strings and fragments.
/// `/Security-Events/42/show` -> `security-events`.
pub fn page_id_from_path(path: &str) -> String {
    let path = path.split(['?', '#']).next().unwrap_or_default();
    path.split('/')
        .find(|segment| !segment.is_empty())
        .unwrap_or(ROOT_PAGE)
        .to_ascii_lowercase()
}

/// Learns from navigation history and hover intent which pages are likely
/// to be visited next.
#[derive(Debug)]
pub struct NavigationPredictor {
    history: VecDeque<NavigationEvent>,
    capacity: usize,
    cleanup_retain: usize,
    max_predictions: usize,
    hover_threshold: u32,
    hover_counts: HashMap<String, u32>,
    /// Promoted pages in promotion order
    priority: Vec<String>,
    preloaded: HashSet<String>,
}

impl Default for NavigationPredictor {
    fn default() -> Self {
        Self::new(&PreloadConfig::default())
    }
}

impl NavigationPredictor {
    pub fn new(config: &PreloadConfig) -> Self {
        Self {
            history: VecDeque::with_capacity(config.history_capacity),
            capacity: config.history_capacity.max(1),
            cleanup_retain: config.cleanup_retain,
            max_predictions: config.max_predictions,
            hover_threshold: config.hover_threshold.max(1),
            hover_counts: HashMap::new(),
            priority: Vec::new(),
            preloaded: HashSet::new(),
        }
    }

    // ===== Navigation =====

    pub fn track_navigation(&mut self, path: &str, timestamp: DateTime<Utc>) -> &NavigationEvent {
        if self.history.len() == self.capacity {
            self.history.pop_front();
        }
        self.history.push_back(NavigationEvent {
            path: path.to_string(),
            page_id: page_id_from_path(path),
            timestamp,
        });
        // Just pushed, so the buffer is non-empty
        &self.history[self.history.len() - 1]
    }

    pub fn history(&self) -> impl Iterator<Item = &NavigationEvent> {
        self.history.iter()
    }

    pub fn history_len(&self) -> usize {
        self.history.len()
    }

    pub fn current_page(&self) -> Option<&str> {
        self.history.back().map(|e| e.page_id.as_str())
    }

    /// Consecutive page changes in the history window, oldest first.
    /// Repeated events on the same page are not transitions.
    fn transitions(&self) -> impl Iterator<Item = (usize, &str, &str)> {
        self.history
            .iter()
            .zip(self.history.iter().skip(1))
            .enumerate()
            .filter(|(_, (from, to))| from.page_id != to.page_id)
            .map(|(i, (from, to))| (i, from.page_id.as_str(), to.page_id.as_str()))
    }

    /// Transition counts keyed as `"from->to"`.
    pub fn navigation_patterns(&self) -> HashMap<String, u32> {
        let mut patterns = HashMap::new();
        for (_, from, to) in self.transitions() {
            *patterns.entry(format!("{}->{}", from, to)).or_insert(0) += 1;
        }
        patterns
    }

    /// Share of transitions out of `from` that went to `to`.
    pub fn transition_probability(&self, from: &str, to: &str) -> f64 {
        let (hits, total) = self
            .transitions()
            .filter(|(_, f, _)| *f == from)
            .fold((0u32, 0u32), |(hits, total), (_, _, t)| {
                (hits + u32::from(t == to), total + 1)
            });
        if total == 0 {
            0.0
        } else {
            f64::from(hits) / f64::from(total)
        }
    }

    /// Most likely next pages from `current`, by transition frequency with
    /// ties going to the most recently taken transition. Empty when the
    /// history has never left `current`.
    pub fn predict_next_pages(&self, current: &str) -> Vec<String> {
        // candidate -> (count, position of latest occurrence)
        let mut candidates: HashMap<&str, (u32, usize)> = HashMap::new();
        for (position, from, to) in self.transitions() {
            if from == current {
                let slot = candidates.entry(to).or_insert((0, position));
                slot.0 += 1;
                slot.1 = slot.1.max(position);
            }
        }

        let mut ranked: Vec<(&str, (u32, usize))> = candidates.into_iter().collect();
        ranked.sort_by(|(_, (count_a, last_a)), (_, (count_b, last_b))| {
            count_b.cmp(count_a).then(last_b.cmp(last_a))
        });
        ranked
            .into_iter()
            .take(self.max_predictions)
            .map(|(page, _)| page.to_string())
            .collect()
    }

    // ===== Hover intent =====

    pub fn track_hover(&mut self, page_id: &str) -> HoverOutcome {
        let count = self.hover_counts.entry(page_id.to_string()).or_insert(0);
        *count = count.saturating_add(1);
        let count = *count;

        let already = self.priority.iter().any(|p| p == page_id);
        let promoted = !already && count >= self.hover_threshold;
        if promoted {
            debug!(page = page_id, count, "Hover intent threshold reached");
            self.priority.push(page_id.to_string());
        }

        HoverOutcome {
            count,
            promoted,
            is_priority: already || promoted,
        }
    }

    pub fn hover_count(&self, page_id: &str) -> u32 {
        self.hover_counts.get(page_id).copied().unwrap_or(0)
    }

    pub fn is_priority(&self, page_id: &str) -> bool {
        self.priority.iter().any(|p| p == page_id)
    }

    /// Promoted pages that have not been preloaded yet, in promotion order.
    pub fn priority_candidates(&self) -> Vec<String> {
        self.priority
            .iter()
            .filter(|p| !self.preloaded.contains(*p))
            .cloned()
            .collect()
    }

    // ===== Preload bookkeeping =====

    /// Returns false if the page was already marked.
    pub fn mark_preloaded(&mut self, page_id: &str) -> bool {
        self.preloaded.insert(page_id.to_string())
    }

    pub fn is_preloaded(&self, page_id: &str) -> bool {
        self.preloaded.contains(page_id)
    }

    pub fn preloaded(&self) -> impl Iterator<Item = &str> {
        self.preloaded.iter().map(String::as_str)
    }

    // ===== Housekeeping =====

    /// Trim history to the most recent entries. Hover counts, promotions
    /// and preload records are kept.
    pub fn cleanup(&mut self) {
        let excess = self.history.len().saturating_sub(self.cleanup_retain);
        if excess > 0 {
            self.history.drain(..excess);
            debug!(dropped = excess, "Trimmed navigation history");
        }
    }

    /// Forget everything, including hover intent.
    pub fn reset(&mut self) {
        self.history.clear();
        self.hover_counts.clear();
        self.priority.clear();
        self.preloaded.clear();
    }
}
