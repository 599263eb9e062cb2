//! Navigation history and hover intent tracking.
//!
//! The `NavigationPredictor` keeps a bounded ring buffer of visited pages,
//! derives transition statistics from it on demand, and promotes pages that
//! are hovered repeatedly to priority preload candidates.

pub mod predictor;

pub use predictor::{page_id_from_path, HoverOutcome, NavigationEvent, NavigationPredictor};
