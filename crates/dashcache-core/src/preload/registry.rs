use std::borrow::Borrow;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use futures::future::{BoxFuture, FutureExt};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::OnceCell;

use crate::fetch::FetchCoordinator;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("Page id must not be empty")]
    EmptyPageId,

    #[error("Invalid page id {0:?}: use lowercase letters, digits, '-' and '_'")]
    InvalidPageId(String),

    #[error("Page {0} is already registered")]
    DuplicatePage(String),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PreloadError {
    #[error("Failed to load page {page}: {message}")]
    Load { page: String, message: String },

    #[error("No preloadable registered for page {0}")]
    UnknownPage(String),
}

impl PreloadError {
    pub fn load(page: &str, message: impl Into<String>) -> Self {
        PreloadError::Load {
            page: page.to_string(),
            message: message.into(),
        }
    }
}

/// Validated page identifier, e.g. `security-events`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PageId(String);

impl PageId {
    pub fn parse(id: &str) -> Result<Self, RegistryError> {
        if id.is_empty() {
            return Err(RegistryError::EmptyPageId);
        }
        let valid = id
            .bytes()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'-' || b == b'_');
        if !valid {
            return Err(RegistryError::InvalidPageId(id.to_string()));
        }
        Ok(Self(id.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for PageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl Borrow<str> for PageId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for PageId {
    type Error = RegistryError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<PageId> for String {
    fn from(id: PageId) -> Self {
        id.0
    }
}

/// When a page is preloaded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS))]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    /// Once per session, on the first idle period after startup.
    Immediate,
    /// Only on hover intent or predicted navigation.
    Lazy,
}

pub type ComponentLoader = Arc<dyn Fn() -> BoxFuture<'static, Result<(), PreloadError>> + Send + Sync>;

/// Warms the cache for a page, usually through [`FetchCoordinator::prefetch`].
pub type DataPrefetcher = Arc<dyn Fn(&FetchCoordinator) + Send + Sync>;

pub struct RegistryEntry {
    page_id: PageId,
    priority: Priority,
    loader: ComponentLoader,
    prefetcher: Option<DataPrefetcher>,
    loaded: OnceCell<()>,
}

impl RegistryEntry {
    pub fn page_id(&self) -> &PageId {
        &self.page_id
    }

    pub fn priority(&self) -> Priority {
        self.priority
    }

    pub fn has_prefetcher(&self) -> bool {
        self.prefetcher.is_some()
    }

    /// Run the component loader once. Later calls return immediately;
    /// concurrent calls wait on the first. A failed load can be retried.
    pub async fn load_component(&self) -> Result<(), PreloadError> {
        self.loaded
            .get_or_try_init(|| (self.loader)())
            .await
            .map(|_| ())
    }

    pub fn is_loaded(&self) -> bool {
        self.loaded.initialized()
    }

    pub fn prefetch_data(&self, coordinator: &FetchCoordinator) {
        if let Some(prefetcher) = &self.prefetcher {
            prefetcher(coordinator);
        }
    }
}

impl std::fmt::Debug for RegistryEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegistryEntry")
            .field("page_id", &self.page_id)
            .field("priority", &self.priority)
            .field("has_prefetcher", &self.prefetcher.is_some())
            .field("loaded", &self.is_loaded())
            .finish()
    }
}

/// Page id -> loaders. Built once at startup and immutable afterwards.
#[derive(Debug, Default)]
pub struct PreloadRegistry {
    entries: Vec<RegistryEntry>,
    index: HashMap<PageId, usize>,
}

impl PreloadRegistry {
    pub fn builder() -> PreloadRegistryBuilder {
        PreloadRegistryBuilder::default()
    }

    pub fn get(&self, page_id: &str) -> Option<&RegistryEntry> {
        self.index.get(page_id).map(|&i| &self.entries[i])
    }

    pub fn contains(&self, page_id: &str) -> bool {
        self.index.contains_key(page_id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn page_ids(&self) -> impl Iterator<Item = &PageId> {
        self.entries.iter().map(|e| &e.page_id)
    }

    /// Pages preloaded unconditionally once per session, in registration
    /// order (`bundleStrategy.immediate`).
    pub fn immediate_bundle(&self) -> Vec<&PageId> {
        self.entries
            .iter()
            .filter(|e| e.priority == Priority::Immediate)
            .map(|e| &e.page_id)
            .collect()
    }
}

#[derive(Default)]
pub struct PreloadRegistryBuilder {
    registry: PreloadRegistry,
}

impl PreloadRegistryBuilder {
    /// Register a page with only a component loader.
    pub fn register<F, Fut>(
        self,
        page_id: &str,
        priority: Priority,
        loader: F,
    ) -> Result<Self, RegistryError>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), PreloadError>> + Send + 'static,
    {
        self.insert(page_id, priority, erase_loader(loader), None)
    }

    /// Register a page with a component loader and a data prefetcher.
    pub fn register_with_prefetch<F, Fut, P>(
        self,
        page_id: &str,
        priority: Priority,
        loader: F,
        prefetcher: P,
    ) -> Result<Self, RegistryError>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), PreloadError>> + Send + 'static,
        P: Fn(&FetchCoordinator) + Send + Sync + 'static,
    {
        self.insert(page_id, priority, erase_loader(loader), Some(Arc::new(prefetcher)))
    }

    fn insert(
        mut self,
        page_id: &str,
        priority: Priority,
        loader: ComponentLoader,
        prefetcher: Option<DataPrefetcher>,
    ) -> Result<Self, RegistryError> {
        let page_id = PageId::parse(page_id)?;
        if self.registry.index.contains_key(&page_id) {
            return Err(RegistryError::DuplicatePage(page_id.to_string()));
        }
        self.registry
            .index
            .insert(page_id.clone(), self.registry.entries.len());
        self.registry.entries.push(RegistryEntry {
            page_id,
            priority,
            loader,
            prefetcher,
            loaded: OnceCell::new(),
        });
        Ok(self)
    }

    pub fn build(self) -> Arc<PreloadRegistry> {
        Arc::new(self.registry)
    }
}

fn erase_loader<F, Fut>(loader: F) -> ComponentLoader
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), PreloadError>> + Send + 'static,
{
    Arc::new(move || loader().boxed())
}
