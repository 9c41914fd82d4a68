//! Child-template resolution
//!
//! The evaluator delegates `include`/`render` lookup to a [TemplateLoader].
//! How the loader is satisfied (in-memory, file system, packaged resources)
//! is up to the host; the engine only resolves names to paths, loads source,
//! and caches the parsed result.

use crate::{
    ast::Template,
    error::{RenderError, TemplateParseError},
    parse::Parser,
};
use futures::future::{self, BoxFuture};
use std::{
    collections::HashMap,
    sync::{Arc, Mutex, PoisonError},
};

/// What kind of template a name refers to, for loaders that keep views and
/// partials in different locations
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum TemplateKind {
    View,
    Partial,
}

/// External collaborator that fetches template source by logical name.
/// Both operations may suspend (e.g. on file or network I/O).
pub trait TemplateLoader: Send + Sync {
    /// Resolve a logical name to a loadable path, or `None` if no location
    /// has it
    fn resolve<'a>(
        &'a self,
        name: &'a str,
        kind: TemplateKind,
    ) -> BoxFuture<'a, Result<Option<String>, RenderError>>;

    /// Load the source text at a resolved path
    fn load<'a>(
        &'a self,
        path: &'a str,
    ) -> BoxFuture<'a, Result<String, RenderError>>;
}

/// An in-memory loader: a map of path to source plus a list of location
/// format strings tried in order. The `{name}` placeholder is substituted;
/// the first location with a hit wins.
#[derive(Debug, Default)]
pub struct MemoryLoader {
    templates: HashMap<String, String>,
    locations: Vec<String>,
}

impl MemoryLoader {
    pub fn new() -> Self {
        Self {
            templates: HashMap::new(),
            // Try the bare name first, then with the conventional extension
            locations: vec!["{name}".into(), "{name}.liquid".into()],
        }
    }

    /// Add a template under the given path
    pub fn insert(
        &mut self,
        path: impl Into<String>,
        source: impl Into<String>,
    ) {
        self.templates.insert(path.into(), source.into());
    }

    /// Builder-style [insert](Self::insert)
    #[must_use]
    pub fn with_template(
        mut self,
        path: impl Into<String>,
        source: impl Into<String>,
    ) -> Self {
        self.insert(path, source);
        self
    }

    /// Replace the location format strings, e.g. `"views/{name}.liquid"`
    pub fn set_locations(
        &mut self,
        locations: impl IntoIterator<Item = String>,
    ) {
        self.locations = locations.into_iter().collect();
    }
}

impl TemplateLoader for MemoryLoader {
    fn resolve<'a>(
        &'a self,
        name: &'a str,
        _kind: TemplateKind,
    ) -> BoxFuture<'a, Result<Option<String>, RenderError>> {
        let path = self
            .locations
            .iter()
            .map(|location| location.replace("{name}", name))
            .find(|path| self.templates.contains_key(path));
        Box::pin(future::ready(Ok(path)))
    }

    fn load<'a>(
        &'a self,
        path: &'a str,
    ) -> BoxFuture<'a, Result<String, RenderError>> {
        let result = self.templates.get(path).cloned().ok_or_else(|| {
            RenderError::TemplateNotFound {
                name: path.to_owned(),
            }
        });
        Box::pin(future::ready(result))
    }
}

/// Cache of parsed child templates, keyed by resolved path. Shared across
/// every render using the same options, so each partial parses once.
#[derive(Debug, Default)]
pub(crate) struct TemplateCache {
    cache: Mutex<HashMap<String, Arc<Template>>>,
}

impl TemplateCache {
    pub(crate) fn get(&self, path: &str) -> Option<Arc<Template>> {
        self.lock().get(path).cloned()
    }

    pub(crate) fn parse_and_insert(
        &self,
        path: &str,
        source: &str,
        parser: &Parser,
    ) -> Result<Arc<Template>, TemplateParseError> {
        let template = Arc::new(parser.parse(source)?);
        self.lock().insert(path.to_owned(), Arc::clone(&template));
        Ok(template)
    }

    fn lock(
        &self,
    ) -> std::sync::MutexGuard<'_, HashMap<String, Arc<Template>>> {
        self.cache.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_loader() {
        let mut loader = MemoryLoader::new();
        loader.insert("card.liquid", "Hello");

        // Bare name misses, extension location hits
        let path = loader
            .resolve("card", TemplateKind::Partial)
            .await
            .unwrap()
            .expect("card should resolve");
        assert_eq!(path, "card.liquid");
        assert_eq!(loader.load(&path).await.unwrap(), "Hello");

        assert!(
            loader
                .resolve("missing", TemplateKind::Partial)
                .await
                .unwrap()
                .is_none()
        );
    }

    #[tokio::test]
    async fn test_memory_loader_locations() {
        let mut loader = MemoryLoader::new();
        loader.set_locations(vec!["views/{name}.liquid".into()]);
        loader.insert("views/home.liquid", "home");
        let path = loader
            .resolve("home", TemplateKind::View)
            .await
            .unwrap()
            .expect("home should resolve");
        assert_eq!(path, "views/home.liquid");
    }
}
