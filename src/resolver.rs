// Source resolution module
// Maps a file name to a concrete IndexedSource by extension.

use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::sync::Arc;

use tracing::debug;

use crate::formats::{IndexedSource, SourceError, StackFileSource};

/// Constructor for one kind of source
pub type SourceConstructor = fn(&Path) -> Result<Arc<dyn IndexedSource>, SourceError>;

/// Registry of source constructors keyed by lowercase file extension.
#[derive(Clone, Default)]
pub struct SourceResolver {
    constructors: HashMap<String, SourceConstructor>,
}

fn open_stack_file(path: &Path) -> Result<Arc<dyn IndexedSource>, SourceError> {
    Ok(Arc::new(StackFileSource::open(path)?))
}

impl SourceResolver {
    /// Empty registry; every name fails to resolve
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the built-in formats (`.stk`)
    pub fn with_defaults() -> Self {
        let mut resolver = Self::new();
        resolver.register("stk", open_stack_file);
        resolver
    }

    /// Register or replace the constructor for an extension (without the dot)
    pub fn register(&mut self, extension: &str, constructor: SourceConstructor) {
        self.constructors
            .insert(extension.trim_start_matches('.').to_ascii_lowercase(), constructor);
    }

    pub fn supports(&self, extension: &str) -> bool {
        self.constructors
            .contains_key(&extension.trim_start_matches('.').to_ascii_lowercase())
    }

    /// Open `path` with the constructor registered for its extension.
    /// Any failure is reported as `SourceError::Open`.
    pub fn resolve(&self, path: impl AsRef<Path>) -> Result<Arc<dyn IndexedSource>, SourceError> {
        let path = path.as_ref();
        let open_error = |reason: String| SourceError::Open {
            name: path.display().to_string(),
            reason,
        };

        let extension = path
            .extension()
            .and_then(|e| e.to_str())
            .map(str::to_ascii_lowercase)
            .ok_or_else(|| open_error("no file extension".to_string()))?;
        let constructor = self
            .constructors
            .get(&extension)
            .ok_or_else(|| open_error(format!("no reader registered for '.{}'", extension)))?;

        debug!(path = %path.display(), extension = %extension, "Resolving source");
        match constructor(path) {
            Ok(source) => Ok(source),
            Err(e @ SourceError::Open { .. }) => Err(e),
            Err(e) => Err(open_error(e.to_string())),
        }
    }
}

impl fmt::Debug for SourceResolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut extensions: Vec<&String> = self.constructors.keys().collect();
        extensions.sort();
        f.debug_struct("SourceResolver")
            .field("extensions", &extensions)
            .finish()
    }
}
