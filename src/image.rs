use anyhow::Context;
use base64::Engine as _;
use std::cell::RefCell;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::rc::Rc;
use uuid::Uuid;

/// Extensions a picker restricted to `image/*` would normally offer.
/// Only used for a warning; any file is accepted.
const IMAGE_EXTENSIONS: &[&str] = &[
    "jpg", "jpeg", "png", "webp", "gif", "bmp", "tif", "tiff", "heic", "heif",
];

/// Tracks preview URIs that are currently allocated.
///
/// Each [`PreviewHandle`] removes its URI on drop, so a preview lives exactly
/// as long as the selection that owns it. Single-threaded: the registry
/// lives on the same task as the pipeline that owns it.
#[derive(Debug, Clone, Default)]
pub struct PreviewRegistry {
    live: Rc<RefCell<HashSet<String>>>,
}

impl PreviewRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn acquire(&self, path: &Path) -> PreviewHandle {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "image".to_string());
        let uri = format!("blob:site-inspector/{}/{}", Uuid::new_v4(), name);
        self.live.borrow_mut().insert(uri.clone());
        tracing::debug!(%uri, "Preview allocated");
        PreviewHandle {
            uri,
            live: Rc::clone(&self.live),
        }
    }

    pub fn is_live(&self, uri: &str) -> bool {
        self.live.borrow().contains(uri)
    }

    pub fn live_count(&self) -> usize {
        self.live.borrow().len()
    }
}

#[derive(Debug)]
pub struct PreviewHandle {
    uri: String,
    live: Rc<RefCell<HashSet<String>>>,
}

impl PreviewHandle {
    pub fn uri(&self) -> &str {
        &self.uri
    }
}

impl Drop for PreviewHandle {
    fn drop(&mut self) {
        self.live.borrow_mut().remove(&self.uri);
        tracing::debug!(uri = %self.uri, "Preview released");
    }
}

/// The file the user picked. Content is read lazily at analyze time.
#[derive(Debug)]
pub struct SelectedImage {
    id: Uuid,
    path: PathBuf,
    preview: PreviewHandle,
}

impl SelectedImage {
    pub fn new(path: PathBuf, registry: &PreviewRegistry) -> Self {
        if !looks_like_image(&path) {
            tracing::warn!(
                path = %path.display(),
                "Selected file does not have an image extension, sending it anyway"
            );
        }
        let preview = registry.acquire(&path);
        Self {
            id: Uuid::new_v4(),
            path,
            preview,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn preview_uri(&self) -> &str {
        self.preview.uri()
    }
}

pub fn looks_like_image(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| IMAGE_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
        .unwrap_or(false)
}

/// Read the whole file and return it base64-encoded (standard alphabet, padded).
pub async fn read_base64(path: &Path) -> crate::Result<String> {
    let bytes = tokio::fs::read(path)
        .await
        .with_context(|| format!("Failed to read image {}", path.display()))?;
    Ok(base64::engine::general_purpose::STANDARD.encode(bytes))
}
