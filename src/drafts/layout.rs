use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use crate::models::DraftCategory;

/// Resolves where approved content of a category lives in the project tree.
pub trait ContentLayout: Send + Sync {
    fn category_dir(&self, category: DraftCategory) -> PathBuf;
}

/// Conventional project layout.
///
/// Content lives under `<project>/ai` when that directory holds an `AGENTS.md` or a
/// `rules/` directory, otherwise directly under the project root.
#[derive(Debug, Clone)]
pub struct ProjectLayout {
    content_root: PathBuf,
}

impl ProjectLayout {
    pub fn detect(project: impl AsRef<Path>) -> Self {
        let project = project.as_ref();
        let ai = project.join("ai");
        let content_root = if ai.join("AGENTS.md").is_file() || ai.join("rules").is_dir() {
            ai
        } else {
            project.to_path_buf()
        };
        Self { content_root }
    }

    pub fn content_root(&self) -> &Path {
        &self.content_root
    }
}

impl ContentLayout for ProjectLayout {
    fn category_dir(&self, category: DraftCategory) -> PathBuf {
        self.content_root.join(category_dir_name(category))
    }
}

pub fn category_dir_name(category: DraftCategory) -> &'static str {
    match category {
        DraftCategory::Rule => "rules",
        DraftCategory::Knowledge => "knowledge",
        DraftCategory::Skill => "skills",
        DraftCategory::Workflow => "workflows",
    }
}

/// A file already present in the content tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexedFile {
    pub category: DraftCategory,
    pub path: PathBuf,
}

/// Listing of the content tree, built on first read and dropped by [`invalidate`].
///
/// [`invalidate`]: ContentIndex::invalidate
pub struct ContentIndex {
    layout: Arc<dyn ContentLayout>,
    cache: Mutex<Option<Arc<Vec<IndexedFile>>>>,
}

impl ContentIndex {
    pub fn new(layout: Arc<dyn ContentLayout>) -> Self {
        Self {
            layout,
            cache: Mutex::new(None),
        }
    }

    pub fn files(&self) -> Arc<Vec<IndexedFile>> {
        let mut cache = self.cache.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(files) = cache.as_ref() {
            return Arc::clone(files);
        }
        let files = Arc::new(self.build());
        *cache = Some(Arc::clone(&files));
        files
    }

    pub fn contains(&self, path: &Path) -> bool {
        self.files().iter().any(|f| f.path == path)
    }

    pub fn is_built(&self) -> bool {
        self.cache.lock().unwrap_or_else(|e| e.into_inner()).is_some()
    }

    pub fn invalidate(&self) {
        *self.cache.lock().unwrap_or_else(|e| e.into_inner()) = None;
    }

    fn build(&self) -> Vec<IndexedFile> {
        let mut files = Vec::new();
        for category in DraftCategory::ALL {
            let mut paths = Vec::new();
            collect_files(&self.layout.category_dir(category), &mut paths);
            files.extend(paths.into_iter().map(|path| IndexedFile { category, path }));
        }
        files.sort_by(|a, b| a.path.cmp(&b.path));
        tracing::debug!("Indexed {} content files", files.len());
        files
    }
}

fn collect_files(dir: &Path, out: &mut Vec<PathBuf>) {
    // Missing or unreadable directories simply contribute nothing.
    let Ok(entries) = std::fs::read_dir(dir) else {
        return;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            collect_files(&path, out);
        } else {
            out.push(path);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn detects_ai_content_root() {
        let dir = TempDir::new().unwrap();
        fs::create_dir_all(dir.path().join("ai/rules")).unwrap();

        let layout = ProjectLayout::detect(dir.path());
        assert_eq!(layout.content_root(), dir.path().join("ai"));
        assert_eq!(
            layout.category_dir(DraftCategory::Workflow),
            dir.path().join("ai/workflows")
        );
    }

    #[test]
    fn falls_back_to_project_root() {
        let dir = TempDir::new().unwrap();
        fs::create_dir_all(dir.path().join("ai")).unwrap();

        let layout = ProjectLayout::detect(dir.path());
        assert_eq!(layout.category_dir(DraftCategory::Rule), dir.path().join("rules"));
    }

    #[test]
    fn index_is_cached_until_invalidated() {
        let dir = TempDir::new().unwrap();
        fs::create_dir_all(dir.path().join("knowledge/db")).unwrap();
        fs::write(dir.path().join("knowledge/db/sqlite.md"), "# SQLite").unwrap();

        let index = ContentIndex::new(Arc::new(ProjectLayout::detect(dir.path())));
        assert!(!index.is_built());
        assert_eq!(index.files().len(), 1);
        assert_eq!(index.files()[0].category, DraftCategory::Knowledge);

        fs::create_dir_all(dir.path().join("skills")).unwrap();
        fs::write(dir.path().join("skills/review.md"), "# Review").unwrap();
        assert_eq!(index.files().len(), 1);

        index.invalidate();
        assert!(!index.is_built());
        assert!(index.contains(&dir.path().join("skills/review.md")));
    }
}
