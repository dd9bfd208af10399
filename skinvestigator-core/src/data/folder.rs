//! Directory-structured image corpora: `<root>/<class>/**/<image>`.

use crate::error::MlError;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

/// File extensions recognised as images (compared case-insensitively).
pub const IMAGE_EXTENSIONS: &[&str] = &[
    "png", "jpg", "jpeg", "bmp", "ppm", "pbm", "pgm", "tif", "tiff", "gif", "webp",
];

/// Number of classes binary labelling accepts.
pub const BINARY_CLASSES: usize = 2;

/// One labelled image on disk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sample {
    pub path: PathBuf,
    pub label: u32,
}

/// A scanned class-folder corpus.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageFolder {
    pub root: PathBuf,
    /// Class names, sorted; a class's label is its index here.
    pub classes: Vec<String>,
    pub samples: Vec<Sample>,
}

impl ImageFolder {
    /// Scan `root`, one sub-directory per class.
    ///
    /// Fails when the directory is missing, holds no valid images, or does
    /// not hold exactly two classes.
    pub fn scan(root: &Path) -> Result<Self, MlError> {
        if !root.exists() {
            return Err(MlError::dataset(format!(
                "directory not found: {}",
                root.display()
            )));
        }
        if !root.is_dir() {
            return Err(MlError::dataset(format!(
                "not a directory: {}",
                root.display()
            )));
        }

        let mut classes = Vec::new();
        for entry in std::fs::read_dir(root)? {
            let entry = entry?;
            if entry.file_type()?.is_dir() {
                classes.push(entry.file_name().to_string_lossy().into_owned());
            }
        }
        classes.sort();

        if classes.len() != BINARY_CLASSES {
            return Err(MlError::dataset(format!(
                "{} must contain exactly {BINARY_CLASSES} class directories, found {} ({})",
                root.display(),
                classes.len(),
                classes.join(", ")
            )));
        }

        let mut samples = Vec::new();
        for (label, class) in classes.iter().enumerate() {
            let class_dir = root.join(class);
            let mut paths: Vec<PathBuf> = WalkDir::new(&class_dir)
                .follow_links(false)
                .into_iter()
                .filter_map(|entry| match entry {
                    Ok(e) => Some(e),
                    Err(err) => {
                        tracing::warn!(error = %err, "Skipping unreadable entry");
                        None
                    }
                })
                .filter(|e| e.file_type().is_file() && has_image_extension(e.path()))
                .map(|e| e.into_path())
                .collect();
            paths.sort();
            samples.extend(paths.into_iter().map(|path| Sample {
                path,
                label: label as u32,
            }));
        }

        if samples.is_empty() {
            return Err(MlError::dataset(format!(
                "no valid images found under {}",
                root.display()
            )));
        }

        tracing::info!(
            root = %root.display(),
            images = samples.len(),
            classes = classes.len(),
            "Found images belonging to classes"
        );

        Ok(Self {
            root: root.to_path_buf(),
            classes,
            samples,
        })
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Per-class sample counts, in label order.
    pub fn class_counts(&self) -> Vec<usize> {
        let mut counts = vec![0; self.classes.len()];
        for sample in &self.samples {
            counts[sample.label as usize] += 1;
        }
        counts
    }
}

fn has_image_extension(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| {
            let lower = e.to_ascii_lowercase();
            IMAGE_EXTENSIONS.contains(&lower.as_str())
        })
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn touch(path: &Path) {
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, b"").unwrap();
    }

    #[test]
    fn test_scan_labels_classes_alphabetically() {
        let dir = TempDir::new().unwrap();
        touch(&dir.path().join("malignant/a.jpg"));
        touch(&dir.path().join("benign/b.PNG"));
        touch(&dir.path().join("benign/nested/c.jpeg"));
        touch(&dir.path().join("benign/notes.txt"));

        let folder = ImageFolder::scan(dir.path()).unwrap();
        assert_eq!(folder.classes, vec!["benign", "malignant"]);
        assert_eq!(folder.len(), 3);
        assert_eq!(folder.class_counts(), vec![2, 1]);
        assert!(
            folder
                .samples
                .iter()
                .all(|s| s.label == u32::from(s.path.to_string_lossy().contains("malignant")))
        );
    }

    #[test]
    fn test_scan_missing_directory() {
        let err = ImageFolder::scan(Path::new("/definitely/not/here")).unwrap_err();
        assert!(matches!(err, MlError::Dataset(_)));
    }

    #[test]
    fn test_scan_without_images() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join("benign")).unwrap();
        std::fs::create_dir_all(dir.path().join("malignant")).unwrap();
        touch(&dir.path().join("benign/readme.md"));

        let err = ImageFolder::scan(dir.path()).unwrap_err();
        assert!(err.to_string().contains("no valid images"));
    }

    #[test]
    fn test_scan_rejects_three_classes() {
        let dir = TempDir::new().unwrap();
        for class in ["a", "b", "c"] {
            touch(&dir.path().join(class).join("x.png"));
        }
        assert!(ImageFolder::scan(dir.path()).is_err());
    }
}
