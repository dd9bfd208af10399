//! Synthetic corpora shared by the integration tests.

#![allow(dead_code)]

use image::{Rgb, RgbImage};
use skinvestigator_core::config::{ImageSize, SessionConfig};
use skinvestigator_core::model::{LayerConfig, ModelSpec};
use std::path::Path;

pub const SIDE: u32 = 8;
pub const CLASSES: [&str; 2] = ["benign", "malignant"];

/// Write `per_class` images per class under `root/<class>/`. Benign samples
/// are dark, malignant ones bright, so a tiny network can separate them.
pub fn write_corpus(root: &Path, per_class: usize) {
    for (label, class) in CLASSES.iter().enumerate() {
        let dir = root.join(class);
        std::fs::create_dir_all(&dir).unwrap();
        for i in 0..per_class {
            let base = if label == 0 { 40 } else { 200 };
            let img = RgbImage::from_fn(SIDE, SIDE, |x, y| {
                let v = base + ((x * 3 + y * 5 + i as u32 * 7) % 40) as u8;
                Rgb([v, v.saturating_sub(20), v / 2 + 10])
            });
            img.save(dir.join(format!("{class}_{i:03}.png"))).unwrap();
        }
    }
}

/// Session rooted in `root` with train/validation/test corpora written.
pub fn session_config(root: &Path) -> SessionConfig {
    write_corpus(&root.join("train"), 6);
    write_corpus(&root.join("validation"), 3);
    write_corpus(&root.join("test"), 4);
    SessionConfig {
        train_dir: root.join("train"),
        val_dir: root.join("validation"),
        test_dir: root.join("test"),
        log_dir: root.join("logs"),
        model_dir: root.join("models"),
        search_dir: root.join("hyperband_logs"),
        batch_size: 4,
        img_size: ImageSize::new(SIDE as usize, SIDE as usize),
        seed: Some(7),
        ..Default::default()
    }
}

/// A small network that trains in milliseconds.
pub fn tiny_spec() -> ModelSpec {
    let mut spec = ModelSpec::fixed(ImageSize::new(SIDE as usize, SIDE as usize));
    spec.layers = vec![
        LayerConfig::conv(4),
        LayerConfig::pool(),
        LayerConfig::dropout(0.1),
        LayerConfig::Flatten,
        LayerConfig::dense(8),
    ];
    spec
}
