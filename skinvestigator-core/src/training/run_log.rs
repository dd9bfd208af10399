//! Structured per-run logs.
//!
//! Layout of a run directory:
//!
//! ```text
//! <run_dir>/graph.json          layer graph, written when training starts
//! <run_dir>/scalars.jsonl       one JSON object per epoch
//! <run_dir>/images/epoch_N.png  grid of validation inputs
//! <run_dir>/history.json        full history, written when training ends
//! ```

use crate::error::MlError;
use crate::model::Model;
use crate::model::architecture::{ModelSpec, ModelSummary};
use crate::persistence::atomic_write_json;
use crate::training::callbacks::{EpochContext, EpochObserver, ObserverAction};
use crate::training::metrics::History;
use image::RgbImage;
use serde::Serialize;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

pub const GRAPH_FILE: &str = "graph.json";
pub const SCALARS_FILE: &str = "scalars.jsonl";
pub const HISTORY_FILE: &str = "history.json";
pub const IMAGES_DIR: &str = "images";

const GRID_COLUMNS: usize = 4;
const DEFAULT_MAX_IMAGES: usize = 16;

#[derive(Serialize)]
struct GraphRecord<'a> {
    spec: &'a ModelSpec,
    summary: ModelSummary,
    total_params: usize,
}

#[derive(Serialize)]
struct ScalarLine {
    epoch: usize,
    loss: f64,
    accuracy: f64,
    precision: f64,
    recall: f64,
    auc: f64,
    val_loss: f64,
    val_accuracy: f64,
    val_precision: f64,
    val_recall: f64,
    val_auc: f64,
    lr: f64,
    duration_secs: f64,
}

/// Writes the run directory of one training run.
pub struct RunLogger {
    dir: PathBuf,
    image_every: usize,
    max_images: usize,
    scalars: Option<BufWriter<File>>,
}

impl RunLogger {
    pub fn new(dir: PathBuf) -> Self {
        Self {
            dir,
            image_every: 10,
            max_images: DEFAULT_MAX_IMAGES,
            scalars: None,
        }
    }

    /// Log an image grid every `epochs` epochs; 0 disables images.
    pub fn with_image_every(mut self, epochs: usize) -> Self {
        self.image_every = epochs;
        self
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn write_images(&self, epoch: usize, images: &[RgbImage]) -> Result<(), MlError> {
        let Some(grid) = image_grid(images) else {
            return Ok(());
        };
        let dir = self.dir.join(IMAGES_DIR);
        std::fs::create_dir_all(&dir)?;
        grid.save(dir.join(format!("epoch_{epoch}.png")))?;
        Ok(())
    }
}

/// Tile `images` row-major, [`GRID_COLUMNS`] per row.
fn image_grid(images: &[RgbImage]) -> Option<RgbImage> {
    let first = images.first()?;
    let (w, h) = first.dimensions();
    let columns = images.len().min(GRID_COLUMNS) as u32;
    let rows = images.len().div_ceil(GRID_COLUMNS) as u32;
    let mut canvas = RgbImage::new(w * columns, h * rows);
    for (i, img) in images.iter().enumerate() {
        let x = (i % GRID_COLUMNS) as u32 * w;
        let y = (i / GRID_COLUMNS) as u32 * h;
        image::imageops::replace(&mut canvas, img, i64::from(x), i64::from(y));
    }
    Some(canvas)
}

impl EpochObserver for RunLogger {
    fn name(&self) -> &str {
        "run_logger"
    }

    fn on_train_begin(&mut self, model: &Model) -> Result<(), MlError> {
        std::fs::create_dir_all(&self.dir)?;
        let summary = model.spec().summary()?;
        let graph = GraphRecord {
            spec: model.spec(),
            total_params: summary.total_params(),
            summary,
        };
        atomic_write_json(&self.dir.join(GRAPH_FILE), &graph)?;

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.dir.join(SCALARS_FILE))?;
        self.scalars = Some(BufWriter::new(file));
        tracing::debug!(dir = %self.dir.display(), "Run logging started");
        Ok(())
    }

    fn on_epoch_end(&mut self, ctx: &EpochContext<'_>) -> Result<ObserverAction, MlError> {
        let r = ctx.record;
        if let Some(out) = self.scalars.as_mut() {
            let line = ScalarLine {
                epoch: r.epoch,
                loss: r.train.loss,
                accuracy: r.train.accuracy,
                precision: r.train.precision,
                recall: r.train.recall,
                auc: r.train.auc,
                val_loss: r.val.loss,
                val_accuracy: r.val.accuracy,
                val_precision: r.val.precision,
                val_recall: r.val.recall,
                val_auc: r.val.auc,
                lr: r.learning_rate,
                duration_secs: r.duration_secs,
            };
            serde_json::to_writer(&mut *out, &line)?;
            out.write_all(b"\n")?;
            out.flush()?;
        }

        if self.image_every > 0 && ctx.epoch % self.image_every == 0 {
            if let Some(batch) = ctx.sample {
                let images = batch.to_images(self.max_images)?;
                self.write_images(ctx.epoch, &images)?;
            }
        }
        Ok(ObserverAction::Continue)
    }

    fn on_train_end(&mut self, history: &History) -> Result<(), MlError> {
        if let Some(mut out) = self.scalars.take() {
            out.flush()?;
        }
        atomic_write_json(&self.dir.join(HISTORY_FILE), history)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_image_grid_layout() {
        let tiles: Vec<RgbImage> = (0..5)
            .map(|i| RgbImage::from_pixel(2, 3, image::Rgb([i * 40, 0, 0])))
            .collect();
        let grid = image_grid(&tiles).unwrap();
        assert_eq!(grid.dimensions(), (8, 6));
        assert_eq!(grid.get_pixel(0, 0).0, [0, 0, 0]);
        assert_eq!(grid.get_pixel(6, 0).0, [120, 0, 0]);
        assert_eq!(grid.get_pixel(0, 3).0, [160, 0, 0]);
        // Unused cells stay black.
        assert_eq!(grid.get_pixel(7, 5).0, [0, 0, 0]);
    }

    #[test]
    fn test_image_grid_empty() {
        assert!(image_grid(&[]).is_none());
    }

    #[test]
    fn test_single_row_grid() {
        let tiles = vec![RgbImage::new(3, 3); 2];
        assert_eq!(image_grid(&tiles).unwrap().dimensions(), (6, 3));
    }
}
