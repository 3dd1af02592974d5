//! File naming of per-sample stamps, masks, and stacked outputs within one directory.

use anyhow::{Context, Result, ensure};
use glob::Pattern;
use std::fs;
use std::path::{Path, PathBuf};

/// Matches per-sample segmentation masks.
pub const SEGMENTATION_GLOB: &str = "blend_seg*npy";
/// Matches per-sample image stamps but not segmentation masks.
pub const IMAGE_GLOB: &str = "blend_[0-9]*.npy";
/// Matches every per-sample file, stamps and masks alike.
pub const SAMPLE_GLOB: &str = "blend_*.npy";

/// Stacked channel sums.
pub const IMAGES_FILE: &str = "images.npy";
/// Stacked labels.
pub const LABELS_FILE: &str = "labels.npy";

/// Directory of per-sample files and their stacked outputs.
#[derive(Debug, Clone)]
pub struct Layout {
	dir: PathBuf,
}

impl Layout {
	/// Lays out files within `dir`.
	pub fn new<P: Into<PathBuf>>(dir: P) -> Self {
		Self { dir: dir.into() }
	}
	/// Directory of this layout.
	pub fn dir(&self) -> &Path {
		&self.dir
	}
	/// Image stamp of sample `index`.
	pub fn image(&self, index: usize) -> PathBuf {
		self.dir.join(format!("blend_{index:06}.npy"))
	}
	/// Segmentation mask of sample `index`.
	pub fn segmentation(&self, index: usize) -> PathBuf {
		self.dir.join(format!("blend_seg_{index:06}.npy"))
	}
	/// Stacked channel sums.
	pub fn images(&self) -> PathBuf {
		self.dir.join(IMAGES_FILE)
	}
	/// Stacked labels.
	pub fn labels(&self) -> PathBuf {
		self.dir.join(LABELS_FILE)
	}
	/// Lists files whose name matches `pattern` in sorted order.
	pub fn matching(&self, pattern: &str) -> Result<Vec<PathBuf>> {
		let glob =
			Pattern::new(pattern).with_context(|| format!("Invalid glob pattern {:?}", pattern))?;
		let entries =
			fs::read_dir(&self.dir).with_context(|| format!("Cannot traverse {:?}", self.dir))?;
		let mut paths = Vec::new();
		for entry in entries {
			let entry = entry.with_context(|| format!("Cannot traverse {:?}", self.dir))?;
			let is_file = entry
				.file_type()
				.with_context(|| format!("Cannot get metadata of {:?}", entry.path()))?
				.is_file();
			let matches = entry
				.file_name()
				.to_str()
				.is_some_and(|name| glob.matches(name));
			if is_file && matches {
				paths.push(entry.path());
			}
		}
		paths.sort();
		Ok(paths)
	}
	/// Counts segmentation masks.
	pub fn segmentation_count(&self) -> Result<usize> {
		self.matching(SEGMENTATION_GLOB).map(|paths| paths.len())
	}
	/// Counts image stamps.
	pub fn image_count(&self) -> Result<usize> {
		self.matching(IMAGE_GLOB).map(|paths| paths.len())
	}
	/// Lists every per-sample file.
	pub fn sample_files(&self) -> Result<Vec<PathBuf>> {
		self.matching(SAMPLE_GLOB)
	}
	/// Number of samples as given by the segmentation masks.
	pub fn sample_count(&self) -> Result<usize> {
		let count = self.segmentation_count()?;
		ensure!(
			count > 0,
			"No segmentation masks matching {:?} in {:?}",
			SEGMENTATION_GLOB,
			self.dir
		);
		Ok(count)
	}
	/// Number of samples, requiring as many image stamps as segmentation masks.
	pub fn paired_sample_count(&self) -> Result<usize> {
		let count = self.sample_count()?;
		let images = self.image_count()?;
		ensure!(
			images == count,
			"Found {} image stamps but {} segmentation masks in {:?}",
			images,
			count,
			self.dir
		);
		Ok(count)
	}
}
