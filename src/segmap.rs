//! Segmentation transforms deriving labels from per-galaxy masks.
//!
//! A mask has its galaxies along the last axis, one channel per galaxy, with non-zero values
//! marking the pixels a galaxy covers.

use anyhow::{Result, anyhow, ensure};
use clap::ValueEnum;
use ndarray::{ArrayD, ArrayViewD, Axis, stack};
use std::fmt;
use std::str::FromStr;

/// Transform mapping a mask to its labels.
pub type Transform = fn(ArrayViewD<'_, f64>) -> Result<ArrayD<u8>>;

/// Method deriving labels from masks.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
#[value(rename_all = "snake_case")]
pub enum Method {
	/// Masks cast to bytes as they are.
	#[default]
	Identity,
	/// One-hot background, overlap, and galaxies channels.
	BackgroundOverlapGalaxies,
	/// One-hot overlap and galaxies channels.
	OverlapGalaxies,
	/// Unsummed stamps as labels, one channel per galaxy.
	IndividualGalaxyImages,
}

impl Method {
	/// Name as accepted on the command line.
	pub fn name(self) -> &'static str {
		match self {
			Self::Identity => "identity",
			Self::BackgroundOverlapGalaxies => "background_overlap_galaxies",
			Self::OverlapGalaxies => "overlap_galaxies",
			Self::IndividualGalaxyImages => "individual_galaxy_images",
		}
	}
	/// Whether labels are the unsummed stamps instead of transformed masks.
	pub fn retains_channels(self) -> bool {
		self == Self::IndividualGalaxyImages
	}
	/// Transform applied to every mask.
	///
	/// For [`Self::IndividualGalaxyImages`], this is the binary mask of each galaxy.
	pub fn transform(self) -> Transform {
		match self {
			Self::Identity => identity,
			Self::BackgroundOverlapGalaxies => background_overlap_galaxies,
			Self::OverlapGalaxies => overlap_galaxies,
			Self::IndividualGalaxyImages => individual_galaxy_images,
		}
	}
}

impl fmt::Display for Method {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.name())
	}
}

impl FromStr for Method {
	type Err = anyhow::Error;

	fn from_str(name: &str) -> Result<Self> {
		<Self as ValueEnum>::from_str(name, false)
			.map_err(|_| anyhow!("Unknown segmentation method {:?}", name))
	}
}

fn channel_axis(mask: &ArrayViewD<'_, f64>) -> Result<Axis> {
	ensure!(mask.ndim() > 0, "Mask has no galaxy axis");
	Ok(Axis(mask.ndim() - 1))
}

/// Number of galaxies covering each pixel.
fn coverage(mask: &ArrayViewD<'_, f64>) -> Result<ArrayD<usize>> {
	let axis = channel_axis(mask)?;
	Ok(mask.map_axis(axis, |galaxies| {
		galaxies.iter().filter(|&&value| value != 0.0).count()
	}))
}

fn one_hot(coverage: &ArrayD<usize>, channels: &[fn(usize) -> bool]) -> Result<ArrayD<u8>> {
	let channels = channels
		.iter()
		.map(|channel| coverage.mapv(|count| u8::from(channel(count))))
		.collect::<Vec<_>>();
	let views = channels.iter().map(ArrayD::view).collect::<Vec<_>>();
	Ok(stack(Axis(coverage.ndim()), &views)?)
}

fn is_background(count: usize) -> bool {
	count == 0
}

fn is_overlap(count: usize) -> bool {
	count > 1
}

fn is_galaxy(count: usize) -> bool {
	count == 1
}

/// Casts every value to a byte, truncating toward zero and wrapping around like integers do.
pub fn identity(mask: ArrayViewD<'_, f64>) -> Result<ArrayD<u8>> {
	Ok(mask.mapv(|value| value as i64 as u8))
}

/// Splits pixels into background, overlap of galaxies, and single galaxies.
///
/// Appends a one-hot axis of length 3 in place of the galaxy axis.
pub fn background_overlap_galaxies(mask: ArrayViewD<'_, f64>) -> Result<ArrayD<u8>> {
	one_hot(&coverage(&mask)?, &[is_background, is_overlap, is_galaxy])
}

/// Splits galaxy pixels into overlap of galaxies and single galaxies.
///
/// Appends an axis of length 2 in place of the galaxy axis. Background is all zeros.
pub fn overlap_galaxies(mask: ArrayViewD<'_, f64>) -> Result<ArrayD<u8>> {
	one_hot(&coverage(&mask)?, &[is_overlap, is_galaxy])
}

/// Binary mask of each galaxy, keeping the galaxy axis.
pub fn individual_galaxy_images(mask: ArrayViewD<'_, f64>) -> Result<ArrayD<u8>> {
	channel_axis(&mask)?;
	Ok(mask.mapv(|value| u8::from(value != 0.0)))
}
