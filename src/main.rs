//! Concatenates per-sample blend stamps and segmentation masks into stacked NPY arrays
//!
//! # Installation
//!
//! ```sh
//! cargo install blendstack
//! ```
//!
//! # Command-line Interface
//!
//! ```text
//! Concatenates per-sample blend stamps and segmentation masks into stacked NPY arrays
//!
//! Concatenates the individual blended stamps `blend_{index:06}.npy` and masks
//! `blend_seg_{index:06}.npy` from IMAGE_DIR into two files `images.npy` and
//! `labels.npy`. Outputs that already exist are kept as they are unless --force
//! is given.
//!
//! Usage: blendstack [OPTIONS] <IMAGE_DIR> <METHOD>
//!
//! Arguments:
//!   <IMAGE_DIR>
//!           Directory of per-sample stamps and masks
//!
//!   <METHOD>
//!           Derives labels from masks.
//!
//!           `images.npy` (32-bit float) contains the stacked channel sums of the
//!           stamps. `labels.npy` (8-bit unsigned integer) contains the labels
//!           derived from the masks with the given method, except for
//!           individual_galaxy_images where it contains the stacked stamps
//!           (32-bit float) with one channel per galaxy instead.
//!
//!           Possible values:
//!           - identity:                    Masks cast to bytes as they are
//!           - background_overlap_galaxies: One-hot background, overlap, and
//!             galaxies channels
//!           - overlap_galaxies:            One-hot overlap and galaxies channels
//!           - individual_galaxy_images:    Unsummed stamps as labels, one channel
//!             per galaxy
//!
//! Options:
//!   -d, --delete
//!           Deletes individual stamps and masks once finished
//!
//!   -f, --force
//!           Writes existing output files anew
//!
//!   -v, --verbose...
//!           Prints status information.
//!
//!           The more occurrences, the more verbose, with two at most.
//!
//!   -h, --help
//!           Print help (see a summary with '-h')
//!
//!   -V, --version
//!           Print version
//! ```

#![forbid(unsafe_code)]
#![forbid(missing_docs)]

mod concat;
mod layout;
mod sample;
mod segmap;

use anyhow::{Context, Result, bail, ensure};
use clap::{ArgAction, Parser};
use layout::Layout;
use log::{LevelFilter, info, trace, warn};
use segmap::Method;
use std::fs;
use std::path::PathBuf;

/// Concatenates per-sample blend stamps and segmentation masks into stacked NPY arrays
///
/// Concatenates the individual blended stamps `blend_{index:06}.npy` and masks
/// `blend_seg_{index:06}.npy` from IMAGE_DIR into two files `images.npy` and `labels.npy`. Outputs
/// that already exist are kept as they are unless --force is given.
#[derive(Parser, Debug)]
#[command(version, arg_required_else_help = true)]
struct Blendstack {
	/// Directory of per-sample stamps and masks.
	#[arg(value_name = "IMAGE_DIR")]
	image_dir: PathBuf,
	/// Derives labels from masks.
	///
	/// `images.npy` (32-bit float) contains the stacked channel sums of the stamps. `labels.npy`
	/// (8-bit unsigned integer) contains the labels derived from the masks with the given method,
	/// except for individual_galaxy_images where it contains the stacked stamps (32-bit float)
	/// with one channel per galaxy instead.
	#[arg(value_name = "METHOD")]
	method: Method,
	/// Deletes individual stamps and masks once finished.
	#[arg(short, long)]
	delete: bool,
	/// Writes existing output files anew.
	#[arg(short, long)]
	force: bool,
	/// Prints status information.
	///
	/// The more occurrences, the more verbose, with two at most.
	#[arg(short, long, action = ArgAction::Count)]
	verbose: u8,
}

fn main() -> Result<()> {
	let args = Blendstack::parse();
	let level = match args.verbose {
		0 => LevelFilter::Info,
		1 => LevelFilter::Debug,
		_ => LevelFilter::Trace,
	};
	env_logger::Builder::from_default_env()
		.filter_level(level)
		.format_timestamp(None)
		.format_target(false)
		.init();
	run(&args)
}

fn run(args: &Blendstack) -> Result<()> {
	let Blendstack {
		image_dir,
		method,
		delete,
		force,
		verbose: _,
	} = args;
	ensure!(image_dir.is_dir(), "No such directory {:?}", image_dir);
	let layout = Layout::new(image_dir);
	if *force || !layout.images().exists() {
		// Labels of individual stamps are written together with the images.
		let stale = method.retains_channels() && layout.labels().exists();
		if stale && !*force {
			warn!("{:?}: exists without images, writing it anew", layout.labels());
		}
		concat::concatenate_images(&layout, method.retains_channels(), *force || stale)?;
		info!("Stamps concatenated");
	} else {
		info!("{:?}: exists, skipping stamps", layout.images());
	}
	if !method.retains_channels() {
		if *force || !layout.labels().exists() {
			concat::concatenate_segmentation(&layout, Some(*method), *force)?;
			info!("Segmentation maps concatenated");
		} else {
			info!("{:?}: exists, skipping masks", layout.labels());
		}
	}
	if *delete {
		let count = delete_samples(&layout)?;
		info!("Individual stamps deleted ({} file{})", count, if count > 1 { "s" } else { "" });
	}
	Ok(())
}

/// Removes every per-sample file once both outputs exist.
fn delete_samples(layout: &Layout) -> Result<usize> {
	for output in [layout.images(), layout.labels()] {
		if !output.exists() {
			bail!("Refusing to delete individual stamps without {:?}", output);
		}
	}
	let samples = layout.sample_files()?;
	for path in &samples {
		trace!("{:?}: deleting", path);
		fs::remove_file(path).with_context(|| format!("Cannot delete {:?}", path))?;
	}
	Ok(samples.len())
}
