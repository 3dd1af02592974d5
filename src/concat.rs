//! Stacks per-sample stamps and masks into `images.npy` and `labels.npy`.

use crate::layout::Layout;
use crate::sample::{Pixel, Schema, read_as, read_exactly, read_mask, read_mask_bytes};
use crate::segmap::Method;
use anyhow::{Context, Result, anyhow, ensure};
use log::{debug, info, trace};
use ndarray::{ArrayD, ArrayViewD, Axis};
use ndarray_npy::{WritableElement, WriteNpyExt};
use std::fs::OpenOptions;
use std::io::{BufWriter, Write};
use std::path::Path;

/// Channel sums of all stamps and optionally the unsummed stamps.
#[derive(Debug)]
pub struct ImageStacks {
	/// Channel sums of shape (N, H, W).
	pub images: ArrayD<f32>,
	/// Unsummed stamps of shape (N, H, W, C).
	pub channels: Option<ArrayD<f32>>,
}

/// Writes `images.npy` and, `with_labels`, also `labels.npy` of unsummed stamps.
///
/// Existing outputs are written anew if `force` is set, otherwise they are an error raised before
/// anything is written.
pub fn concatenate_images(layout: &Layout, with_labels: bool, force: bool) -> Result<()> {
	if !force {
		let labels = with_labels.then(|| layout.labels());
		for output in std::iter::once(layout.images()).chain(labels) {
			ensure!(!output.exists(), "Output file {:?} exists", output);
		}
	}
	let count = layout.paired_sample_count()?;
	info!("{:?}: loading {} stamp{}", layout.dir(), count, plural(count));
	let ImageStacks { images, channels } = try_stack_images(layout, count, with_labels)?;
	write_array(&layout.images(), &images, force)?;
	if let Some(channels) = channels {
		write_array(&layout.labels(), &channels, force)?;
	}
	Ok(())
}

/// Writes `labels.npy` of masks transformed by `method`, [`Method::Identity`] by default.
///
/// Identity casts masks from their stored data-type, so integers wrap around as in NumPy.
pub fn concatenate_segmentation(layout: &Layout, method: Option<Method>, force: bool) -> Result<()> {
	let method = method.unwrap_or_default();
	debug!("{:?}: deriving labels via {}", layout.dir(), method);
	if method == Method::Identity {
		concatenate_masks(layout, read_mask_bytes, force)
	} else {
		let transform = method.transform();
		concatenate_masks(layout, |path| read_mask(path).and_then(|mask| transform(mask.view())), force)
	}
}

/// Writes `labels.npy` of masks transformed by `transform`.
pub fn concatenate_segmentation_with<F>(layout: &Layout, transform: F, force: bool) -> Result<()>
where
	F: Fn(ArrayViewD<'_, f64>) -> Result<ArrayD<u8>>,
{
	concatenate_masks(layout, |path| read_mask(path).and_then(|mask| transform(mask.view())), force)
}

fn concatenate_masks<L>(layout: &Layout, load: L, force: bool) -> Result<()>
where
	L: Fn(&Path) -> Result<ArrayD<u8>>,
{
	let count = layout.sample_count()?;
	info!("{:?}: loading {} mask{}", layout.dir(), count, plural(count));
	let labels = stack_segmentation(layout, count, load)?;
	write_array(&layout.labels(), &labels, force)
}

/// Stacks the first `count` stamps, trying supported data-types in order.
pub fn try_stack_images(layout: &Layout, count: usize, retain: bool) -> Result<ImageStacks> {
	let stackers: [fn(&Layout, usize, bool) -> Result<Option<ImageStacks>>; 10] = [
		stack_images::<f64>,
		stack_images::<f32>,
		stack_images::<i64>,
		stack_images::<u64>,
		stack_images::<i32>,
		stack_images::<u32>,
		stack_images::<i16>,
		stack_images::<u16>,
		stack_images::<i8>,
		stack_images::<u8>,
	];
	for stack in stackers {
		if let Some(stacks) = stack(layout, count, retain)? {
			return Ok(stacks);
		}
	}
	Err(anyhow!("Unsupported data-type"))
		.with_context(|| format!("Cannot stack {:?}", layout.image(0)))
}

fn stack_images<A: Pixel>(layout: &Layout, count: usize, retain: bool) -> Result<Option<ImageStacks>> {
	let Some(first) = read_as::<A>(&layout.image(0))? else {
		return Ok(None);
	};
	ensure!(first.ndim() > 0, "Stamp {:?} has no channel axis", layout.image(0));
	let axis = Axis(first.ndim() - 1);
	let mut schema = Schema::new("stamp", first.shape());
	let mut summed_shape = schema.stacked(count);
	summed_shape.pop();
	let mut summed = ArrayD::from_elem(summed_shape, A::ZERO);
	let mut channels = retain.then(|| ArrayD::from_elem(schema.stacked(count), A::ZERO));
	let mut first = Some(first);
	for index in 0..count {
		debug!("Loading stamps: {}/{}", index + 1, count);
		let sample = match first.take() {
			Some(sample) => sample,
			None => {
				let path = layout.image(index);
				trace!("{:?}: reading", path);
				read_exactly::<A>(&path)
					.with_context(|| format!("Cannot load stamp {}", index))?
			}
		};
		if !schema.admits(index, sample.shape()) {
			continue;
		}
		let sum = sample.fold_axis(axis, A::ZERO, |&sum, &value| sum.accumulate(value));
		summed.index_axis_mut(Axis(0), index).assign(&sum);
		if let Some(channels) = &mut channels {
			channels.index_axis_mut(Axis(0), index).assign(&sample);
		}
	}
	schema.finish()?;
	Ok(Some(ImageStacks {
		images: summed.mapv_into_any(A::to_f32),
		channels: channels.map(|channels| channels.mapv_into_any(A::to_f32)),
	}))
}

/// Stacks the labels `load` derives from each of the first `count` masks.
pub fn stack_segmentation<L>(layout: &Layout, count: usize, load_labels: L) -> Result<ArrayD<u8>>
where
	L: Fn(&Path) -> Result<ArrayD<u8>>,
{
	let load = |index: usize| -> Result<ArrayD<u8>> {
		let path = layout.segmentation(index);
		trace!("{:?}: reading", path);
		load_labels(&path).with_context(|| format!("Cannot load mask {}", index))
	};
	let first = load(0)?;
	let mut schema = Schema::new("mask", first.shape());
	let mut labels = ArrayD::<u8>::zeros(schema.stacked(count));
	let mut first = Some(first);
	for index in 0..count {
		debug!("Loading masks: {}/{}", index + 1, count);
		let sample = match first.take() {
			Some(sample) => sample,
			None => load(index)?,
		};
		if schema.admits(index, sample.shape()) {
			labels.index_axis_mut(Axis(0), index).assign(&sample);
		}
	}
	schema.finish()?;
	Ok(labels)
}

fn write_array<A: WritableElement>(path: &Path, array: &ArrayD<A>, force: bool) -> Result<()> {
	info!("{:?}: writing array of shape {:?}", path, array.shape());
	let mut npy = OpenOptions::new()
		.create_new(!force)
		.create(true)
		.truncate(true)
		.write(true)
		.open(path)
		.map(BufWriter::new)
		.with_context(|| format!("Cannot create output file {:?}", path))?;
	array
		.write_npy(&mut npy)
		.map_err(anyhow::Error::from)
		.and_then(|()| npy.flush().map_err(From::from))
		.with_context(|| format!("Cannot write output file {:?}", path))
}

fn plural(count: usize) -> &'static str {
	if count > 1 { "s" } else { "" }
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::segmap;
	use ndarray::{Array3, array};
	use ndarray_npy::{read_npy, write_npy};
	use std::fs;

	fn stamp(index: usize, channels: usize) -> Array3<f32> {
		Array3::from_shape_fn((3, 4, channels), |(y, x, c)| {
			(index * 100 + y * 10 + x) as f32 * 0.25 + c as f32 * 1.5
		})
	}

	fn mask(index: usize) -> Array3<u8> {
		Array3::from_shape_fn((3, 4, 2), |(y, x, c)| ((index + y + x + c) % 3) as u8)
	}

	fn write_samples(layout: &Layout, count: usize) {
		for index in 0..count {
			write_npy(layout.image(index), &stamp(index, 3)).unwrap();
			write_npy(layout.segmentation(index), &mask(index)).unwrap();
		}
	}

	#[test]
	fn sums_channels_of_every_stamp() {
		let dir = tempfile::tempdir().unwrap();
		let layout = Layout::new(dir.path());
		write_samples(&layout, 4);
		concatenate_images(&layout, false, false).unwrap();
		let images: ArrayD<f32> = read_npy(layout.images()).unwrap();
		assert_eq!(images.shape(), &[4, 3, 4]);
		for index in 0..4 {
			let expected = stamp(index, 3).sum_axis(Axis(2));
			assert_eq!(images.index_axis(Axis(0), index), expected.into_dyn());
		}
		assert!(!layout.labels().exists());
	}

	#[test]
	fn retains_unsummed_stamps() {
		let dir = tempfile::tempdir().unwrap();
		let layout = Layout::new(dir.path());
		write_samples(&layout, 2);
		concatenate_images(&layout, true, false).unwrap();
		let labels: ArrayD<f32> = read_npy(layout.labels()).unwrap();
		assert_eq!(labels.shape(), &[2, 3, 4, 3]);
		assert_eq!(labels.index_axis(Axis(0), 1), stamp(1, 3).into_dyn());
	}

	#[test]
	fn casts_double_precision_stamps() {
		let dir = tempfile::tempdir().unwrap();
		let layout = Layout::new(dir.path());
		for index in 0..2 {
			write_npy(layout.image(index), &stamp(index, 2).mapv(f64::from)).unwrap();
			write_npy(layout.segmentation(index), &mask(index)).unwrap();
		}
		let stacks = try_stack_images(&layout, 2, false).unwrap();
		let expected = stamp(1, 2).mapv(f64::from).sum_axis(Axis(2)).mapv(|sum| sum as f32);
		assert_eq!(stacks.images.index_axis(Axis(0), 1), expected.into_dyn());
		assert!(stacks.channels.is_none());
	}

	#[test]
	fn sums_integer_stamps_wrapping_around() {
		let dir = tempfile::tempdir().unwrap();
		let layout = Layout::new(dir.path());
		write_npy(layout.image(0), &array![[[200u8, 100]]]).unwrap();
		let stacks = try_stack_images(&layout, 1, false).unwrap();
		assert_eq!(stacks.images, array![[[44.0f32]]].into_dyn());
	}

	#[test]
	fn reports_every_mismatching_stamp() {
		let dir = tempfile::tempdir().unwrap();
		let layout = Layout::new(dir.path());
		write_samples(&layout, 5);
		write_npy(layout.image(2), &stamp(2, 2)).unwrap();
		write_npy(layout.image(4), &Array3::<f32>::zeros((4, 4, 3))).unwrap();
		let err = concatenate_images(&layout, true, false).unwrap_err();
		let err = format!("{:#}", err);
		assert!(err.contains("Shape mismatch in 2 stamps against [3, 4, 3]"), "{}", err);
		assert!(err.contains("stamp 2 has [3, 4, 2]"), "{}", err);
		assert!(err.contains("stamp 4 has [4, 4, 3]"), "{}", err);
		assert!(!layout.images().exists());
		assert!(!layout.labels().exists());
	}

	#[test]
	fn rejects_stamps_of_another_data_type() {
		let dir = tempfile::tempdir().unwrap();
		let layout = Layout::new(dir.path());
		write_samples(&layout, 2);
		write_npy(layout.image(1), &stamp(1, 3).mapv(f64::from)).unwrap();
		let err = format!("{:#}", concatenate_images(&layout, false, false).unwrap_err());
		assert!(err.contains("Cannot load stamp 1"), "{}", err);
	}

	#[test]
	fn missing_first_stamp_is_an_error() {
		let dir = tempfile::tempdir().unwrap();
		let layout = Layout::new(dir.path());
		write_npy(layout.image(1), &stamp(1, 3)).unwrap();
		write_npy(layout.segmentation(0), &mask(0)).unwrap();
		let err = format!("{:#}", concatenate_images(&layout, false, false).unwrap_err());
		assert!(err.contains("blend_000000.npy"), "{}", err);
		assert!(!layout.images().exists());
	}

	#[test]
	fn refuses_to_overwrite_unless_forced() {
		let dir = tempfile::tempdir().unwrap();
		let layout = Layout::new(dir.path());
		write_samples(&layout, 1);
		concatenate_images(&layout, false, false).unwrap();
		let err = format!("{:#}", concatenate_images(&layout, false, false).unwrap_err());
		assert!(err.contains("images.npy\" exists"), "{}", err);
		write_npy(layout.image(0), &stamp(7, 3)).unwrap();
		concatenate_images(&layout, false, true).unwrap();
		let images: ArrayD<f32> = read_npy(layout.images()).unwrap();
		assert_eq!(images.index_axis(Axis(0), 0), stamp(7, 3).sum_axis(Axis(2)).into_dyn());
	}

	#[test]
	fn identity_casts_masks_to_bytes() {
		let dir = tempfile::tempdir().unwrap();
		let layout = Layout::new(dir.path());
		for index in 0..3 {
			write_npy(layout.segmentation(index), &mask(index).mapv(f32::from)).unwrap();
		}
		concatenate_segmentation(&layout, None, false).unwrap();
		let labels: ArrayD<u8> = read_npy(layout.labels()).unwrap();
		assert_eq!(labels.shape(), &[3, 3, 4, 2]);
		for index in 0..3 {
			assert_eq!(labels.index_axis(Axis(0), index), mask(index).into_dyn());
		}
	}

	#[test]
	fn identity_wraps_integer_masks_around() {
		let dir = tempfile::tempdir().unwrap();
		let layout = Layout::new(dir.path());
		write_npy(layout.segmentation(0), &array![[-1i16, 256, 300, 7]]).unwrap();
		write_npy(layout.segmentation(1), &array![[255i16, -256, 512, 1]]).unwrap();
		concatenate_segmentation(&layout, None, false).unwrap();
		let labels: ArrayD<u8> = read_npy(layout.labels()).unwrap();
		assert_eq!(labels, array![[[255u8, 0, 44, 7]], [[255, 0, 0, 1]]].into_dyn());
	}

	#[test]
	fn refuses_existing_labels_before_writing_images() {
		let dir = tempfile::tempdir().unwrap();
		let layout = Layout::new(dir.path());
		write_samples(&layout, 2);
		concatenate_segmentation(&layout, Some(Method::OverlapGalaxies), false).unwrap();
		let labels = fs::read(layout.labels()).unwrap();
		let err = concatenate_images(&layout, true, false).unwrap_err();
		assert!(err.to_string().contains("labels.npy"), "{}", err);
		assert!(!layout.images().exists());
		assert_eq!(fs::read(layout.labels()).unwrap(), labels);
	}

	#[test]
	fn applies_named_transform() {
		let dir = tempfile::tempdir().unwrap();
		let layout = Layout::new(dir.path());
		write_samples(&layout, 2);
		concatenate_segmentation(&layout, Some(Method::BackgroundOverlapGalaxies), false).unwrap();
		let labels: ArrayD<u8> = read_npy(layout.labels()).unwrap();
		assert_eq!(labels.shape(), &[2, 3, 4, 3]);
		let expected = segmap::background_overlap_galaxies(mask(1).mapv(f64::from).into_dyn().view()).unwrap();
		assert_eq!(labels.index_axis(Axis(0), 1), expected);
	}

	#[test]
	fn applies_any_callable() {
		let dir = tempfile::tempdir().unwrap();
		let layout = Layout::new(dir.path());
		write_samples(&layout, 2);
		concatenate_segmentation_with(
			&layout,
			|mask: ArrayViewD<'_, f64>| -> Result<ArrayD<u8>> {
				Ok(mask.map_axis(Axis(2), |galaxies| u8::from(galaxies.sum() > 0.0)))
			},
			false,
		)
		.unwrap();
		let labels: ArrayD<u8> = read_npy(layout.labels()).unwrap();
		assert_eq!(labels.shape(), &[2, 3, 4]);
	}

	#[test]
	fn reports_mismatching_transformed_masks() {
		let dir = tempfile::tempdir().unwrap();
		let layout = Layout::new(dir.path());
		write_samples(&layout, 3);
		write_npy(layout.segmentation(1), &Array3::<u8>::zeros((3, 5, 2))).unwrap();
		let err = concatenate_segmentation(&layout, Some(Method::OverlapGalaxies), false).unwrap_err();
		assert_eq!(
			err.to_string(),
			"Shape mismatch in 1 masks against [3, 4, 2] of mask 0: mask 1 has [3, 5, 2]"
		);
		assert!(!layout.labels().exists());
	}

	#[test]
	fn failing_transform_writes_nothing() {
		let dir = tempfile::tempdir().unwrap();
		let layout = Layout::new(dir.path());
		write_samples(&layout, 1);
		let err = concatenate_segmentation_with(
			&layout,
			|_: ArrayViewD<'_, f64>| -> Result<ArrayD<u8>> { Err(anyhow!("broken")) },
			false,
		)
		.unwrap_err();
		assert_eq!(format!("{:#}", err), "Cannot load mask 0: broken");
		assert!(!layout.labels().exists());
		assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 2);
	}
}
