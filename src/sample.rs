//! Reading per-sample arrays of any stored data-type and validating their shapes.

use anyhow::{Context, Result, anyhow, bail};
use ndarray::ArrayD;
use ndarray_npy::{ReadNpyError, ReadableElement, read_npy};
use std::fmt::Write;
use std::path::Path;

/// Element type of a per-sample NPY array.
pub trait Element: ReadableElement + Copy + 'static {
	/// Converts to single precision as NumPy's `astype(float32)` does.
	fn to_f32(self) -> f32;
	/// Widens to double precision.
	fn to_f64(self) -> f64;
	/// Converts to a byte as NumPy's `astype(uint8)` does, wrapping around for integers.
	fn to_u8(self) -> u8;
}

/// Element type whose channels can be summed.
pub trait Pixel: Element {
	/// Additive identity.
	const ZERO: Self;
	/// Adds with NumPy semantics, wrapping around for fixed-width integers.
	fn accumulate(self, other: Self) -> Self;
}

macro_rules! impl_float {
	($($ty:ty),*) => {$(
		impl Element for $ty {
			fn to_f32(self) -> f32 {
				self as f32
			}
			fn to_f64(self) -> f64 {
				self as f64
			}
			fn to_u8(self) -> u8 {
				self as u8
			}
		}
		impl Pixel for $ty {
			const ZERO: Self = 0.0;
			fn accumulate(self, other: Self) -> Self {
				self + other
			}
		}
	)*};
}

macro_rules! impl_integer {
	($($ty:ty),*) => {$(
		impl Element for $ty {
			fn to_f32(self) -> f32 {
				self as f32
			}
			fn to_f64(self) -> f64 {
				self as f64
			}
			fn to_u8(self) -> u8 {
				self as u8
			}
		}
		impl Pixel for $ty {
			const ZERO: Self = 0;
			fn accumulate(self, other: Self) -> Self {
				self.wrapping_add(other)
			}
		}
	)*};
}

impl_float!(f64, f32);
impl_integer!(i64, u64, i32, u32, i16, u16, i8, u8);

impl Element for bool {
	fn to_f32(self) -> f32 {
		u8::from(self).into()
	}
	fn to_f64(self) -> f64 {
		u8::from(self).into()
	}
	fn to_u8(self) -> u8 {
		u8::from(self)
	}
}

/// Reads an array of element type `A`.
///
/// Returns `None` if the array is stored with another data-type.
pub fn read_as<A: Element>(path: &Path) -> Result<Option<ArrayD<A>>> {
	match read_npy::<_, ArrayD<A>>(path) {
		Ok(array) => Ok(Some(array)),
		Err(ReadNpyError::WrongDescriptor(_)) => Ok(None),
		Err(err) => Err(err).with_context(|| format!("Cannot read {:?}", path)),
	}
}

/// Reads an array of element type `A`, failing if it is stored with another data-type.
pub fn read_exactly<A: Element>(path: &Path) -> Result<ArrayD<A>> {
	read_as::<A>(path)?.ok_or_else(|| {
		anyhow!(
			"Data-type of {:?} differs from {}",
			path,
			std::any::type_name::<A>()
		)
	})
}

fn read_widened<A: Element>(path: &Path) -> Result<Option<ArrayD<f64>>> {
	read_as::<A>(path).map(|array| array.map(|array| array.mapv(A::to_f64)))
}

fn read_bytes<A: Element>(path: &Path) -> Result<Option<ArrayD<u8>>> {
	read_as::<A>(path).map(|array| array.map(|array| array.mapv(A::to_u8)))
}

/// Mask readers for every supported data-type, in the order they are tried.
macro_rules! mask_readers {
	($read:ident) => {
		[
			$read::<f64>,
			$read::<f32>,
			$read::<i64>,
			$read::<u64>,
			$read::<i32>,
			$read::<u32>,
			$read::<i16>,
			$read::<u16>,
			$read::<i8>,
			$read::<u8>,
			$read::<bool>,
		]
	};
}

fn read_any<T>(path: &Path, readers: [fn(&Path) -> Result<Option<ArrayD<T>>>; 11]) -> Result<ArrayD<T>> {
	for read in readers {
		if let Some(mask) = read(path)? {
			return Ok(mask);
		}
	}
	Err(anyhow!("Unsupported data-type")).with_context(|| format!("Cannot read {:?}", path))
}

/// Reads a segmentation mask of any supported data-type widened to `f64`.
pub fn read_mask(path: &Path) -> Result<ArrayD<f64>> {
	read_any(path, mask_readers!(read_widened))
}

/// Reads a segmentation mask of any supported data-type cast to bytes.
///
/// Integers wrap around instead of passing through `f64`, so `-1` becomes `255`.
pub fn read_mask_bytes(path: &Path) -> Result<ArrayD<u8>> {
	read_any(path, mask_readers!(read_bytes))
}

/// Shape every sample of a stack must have, as given by sample 0.
///
/// Collects all offending samples instead of failing at the first one.
#[derive(Debug)]
pub struct Schema {
	kind: &'static str,
	expected: Vec<usize>,
	mismatches: Vec<(usize, Vec<usize>)>,
}

impl Schema {
	/// Expects every `kind` of sample to have the `expected` shape.
	pub fn new(kind: &'static str, expected: &[usize]) -> Self {
		Self {
			kind,
			expected: expected.to_vec(),
			mismatches: Vec::new(),
		}
	}
	/// Shape of the stack of `count` samples.
	pub fn stacked(&self, count: usize) -> Vec<usize> {
		let mut shape = Vec::with_capacity(self.expected.len() + 1);
		shape.push(count);
		shape.extend_from_slice(&self.expected);
		shape
	}
	/// Whether sample `index` of `shape` conforms, recording it otherwise.
	pub fn admits(&mut self, index: usize, shape: &[usize]) -> bool {
		if shape == self.expected.as_slice() {
			true
		} else {
			self.mismatches.push((index, shape.to_vec()));
			false
		}
	}
	/// Fails listing every recorded mismatch.
	pub fn finish(self) -> Result<()> {
		if self.mismatches.is_empty() {
			return Ok(());
		}
		let mut offenders = String::new();
		for (index, shape) in &self.mismatches {
			let separator = if offenders.is_empty() { "" } else { ", " };
			let _ = write!(offenders, "{}{} {} has {:?}", separator, self.kind, index, shape);
		}
		bail!(
			"Shape mismatch in {} {}s against {:?} of {} 0: {}",
			self.mismatches.len(),
			self.kind,
			self.expected,
			self.kind,
			offenders
		)
	}
}
