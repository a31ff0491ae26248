//! Helpers for the [`Tensor`] wire record: typed packing and unpacking of the
//! row-major byte payload. Round trips are bit-exact, including dtype name
//! and shape.

use std::fmt::Debug;

use crate::error::FabricError;
use crate::proto::Tensor;

/// A scalar type that can live inside a [`Tensor`].
pub trait Element: Copy + Default + PartialEq + Debug {
    /// Wire name of the dtype, e.g. `"f32"`.
    const DTYPE: &'static str;
    /// Byte width of one element.
    const WIDTH: usize;

    fn write_le(self, out: &mut Vec<u8>);
    fn read_le(bytes: &[u8]) -> Self;
}

macro_rules! element {
    ($ty:ty, $name:literal) => {
        impl Element for $ty {
            const DTYPE: &'static str = $name;
            const WIDTH: usize = std::mem::size_of::<$ty>();

            fn write_le(self, out: &mut Vec<u8>) {
                out.extend_from_slice(&self.to_le_bytes());
            }

            fn read_le(bytes: &[u8]) -> Self {
                let mut raw = [0u8; std::mem::size_of::<$ty>()];
                raw.copy_from_slice(bytes);
                <$ty>::from_le_bytes(raw)
            }
        }
    };
}

element!(u8, "u8");
element!(i32, "i32");
element!(i64, "i64");
element!(f32, "f32");
element!(f64, "f64");

impl Tensor {
    /// Packs `values` into a tensor with the given shape.
    pub fn from_values<T: Element>(shape: Vec<u32>, values: &[T]) -> Result<Tensor, FabricError> {
        let expected: usize = shape.iter().map(|&d| d as usize).product();
        if expected != values.len() {
            return Err(FabricError::protocol(format!(
                "shape {:?} holds {} elements but {} were supplied",
                shape,
                expected,
                values.len()
            )));
        }
        let mut data = Vec::with_capacity(values.len() * T::WIDTH);
        for value in values {
            value.write_le(&mut data);
        }
        Ok(Tensor {
            data,
            shape,
            dtype: T::DTYPE.to_string(),
        })
    }

    /// A rank-zero tensor holding one value.
    pub fn scalar<T: Element>(value: T) -> Tensor {
        let mut data = Vec::with_capacity(T::WIDTH);
        value.write_le(&mut data);
        Tensor {
            data,
            shape: Vec::new(),
            dtype: T::DTYPE.to_string(),
        }
    }

    /// Unpacks the payload, checking dtype name and byte length.
    pub fn to_values<T: Element>(&self) -> Result<Vec<T>, FabricError> {
        if self.dtype != T::DTYPE {
            return Err(FabricError::protocol(format!(
                "dtype mismatch: tensor holds {} but {} was requested",
                self.dtype,
                T::DTYPE
            )));
        }
        if self.data.len() % T::WIDTH != 0 {
            return Err(FabricError::protocol(format!(
                "payload of {} bytes is not a whole number of {} elements",
                self.data.len(),
                self.dtype
            )));
        }
        let count = self.data.len() / T::WIDTH;
        let expected: usize = self.shape.iter().map(|&d| d as usize).product();
        if count != expected {
            return Err(FabricError::protocol(format!(
                "shape {:?} holds {} elements but the payload holds {}",
                self.shape, expected, count
            )));
        }
        Ok(self
            .data
            .chunks_exact(T::WIDTH)
            .map(T::read_le)
            .collect())
    }

    /// The single value of a rank-zero or one-element tensor.
    pub fn to_scalar<T: Element>(&self) -> Result<T, FabricError> {
        let values = self.to_values::<T>()?;
        match values.as_slice() {
            [value] => Ok(*value),
            _ => Err(FabricError::protocol(format!(
                "expected a scalar, found shape {:?}",
                self.shape
            ))),
        }
    }

    /// Number of elements implied by the shape.
    pub fn element_count(&self) -> usize {
        self.shape.iter().map(|&d| d as usize).product()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::proto;

    #[test]
    fn f32_round_trip_is_bit_exact() {
        let values = vec![0.0f32, -1.5, f32::MIN_POSITIVE, f32::INFINITY, 3.25e-7];
        let tensor = Tensor::from_values(vec![5], &values).unwrap();
        assert_eq!(tensor.dtype, "f32");
        let wire: Tensor = proto::decode(&proto::encode(&tensor)).unwrap();
        let restored = wire.to_values::<f32>().unwrap();
        assert_eq!(values.len(), restored.len());
        for (a, b) in values.iter().zip(&restored) {
            assert_eq!(a.to_bits(), b.to_bits());
        }
    }

    #[test]
    fn multi_dimensional_shape_survives() {
        let values: Vec<i64> = (0..24).collect();
        let tensor = Tensor::from_values(vec![2, 3, 4], &values).unwrap();
        let wire: Tensor = proto::decode(&proto::encode(&tensor)).unwrap();
        assert_eq!(wire.shape, vec![2, 3, 4]);
        assert_eq!(wire.to_values::<i64>().unwrap(), values);
    }

    #[test]
    fn scalar_round_trip() {
        let tensor = Tensor::scalar(7i32);
        assert_eq!(tensor.to_scalar::<i32>().unwrap(), 7);
        assert_eq!(tensor.element_count(), 1);
    }

    #[test]
    fn dtype_mismatch_is_rejected() {
        let tensor = Tensor::scalar(1.0f64);
        assert!(tensor.to_values::<f32>().is_err());
    }

    #[test]
    fn shape_payload_disagreement_is_rejected() {
        let mut tensor = Tensor::from_values(vec![2], &[1.0f32, 2.0]).unwrap();
        tensor.shape = vec![3];
        assert!(tensor.to_values::<f32>().is_err());
        assert!(Tensor::from_values(vec![3], &[1.0f32]).is_err());
    }
}
