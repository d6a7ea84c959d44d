//! Traits and impls used to read/write signal values to/from the process image.

use core::fmt;
use serde::Deserialize;

/**
	trait for data types than can be packed/unpacked to/from a signal slot of the process image

	values are little endian on the bus, as any ethercat data
*/
pub trait PduData: Sized {
    /// data type tag a signal must carry to be accessed as this type
    const ID: DataType;

    fn pack(&self, dst: &mut [u8]) -> PackingResult<()>;
    fn unpack(src: &[u8]) -> PackingResult<Self>;
}

/** Enum to identify and raise adapted error raised by this package
*/
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum PackingError {
    BadSize(usize, &'static str),
    InvalidValue(&'static str),
}

pub type PackingResult<T> = Result<T, PackingError>;


/** dtype identifiers of signals, allowing to dynamically check the type of a value against the signal it is written to

	it covers the scalar types found in device descriptions, anything else is exposed as [Self::Raw] bytes
*/
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Deserialize)]
pub enum DataType {
	BOOL,
	I8, I16, I32, I64,
	U8, U16, U32, U64,
	F32, F64,
	/// bit field of arbitrary width, exchanged as little endian bytes
	RAW,
}
impl DataType {
	/// nominal bit width of the type, `None` for [Self::RAW] which accepts any width
	pub const fn bits(self) -> Option<u16> {
		match self {
			Self::BOOL => Some(1),
			Self::I8 | Self::U8 => Some(8),
			Self::I16 | Self::U16 => Some(16),
			Self::I32 | Self::U32 | Self::F32 => Some(32),
			Self::I64 | Self::U64 | Self::F64 => Some(64),
			Self::RAW => None,
		}
	}
	/// check a declared bit width is compatible with this type
	pub fn accepts(self, bits: u16) -> bool {
		bits != 0 && self.bits().map_or(true, |nominal| nominal == bits)
	}
}

/// number of bytes occupied in the process image by a signal of the given bit width
pub const fn storage_len(bits: u16) -> usize {
	(bits as usize + 7) / 8
}


impl PduData for bool {
	const ID: DataType = DataType::BOOL;

	fn pack(&self, dst: &mut [u8]) -> PackingResult<()>  {
        if dst.is_empty()
            {return Err(PackingError::BadSize(dst.len(), "no byte for a bool"))}
        dst[0] = if *self {0b1} else {0b0};
        Ok(())
	}
	fn unpack(src: &[u8]) -> PackingResult<Self>  {
        if src.is_empty()
            {return Err(PackingError::BadSize(src.len(), "no byte for a bool"))}
		Ok(src[0] & 0b1 == 0b1)
	}
}

impl<const N: usize> PduData for [u8; N] {
	const ID: DataType = DataType::RAW;

	fn pack(&self, dst: &mut [u8]) -> PackingResult<()> {
        if dst.len() != N
            {return Err(PackingError::BadSize(dst.len(), "raw array must match the signal size"))}
        dst.copy_from_slice(self);
        Ok(())
    }
	fn unpack(src: &[u8]) -> PackingResult<Self>  {
        src.try_into()
            .map_err(|_|  PackingError::BadSize(src.len(), "raw array must match the signal size"))
	}
}

/// macro implementing [PduData] for numeric types
macro_rules! num_pdudata {
	($t: ty, $id: ident) => { impl crate::data::PduData for $t {
			const ID: crate::data::DataType = crate::data::DataType::$id;

            fn pack(&self, dst: &mut [u8]) -> crate::data::PackingResult<()> {
				if dst.len() != core::mem::size_of::<$t>()
					{return Err(crate::data::PackingError::BadSize(dst.len(), "integer size mismatch"))}
				dst.copy_from_slice(&self.to_le_bytes());
				Ok(())
			}
			fn unpack(src: &[u8]) -> crate::data::PackingResult<Self> {
				Ok(Self::from_le_bytes(src
					.try_into()
					.map_err(|_|  crate::data::PackingError::BadSize(src.len(), "integer size mismatch"))?
					))
			}
		}};
}

num_pdudata!(u8, U8);
num_pdudata!(u16, U16);
num_pdudata!(u32, U32);
num_pdudata!(u64, U64);
num_pdudata!(i8, I8);
num_pdudata!(i16, I16);
num_pdudata!(i32, I32);
num_pdudata!(i64, I64);
num_pdudata!(f32, F32);
num_pdudata!(f64, F64);



/**
	dynamically typed signal value, as returned by path-based signal accesses

	Its variant must match the [DataType] of the signal it is written to.
*/
#[derive(Clone, Debug, PartialEq)]
pub enum Value {
	Bool(bool),
	I8(i8), I16(i16), I32(i32), I64(i64),
	U8(u8), U16(u16), U32(u32), U64(u64),
	F32(f32), F64(f64),
	Raw(Vec<u8>),
}
impl Value {
	pub fn data_type(&self) -> DataType {
		match self {
			Self::Bool(_) => DataType::BOOL,
			Self::I8(_) => DataType::I8,
			Self::I16(_) => DataType::I16,
			Self::I32(_) => DataType::I32,
			Self::I64(_) => DataType::I64,
			Self::U8(_) => DataType::U8,
			Self::U16(_) => DataType::U16,
			Self::U32(_) => DataType::U32,
			Self::U64(_) => DataType::U64,
			Self::F32(_) => DataType::F32,
			Self::F64(_) => DataType::F64,
			Self::Raw(_) => DataType::RAW,
		}
	}

	/// extract a value of the given type from a signal slot of `bits` width
	pub fn unpack(dtype: DataType, bits: u16, src: &[u8]) -> PackingResult<Self> {
		Ok(match dtype {
			DataType::BOOL => Self::Bool(bool::unpack(src)?),
			DataType::I8 => Self::I8(i8::unpack(src)?),
			DataType::I16 => Self::I16(i16::unpack(src)?),
			DataType::I32 => Self::I32(i32::unpack(src)?),
			DataType::I64 => Self::I64(i64::unpack(src)?),
			DataType::U8 => Self::U8(u8::unpack(src)?),
			DataType::U16 => Self::U16(u16::unpack(src)?),
			DataType::U32 => Self::U32(u32::unpack(src)?),
			DataType::U64 => Self::U64(u64::unpack(src)?),
			DataType::F32 => Self::F32(f32::unpack(src)?),
			DataType::F64 => Self::F64(f64::unpack(src)?),
			DataType::RAW => {
				if src.len() != storage_len(bits)
					{return Err(PackingError::BadSize(src.len(), "raw value must match the signal size"))}
				let mut raw = src.to_vec();
				mask_tail(&mut raw, bits);
				Self::Raw(raw)
			},
		})
	}

	/// dump the value in a signal slot of `bits` width
	pub fn pack(&self, bits: u16, dst: &mut [u8]) -> PackingResult<()> {
		match self {
			Self::Bool(v) => v.pack(dst),
			Self::I8(v) => v.pack(dst),
			Self::I16(v) => v.pack(dst),
			Self::I32(v) => v.pack(dst),
			Self::I64(v) => v.pack(dst),
			Self::U8(v) => v.pack(dst),
			Self::U16(v) => v.pack(dst),
			Self::U32(v) => v.pack(dst),
			Self::U64(v) => v.pack(dst),
			Self::F32(v) => v.pack(dst),
			Self::F64(v) => v.pack(dst),
			Self::Raw(v) => {
				if v.len() != dst.len() || dst.len() != storage_len(bits)
					{return Err(PackingError::BadSize(v.len(), "raw value must match the signal size"))}
				dst.copy_from_slice(v);
				mask_tail(dst, bits);
				Ok(())
			},
		}
	}
}
impl fmt::Display for Value {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			Self::Bool(v) => write!(f, "{}", v),
			Self::I8(v) => write!(f, "{}", v),
			Self::I16(v) => write!(f, "{}", v),
			Self::I32(v) => write!(f, "{}", v),
			Self::I64(v) => write!(f, "{}", v),
			Self::U8(v) => write!(f, "{}", v),
			Self::U16(v) => write!(f, "{}", v),
			Self::U32(v) => write!(f, "{}", v),
			Self::U64(v) => write!(f, "{}", v),
			Self::F32(v) => write!(f, "{}", v),
			Self::F64(v) => write!(f, "{}", v),
			Self::Raw(v) => {
				write!(f, "0x")?;
				for byte in v.iter().rev()  {write!(f, "{:02x}", byte)?;}
				Ok(())
			},
		}
	}
}

/// clear the bits of the last byte that are beyond the signal width
fn mask_tail(data: &mut [u8], bits: u16) {
	let used = bits % 8;
	if used != 0 {
		if let Some(last) = data.last_mut() {
			*last &= (1u8 << used) - 1;
		}
	}
}


#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn widths() {
		assert!(DataType::BOOL.accepts(1));
		assert!(! DataType::BOOL.accepts(8));
		assert!(DataType::I16.accepts(16));
		assert!(! DataType::I16.accepts(12));
		assert!(DataType::RAW.accepts(12));
		assert!(! DataType::RAW.accepts(0));
		assert_eq!(storage_len(1), 1);
		assert_eq!(storage_len(12), 2);
		assert_eq!(storage_len(32), 4);
	}

	#[test]
	fn little_endian() {
		let mut slot = [0u8; 2];
		(-2i16).pack(&mut slot).unwrap();
		assert_eq!(slot, [0xfe, 0xff]);
		assert_eq!(Value::unpack(DataType::U16, 16, &slot).unwrap(), Value::U16(0xfffe));
		assert!(0u32.pack(&mut slot).is_err());
	}

	#[test]
	fn raw_bits_are_masked() {
		let mut slot = [0u8; 2];
		Value::Raw(vec![0xff, 0xff]).pack(12, &mut slot).unwrap();
		assert_eq!(slot, [0xff, 0x0f]);
		assert_eq!(Value::unpack(DataType::RAW, 12, &[0xaa, 0xbb]).unwrap(), Value::Raw(vec![0xaa, 0x0b]));
		assert_eq!(Value::Raw(vec![0x0b, 0x0a]).to_string(), "0x0a0b");
	}
}
