/*!
    The process image: the contiguous byte buffer exchanged with the devices every cycle.

    It is shared between the cyclic engine and the callers. Every access holds its lock only for a copy of a few bytes, so a multi-byte value is never observed half written, and the engine never waits long for a caller.
*/

use core::ops::Range;
use std::sync::{Mutex, MutexGuard};

use crate::{
    data::{PduData, PackingError, Value},
    error::AccessError,
    mapping::MappedSignal,
    };


/// process image buffer, sized by the mapping
#[derive(Debug)]
pub struct ProcessImage {
    data: Mutex<Box<[u8]>>,
    size: usize,
}
impl ProcessImage {
    /// zero initialized image
    pub fn new(size: usize) -> Self {
        Self {
            data: Mutex::new(vec![0; size].into_boxed_slice()),
            size,
        }
    }
    pub fn size(&self) -> usize  {self.size}

    fn lock(&self) -> MutexGuard<'_, Box<[u8]>> {
        // the buffer holds no invariant a panicking holder could break
        self.data.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// copy the whole image into an outgoing frame
    pub fn snapshot_into(&self, frame: &mut [u8]) {
        let data = self.lock();
        let len = frame.len().min(data.len());
        frame[.. len].copy_from_slice(&data[.. len]);
    }
    /// copy of the whole image
    pub fn snapshot(&self) -> Vec<u8> {
        self.lock().to_vec()
    }
    /**
        update the image with the given ranges of a received frame

        ranges must lie in both the frame and the image, this is ensured by the mapping validation and by the frame size check of the engine
    */
    pub fn refresh(&self, frame: &[u8], ranges: &[Range<usize>]) {
        let mut data = self.lock();
        for range in ranges {
            if range.end <= frame.len() && range.end <= data.len() {
                data[range.clone()].copy_from_slice(&frame[range.clone()]);
            }
        }
    }

    /// read the current value of a signal
    pub fn read(&self, signal: &MappedSignal) -> Result<Value, AccessError> {
        let data = self.lock();
        let slot = slot(&data, signal)?;
        Value::unpack(signal.data_type, signal.bits, slot)
            .map_err(|reason|  packing(signal, reason))
    }
    /// write a value to a signal, its type must match the signal's
    pub fn write(&self, signal: &MappedSignal, value: &Value) -> Result<(), AccessError> {
        if value.data_type() != signal.data_type
            {return Err(mismatch(signal, value.data_type()))}
        let mut data = self.lock();
        let slot = slot_mut(&mut data, signal)?;
        value.pack(signal.bits, slot)
            .map_err(|reason|  packing(signal, reason))
    }
    /// typed read of a signal
    pub fn get<T: PduData>(&self, signal: &MappedSignal) -> Result<T, AccessError> {
        if T::ID != signal.data_type
            {return Err(mismatch(signal, T::ID))}
        let data = self.lock();
        T::unpack(slot(&data, signal)?)
            .map_err(|reason|  packing(signal, reason))
    }
    /// typed write of a signal
    pub fn set<T: PduData>(&self, signal: &MappedSignal, value: T) -> Result<(), AccessError> {
        if T::ID != signal.data_type
            {return Err(mismatch(signal, T::ID))}
        let mut data = self.lock();
        value.pack(slot_mut(&mut data, signal)?)
            .map_err(|reason|  packing(signal, reason))
    }
}

fn slot<'a>(data: &'a [u8], signal: &MappedSignal) -> Result<&'a [u8], AccessError> {
    data.get(signal.range())
        .ok_or_else(|| packing(signal, PackingError::BadSize(signal.offset + signal.len, "signal outside of the image")))
}
fn slot_mut<'a>(data: &'a mut [u8], signal: &MappedSignal) -> Result<&'a mut [u8], AccessError> {
    data.get_mut(signal.range())
        .ok_or_else(|| packing(signal, PackingError::BadSize(signal.offset + signal.len, "signal outside of the image")))
}
fn packing(signal: &MappedSignal, reason: PackingError) -> AccessError {
    AccessError::Packing {path: signal.path.clone(), reason}
}
fn mismatch(signal: &MappedSignal, requested: crate::data::DataType) -> AccessError {
    AccessError::TypeMismatch {
        path: signal.path.clone(),
        expected: signal.data_type,
        requested,
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        data::DataType,
        description::Direction,
        mapping::SignalPath,
        };

    fn signal(offset: usize, data_type: DataType, bits: u16, direction: Direction) -> MappedSignal {
        MappedSignal {
            path: SignalPath::new(1, "g", format!("s{}", offset)),
            data_type,
            bits,
            direction,
            offset,
            len: crate::data::storage_len(bits),
        }
    }

    #[test]
    fn write_then_read() {
        let image = ProcessImage::new(8);
        let speed = signal(0, DataType::I32, 32, Direction::Output);
        let flag = signal(4, DataType::BOOL, 1, Direction::Output);
        image.write(&speed, &Value::I32(-1200)).unwrap();
        image.set(&flag, true).unwrap();
        assert_eq!(image.read(&speed).unwrap(), Value::I32(-1200));
        assert_eq!(image.get::<bool>(&flag).unwrap(), true);
        assert_eq!(&image.snapshot()[.. 5], &[0x50, 0xfb, 0xff, 0xff, 0x01]);
    }

    #[test]
    fn type_is_checked() {
        let image = ProcessImage::new(2);
        let value = signal(0, DataType::U16, 16, Direction::Input);
        assert!(matches!(image.write(&value, &Value::I16(3)), Err(AccessError::TypeMismatch {..})));
        assert!(matches!(image.get::<i16>(&value), Err(AccessError::TypeMismatch {..})));
        let outside = signal(1, DataType::U16, 16, Direction::Input);
        assert!(matches!(image.read(&outside), Err(AccessError::Packing {..})));
    }

    #[test]
    fn refresh_only_touches_ranges() {
        let image = ProcessImage::new(6);
        image.set(&signal(0, DataType::U16, 16, Direction::Output), 0x1234u16).unwrap();
        image.refresh(&[9, 9, 9, 9, 9, 9], &[2 .. 4, 5 .. 6]);
        assert_eq!(image.snapshot(), vec![0x34, 0x12, 9, 9, 0, 9]);

        let mut frame = [0; 6];
        image.snapshot_into(&mut frame);
        assert_eq!(frame, [0x34, 0x12, 9, 9, 0, 9]);
    }
}
