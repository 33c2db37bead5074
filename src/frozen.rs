#[inline(always)]
pub fn read_u32(data: &[u8], off: usize) -> Option<u32> {
    let b = data.get(off..off.checked_add(4)?)?;
    Some(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
}

#[inline(always)]
pub fn read_f32(data: &[u8], off: usize) -> Option<f32> {
    read_u32(data, off).map(f32::from_bits)
}

/// Sequential reader over a blob: fixed-width scalars and length-prefixed
/// sections that borrow from the underlying bytes.
pub struct FrozenReader<'a> {
    data: &'a [u8],
    off: usize,
}

impl<'a> FrozenReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        FrozenReader { data, off: 0 }
    }

    pub fn u32(&mut self) -> Option<u32> {
        let v = read_u32(self.data, self.off)?;
        self.off += 4;
        Some(v)
    }

    pub fn i32(&mut self) -> Option<i32> {
        self.u32().map(|v| v as i32)
    }

    pub fn f32(&mut self) -> Option<f32> {
        self.u32().map(f32::from_bits)
    }

    /// `u32` element count followed by `count * width` bytes.
    pub fn section(&mut self, width: usize) -> Option<&'a [u8]> {
        let count = self.u32()? as usize;
        self.bytes(count.checked_mul(width)?)
    }

    pub fn bytes(&mut self, len: usize) -> Option<&'a [u8]> {
        let end = self.off.checked_add(len)?;
        let out = self.data.get(self.off..end)?;
        self.off = end;
        Some(out)
    }
}

/// Append-only writer mirroring [`FrozenReader`].
#[derive(Default)]
pub struct FrozenWriter {
    blob: Vec<u8>,
}

impl FrozenWriter {
    pub fn new() -> Self {
        FrozenWriter::default()
    }

    pub fn u32(&mut self, v: u32) -> &mut Self {
        self.blob.extend_from_slice(&v.to_le_bytes());
        self
    }

    pub fn i32(&mut self, v: i32) -> &mut Self {
        self.blob.extend_from_slice(&v.to_le_bytes());
        self
    }

    pub fn f32(&mut self, v: f32) -> &mut Self {
        self.blob.extend_from_slice(&v.to_le_bytes());
        self
    }

    pub fn u32_section(&mut self, values: &[u32]) -> &mut Self {
        self.u32(values.len() as u32);
        for &v in values {
            self.u32(v);
        }
        self
    }

    pub fn f32_section(&mut self, values: &[f32]) -> &mut Self {
        self.u32(values.len() as u32);
        for &v in values {
            self.f32(v);
        }
        self
    }

    pub fn byte_section(&mut self, bytes: &[u8]) -> &mut Self {
        self.u32(bytes.len() as u32);
        self.blob.extend_from_slice(bytes);
        self
    }

    pub fn finish(self) -> Vec<u8> {
        self.blob
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reads_past_end_are_none() {
        let data = [1u8, 0, 0];
        assert_eq!(read_u32(&data, 0), None);
        assert_eq!(read_u32(&data, usize::MAX), None);
    }

    #[test]
    fn writer_and_reader_agree_on_layout() {
        let mut w = FrozenWriter::new();
        w.u32(7).i32(-1).f32(-2.5).u32_section(&[1, 2]).byte_section(b"ab\0");
        let blob = w.finish();

        let mut r = FrozenReader::new(&blob);
        assert_eq!(r.u32(), Some(7));
        assert_eq!(r.i32(), Some(-1));
        assert_eq!(r.f32(), Some(-2.5));
        let units = r.section(4).unwrap();
        assert_eq!(read_u32(units, 4), Some(2));
        assert_eq!(r.section(1), Some(&b"ab\0"[..]));
        assert_eq!(r.u32(), None);
    }

    #[test]
    fn oversized_section_count_is_rejected() {
        let mut w = FrozenWriter::new();
        w.u32(u32::MAX);
        let blob = w.finish();
        assert_eq!(FrozenReader::new(&blob).section(4), None);
    }
}
