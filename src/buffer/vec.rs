use std::ops::{Deref, DerefMut};
use super::{Buffer};

/**
 * A growable [`Buffer`] backed by a `Vec<u8>`. Writing at the end of the
 * underlying storage extends it; writing in the middle overwrites, which is
 * how patches are applied.
 */
#[allow(clippy::module_name_repetitions)]
#[derive(Debug)]
pub struct VecU8 {
    buffer: Vec<u8>,
    pos: usize,
}

impl VecU8 {
    pub fn new() -> Self {
        VecU8 {buffer: Vec::new(), pos: 0}
    }

    /** The bytes written so far, ignoring the write pointer. */
    pub fn into_bytes(self) -> Vec<u8> {
        self.buffer
    }
}

impl Default for VecU8 {
    fn default() -> Self { VecU8::new() }
}

impl Deref for VecU8 {
    type Target = [u8];

    fn deref(&self) -> &Self::Target {
        &*self.buffer
    }
}

impl DerefMut for VecU8 {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.buffer
    }
}

impl Buffer for VecU8 {
    fn get_pos(&self) -> usize { self.pos }
    fn set_pos(&mut self, pos: usize) { self.pos = pos; }

    fn write_byte(&mut self, byte: u8) {
        if self.pos == self.buffer.len() {
            self.buffer.push(byte);
        } else {
            self.buffer[self.pos] = byte;
        }
        self.pos += 1;
    }
}

//-----------------------------------------------------------------------------

#[cfg(test)]
pub mod tests {
    use super::*;

    #[test]
    fn api() {
        super::super::tests::api(VecU8::new())
    }

    #[test]
    fn grows() {
        let mut buffer = VecU8::new();
        for b in 0..=255 {
            buffer.write_byte(b);
        }
        assert_eq!(buffer.len(), 256);
        assert_eq!(buffer.read_byte(255), 255);
    }
}
