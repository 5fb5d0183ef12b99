use std::ops::{DerefMut};

mod mmap;
pub use mmap::{Mmap};

mod vec;
pub use vec::{VecU8};

/**
 * A byte sink with a movable write pointer. Code is normally generated by
 * appending at the write pointer; the pointer can also be saved, moved back
 * over already-written bytes to patch them, and restored.
 */
pub trait Buffer: DerefMut<Target=[u8]> {
    /** Get the write pointer. */
    fn get_pos(&self) -> usize;

    /** Set the write pointer. */
    fn set_pos(&mut self, pos: usize);

    /** Writes a single byte at the write pointer, incrementing it. */
    fn write_byte(&mut self, byte: u8) {
        let pos = self.get_pos();
        self[pos] = byte;
        self.set_pos(pos + 1);
    }

    /**
     * Writes up to 8 bytes at the write pointer, as if using
     * `write_byte()` repeatedly.
     */
    fn write(&mut self, mut bytes: u64, len: usize) {
        assert!(len <= 8);
        for _ in 0..len {
            self.write_byte(bytes as u8);
            bytes >>= 8;
        }
        assert_eq!(bytes, 0);
    }

    /** Writes a little-endian 32-bit word at the write pointer. */
    fn write_word(&mut self, word: i32) {
        self.write(u64::from(word as u32), 4);
    }

    /** Reads a single byte. */
    fn read_byte(&self, pos: usize) -> u8 {
        self[pos]
    }

    /** Reads up to 8 bytes, as if using `read_byte()` repeatedly. */
    fn read(&self, pos: usize, len: usize) -> u64 {
        assert!(len <= 8);
        let mut bytes: u64 = 0;
        for i in (0..len).rev() {
            bytes <<= 8;
            bytes |= u64::from(self[pos + i]);
        }
        bytes
    }

    /** Reads a little-endian 32-bit word. */
    fn read_word(&self, pos: usize) -> i32 {
        self.read(pos, 4) as u32 as i32
    }
}

//-----------------------------------------------------------------------------

#[cfg(test)]
pub mod tests {
    use super::*;

    /** Any tests of the [`Buffer`] API, for use by submodule tests. */
    pub fn api(mut buffer: impl Buffer) {
        buffer.write(0x04030201, 4);
        buffer.write_word(-2);
        assert_eq!(buffer.read(0, 4), 0x04030201);
        assert_eq!(buffer.read_word(4), -2);
        let save = buffer.get_pos();
        buffer.set_pos(0);
        buffer.write_byte(0xff);
        buffer.set_pos(save);
        assert_eq!(buffer.read_byte(0), 0xff);
        assert_eq!(buffer.get_pos(), 8);
    }
}
