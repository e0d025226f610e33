//! Numeric streaming with explicit byte order.
//!
//! Every multi-byte read/write takes a [`byteorder::ByteOrder`] parameter
//! (`BigEndian` for all on-disk framing in this crate). Reads panic on
//! underflow: callers are expected to check [`MemoryStream::size`] first,
//! and a short numeric read is a framing bug, not a recoverable condition.

use byteorder::ByteOrder;

use super::MemoryStream;

macro_rules! num_codec {
    ($read:ident, $peek:ident, $write:ident, $ty:ty, $n:expr,
     $get:ident, $put:ident) => {
        pub fn $read<B: ByteOrder>(&mut self) -> $ty {
            let mut buf = [0u8; $n];
            let cb = self.read(&mut buf);
            assert_eq!(cb, $n, "numeric read underflow");
            B::$get(&buf)
        }

        pub fn $peek<B: ByteOrder>(&self) -> $ty {
            let mut buf = [0u8; $n];
            let cb = self.peek(&mut buf);
            assert_eq!(cb, $n, "numeric peek underflow");
            B::$get(&buf)
        }

        pub fn $write<B: ByteOrder>(&mut self, v: $ty) -> usize {
            let mut buf = [0u8; $n];
            B::$put(&mut buf, v);
            self.write(&buf)
        }
    };
}

impl MemoryStream {
    pub fn read_u8(&mut self) -> u8 {
        let mut buf = [0u8; 1];
        let cb = self.read(&mut buf);
        assert_eq!(cb, 1, "numeric read underflow");
        buf[0]
    }

    pub fn peek_u8(&self) -> u8 {
        let mut buf = [0u8; 1];
        let cb = self.peek(&mut buf);
        assert_eq!(cb, 1, "numeric peek underflow");
        buf[0]
    }

    pub fn write_u8(&mut self, v: u8) -> usize {
        self.write(&[v])
    }

    num_codec!(read_i16, peek_i16, write_i16, i16, 2, read_i16, write_i16);
    num_codec!(read_u16, peek_u16, write_u16, u16, 2, read_u16, write_u16);
    num_codec!(read_i32, peek_i32, write_i32, i32, 4, read_i32, write_i32);
    num_codec!(read_u32, peek_u32, write_u32, u32, 4, read_u32, write_u32);
    num_codec!(read_i64, peek_i64, write_i64, i64, 8, read_i64, write_i64);
    num_codec!(read_u64, peek_u64, write_u64, u64, 8, read_u64, write_u64);
    num_codec!(read_f32, peek_f32, write_f32, f32, 4, read_f32, write_f32);
    num_codec!(read_f64, peek_f64, write_f64, f64, 8, read_f64, write_f64);

    /// 24-bit unsigned value in 3 octets.
    pub fn read_u24<B: ByteOrder>(&mut self) -> u32 {
        let mut buf = [0u8; 3];
        let cb = self.read(&mut buf);
        assert_eq!(cb, 3, "numeric read underflow");
        B::read_u24(&buf)
    }

    pub fn peek_u24<B: ByteOrder>(&self) -> u32 {
        let mut buf = [0u8; 3];
        let cb = self.peek(&mut buf);
        assert_eq!(cb, 3, "numeric peek underflow");
        B::read_u24(&buf)
    }

    pub fn write_u24<B: ByteOrder>(&mut self, v: u32) -> usize {
        debug_assert!(v <= 0x00FF_FFFF, "u24 overflow");
        let mut buf = [0u8; 3];
        B::write_u24(&mut buf, v);
        self.write(&buf)
    }
}
