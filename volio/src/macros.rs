// SPDX-License-Identifier: MIT

/// Implements little-endian read/write helpers for primitive types on VolIO.
#[macro_export]
macro_rules! volio_impl_primitive_rw {
    ($($ty:ident),+ $(,)?) => {
        $(
            paste::paste! {
                #[inline(always)]
                fn [<write_ $ty _at>](&mut self, offset: u64, value: $ty) -> VolIOResult {
                    let buf = value.to_le_bytes();
                    self.write_at(offset, &buf)
                }

                #[inline(always)]
                fn [<read_ $ty _at>](&mut self, offset: u64) -> VolIOResult<$ty> {
                    let mut buf = [0u8; core::mem::size_of::<$ty>()];
                    self.read_at(offset, &mut buf)?;
                    Ok(<$ty>::from_le_bytes(buf))
                }
            }
        )+
    };
}
