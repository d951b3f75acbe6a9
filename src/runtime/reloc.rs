//! Patching one relocation once every address is final

use crate::elf::symtab::reloc_width;
use crate::elf::{
    R_X86_64_32, R_X86_64_32S, R_X86_64_64, R_X86_64_GOTPCREL, R_X86_64_GOTPCRELX, R_X86_64_NONE,
    R_X86_64_PC32, R_X86_64_PLT32, R_X86_64_REX_GOTPCRELX,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelocError {
    /// The value does not fit the field
    Overflow,
    Unsupported,
    /// GOT-relative relocation without a GOT slot
    MissingGot,
    /// The field extends past the end of its section
    OutOfBounds,
}

/// Whether `r_type` reads its target through a GOT entry.
pub fn uses_got(r_type: u32) -> bool {
    matches!(r_type, R_X86_64_GOTPCREL | R_X86_64_GOTPCRELX | R_X86_64_REX_GOTPCRELX)
}

fn pc_relative(target: u64, addend: i64, place: u64) -> Result<i32, RelocError> {
    let value = target.wrapping_add(addend as u64).wrapping_sub(place) as i64;
    i32::try_from(value).map_err(|_| RelocError::Overflow)
}

/// Apply relocation `r_type` at `field`, which lives at address `place`.
/// `target` is the symbol address (or its jump slot), `got` the address of
/// its GOT entry when it has one.
pub fn apply(
    field: &mut [u8],
    r_type: u32,
    place: u64,
    target: u64,
    addend: i64,
    got: Option<u64>,
) -> Result<(), RelocError> {
    let width = reloc_width(r_type).ok_or(RelocError::Unsupported)?;
    let field = field.get_mut(..width).ok_or(RelocError::OutOfBounds)?;
    match r_type {
        R_X86_64_NONE => {}
        R_X86_64_64 => {
            let value = target.wrapping_add(addend as u64);
            field[..8].copy_from_slice(&value.to_le_bytes());
        }
        R_X86_64_PC32 | R_X86_64_PLT32 => {
            let value = pc_relative(target, addend, place)?;
            field[..4].copy_from_slice(&value.to_le_bytes());
        }
        R_X86_64_GOTPCREL | R_X86_64_GOTPCRELX | R_X86_64_REX_GOTPCRELX => {
            let got = got.ok_or(RelocError::MissingGot)?;
            let value = pc_relative(got, addend, place)?;
            field[..4].copy_from_slice(&value.to_le_bytes());
        }
        R_X86_64_32 => {
            let value = target.wrapping_add(addend as u64);
            let value = u32::try_from(value).map_err(|_| RelocError::Overflow)?;
            field[..4].copy_from_slice(&value.to_le_bytes());
        }
        R_X86_64_32S => {
            let value = target.wrapping_add(addend as u64) as i64;
            let value = i32::try_from(value).map_err(|_| RelocError::Overflow)?;
            field[..4].copy_from_slice(&value.to_le_bytes());
        }
        _ => return Err(RelocError::Unsupported),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pc_relative_call() {
        let mut code = [0u8; 4];
        // call at 0x1000, displacement field at 0x1001, target 0x2000
        apply(&mut code, R_X86_64_PLT32, 0x1001, 0x2000, -4, None).unwrap();
        assert_eq!(i32::from_le_bytes(code), 0x2000 - 0x1005);
    }

    #[test]
    fn test_absolute_and_got() {
        let mut data = [0u8; 8];
        apply(&mut data, R_X86_64_64, 0, 0x7fff_0000_1000, 8, None).unwrap();
        assert_eq!(u64::from_le_bytes(data), 0x7fff_0000_1008);

        let mut field = [0u8; 4];
        apply(&mut field, R_X86_64_GOTPCREL, 0x100, 0xdead, -4, Some(0x200)).unwrap();
        assert_eq!(i32::from_le_bytes(field), 0x200 - 4 - 0x100);
        assert_eq!(
            apply(&mut field, R_X86_64_GOTPCREL, 0x100, 0xdead, -4, None),
            Err(RelocError::MissingGot)
        );
    }

    #[test]
    fn test_overflow_is_reported() {
        let mut field = [0u8; 4];
        let far = 0x7fff_0000_0000;
        assert_eq!(
            apply(&mut field, R_X86_64_PC32, 0x1000, far, -4, None),
            Err(RelocError::Overflow)
        );
        assert_eq!(
            apply(&mut field, R_X86_64_32, 0, far, 0, None),
            Err(RelocError::Overflow)
        );
        assert_eq!(apply(&mut field, 9999, 0, 0, 0, None), Err(RelocError::Unsupported));
    }

    #[test]
    fn test_short_field_is_reported() {
        let mut field = [0u8; 6];
        assert_eq!(
            apply(&mut field, R_X86_64_64, 0, 1, 0, None),
            Err(RelocError::OutOfBounds)
        );
        assert_eq!(field, [0; 6]);
        apply(&mut field[2..], R_X86_64_32, 0, 0x1234, 0, None).unwrap();
        assert_eq!(&field[2..], &0x1234u32.to_le_bytes());
    }
}
