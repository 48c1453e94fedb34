//! The packed per-cell record. Eight bytes, `#[repr(C)]`, no padding beyond
//! what the field order already implies.

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
    pub struct CellFlags: u8 {
        const ON_BELT = 0b0000_0001;
        const ON_LIFT = 0b0000_0010;
        const BURNING = 0b0000_0100;
        const WET     = 0b0000_1000;
        const SETTLED = 0b0001_0000;
    }
}

pub const AIR_MATERIAL_ID: u8 = 0;

/// One grid position. `material_id == 0` means empty (air); in that state
/// every other field except `temperature` must be zero.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cell {
    pub material_id: u8,
    pub flags: CellFlags,
    pub frame_updated: u16,
    pub velocity_x: i8,
    pub velocity_y: i8,
    pub velocity_frac_y: u8,
    pub temperature: u8,
    pub owner_id: u16,
}

impl Default for Cell {
    fn default() -> Self {
        Self::air()
    }
}

impl Cell {
    pub const fn air() -> Self {
        Cell {
            material_id: AIR_MATERIAL_ID,
            flags: CellFlags::empty(),
            frame_updated: 0,
            velocity_x: 0,
            velocity_y: 0,
            velocity_frac_y: 0,
            temperature: 0,
            owner_id: 0,
        }
    }

    pub fn is_air(&self) -> bool {
        self.material_id == AIR_MATERIAL_ID
    }

    /// Zero velocities, frac accumulator and ownership, write the new
    /// material. Used by `set_cell` and by kernel writes that replace a
    /// cell's contents outright rather than swapping it with a neighbor.
    pub fn overwrite(&mut self, material_id: u8) {
        self.material_id = material_id;
        self.velocity_x = 0;
        self.velocity_y = 0;
        self.velocity_frac_y = 0;
        self.owner_id = 0;
        if material_id == AIR_MATERIAL_ID {
            self.flags = CellFlags::empty();
            self.temperature = 0;
        }
    }

    pub fn zero_velocity(&mut self) {
        self.velocity_x = 0;
        self.velocity_y = 0;
        self.velocity_frac_y = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn air_cell_has_zeroed_fields() {
        let c = Cell::air();
        assert!(c.is_air());
        assert_eq!(c.owner_id, 0);
        assert_eq!(c.velocity_x, 0);
        assert_eq!(c.velocity_y, 0);
    }

    #[test]
    fn overwrite_clears_motion_and_ownership() {
        let mut c = Cell {
            velocity_x: 5,
            velocity_y: -3,
            velocity_frac_y: 200,
            owner_id: 7,
            ..Cell::air()
        };
        c.material_id = 2;
        c.overwrite(3);
        assert_eq!(c.material_id, 3);
        assert_eq!(c.velocity_x, 0);
        assert_eq!(c.owner_id, 0);
    }
}
