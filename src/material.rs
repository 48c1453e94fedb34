//! Read-only material registry. Generalizes the teacher's
//! `materials.rs::get_material_properties()` match-arm table (hardcoded per
//! `MaterialType` enum variant) into a data table indexed by `material_id: u8`
//! and supplied by the caller at construction, since this core must support a
//! caller-chosen material set rather than a fixed enum of known materials.

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Behavior {
    Static,
    Powder,
    Liquid,
    Gas,
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
    pub struct MaterialFlags: u8 {
        const CONDUCTS_HEAT = 0b0000_0001;
        const FLAMMABLE     = 0b0000_0010;
        const CONDUCTIVE    = 0b0000_0100;
        const CORRODES      = 0b0000_1000;
        const PASSABLE      = 0b0001_0000;
        const DIGGABLE      = 0b0010_0000;
        const IS_BELT       = 0b0100_0000;
        const IS_PISTON      = 0b1000_0000;
    }
}

/// Phase-change thresholds and products. Unused by this core's cell kernel
/// (no combustion/temperature ruleset is specified) but carried through
/// verbatim so a host material-effects system layered on top has somewhere
/// to read them from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct PhaseThresholds {
    pub ignition_temp: u8,
    pub melt_temp: u8,
    pub freeze_temp: u8,
    pub boil_temp: u8,
    pub melt_product: u8,
    pub freeze_product: u8,
    pub boil_product: u8,
    pub ignition_product: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MaterialDef {
    pub density: u8,
    pub slide_resistance: u8,
    pub friction: u8,
    pub behavior: Behavior,
    pub flags: MaterialFlags,
    pub phases: PhaseThresholds,
}

impl MaterialDef {
    pub const fn air() -> Self {
        MaterialDef {
            density: 0,
            slide_resistance: 0,
            friction: 0,
            behavior: Behavior::Gas,
            flags: MaterialFlags::PASSABLE,
            phases: PhaseThresholds {
                ignition_temp: 0,
                melt_temp: 0,
                freeze_temp: 0,
                boil_temp: 0,
                melt_product: 0,
                freeze_product: 0,
                boil_product: 0,
                ignition_product: 0,
            },
        }
    }
}

/// Owns the `material_id -> MaterialDef` mapping. Built once at `new_world`
/// time, read-only thereafter (§5: "Material table is read-only").
#[derive(Debug, Clone)]
pub struct MaterialTable {
    defs: Vec<MaterialDef>,
}

impl MaterialTable {
    /// Build a table from caller-supplied definitions. Index 0 is always Air
    /// regardless of what `defs[0]` says; the grid's "material_id == 0 means
    /// empty" invariant depends on this.
    pub fn new(mut defs: Vec<MaterialDef>) -> Self {
        if defs.is_empty() {
            defs.push(MaterialDef::air());
        } else {
            defs[0] = MaterialDef::air();
        }
        MaterialTable { defs }
    }

    /// Material ids carrying the `IS_BELT` flag in [`MaterialTable::default_set`]:
    /// index 5 renders/behaves as a `+1`-direction belt surface, index 6 as
    /// `-1`. [`crate::World::new_world`] wires these into its `BeltRegistry`.
    pub const DEFAULT_BELT_MATERIAL_POS: u8 = 5;
    pub const DEFAULT_BELT_MATERIAL_NEG: u8 = 6;

    /// A small baseline set covering Air/Sand/Water/Stone/Smoke plus a pair
    /// of directional belt surface materials, useful for tests and as a
    /// starting point for a host's own table.
    pub fn default_set() -> Self {
        let sand = MaterialDef {
            density: 150,
            slide_resistance: 40,
            friction: 0,
            behavior: Behavior::Powder,
            flags: MaterialFlags::empty(),
            phases: PhaseThresholds::default(),
        };
        let water = MaterialDef {
            density: 100,
            slide_resistance: 0,
            friction: 4,
            behavior: Behavior::Liquid,
            flags: MaterialFlags::empty(),
            phases: PhaseThresholds::default(),
        };
        let stone = MaterialDef {
            density: 255,
            slide_resistance: 255,
            friction: 0,
            behavior: Behavior::Static,
            flags: MaterialFlags::DIGGABLE,
            phases: PhaseThresholds::default(),
        };
        let smoke = MaterialDef {
            density: 5,
            slide_resistance: 0,
            friction: 0,
            behavior: Behavior::Gas,
            flags: MaterialFlags::PASSABLE,
            phases: PhaseThresholds::default(),
        };
        let belt_pos = MaterialDef {
            density: 255,
            slide_resistance: 255,
            friction: 0,
            behavior: Behavior::Static,
            flags: MaterialFlags::IS_BELT,
            phases: PhaseThresholds::default(),
        };
        let belt_neg = MaterialDef {
            density: 255,
            slide_resistance: 255,
            friction: 0,
            behavior: Behavior::Static,
            flags: MaterialFlags::IS_BELT,
            phases: PhaseThresholds::default(),
        };
        MaterialTable::new(vec![MaterialDef::air(), sand, water, stone, smoke, belt_pos, belt_neg])
    }

    pub fn get(&self, material_id: u8) -> MaterialDef {
        self.defs
            .get(material_id as usize)
            .copied()
            .unwrap_or_else(MaterialDef::air)
    }

    pub fn len(&self) -> usize {
        self.defs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.defs.is_empty()
    }

    pub fn is_belt(&self, material_id: u8) -> bool {
        self.get(material_id).flags.contains(MaterialFlags::IS_BELT)
    }

    pub fn is_piston(&self, material_id: u8) -> bool {
        self.get(material_id).flags.contains(MaterialFlags::IS_PISTON)
    }

    pub fn is_diggable(&self, def: &MaterialDef) -> bool {
        def.flags.contains(MaterialFlags::DIGGABLE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn index_zero_is_always_air() {
        let table = MaterialTable::new(vec![MaterialDef {
            density: 99,
            ..MaterialDef::air()
        }]);
        assert_eq!(table.get(0).density, 0);
    }

    #[test]
    fn out_of_range_lookup_falls_back_to_air() {
        let table = MaterialTable::default_set();
        assert_eq!(table.get(200).density, 0);
    }

    #[test]
    fn default_set_classifies_behaviors() {
        let table = MaterialTable::default_set();
        assert_eq!(table.get(1).behavior, Behavior::Powder);
        assert_eq!(table.get(2).behavior, Behavior::Liquid);
        assert_eq!(table.get(3).behavior, Behavior::Static);
        assert_eq!(table.get(4).behavior, Behavior::Gas);
    }
}
